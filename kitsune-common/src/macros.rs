/// A closed vocabulary of named wire values, e.g. power-on behaviors or fan speeds
pub trait Lookup: Copy + Sized + 'static {
    const ALL: &'static [Self];

    fn value(self) -> u32;
    fn name(self) -> &'static str;

    fn from_value(value: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|v| v.value() == value)
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|v| v.name() == name)
    }

    fn names() -> Vec<&'static str> {
        Self::ALL.iter().map(|v| v.name()).collect()
    }
}

/// Declares a [`Lookup`] enum; variants serialize as their names
///
/// ```
/// kitsune_common::lookup! {
///     pub enum PowerOnBehavior {
///         Off = 0 => "off",
///         On = 1 => "on",
///         Previous = 255 => "previous",
///     }
/// }
/// ```
#[macro_export]
macro_rules! lookup {
    (
        $( #[ $meta:meta ] )*
        pub enum $ident:ident {
            $( $variant:ident = $value:literal => $name:literal ),* $(,)?
        }
    ) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash,
            $crate::_serde::Serialize, $crate::_serde::Deserialize,
        )]
        $( #[ $meta ] )*
        pub enum $ident {
            $(
                #[serde(rename = $name)]
                $variant,
            )*
        }

        impl $crate::Lookup for $ident {
            const ALL: &'static [Self] = &[ $( Self::$variant ),* ];

            fn value(self) -> u32 {
                match self {
                    $( Self::$variant => $value, )*
                }
            }

            fn name(self) -> &'static str {
                match self {
                    $( Self::$variant => $name, )*
                }
            }
        }
    };
}
