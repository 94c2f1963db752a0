use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

bitflags! {
    /// Which operations a property supports
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Access: u8 {
        /// The property can be found in the published state of the device
        const STATE = 0b001;
        /// The property can be written with a set request
        const SET = 0b010;
        /// The property can be actively queried with a get request
        const GET = 0b100;

        const STATE_SET = Self::STATE.bits() | Self::SET.bits();
        const STATE_GET = Self::STATE.bits() | Self::GET.bits();
        const ALL = Self::STATE.bits() | Self::SET.bits() | Self::GET.bits();
    }
}

impl Serialize for Access {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.bits())
    }
}

impl<'de> Deserialize<'de> for Access {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bits = u8::deserialize(deserializer)?;
        Access::from_bits(bits)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid access bits {bits:#05b}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_format() {
        assert_eq!(serde_json::to_value(Access::STATE).unwrap(), serde_json::json!(1));
        assert_eq!(serde_json::to_value(Access::STATE_SET).unwrap(), serde_json::json!(3));
        assert_eq!(serde_json::to_value(Access::ALL).unwrap(), serde_json::json!(7));

        assert_eq!(serde_json::from_value::<Access>(serde_json::json!(5)).unwrap(), Access::STATE_GET);
        assert!(serde_json::from_value::<Access>(serde_json::json!(8)).is_err());
    }
}
