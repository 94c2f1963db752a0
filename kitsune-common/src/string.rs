use core::{fmt::Display, ops::Deref};

use compact_str::{CompactString, ToCompactString};
use serde::{Deserialize, Serialize};

/// Stable identity of a physical device, usually its IEEE address (`0x00124b001f3c8e21`)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(CompactString);

impl DeviceId {
    pub const fn const_new(s: &'static str) -> Self {
        Self(CompactString::const_new(s))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Deref for DeviceId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.0.as_str()
    }
}

impl<T: AsRef<str>> From<T> for DeviceId {
    fn from(value: T) -> Self {
        DeviceId(CompactString::from(value.as_ref()))
    }
}

impl<T: AsRef<str> + ?Sized> PartialEq<T> for DeviceId {
    fn eq(&self, other: &T) -> bool {
        self.0.as_str() == other.as_ref()
    }
}

impl Display for DeviceId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.0.fmt(f)
    }
}

pub trait ToDeviceId: ToCompactString {
    fn to_device_id(&self) -> DeviceId {
        DeviceId(self.to_compact_string())
    }
}

impl<T: ToCompactString> ToDeviceId for T {}

/// Turns `color_temp_startup` into `Color temp startup`
pub fn label_from_name(name: &str) -> CompactString {
    let mut label = CompactString::with_capacity(name.len());

    for (i, ch) in name.chars().enumerate() {
        match ch {
            '_' => label.push(' '),
            ch if i == 0 => label.extend(ch.to_uppercase()),
            ch => label.push(ch),
        }
    }

    label
}
