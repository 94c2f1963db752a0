//! Addressable things on the network
//!
//! An [`Entity`] is either a single endpoint (sub-address) of a device, a group of endpoints,
//! or a whole device. Every entity derives an [`EntityKey`], which is what runtime state is
//! keyed on.
//!
//! # Text form
//!
//! ```plain
//! 0x00124b001f3c8e21      device
//! 0x00124b001f3c8e21/2    endpoint 2 of that device
//! group/5                 group 5
//! ```

use core::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::DeviceId;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EntityError {
    #[error("unknown entity shape: {0}")]
    UnknownShape(String),
    #[error("bad endpoint id in {0:?}")]
    BadEndpoint(String),
    #[error("bad group id in {0:?}")]
    BadGroup(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Entity {
    Endpoint { device: DeviceId, endpoint: u8 },
    Group { group: u16 },
    Device { device: DeviceId },
}

/// Identity of an [`Entity`]; equal for the same physical entity, distinct otherwise
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntityKey {
    Group(u16),
    Endpoint(DeviceId, u8),
    Device(DeviceId),
}

impl Entity {
    pub fn endpoint(device: impl Into<DeviceId>, endpoint: u8) -> Self {
        Entity::Endpoint { device: device.into(), endpoint }
    }

    pub fn group(group: u16) -> Self {
        Entity::Group { group }
    }

    pub fn device(device: impl Into<DeviceId>) -> Self {
        Entity::Device { device: device.into() }
    }

    pub fn key(&self) -> EntityKey {
        match self {
            Entity::Endpoint { device, endpoint } => EntityKey::Endpoint(device.clone(), *endpoint),
            Entity::Group { group } => EntityKey::Group(*group),
            Entity::Device { device } => EntityKey::Device(device.clone()),
        }
    }

    /// Owning device, `None` for groups
    pub fn device_id(&self) -> Option<&DeviceId> {
        match self {
            Entity::Endpoint { device, .. } | Entity::Device { device } => Some(device),
            Entity::Group { .. } => None,
        }
    }

    pub fn endpoint_id(&self) -> Option<u8> {
        match self {
            Entity::Endpoint { endpoint, .. } => Some(*endpoint),
            _ => None,
        }
    }

    /// The entity whose published state this entity's traffic belongs to.
    ///
    /// Endpoints report into their owning device; groups and devices report into themselves.
    pub fn owner(&self) -> Entity {
        match self {
            Entity::Endpoint { device, .. } => Entity::Device { device: device.clone() },
            other => other.clone(),
        }
    }

    /// Parses an entity from untyped JSON, rejecting anything that isn't one of the known shapes
    pub fn from_value(value: &serde_json::Value) -> Result<Self, EntityError> {
        Entity::deserialize(value).map_err(|e| EntityError::UnknownShape(e.to_string()))
    }
}

impl Display for Entity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Entity::Endpoint { device, endpoint } => write!(f, "{device}/{endpoint}"),
            Entity::Group { group } => write!(f, "group/{group}"),
            Entity::Device { device } => write!(f, "{device}"),
        }
    }
}

impl FromStr for Entity {
    type Err = EntityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');

        match (parts.next(), parts.next(), parts.next()) {
            (Some("group"), Some(id), None) => id
                .parse()
                .map(Entity::group)
                .map_err(|_| EntityError::BadGroup(s.to_owned())),
            (Some(device), Some(endpoint), None) if is_device_address(device) => endpoint
                .parse()
                .map(|endpoint| Entity::endpoint(device, endpoint))
                .map_err(|_| EntityError::BadEndpoint(s.to_owned())),
            (Some(device), None, None) if is_device_address(device) => Ok(Entity::device(device)),
            _ => Err(EntityError::UnknownShape(s.to_owned())),
        }
    }
}

fn is_device_address(s: &str) -> bool {
    s.strip_prefix("0x")
        .is_some_and(|hex| !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit()))
}

impl Display for EntityKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            EntityKey::Group(group) => write!(f, "{group}"),
            EntityKey::Endpoint(device, endpoint) => write!(f, "{device}_{endpoint}"),
            EntityKey::Device(device) => write!(f, "{device}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IEEE: &str = "0x00124b001f3c8e21";

    #[test]
    fn keys_are_stable_and_distinct() {
        assert_eq!(Entity::endpoint(IEEE, 1).key(), Entity::endpoint(IEEE, 1).key());
        assert_ne!(Entity::endpoint(IEEE, 1).key(), Entity::endpoint(IEEE, 2).key());
        assert_ne!(Entity::endpoint(IEEE, 1).key(), Entity::device(IEEE).key());
        assert_ne!(Entity::group(1).key(), Entity::endpoint(IEEE, 1).key());

        assert_eq!(Entity::endpoint(IEEE, 1).key().to_string(), "0x00124b001f3c8e21_1");
        assert_eq!(Entity::group(5).key().to_string(), "5");
        assert_eq!(Entity::device(IEEE).key().to_string(), IEEE);
    }

    #[test]
    fn entity_from_str() {
        assert_eq!("0x00124b001f3c8e21/2".parse::<Entity>().unwrap(), Entity::endpoint(IEEE, 2));
        assert_eq!("group/5".parse::<Entity>().unwrap(), Entity::group(5));
        assert_eq!(IEEE.parse::<Entity>().unwrap(), Entity::device(IEEE));

        assert_eq!(
            "group/x".parse::<Entity>(),
            Err(EntityError::BadGroup("group/x".to_owned()))
        );
        assert_eq!(
            "0x00124b001f3c8e21/300".parse::<Entity>(),
            Err(EntityError::BadEndpoint("0x00124b001f3c8e21/300".to_owned()))
        );
        assert_eq!(
            "coordinator".parse::<Entity>(),
            Err(EntityError::UnknownShape("coordinator".to_owned()))
        );
    }

    #[test]
    fn entity_serde() {
        assert_eq!(
            serde_json::to_value(Entity::endpoint(IEEE, 1)).unwrap(),
            serde_json::json!({ "type": "endpoint", "device": IEEE, "endpoint": 1 })
        );

        assert_eq!(
            Entity::from_value(&serde_json::json!({ "type": "group", "group": 3 })).unwrap(),
            Entity::group(3)
        );

        assert!(matches!(
            Entity::from_value(&serde_json::json!({ "type": "coordinator", "id": 0 })),
            Err(EntityError::UnknownShape(_))
        ));
    }

    #[test]
    fn owner() {
        assert_eq!(Entity::endpoint(IEEE, 3).owner(), Entity::device(IEEE));
        assert_eq!(Entity::group(3).owner(), Entity::group(3));
    }
}
