pub mod catalog;
pub mod converter;
pub mod dispatch;
pub mod endpoint;
pub mod log;
pub mod options;
pub mod publish;
pub mod store;
pub mod transport;

pub use kitsune_common as common;
use kitsune_common::{DeviceId, Entity, EntityError, expose::ExposeError};

pub use self::dispatch::{Context, Dispatcher, KeyFailure, MultiError};
use self::{catalog::CatalogError, converter::ConvertError, transport::TransportError};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unknown device {0}")]
    UnknownDevice(DeviceId),
    #[error("unknown group {0}")]
    UnknownGroup(u16),
    #[error("group {0} has no members")]
    EmptyGroup(u16),
    #[error("inbound messages must come from a device, got {0}")]
    NotADevice(Entity),
    #[error(transparent)]
    Entity(#[from] EntityError),
    #[error(transparent)]
    Expose(#[from] ExposeError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Convert(#[from] ConvertError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Partial(#[from] MultiError),
    #[error("serde json error: {0}")]
    SerdeJson(#[from] serde_json::Error),
}
