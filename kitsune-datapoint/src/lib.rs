//! Vendor datapoint channel: many logical values multiplexed through one cluster as
//! tag-length-value frames.

pub mod convert;
pub mod frame;
pub mod packed;

pub use self::{
    convert::{DatapointTable, ValueConverter},
    frame::{Datapoint, DatapointType, DatapointValue, Decoded, FrameError},
    packed::{BreezeSpeed, PackError, Slot, SlotLayout},
};

/// Cluster carrying datapoint frames
pub const CLUSTER: &str = "manuSpecificTuya";

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Pack(#[from] PackError),
}
