pub mod access;
pub mod entity;
pub mod expose;
pub mod macros;
pub mod presets;

#[doc(hidden)]
pub use serde as _serde;

mod string;
pub use access::Access;
pub use entity::{Entity, EntityError, EntityKey};
pub use macros::Lookup;
pub use string::*;

/// A partial state update for one entity, keyed by property
pub type Patch = serde_json::Map<String, serde_json::Value>;

/// Shallow-merges `update` into `base`; keys in `update` win
pub fn merge_patch(base: &mut Patch, update: Patch) {
    for (key, value) in update {
        base.insert(key, value);
    }
}
