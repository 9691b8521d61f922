//! Storage layer
//!
//! A key-addressable JSON object store on the filesystem, plus the
//! account registry and follow lists built on top of it.

mod accounts;
mod follows;
mod store;

pub use accounts::{AccountSettings, AccountStore, LocalAccount};
pub use follows::{FollowList, FollowStore};
pub use store::{FsStore, storage_key};

/// Unique entity ID generator (ULID-based)
///
/// Used for locally minted activity and object ids.
pub struct EntityId(pub String);

impl EntityId {
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string().to_lowercase())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}
