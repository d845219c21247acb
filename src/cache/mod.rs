//! Local depot cache.
//!
//! [`DepotPolicy`] decides what gets cached, [`path`] maps request paths onto
//! the cache root, and [`CacheStore`] owns lookups and atomic population.

pub mod path;
pub mod policy;
pub mod store;

pub use policy::DepotPolicy;
pub use store::{CacheStore, CachedObject, StagingFile, StoreError};
