//! # Scoped key/value configuration store.
//!
//! [`ConfigStore`] is the persistence seam of the supervisor. Keys live either in the
//! global namespace or in the namespace of one [`Identity`]; the two never alias, even
//! for equal key names.
//!
//! ## Rules
//! - Reads are total: a missing key returns the caller's default.
//! - Writes are synchronous; durable implementations persist before returning.
//! - The store holds no engine state. Worker threads never call it.
//!
//! ## Implementations
//! - [`MemoryStore`]: process-local, for tests and ephemeral hosts.
//! - [`FileStore`]: JSON document on disk, atomically replaced on every write.
//!
//! ## Keys used by the supervisor
//! | Scope    | Key            | Meaning                                      |
//! |----------|----------------|----------------------------------------------|
//! | global   | `instances`    | persisted identity set                       |
//! | global   | `window_count` | number of instances to create on first start |
//! | identity | `engine`       | engine variant selector (see `EngineKind`)   |

mod document;
mod file;
mod memory;

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::StoreError;
use crate::identity::Identity;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Settings of one scope.
pub type Settings = BTreeMap<String, Value>;

/// Global key holding the persisted identity set.
pub const INSTANCES_KEY: &str = "instances";
/// Global key holding the default number of instances.
pub const WINDOW_COUNT_KEY: &str = "window_count";
/// Per-identity key holding the engine variant selector.
pub const ENGINE_KEY: &str = "engine";

/// Global and per-identity key/value persistence.
pub trait ConfigStore: Send + Sync + 'static {
    /// Reads a global key.
    fn get(&self, key: &str, default: Value) -> Value;

    /// Reads a key scoped to `scope`.
    fn get_scoped(&self, scope: Identity, key: &str, default: Value) -> Value;

    /// Writes a global key.
    fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;

    /// Writes a key scoped to `scope`.
    fn set_scoped(&self, scope: Identity, key: &str, value: Value) -> Result<(), StoreError>;

    /// Writes several scoped keys as one durable write. Existing keys not in `entries` are kept.
    fn set_scoped_batch(&self, scope: Identity, entries: Settings) -> Result<(), StoreError>;

    /// Returns every key of `scope` (empty if none).
    fn all_scoped(&self, scope: Identity) -> Settings;

    /// Removes every key of `scope`.
    fn erase_scoped(&self, scope: Identity) -> Result<(), StoreError>;
}
