use std::sync::{PoisonError, RwLock};

use serde_json::Value;

use super::document::Document;
use super::{ConfigStore, Settings};
use crate::error::StoreError;
use crate::identity::Identity;

/// Process-local [`ConfigStore`]. Writes never fail.
#[derive(Debug, Default)]
pub struct MemoryStore {
    doc: RwLock<Document>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<R>(&self, f: impl FnOnce(&Document) -> R) -> R {
        f(&self.doc.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn write(&self, f: impl FnOnce(&mut Document)) -> Result<(), StoreError> {
        f(&mut self.doc.write().unwrap_or_else(PoisonError::into_inner));
        Ok(())
    }
}

impl ConfigStore for MemoryStore {
    fn get(&self, key: &str, default: Value) -> Value {
        self.read(|d| d.get(key, default))
    }

    fn get_scoped(&self, scope: Identity, key: &str, default: Value) -> Value {
        self.read(|d| d.get_scoped(scope, key, default))
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.write(|d| d.set(key, value))
    }

    fn set_scoped(&self, scope: Identity, key: &str, value: Value) -> Result<(), StoreError> {
        self.write(|d| d.set_scoped(scope, key, value))
    }

    fn set_scoped_batch(&self, scope: Identity, entries: Settings) -> Result<(), StoreError> {
        self.write(|d| d.set_scoped_batch(scope, entries))
    }

    fn all_scoped(&self, scope: Identity) -> Settings {
        self.read(|d| d.all_scoped(scope))
    }

    fn erase_scoped(&self, scope: Identity) -> Result<(), StoreError> {
        self.write(|d| {
            d.erase_scoped(scope);
        })
    }
}
