use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Settings;
use crate::identity::Identity;

/// In-memory shape shared by every store implementation.
///
/// Global and scoped keys are kept in separate maps, so they cannot alias.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Document {
    #[serde(default)]
    pub global: Settings,
    #[serde(default)]
    pub scoped: BTreeMap<Identity, Settings>,
}

impl Document {
    pub fn get(&self, key: &str, default: Value) -> Value {
        self.global.get(key).cloned().unwrap_or(default)
    }

    pub fn get_scoped(&self, scope: Identity, key: &str, default: Value) -> Value {
        self.scoped
            .get(&scope)
            .and_then(|s| s.get(key))
            .cloned()
            .unwrap_or(default)
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.global.insert(key.to_string(), value);
    }

    pub fn set_scoped(&mut self, scope: Identity, key: &str, value: Value) {
        self.scoped
            .entry(scope)
            .or_default()
            .insert(key.to_string(), value);
    }

    pub fn set_scoped_batch(&mut self, scope: Identity, entries: Settings) {
        if entries.is_empty() {
            return;
        }
        self.scoped.entry(scope).or_default().extend(entries);
    }

    pub fn all_scoped(&self, scope: Identity) -> Settings {
        self.scoped.get(&scope).cloned().unwrap_or_default()
    }

    /// Returns `true` if the scope existed.
    pub fn erase_scoped(&mut self, scope: Identity) -> bool {
        self.scoped.remove(&scope).is_some()
    }
}
