use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde_json::Value;
use tempfile::NamedTempFile;

use super::document::Document;
use super::{ConfigStore, Settings};
use crate::error::StoreError;
use crate::identity::Identity;

/// Durable [`ConfigStore`] backed by one JSON document.
///
/// Every write serializes the whole document to a temp file in the same directory,
/// syncs it, renames it over the target and syncs the directory, so a crash leaves
/// either the old or the new document, never a torn one. The in-memory copy changes only after the rename
/// succeeded.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    doc: Mutex<Document>,
}

impl FileStore {
    /// Opens (or lazily creates) the document at `path`.
    ///
    /// A missing or empty file is an empty store; unparsable content is an error.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let doc = match fs::read(&path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Document::default(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == ErrorKind::NotFound => Document::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            doc: Mutex::new(doc),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read<R>(&self, f: impl FnOnce(&Document) -> R) -> R {
        f(&self.doc.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Applies `f` to a copy, persists the copy, then publishes it.
    fn write(&self, f: impl FnOnce(&mut Document)) -> Result<(), StoreError> {
        let mut doc = self.doc.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = doc.clone();
        f(&mut next);
        if next == *doc {
            return Ok(());
        }
        self.persist(&next)?;
        *doc = next;
        Ok(())
    }

    fn persist(&self, doc: &Document) -> Result<(), StoreError> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let mut tmp = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, doc)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        sync_dir(dir)?;
        Ok(())
    }
}

/// Makes the rename itself durable: the new directory entry survives a power loss.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

impl ConfigStore for FileStore {
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_writes_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        {
            let store = FileStore::open(&path).unwrap();
            store.set("window_count", json!(2)).unwrap();
            store.set_scoped(0, "engine", json!(3)).unwrap();
            store.set_scoped(1, "engine", json!(0)).unwrap();
            store.erase_scoped(1).unwrap();
        }

        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.get("window_count", Value::Null), json!(2));
        assert_eq!(store.get_scoped(0, "engine", Value::Null), json!(3));
        assert!(store.all_scoped(1).is_empty());
    }

    #[test]
    fn test_missing_and_empty_files_open_empty() {
        let dir = tempfile::tempdir().unwrap();
        let missing = FileStore::open(dir.path().join("nope.json")).unwrap();
        assert_eq!(missing.get("x", json!(1)), json!(1));

        let empty = dir.path().join("empty.json");
        fs::write(&empty, "  \n").unwrap();
        let store = FileStore::open(&empty).unwrap();
        assert!(store.all_scoped(0).is_empty());
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "{ not json").unwrap();
        let err = FileStore::open(&path).unwrap_err();
        assert_eq!(err.as_label(), "store_malformed");
    }

    #[test]
    fn test_scoped_key_does_not_shadow_global() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("s.json")).unwrap();
        store.set("instances", json!([0, 1])).unwrap();
        store.set_scoped(0, "instances", json!("scoped")).unwrap();

        let reopened = FileStore::open(store.path()).unwrap();
        assert_eq!(reopened.get("instances", Value::Null), json!([0, 1]));
        assert_eq!(reopened.get_scoped(0, "instances", Value::Null), json!("scoped"));
    }

    #[cfg(unix)]
    #[test]
    fn test_write_syncs_directory_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        sync_dir(dir.path()).unwrap();
        assert!(sync_dir(&dir.path().join("gone")).is_err());

        let store = FileStore::open(dir.path().join("settings.json")).unwrap();
        store.set("a", json!(1)).unwrap();
        store.set_scoped(2, "b", json!(2)).unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["settings.json".to_string()]);
    }

    #[test]
    fn test_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/settings.json");
        let store = FileStore::open(&path).unwrap();
        store.set("k", json!(true)).unwrap();
        assert!(path.exists());
    }
}
