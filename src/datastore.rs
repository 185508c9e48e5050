//! Durable JSON key/value store backing all locally cached PsiCash state.
//!
//! The store holds a cache of server-issued state, so a missing or corrupt file
//! is replaced by an empty one rather than reported as a failure.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{ErrorKind, PsiCashError, Result};

const DATASTORE_FILENAME: &str = "datastore";
const DATASTORE_TEMP_EXTENSION: &str = "tmp";
const DATASTORE_VERSION: u32 = 1;

/// On-disk layout of the datastore file.
#[derive(Debug, Serialize, Deserialize)]
struct DatastoreFile {
    version: u32,
    data: Map<String, Value>,
}

/// How `Datastore::load` obtained its state. Neither variant is a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// An existing, valid file was read.
    Loaded,
    /// The file was absent, unreadable or invalid and an empty store was written in its place.
    Reinitialized,
}

#[derive(Debug, Default)]
pub struct Datastore {
    path: Option<PathBuf>,
    data: Map<String, Value>,
}

impl Datastore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the store found under `root`, creating the directory if needed.
    pub fn load(&mut self, root: &Path) -> Result<LoadOutcome> {
        if root.as_os_str().is_empty() {
            return Err(PsiCashError::new(
                ErrorKind::InvalidArgument,
                "datastore root is empty",
            ));
        }

        let path = root.join(DATASTORE_FILENAME);
        self.path = Some(path.clone());

        fs::create_dir_all(root).map_err(|err| {
            PsiCashError::new(
                ErrorKind::Initialization,
                format!("failed to create datastore root {}: {err}", root.display()),
            )
        })?;

        match read_file(&path) {
            Ok(data) => {
                self.data = data;
                tracing::debug!(path = %path.display(), "datastore loaded");
                Ok(LoadOutcome::Loaded)
            }
            Err(reason) => {
                tracing::warn!(
                    path = %path.display(),
                    reason = %reason,
                    "datastore unusable; reinitializing empty",
                );
                let empty = Map::new();
                write_file(&path, &empty).map_err(|err| {
                    PsiCashError::new(
                        ErrorKind::Initialization,
                        format!("failed to write fresh datastore: {}", err.message()),
                    )
                })?;
                self.data = empty;
                Ok(LoadOutcome::Reinitialized)
            }
        }
    }

    /// Resets to the empty state, persisting it if the store has a location.
    pub fn clear(&mut self) -> Result<()> {
        if let Some(path) = &self.path {
            write_file(path, &Map::new())?;
        }
        self.data = Map::new();
        Ok(())
    }

    /// Returns the value stored under `key`, or `None` if there is none.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.data.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone()).map(Some).map_err(|err| {
                PsiCashError::new(
                    ErrorKind::Parse,
                    format!("failed to decode datastore key {key}: {err}"),
                )
            }),
        }
    }

    pub fn set<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        let value = encode(key, value)?;
        self.update(|data| {
            data.insert(key.to_string(), value);
            Ok(())
        })
    }

    /// Applies `operation` to a copy of the current state, persists the copy and
    /// only then makes it current. On error nothing changes, in memory or on disk.
    pub fn update<F>(&mut self, operation: F) -> Result<()>
    where
        F: FnOnce(&mut Map<String, Value>) -> Result<()>,
    {
        let path = self.path.as_ref().ok_or_else(|| {
            PsiCashError::new(ErrorKind::Datastore, "datastore has not been loaded")
        })?;

        let mut snapshot = self.data.clone();
        operation(&mut snapshot)?;
        write_file(path, &snapshot)?;
        self.data = snapshot;
        Ok(())
    }
}

/// Serializes `value` for storage under `key`.
pub fn encode<T: Serialize>(key: &str, value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|err| {
        PsiCashError::new(
            ErrorKind::Parse,
            format!("failed to encode datastore key {key}: {err}"),
        )
    })
}

fn read_file(path: &Path) -> std::result::Result<Map<String, Value>, String> {
    let raw = fs::read(path).map_err(|err| err.to_string())?;
    let file: DatastoreFile = serde_json::from_slice(&raw).map_err(|err| err.to_string())?;
    if file.version != DATASTORE_VERSION {
        return Err(format!(
            "unsupported datastore version {}; want {DATASTORE_VERSION}",
            file.version
        ));
    }
    Ok(file.data)
}

fn write_file(path: &Path, data: &Map<String, Value>) -> Result<()> {
    let file = DatastoreFile {
        version: DATASTORE_VERSION,
        data: data.clone(),
    };
    let bytes = serde_json::to_vec(&file).map_err(|err| {
        PsiCashError::new(
            ErrorKind::Datastore,
            format!("failed to encode datastore: {err}"),
        )
    })?;

    // Write to a sibling temp file and rename it over the real one.
    let temp_path = path.with_extension(DATASTORE_TEMP_EXTENSION);
    let io_err = |stage: &str, err: std::io::Error| {
        PsiCashError::new(
            ErrorKind::Datastore,
            format!("failed to {stage} {}: {err}", temp_path.display()),
        )
    };
    let mut temp = File::create(&temp_path).map_err(|err| io_err("create", err))?;
    temp.write_all(&bytes).map_err(|err| io_err("write", err))?;
    temp.sync_all().map_err(|err| io_err("sync", err))?;
    drop(temp);

    fs::rename(&temp_path, path).map_err(|err| {
        PsiCashError::new(
            ErrorKind::Datastore,
            format!("failed to replace {}: {err}", path.display()),
        )
    })?;

    // The rename itself is only durable once the directory entry is synced.
    match path.parent() {
        Some(dir) => sync_dir(dir),
        None => Ok(()),
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|err| {
            PsiCashError::new(
                ErrorKind::Datastore,
                format!("failed to sync directory {}: {err}", dir.display()),
            )
        })
}

// Directories cannot be opened for syncing here; the file sync is all we get.
#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded(root: &Path) -> Datastore {
        let mut ds = Datastore::new();
        ds.load(root).unwrap();
        ds
    }

    #[test]
    fn store_directory_is_synced_after_replace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DATASTORE_FILENAME);
        write_file(&path, &Map::new()).unwrap();
        sync_dir(dir.path()).unwrap();
        assert!(path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn syncing_a_missing_directory_is_a_datastore_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = sync_dir(&dir.path().join("gone")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Datastore);
    }

    #[test]
    fn fresh_root_is_reinitialized() {
        let dir = tempfile::tempdir().unwrap();
        let mut ds = Datastore::new();

        assert_eq!(ds.load(dir.path()).unwrap(), LoadOutcome::Reinitialized);
        assert!(dir.path().join(DATASTORE_FILENAME).exists());
        assert_eq!(ds.get::<i64>("balance").unwrap(), None);
    }

    #[test]
    fn set_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut ds = loaded(dir.path());
        ds.set("balance", &42i64).unwrap();

        let mut reloaded = Datastore::new();
        assert_eq!(reloaded.load(dir.path()).unwrap(), LoadOutcome::Loaded);
        assert_eq!(reloaded.get::<i64>("balance").unwrap(), Some(42));
        assert!(!dir.path().join("datastore.tmp").exists());
    }

    #[test]
    fn garbage_file_self_heals() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(DATASTORE_FILENAME), b"nonsense\n").unwrap();

        let mut ds = Datastore::new();
        assert_eq!(ds.load(dir.path()).unwrap(), LoadOutcome::Reinitialized);
        assert_eq!(ds.get::<i64>("balance").unwrap(), None);
    }

    #[test]
    fn wrong_version_self_heals() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(DATASTORE_FILENAME),
            br#"{"version":99,"data":{"balance":5}}"#,
        )
        .unwrap();

        let mut ds = Datastore::new();
        assert_eq!(ds.load(dir.path()).unwrap(), LoadOutcome::Reinitialized);
        assert_eq!(ds.get::<i64>("balance").unwrap(), None);
    }

    #[test]
    fn clear_persists_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut ds = loaded(dir.path());
        ds.set("balance", &42i64).unwrap();
        ds.clear().unwrap();

        let reloaded = loaded(dir.path());
        assert_eq!(reloaded.get::<i64>("balance").unwrap(), None);
    }

    #[test]
    fn failed_update_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut ds = loaded(dir.path());
        ds.set("balance", &1i64).unwrap();

        let result = ds.update(|data| {
            data.insert("balance".into(), Value::from(2));
            Err(PsiCashError::new(ErrorKind::InvalidArgument, "nope"))
        });

        assert!(result.is_err());
        assert_eq!(ds.get::<i64>("balance").unwrap(), Some(1));
        assert_eq!(loaded(dir.path()).get::<i64>("balance").unwrap(), Some(1));
    }

    #[test]
    fn set_before_load_is_an_error() {
        let mut ds = Datastore::new();
        let err = ds.set("balance", &1i64).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Datastore);
    }

    #[test]
    fn mistyped_value_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut ds = loaded(dir.path());
        ds.set("balance", &"not a number").unwrap();

        let err = ds.get::<i64>("balance").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse);
    }
}
