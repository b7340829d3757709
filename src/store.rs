//! JSON file persistence.
//!
//! Each store is one JSON document rewritten in full after every mutation.
//! Writes go to a temporary file in the same directory that is then
//! renamed over the target, so readers never observe a torn file.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};

/// A JSON document on disk.
#[derive(Debug, Clone)]
pub struct JsonFile {
    path: PathBuf,
}

impl JsonFile {
    /// Store backed by `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// File path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the document, or `T::default()` if the file does not exist.
    pub fn load_or_default<T>(&self) -> Result<T>
    where
        T: DeserializeOwned + Default,
    {
        match std::fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| Error::storage(&self.path, e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "store absent, starting empty");
                Ok(T::default())
            }
            Err(e) => Err(Error::storage(&self.path, e)),
        }
    }

    /// Atomically replace the document with `value`.
    pub fn save<T>(&self, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir).map_err(|e| Error::storage(dir, e))?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| Error::storage(dir, e))?;
        serde_json::to_writer_pretty(&mut tmp, value)?;
        tmp.write_all(b"\n")
            .map_err(|e| Error::storage(tmp.path(), e))?;
        tmp.persist(&self.path)
            .map_err(|e| Error::storage(&self.path, e.error))?;
        tracing::trace!(path = %self.path.display(), "store saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_missing_file_loads_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFile::new(dir.path().join("leases.json"));
        let map: BTreeMap<String, String> = store.load_or_default().unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn test_save_creates_parent_and_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFile::new(dir.path().join("nested").join("snapshots.json"));

        let mut map = BTreeMap::new();
        map.insert("vm1".to_string(), "master".to_string());
        store.save(&map).unwrap();
        map.insert("vm1".to_string(), "golden".to_string());
        store.save(&map).unwrap();

        let loaded: BTreeMap<String, String> = store.load_or_default().unwrap();
        assert_eq!(loaded.get("vm1").map(String::as_str), Some("golden"));
        // No temp files left behind.
        let entries = std::fs::read_dir(dir.path().join("nested")).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_corrupt_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = JsonFile::new(&path)
            .load_or_default::<Vec<String>>()
            .unwrap_err();
        assert!(err.to_string().contains("devices.json"));
    }
}
