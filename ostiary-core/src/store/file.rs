//! File-backed store: one JSON file per key under a root directory
//!
//! Writes go to a sibling temp file and are renamed into place, so a crash
//! mid-write leaves either the old value or the new one.

use super::{DurableStore, StoreError, StoreResult, validate_key};
use serde_json::Value;
use std::path::{Path, PathBuf};

const SUFFIX: &str = ".json";

/// Directory-backed [`DurableStore`]
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|source| StoreError::Io {
            key: root.display().to_string(),
            source,
        })?;
        Ok(Self { root })
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> StoreResult<PathBuf> {
        validate_key(key)?;
        let mut path = self.root.clone();
        let mut segments = key.split('/').peekable();
        while let Some(segment) = segments.next() {
            if segments.peek().is_some() {
                path.push(segment);
            } else {
                path.push(format!("{}{}", segment, SUFFIX));
            }
        }
        Ok(path)
    }

    fn io(key: &str) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
        move |source| StoreError::Io {
            key: key.to_string(),
            source,
        }
    }

    fn collect(&self, dir: &Path, out: &mut Vec<(String, PathBuf)>) -> StoreResult<()> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(source) => {
                return Err(StoreError::Io {
                    key: dir.display().to_string(),
                    source,
                });
            }
        };

        for entry in entries {
            let path = entry
                .map_err(|source| StoreError::Io {
                    key: dir.display().to_string(),
                    source,
                })?
                .path();
            if path.is_dir() {
                self.collect(&path, out)?;
                continue;
            }
            let Ok(relative) = path.strip_prefix(&self.root) else {
                continue;
            };
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            let Some(key) = key.strip_suffix(SUFFIX).map(str::to_string) else {
                continue;
            };
            if validate_key(&key).is_ok() {
                out.push((key, path));
            }
        }
        Ok(())
    }
}

impl DurableStore for FileStore {
    fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        let path = self.path_for(key)?;
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Self::io(key)(e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Corrupt {
                key: key.to_string(),
                source,
            })
    }

    fn put(&self, key: &str, value: &Value) -> StoreResult<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(Self::io(key))?;
        }

        let bytes = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Corrupt {
            key: key.to_string(),
            source,
        })?;

        let mut tmp_path = path.clone().into_os_string();
        tmp_path.push(".tmp");
        std::fs::write(&tmp_path, bytes).map_err(Self::io(key))?;
        std::fs::rename(&tmp_path, &path).map_err(Self::io(key))?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Value)>> {
        let mut files = Vec::new();
        self.collect(&self.root, &mut files)?;
        files.retain(|(key, _)| key.starts_with(prefix));
        files.sort_by(|a, b| a.0.cmp(&b.0));

        let mut out = Vec::with_capacity(files.len());
        for (key, _) in files {
            if let Some(value) = self.get(&key)? {
                out.push((key, value));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            store.put("audit/head", &json!({"len": 3})).unwrap();
            store.put("budget/acme", &json!({"consumed": 10})).unwrap();
        }

        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.get("audit/head").unwrap(), Some(json!({"len": 3})));
        assert_eq!(store.get("audit/missing").unwrap(), None);
        assert!(dir.path().join("budget").join("acme.json").exists());
    }

    #[test]
    fn scan_is_sorted_and_prefix_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.put("audit/00000000000000000001", &json!(1)).unwrap();
        store.put("audit/00000000000000000000", &json!(0)).unwrap();
        store.put("auditor/x", &json!("other")).unwrap();
        store.put("breaker/p", &json!("b")).unwrap();

        let records = store.scan_prefix("audit/").unwrap();
        let values: Vec<Value> = records.into_iter().map(|(_, v)| v).collect();
        assert_eq!(values, vec![json!(0), json!(1)]);
    }

    #[test]
    fn overwrite_replaces_value_and_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.put("breaker/p", &json!({"state": "closed"})).unwrap();
        store.put("breaker/p", &json!({"state": "open"})).unwrap();

        assert_eq!(store.get("breaker/p").unwrap(), Some(json!({"state": "open"})));
        assert!(!dir.path().join("breaker").join("p.json.tmp").exists());
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        std::fs::create_dir_all(dir.path().join("budget")).unwrap();
        std::fs::write(dir.path().join("budget").join("x.json"), b"{not json").unwrap();

        assert!(matches!(store.get("budget/x"), Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn invalid_key_never_touches_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert!(matches!(
            store.put("../outside", &json!(1)),
            Err(StoreError::InvalidKey(_))
        ));
    }
}
