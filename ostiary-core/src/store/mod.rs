//! Durable key-value store for pipeline state
//!
//! Budget state, circuit-breaker state and audit records can be persisted
//! across restarts through a [`DurableStore`]. Without one, all state is
//! process-local.
//!
//! Keys are `/`-separated segments of `[A-Za-z0-9._~-]` (for example
//! `budget/tenant-a` or `audit/00000000000000000042`). Values are JSON.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use serde_json::Value;
use std::sync::Arc;

/// Store failure
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Key is empty, has an empty or dot segment, or uses characters outside the key charset
    #[error("Invalid store key '{0}'")]
    InvalidKey(String),

    /// Underlying I/O failure
    #[error("Store I/O error on '{key}': {source}")]
    Io {
        /// Key being accessed
        key: String,
        /// Cause
        #[source]
        source: std::io::Error,
    },

    /// Stored value is not valid JSON
    #[error("Corrupt value for '{key}': {source}")]
    Corrupt {
        /// Key being accessed
        key: String,
        /// Cause
        #[source]
        source: serde_json::Error,
    },

    /// Backend-specific failure
    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Synchronous key-value store.
///
/// Calls are short and bounded; components invoke them while holding their
/// own state lock so persisted state never runs ahead of or behind memory.
pub trait DurableStore: Send + Sync {
    /// Read a value
    fn get(&self, key: &str) -> StoreResult<Option<Value>>;

    /// Write a value, replacing any previous one
    fn put(&self, key: &str, value: &Value) -> StoreResult<()>;

    /// All entries whose key starts with `prefix`, sorted by key
    fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Value)>>;
}

/// Shared store handle
pub type SharedStore = Arc<dyn DurableStore>;

/// Validate a store key
pub fn validate_key(key: &str) -> StoreResult<()> {
    let valid = !key.is_empty()
        && key.split('/').all(|segment| {
            !segment.is_empty()
                && segment != "."
                && segment != ".."
                && segment.bytes().all(|b| {
                    b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-' | b'~')
                })
        });
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

/// Build a key from a namespace and a caller-supplied name.
///
/// Names outside the plain charset are hex-encoded behind a `~` marker, which
/// plain names may not start with, so any id maps to a distinct valid key.
pub fn key_for(namespace: &str, name: &str) -> String {
    let plain = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.starts_with('~')
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
    if plain {
        format!("{}/{}", namespace, name)
    } else {
        let hex: String = name.bytes().map(|b| format!("{:02x}", b)).collect();
        format!("{}/~{}", namespace, hex)
    }
}
