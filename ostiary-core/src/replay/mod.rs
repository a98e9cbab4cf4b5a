//! Replay cache for pure tools
//!
//! Results of tools that declare themselves pure are memoized under a
//! content key, `SHA-256(canonical {tool, version, input})`. A second call
//! with the same canonical input never reaches the handler.
//!
//! # Determinism
//!
//! A pure tool must return the same result for the same input. Storing a
//! different result under an existing key fails with
//! `REPLAY_HASH_MISMATCH` instead of overwriting, and `verify_hits`
//! re-executes on every hit to catch drift early.
//!
//! # Example
//!
//! ```rust
//! use ostiary_core::replay::{ReplayCache, replay_key};
//! use semver::Version;
//! use serde_json::json;
//!
//! let cache = ReplayCache::default();
//! let key = replay_key("sha256", &Version::new(1, 0, 0), &json!({"text": "abc"}));
//! cache.store(&key, json!({"digest": "ba78..."})).unwrap();
//! assert!(cache.lookup(&key).is_some());
//! ```

mod cache;

pub use cache::{
    CachedResult, ReplayCache, ReplayConfig, ReplayStats, Replayed, StoreOutcome, replay_key,
};
