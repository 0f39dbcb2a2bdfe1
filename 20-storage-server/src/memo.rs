//! Memoized function calls on top of the client.
//!
//! A call is identified by a caller-chosen function name plus a SHA-256 digest
//! of its arguments. The result is stored as a JSON blob under
//! `cache<key>` mapping the key to `{timestamp, timeout, res}`.
//!
//! Every stored key is also recorded, with its timestamp, in the table-wide
//! index `cache<table>`. [`Client::cache_clean`] walks that index to delete
//! the per-call blobs.

use std::{collections::BTreeMap, future::Future};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::{client::Client, message::stored_text};

/// Argument keys that never contribute to the cache key.
pub const IGNORED_ARG_KEYS: &[&str] = &["new_results_function"];

const DEFAULT_ENTRY_TIMEOUT: f64 = 3600.0;
const CLEAN_MAX_AGE: f64 = 3600.0;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheEntry {
    pub timestamp: f64,
    #[serde(default = "default_entry_timeout")]
    pub timeout: f64,
    pub res: Value,
}

fn default_entry_timeout() -> f64 {
    DEFAULT_ENTRY_TIMEOUT
}

impl CacheEntry {
    pub fn is_fresh(&self, now: f64) -> bool {
        self.timestamp + self.timeout > now
    }
}

pub type CacheBlob = BTreeMap<String, CacheEntry>;

/// Cache key to the timestamp its blob was written at.
pub type CacheIndex = BTreeMap<String, f64>;

/// `"<function>|<sha256 of args>|"`.
pub fn cache_key(function: &str, args: &[Value]) -> String {
    let mut hasher = Sha256::new();
    for arg in args {
        hash_arg(&mut hasher, arg);
    }
    format!("{function}|{}|", hex::encode(hasher.finalize()))
}

fn hash_arg(hasher: &mut Sha256, arg: &Value) {
    match arg {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map
                .keys()
                .filter(|key| !IGNORED_ARG_KEYS.contains(&key.as_str()))
                .collect();
            keys.sort();
            for key in keys {
                hasher.update(format!("'{key}'='{}'", stored_text(&map[key])));
            }
        }
        Value::Array(items) => {
            let joined: Vec<String> = items.iter().map(stored_text).collect();
            hasher.update(joined.join(","));
        }
        scalar => hasher.update(stored_text(scalar)),
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn parse_blob<T: DeserializeOwned + Default>(raw: &str) -> T {
    if raw.trim().is_empty() {
        return T::default();
    }
    serde_json::from_str(raw).unwrap_or_else(|error| {
        warn!(%error, "discarding unreadable cache blob");
        T::default()
    })
}

impl Client {
    /// Returns the cached result of `function(args)` while fresh, otherwise
    /// runs `compute` and stores what it returns.
    pub async fn cache_function<T, F, Fut>(&self, function: &str, args: &[Value], compute: F) -> T
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let key = cache_key(function, args);
        let blob_name = format!("cache{key}");
        let mut blob: CacheBlob = parse_blob(&self.get(&blob_name).await);

        match blob.get(&key) {
            Some(entry) if entry.is_fresh(self.clock.now()) => {
                match serde_json::from_value::<T>(entry.res.clone()) {
                    Ok(hit) => {
                        debug!(%key, "found cache");
                        return hit;
                    }
                    Err(error) => warn!(%key, %error, "cached result has the wrong shape"),
                }
            }
            Some(_) => debug!(%key, "deleting old cache"),
            None => {}
        }
        blob.remove(&key);

        info!(%key, "running");
        let result = compute().await;
        let finished = self.clock.now();

        match serde_json::to_value(&result) {
            Ok(res) if !is_empty_value(&res) => {
                blob.insert(
                    key.clone(),
                    CacheEntry {
                        timestamp: finished,
                        timeout: self.cache_timeout.as_secs_f64(),
                        res,
                    },
                );
                match serde_json::to_string(&blob) {
                    Ok(encoded) => {
                        debug!(%key, "saving cache");
                        self.set(&blob_name, &encoded).await;
                        self.record_in_index(&key, finished).await;
                    }
                    Err(error) => warn!(%key, %error, "could not encode cache blob"),
                }
            }
            Ok(_) => debug!(%key, "empty result; not cached"),
            Err(error) => warn!(%key, %error, "could not encode result"),
        }

        result
    }

    /// Deletes a memoized entry by its cache key (or `LIKE` pattern).
    pub async fn cache_delete(&self, key: &str) {
        self.delete(&format!("cache{key}")).await;
    }

    /// Deletes memoized blobs recorded in the table index: those written more
    /// than an hour ago, or all of them when `empty` is set. Returns `false`
    /// when nothing has been recorded.
    pub async fn cache_clean(&self, empty: bool) -> bool {
        let index_name = self.index_name();
        let mut index: CacheIndex = parse_blob(&self.get(&index_name).await);
        if index.is_empty() {
            return false;
        }

        let cutoff = self.clock.now() - CLEAN_MAX_AGE;
        let expired: Vec<String> = index
            .iter()
            .filter(|(_, written)| empty || **written <= cutoff)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.cache_delete(key).await;
            index.remove(key);
        }
        info!(removed = expired.len(), kept = index.len(), "cache cleaned");

        self.save_index(&index).await
    }

    fn index_name(&self) -> String {
        format!("cache{}", self.table())
    }

    async fn record_in_index(&self, key: &str, written: f64) {
        let index_name = self.index_name();
        let mut index: CacheIndex = parse_blob(&self.get(&index_name).await);
        index.insert(key.to_string(), written);
        self.save_index(&index).await;
    }

    async fn save_index(&self, index: &CacheIndex) -> bool {
        match serde_json::to_string(index) {
            Ok(encoded) => {
                self.set(&self.index_name(), &encoded).await;
                true
            }
            Err(error) => {
                warn!(%error, "could not encode cache index");
                false
            }
        }
    }
}
