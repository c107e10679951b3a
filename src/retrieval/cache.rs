//! Query-result cache (spec §4.3, optional): each query's `(sobject, 32-bit
//! FNV-1a hash of the SOQL text)` is stored as a JSON file under a cache
//! directory; a repeat run with the same query text is served from disk
//! instead of issuing another network call.
//!
//! `InMemory` keeps results for the lifetime of one [`crate::retrieval::RetrievalDriver`]
//! only (a plain in-process map, no disk I/O). `FileCache` persists across
//! runs under `cache_dir`. `CleanFileCache` behaves like `FileCache` but
//! purges `cache_dir` once at construction time.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use serde_json::Value as Json;

use crate::error::MigrateError;
use crate::script::BinaryCacheMode;

/// Same 32-bit FNV-1a width named in spec §4.3; kept local since the
/// identical helper in `engine::csv_codec` serves an unrelated hash
/// (content reconciliation) and isn't part of this crate's public surface.
fn fnv1a_32(data: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c9dc5;
    const PRIME: u32 = 0x01000193;
    let mut hash = OFFSET_BASIS;
    for byte in data {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

fn cache_key(object: &str, soql: &str) -> String {
    format!("{object}_{:08x}", fnv1a_32(soql.as_bytes()))
}

pub struct QueryCache {
    mode: BinaryCacheMode,
    cache_dir: PathBuf,
    memory: Mutex<HashMap<String, Vec<Json>>>,
}

impl QueryCache {
    /// Build a cache rooted at `cache_dir`. `CleanFileCache` purges any
    /// pre-existing contents of that directory immediately.
    pub fn new(mode: BinaryCacheMode, cache_dir: impl Into<PathBuf>) -> Result<Self, MigrateError> {
        let cache_dir = cache_dir.into();
        if mode == BinaryCacheMode::CleanFileCache && cache_dir.exists() {
            std::fs::remove_dir_all(&cache_dir)
                .map_err(|e| MigrateError::filesystem(cache_dir.display().to_string(), e.to_string()))?;
        }
        Ok(QueryCache { mode, cache_dir, memory: Mutex::new(HashMap::new()) })
    }

    fn file_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(format!("{key}.json"))
    }

    pub fn get(&self, object: &str, soql: &str) -> Option<Vec<Json>> {
        let key = cache_key(object, soql);
        match self.mode {
            BinaryCacheMode::InMemory => self.memory.lock().expect("cache mutex poisoned").get(&key).cloned(),
            BinaryCacheMode::FileCache | BinaryCacheMode::CleanFileCache => {
                let path = self.file_path(&key);
                let text = std::fs::read_to_string(&path).ok()?;
                serde_json::from_str(&text).ok()
            }
        }
    }

    pub fn put(&self, object: &str, soql: &str, records: &[Json]) -> Result<(), MigrateError> {
        let key = cache_key(object, soql);
        match self.mode {
            BinaryCacheMode::InMemory => {
                self.memory.lock().expect("cache mutex poisoned").insert(key, records.to_vec());
                Ok(())
            }
            BinaryCacheMode::FileCache | BinaryCacheMode::CleanFileCache => {
                std::fs::create_dir_all(&self.cache_dir)
                    .map_err(|e| MigrateError::filesystem(self.cache_dir.display().to_string(), e.to_string()))?;
                let path = self.file_path(&key);
                let text = serde_json::to_string(records)
                    .map_err(|e| MigrateError::filesystem(path.display().to_string(), e.to_string()))?;
                std::fs::write(&path, text).map_err(|e| MigrateError::filesystem(path.display().to_string(), e.to_string()))
            }
        }
    }
}
