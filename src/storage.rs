//! String key-value persistence.
//!
//! The session persists very little: the last selected wallet type, and per
//! chain flags used by the cache diagnostics. Anything that can get and set a
//! string can back it.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use alloy::primitives::B256;
use dashmap::DashMap;
use parking_lot::Mutex;

/// Slot holding the last selected wallet type.
pub const PREVIOUS_WALLET_TYPE_KEY: &str = "_web3w_previous_wallet_type";

/// Get/set string store.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: &str);

    fn remove(&self, key: &str);
}

// ============================================================================
// Stores
// ============================================================================

/// In-memory store, the default.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|v| v.value().clone())
    }

    fn set(&self, key: &str, value: &str) {
        self.entries.insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        self.entries.remove(key);
    }
}

/// Store persisted as a single JSON object file.
///
/// Writes go to a sibling temp file that is then renamed over the target.
/// I/O failures are logged and otherwise ignored, the in-memory view stays
/// authoritative for the process.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    /// Open `path`, starting empty if it does not exist.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn flush(&self, entries: &BTreeMap<String, String>) {
        let result = serde_json::to_string_pretty(entries)
            .map_err(anyhow::Error::from)
            .and_then(|content| {
                let tmp = self.path.with_extension("tmp");
                std::fs::write(&tmp, content)?;
                std::fs::rename(&tmp, &self.path)?;
                Ok(())
            });
        if let Err(e) = result {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to persist store");
        }
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        let mut entries = self.entries.lock();
        entries.insert(key.to_string(), value.to_string());
        self.flush(&entries);
    }

    fn remove(&self, key: &str) {
        let mut entries = self.entries.lock();
        if entries.remove(key).is_some() {
            self.flush(&entries);
        }
    }
}

// ============================================================================
// Slots
// ============================================================================

/// Remember the selected wallet type. An empty string clears the selection.
pub fn record_selection(store: &dyn KeyValueStore, wallet_type: &str) {
    store.set(PREVIOUS_WALLET_TYPE_KEY, wallet_type);
}

/// The recorded wallet type, exactly as recorded.
pub fn fetch_previous_selection(store: &dyn KeyValueStore) -> Option<String> {
    store.get(PREVIOUS_WALLET_TYPE_KEY)
}

fn genesis_key(chain_id: u64) -> String {
    format!("_genesis_{chain_id}")
}

fn blocks_cache_issue_key(chain_id: u64) -> String {
    format!("_blocks_cache_issue_{chain_id}")
}

/// The genesis hash last acknowledged for `chain_id`.
pub fn tracked_genesis(store: &dyn KeyValueStore, chain_id: u64) -> Option<B256> {
    store.get(&genesis_key(chain_id)).and_then(|hash| hash.parse().ok())
}

/// Whether `hash` differs from a previously tracked genesis hash.
///
/// The first sighting of a chain records `hash` and reports no change.
pub fn has_tracked_genesis_changed(store: &dyn KeyValueStore, chain_id: u64, hash: B256) -> bool {
    match tracked_genesis(store, chain_id) {
        Some(previous) => previous != hash,
        None => {
            record_new_genesis(store, chain_id, hash);
            false
        }
    }
}

pub fn record_new_genesis(store: &dyn KeyValueStore, chain_id: u64, hash: B256) {
    store.set(&genesis_key(chain_id), &hash.to_string());
}

pub fn record_blocks_cache_issue(store: &dyn KeyValueStore, chain_id: u64) {
    store.set(&blocks_cache_issue_key(chain_id), "true");
}

pub fn has_encountered_blocks_cache_issue(store: &dyn KeyValueStore, chain_id: u64) -> bool {
    store.get(&blocks_cache_issue_key(chain_id)).as_deref() == Some("true")
}
