use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::entry::{CacheEntry, StoredEntry};
use super::CacheKey;

/// Process-wide response store shared by all clones of an accessor.
///
/// Writers race per key; the last write wins. With a directory configured,
/// entries are also written to `<dir>/<key>.json` so a later process can
/// fall back on them. Entries inserted with `insert_in_memory` never touch
/// the disk.
pub struct ResponseCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    dir: Option<PathBuf>,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl ResponseCache {
    pub fn in_memory() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            dir: None,
        }
    }

    pub fn persistent(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create cache directory {}", dir.display()))?;
        Ok(Self {
            entries: RwLock::new(HashMap::new()),
            dir: Some(dir),
        })
    }

    fn entry_path(&self, key: &CacheKey) -> Option<PathBuf> {
        self.dir.as_ref().map(|dir| dir.join(format!("{}.json", key)))
    }

    pub async fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        if let Some(entry) = self.entries.read().await.get(key) {
            return Some(entry.clone());
        }

        let entry = match self.load(key) {
            Ok(entry) => entry?,
            Err(e) => {
                debug!(key = %key, error = %e, "Failed to load cache file");
                return None;
            }
        };
        self.entries.write().await.insert(key.clone(), entry.clone());
        Some(entry)
    }

    pub async fn insert(&self, key: CacheKey, entry: CacheEntry) {
        if let Err(e) = self.save(&key, &entry) {
            warn!(key = %key, error = %e, "Failed to write cache file");
        }
        self.entries.write().await.insert(key, entry);
    }

    /// Age of the entry under `key`, if one is held in memory.
    pub async fn entry_age(&self, key: &CacheKey) -> Option<Duration> {
        self.entries.read().await.get(key).map(CacheEntry::age)
    }

    /// Insert without writing a cache file, for responses to credentialed
    /// requests.
    pub async fn insert_in_memory(&self, key: CacheKey, entry: CacheEntry) {
        self.entries.write().await.insert(key, entry);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Drop every entry, including files on disk.
    pub async fn clear(&self) -> Result<()> {
        self.entries.write().await.clear();
        if let Some(ref dir) = self.dir {
            for file in std::fs::read_dir(dir)? {
                let path = file?.path();
                if path.extension().is_some_and(|ext| ext == "json") {
                    std::fs::remove_file(path)?;
                }
            }
        }
        Ok(())
    }

    fn load(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let Some(path) = self.entry_path(key) else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read cache file: {}", key))?;
        let stored: StoredEntry = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse cache file: {}", key))?;
        Ok(Some(CacheEntry::try_from(stored)?))
    }

    fn save(&self, key: &CacheKey, entry: &CacheEntry) -> Result<()> {
        let Some(path) = self.entry_path(key) else {
            return Ok(());
        };
        let contents = serde_json::to_string(&StoredEntry::from(entry))?;
        std::fs::write(&path, contents)?;
        Ok(())
    }
}
