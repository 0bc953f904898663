use crate::content::ContentRecord;
use crate::keys::CacheKey;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::warn;

/// The reactive (in-memory) cache tier, as seen by the resolver.
///
/// Implementations must be cheap and synchronous; the UI state layer
/// behind them is free to use any reactivity mechanism.
pub trait ReactiveCache: Send + Sync {
    fn get(&self, key: &CacheKey) -> Option<ContentRecord>;
    fn set(&self, key: &CacheKey, record: ContentRecord);
}

/// Process-local reactive cache.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<CacheKey, ContentRecord>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }
}

impl ReactiveCache for MemoryCache {
    fn get(&self, key: &CacheKey) -> Option<ContentRecord> {
        let entries = self.entries.read().ok()?;
        entries.get(key).cloned()
    }

    fn set(&self, key: &CacheKey, record: ContentRecord) {
        if record.as_object().is_none() {
            warn!("Ignoring non-object payload for {}", key);
            return;
        }
        match self.entries.write() {
            Ok(mut entries) => {
                entries.insert(key.clone(), record);
            }
            Err(_) => warn!("Reactive cache lock poisoned, dropping update for {}", key),
        }
    }
}
