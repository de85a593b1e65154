use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use fleet_core::error::{FleetError, Result};
use fleet_core::traits::{within_window, DebounceStore};

const DEFAULT_SHARDS: usize = 16;

/// In-process debounce store: a map split across mutex-guarded shards so
/// contention stays scoped to keys that hash together.
pub struct MemoryDebounce {
    shards: Vec<Mutex<HashMap<String, DateTime<Utc>>>>,
}

impl MemoryDebounce {
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    pub fn with_shards(count: usize) -> Self {
        let count = count.max(1);
        Self {
            shards: (0..count).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, key: &str) -> &Mutex<HashMap<String, DateTime<Utc>>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        &self.shards[idx]
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().map(|m| m.len()).unwrap_or(0))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryDebounce {
    fn default() -> Self {
        Self::new()
    }
}

impl DebounceStore for MemoryDebounce {
    fn should_fire_at(&self, key: &str, window: Duration, now: DateTime<Utc>) -> Result<bool> {
        let mut map = self
            .shard(key)
            .lock()
            .map_err(|e| FleetError::Database(e.to_string()))?;
        if let Some(&last) = map.get(key) {
            if within_window(last, now, window) {
                return Ok(false);
            }
        }
        map.insert(key.to_string(), now);
        Ok(true)
    }

    fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut removed = 0;
        for shard in &self.shards {
            let mut map = shard.lock().map_err(|e| FleetError::Database(e.to_string()))?;
            let before = map.len();
            map.retain(|_, last| *last >= cutoff);
            removed += before - map.len();
        }
        Ok(removed)
    }
}
