use crate::chain::{ChainKey, ChainState};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct Entry {
    state: ChainState,
    last_used: Instant,
    // Monotonic use counter; the smallest value marks the least recently used entry.
    tick: u64,
}

#[derive(Default)]
struct Entries {
    map: HashMap<ChainKey, Entry>,
    tick: u64,
}

/// Chain states of the active message chains.
///
/// Holds at most `max_size` chains, evicting the least recently used one when full.
/// With `max_age` set, a chain idle for longer starts over as if it was new.
pub struct ChainStateCache {
    entries: Mutex<Entries>,
    max_size: usize,
    max_age: Option<Duration>,
}

impl ChainStateCache {
    pub fn new(max_size: usize, max_age: Option<Duration>) -> Self {
        Self {
            entries: Mutex::default(),
            max_size: max_size.max(1),
            max_age,
        }
    }

    /// Runs `f` on the state of `key`, creating it if missing or expired.
    pub fn update<R>(&self, key: &ChainKey, f: impl FnOnce(&mut ChainState) -> R) -> R {
        let mut entries = self.entries.lock();
        entries.tick += 1;
        let tick = entries.tick;
        let now = Instant::now();

        let expired = match (entries.map.get(key), self.max_age) {
            (Some(entry), Some(max_age)) => now.duration_since(entry.last_used) >= max_age,
            _ => false,
        };
        if expired {
            tracing::debug!(%key, "chain state expired");
            entries.map.remove(key);
        }
        if !entries.map.contains_key(key) && entries.map.len() >= self.max_size {
            Self::evict_oldest(&mut entries.map);
        }

        let entry = entries.map.entry(key.clone()).or_insert_with(|| Entry {
            state: ChainState::default(),
            last_used: now,
            tick,
        });
        entry.last_used = now;
        entry.tick = tick;
        f(&mut entry.state)
    }

    fn evict_oldest(map: &mut HashMap<ChainKey, Entry>) {
        let oldest = map
            .iter()
            .min_by_key(|(_, entry)| entry.tick)
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            tracing::debug!(%key, "evicting chain state");
            map.remove(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().map.clear();
    }
}

impl std::fmt::Debug for ChainStateCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainStateCache")
            .field("len", &self.len())
            .field("max_size", &self.max_size)
            .field("max_age", &self.max_age)
            .finish()
    }
}
