use std::collections::BTreeMap;
use std::sync::Mutex;

use bytes::Bytes;

use crate::util::lock_unpoisoned;

/// Storage for last-known response bodies, offered to callers ahead of the
/// live response.
pub trait ResponseCache: Send + Sync {
    fn save(&self, key: &str, body: Bytes);

    fn read(&self, key: &str) -> Option<Bytes>;
}

/// Bounded in-memory cache; the oldest insertion is evicted first.
#[derive(Debug)]
pub struct MemoryResponseCache {
    max_entries: usize,
    state: Mutex<MemoryCacheState>,
}

#[derive(Debug, Default)]
struct MemoryCacheState {
    next_sequence: u64,
    entries: BTreeMap<String, (u64, Bytes)>,
}

impl MemoryResponseCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            state: Mutex::new(MemoryCacheState::default()),
        }
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResponseCache for MemoryResponseCache {
    fn save(&self, key: &str, body: Bytes) {
        let mut state = lock_unpoisoned(&self.state);
        let sequence = state.next_sequence;
        state.next_sequence = state.next_sequence.saturating_add(1);
        state.entries.insert(key.to_owned(), (sequence, body));

        while state.entries.len() > self.max_entries {
            let oldest = state
                .entries
                .iter()
                .min_by_key(|(_, (sequence, _))| *sequence)
                .map(|(key, _)| key.clone());
            let Some(oldest) = oldest else {
                break;
            };
            state.entries.remove(&oldest);
        }
    }

    fn read(&self, key: &str) -> Option<Bytes> {
        lock_unpoisoned(&self.state)
            .entries
            .get(key)
            .map(|(_, body)| body.clone())
    }
}
