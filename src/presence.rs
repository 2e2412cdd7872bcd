use std::collections::{HashMap, VecDeque};
use std::hash::{BuildHasher, RandomState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[cfg(not(feature = "mock-clock"))]
use std::time::Instant;

#[cfg(feature = "mock-clock")]
use mock_instant::thread_local::Instant;

use tokio::sync::RwLock;

use crate::cache_key::CacheKey;

const MAX_SHARDS: usize = 16;

/// Bounded, time-limited memory of keys known to exist in the store.
///
/// A positive answer lets a request skip the existence check and go straight
/// to signing. Entries expire after `ttl` so an object removed by the store's
/// lifecycle policy is eventually checked again.
///
/// Eviction is FIFO with a second chance: an entry that was looked up since it
/// was last queued is moved to the back once instead of being dropped.
pub struct PresenceCache {
    shards: Box<[RwLock<Shard>]>,
    hasher: RandomState,
    ttl: Duration,
}

struct Shard {
    entries: HashMap<CacheKey, Entry>,
    /// Insertion order. Entries removed out of order leave stale slots that are
    /// recognised by their generation and skipped.
    queue: VecDeque<(CacheKey, u64)>,
    capacity: usize,
    next_generation: u64,
}

struct Entry {
    inserted_at: Instant,
    generation: u64,
    visited: AtomicBool,
}

impl PresenceCache {
    /// `None` when `max_entries` is zero.
    pub fn new(max_entries: usize, ttl: Duration) -> Option<Self> {
        if max_entries == 0 {
            return None;
        }

        let shard_count = max_entries.min(MAX_SHARDS);
        let shards = (0..shard_count)
            .map(|index| {
                let capacity =
                    max_entries / shard_count + usize::from(index < max_entries % shard_count);
                RwLock::new(Shard::new(capacity))
            })
            .collect();

        Some(Self {
            shards,
            hasher: RandomState::new(),
            ttl,
        })
    }

    pub async fn contains(&self, key: &CacheKey) -> bool {
        let shard = self.shard(key).read().await;
        match shard.entries.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                entry.visited.store(true, Ordering::Relaxed);
                true
            }
            _ => false,
        }
    }

    pub async fn insert(&self, key: CacheKey) {
        let mut shard = self.shard(&key).write().await;
        shard.insert(key, self.ttl);
    }

    #[cfg(test)]
    async fn remove(&self, key: &CacheKey) -> bool {
        let mut shard = self.shard(key).write().await;
        shard.entries.remove(key).is_some()
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        let mut len = 0;
        for shard in self.shards.iter() {
            len += shard.read().await.entries.len();
        }
        len
    }

    #[cfg(test)]
    async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn shard(&self, key: &CacheKey) -> &RwLock<Shard> {
        let index = self.hasher.hash_one(key) as usize % self.shards.len();
        &self.shards[index]
    }
}

impl Shard {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            queue: VecDeque::with_capacity(capacity),
            capacity,
            next_generation: 0,
        }
    }

    fn insert(&mut self, key: CacheKey, ttl: Duration) {
        let now = Instant::now();

        if let Some(entry) = self.entries.get_mut(&key) {
            entry.inserted_at = now;
            return;
        }

        while self.entries.len() >= self.capacity {
            if !self.evict(ttl) {
                break;
            }
        }

        let generation = self.next_generation;
        self.next_generation += 1;
        self.queue.push_back((key.clone(), generation));
        self.entries.insert(
            key,
            Entry {
                inserted_at: now,
                generation,
                visited: AtomicBool::new(false),
            },
        );

        if self.queue.len() > self.capacity * 2 {
            self.compact();
        }
    }

    /// Drop one entry from the front of the queue. Returns false if the queue
    /// held no live entry.
    fn evict(&mut self, ttl: Duration) -> bool {
        while let Some((key, generation)) = self.queue.pop_front() {
            let Some(entry) = self.entries.get(&key) else {
                continue;
            };
            if entry.generation != generation {
                continue;
            }

            let expired = entry.inserted_at.elapsed() >= ttl;
            if !expired && entry.visited.swap(false, Ordering::Relaxed) {
                self.queue.push_back((key, generation));
                continue;
            }

            self.entries.remove(&key);
            return true;
        }
        false
    }

    fn compact(&mut self) {
        let entries = &self.entries;
        self.queue.retain(|(key, generation)| {
            entries
                .get(key)
                .is_some_and(|entry| entry.generation == *generation)
        });
    }
}
