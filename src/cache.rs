//! Bounded, time-bucketed response cache.
//!
//! Suppresses redundant register reads within a TTL window. Bounded by
//! `max_size`; on overflow, expired entries are purged first, then the
//! oldest-by-insertion entries are evicted until the cache is strictly
//! below capacity.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::frame::Datagram;

/// A cached register value and the monotonic instant it was inserted at.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: Datagram,
    pub inserted_at: Instant,
}

/// TTL + LRU-on-overflow cache keyed by register id.
#[derive(Debug)]
pub struct ResponseCache {
    ttl: Duration,
    max_size: usize,
    entries: HashMap<u32, CacheEntry>,
    order: VecDeque<u32>,
}

impl ResponseCache {
    pub fn new(ttl: Duration, max_size: usize) -> Self {
        Self {
            ttl,
            max_size,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Look up a register value. Returns `None` on a miss or when the
    /// stored entry has exceeded `ttl`; an expired entry is removed as a
    /// side effect of the lookup.
    pub fn get(&mut self, id: u32) -> Option<Datagram> {
        let fresh = match self.entries.get(&id) {
            Some(entry) => entry.inserted_at.elapsed() <= self.ttl,
            None => return None,
        };

        if fresh {
            self.entries.get(&id).map(|e| e.value.clone())
        } else {
            self.remove(id);
            None
        }
    }

    /// Insert or overwrite a register value. A new key is appended to the
    /// insertion order; overwriting an existing key keeps its original
    /// position, matching the usual insertion-ordered map semantics.
    pub fn put(&mut self, id: u32, value: Datagram) {
        let now = Instant::now();

        if self.entries.contains_key(&id) {
            self.entries.insert(
                id,
                CacheEntry {
                    value,
                    inserted_at: now,
                },
            );
            return;
        }

        if self.entries.len() >= self.max_size {
            self.cleanup();
            while self.entries.len() >= self.max_size {
                let Some(oldest) = self.order.pop_front() else {
                    break;
                };
                self.entries.remove(&oldest);
            }
        }

        self.order.push_back(id);
        self.entries.insert(
            id,
            CacheEntry {
                value,
                inserted_at: now,
            },
        );
    }

    /// Sweep expired entries. Safe to call opportunistically; `put` also
    /// calls this when the cache is full.
    pub fn cleanup(&mut self) {
        let ttl = self.ttl;
        let expired: Vec<u32> = self
            .entries
            .iter()
            .filter(|(_, e)| e.inserted_at.elapsed() > ttl)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            self.remove(id);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn remove(&mut self, id: u32) {
        self.entries.remove(&id);
        self.order.retain(|&x| x != id);
    }
}
