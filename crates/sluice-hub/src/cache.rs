//! # Stream Handle Cache
//!
//! Memoizes backend stream handles by identifier so existence is negotiated
//! once per stream. Bounded: when full, the oldest insertion is evicted
//! (FIFO, lookups do not refresh an entry). With a TTL configured, expired
//! entries count as misses and are re-verified by the caller.

use dashmap::DashMap;
use sluice_core::StreamHandle;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use uuid::Uuid;

struct CachedStream {
    handle: Arc<dyn StreamHandle>,
    inserted_at: Instant,
    seq: u64,
}

/// Insertion order. May hold stale keys for entries that expired or were
/// replaced; those are skipped on eviction.
#[derive(Default)]
struct InsertionOrder {
    queue: VecDeque<(Uuid, u64)>,
    next_seq: u64,
}

pub struct StreamCache {
    entries: DashMap<Uuid, CachedStream>,
    order: Mutex<InsertionOrder>,
    capacity: usize,
    ttl: Option<Duration>,
}

impl StreamCache {
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        Self {
            entries: DashMap::new(),
            order: Mutex::new(InsertionOrder::default()),
            capacity: capacity.max(1),
            ttl,
        }
    }

    pub fn get(&self, uuid: &Uuid) -> Option<Arc<dyn StreamHandle>> {
        if let Some(entry) = self.entries.get(uuid) {
            if !self.is_expired(&entry) {
                return Some(entry.handle.clone());
            }
        }
        self.entries.remove_if(uuid, |_, entry| self.is_expired(entry));
        None
    }

    pub fn insert(&self, uuid: Uuid, handle: Arc<dyn StreamHandle>) {
        let mut order = self.order.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.entries.contains_key(&uuid) {
            while self.entries.len() >= self.capacity {
                let Some((oldest, seq)) = order.queue.pop_front() else {
                    break;
                };
                self.entries.remove_if(&oldest, |_, entry| entry.seq == seq);
            }
        }

        let seq = order.next_seq;
        order.next_seq += 1;
        self.entries.insert(
            uuid,
            CachedStream {
                handle,
                inserted_at: Instant::now(),
                seq,
            },
        );
        order.queue.push_back((uuid, seq));
        if order.queue.len() > self.capacity * 2 {
            order.queue.retain(|(key, seq)| {
                self.entries.get(key).is_some_and(|entry| entry.seq == *seq)
            });
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_expired(&self, entry: &CachedStream) -> bool {
        self.ttl
            .is_some_and(|ttl| entry.inserted_at.elapsed() >= ttl)
    }
}
