// Copyright (c) 2024 Botho Foundation

//! The bounded caches the router keeps: a generic LRU map (used for the
//! per-peer IDONTWANT table), a TTL-aged seen-message set for
//! deduplication, and the sliding-window message cache IWANT/IHAVE serve
//! off of.

use crate::message::MessageId;
use crate::wire::WireMessage;
use bth_p2p_identity::PeerId;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// A bounded least-recently-used map: insertion and `touch` both move a
/// key to the most-recently-used end; `pop_oldest` removes and returns the
/// least-recently-used entry.
#[derive(Debug, Default)]
pub struct LruMap<K: Eq + std::hash::Hash + Clone, V> {
    order: VecDeque<K>,
    values: HashMap<K, V>,
}

impl<K: Eq + std::hash::Hash + Clone, V> LruMap<K, V> {
    /// An empty map.
    pub fn new() -> Self {
        Self {
            order: VecDeque::new(),
            values: HashMap::new(),
        }
    }

    /// Number of entries currently held.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Insert or overwrite `key`, marking it most-recently-used.
    pub fn insert(&mut self, key: K, value: V) {
        if self.values.contains_key(&key) {
            self.order.retain(|k| k != &key);
        }
        self.order.push_back(key.clone());
        self.values.insert(key, value);
    }

    /// Mark `key` as most-recently-used without changing its value.
    /// No-op if the key is absent.
    pub fn touch(&mut self, key: &K) {
        if self.values.contains_key(key) {
            self.order.retain(|k| k != key);
            self.order.push_back(key.clone());
        }
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: &K) -> bool {
        self.values.contains_key(key)
    }

    /// Borrow the value for `key`.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.values.get(key)
    }

    /// Remove and return the least-recently-used entry, if any.
    pub fn pop_oldest(&mut self) -> Option<(K, V)> {
        let key = self.order.pop_front()?;
        let value = self.values.remove(&key)?;
        Some((key, value))
    }

    /// Remove `key` regardless of its position.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.order.retain(|k| k != key);
        self.values.remove(key)
    }

    /// Insert `key`, evicting the oldest entry first if this would exceed
    /// `capacity`.
    pub fn insert_bounded(&mut self, key: K, value: V, capacity: usize) {
        if self.values.len() >= capacity && !self.values.contains_key(&key) {
            self.pop_oldest();
        }
        self.insert(key, value);
    }
}

/// A bounded, TTL-aged set of message ids used only for duplicate
/// detection — presence, not content, is all that is tracked.
#[derive(Debug)]
pub struct SeenCache {
    ttl: Duration,
    max_entries: usize,
    order: VecDeque<(MessageId, Instant)>,
    members: std::collections::HashSet<MessageId>,
}

impl SeenCache {
    /// Create a cache with the given TTL and maximum entry count.
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries,
            order: VecDeque::new(),
            members: std::collections::HashSet::new(),
        }
    }

    /// Whether `id` has been seen (and not yet expired/evicted).
    pub fn contains(&self, id: &MessageId) -> bool {
        self.members.contains(id)
    }

    /// Record `id` as seen at `now`, evicting the oldest entry if the
    /// cache is at capacity.
    pub fn insert(&mut self, id: MessageId, now: Instant) {
        if self.members.contains(&id) {
            return;
        }
        if self.order.len() >= self.max_entries {
            if let Some((oldest, _)) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        self.members.insert(id.clone());
        self.order.push_back((id, now));
    }

    /// Age out every entry older than `ttl` as of `now`. Called once per
    /// heartbeat.
    pub fn age_out(&mut self, now: Instant) {
        while let Some((_, inserted_at)) = self.order.front() {
            if now.duration_since(*inserted_at) <= self.ttl {
                break;
            }
            if let Some((id, _)) = self.order.pop_front() {
                self.members.remove(&id);
            }
        }
    }
}

/// One entry retained by the message cache: the message itself, plus the
/// peer it was first received from (for IWANT to target the right
/// first-deliverer's history).
#[derive(Debug, Clone)]
pub struct CachedMessage {
    /// The message as received (or, for our own published messages, as
    /// sent).
    pub message: WireMessage,
    /// Id of the peer we first received this message from; `None` for
    /// locally originated messages.
    pub originating_peer: Option<PeerId>,
}

/// A sliding window of the last `window_len` heartbeats' worth of
/// messages, indexed by id, serving IWANT requests and IHAVE gossip.
#[derive(Debug)]
pub struct MessageCache {
    window_len: usize,
    /// `history[0]` is the current (newest) heartbeat's bucket.
    history: VecDeque<HashMap<MessageId, CachedMessage>>,
}

impl MessageCache {
    /// Create a cache retaining `window_len` heartbeats of history.
    pub fn new(window_len: usize) -> Self {
        let mut history = VecDeque::new();
        history.push_front(HashMap::new());
        Self {
            window_len: window_len.max(1),
            history,
        }
    }

    /// Insert a message into the current (newest) bucket.
    pub fn insert(&mut self, id: MessageId, message: WireMessage, originating_peer: Option<PeerId>) {
        self.history
            .front_mut()
            .expect("history always has a front bucket")
            .insert(id, CachedMessage { message, originating_peer });
    }

    /// Look up a message by id across every retained bucket.
    pub fn get(&self, id: &MessageId) -> Option<&CachedMessage> {
        self.history.iter().find_map(|bucket| bucket.get(id))
    }

    /// Shift in a fresh current bucket, dropping the oldest once the
    /// window exceeds `window_len`. Called once per heartbeat.
    pub fn shift(&mut self) {
        self.history.push_front(HashMap::new());
        while self.history.len() > self.window_len {
            self.history.pop_back();
        }
    }

    /// Ids of messages on `topic` from the newest `gossip_len` buckets,
    /// for IHAVE gossip emission.
    pub fn gossip_ids(&self, topic: &str, gossip_len: usize) -> Vec<MessageId> {
        self.history
            .iter()
            .take(gossip_len)
            .flat_map(|bucket| {
                bucket
                    .iter()
                    .filter(|(_, cached)| cached.message.topic == topic)
                    .map(|(id, _)| id.clone())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lru_order_matches_literal_seed() {
        let mut map: LruMap<&str, u32> = LruMap::new();
        map.insert("a", 1);
        map.insert("b", 2);
        map.insert("c", 3);
        map.touch(&"a");
        let (oldest, _) = map.pop_oldest().unwrap();
        assert_eq!(oldest, "b");
        let (next, _) = map.pop_oldest().unwrap();
        assert_eq!(next, "c");
        let (last, _) = map.pop_oldest().unwrap();
        assert_eq!(last, "a");
    }

    #[test]
    fn bounded_insert_evicts_oldest_at_capacity() {
        let mut map: LruMap<u32, ()> = LruMap::new();
        for i in 0..5 {
            map.insert_bounded(i, (), 3);
        }
        assert_eq!(map.len(), 3);
        assert!(!map.contains(&0));
        assert!(!map.contains(&1));
        assert!(map.contains(&4));
    }

    #[test]
    fn seen_cache_deduplicates() {
        let mut cache = SeenCache::new(Duration::from_secs(60), 100);
        let id = MessageId(vec![1, 2, 3]);
        let now = Instant::now();
        assert!(!cache.contains(&id));
        cache.insert(id.clone(), now);
        assert!(cache.contains(&id));
    }

    #[test]
    fn seen_cache_ages_out_by_ttl() {
        let mut cache = SeenCache::new(Duration::from_millis(10), 100);
        let id = MessageId(vec![1]);
        let t0 = Instant::now();
        cache.insert(id.clone(), t0);
        cache.age_out(t0 + Duration::from_millis(5));
        assert!(cache.contains(&id));
        cache.age_out(t0 + Duration::from_millis(20));
        assert!(!cache.contains(&id));
    }

    #[test]
    fn seen_cache_evicts_oldest_at_capacity() {
        let mut cache = SeenCache::new(Duration::from_secs(600), 2);
        let now = Instant::now();
        cache.insert(MessageId(vec![1]), now);
        cache.insert(MessageId(vec![2]), now);
        cache.insert(MessageId(vec![3]), now);
        assert!(!cache.contains(&MessageId(vec![1])));
        assert!(cache.contains(&MessageId(vec![3])));
    }

    #[test]
    fn message_cache_shift_drops_beyond_window() {
        let mut cache = MessageCache::new(2);
        let id_old = MessageId(vec![1]);
        cache.insert(
            id_old.clone(),
            WireMessage {
                topic: "t".into(),
                ..Default::default()
            },
            None,
        );
        cache.shift();
        cache.shift();
        assert!(cache.get(&id_old).is_none());
    }

    #[test]
    fn message_cache_gossip_ids_filters_by_topic() {
        let mut cache = MessageCache::new(5);
        cache.insert(
            MessageId(vec![1]),
            WireMessage {
                topic: "a".into(),
                ..Default::default()
            },
            None,
        );
        cache.insert(
            MessageId(vec![2]),
            WireMessage {
                topic: "b".into(),
                ..Default::default()
            },
            None,
        );
        let ids = cache.gossip_ids("a", 5);
        assert_eq!(ids, vec![MessageId(vec![1])]);
    }
}
