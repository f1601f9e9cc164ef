#![forbid(unsafe_code)]

use crate::lock::{CheckedMutex, LockDiscipline};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;

/// Default bucket count. Prime, so typical address/id patterns do not
/// cluster into a handful of chains.
pub const FRAG_BUCKETS: usize = 257;

/// Identity of one in-flight fragmented datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragKey {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub protocol: u8,
    pub id: u16,
    pub tos: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragError {
    /// An entry with this key is already live. Routine (retransmitted
    /// first fragment); the existing entry is left untouched.
    Exists,
    /// The slot arena is full. Routine under traffic spikes.
    NoMemory,
}

/// What a lookup hit carries back to the data plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragHit {
    pub rule: u64,
    /// The fragment did not advance the high watermark: duplicate or
    /// overlapping payload.
    pub duplicate: bool,
}

/// TTL behavior on a lookup hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlRefresh {
    /// Reset to the configured default.
    Reset,
    /// Add this many ticks, capped at the configured default.
    Bump(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FragStats {
    pub exists: u64,
    pub nomem: u64,
    pub new: u64,
    pub hits: u64,
    pub misses: u64,
    pub expired: u64,
    pub in_use: usize,
}

#[derive(Debug, Clone)]
pub struct FragConfig {
    pub capacity: usize,
    pub buckets: usize,
    pub default_ttl: u32,
    pub refresh: TtlRefresh,
    pub discipline: LockDiscipline,
}

impl Default for FragConfig {
    fn default() -> Self {
        FragConfig {
            capacity: 8192,
            buckets: FRAG_BUCKETS,
            default_ttl: 120,
            refresh: TtlRefresh::Reset,
            discipline: LockDiscipline::Blocking,
        }
    }
}

#[derive(Debug)]
struct Slot {
    key: FragKey,
    rule: u64,
    ttl: u32,
    hi_watermark: u16,
    prev: Option<usize>,
    next: Option<usize>,
    bucket: usize,
}

#[derive(Debug)]
struct FragInner {
    buckets: Vec<Option<usize>>,
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    stats: FragStats,
    capacity: usize,
    default_ttl: u32,
    refresh: TtlRefresh,
}

/// Fixed-size hash-indexed fragment cache. One coarse lock covers the
/// buckets, the slot arena, and the counters; entries reference each other
/// by arena index only.
#[derive(Debug)]
pub struct FragmentCache {
    state: CheckedMutex<FragInner>,
}

impl FragmentCache {
    pub fn new(config: FragConfig) -> Result<Self, String> {
        if config.capacity == 0 {
            return Err("fragment cache capacity must be at least 1".into());
        }
        if config.default_ttl == 0 {
            return Err("fragment default ttl must be at least 1".into());
        }
        if !is_prime(config.buckets) {
            return Err(format!(
                "fragment bucket count {} is not prime",
                config.buckets
            ));
        }
        Ok(FragmentCache {
            state: CheckedMutex::new(
                "frag-cache",
                config.discipline,
                FragInner {
                    buckets: vec![None; config.buckets],
                    slots: Vec::new(),
                    free: Vec::new(),
                    stats: FragStats::default(),
                    capacity: config.capacity,
                    default_ttl: config.default_ttl,
                    refresh: config.refresh,
                },
            ),
        })
    }

    /// Record the first fragment of a datagram admitted by `rule`.
    /// `end_offset` is the fragment's end in 8-byte units.
    pub fn new_fragment(
        &self,
        key: FragKey,
        end_offset: u16,
        rule: u64,
    ) -> Result<(), FragError> {
        let mut inner = self.state.enter();
        let bucket = bucket_of(&key, inner.buckets.len());
        if find_in_bucket(&inner, bucket, &key).is_some() {
            inner.stats.exists += 1;
            return Err(FragError::Exists);
        }

        let idx = match inner.free.pop() {
            Some(idx) => idx,
            None if inner.slots.len() < inner.capacity => {
                inner.slots.push(None);
                inner.slots.len() - 1
            }
            None => {
                inner.stats.nomem += 1;
                return Err(FragError::NoMemory);
            }
        };

        let head = inner.buckets[bucket];
        inner.slots[idx] = Some(Slot {
            key,
            rule,
            ttl: inner.default_ttl,
            hi_watermark: end_offset,
            prev: None,
            next: head,
            bucket,
        });
        if let Some(old) = head {
            if let Some(slot) = inner.slots[old].as_mut() {
                slot.prev = Some(idx);
            }
        }
        inner.buckets[bucket] = Some(idx);
        inner.stats.new += 1;
        inner.stats.in_use += 1;
        Ok(())
    }

    /// Look up a continuation fragment. A hit refreshes the TTL; arrival of
    /// the final fragment (more-fragments clear) completes the datagram and
    /// removes the entry after the hit is produced.
    pub fn known_fragment(
        &self,
        key: FragKey,
        end_offset: u16,
        more_fragments: bool,
    ) -> Option<FragHit> {
        let mut inner = self.state.enter();
        let bucket = bucket_of(&key, inner.buckets.len());
        let Some(idx) = find_in_bucket(&inner, bucket, &key) else {
            inner.stats.misses += 1;
            return None;
        };

        inner.stats.hits += 1;
        let default_ttl = inner.default_ttl;
        let refresh = inner.refresh;
        let (rule, duplicate) = {
            let Some(slot) = inner.slots[idx].as_mut() else {
                return None;
            };
            let duplicate = end_offset <= slot.hi_watermark;
            if !duplicate {
                slot.hi_watermark = end_offset;
            }
            slot.ttl = match refresh {
                TtlRefresh::Reset => default_ttl,
                TtlRefresh::Bump(n) => slot.ttl.saturating_add(n).min(default_ttl),
            };
            (slot.rule, duplicate)
        };
        if !more_fragments {
            unlink(&mut inner, idx);
        }
        Some(FragHit { rule, duplicate })
    }

    /// One aging tick: decrement every entry's TTL and evict entries that
    /// reach exactly zero. Returns the number evicted.
    pub fn expire_all(&self) -> usize {
        let mut inner = self.state.enter();
        let mut doomed = Vec::new();
        for (idx, slot) in inner.slots.iter_mut().enumerate() {
            if let Some(slot) = slot.as_mut() {
                slot.ttl -= 1;
                if slot.ttl == 0 {
                    doomed.push(idx);
                }
            }
        }
        for idx in &doomed {
            unlink(&mut inner, *idx);
            inner.stats.expired += 1;
        }
        doomed.len()
    }

    /// Invalidate every entry weakly referencing `rule`. The one full-table
    /// scan in the design; called when a rule is unloaded.
    pub fn forget(&self, rule: u64) -> usize {
        let mut inner = self.state.enter();
        let doomed: Vec<usize> = inner
            .slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| match slot {
                Some(s) if s.rule == rule => Some(idx),
                _ => None,
            })
            .collect();
        for idx in &doomed {
            unlink(&mut inner, *idx);
        }
        doomed.len()
    }

    /// Tear the table down, dropping all entries unconditionally.
    pub fn unload(&self) {
        let mut inner = self.state.enter();
        inner.buckets.fill(None);
        inner.slots.clear();
        inner.free.clear();
        inner.stats.in_use = 0;
    }

    pub fn stats(&self) -> FragStats {
        self.state.enter().stats
    }

    pub fn len(&self) -> usize {
        self.state.enter().stats.in_use
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn bucket_of(key: &FragKey, buckets: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % buckets
}

fn find_in_bucket(inner: &FragInner, bucket: usize, key: &FragKey) -> Option<usize> {
    let mut cursor = inner.buckets[bucket];
    while let Some(idx) = cursor {
        let Some(slot) = inner.slots[idx].as_ref() else {
            break;
        };
        if slot.key == *key {
            return Some(idx);
        }
        cursor = slot.next;
    }
    None
}

fn unlink(inner: &mut FragInner, idx: usize) {
    let Some(slot) = inner.slots[idx].take() else {
        return;
    };
    match slot.prev {
        Some(prev) => {
            if let Some(p) = inner.slots[prev].as_mut() {
                p.next = slot.next;
            }
        }
        None => inner.buckets[slot.bucket] = slot.next,
    }
    if let Some(next) = slot.next {
        if let Some(n) = inner.slots[next].as_mut() {
            n.prev = slot.prev;
        }
    }
    inner.free.push(idx);
    inner.stats.in_use -= 1;
}

fn is_prime(n: usize) -> bool {
    if n < 2 {
        return false;
    }
    let mut d = 2;
    while d * d <= n {
        if n % d == 0 {
            return false;
        }
        d += 1;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: u16) -> FragKey {
        FragKey {
            src: "10.0.0.1".parse().unwrap(),
            dst: "10.0.0.2".parse().unwrap(),
            protocol: 6,
            id,
            tos: 0,
        }
    }

    fn cache(capacity: usize, ttl: u32) -> FragmentCache {
        FragmentCache::new(FragConfig {
            capacity,
            default_ttl: ttl,
            discipline: LockDiscipline::Strict,
            ..FragConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn duplicate_key_is_rejected_and_original_kept() {
        let cache = cache(16, 5);
        cache.new_fragment(key(4242), 2, 1).unwrap();
        assert_eq!(cache.new_fragment(key(4242), 9, 7), Err(FragError::Exists));

        // the original entry still answers with its own rule
        let hit = cache.known_fragment(key(4242), 4, true).unwrap();
        assert_eq!(hit.rule, 1);

        let stats = cache.stats();
        assert_eq!(stats.exists, 1);
        assert_eq!(stats.new, 1);
        assert_eq!(stats.in_use, 1);
    }

    #[test]
    fn insert_then_lookup_returns_rule() {
        let cache = cache(16, 5);
        cache.new_fragment(key(1), 2, 99).unwrap();
        let hit = cache.known_fragment(key(1), 4, true).unwrap();
        assert_eq!(hit.rule, 99);
        assert!(!hit.duplicate);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn arena_exhaustion_is_counted_not_fatal() {
        let cache = cache(2, 5);
        cache.new_fragment(key(1), 1, 1).unwrap();
        cache.new_fragment(key(2), 1, 1).unwrap();
        assert_eq!(cache.new_fragment(key(3), 1, 1), Err(FragError::NoMemory));
        let stats = cache.stats();
        assert_eq!(stats.nomem, 1);
        assert_eq!(stats.in_use, 2);
    }

    #[test]
    fn ttl_expires_after_exactly_n_sweeps() {
        let cache = cache(16, 5);
        cache.new_fragment(key(7), 2, 3).unwrap();
        for _ in 0..4 {
            assert_eq!(cache.expire_all(), 0);
        }
        assert_eq!(cache.expire_all(), 1);
        assert!(cache.known_fragment(key(7), 4, true).is_none());

        let stats = cache.stats();
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.in_use, 0);
    }

    #[test]
    fn hit_resets_ttl_to_default() {
        let cache = cache(16, 5);
        cache.new_fragment(key(7), 2, 3).unwrap();
        for _ in 0..4 {
            cache.expire_all();
        }
        // one tick from eviction; the hit buys a whole new cycle
        assert!(cache.known_fragment(key(7), 4, true).is_some());
        for _ in 0..4 {
            assert_eq!(cache.expire_all(), 0);
        }
        assert_eq!(cache.expire_all(), 1);
    }

    #[test]
    fn bump_refresh_is_capped_at_default() {
        let cache = FragmentCache::new(FragConfig {
            capacity: 16,
            default_ttl: 5,
            refresh: TtlRefresh::Bump(2),
            discipline: LockDiscipline::Strict,
            ..FragConfig::default()
        })
        .unwrap();
        cache.new_fragment(key(7), 2, 3).unwrap();
        for _ in 0..3 {
            cache.expire_all();
        }
        // ttl 2, bumped by 2 -> 4
        assert!(cache.known_fragment(key(7), 4, true).is_some());
        for _ in 0..3 {
            assert_eq!(cache.expire_all(), 0);
        }
        assert_eq!(cache.expire_all(), 1);
    }

    #[test]
    fn final_fragment_completes_datagram() {
        let cache = cache(16, 5);
        cache.new_fragment(key(9), 2, 1).unwrap();
        let hit = cache.known_fragment(key(9), 4, false).unwrap();
        assert_eq!(hit.rule, 1);
        assert_eq!(cache.stats().in_use, 0);
        assert!(cache.known_fragment(key(9), 6, true).is_none());
    }

    #[test]
    fn stale_offset_is_flagged_duplicate() {
        let cache = cache(16, 5);
        cache.new_fragment(key(9), 2, 1).unwrap();
        assert!(!cache.known_fragment(key(9), 4, true).unwrap().duplicate);
        // replay of the same region does not advance the watermark
        assert!(cache.known_fragment(key(9), 4, true).unwrap().duplicate);
        assert!(cache.known_fragment(key(9), 3, true).unwrap().duplicate);
        assert!(!cache.known_fragment(key(9), 6, true).unwrap().duplicate);
    }

    #[test]
    fn forget_unlinks_only_matching_rule() {
        let cache = cache(16, 5);
        cache.new_fragment(key(1), 1, 10).unwrap();
        cache.new_fragment(key(2), 1, 10).unwrap();
        cache.new_fragment(key(3), 1, 11).unwrap();
        let before = cache.stats().in_use;
        assert_eq!(cache.forget(10), 2);
        assert_eq!(cache.stats().in_use, before - 2);
        assert!(cache.known_fragment(key(1), 2, true).is_none());
        assert!(cache.known_fragment(key(2), 2, true).is_none());
        assert_eq!(cache.known_fragment(key(3), 2, true).unwrap().rule, 11);
    }

    #[test]
    fn unload_drops_everything() {
        let cache = cache(16, 5);
        for id in 0..8 {
            cache.new_fragment(key(id), 1, 1).unwrap();
        }
        cache.unload();
        assert!(cache.is_empty());
        assert!(cache.known_fragment(key(0), 2, true).is_none());
        // freed capacity is reusable
        cache.new_fragment(key(0), 1, 1).unwrap();
    }

    #[test]
    fn slots_are_reused_after_eviction() {
        let cache = cache(2, 1);
        cache.new_fragment(key(1), 1, 1).unwrap();
        cache.new_fragment(key(2), 1, 1).unwrap();
        assert_eq!(cache.expire_all(), 2);
        cache.new_fragment(key(3), 1, 1).unwrap();
        cache.new_fragment(key(4), 1, 1).unwrap();
        assert_eq!(cache.stats().in_use, 2);
    }

    #[test]
    fn rejects_non_prime_bucket_count() {
        let err = FragmentCache::new(FragConfig {
            buckets: 256,
            ..FragConfig::default()
        })
        .unwrap_err();
        assert!(err.contains("not prime"));
    }

    #[test]
    fn colliding_bucket_chains_stay_consistent() {
        // enough keys that several must share one of the 257 buckets
        let cache = cache(1024, 5);
        for id in 0..600 {
            cache.new_fragment(key(id), 1, u64::from(id)).unwrap();
        }
        assert_eq!(cache.stats().in_use, 600);
        for id in (0..600).step_by(3) {
            let hit = cache.known_fragment(key(id), 2, true).unwrap();
            assert_eq!(hit.rule, u64::from(id));
        }
        // removing from the middle of chains keeps neighbors reachable
        for id in (1..600).step_by(3) {
            assert!(cache.known_fragment(key(id), 2, false).is_some());
        }
        for id in (2..600).step_by(3) {
            let hit = cache.known_fragment(key(id), 2, true).unwrap();
            assert_eq!(hit.rule, u64::from(id));
        }
    }
}
