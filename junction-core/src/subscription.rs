//! Subscription tables: routing predicates, local handler buckets, and peer
//! subscription bookkeeping.
//!
//! A subscription is the predicate `(msg_type, service, mask, value, method)`:
//! it matches a request iff `msg_type`/`service` are equal and
//! `routing_id & mask == value` and `method` equals. Two tables are kept —
//! local handlers and remote peer subscriptions — both keyed by
//! `(msg_type, service)`.

use hashbrown::HashMap;
use std::hash::Hash;

/// A routing predicate over an integer routing id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Predicate {
    pub mask: u64,
    pub value: u64,
}

impl Predicate {
    pub fn new(mask: u64, value: u64) -> Result<Self, SubscriptionError> {
        if value & !mask != 0 {
            return Err(SubscriptionError::Impossible);
        }
        Ok(Self { mask, value })
    }

    #[inline]
    pub fn matches(&self, routing_id: u64) -> bool {
        routing_id & self.mask == self.value
    }

    /// Two predicates overlap iff `(mask1 & value2) == (mask2 & value1)`.
    pub fn overlaps(&self, other: &Predicate) -> bool {
        (self.mask & other.value) == (other.mask & self.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionError {
    /// `value & ~mask != 0`.
    Impossible,
    /// Predicate set overlaps an existing local subscription on the same
    /// `(msg_type, service, method)`.
    Overlapping,
}

/// A local handler bucket: one predicate, one or more methods.
struct LocalBucket<H> {
    predicate: Predicate,
    methods: HashMap<String, H>,
}

/// Local subscription table: `(msg_type, service) -> [(predicate, methods)]`.
pub struct LocalTable<K, H> {
    buckets: HashMap<K, Vec<LocalBucket<H>>>,
}

impl<K, H> Default for LocalTable<K, H>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            buckets: HashMap::new(),
        }
    }
}

impl<K, H> LocalTable<K, H>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Returns `true` if this predicate is new for this
    /// key (caller should broadcast `ANNOUNCE`); `false` if it reused an
    /// existing bucket with a new method.
    pub fn add(
        &mut self,
        key: K,
        mask: u64,
        value: u64,
        method: impl Into<String>,
        handler: H,
    ) -> Result<bool, SubscriptionError> {
        let predicate = Predicate::new(mask, value)?;
        let method = method.into();
        let bucket_list = self.buckets.entry(key).or_default();

        // Overlap with an already-registered method is rejected for every
        // existing bucket, including the exact predicate itself — an
        // identical re-registration is a degenerate case of overlap, not a
        // piggyback. Checked across the whole list before the piggyback
        // shortcut below is allowed to fire.
        for bucket in bucket_list.iter() {
            if bucket.predicate.overlaps(&predicate) && bucket.methods.contains_key(&method) {
                return Err(SubscriptionError::Overlapping);
            }
        }

        for bucket in bucket_list.iter_mut() {
            if bucket.predicate == predicate {
                bucket.methods.insert(method, handler);
                return Ok(false);
            }
        }

        let mut methods = HashMap::new();
        methods.insert(method, handler);
        bucket_list.push(LocalBucket { predicate, methods });
        Ok(true)
    }

    /// Remove a bucket entirely. Returns `true` if a bucket was removed
    /// (caller should broadcast `UNSUBSCRIBE`).
    pub fn remove(&mut self, key: &K, mask: u64, value: u64) -> bool {
        let Some(bucket_list) = self.buckets.get_mut(key) else {
            return false;
        };
        let before = bucket_list.len();
        bucket_list.retain(|b| !(b.predicate.mask == mask && b.predicate.value == value));
        let removed = bucket_list.len() != before;
        if bucket_list.is_empty() {
            self.buckets.remove(key);
        }
        removed
    }

    /// First matching bucket with the named method present.
    pub fn find(&self, key: &K, routing_id: u64, method: &str) -> Option<&H> {
        let bucket_list = self.buckets.get(key)?;
        for bucket in bucket_list {
            if bucket.predicate.matches(routing_id) {
                if let Some(h) = bucket.methods.get(method) {
                    return Some(h);
                }
            }
        }
        None
    }

    /// Whether any bucket matches, independent of method.
    pub fn locally_handles(&self, key: &K, routing_id: u64) -> bool {
        self.buckets
            .get(key)
            .into_iter()
            .flatten()
            .any(|b| b.predicate.matches(routing_id))
    }

    /// Whether some bucket matches the routing id but the given method is
    /// absent from every matching bucket (distinguishes "no method" from
    /// "unroutable" for the proxied-RPC special case).
    pub fn has_predicate_match_without_method(&self, key: &K, routing_id: u64, method: &str) -> bool {
        let Some(bucket_list) = self.buckets.get(key) else {
            return false;
        };
        bucket_list
            .iter()
            .any(|b| b.predicate.matches(routing_id) && !b.methods.contains_key(method))
    }

    /// Every registered `(key, mask, value)` predicate, for announcing the
    /// full local subscription set to a newly connected peer.
    pub fn iter_predicates(&self) -> impl Iterator<Item = (&K, u64, u64)> {
        self.buckets
            .iter()
            .flat_map(|(key, bucket_list)| bucket_list.iter().map(move |b| (key, b.predicate.mask, b.predicate.value)))
    }
}

/// Remote peer subscription table: `(msg_type, service) -> [(predicate, peer)]`.
/// Duplicates are allowed — each peer contributes its own entry.
pub struct PeerTable<K, P> {
    entries: HashMap<K, Vec<(Predicate, P)>>,
}

impl<K, P> Default for PeerTable<K, P>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<K, P> PeerTable<K, P>
where
    K: Eq + Hash + Clone,
    P: Eq + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: K, mask: u64, value: u64, peer: P) -> Result<(), SubscriptionError> {
        let predicate = Predicate::new(mask, value)?;
        self.entries.entry(key).or_default().push((predicate, peer));
        Ok(())
    }

    pub fn remove(&mut self, key: &K, mask: u64, value: u64, peer: &P) {
        if let Some(list) = self.entries.get_mut(key) {
            list.retain(|(p, owner)| !(p.mask == mask && p.value == value && owner == peer));
            if list.is_empty() {
                self.entries.remove(key);
            }
        }
    }

    /// Every peer whose subscription predicate matches `routing_id`.
    pub fn find_peers(&self, key: &K, routing_id: u64) -> impl Iterator<Item = &P> {
        self.entries
            .get(key)
            .into_iter()
            .flatten()
            .filter(move |(pred, _)| pred.matches(routing_id))
            .map(|(_, peer)| peer)
    }

    /// Drop every subscription owned by `peer`, across all keys. Called when
    /// a peer connection goes down.
    pub fn remove_peer_everywhere(&mut self, peer: &P) {
        self.entries.retain(|_, list| {
            list.retain(|(_, owner)| owner != peer);
            !list.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn impossible_subscription_rejected() {
        assert_eq!(Predicate::new(0b0011, 0b0100), Err(SubscriptionError::Impossible));
    }

    #[test]
    fn overlap_detection() {
        // Same mask, disjoint values: the matching sets are disjoint.
        let a = Predicate::new(0b1100, 0b0100).unwrap();
        let b = Predicate::new(0b1100, 0b1000).unwrap();
        assert!(!a.overlaps(&b));

        // Constrains different bits: a routing id can satisfy both.
        let c = Predicate::new(0b0011, 0b0001).unwrap();
        assert!(a.overlaps(&c));
    }

    #[test]
    fn local_add_new_predicate_announces_once() {
        let mut table: LocalTable<&str, u32> = LocalTable::new();
        assert_eq!(table.add("svc", 0, 0, "m", 1).unwrap(), true);
        assert_eq!(table.add("svc", 0, 0, "m2", 2).unwrap(), false);
        // Overlapping predicate but a method not yet registered anywhere: fine.
        assert!(table.add("svc", 0xff, 0x01, "m3", 3).is_ok());
        // Overlapping predicate reusing an already-registered method: rejected.
        assert!(table.add("svc", 0xf0, 0x00, "m", 4).is_err());
    }

    #[test]
    fn local_add_exact_duplicate_rejected() {
        let mut table: LocalTable<&str, u32> = LocalTable::new();
        assert_eq!(table.add("svc", 0, 0, "m", 1).unwrap(), true);
        assert_eq!(table.add("svc", 0, 0, "m", 2), Err(SubscriptionError::Overlapping));
    }

    #[test]
    fn find_requires_method_in_matching_bucket() {
        let mut table: LocalTable<&str, u32> = LocalTable::new();
        table.add("svc", 0, 0, "m", 7).unwrap();
        assert_eq!(table.find(&"svc", 42, "m"), Some(&7));
        assert_eq!(table.find(&"svc", 42, "missing"), None);
        assert!(table.locally_handles(&"svc", 42));
        assert!(table.has_predicate_match_without_method(&"svc", 42, "missing"));
    }

    #[test]
    fn peer_table_tracks_and_removes_by_owner() {
        let mut table: PeerTable<&str, u32> = PeerTable::new();
        table.add("svc", 0, 0, 1).unwrap();
        table.add("svc", 0, 0, 2).unwrap();
        assert_eq!(table.find_peers(&"svc", 0).count(), 2);

        table.remove_peer_everywhere(&1);
        assert_eq!(table.find_peers(&"svc", 0).count(), 1);
    }
}
