//! Producer-side aggregation of consumer advertisements.

use crate::key::TypeKey;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Stable identity of one attached consumer.
///
/// The identity lives as long as the attachment: a consumer that detaches and
/// re-attaches gets a fresh identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(u64);

impl ConsumerId {
    /// Allocate a process-unique consumer identity.
    pub fn allocate() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Build an identity from a raw value (e.g. one assigned by a transport).
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw identity value.
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "consumer-{}", self.0)
    }
}

/// A consumer's serialized snapshot of its supported types.
///
/// An advertisement with an empty entry set is a farewell: it tells the
/// producer the consumer is detaching without waiting for liveness expiry.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    /// Identity of the advertising consumer.
    pub consumer_id: ConsumerId,
    /// Monotonic per-consumer sequence; arrivals not newer than the one on
    /// record are stale and discarded.
    pub seq: u64,
    /// The consumer's candidate representations with preference weights.
    pub entries: Vec<(TypeKey, f64)>,
}

impl Advertisement {
    /// Whether this advertisement announces departure rather than candidates.
    pub fn is_farewell(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Aggregated weight for one key across all live consumers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Aggregate {
    /// Sum of the weights every currently-attached consumer assigns this key.
    pub total_weight: f64,
    /// The consumers contributing to `total_weight`.
    pub supporters: HashSet<ConsumerId>,
}

struct AdvertisementState {
    ad: Advertisement,
    last_seen: Instant,
}

/// Aggregated view of every live consumer's weighted preferences.
///
/// Owned by the producer-side coordinator and never persisted: it is a cache
/// of currently known consumer state, always derivable from the live
/// advertisement set.
#[derive(Default)]
pub struct PreferenceTable {
    consumers: HashMap<ConsumerId, AdvertisementState>,
}

impl PreferenceTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace any prior advertisement from the same consumer.
    ///
    /// Returns `false` when the advertisement is stale (its sequence is not
    /// newer than the one on record); stale advertisements leave the table
    /// untouched. Applying the same advertisement twice is idempotent by the
    /// same rule.
    pub fn apply_advertisement(&mut self, ad: Advertisement) -> bool {
        if let Some(prev) = self.consumers.get(&ad.consumer_id) {
            if ad.seq <= prev.ad.seq {
                return false;
            }
        }
        self.consumers.insert(
            ad.consumer_id,
            AdvertisementState {
                ad,
                last_seen: Instant::now(),
            },
        );
        true
    }

    /// Drop a consumer's contribution. Idempotent; returns whether the
    /// consumer was present.
    pub fn remove(&mut self, consumer_id: ConsumerId) -> bool {
        self.consumers.remove(&consumer_id).is_some()
    }

    /// Remove every consumer whose latest advertisement is older than
    /// `timeout`, returning the departed identities.
    pub fn expire_stale(&mut self, timeout: Duration) -> Vec<ConsumerId> {
        let now = Instant::now();
        let gone: Vec<ConsumerId> = self
            .consumers
            .iter()
            .filter(|(_, state)| now.duration_since(state.last_seen) > timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &gone {
            self.consumers.remove(id);
        }
        gone
    }

    /// Number of currently-attached consumers.
    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Whether any consumer is attached.
    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    /// Identities of the currently-attached consumers.
    pub fn consumers(&self) -> impl Iterator<Item = ConsumerId> + '_ {
        self.consumers.keys().copied()
    }

    /// Immutable aggregated copy used as solver input.
    ///
    /// A negotiation pass works on the snapshot, so it sees a frozen view
    /// even if advertisements keep arriving concurrently.
    pub fn snapshot(&self) -> PreferenceSnapshot {
        let mut weights: HashMap<TypeKey, Aggregate> = HashMap::new();
        for state in self.consumers.values() {
            for (key, weight) in &state.ad.entries {
                let agg = weights.entry(key.clone()).or_default();
                agg.total_weight += weight;
                agg.supporters.insert(state.ad.consumer_id);
            }
        }
        PreferenceSnapshot { weights }
    }
}

/// Frozen aggregation produced by [`PreferenceTable::snapshot`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreferenceSnapshot {
    weights: HashMap<TypeKey, Aggregate>,
}

impl PreferenceSnapshot {
    /// Build a snapshot directly from aggregated entries (mainly for tests).
    pub fn from_entries(entries: impl IntoIterator<Item = (TypeKey, Aggregate)>) -> Self {
        Self {
            weights: entries.into_iter().collect(),
        }
    }

    /// Aggregated weight for a key; zero when no attached consumer supports it.
    pub fn total_weight(&self, key: &TypeKey) -> f64 {
        self.weights.get(key).map_or(0.0, |a| a.total_weight)
    }

    /// The full aggregate for a key, if any consumer supports it.
    pub fn get(&self, key: &TypeKey) -> Option<&Aggregate> {
        self.weights.get(key)
    }

    /// Whether no key has any support.
    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}
