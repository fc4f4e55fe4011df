//! Supported-type registries for producers and consumers.
//!
//! Each side of a negotiation owns exactly one [`SupportedTypeMap`]: the
//! producer maps keys to encode capabilities, the consumer maps keys to
//! decode capabilities. The map is a passive registry; it never participates
//! in messaging itself.

use crate::error::{Error, Result};
use crate::key::TypeKey;
use std::collections::HashMap;

/// One registered entry: a preference weight plus the capability needed to
/// encode or decode that representation.
#[derive(Debug, Clone)]
pub struct SupportedType<C> {
    /// Strength of preference for this representation. Finite and positive.
    pub weight: f64,
    /// The encode/decode handle supplied at registration time.
    pub capability: C,
}

/// Insertion-ordered registry of the representations one side supports.
///
/// Re-registering a key replaces its entry but keeps the key's original
/// position: downstream tie-breaking depends on first-registration order, so
/// that order must be stable across replacements.
#[derive(Debug, Clone)]
pub struct SupportedTypeMap<C> {
    entries: HashMap<TypeKey, SupportedType<C>>,
    order: Vec<TypeKey>,
}

impl<C> SupportedTypeMap<C> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Insert or replace an entry.
    ///
    /// Returns [`Error::InvalidWeight`] without mutating the registry when the
    /// weight is not a finite positive number.
    pub fn register(&mut self, key: TypeKey, weight: f64, capability: C) -> Result<()> {
        if !weight.is_finite() || weight <= 0.0 {
            return Err(Error::InvalidWeight { weight });
        }
        if !self.entries.contains_key(&key) {
            self.order.push(key.clone());
        }
        self.entries.insert(key, SupportedType { weight, capability });
        Ok(())
    }

    /// Look up the entry for a key, if registered.
    pub fn lookup(&self, key: &TypeKey) -> Option<&SupportedType<C>> {
        self.entries.get(key)
    }

    /// Whether a key is registered.
    pub fn contains(&self, key: &TypeKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Registered keys in first-registration order.
    ///
    /// The iterator is finite and restartable; call it again for a fresh pass.
    pub fn keys(&self) -> impl Iterator<Item = &TypeKey> + '_ {
        self.order.iter()
    }

    /// `(key, weight)` pairs in first-registration order, e.g. for building
    /// an advertisement.
    pub fn weights(&self) -> Vec<(TypeKey, f64)> {
        self.order
            .iter()
            .filter_map(|k| self.entries.get(k).map(|e| (k.clone(), e.weight)))
            .collect()
    }

    /// Number of registered keys.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl<C> Default for SupportedTypeMap<C> {
    fn default() -> Self {
        Self::new()
    }
}
