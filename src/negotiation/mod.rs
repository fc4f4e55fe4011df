//! Representation negotiation between one producer and many consumers.
//!
//! This module holds the pure core of the system: the aggregated view of
//! consumer preferences and the algorithm that combines it with the
//! producer's own supported types into a single deterministic decision.
//!
//! # Flow
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  consumers advertise (TypeKey, weight) sets                  │
//! │      └─> PreferenceTable folds every live advertisement      │
//! │             └─> solver::select(producer map, snapshot)       │
//! │                    └─> Decision { Selected | NoAgreement }   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The solver is a pure function: identical inputs always yield identical
//! output, which is what makes re-running it on every membership change safe.

mod preference;
mod solver;

pub use preference::{Advertisement, Aggregate, ConsumerId, PreferenceSnapshot, PreferenceTable};
pub use solver::{ranked_candidates, select, select_excluding, Candidate, Selection};

use crate::bus::ChannelDescriptor;
use crate::key::TypeKey;

/// One announced negotiation result.
///
/// Decisions are immutable once published and superseded atomically by the
/// next decision. Consumers apply them in sequence order and discard anything
/// older than what they have already applied.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    /// Monotonic per-producer sequence number.
    pub seq: u64,
    /// What was decided.
    pub outcome: Outcome,
}

/// The outcome carried by a [`Decision`].
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// A mutually supported representation won; payloads flow on `channel`.
    Selected {
        /// The winning representation.
        key: TypeKey,
        /// Where payloads of the winning representation are carried.
        channel: ChannelDescriptor,
    },
    /// No representation is supported by both sides with positive weight.
    ///
    /// This is a legitimate outcome, not an error: the stream simply carries
    /// nothing until a future decision resolves it.
    NoAgreement,
}

impl Decision {
    /// The winning key, if one was selected.
    pub fn key(&self) -> Option<&TypeKey> {
        match &self.outcome {
            Outcome::Selected { key, .. } => Some(key),
            Outcome::NoAgreement => None,
        }
    }

    /// Whether this decision is "no representation available".
    pub fn is_no_agreement(&self) -> bool {
        matches!(self.outcome, Outcome::NoAgreement)
    }
}
