//! Pure selection algorithm over producer support and aggregated preferences.

use super::preference::PreferenceSnapshot;
use crate::key::TypeKey;
use crate::support::SupportedTypeMap;
use std::collections::HashSet;

/// One viable candidate with its combined score.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// The candidate representation.
    pub key: TypeKey,
    /// Producer weight multiplied by the summed consumer weight.
    pub score: f64,
}

/// Outcome of one selection.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    /// A mutually supported representation won.
    Winner(TypeKey),
    /// No key is present on both sides with positive aggregated weight.
    NoAgreement,
}

impl Selection {
    /// The winning key, if any.
    pub fn key(&self) -> Option<&TypeKey> {
        match self {
            Self::Winner(key) => Some(key),
            Self::NoAgreement => None,
        }
    }
}

/// Select the winning representation.
///
/// The candidate set is every key the producer can emit that at least one
/// attached consumer accepts with positive weight. Each candidate scores the
/// product of the producer's weight and the aggregated consumer weight, so a
/// type wins only by being simultaneously cheap for the producer *and*
/// broadly preferred among consumers; neither side can force a choice
/// unilaterally. Ties break toward the key the producer registered earliest.
///
/// Pure function: identical inputs always yield identical output, regardless
/// of call history.
pub fn select<C>(producer: &SupportedTypeMap<C>, prefs: &PreferenceSnapshot) -> Selection {
    static NO_EXCLUSIONS: std::sync::OnceLock<HashSet<TypeKey>> = std::sync::OnceLock::new();
    select_excluding(producer, prefs, NO_EXCLUSIONS.get_or_init(HashSet::new))
}

/// Like [`select`], but skipping the keys in `excluded`.
///
/// Used to fall back to the next-highest-scoring candidate after the
/// transport refused to open a channel for the original winner.
pub fn select_excluding<C>(
    producer: &SupportedTypeMap<C>,
    prefs: &PreferenceSnapshot,
    excluded: &HashSet<TypeKey>,
) -> Selection {
    let mut winner: Option<(TypeKey, f64)> = None;

    // Iterating in first-registration order and replacing the running best
    // only on a strictly greater score makes the earliest-registered key win
    // ties, independent of consumer arrival order.
    for key in producer.keys() {
        if excluded.contains(key) {
            continue;
        }
        let total = prefs.total_weight(key);
        if total <= 0.0 {
            continue;
        }
        let Some(entry) = producer.lookup(key) else {
            continue;
        };
        let score = entry.weight * total;
        match &winner {
            Some((_, best)) if score <= *best => {}
            _ => winner = Some((key.clone(), score)),
        }
    }

    match winner {
        Some((key, _)) => Selection::Winner(key),
        None => Selection::NoAgreement,
    }
}

/// Every viable candidate, ranked by descending score.
///
/// Equal scores keep the producer's registration order (the same tie-break
/// [`select`] applies).
pub fn ranked_candidates<C>(
    producer: &SupportedTypeMap<C>,
    prefs: &PreferenceSnapshot,
) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = producer
        .keys()
        .filter_map(|key| {
            let total = prefs.total_weight(key);
            if total <= 0.0 {
                return None;
            }
            let entry = producer.lookup(key)?;
            Some(Candidate {
                key: key.clone(),
                score: entry.weight * total,
            })
        })
        .collect();
    // Stable sort preserves registration order among equal scores.
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    candidates
}
