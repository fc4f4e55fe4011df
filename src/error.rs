//! Error types for Concord.

use thiserror::Error;

/// Result type alias using Concord's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Concord operations.
///
/// Note that "no agreement" is *not* an error: it is a legitimate negotiation
/// outcome and is represented by [`crate::negotiation::Outcome::NoAgreement`].
#[derive(Error, Debug)]
pub enum Error {
    /// A registration was given a weight that is not a finite positive number.
    #[error("invalid weight {weight}: must be finite and greater than zero")]
    InvalidWeight {
        /// The rejected weight.
        weight: f64,
    },

    /// The transport refused to open a channel.
    #[error("failed to open channel '{topic}': {reason}")]
    ChannelOpen {
        /// Topic of the channel that could not be opened.
        topic: String,
        /// Transport-provided reason.
        reason: String,
    },

    /// A payload could not be encoded or decoded by the registered capability.
    #[error("codec error for type '{key}': {reason}")]
    Codec {
        /// The type key whose capability failed.
        key: String,
        /// Capability-provided reason.
        reason: String,
    },

    /// The coordinator behind this handle has shut down.
    #[error("coordinator has shut down")]
    Shutdown,
}
