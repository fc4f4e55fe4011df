//! # Concord
//!
//! Runtime type negotiation between producers and consumers that support
//! multiple data representations.
//!
//! A producer advertises the representations it can emit, each with a weight.
//! Consumers advertise the representations they can decode, with their own
//! weights. A [`NegotiatedPublisher`](publisher::NegotiatedPublisher)
//! aggregates the preferences, selects the representation that scores highest
//! as the product of producer and summed consumer weights, opens a concrete
//! data channel for it, and announces the decision. Consumers attach to the
//! announced channel and renegotiation happens automatically as consumers
//! come and go.
//!
//! ## Features
//!
//! - **Weighted selection**: neither side can force a choice unilaterally
//! - **Deterministic solver**: pure function of support and preferences
//! - **Make-before-break**: the winning channel opens before the old one closes
//! - **Liveness tracking**: silent consumers expire and trigger renegotiation
//! - **Retained decisions**: late-joining consumers observe the current choice
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use concord::prelude::*;
//!
//! let bus = Bus::new();
//!
//! let mut publisher: NegotiatedPublisher<Frame> =
//!     NegotiatedPublisher::new(Arc::clone(&bus), "video");
//! publisher.register_type(TypeKey::new("h264", "annex-b"), 2.0, encode_h264)?;
//! publisher.register_type(TypeKey::new("raw", "i420"), 1.0, encode_raw)?;
//!
//! let mut subscriber = NegotiatedSubscriber::new(Arc::clone(&bus));
//! subscriber.add_candidate(
//!     TypeKey::new("h264", "annex-b"),
//!     1.0,
//!     ChannelQuality::default(),
//!     decode_h264,
//!     |frame| render(frame),
//! )?;
//! let handle = subscriber.start();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bus;
pub mod error;
pub mod key;
pub mod negotiation;
pub mod observability;
pub mod publisher;
pub mod subscriber;
pub mod support;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::bus::{Bus, ChannelDescriptor, ChannelQuality};
    pub use crate::error::{Error, Result};
    pub use crate::key::TypeKey;
    pub use crate::negotiation::{Decision, Outcome};
    pub use crate::publisher::{NegotiatedPublisher, PublisherOptions, PublisherState};
    pub use crate::subscriber::{
        NegotiatedSubscriber, SubscriberOptions, SubscriberState, SubscriptionHandle,
    };
    pub use crate::support::SupportedTypeMap;
}

pub use error::{Error, Result};
