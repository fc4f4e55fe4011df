//! In-process transport for negotiation control messages and data payloads.
//!
//! One [`Bus`] carries one logical stream. It presents the three channel
//! kinds the coordinators consume:
//!
//! - **Advertisement channel**: many-to-one; consumers send, the producer
//!   receives (kanal mpsc).
//! - **Decision channel**: one-to-many with last-value retention, so a
//!   consumer attaching after the latest decision was sent still observes it
//!   (tokio watch).
//! - **Data channels**: named topics opened dynamically per negotiated
//!   representation, carrying encoded payload bytes (tokio broadcast, depth
//!   from the requested [`ChannelQuality`]).
//!
//! The bus is the default in-process collaborator; it owns no negotiation
//! state and never inspects payload bytes.

use crate::error::{Error, Result};
use crate::negotiation::{Advertisement, Decision};
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};

/// Delivery parameters for one concrete data channel.
///
/// Supplied by the coordinator requesting the channel, not fixed by the core:
/// different representations may warrant different delivery guarantees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelQuality {
    /// Bounded depth of the channel.
    pub capacity: usize,
    /// Whether delivery should favor reliability over freshness. The
    /// in-process bus drops the oldest payloads on overflow either way; the
    /// flag is carried for transports that distinguish.
    pub reliable: bool,
}

impl Default for ChannelQuality {
    fn default() -> Self {
        Self {
            capacity: 64,
            reliable: true,
        }
    }
}

/// Address of a concrete data channel plus its quality parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDescriptor {
    /// Topic the channel lives on.
    pub topic: String,
    /// Delivery parameters requested for the channel.
    pub quality: ChannelQuality,
}

impl ChannelDescriptor {
    /// Create a descriptor for `topic` with the given quality.
    pub fn new(topic: impl Into<String>, quality: ChannelQuality) -> Self {
        Self {
            topic: topic.into(),
            quality,
        }
    }
}

struct BusInner {
    topics: HashMap<String, broadcast::Sender<Bytes>>,
    denied: HashSet<String>,
}

/// In-process bus carrying one logical stream's control and data traffic.
pub struct Bus {
    inner: Mutex<BusInner>,
    ad_tx: kanal::Sender<Advertisement>,
    ad_rx: kanal::Receiver<Advertisement>,
    decision_tx: watch::Sender<Option<Decision>>,
}

impl Bus {
    /// Create a bus for one logical stream.
    pub fn new() -> Arc<Self> {
        let (ad_tx, ad_rx) = kanal::unbounded();
        let (decision_tx, _) = watch::channel(None);
        Arc::new(Self {
            inner: Mutex::new(BusInner {
                topics: HashMap::new(),
                denied: HashSet::new(),
            }),
            ad_tx,
            ad_rx,
            decision_tx,
        })
    }

    /// Consumer side: deliver an advertisement to the producer.
    pub fn send_advertisement(&self, ad: Advertisement) -> Result<()> {
        self.ad_tx.send(ad).map_err(|_| Error::Shutdown)
    }

    /// Producer side: the receive half of the advertisement channel.
    pub fn advertisement_receiver(&self) -> kanal::Receiver<Advertisement> {
        self.ad_rx.clone()
    }

    /// Producer side: announce a decision, superseding the retained one.
    pub fn publish_decision(&self, decision: Decision) {
        self.decision_tx.send_replace(Some(decision));
    }

    /// Consumer side: watch the decision channel. The receiver immediately
    /// holds the latest retained decision, if one was ever published.
    pub fn decisions(&self) -> watch::Receiver<Option<Decision>> {
        self.decision_tx.subscribe()
    }

    /// The currently retained decision, if any.
    pub fn current_decision(&self) -> Option<Decision> {
        self.decision_tx.borrow().clone()
    }

    /// Open the producer half of a data topic, creating it if needed.
    pub fn open_data_tx(&self, descriptor: &ChannelDescriptor) -> Result<DataSender> {
        let mut inner = self.lock();
        if inner.denied.contains(&descriptor.topic) {
            return Err(Error::ChannelOpen {
                topic: descriptor.topic.clone(),
                reason: "transport refused the topic".into(),
            });
        }
        let tx = inner
            .topics
            .entry(descriptor.topic.clone())
            .or_insert_with(|| broadcast::channel(descriptor.quality.capacity.max(1)).0)
            .clone();
        Ok(DataSender {
            topic: descriptor.topic.clone(),
            tx,
        })
    }

    /// Open the consumer half of a data topic, creating it if needed.
    ///
    /// Creating on attach covers the race where a consumer acts on a decision
    /// before the producer's topic insertion is visible.
    pub fn open_data_rx(&self, descriptor: &ChannelDescriptor) -> Result<DataReceiver> {
        let mut inner = self.lock();
        if inner.denied.contains(&descriptor.topic) {
            return Err(Error::ChannelOpen {
                topic: descriptor.topic.clone(),
                reason: "transport refused the topic".into(),
            });
        }
        let rx = inner
            .topics
            .entry(descriptor.topic.clone())
            .or_insert_with(|| broadcast::channel(descriptor.quality.capacity.max(1)).0)
            .subscribe();
        Ok(DataReceiver {
            topic: descriptor.topic.clone(),
            rx,
        })
    }

    /// Retire a data topic. Attached receivers observe the channel closing
    /// once the last producer-held sender is dropped.
    pub fn close_data(&self, topic: &str) {
        self.lock().topics.remove(topic);
    }

    /// Number of currently open data topics.
    pub fn data_topic_count(&self) -> usize {
        self.lock().topics.len()
    }

    /// Whether a data topic is currently open.
    pub fn has_data_topic(&self, topic: &str) -> bool {
        self.lock().topics.contains_key(topic)
    }

    /// Refuse all subsequent opens of `topic`.
    ///
    /// Fault injection for exercising channel-open failure handling; a real
    /// transport produces the same condition on its own.
    pub fn deny_topic(&self, topic: impl Into<String>) {
        self.lock().denied.insert(topic.into());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusInner> {
        // Lock holders never panic while holding the guard.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Producer half of one data topic.
#[derive(Clone, Debug)]
pub struct DataSender {
    topic: String,
    tx: broadcast::Sender<Bytes>,
}

impl DataSender {
    /// Send an encoded payload.
    ///
    /// Returns the number of receivers that got it; zero when nobody is
    /// attached, which is not an error.
    pub fn send(&self, payload: Bytes) -> usize {
        self.tx.send(payload).unwrap_or(0)
    }

    /// Topic this sender writes to.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Number of currently attached receivers.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Consumer half of one data topic.
pub struct DataReceiver {
    topic: String,
    rx: broadcast::Receiver<Bytes>,
}

impl DataReceiver {
    /// Receive the next payload.
    ///
    /// Returns `None` once the channel is closed. Payloads missed due to
    /// overflow are skipped; the system favors freshness over buffering.
    pub async fn recv(&mut self) -> Option<Bytes> {
        loop {
            match self.rx.recv().await {
                Ok(payload) => return Some(payload),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(topic = %self.topic, skipped, "data receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Topic this receiver reads from.
    pub fn topic(&self) -> &str {
        &self.topic
    }
}
