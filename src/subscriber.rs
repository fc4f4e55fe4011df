//! Consumer-side negotiation coordinator.
//!
//! A [`NegotiatedSubscriber`] collects the representations this consumer can
//! decode, advertises them (and keeps re-advertising so the producer's
//! liveness tracking sees it), follows the producer's decision stream, and
//! swaps the concrete data channel whenever the winning representation
//! changes. Decoded payloads go to the handler registered for the winning
//! key.

use crate::bus::{Bus, ChannelDescriptor, ChannelQuality, DataReceiver};
use crate::error::Result;
use crate::key::TypeKey;
use crate::negotiation::{Advertisement, ConsumerId, Decision, Outcome};
use crate::observability;
use crate::support::SupportedTypeMap;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Decode capability registered per type key.
pub type Decoder<P> = Arc<dyn Fn(&[u8]) -> Result<P> + Send + Sync>;

/// Payload handler invoked for every decoded payload of the negotiated type.
pub type Handler<P> = Arc<dyn Fn(P) + Send + Sync>;

/// Lifecycle of a subscriber, per producer it tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    /// Preferences sent, no usable decision yet.
    Advertised,
    /// A decision was received and the concrete channel is open.
    Attached,
    /// Explicitly shut down.
    Detached,
}

/// Configuration for a [`NegotiatedSubscriber`].
#[derive(Debug, Clone)]
pub struct SubscriberOptions {
    /// How often the advertisement is re-sent so the producer's liveness
    /// tracking keeps seeing this consumer.
    pub refresh_interval: Duration,
    /// On renegotiation, keep the existing attachment when the new decision
    /// carries the key we are already attached to.
    pub keep_existing_match: bool,
    /// On a no-agreement decision, drop the attachment (`true`) or keep the
    /// last channel open until a future decision supersedes it (`false`).
    pub disconnect_on_no_agreement: bool,
}

impl Default for SubscriberOptions {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_millis(500),
            keep_existing_match: true,
            disconnect_on_no_agreement: true,
        }
    }
}

struct ConsumerCapability<P> {
    decoder: Decoder<P>,
    handler: Handler<P>,
    quality: ChannelQuality,
}

/// Builder for a consumer-side coordinator.
///
/// Register candidates with [`add_candidate`](Self::add_candidate), then call
/// [`start`](Self::start) to advertise and begin tracking decisions.
pub struct NegotiatedSubscriber<P> {
    bus: Arc<Bus>,
    options: SubscriberOptions,
    consumer_id: ConsumerId,
    supported: SupportedTypeMap<ConsumerCapability<P>>,
}

impl<P: Send + 'static> NegotiatedSubscriber<P> {
    /// Create a subscriber on `bus` with default options.
    pub fn new(bus: Arc<Bus>) -> Self {
        Self::with_options(bus, SubscriberOptions::default())
    }

    /// Create a subscriber with explicit options.
    pub fn with_options(bus: Arc<Bus>, options: SubscriberOptions) -> Self {
        Self {
            bus,
            options,
            consumer_id: ConsumerId::allocate(),
            supported: SupportedTypeMap::new(),
        }
    }

    /// This consumer's identity, stable for the lifetime of the attachment.
    pub fn consumer_id(&self) -> ConsumerId {
        self.consumer_id
    }

    /// Register a representation this consumer can decode.
    ///
    /// `weight` expresses strength of preference; `quality` sets the delivery
    /// parameters for the data channel if this representation wins (different
    /// representations may warrant different guarantees). The handler is
    /// invoked for every payload decoded after this key is negotiated.
    pub fn add_candidate(
        &mut self,
        key: TypeKey,
        weight: f64,
        quality: ChannelQuality,
        decoder: Decoder<P>,
        handler: Handler<P>,
    ) -> Result<()> {
        self.supported.register(
            key,
            weight,
            ConsumerCapability {
                decoder,
                handler,
                quality,
            },
        )
    }

    /// Advertise the registered candidates and begin tracking decisions.
    ///
    /// Spawns the coordinator task; must be called from a tokio runtime.
    pub fn start(self) -> SubscriptionHandle {
        let (cmd_tx, cmd_rx) = kanal::unbounded();
        let (state_tx, state_rx) = watch::channel(SubscriberState::Advertised);
        let (attached_tx, attached_rx) = watch::channel(None);
        let consumer_id = self.consumer_id;

        let actor = SubActor {
            bus: self.bus,
            options: self.options,
            consumer_id,
            supported: self.supported,
            ad_seq: 0,
            last_decision_seq: None,
            attachment: None,
            state: SubscriberState::Advertised,
            state_tx,
            attached_tx,
        };
        tokio::spawn(actor.run(cmd_rx.to_async()));

        SubscriptionHandle {
            consumer_id,
            cmd_tx,
            state_rx,
            attached_rx,
        }
    }
}

enum SubCommand {
    Detach,
}

/// Handle to a running consumer-side coordinator.
///
/// Dropping the handle detaches the consumer.
pub struct SubscriptionHandle {
    consumer_id: ConsumerId,
    cmd_tx: kanal::Sender<SubCommand>,
    state_rx: watch::Receiver<SubscriberState>,
    attached_rx: watch::Receiver<Option<TypeKey>>,
}

impl SubscriptionHandle {
    /// This consumer's identity.
    pub fn consumer_id(&self) -> ConsumerId {
        self.consumer_id
    }

    /// Current subscriber state.
    pub fn state(&self) -> SubscriberState {
        *self.state_rx.borrow()
    }

    /// Watch subscriber state transitions.
    pub fn state_changes(&self) -> watch::Receiver<SubscriberState> {
        self.state_rx.clone()
    }

    /// The key currently attached, if any.
    pub fn attached_key(&self) -> Option<TypeKey> {
        self.attached_rx.borrow().clone()
    }

    /// Watch attachment changes.
    pub fn attachments(&self) -> watch::Receiver<Option<TypeKey>> {
        self.attached_rx.clone()
    }

    /// Whether a concrete data channel is currently open.
    pub fn is_attached(&self) -> bool {
        self.attached_rx.borrow().is_some()
    }

    /// Detach: stop refreshing the advertisement, close the data channel and
    /// tell the producer to drop this consumer's contribution.
    pub fn detach(&self) {
        let _ = self.cmd_tx.send(SubCommand::Detach);
    }
}

struct Attachment<P> {
    key: TypeKey,
    rx: DataReceiver,
    decoder: Decoder<P>,
    handler: Handler<P>,
}

struct SubActor<P> {
    bus: Arc<Bus>,
    options: SubscriberOptions,
    consumer_id: ConsumerId,
    supported: SupportedTypeMap<ConsumerCapability<P>>,
    ad_seq: u64,
    last_decision_seq: Option<u64>,
    attachment: Option<Attachment<P>>,
    state: SubscriberState,
    state_tx: watch::Sender<SubscriberState>,
    attached_tx: watch::Sender<Option<TypeKey>>,
}

impl<P: Send + 'static> SubActor<P> {
    async fn run(mut self, cmd_rx: kanal::AsyncReceiver<SubCommand>) {
        let mut decisions = self.bus.decisions();
        self.advertise();

        // A decision retained from before this consumer attached still
        // applies (late joiners must observe the current decision).
        let current = decisions.borrow_and_update().clone();
        if let Some(decision) = current {
            self.on_decision(decision);
        }

        let mut refresh = tokio::time::interval(self.options.refresh_interval);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        // Detach on command or when every handle is dropped.
                        Ok(SubCommand::Detach) | Err(_) => break,
                    }
                }
                changed = decisions.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let decision = decisions.borrow_and_update().clone();
                    if let Some(decision) = decision {
                        self.on_decision(decision);
                    }
                }
                _ = refresh.tick() => self.advertise(),
                payload = Self::recv_attached(&mut self.attachment) => {
                    match payload {
                        Some(bytes) => self.dispatch(&bytes),
                        None => {
                            // Producer retired this channel; the decision
                            // superseding it arrives via the watch.
                            self.drop_attachment();
                        }
                    }
                }
            }
        }

        self.finish();
    }

    async fn recv_attached(attachment: &mut Option<Attachment<P>>) -> Option<Bytes> {
        match attachment {
            Some(attachment) => attachment.rx.recv().await,
            None => std::future::pending().await,
        }
    }

    fn on_decision(&mut self, decision: Decision) {
        // Decisions are monotonically sequenced; never apply an older one
        // after a newer one.
        if self.last_decision_seq.is_some_and(|last| decision.seq <= last) {
            return;
        }
        self.last_decision_seq = Some(decision.seq);

        match decision.outcome {
            Outcome::NoAgreement => {
                tracing::debug!(consumer = %self.consumer_id, "no representation available");
                if self.options.disconnect_on_no_agreement {
                    self.drop_attachment();
                }
            }
            Outcome::Selected { key, channel } => self.attach(key, channel),
        }
    }

    fn attach(&mut self, key: TypeKey, channel: ChannelDescriptor) {
        if self.options.keep_existing_match
            && self.attachment.as_ref().is_some_and(|a| a.key == key)
        {
            // Renegotiation kept our representation; no churn.
            return;
        }

        // Break-before-make: decoding with a capability keyed to anything but
        // the newest decision is unsafe, so the old channel goes first.
        self.drop_attachment();

        let Some(entry) = self.supported.lookup(&key) else {
            tracing::debug!(consumer = %self.consumer_id, %key, "negotiated type not locally supported");
            return;
        };
        let descriptor = ChannelDescriptor::new(
            channel.topic.clone(),
            entry.capability.quality.clone(),
        );
        match self.bus.open_data_rx(&descriptor) {
            Ok(rx) => {
                self.attachment = Some(Attachment {
                    key: key.clone(),
                    rx,
                    decoder: Arc::clone(&entry.capability.decoder),
                    handler: Arc::clone(&entry.capability.handler),
                });
                self.set_state(SubscriberState::Attached);
                self.attached_tx.send_replace(Some(key.clone()));
                tracing::info!(consumer = %self.consumer_id, %key, "attached to negotiated channel");
            }
            Err(error) => {
                tracing::warn!(consumer = %self.consumer_id, %key, %error, "data channel open failed");
            }
        }
    }

    fn dispatch(&mut self, bytes: &Bytes) {
        let Some(attachment) = &self.attachment else {
            return;
        };
        match (attachment.decoder)(bytes) {
            Ok(payload) => {
                (attachment.handler)(payload);
                observability::record_payload_dispatched(&self.consumer_id.to_string());
            }
            Err(error) => {
                observability::record_decode_failure(&self.consumer_id.to_string());
                tracing::warn!(
                    consumer = %self.consumer_id, key = %attachment.key, %error,
                    "payload decode failed"
                );
            }
        }
    }

    fn advertise(&mut self) {
        self.ad_seq += 1;
        let ad = Advertisement {
            consumer_id: self.consumer_id,
            seq: self.ad_seq,
            entries: self.supported.weights(),
        };
        if self.bus.send_advertisement(ad).is_err() {
            tracing::debug!(consumer = %self.consumer_id, "advertisement channel closed");
        }
    }

    fn drop_attachment(&mut self) {
        if self.attachment.take().is_some() {
            self.set_state(SubscriberState::Advertised);
            self.attached_tx.send_replace(None);
        }
    }

    fn finish(&mut self) {
        self.drop_attachment();
        // Farewell: an empty advertisement tells the producer to remove this
        // consumer's contribution without waiting for liveness expiry.
        self.ad_seq += 1;
        let _ = self.bus.send_advertisement(Advertisement {
            consumer_id: self.consumer_id,
            seq: self.ad_seq,
            entries: Vec::new(),
        });
        self.set_state(SubscriberState::Detached);
        tracing::debug!(consumer = %self.consumer_id, "subscriber detached");
    }

    fn set_state(&mut self, state: SubscriberState) {
        if self.state != state {
            tracing::debug!(consumer = %self.consumer_id, from = ?self.state, to = ?state, "subscriber state changed");
            self.state = state;
            self.state_tx.send_replace(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn key(name: &str) -> TypeKey {
        TypeKey::new(name, "raw")
    }

    fn string_decoder() -> Decoder<String> {
        Arc::new(|bytes: &[u8]| {
            String::from_utf8(bytes.to_vec()).map_err(|e| Error::Codec {
                key: "string".into(),
                reason: e.to_string(),
            })
        })
    }

    fn collecting_handler() -> (Handler<String>, kanal::Receiver<String>) {
        let (tx, rx) = kanal::unbounded();
        let handler: Handler<String> = Arc::new(move |payload| {
            let _ = tx.send(payload);
        });
        (handler, rx)
    }

    fn subscriber_with_candidate(
        bus: &Arc<Bus>,
        name: &str,
        weight: f64,
    ) -> (NegotiatedSubscriber<String>, kanal::Receiver<String>) {
        let mut sub = NegotiatedSubscriber::new(Arc::clone(bus));
        let (handler, rx) = collecting_handler();
        sub.add_candidate(
            key(name),
            weight,
            ChannelQuality::default(),
            string_decoder(),
            handler,
        )
        .unwrap();
        (sub, rx)
    }

    #[tokio::test]
    async fn test_start_sends_weighted_advertisement() {
        let bus = Bus::new();
        let ad_rx = bus.advertisement_receiver();

        let (sub, _payloads) = subscriber_with_candidate(&bus, "a", 2.5);
        let id = sub.consumer_id();
        let _handle = sub.start();

        let ad = timeout(WAIT, async { ad_rx.as_async().recv().await })
            .await
            .expect("timed out")
            .expect("advertisement channel closed");
        assert_eq!(ad.consumer_id, id);
        assert_eq!(ad.entries, vec![(key("a"), 2.5)]);
        assert!(!ad.is_farewell());
    }

    #[tokio::test]
    async fn test_retained_decision_attaches_late_joiner() {
        let bus = Bus::new();
        let descriptor = ChannelDescriptor::new("s/a+raw", ChannelQuality::default());
        let data_tx = bus.open_data_tx(&descriptor).unwrap();
        bus.publish_decision(Decision {
            seq: 1,
            outcome: Outcome::Selected {
                key: key("a"),
                channel: descriptor,
            },
        });

        let (sub, payloads) = subscriber_with_candidate(&bus, "a", 1.0);
        let handle = sub.start();

        let mut attachments = handle.attachments();
        timeout(WAIT, attachments.wait_for(|k| k.as_ref() == Some(&key("a"))))
            .await
            .expect("timed out waiting for attach")
            .expect("attachment channel closed");
        assert_eq!(handle.state(), SubscriberState::Attached);

        data_tx.send(Bytes::from_static(b"hello"));
        let payload = timeout(WAIT, async { payloads.as_async().recv().await })
            .await
            .expect("timed out waiting for payload")
            .expect("handler channel closed");
        assert_eq!(payload, "hello");
    }

    #[tokio::test]
    async fn test_unsupported_decision_leaves_subscriber_advertised() {
        let bus = Bus::new();
        bus.publish_decision(Decision {
            seq: 1,
            outcome: Outcome::Selected {
                key: key("b"),
                channel: ChannelDescriptor::new("s/b+raw", ChannelQuality::default()),
            },
        });

        let (sub, _payloads) = subscriber_with_candidate(&bus, "a", 1.0);
        let handle = sub.start();

        // Give the actor a moment to process the retained decision.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.state(), SubscriberState::Advertised);
        assert!(!handle.is_attached());
    }

    #[tokio::test]
    async fn test_detach_sends_farewell() {
        let bus = Bus::new();
        let ad_rx = bus.advertisement_receiver().to_async();

        let (sub, _payloads) = subscriber_with_candidate(&bus, "a", 1.0);
        let id = sub.consumer_id();
        let handle = sub.start();

        let first = timeout(WAIT, ad_rx.recv()).await.unwrap().unwrap();
        assert!(!first.is_farewell());

        handle.detach();
        let mut states = handle.state_changes();
        timeout(WAIT, states.wait_for(|s| *s == SubscriberState::Detached))
            .await
            .expect("timed out waiting for detach")
            .expect("state channel closed");

        // The last advertisement on the wire is the farewell.
        let mut last = None;
        while let Ok(Some(ad)) = ad_rx.try_recv() {
            last = Some(ad);
        }
        let last = last.expect("no farewell seen");
        assert_eq!(last.consumer_id, id);
        assert!(last.is_farewell());
    }

    #[tokio::test]
    async fn test_no_agreement_disconnects_by_default() {
        let bus = Bus::new();
        let descriptor = ChannelDescriptor::new("s/a+raw", ChannelQuality::default());
        let _data_tx = bus.open_data_tx(&descriptor).unwrap();
        bus.publish_decision(Decision {
            seq: 1,
            outcome: Outcome::Selected {
                key: key("a"),
                channel: descriptor,
            },
        });

        let (sub, _payloads) = subscriber_with_candidate(&bus, "a", 1.0);
        let handle = sub.start();
        let mut attachments = handle.attachments();
        timeout(WAIT, attachments.wait_for(|k| k.is_some()))
            .await
            .expect("timed out waiting for attach")
            .expect("attachment channel closed");

        bus.publish_decision(Decision {
            seq: 2,
            outcome: Outcome::NoAgreement,
        });
        timeout(WAIT, attachments.wait_for(|k| k.is_none()))
            .await
            .expect("timed out waiting for disconnect")
            .expect("attachment channel closed");
        assert_eq!(handle.state(), SubscriberState::Advertised);
    }

    #[tokio::test]
    async fn test_no_agreement_keeps_attachment_when_configured() {
        let bus = Bus::new();
        let descriptor = ChannelDescriptor::new("s/a+raw", ChannelQuality::default());
        let _data_tx = bus.open_data_tx(&descriptor).unwrap();
        bus.publish_decision(Decision {
            seq: 1,
            outcome: Outcome::Selected {
                key: key("a"),
                channel: descriptor,
            },
        });

        let mut sub = NegotiatedSubscriber::with_options(
            Arc::clone(&bus),
            SubscriberOptions {
                disconnect_on_no_agreement: false,
                ..SubscriberOptions::default()
            },
        );
        let (handler, _rx) = collecting_handler();
        sub.add_candidate(
            key("a"),
            1.0,
            ChannelQuality::default(),
            string_decoder(),
            handler,
        )
        .unwrap();
        let handle = sub.start();

        let mut attachments = handle.attachments();
        timeout(WAIT, attachments.wait_for(|k| k.is_some()))
            .await
            .expect("timed out waiting for attach")
            .expect("attachment channel closed");

        bus.publish_decision(Decision {
            seq: 2,
            outcome: Outcome::NoAgreement,
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.is_attached());
    }
}
