//! Producer-side negotiation coordinator.
//!
//! A [`NegotiatedPublisher`] owns the producer's supported-type registry and
//! the aggregated preference table, runs the negotiation pass whenever
//! membership or registrations change, announces decisions on the bus, and
//! routes published payloads to the currently negotiated representation.
//!
//! The coordinator is a single actor task: application calls and control
//! message arrival both feed its queue, so every pass sees a consistent view
//! without explicit locking, and several triggers arriving close together
//! collapse into one pass.

use crate::bus::{Bus, ChannelDescriptor, ChannelQuality, DataSender};
use crate::error::{Error, Result};
use crate::key::TypeKey;
use crate::negotiation::{
    select_excluding, Advertisement, Decision, Outcome, PreferenceTable, Selection,
};
use crate::observability;
use crate::support::SupportedTypeMap;
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Encode capability registered per type key.
///
/// The core never inspects payload bytes itself; it only invokes this.
pub type Encoder<P> = Arc<dyn Fn(&P) -> Result<Bytes> + Send + Sync>;

/// Lifecycle of a publisher coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherState {
    /// No consumers known.
    Idle,
    /// Advertisements are present but the decision is pending or stale.
    Negotiating,
    /// A current decision exists and is being served.
    Negotiated,
    /// The coordinator was disposed; all channels are closed.
    Shutdown,
}

/// Configuration for a [`NegotiatedPublisher`].
#[derive(Debug, Clone)]
pub struct PublisherOptions {
    /// Advertisements older than this are treated as an implicit departure.
    pub liveness_timeout: Duration,
    /// How often the liveness sweep runs.
    pub sweep_interval: Duration,
    /// Quality applied to the data channels this publisher opens.
    pub channel_quality: ChannelQuality,
}

impl Default for PublisherOptions {
    fn default() -> Self {
        Self {
            liveness_timeout: Duration::from_secs(2),
            sweep_interval: Duration::from_millis(500),
            channel_quality: ChannelQuality::default(),
        }
    }
}

enum Command<P> {
    RegisterType {
        key: TypeKey,
        weight: f64,
        encoder: Encoder<P>,
    },
    Publish(P),
    Shutdown,
}

/// Handle to a producer-side negotiation coordinator.
///
/// Dropping the handle shuts the coordinator down.
pub struct NegotiatedPublisher<P> {
    cmd_tx: kanal::Sender<Command<P>>,
    state_rx: watch::Receiver<PublisherState>,
    consumers_rx: watch::Receiver<usize>,
    decision_rx: watch::Receiver<Option<Decision>>,
}

impl<P: Send + 'static> NegotiatedPublisher<P> {
    /// Create a publisher for `stream` on `bus` with default options.
    ///
    /// Spawns the coordinator task; must be called from a tokio runtime.
    pub fn new(bus: Arc<Bus>, stream: impl Into<String>) -> Self {
        Self::with_options(bus, stream, PublisherOptions::default())
    }

    /// Create a publisher with explicit options.
    pub fn with_options(bus: Arc<Bus>, stream: impl Into<String>, options: PublisherOptions) -> Self {
        let stream = stream.into();
        let (cmd_tx, cmd_rx) = kanal::unbounded();
        let (state_tx, state_rx) = watch::channel(PublisherState::Idle);
        let (consumers_tx, consumers_rx) = watch::channel(0);
        let decision_rx = bus.decisions();

        let actor = Actor {
            bus,
            stream,
            options,
            supported: SupportedTypeMap::new(),
            prefs: PreferenceTable::new(),
            state: PublisherState::Idle,
            decision_seq: 0,
            announced_no_agreement: false,
            active: None,
            pass_pending: false,
            excluded: HashSet::new(),
            state_tx,
            consumers_tx,
        };
        tokio::spawn(actor.run(cmd_rx.to_async()));

        Self {
            cmd_tx,
            state_rx,
            consumers_rx,
            decision_rx,
        }
    }

    /// Register (or replace) a representation this producer can emit.
    ///
    /// Weight validation happens synchronously; an invalid weight mutates
    /// nothing. Registering after negotiation has completed invalidates the
    /// current decision and triggers a re-negotiation pass.
    pub fn register_type(&self, key: TypeKey, weight: f64, encoder: Encoder<P>) -> Result<()> {
        if !weight.is_finite() || weight <= 0.0 {
            return Err(Error::InvalidWeight { weight });
        }
        self.cmd_tx
            .send(Command::RegisterType {
                key,
                weight,
                encoder,
            })
            .map_err(|_| Error::Shutdown)
    }

    /// Encode and send a payload on the negotiated channel.
    ///
    /// Valid only in the `Negotiated` state; otherwise the payload is
    /// silently dropped, not queued. There is no representation-agnostic way
    /// to buffer an un-encoded payload across renegotiation, so the system
    /// favors freshness over buffering.
    pub fn publish(&self, payload: P) -> Result<()> {
        self.cmd_tx
            .send(Command::Publish(payload))
            .map_err(|_| Error::Shutdown)
    }

    /// Current coordinator state.
    pub fn state(&self) -> PublisherState {
        *self.state_rx.borrow()
    }

    /// Watch coordinator state transitions.
    pub fn state_changes(&self) -> watch::Receiver<PublisherState> {
        self.state_rx.clone()
    }

    /// The most recently announced decision, if any.
    pub fn decision(&self) -> Option<Decision> {
        self.decision_rx.borrow().clone()
    }

    /// Number of consumers currently contributing preferences.
    pub fn attached_consumers(&self) -> usize {
        *self.consumers_rx.borrow()
    }

    /// Shut the coordinator down. New operations stop immediately; payloads
    /// already handed to the transport complete independently.
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }
}

struct ActiveChannel<P> {
    key: TypeKey,
    sender: DataSender,
    encoder: Encoder<P>,
}

struct Actor<P> {
    bus: Arc<Bus>,
    stream: String,
    options: PublisherOptions,
    supported: SupportedTypeMap<Encoder<P>>,
    prefs: PreferenceTable,
    state: PublisherState,
    decision_seq: u64,
    announced_no_agreement: bool,
    active: Option<ActiveChannel<P>>,
    pass_pending: bool,
    excluded: HashSet<TypeKey>,
    state_tx: watch::Sender<PublisherState>,
    consumers_tx: watch::Sender<usize>,
}

impl<P: Send + 'static> Actor<P> {
    async fn run(mut self, cmd_rx: kanal::AsyncReceiver<Command<P>>) {
        let ad_rx_sync = self.bus.advertisement_receiver();
        let ad_rx = ad_rx_sync.clone().to_async();
        let mut sweep = tokio::time::interval(self.options.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Ok(cmd) => {
                            if !self.handle_command(cmd) {
                                break;
                            }
                        }
                        // All handles dropped.
                        Err(_) => break,
                    }
                }
                ad = ad_rx.recv() => {
                    if let Ok(ad) = ad {
                        self.on_advertisement(ad);
                    }
                }
                _ = sweep.tick() => self.sweep_liveness(),
            }

            // Drain whatever is already queued so several membership events
            // collapse into a single negotiation pass.
            while let Ok(Some(ad)) = ad_rx_sync.try_recv() {
                self.on_advertisement(ad);
            }
            if self.pass_pending {
                self.pass_pending = false;
                self.run_negotiation();
            }
        }

        self.finish();
    }

    fn handle_command(&mut self, cmd: Command<P>) -> bool {
        match cmd {
            Command::RegisterType {
                key,
                weight,
                encoder,
            } => self.register_type(key, weight, encoder),
            Command::Publish(payload) => self.publish(payload),
            Command::Shutdown => return false,
        }
        true
    }

    fn register_type(&mut self, key: TypeKey, weight: f64, encoder: Encoder<P>) {
        // The handle validated the weight already; re-check is a no-op path.
        if let Err(error) = self.supported.register(key.clone(), weight, encoder) {
            tracing::warn!(stream = %self.stream, %key, %error, "type registration rejected");
            return;
        }
        tracing::debug!(stream = %self.stream, %key, weight, "producer type registered");
        self.excluded.clear();
        if !self.prefs.is_empty() {
            self.set_state(PublisherState::Negotiating);
            self.pass_pending = true;
        }
    }

    fn publish(&mut self, payload: P) {
        if self.state != PublisherState::Negotiated {
            observability::record_payload_dropped(&self.stream);
            tracing::trace!(stream = %self.stream, "payload dropped: no negotiated representation");
            return;
        }
        let Some(active) = &self.active else {
            observability::record_payload_dropped(&self.stream);
            return;
        };
        match (active.encoder)(&payload) {
            Ok(bytes) => {
                active.sender.send(bytes);
                observability::record_payload_published(&self.stream);
            }
            Err(error) => {
                observability::record_payload_dropped(&self.stream);
                tracing::warn!(stream = %self.stream, key = %active.key, %error, "payload encode failed");
            }
        }
    }

    fn on_advertisement(&mut self, ad: Advertisement) {
        let id = ad.consumer_id;
        if ad.is_farewell() {
            if self.prefs.remove(id) {
                tracing::info!(stream = %self.stream, consumer = %id, "consumer detached");
                self.on_membership_change();
            }
            return;
        }
        if self.prefs.apply_advertisement(ad) {
            observability::record_advertisement_applied(&self.stream);
            tracing::debug!(stream = %self.stream, consumer = %id, "advertisement applied");
            self.on_membership_change();
        } else {
            tracing::debug!(stream = %self.stream, consumer = %id, "stale advertisement discarded");
        }
    }

    fn sweep_liveness(&mut self) {
        let gone = self.prefs.expire_stale(self.options.liveness_timeout);
        if gone.is_empty() {
            return;
        }
        for id in &gone {
            observability::record_consumer_expired(&self.stream);
            tracing::info!(stream = %self.stream, consumer = %id, "consumer liveness expired");
        }
        self.on_membership_change();
    }

    /// Every membership event schedules exactly one more pass; the channel
    /// drain in `run` coalesces bursts.
    fn on_membership_change(&mut self) {
        self.excluded.clear();
        self.consumers_tx.send_replace(self.prefs.consumer_count());
        self.set_state(PublisherState::Negotiating);
        self.pass_pending = true;
    }

    fn run_negotiation(&mut self) {
        observability::record_negotiation_pass(&self.stream);
        let snapshot = self.prefs.snapshot();

        loop {
            match select_excluding(&self.supported, &snapshot, &self.excluded) {
                Selection::Winner(key) => {
                    if self.active.as_ref().is_some_and(|a| a.key == key) {
                        // Unchanged winner: keep serving the existing
                        // decision, no channel churn.
                        self.set_state(PublisherState::Negotiated);
                        return;
                    }

                    let descriptor = ChannelDescriptor::new(
                        format!("{}/{}", self.stream, key),
                        self.options.channel_quality.clone(),
                    );
                    let sender = match self.bus.open_data_tx(&descriptor) {
                        Ok(sender) => sender,
                        Err(error) => {
                            tracing::warn!(
                                stream = %self.stream, %key, %error,
                                "channel open failed, falling back to next candidate"
                            );
                            self.excluded.insert(key);
                            continue;
                        }
                    };
                    let Some(entry) = self.supported.lookup(&key) else {
                        self.excluded.insert(key);
                        continue;
                    };
                    let encoder = Arc::clone(&entry.capability);

                    // Make-before-break: the new channel is open and the new
                    // decision announced before the previous channel retires,
                    // so there is never a window with zero valid channels.
                    let previous = self.active.replace(ActiveChannel {
                        key: key.clone(),
                        sender,
                        encoder,
                    });
                    self.announce(Outcome::Selected {
                        key: key.clone(),
                        channel: descriptor,
                    });
                    if let Some(previous) = previous {
                        self.bus.close_data(previous.sender.topic());
                    }
                    self.set_state(PublisherState::Negotiated);
                    tracing::info!(stream = %self.stream, %key, "representation negotiated");
                    return;
                }
                Selection::NoAgreement => {
                    if let Some(previous) = self.active.take() {
                        self.bus.close_data(previous.sender.topic());
                    }
                    if !self.announced_no_agreement {
                        self.announce(Outcome::NoAgreement);
                        tracing::info!(stream = %self.stream, "no mutually supported representation");
                    }
                    self.set_state(if self.prefs.is_empty() {
                        PublisherState::Idle
                    } else {
                        PublisherState::Negotiating
                    });
                    return;
                }
            }
        }
    }

    fn announce(&mut self, outcome: Outcome) {
        self.announced_no_agreement = matches!(outcome, Outcome::NoAgreement);
        self.decision_seq += 1;
        self.bus.publish_decision(Decision {
            seq: self.decision_seq,
            outcome,
        });
        observability::record_decision_published(&self.stream);
    }

    fn finish(&mut self) {
        if let Some(active) = self.active.take() {
            self.bus.close_data(active.sender.topic());
        }
        self.set_state(PublisherState::Shutdown);
        tracing::debug!(stream = %self.stream, "publisher shut down");
    }

    fn set_state(&mut self, state: PublisherState) {
        if self.state != state {
            tracing::debug!(stream = %self.stream, from = ?self.state, to = ?state, "publisher state changed");
            self.state = state;
            self.state_tx.send_replace(state);
        }
    }
}
