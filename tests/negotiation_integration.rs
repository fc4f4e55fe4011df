//! Integration tests driving a publisher and real subscribers end to end.

use bytes::Bytes;
use concord::bus::{Bus, ChannelQuality};
use concord::key::TypeKey;
use concord::publisher::{NegotiatedPublisher, PublisherState};
use concord::subscriber::{Decoder, Handler, NegotiatedSubscriber, SubscriberOptions};
use concord::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn key(name: &str) -> TypeKey {
    TypeKey::new(name, "raw")
}

fn string_encoder() -> Arc<dyn Fn(&String) -> Result<Bytes> + Send + Sync> {
    Arc::new(|p: &String| Ok(Bytes::from(p.clone())))
}

fn string_decoder() -> Decoder<String> {
    Arc::new(|bytes: &[u8]| {
        String::from_utf8(bytes.to_vec()).map_err(|e| Error::Codec {
            key: "string".into(),
            reason: e.to_string(),
        })
    })
}

fn collecting_handler() -> (Handler<String>, kanal::AsyncReceiver<String>) {
    let (tx, rx) = kanal::unbounded();
    let handler: Handler<String> = Arc::new(move |payload| {
        let _ = tx.send(payload);
    });
    (handler, rx.to_async())
}

fn subscriber(
    bus: &Arc<Bus>,
    entries: &[(&str, f64)],
) -> (NegotiatedSubscriber<String>, kanal::AsyncReceiver<String>) {
    let mut sub = NegotiatedSubscriber::new(Arc::clone(bus));
    let (handler, rx) = collecting_handler();
    for (name, weight) in entries {
        sub.add_candidate(
            key(name),
            *weight,
            ChannelQuality::default(),
            string_decoder(),
            Arc::clone(&handler),
        )
        .unwrap();
    }
    (sub, rx)
}

/// Producer {a: 2, b: 1}; consumer-1 {a: 1}, consumer-2 {b: 5}. The product
/// scoring must pick b (1*5 over 2*1), and payloads must reach consumer-2
/// decoded.
#[tokio::test]
async fn test_product_scoring_end_to_end() {
    let bus = Bus::new();
    let publisher = NegotiatedPublisher::new(Arc::clone(&bus), "s");
    publisher.register_type(key("a"), 2.0, string_encoder()).unwrap();
    publisher.register_type(key("b"), 1.0, string_encoder()).unwrap();

    let (sub1, _rx1) = subscriber(&bus, &[("a", 1.0)]);
    let (sub2, rx2) = subscriber(&bus, &[("b", 5.0)]);
    let handle1 = sub1.start();
    let handle2 = sub2.start();

    let mut attachments = handle2.attachments();
    timeout(WAIT, attachments.wait_for(|k| k.as_ref() == Some(&key("b"))))
        .await
        .expect("timed out waiting for consumer-2 attach")
        .expect("attachment channel closed");
    assert_eq!(publisher.decision().unwrap().key(), Some(&key("b")));

    // Consumer-1 cannot decode b and must stay detached.
    assert!(!handle1.is_attached());

    publisher.publish("frame-1".to_string()).unwrap();
    let payload = timeout(WAIT, rx2.recv())
        .await
        .expect("timed out waiting for payload")
        .expect("handler channel closed");
    assert_eq!(payload, "frame-1");
}

/// When the consumer holding up the winner detaches, the producer must
/// renegotiate and the remaining consumer must end up attached and receiving.
#[tokio::test]
async fn test_detach_renegotiates_to_remaining_consumer() {
    let bus = Bus::new();
    let publisher = NegotiatedPublisher::new(Arc::clone(&bus), "s");
    publisher.register_type(key("a"), 2.0, string_encoder()).unwrap();
    publisher.register_type(key("b"), 1.0, string_encoder()).unwrap();

    let (sub1, rx1) = subscriber(&bus, &[("a", 1.0)]);
    let (sub2, _rx2) = subscriber(&bus, &[("b", 5.0)]);
    let handle1 = sub1.start();
    let handle2 = sub2.start();

    let mut attachments2 = handle2.attachments();
    timeout(WAIT, attachments2.wait_for(|k| k.is_some()))
        .await
        .expect("timed out waiting for consumer-2 attach")
        .expect("attachment channel closed");

    handle2.detach();

    // The farewell reaches the producer promptly; a wins the re-run and
    // consumer-1 attaches to it.
    let mut attachments1 = handle1.attachments();
    timeout(WAIT, attachments1.wait_for(|k| k.as_ref() == Some(&key("a"))))
        .await
        .expect("timed out waiting for consumer-1 attach")
        .expect("attachment channel closed");
    assert_eq!(publisher.decision().unwrap().key(), Some(&key("a")));

    publisher.publish("frame-2".to_string()).unwrap();
    let payload = timeout(WAIT, rx1.recv())
        .await
        .expect("timed out waiting for payload")
        .expect("handler channel closed");
    assert_eq!(payload, "frame-2");
}

/// No overlap between sides: the publisher announces no-agreement, publishing
/// is accepted but transmits nothing, and the subscriber stays detached.
#[tokio::test]
async fn test_no_overlap_yields_no_agreement() {
    let bus = Bus::new();
    let publisher = NegotiatedPublisher::new(Arc::clone(&bus), "s");
    publisher.register_type(key("c"), 1.0, string_encoder()).unwrap();

    let (sub, rx) = subscriber(&bus, &[("a", 1.0)]);
    let handle = sub.start();

    let mut decisions = bus.decisions();
    let decision = timeout(WAIT, decisions.wait_for(|d| d.is_some()))
        .await
        .expect("timed out waiting for decision")
        .expect("decision channel closed")
        .clone()
        .unwrap();
    assert!(decision.is_no_agreement());
    assert!(!handle.is_attached());

    publisher.publish("lost".to_string()).unwrap();
    assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    assert_eq!(bus.data_topic_count(), 0);
}

/// A subscriber that starts after negotiation completed must pick up the
/// retained decision and start receiving without any new announcement.
#[tokio::test]
async fn test_late_subscriber_observes_retained_decision() {
    let bus = Bus::new();
    let publisher = NegotiatedPublisher::new(Arc::clone(&bus), "s");
    publisher.register_type(key("a"), 1.0, string_encoder()).unwrap();

    let (sub1, _rx1) = subscriber(&bus, &[("a", 1.0)]);
    let handle1 = sub1.start();
    let mut attachments1 = handle1.attachments();
    timeout(WAIT, attachments1.wait_for(|k| k.is_some()))
        .await
        .expect("timed out waiting for first attach")
        .expect("attachment channel closed");
    let seq_before = publisher.decision().unwrap().seq;

    let (sub2, rx2) = subscriber(&bus, &[("a", 1.0)]);
    let handle2 = sub2.start();
    let mut attachments2 = handle2.attachments();
    timeout(WAIT, attachments2.wait_for(|k| k.as_ref() == Some(&key("a"))))
        .await
        .expect("timed out waiting for late attach")
        .expect("attachment channel closed");

    // Same winner, same decision: reinforcing it publishes nothing new.
    assert_eq!(publisher.decision().unwrap().seq, seq_before);

    publisher.publish("frame-3".to_string()).unwrap();
    let payload = timeout(WAIT, rx2.recv())
        .await
        .expect("timed out waiting for payload")
        .expect("handler channel closed");
    assert_eq!(payload, "frame-3");
}

/// A consumer arriving with a strictly better candidate flips the decision;
/// the previously attached consumer that also supports the new winner follows
/// it without losing payload flow for long.
#[tokio::test]
async fn test_better_candidate_flips_decision() {
    let bus = Bus::new();
    let publisher = NegotiatedPublisher::new(Arc::clone(&bus), "s");
    publisher.register_type(key("a"), 1.0, string_encoder()).unwrap();
    publisher.register_type(key("b"), 1.0, string_encoder()).unwrap();

    // Supports both; initially only a is in play.
    let (sub1, rx1) = subscriber(&bus, &[("a", 1.0), ("b", 1.0)]);
    let handle1 = sub1.start();
    let mut attachments1 = handle1.attachments();
    timeout(WAIT, attachments1.wait_for(|k| k.as_ref() == Some(&key("a"))))
        .await
        .expect("timed out waiting for attach to a")
        .expect("attachment channel closed");

    // A heavyweight b supporter arrives; b now scores 1*(1+10).
    let (sub2, _rx2) = subscriber(&bus, &[("b", 10.0)]);
    let _handle2 = sub2.start();

    timeout(WAIT, attachments1.wait_for(|k| k.as_ref() == Some(&key("b"))))
        .await
        .expect("timed out waiting for re-attach to b")
        .expect("attachment channel closed");

    publisher.publish("frame-4".to_string()).unwrap();
    let payload = timeout(WAIT, rx1.recv())
        .await
        .expect("timed out waiting for payload")
        .expect("handler channel closed");
    assert_eq!(payload, "frame-4");
}

/// Subscribers refreshing their advertisements keep the producer's liveness
/// tracking satisfied; a detached handle stops refreshing and eventually
/// expires, driving the producer back to idle.
#[tokio::test]
async fn test_liveness_expiry_after_detach() {
    let bus = Bus::new();
    let publisher = NegotiatedPublisher::with_options(
        Arc::clone(&bus),
        "s",
        concord::publisher::PublisherOptions {
            liveness_timeout: Duration::from_millis(300),
            sweep_interval: Duration::from_millis(50),
            ..Default::default()
        },
    );
    publisher.register_type(key("a"), 1.0, string_encoder()).unwrap();

    let mut sub = NegotiatedSubscriber::with_options(
        Arc::clone(&bus),
        SubscriberOptions {
            refresh_interval: Duration::from_millis(50),
            ..Default::default()
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

    let mut states = publisher.state_changes();
    timeout(WAIT, states.wait_for(|s| *s == PublisherState::Negotiated))
        .await
        .expect("timed out waiting for negotiation")
        .expect("state channel closed");

    // Outlive the liveness timeout while the subscriber keeps refreshing.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(publisher.state(), PublisherState::Negotiated);
    assert_eq!(publisher.attached_consumers(), 1);

    // Dropping the handle detaches; the farewell removes the consumer.
    drop(handle);
    let mut states = publisher.state_changes();
    timeout(WAIT, states.wait_for(|s| *s == PublisherState::Idle))
        .await
        .expect("timed out waiting for idle")
        .expect("state channel closed");
    assert_eq!(publisher.attached_consumers(), 0);
}
