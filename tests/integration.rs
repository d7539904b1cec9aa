//! Integration tests for the broker.

use courier::{
    Broker, BrokerConfig, BrokerError, Delivery, DeliveryMode, EnvelopeCodec, MessageId,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn at_least_once(timeout_ms: u64) -> Broker {
    init_tracing();
    Broker::new(BrokerConfig::at_least_once(Duration::from_millis(timeout_ms))).unwrap()
}

fn recv_envelope(handle: &courier::SubscriptionHandle) -> courier::Envelope {
    handle
        .recv_timeout(Duration::from_secs(2))
        .unwrap()
        .decode_envelope(EnvelopeCodec::Json)
        .unwrap()
}

// --- At-Most-Once ---

#[test]
fn test_fan_out_to_every_subscriber() {
    let broker = Broker::new(BrokerConfig::default()).unwrap();
    let a = broker.subscribe("news", None).unwrap();
    let b = broker.subscribe("news", None).unwrap();
    let other = broker.subscribe("sports", None).unwrap();

    let receipt = broker.publish("news", b"hello".to_vec()).unwrap();
    assert_eq!(receipt.delivered, 2);
    assert!(receipt.message_ids.is_empty());

    assert_eq!(a.try_recv().unwrap(), Delivery::Message(b"hello".to_vec()));
    assert_eq!(b.try_recv().unwrap(), Delivery::Message(b"hello".to_vec()));
    assert!(other.is_empty());
}

#[test]
fn test_topics_are_case_sensitive() {
    let broker = Broker::new(BrokerConfig::default()).unwrap();
    let lower = broker.subscribe("orders", None).unwrap();

    let receipt = broker.publish("Orders", b"x".to_vec()).unwrap();
    assert_eq!(receipt.delivered, 0);
    assert!(lower.is_empty());
}

#[test]
fn test_eleventh_message_rejected_for_slow_subscriber_only() {
    let broker = Broker::new(BrokerConfig::default()).unwrap();
    let slow = broker.subscribe("t", None).unwrap();
    let fast = broker.subscribe("t", None).unwrap();

    for i in 0..10u8 {
        broker.publish("t", vec![i]).unwrap();
        assert_eq!(fast.try_recv().unwrap(), Delivery::Message(vec![i]));
    }

    let err = broker.publish("t", vec![10u8]).unwrap_err();
    match err {
        BrokerError::CapacityExceeded {
            ref topic,
            rejected,
            delivered,
        } => {
            assert_eq!(topic, "t");
            assert_eq!(rejected, 1);
            assert_eq!(delivered, 1);
        }
        ref other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.code(), 503);

    // The sibling still got it; the slow one kept its first ten
    assert_eq!(fast.try_recv().unwrap(), Delivery::Message(vec![10u8]));
    assert_eq!(slow.len(), 10);
    assert_eq!(slow.try_recv().unwrap(), Delivery::Message(vec![0u8]));
    assert_eq!(broker.stats().rejected, 1);
}

#[test]
fn test_unsubscribe_closes_after_drain() {
    let broker = Broker::new(BrokerConfig::default()).unwrap();
    let handle = broker.subscribe("t", None).unwrap();

    broker.publish("t", b"1".to_vec()).unwrap();
    assert!(broker.unsubscribe(&handle));
    assert!(!broker.unsubscribe(&handle));

    assert_eq!(handle.recv().unwrap(), Delivery::Message(b"1".to_vec()));
    assert!(handle.recv().is_err());
    assert_eq!(broker.topic_count(), 0);

    let receipt = broker.publish("t", b"2".to_vec()).unwrap();
    assert_eq!(receipt.delivered, 0);
}

#[test]
fn test_unsubscribe_by_id() {
    let broker = Broker::new(BrokerConfig::default()).unwrap();
    let keep = broker.subscribe("t", None).unwrap();
    let leave = broker.subscribe("t", None).unwrap();

    assert!(broker.unsubscribe_id("t", leave.id));
    assert!(!broker.unsubscribe_id("other", keep.id));
    assert_eq!(broker.subscriber_count("t"), 1);
}

// --- At-Least-Once ---

#[test]
fn test_envelope_carries_id_topic_and_payload() {
    let broker = at_least_once(5_000);
    let handle = broker.subscribe("orders", None).unwrap();

    let receipt = broker.publish("orders", br#"{"order":7}"#.to_vec()).unwrap();
    assert_eq!(receipt.message_ids.len(), 1);

    let frame = handle.try_recv().unwrap();
    assert!(matches!(frame, Delivery::Envelope(_)));

    let value: serde_json::Value = serde_json::from_slice(frame.bytes()).unwrap();
    assert_eq!(value["id"], receipt.message_ids[0].as_str());
    assert_eq!(value["topic"], "orders");
    assert_eq!(value["payload"]["order"], 7);
}

#[test]
fn test_unacknowledged_message_is_redelivered() {
    let broker = at_least_once(100);
    let handle = broker.subscribe("t", None).unwrap();

    broker.publish("t", br#""work""#.to_vec()).unwrap();

    let first = recv_envelope(&handle);
    let second = recv_envelope(&handle);
    assert_eq!(first.id, second.id);
    assert_eq!(first.payload, second.payload);
    assert!(broker.stats().redelivered >= 1);

    broker.acknowledge(&second.id).unwrap();
    assert_eq!(broker.pending_count(), 0);
}

#[test]
fn test_acknowledged_message_is_not_redelivered() {
    let broker = at_least_once(100);
    let handle = broker.subscribe("t", None).unwrap();

    broker.publish("t", b"1".to_vec()).unwrap();
    let envelope = recv_envelope(&handle);
    broker.acknowledge(&envelope.id).unwrap();

    assert!(handle.recv_timeout(Duration::from_millis(300)).is_err());
    assert_eq!(broker.stats().redelivered, 0);
    assert_eq!(broker.stats().acknowledged, 1);
}

#[test]
fn test_second_acknowledgment_is_not_found() {
    let broker = at_least_once(5_000);
    let handle = broker.subscribe("t", None).unwrap();

    broker.publish("t", b"1".to_vec()).unwrap();
    let envelope = recv_envelope(&handle);

    broker.acknowledge(&envelope.id).unwrap();
    let err = broker.acknowledge(&envelope.id).unwrap_err();
    assert!(matches!(err, BrokerError::MessageNotFound(_)));
    assert_eq!(err.code(), 404);
}

#[test]
fn test_acknowledging_unknown_id() {
    let broker = at_least_once(5_000);
    let err = broker.acknowledge(&MessageId::from("never-issued")).unwrap_err();
    assert!(matches!(err, BrokerError::MessageNotFound(_)));
}

#[test]
fn test_each_subscriber_gets_its_own_id() {
    let broker = at_least_once(5_000);
    let a = broker.subscribe("t", None).unwrap();
    let b = broker.subscribe("t", None).unwrap();

    broker.publish("t", b"1".to_vec()).unwrap();
    let ea = recv_envelope(&a);
    let eb = recv_envelope(&b);
    assert_ne!(ea.id, eb.id);

    // Acknowledging one leaves the other pending
    broker.acknowledge(&ea.id).unwrap();
    assert_eq!(broker.pending_count(), 1);
}

#[test]
fn test_unsubscribe_abandons_in_flight_messages() {
    let broker = at_least_once(200);
    let handle = broker.subscribe("t", None).unwrap();

    broker.publish("t", b"1".to_vec()).unwrap();
    broker.publish("t", b"2".to_vec()).unwrap();
    assert_eq!(broker.pending_count(), 2);

    broker.unsubscribe(&handle);
    thread::sleep(Duration::from_millis(800));

    assert_eq!(broker.pending_count(), 0);
    assert_eq!(broker.stats().abandoned, 2);
    assert_eq!(broker.stats().redelivered, 0);
}

#[test]
fn test_dropping_handle_abandons_in_flight_messages() {
    let broker = at_least_once(100);
    let handle = broker.subscribe("quiet", None).unwrap();

    broker.publish("quiet", b"1".to_vec()).unwrap();
    drop(handle);
    assert_eq!(broker.subscriber_count("quiet"), 0);
    assert_eq!(broker.topic_count(), 0);

    thread::sleep(Duration::from_millis(500));
    assert_eq!(broker.pending_count(), 0);
    assert_eq!(broker.stats().abandoned, 1);
}

#[test]
fn test_attempt_limit_expires_message() {
    let broker = Broker::new(BrokerConfig {
        max_attempts: Some(2),
        ..BrokerConfig::at_least_once(Duration::from_millis(50))
    })
    .unwrap();
    let handle = broker.subscribe("t", None).unwrap();

    broker.publish("t", b"1".to_vec()).unwrap();
    thread::sleep(Duration::from_millis(500));

    assert_eq!(handle.len(), 2);
    assert_eq!(broker.pending_count(), 0);
    assert_eq!(broker.stats().expired, 1);
}

#[test]
fn test_delivery_mode_reported() {
    assert_eq!(at_least_once(1_000).delivery_mode(), DeliveryMode::AtLeastOnce);
    assert_eq!(
        Broker::new(BrokerConfig::default()).unwrap().delivery_mode(),
        DeliveryMode::AtMostOnce
    );
}

// --- Concurrency ---

#[test]
fn test_concurrent_publishers() {
    let broker = Arc::new(
        Broker::new(BrokerConfig {
            channel_capacity: 1_000,
            ..Default::default()
        })
        .unwrap(),
    );
    let handle = broker.subscribe("t", None).unwrap();

    let workers: Vec<_> = (0..4u8)
        .map(|w| {
            let broker = Arc::clone(&broker);
            thread::spawn(move || {
                for i in 0..100u8 {
                    broker.publish("t", vec![w, i]).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let received: Vec<Vec<u8>> = handle.try_iter().map(Delivery::into_bytes).collect();
    assert_eq!(received.len(), 400);

    // Per-publisher order survives interleaving
    for w in 0..4u8 {
        let seq: Vec<u8> = received.iter().filter(|m| m[0] == w).map(|m| m[1]).collect();
        assert_eq!(seq, (0..100u8).collect::<Vec<_>>());
    }
}

#[test]
fn test_concurrent_acknowledgment_resolves_once() {
    let broker = Arc::new(at_least_once(5_000));
    let handle = broker.subscribe("t", None).unwrap();
    broker.publish("t", b"1".to_vec()).unwrap();
    let id = recv_envelope(&handle).id;

    let racers: Vec<_> = (0..8)
        .map(|_| {
            let broker = Arc::clone(&broker);
            let id = id.clone();
            thread::spawn(move || broker.acknowledge(&id).is_ok())
        })
        .collect();
    let wins = racers
        .into_iter()
        .map(|r| r.join().unwrap())
        .filter(|won| *won)
        .count();

    assert_eq!(wins, 1);
    assert_eq!(broker.stats().acknowledged, 1);
}

#[test]
fn test_subscribe_while_publishing() {
    let broker = Arc::new(
        Broker::new(BrokerConfig {
            channel_capacity: 10_000,
            ..Default::default()
        })
        .unwrap(),
    );

    let publisher = {
        let broker = Arc::clone(&broker);
        thread::spawn(move || {
            for i in 0..2_000u32 {
                broker.publish("t", i.to_be_bytes().to_vec()).unwrap();
            }
        })
    };

    let mut handles = Vec::new();
    for _ in 0..20 {
        handles.push(broker.subscribe("t", None).unwrap());
    }
    publisher.join().unwrap();

    // Late subscribers see a gapless suffix of the stream
    for handle in handles {
        let seen: Vec<u32> = handle
            .try_iter()
            .map(|d| u32::from_be_bytes(d.bytes().try_into().unwrap()))
            .collect();
        // Empty when the subscribe landed after the last publish
        assert!(seen.windows(2).all(|w| w[1] == w[0] + 1));
        if let Some(last) = seen.last() {
            assert_eq!(*last, 1_999);
        }
    }
}
