//! Per-queue message TTL drops expired messages at the head.

mod common;

use common::*;
use sluice::config::{ArgValue, QueueArgs};
use sluice::limiter::LimiterToken;
use sluice::message::Message;
use sluice::queue::QueueConfig;
use sluice::store::SyncMode;

fn ttl_config(name: &str, ttl_ms: i64) -> QueueConfig {
    QueueConfig {
        args: QueueArgs::parse(&[("x-message-ttl".to_string(), ArgValue::Long(ttl_ms))]).unwrap(),
        ..queue_config(name)
    }
}

#[test]
fn expired_messages_never_reach_a_late_consumer() {
    let broker = broker(SyncMode::WriteThrough);
    let queue = broker.spawn(ttl_config("ephemeral", 100), 16384);

    for i in 0..3 {
        queue
            .publish(1, Message::transient(format!("stale-{i}").into_bytes()))
            .unwrap();
    }
    settle(&queue);
    let (len, _) = queue.stat().unwrap();
    assert_eq!(len, 3);

    broker.clock.advance_ms(150);

    let (handle, rx) = channel(1);
    queue
        .basic_consume(handle, "late", false, false, LimiterToken::disabled(), None)
        .unwrap();
    assert_no_deliver(&rx);
    let (len, _) = queue.stat().unwrap();
    assert_eq!(len, 0);
}

#[test]
fn per_message_expiration_takes_the_tighter_bound() {
    let broker = broker(SyncMode::WriteThrough);
    let queue = broker.spawn(ttl_config("mixed", 10_000), 16384);

    queue
        .publish(
            1,
            Message::transient(&b"short lived"[..]).with_expiration_ms(50),
        )
        .unwrap();
    queue
        .publish(1, Message::transient(&b"long lived"[..]))
        .unwrap();

    settle(&queue);
    broker.clock.advance_ms(100);

    let (handle, rx) = channel(1);
    queue
        .basic_consume(handle, "c", false, false, LimiterToken::disabled(), None)
        .unwrap();
    let delivery = recv_deliver(&rx);
    assert_eq!(delivery.message.payload(), b"long lived");
    assert_no_deliver(&rx);
}

#[test]
fn basic_get_sees_an_empty_expired_queue() {
    let broker = broker(SyncMode::WriteThrough);
    let queue = broker.spawn(ttl_config("polled", 100), 16384);
    queue
        .publish(1, Message::transient(&b"gone"[..]))
        .unwrap();
    settle(&queue);
    broker.clock.advance_ms(200);

    let (handle, _rx) = channel(4);
    assert!(queue.basic_get(handle, false).unwrap().is_none());
}
