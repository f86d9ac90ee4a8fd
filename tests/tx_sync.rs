//! The transactional commit fence waits for the message store to sync
//! persistent publishes before replying.

mod common;

use std::time::Duration;

use common::*;
use sluice::backing::AckTag;
use sluice::limiter::LimiterToken;
use sluice::message::Message;
use sluice::queue::{ChannelEvent, QueueConfig};
use sluice::store::SyncMode;

fn durable_config(name: &str) -> QueueConfig {
    QueueConfig {
        durable: true,
        ..queue_config(name)
    }
}

#[test]
fn commit_fence_waits_for_store_sync() {
    let broker = broker(SyncMode::Manual);
    let queue = broker.spawn(durable_config("ledger"), 16384);

    for i in 0..10 {
        queue
            .tx_publish(1, 42, Message::persistent(format!("entry-{i}").into_bytes()))
            .unwrap();
    }
    let committed = queue.tx_commit(42).unwrap();

    // The fence is pending until the store calls back.
    std::thread::sleep(Duration::from_millis(100));
    let info = queue.info().unwrap();
    assert_eq!(info_value(&info, "needs_sync"), "true");
    assert_eq!(info_value(&info, "messages"), "0");
    assert!(committed.try_recv().is_err());

    broker.store.run_pending_syncs().unwrap();
    committed
        .recv_timeout(RECV_TIMEOUT)
        .expect("commit fence must reply after the store syncs");

    let info = queue.info().unwrap();
    assert_eq!(info_value(&info, "needs_sync"), "false");
    assert_eq!(info_value(&info, "messages"), "10");

    // All ten arrive durable: on-disk ack tags.
    let (handle, rx) = channel(1);
    queue
        .basic_consume(handle, "sink", true, false, LimiterToken::disabled(), None)
        .unwrap();
    let mut tags = Vec::new();
    for i in 0..10 {
        let delivery = recv_deliver(&rx);
        assert_eq!(delivery.message.payload(), format!("entry-{i}").as_bytes());
        match delivery.ack_tag.unwrap() {
            tag @ AckTag::OnDisk { .. } => tags.push(tag),
            AckTag::NotOnDisk { .. } => panic!("durable delivery must be index-and-store"),
        }
        queue.notify_sent(1).unwrap();
    }
    queue.ack(1, tags).unwrap();
}

#[test]
fn rollback_after_tx_publish_leaves_nothing() {
    let broker = broker(SyncMode::Manual);
    let queue = broker.spawn(durable_config("aborted"), 16384);

    let msg = Message::persistent(&b"phantom"[..]);
    queue.tx_publish(1, 9, msg.clone()).unwrap();
    queue.tx_rollback(9).unwrap();

    let info = queue.info().unwrap();
    assert_eq!(info_value(&info, "messages"), "0");
    assert_eq!(info_value(&info, "needs_sync"), "false");
    assert!(!broker.store.contains(&msg.id()));
}

#[test]
fn eventual_confirms_follow_the_store() {
    let broker = broker(SyncMode::Manual);
    let queue = broker.spawn(durable_config("confirmed"), 16384);

    let (handle, rx) = channel(5);
    queue
        .publish_with_confirm(handle, Message::persistent(&b"important"[..]), 77)
        .unwrap();

    // Not confirmed until the write is synced.
    std::thread::sleep(Duration::from_millis(100));
    assert!(rx.try_recv().is_err());

    broker.store.run_pending_syncs().unwrap();
    // Any subsequent command drains the store confirms.
    let _ = queue.stat().unwrap();
    match rx.recv_timeout(RECV_TIMEOUT).unwrap() {
        ChannelEvent::Confirm { msg_seq_no } => assert_eq!(msg_seq_no, 77),
        other => panic!("expected a confirm, got {other:?}"),
    }
}
