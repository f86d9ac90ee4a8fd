//! A channel's prefetch cap gates deliveries until acks free volume.

mod common;

use common::*;
use sluice::limiter::{Limiter, LimiterToken};
use sluice::message::Message;
use sluice::store::SyncMode;

#[test]
fn prefetch_two_releases_on_ack() {
    let broker = broker(SyncMode::WriteThrough);
    let queue = broker.spawn(queue_config("orders"), 16384);

    let (handle, rx) = channel(1);
    let limiter = Limiter::new(2);
    queue
        .basic_consume(
            handle,
            "c1",
            true,
            false,
            LimiterToken::enabled(&limiter),
            None,
        )
        .unwrap();

    for i in 0..5 {
        queue
            .publish(1, Message::transient(format!("m{i}").into_bytes()))
            .unwrap();
    }

    // Two in flight, then the limiter refuses.
    let first = recv_deliver(&rx);
    let second = recv_deliver(&rx);
    assert_eq!(first.message.payload(), b"m0");
    assert_eq!(second.message.payload(), b"m1");
    assert_no_deliver(&rx);

    // One ack frees one slot.
    queue.ack(1, vec![first.ack_tag.unwrap()]).unwrap();
    let third = recv_deliver(&rx);
    assert_eq!(third.message.payload(), b"m2");
    assert_no_deliver(&rx);

    // Settling the rest drains the queue.
    queue
        .ack(1, vec![second.ack_tag.unwrap(), third.ack_tag.unwrap()])
        .unwrap();
    let fourth = recv_deliver(&rx);
    let fifth = recv_deliver(&rx);
    assert_eq!(fourth.message.payload(), b"m3");
    assert_eq!(fifth.message.payload(), b"m4");

    let (len, consumers) = queue.stat().unwrap();
    assert_eq!(len, 0);
    assert_eq!(consumers, 1);
}
