//! Link credit with drain: when the queue cannot cover the grant, the count
//! serial advances over the remainder and a zero-credit echo goes back to
//! the channel.

mod common;

use common::*;
use sluice::limiter::LimiterToken;
use sluice::message::Message;
use sluice::queue::ChannelEvent;
use sluice::store::SyncMode;

fn expect_credit_echo(
    rx: &crossbeam::channel::Receiver<ChannelEvent>,
) -> (String, u32, u32, usize, bool) {
    match rx.recv_timeout(RECV_TIMEOUT).unwrap() {
        ChannelEvent::SendCredit {
            consumer_tag,
            count,
            credit,
            available,
            drain,
        } => (consumer_tag, count, credit, available, drain),
        other => panic!("expected a credit echo, got {other:?}"),
    }
}

#[test]
fn drain_echo_and_rearm() {
    let broker = broker(SyncMode::WriteThrough);
    let queue = broker.spawn(queue_config("ticks"), 16384);

    for i in 0..3 {
        queue
            .publish(7, Message::transient(format!("t{i}").into_bytes()))
            .unwrap();
    }
    settle(&queue);

    let (handle, rx) = channel(7);
    queue
        .basic_consume(
            handle,
            "tap",
            false,
            false,
            LimiterToken::disabled(),
            Some((1, 7, true)),
        )
        .unwrap();

    // Delivery #1 spends the single credit...
    let first = recv_deliver(&rx);
    assert_eq!(first.message.payload(), b"t0");

    // ...and the drain echo reports the advanced serial with zero credit.
    let (consumer_tag, count, credit, available, drain) = expect_credit_echo(&rx);
    assert_eq!(consumer_tag, "tap");
    assert_eq!(count, 8);
    assert_eq!(credit, 0);
    assert_eq!(available, 2);
    assert!(drain);

    // Nothing more until credit is re-issued against the new serial.
    assert_no_deliver(&rx);
    queue.set_credit(7, "tap", 2, 8, false, false).unwrap();
    let second = recv_deliver(&rx);
    let third = recv_deliver(&rx);
    assert_eq!(second.message.payload(), b"t1");
    assert_eq!(third.message.payload(), b"t2");
}

#[test]
fn drain_consumes_leftover_credit_when_queue_runs_dry() {
    let broker = broker(SyncMode::WriteThrough);
    let queue = broker.spawn(queue_config("dregs"), 16384);

    for i in 0..2 {
        queue
            .publish(4, Message::transient(format!("d{i}").into_bytes()))
            .unwrap();
    }
    settle(&queue);

    let (handle, rx) = channel(4);
    queue
        .basic_consume(
            handle,
            "tap",
            false,
            false,
            LimiterToken::disabled(),
            Some((5, 10, true)),
        )
        .unwrap();

    // Fewer messages than credit: both arrive...
    let first = recv_deliver(&rx);
    let second = recv_deliver(&rx);
    assert_eq!(first.message.payload(), b"d0");
    assert_eq!(second.message.payload(), b"d1");

    // ...then the drain consumes the three leftover credit in one step:
    // two deliveries advanced the serial to 12, the remainder takes it to
    // 15 and the channel learns it holds nothing.
    let (consumer_tag, count, credit, available, drain) = expect_credit_echo(&rx);
    assert_eq!(consumer_tag, "tap");
    assert_eq!(count, 15);
    assert_eq!(credit, 0);
    assert_eq!(available, 0);
    assert!(drain);
    assert_no_deliver(&rx);
}

#[test]
fn drain_on_empty_queue_zeroes_credit_immediately() {
    let broker = broker(SyncMode::WriteThrough);
    let queue = broker.spawn(queue_config("idle"), 16384);

    let (handle, rx) = channel(3);
    queue
        .basic_consume(
            handle,
            "tap",
            false,
            false,
            LimiterToken::disabled(),
            Some((5, 20, true)),
        )
        .unwrap();

    let (_, count, credit, available, drain) = expect_credit_echo(&rx);
    assert_eq!(count, 25);
    assert_eq!(credit, 0);
    assert_eq!(available, 0);
    assert!(drain);
}
