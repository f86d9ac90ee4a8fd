//! The queue actor and its collaborators' handles.
//!
//! Every queue is a single-threaded actor owning one backing queue, two
//! consumer rosters, a per-consumer credit map and per-channel side state.
//! Everything else talks to it through a prioritised mailbox.

mod actor;
mod consumers;
mod mailbox;

pub use actor::{spawn_queue, GetOk, QueueActor, QueueCommand, QueueHandle};
pub use consumers::{
    credit_left, serial_diff, ChannelRecord, Consumer, CreditMap, CreditRecord, Rosters,
    UNSENT_MESSAGE_LIMIT,
};

use crossbeam::channel::{unbounded, Receiver, Sender};

use crate::backing::AckTag;
use crate::message::Message;

/// Identifies a channel process.
pub type ChannelId = u64;

/// What a queue pushes at a channel.
#[derive(Debug)]
pub enum ChannelEvent {
    Deliver {
        consumer_tag: String,
        ack_tag: Option<AckTag>,
        message: Message,
        redelivered: bool,
    },
    SendCredit {
        consumer_tag: String,
        count: u32,
        credit: u32,
        available: usize,
        drain: bool,
    },
    /// Publisher confirm for the given publish serial.
    Confirm { msg_seq_no: u64 },
    /// Producer-side credit grant (credit_flow bump).
    Bump { quantity: i64 },
}

/// The queue's capability to reach one channel. Send failures mean the
/// channel is gone and trigger the DOWN path.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    pub channel: ChannelId,
    tx: Sender<ChannelEvent>,
}

impl ChannelHandle {
    pub fn new(channel: ChannelId) -> (Self, Receiver<ChannelEvent>) {
        let (tx, rx) = unbounded();
        (Self { channel, tx }, rx)
    }

    pub fn send(&self, event: ChannelEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Declare-time queue settings.
#[derive(Debug, Clone, Default)]
pub struct QueueConfig {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub args: crate::config::QueueArgs,
    /// Channel that exclusively owns this queue; its death stops the queue.
    pub exclusive_owner: Option<ChannelId>,
}
