//! The contract between a queue actor and its storage pipeline.
//!
//! The variable queue is the canonical implementation; a mirrored-queue
//! master wraps one and delegates. The actor stays generic over this trait
//! so the two are interchangeable.

use std::sync::Arc;

use crate::message::{Message, MessageId, Properties};
use crate::Result;

/// Receipt a consumer hands back to settle a delivery. Opaque to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckTag {
    /// Transient delivery with no index entry; the body lives in the
    /// pending-ack table until settled.
    NotOnDisk { msg_id: MessageId },
    /// The body and index entry survive on disk until the ack lands.
    OnDisk { msg_id: MessageId, seq_id: u64 },
}

impl AckTag {
    pub fn msg_id(&self) -> MessageId {
        match self {
            AckTag::NotOnDisk { msg_id } | AckTag::OnDisk { msg_id, .. } => *msg_id,
        }
    }
}

/// One fetched delivery.
#[derive(Debug)]
pub struct Fetched {
    pub message: Message,
    /// True when the message had been handed to a consumer before.
    pub redelivered: bool,
    pub ack_tag: Option<AckTag>,
    /// Queue length after this fetch.
    pub remaining: usize,
}

/// RAM duration budget.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DurationTarget {
    /// No cap; everything may live in memory.
    Infinity,
    /// Hold roughly this many seconds' worth of messages in memory.
    Seconds(f64),
}

/// What kind of wake-up the backing queue wants from its actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    False,
    /// Call `timeout` once the mailbox goes idle.
    Idle,
    /// Call `update_ram_duration` on the rate interval.
    Timed,
}

/// Transaction identifier, scoped to one queue.
pub type TxnId = u64;

/// Deferred operation a collaborator hands back to the owning actor, to be
/// applied to the backing queue on the actor's own thread.
pub type BqOp<B> = Box<dyn FnOnce(&mut B) + Send>;

/// Hook the backing queue uses to route asynchronous callbacks (store syncs)
/// through the owning actor's mailbox.
pub type AsyncCallback<B> = Arc<dyn Fn(BqOp<B>) + Send + Sync>;

/// Commit-fence replier, called in submission order once a transaction is
/// fully durable.
pub type TxReplier = Box<dyn FnOnce() + Send>;

pub trait BackingQueue: Sized + Send {
    /// Enqueues a message; returns the assigned seq id.
    fn publish(&mut self, msg: Message, delivered: bool) -> Result<u64>;

    /// Records a message delivered straight off the wire while the queue was
    /// empty; it is never enqueued.
    fn publish_delivered(&mut self, msg: Message) -> Result<AckTag>;

    fn fetch(&mut self, ack_required: bool) -> Result<Option<Fetched>>;

    fn ack(&mut self, tags: &[AckTag]) -> Result<()>;

    /// Puts unsettled deliveries back at the head, in seq order, flagged as
    /// delivered.
    fn requeue(&mut self, tags: &[AckTag]) -> Result<()>;

    /// Drops messages from the head while the predicate holds over their
    /// properties. Returns how many were dropped.
    fn dropwhile(&mut self, pred: &mut dyn FnMut(&Properties) -> bool) -> Result<usize>;

    fn tx_publish(&mut self, txn: TxnId, msg: Message) -> Result<()>;
    fn tx_rollback(&mut self, txn: TxnId) -> Result<()>;
    fn tx_commit(&mut self, txn: TxnId, acks: Vec<AckTag>, replier: TxReplier) -> Result<()>;

    /// True while a commit fence is waiting on the store or unapplied.
    fn needs_sync(&self) -> bool;

    fn flush_journal(&mut self) -> Result<()>;

    /// Ids whose persistent writes the store has confirmed since last asked.
    fn drain_confirmed(&mut self) -> Vec<MessageId>;

    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empties the queue; returns the number of messages removed.
    fn purge(&mut self) -> Result<usize>;

    /// Purge, then erase the index, including pending-ack residue.
    fn delete_and_terminate(&mut self) -> Result<usize>;

    /// Clean shutdown: flush and sync what is dirty.
    fn terminate(&mut self) -> Result<()>;

    fn is_duplicate(&mut self, _msg: &Message) -> bool {
        false
    }

    /// Drops a message that will never be enqueued.
    fn discard(&mut self, msg: Message) -> Result<()>;

    /// Seconds of messages currently held in RAM at the observed rates.
    fn ram_duration(&mut self) -> DurationTarget;

    fn set_ram_duration_target(&mut self, target: DurationTarget) -> Result<()>;

    /// Timer tick: remeasure rates and re-derive the RAM budget.
    fn update_ram_duration(&mut self) -> Result<()>;

    fn needs_timeout(&self) -> TimeoutKind;

    /// Idle-timeout work.
    fn timeout(&mut self) -> Result<()>;

    fn handle_pre_hibernate(&mut self) -> Result<()>;

    fn status(&self) -> Vec<(&'static str, String)>;
}
