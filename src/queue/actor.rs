//! The queue process: one thread, one backing queue, a prioritised mailbox.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{bounded, unbounded, Receiver, Sender};

use crate::backing::{AckTag, BackingQueue, BqOp, DurationTarget, TimeoutKind, TxnId};
use crate::clock::Clock;
use crate::credit_flow::CreditFlow;
use crate::limiter::LimiterToken;
use crate::message::{Message, MessageId, Properties};
use crate::queue::consumers::{credit_left, ChannelRecord, Consumer, CreditMap, CreditRecord, Rosters};
use crate::queue::mailbox::{mailbox, Mailbox, MailboxSender, Received};
use crate::queue::{ChannelEvent, ChannelHandle, ChannelId, QueueConfig};
use crate::vq::{VariableQueue, RATE_INTERVAL_US};
use crate::{Error, Result};

/// Journal-sync delay once the mailbox goes idle.
const SYNC_INTERVAL: Duration = Duration::from_millis(25);

/// A non-blocking fetch result.
#[derive(Debug)]
pub struct GetOk {
    pub message: Message,
    pub ack_tag: Option<AckTag>,
    pub remaining: usize,
    pub redelivered: bool,
}

pub enum QueueCommand<B: BackingQueue> {
    // Priority 9
    Info {
        reply: Sender<Vec<(&'static str, String)>>,
    },
    Stat {
        reply: Sender<(usize, usize)>,
    },
    GetLimit {
        channel: ChannelId,
        reply: Sender<usize>,
    },
    // Priority 8
    DeleteImmediately,
    SetRamDurationTarget {
        target: DurationTarget,
        reply: Sender<Result<()>>,
    },
    ChannelDown {
        channel: ChannelId,
    },
    MaybeExpire,
    DropExpired,
    UpdateRamDuration,
    // Priority 7
    BasicConsume {
        channel: ChannelId,
        handle: ChannelHandle,
        tag: String,
        ack_required: bool,
        exclusive: bool,
        limiter: LimiterToken,
        credit: Option<(u32, u32, bool)>,
        reply: Sender<Result<()>>,
    },
    BasicCancel {
        channel: ChannelId,
        tag: String,
        reply: Sender<Result<()>>,
    },
    Ack {
        channel: ChannelId,
        tags: Vec<AckTag>,
        reply: Sender<Result<()>>,
    },
    Reject {
        channel: ChannelId,
        tags: Vec<AckTag>,
        requeue: bool,
        reply: Sender<Result<()>>,
    },
    NotifySent {
        channel: ChannelId,
    },
    Unblock {
        channel: ChannelId,
    },
    EmitStats,
    // Priority 6
    RunBackingQueue(BqOp<B>),
    SyncTimeout,
    // Priority 0
    Publish {
        channel: ChannelId,
        handle: Option<ChannelHandle>,
        msg: Message,
        msg_seq_no: Option<u64>,
    },
    BasicGet {
        handle: ChannelHandle,
        ack_required: bool,
        reply: Sender<Result<Option<GetOk>>>,
    },
    SetCredit {
        channel: ChannelId,
        tag: String,
        credit: u32,
        count: u32,
        drain: bool,
        echo: bool,
    },
    Purge {
        reply: Sender<Result<usize>>,
    },
    Delete {
        reply: Sender<Result<usize>>,
    },
    TxPublish {
        channel: ChannelId,
        txn: TxnId,
        msg: Message,
    },
    TxAck {
        channel: ChannelId,
        txn: TxnId,
        tags: Vec<AckTag>,
    },
    TxCommit {
        txn: TxnId,
        on_complete: Sender<()>,
    },
    TxRollback {
        txn: TxnId,
    },
}

impl<B: BackingQueue> QueueCommand<B> {
    fn priority(&self) -> u8 {
        use QueueCommand::*;
        match self {
            Info { .. } | Stat { .. } | GetLimit { .. } => 9,
            DeleteImmediately
            | SetRamDurationTarget { .. }
            | ChannelDown { .. }
            | MaybeExpire
            | DropExpired
            | UpdateRamDuration => 8,
            BasicConsume { .. }
            | BasicCancel { .. }
            | Ack { .. }
            | Reject { .. }
            | NotifySent { .. }
            | Unblock { .. }
            | EmitStats => 7,
            RunBackingQueue(_) | SyncTimeout => 6,
            _ => 0,
        }
    }
}

fn post<B: BackingQueue>(tx: &MailboxSender<QueueCommand<B>>, cmd: QueueCommand<B>) -> bool {
    let priority = cmd.priority();
    tx.send(priority, cmd)
}

/// User errors go back to the caller; anything else is fatal for the actor.
fn split_user_error<T>(res: Result<T>) -> std::result::Result<Result<T>, Error> {
    match res {
        Ok(v) => Ok(Ok(v)),
        Err(e @ (Error::NotFound(_) | Error::InUse)) => Ok(Err(e)),
        Err(e) => Err(e),
    }
}

pub struct QueueActor<B: BackingQueue> {
    config: QueueConfig,
    bq: B,
    mailbox: Mailbox<QueueCommand<B>>,
    self_tx: MailboxSender<QueueCommand<B>>,
    clock: Arc<dyn Clock>,

    rosters: Rosters,
    channels: HashMap<ChannelId, ChannelRecord>,
    credit: CreditMap,
    unconfirmed: HashMap<MessageId, (ChannelHandle, u64)>,
    txn_acks: HashMap<TxnId, Vec<(ChannelId, AckTag, String)>>,
    exclusive_consumer: Option<(ChannelId, String)>,
    has_had_consumers: bool,
    has_expiring_messages: bool,
    last_used_us: u64,
    hibernated: bool,
    deleted: bool,

    flow: CreditFlow<ChannelId>,
    grants_rx: Receiver<(ChannelId, i64)>,
}

impl<B: BackingQueue + 'static> QueueActor<B> {
    pub(crate) fn new(
        config: QueueConfig,
        bq: B,
        mailbox: Mailbox<QueueCommand<B>>,
        self_tx: MailboxSender<QueueCommand<B>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (grants_tx, grants_rx) = unbounded();
        let flow = CreditFlow::new(Box::new(move |peer: &ChannelId, quantity| {
            let _ = grants_tx.send((*peer, quantity));
        }));
        let now = clock.now_us();
        Self {
            config,
            bq,
            mailbox,
            self_tx,
            clock,
            rosters: Rosters::default(),
            channels: HashMap::new(),
            credit: CreditMap::new(),
            unconfirmed: HashMap::new(),
            txn_acks: HashMap::new(),
            exclusive_consumer: None,
            has_had_consumers: false,
            has_expiring_messages: false,
            last_used_us: now,
            hibernated: false,
            deleted: false,
            flow,
            grants_rx,
        }
    }

    pub fn run(mut self) {
        log::info!("queue {} started", self.config.name);
        loop {
            let timeout = self.next_timeout();
            match self.mailbox.recv(timeout) {
                Received::Item(cmd) => {
                    self.hibernated = false;
                    match self.handle(cmd) {
                        Ok(stop) => {
                            self.drain_confirms();
                            if stop {
                                break;
                            }
                        }
                        Err(err) => {
                            log::error!(
                                "queue {}: backing queue failure, stopping: {err}",
                                self.config.name
                            );
                            break;
                        }
                    }
                }
                Received::Timeout => match self.handle_timeout() {
                    Ok(stop) => {
                        if stop {
                            break;
                        }
                    }
                    Err(err) => {
                        log::error!("queue {}: timeout work failed: {err}", self.config.name);
                        break;
                    }
                },
                Received::Disconnected => break,
            }
        }
        if !self.deleted {
            if let Err(err) = self.bq.terminate() {
                log::warn!("queue {}: terminate failed: {err}", self.config.name);
            }
        }
        log::info!("queue {} stopped", self.config.name);
    }

    fn handle(&mut self, cmd: QueueCommand<B>) -> Result<bool> {
        use QueueCommand::*;
        match cmd {
            Info { reply } => {
                let _ = reply.send(self.info());
            }
            Stat { reply } => {
                let _ = reply.send((self.bq.len(), self.rosters.total()));
            }
            GetLimit { channel, reply } => {
                let limit = self
                    .channels
                    .get(&channel)
                    .map_or(0, |r| r.limiter.get_limit());
                let _ = reply.send(limit);
            }
            DeleteImmediately => {
                self.bq.delete_and_terminate()?;
                self.deleted = true;
                return Ok(true);
            }
            SetRamDurationTarget { target, reply } => {
                let res = self.bq.set_ram_duration_target(target);
                match split_user_error(res) {
                    Ok(r) => {
                        let _ = reply.send(r);
                    }
                    Err(fatal) => return Err(fatal),
                }
            }
            ChannelDown { channel } => return self.handle_ch_down(channel),
            MaybeExpire => return Ok(self.maybe_expire()),
            DropExpired => self.drop_expired()?,
            UpdateRamDuration => self.bq.update_ram_duration()?,
            BasicConsume {
                channel,
                handle,
                tag,
                ack_required,
                exclusive,
                limiter,
                credit,
                reply,
            } => {
                let res =
                    self.handle_consume(channel, handle, tag, ack_required, exclusive, limiter, credit);
                match split_user_error(res) {
                    Ok(r) => {
                        let _ = reply.send(r);
                    }
                    Err(fatal) => return Err(fatal),
                }
            }
            BasicCancel { channel, tag, reply } => {
                let res = self.handle_cancel(channel, &tag);
                match split_user_error(res) {
                    Ok(r) => {
                        let stop = matches!(&r, Ok(true));
                        let _ = reply.send(r.map(|_| ()));
                        if stop {
                            self.bq.delete_and_terminate()?;
                            self.deleted = true;
                            return Ok(true);
                        }
                    }
                    Err(fatal) => return Err(fatal),
                }
            }
            Ack { channel, tags, reply } => {
                let res = self.handle_ack(channel, &tags);
                match split_user_error(res) {
                    Ok(r) => {
                        let _ = reply.send(r);
                    }
                    Err(fatal) => return Err(fatal),
                }
            }
            Reject {
                channel,
                tags,
                requeue,
                reply,
            } => {
                let res = self.handle_reject(channel, &tags, requeue);
                match split_user_error(res) {
                    Ok(r) => {
                        let _ = reply.send(r);
                    }
                    Err(fatal) => return Err(fatal),
                }
            }
            NotifySent { channel } => self.handle_notify_sent(channel)?,
            Unblock { channel } => self.handle_unblock(channel)?,
            EmitStats => {
                log::debug!(
                    "queue {}: len={} consumers={} unacked={}",
                    self.config.name,
                    self.bq.len(),
                    self.rosters.total(),
                    self.channels.values().map(|r| r.unacked.len()).sum::<usize>()
                );
            }
            RunBackingQueue(op) => {
                op(&mut self.bq);
                self.deliver_msgs_to_consumers()?;
            }
            SyncTimeout => self.bq.timeout()?,
            Publish {
                channel,
                handle,
                msg,
                msg_seq_no,
            } => self.handle_publish(channel, handle, msg, msg_seq_no)?,
            BasicGet {
                handle,
                ack_required,
                reply,
            } => {
                let res = self.handle_basic_get(handle, ack_required);
                match split_user_error(res) {
                    Ok(r) => {
                        let _ = reply.send(r);
                    }
                    Err(fatal) => return Err(fatal),
                }
            }
            SetCredit {
                channel,
                tag,
                credit,
                count,
                drain,
                echo,
            } => self.handle_set_credit(channel, &tag, credit, count, drain, echo)?,
            Purge { reply } => {
                let res = self.bq.purge();
                match split_user_error(res) {
                    Ok(r) => {
                        let _ = reply.send(r);
                    }
                    Err(fatal) => return Err(fatal),
                }
            }
            Delete { reply } => {
                let res = self.bq.delete_and_terminate();
                self.deleted = res.is_ok();
                match split_user_error(res) {
                    Ok(r) => {
                        let _ = reply.send(r);
                        return Ok(true);
                    }
                    Err(fatal) => return Err(fatal),
                }
            }
            TxPublish { channel, txn, msg } => {
                self.touch();
                self.flow.ack(&channel);
                self.drain_grants(None);
                let msg = self.stamp_expiry(msg);
                self.bq.tx_publish(txn, msg)?;
            }
            TxAck { channel, txn, tags } => {
                if let Some(record) = self.channels.get_mut(&channel) {
                    let mut moved = Vec::new();
                    record.unacked.retain(|(t, ctag)| {
                        if tags.contains(t) {
                            moved.push((channel, *t, ctag.clone()));
                            false
                        } else {
                            true
                        }
                    });
                    self.txn_acks.entry(txn).or_default().extend(moved);
                }
            }
            TxCommit { txn, on_complete } => {
                let entries = self.txn_acks.remove(&txn).unwrap_or_default();
                let tags: Vec<AckTag> = entries.iter().map(|(_, t, _)| *t).collect();
                let mut per_channel: HashMap<ChannelId, usize> = HashMap::new();
                for (ch, _, _) in &entries {
                    *per_channel.entry(*ch).or_default() += 1;
                }
                self.bq
                    .tx_commit(txn, tags, Box::new(move || {
                        let _ = on_complete.send(());
                    }))?;
                for (ch, n) in per_channel {
                    if let Some(record) = self.channels.get(&ch) {
                        record.limiter.ack(n);
                    }
                }
                self.deliver_msgs_to_consumers()?;
            }
            TxRollback { txn } => {
                self.bq.tx_rollback(txn)?;
                for (ch, tag, ctag) in self.txn_acks.remove(&txn).unwrap_or_default() {
                    if let Some(record) = self.channels.get_mut(&ch) {
                        record.unacked.push((tag, ctag));
                    }
                }
            }
        }
        Ok(false)
    }

    // ---- publish path -------------------------------------------------

    fn handle_publish(
        &mut self,
        channel: ChannelId,
        handle: Option<ChannelHandle>,
        msg: Message,
        msg_seq_no: Option<u64>,
    ) -> Result<()> {
        self.touch();
        self.flow.ack(&channel);
        self.drain_grants(handle.as_ref());
        let msg = self.stamp_expiry(msg);
        if self.bq.is_duplicate(&msg) {
            return self.bq.discard(msg);
        }
        match msg_seq_no {
            Some(seq_no) if msg.is_persistent() && self.config.durable => {
                if let Some(handle) = handle {
                    self.unconfirmed.insert(msg.id(), (handle, seq_no));
                }
            }
            Some(seq_no) => {
                if let Some(handle) = &handle {
                    let _ = handle.send(ChannelEvent::Confirm { msg_seq_no: seq_no });
                }
            }
            None => {}
        }
        self.bq.publish(msg, false)?;
        self.deliver_msgs_to_consumers()
    }

    fn stamp_expiry(&mut self, msg: Message) -> Message {
        let per_msg = msg.properties().expiration_ms;
        let per_queue = self.config.args.message_ttl.map(|d| d.as_millis() as u64);
        let ttl_ms = match (per_msg, per_queue) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };
        match ttl_ms {
            Some(ms) => {
                self.has_expiring_messages = true;
                msg.with_expiry_at_us(self.clock.now_us() + ms * 1000)
            }
            None => msg,
        }
    }

    // ---- dispatch loop ------------------------------------------------

    fn deliver_msgs_to_consumers(&mut self) -> Result<()> {
        self.drop_expired()?;
        let mut dead_channels: Vec<ChannelId> = Vec::new();
        loop {
            if self.bq.is_empty() {
                break;
            }
            let Some(consumer) = self.rosters.active.pop_front() else {
                break;
            };
            let channel = consumer.channel;
            if dead_channels.contains(&channel) {
                self.rosters.blocked.push_back(consumer);
                continue;
            }
            let token = match self.channels.get(&channel) {
                Some(record) => record.limiter.clone(),
                None => continue,
            };
            if !credit_left(&self.credit, &consumer.tag) {
                self.rosters.blocked.push_back(consumer);
                continue;
            }
            if !token.can_send(&self.config.name, consumer.ack_required) {
                if let Some(record) = self.channels.get_mut(&channel) {
                    record.is_limit_active = true;
                }
                self.rosters.blocked.push_back(consumer);
                self.rosters.block_channel(channel);
                continue;
            }

            let fetched = self.bq.fetch(consumer.ack_required)?.expect("queue non-empty");
            let remaining = fetched.remaining;
            let record = self.channels.get_mut(&channel).expect("record exists");
            if let Some(tag) = fetched.ack_tag {
                record.unacked.push((tag, consumer.tag.clone()));
            }
            record.unsent_message_count += 1;
            let sent = record.handle.send(ChannelEvent::Deliver {
                consumer_tag: consumer.tag.clone(),
                ack_tag: fetched.ack_tag,
                message: fetched.message,
                redelivered: fetched.redelivered,
            });
            if !sent {
                dead_channels.push(channel);
                self.rosters.blocked.push_back(consumer);
                continue;
            }
            let unsent_blocked = record.is_unsent_blocked();
            let limit_active = record.is_limit_active;
            let mut still_credit = true;
            if let Some(cred) = self.credit.get_mut(&consumer.tag) {
                cred.decr();
                still_credit = cred.credit_left();
                if cred.drain && !still_credit {
                    let (count, drain) = (cred.count, cred.drain);
                    let handle = &self.channels.get(&channel).expect("record exists").handle;
                    let _ = handle.send(ChannelEvent::SendCredit {
                        consumer_tag: consumer.tag.clone(),
                        count,
                        credit: 0,
                        available: remaining,
                        drain,
                    });
                }
            }
            if unsent_blocked {
                self.rosters.blocked.push_back(consumer);
                self.rosters.block_channel(channel);
            } else if still_credit && !limit_active {
                self.rosters.active.push_back(consumer);
            } else {
                self.rosters.blocked.push_back(consumer);
            }
        }
        for channel in dead_channels {
            self.handle_ch_down(channel)?;
        }
        self.drain_excess_credit();
        Ok(())
    }

    // ---- consumers ----------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn handle_consume(
        &mut self,
        channel: ChannelId,
        handle: ChannelHandle,
        tag: String,
        ack_required: bool,
        exclusive: bool,
        limiter: LimiterToken,
        credit: Option<(u32, u32, bool)>,
    ) -> Result<()> {
        if self.exclusive_consumer.is_some() {
            return Err(Error::InUse);
        }
        if exclusive && !self.rosters.is_empty() {
            return Err(Error::InUse);
        }
        if self.rosters.holds_tag(&tag) {
            return Err(Error::InUse);
        }
        let record = self
            .channels
            .entry(channel)
            .or_insert_with(|| ChannelRecord::new(handle, limiter.clone()));
        record.consumer_count += 1;
        let tx = self.self_tx.clone();
        record.limiter.register(
            self.config.name.clone(),
            Box::new(move || {
                post(&tx, QueueCommand::Unblock { channel });
            }),
        );
        if exclusive {
            self.exclusive_consumer = Some((channel, tag.clone()));
        }
        if let Some((cr, count, drain)) = credit {
            self.credit.insert(
                tag.clone(),
                CreditRecord {
                    credit: cr,
                    count,
                    drain,
                },
            );
        }
        self.has_had_consumers = true;
        self.touch();
        let blocked = {
            let record = self.channels.get(&channel).expect("just inserted");
            record.is_limit_active
                || record.is_unsent_blocked()
                || !credit_left(&self.credit, &tag)
        };
        let consumer = Consumer {
            channel,
            tag,
            ack_required,
        };
        if blocked {
            self.rosters.blocked.push_back(consumer);
        } else {
            self.rosters.active.push_back(consumer);
        }
        self.deliver_msgs_to_consumers()
    }

    /// Returns `Ok(true)` when the cancel leaves an auto-delete queue unused.
    fn handle_cancel(&mut self, channel: ChannelId, tag: &str) -> Result<bool> {
        let consumer = self
            .rosters
            .remove_consumer(channel, tag)
            .ok_or_else(|| Error::NotFound(format!("consumer {tag}")))?;
        self.credit.remove(&consumer.tag);
        if let Some((ch, t)) = &self.exclusive_consumer {
            if *ch == channel && t == tag {
                self.exclusive_consumer = None;
            }
        }
        if let Some(record) = self.channels.get_mut(&channel) {
            record.consumer_count = record.consumer_count.saturating_sub(1);
        }
        self.maybe_drop_channel_record(channel);
        self.touch();
        Ok(self.config.auto_delete && self.has_had_consumers && self.rosters.is_empty())
    }

    fn handle_ack(&mut self, channel: ChannelId, tags: &[AckTag]) -> Result<()> {
        let record = self
            .channels
            .get_mut(&channel)
            .ok_or_else(|| Error::NotFound("channel".into()))?;
        for tag in tags {
            if !record.unacked.iter().any(|(t, _)| t == tag) {
                return Err(Error::NotFound(format!("ack tag for {}", tag.msg_id())));
            }
        }
        record.unacked.retain(|(t, _)| !tags.contains(t));
        let token = record.limiter.clone();
        self.bq.ack(tags)?;
        token.ack(tags.len());
        self.maybe_drop_channel_record(channel);
        self.touch();
        self.deliver_msgs_to_consumers()
    }

    fn handle_reject(&mut self, channel: ChannelId, tags: &[AckTag], requeue: bool) -> Result<()> {
        let record = self
            .channels
            .get_mut(&channel)
            .ok_or_else(|| Error::NotFound("channel".into()))?;
        for tag in tags {
            if !record.unacked.iter().any(|(t, _)| t == tag) {
                return Err(Error::NotFound(format!("ack tag for {}", tag.msg_id())));
            }
        }
        record.unacked.retain(|(t, _)| !tags.contains(t));
        let token = record.limiter.clone();
        if requeue {
            self.bq.requeue(tags)?;
        } else {
            self.bq.ack(tags)?;
        }
        token.ack(tags.len());
        self.maybe_drop_channel_record(channel);
        self.touch();
        self.deliver_msgs_to_consumers()
    }

    fn handle_basic_get(&mut self, handle: ChannelHandle, ack_required: bool) -> Result<Option<GetOk>> {
        self.touch();
        self.drop_expired()?;
        match self.bq.fetch(ack_required)? {
            None => Ok(None),
            Some(fetched) => {
                if let Some(tag) = fetched.ack_tag {
                    let channel = handle.channel;
                    let record = self
                        .channels
                        .entry(channel)
                        .or_insert_with(|| ChannelRecord::new(handle, LimiterToken::disabled()));
                    record.unacked.push((tag, String::new()));
                }
                Ok(Some(GetOk {
                    message: fetched.message,
                    ack_tag: fetched.ack_tag,
                    remaining: fetched.remaining,
                    redelivered: fetched.redelivered,
                }))
            }
        }
    }

    fn handle_set_credit(
        &mut self,
        channel: ChannelId,
        tag: &str,
        credit: u32,
        count: u32,
        drain: bool,
        echo: bool,
    ) -> Result<()> {
        let record = self.credit.entry(tag.to_string()).or_insert(CreditRecord {
            credit: 0,
            count,
            drain,
        });
        let had_credit = record.credit_left();
        record.rebase(credit, count, drain);
        let now_has = record.credit_left();
        let snapshot = *record;
        if !had_credit && now_has {
            self.rosters.unblock_consumer(tag);
        }
        if echo {
            self.send_to_channel(
                channel,
                ChannelEvent::SendCredit {
                    consumer_tag: tag.to_string(),
                    count: snapshot.count,
                    credit: snapshot.credit,
                    available: self.bq.len(),
                    drain: snapshot.drain,
                },
            );
        }
        self.deliver_msgs_to_consumers()
    }

    /// Drain settlement: once dispatch has run the queue dry, a draining
    /// consumer must not be left holding credit. The count serial advances
    /// by the full remainder, credit drops to zero and the channel is told
    /// via a `credit=0` echo. Covers both a grant against an empty queue
    /// and a queue holding fewer messages than the grant.
    fn drain_excess_credit(&mut self) {
        if !self.bq.is_empty() {
            return;
        }
        let mut draining: Vec<(ChannelId, String)> = Vec::new();
        for consumer in self.rosters.active.iter().chain(self.rosters.blocked.iter()) {
            if let Some(record) = self.credit.get(&consumer.tag) {
                if record.drain && record.credit > 0 {
                    draining.push((consumer.channel, consumer.tag.clone()));
                }
            }
        }
        for (channel, tag) in draining {
            let Some(record) = self.credit.get_mut(&tag) else {
                continue;
            };
            record.count = record.count.wrapping_add(record.credit);
            record.credit = 0;
            let count = record.count;
            self.send_to_channel(
                channel,
                ChannelEvent::SendCredit {
                    consumer_tag: tag.clone(),
                    count,
                    credit: 0,
                    available: 0,
                    drain: true,
                },
            );
            // Out of credit now: the consumer waits in the blocked roster.
            if let Some(pos) = self.rosters.active.iter().position(|c| c.tag == tag) {
                if let Some(consumer) = self.rosters.active.remove(pos) {
                    self.rosters.blocked.push_back(consumer);
                }
            }
        }
    }

    // ---- blocking transitions -----------------------------------------

    fn handle_notify_sent(&mut self, channel: ChannelId) -> Result<()> {
        let Some(record) = self.channels.get_mut(&channel) else {
            return Ok(());
        };
        let was_blocked = record.is_unsent_blocked();
        record.unsent_message_count = record.unsent_message_count.saturating_sub(1);
        let now_blocked = record.is_unsent_blocked();
        let limit_active = record.is_limit_active;
        if was_blocked && !now_blocked && !limit_active {
            let credit = &self.credit;
            self.rosters
                .unblock_channel(channel, |c| credit_left(credit, &c.tag));
            self.deliver_msgs_to_consumers()?;
        }
        self.maybe_drop_channel_record(channel);
        Ok(())
    }

    fn handle_unblock(&mut self, channel: ChannelId) -> Result<()> {
        let Some(record) = self.channels.get_mut(&channel) else {
            return Ok(());
        };
        record.is_limit_active = false;
        if !record.is_unsent_blocked() {
            let credit = &self.credit;
            self.rosters
                .unblock_channel(channel, |c| credit_left(credit, &c.tag));
            self.deliver_msgs_to_consumers()?;
        }
        Ok(())
    }

    // ---- channel death, expiry, cleanup --------------------------------

    fn handle_ch_down(&mut self, channel: ChannelId) -> Result<bool> {
        let record = match self.channels.remove(&channel) {
            Some(record) => record,
            None => {
                if self.config.exclusive_owner == Some(channel) {
                    self.bq.delete_and_terminate()?;
                    self.deleted = true;
                    return Ok(true);
                }
                return Ok(false);
            }
        };
        record.limiter.unregister(&self.config.name);
        let tags: Vec<AckTag> = record.unacked.iter().map(|(t, _)| *t).collect();
        if !tags.is_empty() {
            self.bq.requeue(&tags)?;
        }
        let consumer_tags = self.rosters.remove_channel(channel);
        for tag in &consumer_tags {
            self.credit.remove(tag);
        }
        if matches!(&self.exclusive_consumer, Some((ch, _)) if *ch == channel) {
            self.exclusive_consumer = None;
        }
        self.flow.peer_down(&channel);
        self.drain_grants(None);
        self.unconfirmed
            .retain(|_, pending| pending.0.channel != channel);
        if self.config.exclusive_owner == Some(channel) {
            self.bq.delete_and_terminate()?;
            self.deleted = true;
            return Ok(true);
        }
        if self.config.auto_delete && self.has_had_consumers && self.rosters.is_empty() {
            self.bq.delete_and_terminate()?;
            self.deleted = true;
            return Ok(true);
        }
        self.deliver_msgs_to_consumers()?;
        Ok(false)
    }

    fn maybe_expire(&mut self) -> bool {
        match self.config.args.expires {
            Some(window) if self.rosters.is_empty() => {
                let idle_us = self.clock.now_us().saturating_sub(self.last_used_us);
                idle_us >= window.as_micros() as u64
            }
            _ => false,
        }
    }

    fn drop_expired(&mut self) -> Result<()> {
        if !self.has_expiring_messages {
            return Ok(());
        }
        let now = self.clock.now_us();
        self.bq
            .dropwhile(&mut |props: &Properties| props.expiry_at_us.map_or(false, |e| e <= now))?;
        Ok(())
    }

    fn maybe_drop_channel_record(&mut self, channel: ChannelId) {
        let idle = self.channels.get(&channel).map_or(false, ChannelRecord::is_idle);
        if idle {
            if let Some(record) = self.channels.remove(&channel) {
                record.limiter.unregister(&self.config.name);
            }
        }
    }

    // ---- plumbing ------------------------------------------------------

    fn drain_confirms(&mut self) {
        if self.unconfirmed.is_empty() {
            return;
        }
        for id in self.bq.drain_confirmed() {
            if let Some((handle, msg_seq_no)) = self.unconfirmed.remove(&id) {
                let _ = handle.send(ChannelEvent::Confirm { msg_seq_no });
            }
        }
    }

    fn drain_grants(&mut self, fallback: Option<&ChannelHandle>) {
        while let Ok((peer, quantity)) = self.grants_rx.try_recv() {
            let sent = self
                .channels
                .get(&peer)
                .map(|r| r.handle.send(ChannelEvent::Bump { quantity }))
                .unwrap_or(false);
            if !sent {
                if let Some(handle) = fallback {
                    if handle.channel == peer {
                        let _ = handle.send(ChannelEvent::Bump { quantity });
                    }
                }
            }
        }
    }

    fn send_to_channel(&self, channel: ChannelId, event: ChannelEvent) {
        if let Some(record) = self.channels.get(&channel) {
            let _ = record.handle.send(event);
        }
    }

    fn touch(&mut self) {
        self.last_used_us = self.clock.now_us();
    }

    fn info(&self) -> Vec<(&'static str, String)> {
        let mut items = vec![
            ("name", self.config.name.clone()),
            ("durable", self.config.durable.to_string()),
            ("auto_delete", self.config.auto_delete.to_string()),
            ("messages", self.bq.len().to_string()),
            (
                "messages_unacknowledged",
                self.channels
                    .values()
                    .map(|r| r.unacked.len())
                    .sum::<usize>()
                    .to_string(),
            ),
            ("consumers", self.rosters.total().to_string()),
            ("needs_sync", self.bq.needs_sync().to_string()),
        ];
        items.extend(self.bq.status());
        items
    }

    fn next_timeout(&mut self) -> Option<Duration> {
        let mut next: Option<Duration> = None;
        let mut consider = |d: Duration| {
            next = Some(next.map_or(d, |c| c.min(d)));
        };
        match self.bq.needs_timeout() {
            TimeoutKind::Timed => consider(Duration::from_micros(RATE_INTERVAL_US)),
            TimeoutKind::Idle => consider(SYNC_INTERVAL),
            TimeoutKind::False => {}
        }
        if self.has_expiring_messages && !self.bq.is_empty() {
            if let Some(ttl) = self.config.args.message_ttl {
                consider(ttl);
            }
        }
        if let Some(expires) = self.config.args.expires {
            if self.rosters.is_empty() {
                let idle = self.clock.now_us().saturating_sub(self.last_used_us);
                let remaining = (expires.as_micros() as u64).saturating_sub(idle);
                consider(Duration::from_micros(remaining.max(1_000)));
            }
        }
        if next.is_none() && !self.hibernated {
            if let Err(err) = self.bq.handle_pre_hibernate() {
                log::warn!("queue {}: pre-hibernate failed: {err}", self.config.name);
            }
            self.hibernated = true;
        }
        next
    }

    fn handle_timeout(&mut self) -> Result<bool> {
        match self.bq.needs_timeout() {
            TimeoutKind::Timed => self.bq.update_ram_duration()?,
            TimeoutKind::Idle => self.bq.timeout()?,
            TimeoutKind::False => {}
        }
        self.drop_expired()?;
        if self.maybe_expire() {
            log::info!("queue {} expired", self.config.name);
            return Ok(true);
        }
        Ok(false)
    }
}

/// Client-side handle to a queue actor. Calls surface `NotFound` once the
/// queue has stopped.
pub struct QueueHandle<B: BackingQueue = VariableQueue> {
    tx: MailboxSender<QueueCommand<B>>,
    name: String,
}

impl<B: BackingQueue> Clone for QueueHandle<B> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            name: self.name.clone(),
        }
    }
}

impl<B: BackingQueue + 'static> QueueHandle<B> {
    fn cast(&self, cmd: QueueCommand<B>) -> Result<()> {
        if post(&self.tx, cmd) {
            Ok(())
        } else {
            Err(Error::NotFound(format!("queue {}", self.name)))
        }
    }

    fn call<R>(&self, build: impl FnOnce(Sender<R>) -> QueueCommand<B>) -> Result<R> {
        let (reply_tx, reply_rx) = bounded(1);
        self.cast(build(reply_tx))?;
        reply_rx
            .recv()
            .map_err(|_| Error::NotFound(format!("queue {}", self.name)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn publish(&self, channel: ChannelId, msg: Message) -> Result<()> {
        self.cast(QueueCommand::Publish {
            channel,
            handle: None,
            msg,
            msg_seq_no: None,
        })
    }

    pub fn publish_with_confirm(
        &self,
        handle: ChannelHandle,
        msg: Message,
        msg_seq_no: u64,
    ) -> Result<()> {
        self.cast(QueueCommand::Publish {
            channel: handle.channel,
            handle: Some(handle),
            msg,
            msg_seq_no: Some(msg_seq_no),
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn basic_consume(
        &self,
        handle: ChannelHandle,
        tag: impl Into<String>,
        ack_required: bool,
        exclusive: bool,
        limiter: LimiterToken,
        credit: Option<(u32, u32, bool)>,
    ) -> Result<()> {
        let channel = handle.channel;
        self.call(|reply| QueueCommand::BasicConsume {
            channel,
            handle,
            tag: tag.into(),
            ack_required,
            exclusive,
            limiter,
            credit,
            reply,
        })?
    }

    pub fn basic_cancel(&self, channel: ChannelId, tag: impl Into<String>) -> Result<()> {
        let tag = tag.into();
        self.call(|reply| QueueCommand::BasicCancel {
            channel,
            tag,
            reply,
        })?
    }

    pub fn basic_get(&self, handle: ChannelHandle, ack_required: bool) -> Result<Option<GetOk>> {
        self.call(|reply| QueueCommand::BasicGet {
            handle,
            ack_required,
            reply,
        })?
    }

    pub fn ack(&self, channel: ChannelId, tags: Vec<AckTag>) -> Result<()> {
        self.call(|reply| QueueCommand::Ack {
            channel,
            tags,
            reply,
        })?
    }

    pub fn reject(&self, channel: ChannelId, tags: Vec<AckTag>, requeue: bool) -> Result<()> {
        self.call(|reply| QueueCommand::Reject {
            channel,
            tags,
            requeue,
            reply,
        })?
    }

    pub fn set_credit(
        &self,
        channel: ChannelId,
        tag: impl Into<String>,
        credit: u32,
        count: u32,
        drain: bool,
        echo: bool,
    ) -> Result<()> {
        self.cast(QueueCommand::SetCredit {
            channel,
            tag: tag.into(),
            credit,
            count,
            drain,
            echo,
        })
    }

    pub fn notify_sent(&self, channel: ChannelId) -> Result<()> {
        self.cast(QueueCommand::NotifySent { channel })
    }

    pub fn unblock(&self, channel: ChannelId) -> Result<()> {
        self.cast(QueueCommand::Unblock { channel })
    }

    pub fn channel_down(&self, channel: ChannelId) -> Result<()> {
        self.cast(QueueCommand::ChannelDown { channel })
    }

    pub fn purge(&self) -> Result<usize> {
        self.call(|reply| QueueCommand::Purge { reply })?
    }

    pub fn delete(&self) -> Result<usize> {
        self.call(|reply| QueueCommand::Delete { reply })?
    }

    pub fn delete_immediately(&self) -> Result<()> {
        self.cast(QueueCommand::DeleteImmediately)
    }

    pub fn stat(&self) -> Result<(usize, usize)> {
        self.call(|reply| QueueCommand::Stat { reply })
    }

    pub fn info(&self) -> Result<Vec<(&'static str, String)>> {
        self.call(|reply| QueueCommand::Info { reply })
    }

    pub fn get_limit(&self, channel: ChannelId) -> Result<usize> {
        self.call(|reply| QueueCommand::GetLimit { channel, reply })
    }

    pub fn set_ram_duration_target(&self, target: DurationTarget) -> Result<()> {
        self.call(|reply| QueueCommand::SetRamDurationTarget { target, reply })?
    }

    pub fn update_ram_duration(&self) -> Result<()> {
        self.cast(QueueCommand::UpdateRamDuration)
    }

    pub fn drop_expired_now(&self) -> Result<()> {
        self.cast(QueueCommand::DropExpired)
    }

    pub fn maybe_expire_now(&self) -> Result<()> {
        self.cast(QueueCommand::MaybeExpire)
    }

    pub fn emit_stats(&self) -> Result<()> {
        self.cast(QueueCommand::EmitStats)
    }

    pub fn tx_publish(&self, channel: ChannelId, txn: TxnId, msg: Message) -> Result<()> {
        self.cast(QueueCommand::TxPublish { channel, txn, msg })
    }

    pub fn tx_ack(&self, channel: ChannelId, txn: TxnId, tags: Vec<AckTag>) -> Result<()> {
        self.cast(QueueCommand::TxAck { channel, txn, tags })
    }

    /// Starts the commit fence; the returned receiver fires once the
    /// transaction is fully durable and applied.
    pub fn tx_commit(&self, txn: TxnId) -> Result<Receiver<()>> {
        let (tx, rx) = bounded(1);
        self.cast(QueueCommand::TxCommit {
            txn,
            on_complete: tx,
        })?;
        Ok(rx)
    }

    pub fn tx_rollback(&self, txn: TxnId) -> Result<()> {
        self.cast(QueueCommand::TxRollback { txn })
    }
}

/// Spawns a queue actor on its own thread, wiring the backing queue's async
/// callback back into the actor's own mailbox.
pub fn spawn_queue(
    config: QueueConfig,
    store: Arc<crate::store::MessageStore>,
    index: crate::index::QueueIndex,
    clock: Arc<dyn Clock>,
) -> QueueHandle<VariableQueue> {
    let (tx, rx) = mailbox();
    let cb_tx = tx.clone();
    let vq = VariableQueue::new(
        config.durable,
        store,
        index,
        Arc::clone(&clock),
        Arc::new(move |op| {
            post(&cb_tx, QueueCommand::RunBackingQueue(op));
        }),
    );
    let name = config.name.clone();
    let actor = QueueActor::new(config, vq, rx, tx.clone(), clock);
    std::thread::Builder::new()
        .name(format!("queue-{name}"))
        .spawn(move || actor.run())
        .expect("spawn queue actor");
    QueueHandle { tx, name }
}
