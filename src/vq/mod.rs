//! The variable queue: a five-stage tiered residency pipeline.
//!
//! Messages live in one of three forms: alpha (body and position in RAM),
//! beta (body on disk, position in RAM) and delta (body and position on
//! disk). The stages, ordered oldest to newest by seq id, are:
//!
//! ```text
//!   q4 (alpha) | q3 (beta) | delta | q2 (beta) | q1 (alpha)
//!   fetch end                                    publish end
//! ```
//!
//! Messages migrate towards disk under memory pressure and back towards RAM
//! as they approach the fetch end, always preserving seq order. The RAM
//! budget (`target_ram_msg_count`) is re-derived from live ingress/egress
//! rate estimates and a duration target.
//!
//! Invariants kept at every operation boundary (debug-asserted):
//! conservation of `len` across stages, `ram_msg_count = |q1| + |q4|`,
//! seq ordering across stages, `q2 nonempty => delta nonempty`,
//! `delta nonempty => q3 nonempty`, `index_on_disk => msg_on_disk`, and
//! persistent messages on disk in both forms outside the alpha stage.

mod rates;

pub use rates::{RateMonitor, RATE_INTERVAL_US};

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::backing::{
    AckTag, AsyncCallback, BackingQueue, DurationTarget, Fetched, TimeoutKind, TxReplier, TxnId,
};
use crate::clock::Clock;
use crate::index::QueueIndex;
use crate::message::{Message, MessageId, Properties};
use crate::store::{MessageStore, StoreClientId};
use crate::{Error, Result};

/// Smallest batch worth writing when trimming the RAM index.
pub const RAM_INDEX_BATCH_SIZE: usize = 64;

/// The queue's envelope around one message.
#[derive(Debug, Clone)]
pub(crate) struct MsgStatus {
    pub seq_id: u64,
    pub msg_id: MessageId,
    /// Body, present only in the alpha stages (and transient pending acks).
    pub msg: Option<Message>,
    pub persistent: bool,
    pub delivered: bool,
    pub msg_on_disk: bool,
    pub index_on_disk: bool,
}

/// A contiguous region wholly on disk. `count` is the number of live
/// messages inside `[start, end)`; acked holes make it sparse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Delta {
    start: u64,
    count: usize,
    end: u64,
}

impl Delta {
    const EMPTY: Delta = Delta {
        start: 0,
        count: 0,
        end: 0,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Residency {
    Msg,
    Index,
    Neither,
}

#[derive(Default)]
struct OnSync {
    acks: Vec<Vec<AckTag>>,
    pubs: Vec<Vec<Message>>,
    repliers: Vec<TxReplier>,
}

pub struct VariableQueue {
    q1: VecDeque<MsgStatus>,
    q2: VecDeque<MsgStatus>,
    delta: Delta,
    q3: VecDeque<MsgStatus>,
    q4: VecDeque<MsgStatus>,

    next_seq_id: u64,
    len: usize,
    pending_ack: HashMap<MessageId, MsgStatus>,

    durable: bool,
    store: Arc<MessageStore>,
    store_client: StoreClientId,
    index: QueueIndex,

    ram_msg_count: usize,
    ram_index_count: usize,
    target_ram_msg_count: Option<usize>,
    duration_target: DurationTarget,
    rates: RateMonitor,
    clock: Arc<dyn Clock>,

    async_callback: AsyncCallback<Self>,
    txns: HashMap<TxnId, Vec<Message>>,
    on_sync: OnSync,
    pending_store_syncs: usize,
}

impl VariableQueue {
    pub fn new(
        durable: bool,
        store: Arc<MessageStore>,
        index: QueueIndex,
        clock: Arc<dyn Clock>,
        async_callback: AsyncCallback<Self>,
    ) -> Self {
        let store_client = store.register();
        let now = clock.now_us();
        Self {
            q1: VecDeque::new(),
            q2: VecDeque::new(),
            delta: Delta::EMPTY,
            q3: VecDeque::new(),
            q4: VecDeque::new(),
            next_seq_id: 0,
            len: 0,
            pending_ack: HashMap::new(),
            durable,
            store,
            store_client,
            index,
            ram_msg_count: 0,
            ram_index_count: 0,
            target_ram_msg_count: None,
            duration_target: DurationTarget::Infinity,
            rates: RateMonitor::new(now),
            clock,
            async_callback,
            txns: HashMap::new(),
            on_sync: OnSync::default(),
            pending_store_syncs: 0,
        }
    }

    pub fn pending_ack_count(&self) -> usize {
        self.pending_ack.len()
    }

    fn classify(&self, seq_id: u64) -> Residency {
        match self.target_ram_msg_count {
            None => Residency::Msg,
            Some(0) => match self.q3.front() {
                None => Residency::Index,
                Some(head) => {
                    if seq_id >= self.index.next_boundary(head.seq_id) {
                        Residency::Neither
                    } else {
                        Residency::Index
                    }
                }
            },
            Some(target) if target > self.ram_msg_count => Residency::Msg,
            Some(_) => {
                if self.q1.is_empty() {
                    Residency::Index
                } else {
                    Residency::Msg
                }
            }
        }
    }

    fn publish_inner(&mut self, msg: Message, delivered: bool, body_on_disk: bool) -> Result<u64> {
        let seq_id = self.next_seq_id;
        self.next_seq_id += 1;
        self.len += 1;
        self.rates.note_in();
        let persistent = msg.is_persistent() && self.durable;
        let mut status = MsgStatus {
            seq_id,
            msg_id: msg.id(),
            persistent,
            delivered,
            msg_on_disk: body_on_disk,
            index_on_disk: false,
            msg: Some(msg),
        };
        match self.classify(seq_id) {
            Residency::Msg => {
                if persistent {
                    self.write_msg_to_disk(&mut status)?;
                    self.write_index_to_disk(&mut status)?;
                }
                if self.q2.is_empty() && self.delta.count == 0 && self.q3.is_empty() {
                    self.q4.push_back(status);
                } else {
                    self.q1.push_back(status);
                }
                self.ram_msg_count += 1;
                if let Some(target) = self.target_ram_msg_count {
                    if self.ram_msg_count > target {
                        self.push_q1_to_betas(target)?;
                    }
                }
            }
            Residency::Index => {
                self.write_msg_to_disk(&mut status)?;
                if persistent || self.index.flush_required() {
                    self.write_index_to_disk(&mut status)?;
                } else {
                    self.ram_index_count += 1;
                }
                status.msg = None;
                if self.delta.count == 0 {
                    self.q3.push_back(status);
                } else {
                    self.q2.push_back(status);
                }
            }
            Residency::Neither => {
                self.write_msg_to_disk(&mut status)?;
                self.write_index_to_disk(&mut status)?;
                if self.delta.count == 0 {
                    let entry_count = self.index.segment_entry_count();
                    let start = self.index.next_boundary(seq_id) - entry_count;
                    self.delta = Delta {
                        start,
                        count: 1,
                        end: seq_id + 1,
                    };
                } else {
                    self.delta.count += 1;
                    self.delta.end = seq_id + 1;
                }
            }
        }
        self.assert_invariants();
        Ok(seq_id)
    }

    fn write_msg_to_disk(&mut self, status: &mut MsgStatus) -> Result<()> {
        if !status.msg_on_disk {
            let msg = status.msg.as_ref().expect("body present before persist");
            self.store.write(self.store_client, msg)?;
            status.msg_on_disk = true;
        }
        Ok(())
    }

    fn write_index_to_disk(&mut self, status: &mut MsgStatus) -> Result<()> {
        debug_assert!(status.msg_on_disk);
        if !status.index_on_disk {
            self.index
                .publish(status.msg_id, status.seq_id, status.persistent)?;
            if status.delivered {
                self.index.deliver(&[status.seq_id])?;
            }
            status.index_on_disk = true;
        }
        Ok(())
    }

    /// Moves q3's head into q4 (loading its body), refilling q3 from delta
    /// or joining q1 when the pipeline behind it is drained.
    fn fetch_from_q3(&mut self) -> Result<()> {
        let mut status = self.q3.pop_front().expect("fetch_from_q3 on empty q3");
        if status.msg.is_none() {
            status.msg = Some(self.store.read(&status.msg_id)?);
        }
        if !status.index_on_disk {
            self.ram_index_count -= 1;
        }
        self.ram_msg_count += 1;
        self.q4.push_back(status);
        if self.q3.is_empty() {
            if self.delta.count == 0 {
                debug_assert!(self.q2.is_empty());
                let q1 = std::mem::take(&mut self.q1);
                self.q4.extend(q1);
            } else {
                self.maybe_deltas_to_betas()?;
            }
        }
        Ok(())
    }

    /// Loads one index segment's worth of delta into q3 as betas.
    fn maybe_deltas_to_betas(&mut self) -> Result<()> {
        debug_assert!(self.delta.count > 0);
        while self.delta.count > 0 {
            let end = self.index.next_boundary(self.delta.start).min(self.delta.end);
            if end <= self.delta.start {
                debug_assert!(false, "delta region exhausted with count > 0");
                let q2 = std::mem::take(&mut self.q2);
                self.q3.extend(q2);
                self.delta = Delta::EMPTY;
                break;
            }
            let entries = self.index.read(self.delta.start, end);
            let loaded = entries.len();
            for entry in entries {
                self.q3.push_back(MsgStatus {
                    seq_id: entry.seq_id,
                    msg_id: entry.msg_id,
                    msg: None,
                    persistent: entry.persistent,
                    delivered: entry.delivered,
                    msg_on_disk: true,
                    index_on_disk: true,
                });
            }
            self.delta.count = self.delta.count.saturating_sub(loaded);
            self.delta.start = end;
            if self.delta.count == 0 {
                let q2 = std::mem::take(&mut self.q2);
                self.q3.extend(q2);
                self.delta = Delta::EMPTY;
                break;
            }
            if loaded > 0 {
                break;
            }
        }
        Ok(())
    }

    fn finish_fetch(&mut self, mut status: MsgStatus, ack_required: bool) -> Result<Fetched> {
        self.len -= 1;
        self.ram_msg_count -= 1;
        self.rates.note_out();
        if status.index_on_disk && !status.delivered {
            self.index.deliver(&[status.seq_id])?;
        }
        let redelivered = status.delivered;
        status.delivered = true;
        let message = status.msg.clone().expect("alpha has body");
        let ack_tag = if ack_required {
            let tag = if status.persistent {
                AckTag::OnDisk {
                    msg_id: status.msg_id,
                    seq_id: status.seq_id,
                }
            } else {
                if status.msg_on_disk {
                    self.store.remove(&[status.msg_id]);
                    if status.index_on_disk {
                        self.index.ack(&[status.seq_id])?;
                    }
                    status.msg_on_disk = false;
                    status.index_on_disk = false;
                }
                AckTag::NotOnDisk {
                    msg_id: status.msg_id,
                }
            };
            if status.persistent {
                status.msg = None;
            }
            self.pending_ack.insert(status.msg_id, status);
            Some(tag)
        } else {
            if status.msg_on_disk {
                self.store.remove(&[status.msg_id]);
            }
            if status.index_on_disk {
                self.index.ack(&[status.seq_id])?;
            }
            None
        };
        Ok(Fetched {
            message,
            redelivered,
            ack_tag,
            remaining: self.len,
        })
    }

    /// Drops a head message that is already materialised in q4.
    fn drop_head(&mut self, status: MsgStatus) -> Result<()> {
        self.len -= 1;
        self.ram_msg_count -= 1;
        self.rates.note_out();
        if status.msg_on_disk {
            self.store.remove(&[status.msg_id]);
        }
        if status.index_on_disk {
            self.index.ack(&[status.seq_id])?;
        }
        Ok(())
    }

    fn push_q1_to_betas(&mut self, target: usize) -> Result<()> {
        while self.ram_msg_count > target {
            let Some(status) = self.q1.pop_front() else {
                break;
            };
            let beta = self.alpha_to_beta(status)?;
            if self.delta.count == 0 {
                self.q3.push_back(beta);
            } else {
                self.q2.push_back(beta);
            }
        }
        Ok(())
    }

    fn push_q4_to_betas(&mut self, target: usize) -> Result<()> {
        while self.ram_msg_count > target {
            let Some(status) = self.q4.pop_back() else {
                break;
            };
            let beta = self.alpha_to_beta(status)?;
            self.q3.push_front(beta);
        }
        Ok(())
    }

    fn alpha_to_beta(&mut self, mut status: MsgStatus) -> Result<MsgStatus> {
        self.write_msg_to_disk(&mut status)?;
        if !status.index_on_disk {
            self.ram_index_count += 1;
        }
        status.msg = None;
        self.ram_msg_count -= 1;
        Ok(status)
    }

    /// At a zero budget, q2 merges into delta wholesale and q3's tail moves
    /// below it, but only whole segments: q3 keeps everything before the
    /// boundary after its head so one segment is never split between RAM
    /// and disk residency.
    fn push_betas_to_deltas(&mut self) -> Result<()> {
        if !self.q2.is_empty() {
            debug_assert!(self.delta.count > 0);
            let drained: Vec<MsgStatus> = self.q2.drain(..).collect();
            let mut end = self.delta.end;
            let mut count = self.delta.count;
            for mut status in drained {
                self.ensure_index_on_disk(&mut status)?;
                end = end.max(status.seq_id + 1);
                count += 1;
            }
            self.delta.end = end;
            self.delta.count = count;
        }
        let (front_seq, back_seq) = match (self.q3.front(), self.q3.back()) {
            (Some(front), Some(back)) => (front.seq_id, back.seq_id),
            _ => return Ok(()),
        };
        let limit = self.index.next_boundary(front_seq);
        if back_seq < limit {
            return Ok(());
        }
        let mut pushed_min = u64::MAX;
        let mut pushed_max = 0u64;
        let mut pushed = 0usize;
        while self.q3.back().map_or(false, |s| s.seq_id >= limit) {
            let mut status = self.q3.pop_back().expect("q3 tail present");
            self.ensure_index_on_disk(&mut status)?;
            pushed_min = pushed_min.min(status.seq_id);
            pushed_max = pushed_max.max(status.seq_id);
            pushed += 1;
        }
        let entry_count = self.index.segment_entry_count();
        let aligned_start = (pushed_min / entry_count) * entry_count;
        if self.delta.count == 0 {
            self.delta = Delta {
                start: aligned_start,
                count: pushed,
                end: pushed_max + 1,
            };
        } else {
            self.delta.start = self.delta.start.min(aligned_start);
            self.delta.count += pushed;
            self.delta.end = self.delta.end.max(pushed_max + 1);
        }
        Ok(())
    }

    fn ensure_index_on_disk(&mut self, status: &mut MsgStatus) -> Result<()> {
        debug_assert!(status.msg_on_disk);
        if !status.index_on_disk {
            self.index
                .publish(status.msg_id, status.seq_id, status.persistent)?;
            if status.delivered {
                self.index.deliver(&[status.seq_id])?;
            }
            status.index_on_disk = true;
            self.ram_index_count -= 1;
        }
        Ok(())
    }

    /// Betas may keep their index in RAM only up to
    /// `betas - floor(betas^2 / (len - delta.count))`; beyond that, entries
    /// go to disk in batches of at least `RAM_INDEX_BATCH_SIZE`.
    fn permitted_ram_index(&self) -> usize {
        if self.len == 0 {
            return usize::MAX;
        }
        let betas = self.q2.len() + self.q3.len();
        let alphabetas = self.len - self.delta.count;
        if alphabetas == 0 {
            return 0;
        }
        betas - betas * betas / alphabetas
    }

    fn limit_ram_index(&mut self) -> Result<()> {
        let permitted = self.permitted_ram_index();
        let mut to_write = self.ram_index_count.saturating_sub(permitted);
        if to_write < RAM_INDEX_BATCH_SIZE {
            return Ok(());
        }
        let mut wrote = 0usize;
        for status in self.q2.iter_mut().chain(self.q3.iter_mut()) {
            if to_write == 0 {
                break;
            }
            if status.index_on_disk {
                continue;
            }
            self.index
                .publish(status.msg_id, status.seq_id, status.persistent)?;
            if status.delivered {
                self.index.deliver(&[status.seq_id])?;
            }
            status.index_on_disk = true;
            to_write -= 1;
            wrote += 1;
        }
        self.ram_index_count -= wrote;
        Ok(())
    }

    fn reduce_memory_use(&mut self) -> Result<()> {
        if let Some(target) = self.target_ram_msg_count {
            self.push_q1_to_betas(target)?;
            self.push_q4_to_betas(target)?;
            if target == 0 {
                self.push_betas_to_deltas()?;
            }
        }
        self.limit_ram_index()?;
        Ok(())
    }

    fn retarget(&mut self) -> Result<()> {
        if let DurationTarget::Seconds(secs) = self.duration_target {
            let rate = self.rates.avg_ingress() + self.rates.avg_egress();
            let new_target = (secs * rate).trunc() as usize;
            let shrunk = self.target_ram_msg_count.map_or(true, |old| new_target < old);
            self.target_ram_msg_count = Some(new_target);
            if shrunk || new_target < self.ram_msg_count {
                self.reduce_memory_use()?;
            }
        } else {
            self.target_ram_msg_count = None;
        }
        Ok(())
    }

    fn tx_commit_from_msg_store(
        &mut self,
        pubs: Vec<Message>,
        acks: Vec<AckTag>,
        replier: TxReplier,
    ) -> Result<()> {
        self.pending_store_syncs -= 1;
        self.on_sync.acks.push(acks);
        self.on_sync.pubs.push(pubs);
        self.on_sync.repliers.push(replier);
        self.tx_commit_from_vq()
    }

    /// Drains the commit fence: acks first, then publishes, then an index
    /// sync, then replies in submission order.
    fn tx_commit_from_vq(&mut self) -> Result<()> {
        let acks_batches = std::mem::take(&mut self.on_sync.acks);
        let pubs_batches = std::mem::take(&mut self.on_sync.pubs);
        let repliers = std::mem::take(&mut self.on_sync.repliers);
        let mut sync_seqs = Vec::new();
        for batch in acks_batches {
            if !batch.is_empty() {
                self.ack(&batch)?;
            }
        }
        for batch in pubs_batches {
            for msg in batch {
                let persistent = msg.is_persistent() && self.durable;
                let seq = self.publish_inner(msg, false, persistent)?;
                if persistent {
                    sync_seqs.push(seq);
                }
            }
        }
        if !sync_seqs.is_empty() {
            self.index.sync(&sync_seqs)?;
        }
        for replier in repliers {
            replier();
        }
        Ok(())
    }

    #[cfg(test)]
    fn force_target(&mut self, target: Option<usize>) {
        self.target_ram_msg_count = target;
    }

    #[cfg(test)]
    fn delta_count(&self) -> usize {
        self.delta.count
    }

    #[cfg(test)]
    fn stage_lens(&self) -> (usize, usize, usize, usize, usize) {
        (
            self.q1.len(),
            self.q2.len(),
            self.delta.count,
            self.q3.len(),
            self.q4.len(),
        )
    }

    /// Messages whose bodies currently live in RAM.
    pub fn ram_msg_count(&self) -> usize {
        self.ram_msg_count
    }

    fn assert_invariants(&self) {
        #[cfg(debug_assertions)]
        {
            debug_assert_eq!(
                self.len,
                self.q1.len() + self.q2.len() + self.delta.count + self.q3.len() + self.q4.len()
            );
            debug_assert_eq!(self.ram_msg_count, self.q1.len() + self.q4.len());
            for status in self.q1.iter().chain(self.q4.iter()) {
                debug_assert!(status.msg.is_some());
            }
            let ram_idx = self
                .q2
                .iter()
                .chain(self.q3.iter())
                .filter(|s| !s.index_on_disk)
                .count();
            debug_assert_eq!(self.ram_index_count, ram_idx);
            if !self.q2.is_empty() {
                debug_assert!(self.delta.count > 0);
            }
            if self.delta.count > 0 {
                debug_assert!(!self.q3.is_empty());
                debug_assert!(self.delta.count as u64 <= self.delta.end - self.delta.start);
            }
            if self.len > 0 {
                debug_assert!(!self.q3.is_empty() || !self.q4.is_empty());
            }
            fn ordered(q: &VecDeque<MsgStatus>) -> bool {
                q.iter().zip(q.iter().skip(1)).all(|(a, b)| a.seq_id < b.seq_id)
            }
            debug_assert!(ordered(&self.q1));
            debug_assert!(ordered(&self.q2));
            debug_assert!(ordered(&self.q3));
            debug_assert!(ordered(&self.q4));
            if let (Some(a), Some(b)) = (self.q4.back(), self.q3.front()) {
                debug_assert!(a.seq_id < b.seq_id);
            }
            if self.delta.count > 0 {
                if let Some(b) = self.q3.back() {
                    debug_assert!(b.seq_id < self.delta.start);
                }
                if let Some(f) = self.q2.front() {
                    debug_assert!(self.delta.end <= f.seq_id);
                }
            }
            if let (Some(a), Some(b)) = (self.q2.back(), self.q1.front()) {
                debug_assert!(a.seq_id < b.seq_id);
            }
            for status in self
                .q1
                .iter()
                .chain(self.q2.iter())
                .chain(self.q3.iter())
                .chain(self.q4.iter())
            {
                if status.index_on_disk {
                    debug_assert!(status.msg_on_disk);
                }
            }
            for status in self.q2.iter().chain(self.q3.iter()) {
                debug_assert!(status.msg.is_none());
                if status.persistent {
                    debug_assert!(status.msg_on_disk && status.index_on_disk);
                }
            }
        }
    }
}

impl BackingQueue for VariableQueue {
    fn publish(&mut self, msg: Message, delivered: bool) -> Result<u64> {
        self.publish_inner(msg, delivered, false)
    }

    fn publish_delivered(&mut self, msg: Message) -> Result<AckTag> {
        debug_assert!(self.is_empty());
        let seq_id = self.next_seq_id;
        self.next_seq_id += 1;
        self.rates.note_in();
        self.rates.note_out();
        let persistent = msg.is_persistent() && self.durable;
        let mut status = MsgStatus {
            seq_id,
            msg_id: msg.id(),
            persistent,
            delivered: true,
            msg_on_disk: false,
            index_on_disk: false,
            msg: Some(msg),
        };
        let tag = if persistent {
            self.write_msg_to_disk(&mut status)?;
            self.write_index_to_disk(&mut status)?;
            status.msg = None;
            AckTag::OnDisk {
                msg_id: status.msg_id,
                seq_id,
            }
        } else {
            AckTag::NotOnDisk {
                msg_id: status.msg_id,
            }
        };
        self.pending_ack.insert(status.msg_id, status);
        Ok(tag)
    }

    fn fetch(&mut self, ack_required: bool) -> Result<Option<Fetched>> {
        loop {
            if let Some(status) = self.q4.pop_front() {
                let fetched = self.finish_fetch(status, ack_required)?;
                self.assert_invariants();
                return Ok(Some(fetched));
            }
            if self.q3.is_empty() {
                debug_assert!(self.len == 0);
                return Ok(None);
            }
            self.fetch_from_q3()?;
        }
    }

    fn ack(&mut self, tags: &[AckTag]) -> Result<()> {
        let mut remove_ids = Vec::new();
        let mut ack_seqs = Vec::new();
        for tag in tags {
            if self.pending_ack.remove(&tag.msg_id()).is_none() {
                return Err(Error::NotFound(format!("ack tag for {}", tag.msg_id())));
            }
            if let AckTag::OnDisk { msg_id, seq_id } = tag {
                remove_ids.push(*msg_id);
                ack_seqs.push(*seq_id);
            }
        }
        if !remove_ids.is_empty() {
            self.store.remove(&remove_ids);
        }
        if !ack_seqs.is_empty() {
            self.index.ack(&ack_seqs)?;
        }
        Ok(())
    }

    fn requeue(&mut self, tags: &[AckTag]) -> Result<()> {
        let mut statuses = Vec::with_capacity(tags.len());
        for tag in tags {
            let mut status = self
                .pending_ack
                .remove(&tag.msg_id())
                .ok_or_else(|| Error::NotFound(format!("ack tag for {}", tag.msg_id())))?;
            if status.msg.is_none() {
                status.msg = Some(self.store.read(&status.msg_id)?);
            }
            status.delivered = true;
            statuses.push(status);
        }
        statuses.sort_by_key(|s| s.seq_id);
        let released: Vec<MessageId> = statuses
            .iter()
            .filter(|s| s.msg_on_disk)
            .map(|s| s.msg_id)
            .collect();
        for status in statuses {
            let pos = self.q4.partition_point(|s| s.seq_id < status.seq_id);
            self.q4.insert(pos, status);
            self.len += 1;
            self.ram_msg_count += 1;
            self.rates.note_in();
        }
        self.store.release(&released);
        self.assert_invariants();
        Ok(())
    }

    fn dropwhile(&mut self, pred: &mut dyn FnMut(&Properties) -> bool) -> Result<usize> {
        let mut dropped = 0;
        loop {
            if self.q4.is_empty() {
                if self.q3.is_empty() {
                    break;
                }
                self.fetch_from_q3()?;
                continue;
            }
            let head_matches = {
                let head = self.q4.front().expect("q4 non-empty");
                pred(head.msg.as_ref().expect("alpha has body").properties())
            };
            if !head_matches {
                break;
            }
            let status = self.q4.pop_front().expect("q4 non-empty");
            self.drop_head(status)?;
            dropped += 1;
        }
        self.assert_invariants();
        Ok(dropped)
    }

    fn tx_publish(&mut self, txn: TxnId, msg: Message) -> Result<()> {
        if msg.is_persistent() && self.durable {
            self.store.write(self.store_client, &msg)?;
        }
        self.txns.entry(txn).or_default().push(msg);
        Ok(())
    }

    fn tx_rollback(&mut self, txn: TxnId) -> Result<()> {
        if let Some(pubs) = self.txns.remove(&txn) {
            let ids: Vec<MessageId> = pubs
                .iter()
                .filter(|m| m.is_persistent() && self.durable)
                .map(|m| m.id())
                .collect();
            if !ids.is_empty() {
                self.store.remove(&ids);
            }
        }
        Ok(())
    }

    fn tx_commit(&mut self, txn: TxnId, acks: Vec<AckTag>, replier: TxReplier) -> Result<()> {
        let pubs = self.txns.remove(&txn).unwrap_or_default();
        let persistent_ids: Vec<MessageId> = pubs
            .iter()
            .filter(|m| m.is_persistent() && self.durable)
            .map(|m| m.id())
            .collect();
        if persistent_ids.is_empty() {
            self.on_sync.acks.push(acks);
            self.on_sync.pubs.push(pubs);
            self.on_sync.repliers.push(replier);
            return self.tx_commit_from_vq();
        }
        self.pending_store_syncs += 1;
        let callback = Arc::clone(&self.async_callback);
        self.store.sync(
            persistent_ids,
            Box::new(move || {
                callback(Box::new(move |vq: &mut VariableQueue| {
                    if let Err(err) = vq.tx_commit_from_msg_store(pubs, acks, replier) {
                        log::warn!("deferred tx commit failed: {err}");
                    }
                }));
            }),
        )
    }

    fn needs_sync(&self) -> bool {
        self.pending_store_syncs > 0 || !self.on_sync.repliers.is_empty()
    }

    fn flush_journal(&mut self) -> Result<()> {
        self.index.flush_journal()
    }

    fn drain_confirmed(&mut self) -> Vec<MessageId> {
        self.store.drain_confirmed(self.store_client)
    }

    fn len(&self) -> usize {
        self.len
    }

    fn purge(&mut self) -> Result<usize> {
        let count = self.len;
        let mut remove_ids = Vec::new();
        let mut ack_seqs = Vec::new();
        let mut absorb = |status: &MsgStatus, ids: &mut Vec<MessageId>, seqs: &mut Vec<u64>| {
            if status.msg_on_disk {
                ids.push(status.msg_id);
            }
            if status.index_on_disk {
                seqs.push(status.seq_id);
            }
        };
        for status in self.q4.drain(..) {
            absorb(&status, &mut remove_ids, &mut ack_seqs);
        }
        for status in self.q3.drain(..) {
            absorb(&status, &mut remove_ids, &mut ack_seqs);
        }
        while self.delta.count > 0 {
            let end = self.index.next_boundary(self.delta.start).min(self.delta.end);
            let entries = self.index.read(self.delta.start, end);
            for entry in &entries {
                remove_ids.push(entry.msg_id);
                ack_seqs.push(entry.seq_id);
            }
            self.delta.count = self.delta.count.saturating_sub(entries.len());
            self.delta.start = end;
            if end >= self.delta.end {
                break;
            }
        }
        self.delta = Delta::EMPTY;
        for status in self.q2.drain(..) {
            absorb(&status, &mut remove_ids, &mut ack_seqs);
        }
        for status in self.q1.drain(..) {
            absorb(&status, &mut remove_ids, &mut ack_seqs);
        }
        if !remove_ids.is_empty() {
            self.store.remove(&remove_ids);
        }
        if !ack_seqs.is_empty() {
            self.index.ack(&ack_seqs)?;
        }
        self.len = 0;
        self.ram_msg_count = 0;
        self.ram_index_count = 0;
        self.assert_invariants();
        Ok(count)
    }

    fn delete_and_terminate(&mut self) -> Result<usize> {
        let count = self.purge()?;
        let remove_ids: Vec<MessageId> = self
            .pending_ack
            .values()
            .filter(|s| s.msg_on_disk)
            .map(|s| s.msg_id)
            .collect();
        if !remove_ids.is_empty() {
            self.store.remove(&remove_ids);
        }
        self.pending_ack.clear();
        self.index.delete_and_terminate()?;
        Ok(count)
    }

    fn terminate(&mut self) -> Result<()> {
        self.index.flush_journal()?;
        self.index.sync(&[])
    }

    fn discard(&mut self, _msg: Message) -> Result<()> {
        Ok(())
    }

    fn ram_duration(&mut self) -> DurationTarget {
        let rate = self.rates.avg_ingress() + self.rates.avg_egress();
        if rate == 0.0 {
            DurationTarget::Infinity
        } else {
            DurationTarget::Seconds(2.0 * self.ram_msg_count as f64 / rate)
        }
    }

    fn set_ram_duration_target(&mut self, target: DurationTarget) -> Result<()> {
        self.duration_target = target;
        self.retarget()?;
        self.assert_invariants();
        Ok(())
    }

    fn update_ram_duration(&mut self) -> Result<()> {
        let now = self.clock.now_us();
        if self.rates.due(now) {
            self.rates.remeasure(now);
        }
        self.retarget()?;
        self.assert_invariants();
        Ok(())
    }

    fn needs_timeout(&self) -> TimeoutKind {
        if matches!(self.duration_target, DurationTarget::Seconds(_)) {
            TimeoutKind::Timed
        } else if self.index.is_dirty() {
            TimeoutKind::Idle
        } else {
            TimeoutKind::False
        }
    }

    fn timeout(&mut self) -> Result<()> {
        self.index.flush_journal()
    }

    fn handle_pre_hibernate(&mut self) -> Result<()> {
        let now = self.clock.now_us();
        self.rates.remeasure(now);
        self.retarget()?;
        self.index.flush_journal()
    }

    fn status(&self) -> Vec<(&'static str, String)> {
        let (cache_hits, cache_misses) = self.store.cache_stats();
        vec![
            ("len", self.len.to_string()),
            ("q1", self.q1.len().to_string()),
            ("q2", self.q2.len().to_string()),
            ("delta", format!("{:?}", self.delta)),
            ("delta_count", self.delta.count.to_string()),
            ("q3", self.q3.len().to_string()),
            ("q4", self.q4.len().to_string()),
            ("pending_acks", self.pending_ack.len().to_string()),
            ("ram_msg_count", self.ram_msg_count.to_string()),
            ("ram_index_count", self.ram_index_count.to_string()),
            (
                "target_ram_msg_count",
                format!("{:?}", self.target_ram_msg_count),
            ),
            ("next_seq_id", self.next_seq_id.to_string()),
            ("avg_ingress_rate", format!("{:.3}", self.rates.avg_ingress())),
            ("avg_egress_rate", format!("{:.3}", self.rates.avg_egress())),
            ("store_cache_hits", cache_hits.to_string()),
            ("store_cache_misses", cache_misses.to_string()),
        ]
    }
}
