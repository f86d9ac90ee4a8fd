//! Consumer rosters, channel records and per-consumer link credit.

use std::collections::{HashMap, VecDeque};

use crate::backing::AckTag;
use crate::limiter::LimiterToken;
use crate::queue::ChannelHandle;
use crate::queue::ChannelId;

/// A channel blocks once this many deliveries are in flight to it.
pub const UNSENT_MESSAGE_LIMIT: u32 = 100;

/// Wrap-tolerant difference `a - b` over a serial-number window.
pub fn serial_diff(a: u32, b: u32) -> i64 {
    (a.wrapping_sub(b) as i32) as i64
}

#[derive(Debug, Clone)]
pub struct Consumer {
    pub channel: ChannelId,
    pub tag: String,
    pub ack_required: bool,
}

/// Per-consumer AMQP 1.0-style link credit. `count` is a wrap-tolerant
/// delivery serial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreditRecord {
    pub credit: u32,
    pub count: u32,
    pub drain: bool,
}

impl CreditRecord {
    pub fn credit_left(&self) -> bool {
        self.credit > 0
    }

    /// One delivery happened: advance the serial, spend one credit.
    pub fn decr(&mut self) {
        self.count = self.count.wrapping_add(1);
        self.credit = self.credit.saturating_sub(1);
    }

    /// Rebase against a fresh `(count, credit)` advertisement: deliveries
    /// the sender already counted locally are deducted from the new grant.
    pub fn rebase(&mut self, credit: u32, count: u32, drain: bool) {
        let advanced = serial_diff(self.count, count).max(0);
        self.credit = (credit as i64 - advanced).max(0) as u32;
        self.drain = drain;
    }
}

/// Queue-side state for one subscribed channel.
pub struct ChannelRecord {
    pub handle: ChannelHandle,
    pub consumer_count: usize,
    /// Outstanding deliveries, in delivery order, with the consumer that
    /// received each.
    pub unacked: Vec<(AckTag, String)>,
    pub limiter: LimiterToken,
    pub is_limit_active: bool,
    pub unsent_message_count: u32,
}

impl ChannelRecord {
    pub fn new(handle: ChannelHandle, limiter: LimiterToken) -> Self {
        Self {
            handle,
            consumer_count: 0,
            unacked: Vec::new(),
            limiter,
            is_limit_active: false,
            unsent_message_count: 0,
        }
    }

    pub fn is_unsent_blocked(&self) -> bool {
        self.unsent_message_count >= UNSENT_MESSAGE_LIMIT
    }

    /// A record dies once nothing references it any more.
    pub fn is_idle(&self) -> bool {
        self.consumer_count == 0 && self.unacked.is_empty() && self.unsent_message_count == 0
    }
}

/// The two consumer rosters. A consumer lives in exactly one of them; the
/// active roster never holds a consumer whose channel is blocked.
#[derive(Default)]
pub struct Rosters {
    pub active: VecDeque<Consumer>,
    pub blocked: VecDeque<Consumer>,
}

impl Rosters {
    pub fn is_empty(&self) -> bool {
        self.active.is_empty() && self.blocked.is_empty()
    }

    pub fn total(&self) -> usize {
        self.active.len() + self.blocked.len()
    }

    /// Moves every consumer of `channel` from active to blocked.
    pub fn block_channel(&mut self, channel: ChannelId) {
        let mut kept = VecDeque::with_capacity(self.active.len());
        for consumer in self.active.drain(..) {
            if consumer.channel == channel {
                self.blocked.push_back(consumer);
            } else {
                kept.push_back(consumer);
            }
        }
        self.active = kept;
    }

    /// Moves `channel`'s consumers back to active, skipping any the given
    /// predicate rejects (e.g. consumers with no credit left).
    pub fn unblock_channel(&mut self, channel: ChannelId, mut eligible: impl FnMut(&Consumer) -> bool) {
        let mut kept = VecDeque::with_capacity(self.blocked.len());
        for consumer in self.blocked.drain(..) {
            if consumer.channel == channel && eligible(&consumer) {
                self.active.push_back(consumer);
            } else {
                kept.push_back(consumer);
            }
        }
        self.blocked = kept;
    }

    /// Moves one consumer (by tag) from blocked to active, if present.
    pub fn unblock_consumer(&mut self, tag: &str) {
        if let Some(pos) = self.blocked.iter().position(|c| c.tag == tag) {
            let consumer = self.blocked.remove(pos).expect("position valid");
            self.active.push_back(consumer);
        }
    }

    /// Removes every consumer of `channel`, returning their tags.
    pub fn remove_channel(&mut self, channel: ChannelId) -> Vec<String> {
        let mut tags = Vec::new();
        self.active.retain(|c| {
            if c.channel == channel {
                tags.push(c.tag.clone());
                false
            } else {
                true
            }
        });
        self.blocked.retain(|c| {
            if c.channel == channel {
                tags.push(c.tag.clone());
                false
            } else {
                true
            }
        });
        tags
    }

    /// Removes one consumer by tag; returns it if found.
    pub fn remove_consumer(&mut self, channel: ChannelId, tag: &str) -> Option<Consumer> {
        if let Some(pos) = self
            .active
            .iter()
            .position(|c| c.channel == channel && c.tag == tag)
        {
            return self.active.remove(pos);
        }
        if let Some(pos) = self
            .blocked
            .iter()
            .position(|c| c.channel == channel && c.tag == tag)
        {
            return self.blocked.remove(pos);
        }
        None
    }

    pub fn holds_tag(&self, tag: &str) -> bool {
        self.active.iter().chain(self.blocked.iter()).any(|c| c.tag == tag)
    }
}

/// Credit map keyed by consumer tag. Absent entries are unlimited.
pub type CreditMap = HashMap<String, CreditRecord>;

pub fn credit_left(credit: &CreditMap, tag: &str) -> bool {
    credit.get(tag).map_or(true, CreditRecord::credit_left)
}
