//! Per-channel prefetch limiter.
//!
//! One limiter exists per channel and is consulted by every queue the
//! channel consumes from. It tracks the channel-wide volume of in-flight
//! ack-requiring deliveries against the prefetch cap, plus a blocked flag
//! for channel-wide flow control. Queues that were refused are remembered
//! and notified when capacity returns, in randomised order so no queue is
//! starved.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rand::seq::SliceRandom;

/// Callback a queue registers to learn it may try sending again.
pub type UnblockSink = Box<dyn Fn() + Send>;

struct QueueEntry {
    notify: UnblockSink,
    needs_notify: bool,
}

struct LimiterState {
    /// 0 disables the cap.
    prefetch_count: usize,
    /// In-flight ack-requiring deliveries across the whole channel.
    volume: usize,
    /// Channel-wide flow-control override.
    blocked: bool,
    queues: HashMap<String, QueueEntry>,
}

impl LimiterState {
    fn can_send_now(&self) -> bool {
        !self.blocked && !(self.prefetch_count > 0 && self.volume >= self.prefetch_count)
    }

    fn notify_waiting(&mut self) {
        let mut waiting: Vec<&mut QueueEntry> = self
            .queues
            .values_mut()
            .filter(|entry| entry.needs_notify)
            .collect();
        waiting.shuffle(&mut rand::thread_rng());
        for entry in waiting {
            entry.needs_notify = false;
            (entry.notify)();
        }
    }
}

pub struct Limiter {
    state: Mutex<LimiterState>,
}

impl Limiter {
    pub fn new(prefetch_count: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(LimiterState {
                prefetch_count,
                volume: 0,
                blocked: false,
                queues: HashMap::new(),
            }),
        })
    }

    /// May the channel take one more delivery for `queue`? A refusal marks
    /// the queue for notification on the next capacity transition.
    pub fn can_send(&self, queue: &str, ack_required: bool) -> bool {
        let mut state = self.state.lock();
        if !state.can_send_now() {
            if let Some(entry) = state.queues.get_mut(queue) {
                entry.needs_notify = true;
            }
            return false;
        }
        if ack_required {
            state.volume += 1;
        }
        true
    }

    /// `n` deliveries were settled by the consumer.
    pub fn ack(&self, n: usize) {
        self.transition(|state| {
            state.volume = state.volume.saturating_sub(n);
        });
    }

    pub fn block(&self) {
        self.transition(|state| state.blocked = true);
    }

    pub fn unblock(&self) {
        self.transition(|state| state.blocked = false);
    }

    /// Updates the prefetch cap. Returns `true` when the limiter ended up
    /// disabled so callers stop routing through it.
    pub fn set_limit(&self, prefetch_count: usize) -> bool {
        self.transition(|state| state.prefetch_count = prefetch_count);
        self.state.lock().prefetch_count == 0
    }

    pub fn get_limit(&self) -> usize {
        self.state.lock().prefetch_count
    }

    pub fn is_blocked(&self) -> bool {
        self.state.lock().blocked
    }

    pub fn register(&self, queue: impl Into<String>, notify: UnblockSink) {
        self.state.lock().queues.insert(
            queue.into(),
            QueueEntry {
                notify,
                needs_notify: false,
            },
        );
    }

    pub fn unregister(&self, queue: &str) {
        self.state.lock().queues.remove(queue);
    }

    fn transition(&self, mutate: impl FnOnce(&mut LimiterState)) {
        let mut state = self.state.lock();
        let could_send = state.can_send_now();
        mutate(&mut state);
        if !could_send && state.can_send_now() {
            state.notify_waiting();
        }
    }

    #[cfg(debug_assertions)]
    pub fn assert_invariants(&self) {
        let state = self.state.lock();
        if state.prefetch_count > 0 && !state.blocked && !state.can_send_now() {
            debug_assert!(state.volume >= state.prefetch_count);
        }
    }
}

/// The handle a consumer holds. When `enabled` is false, or the limiter has
/// died, every method short-circuits to the permissive default -- a dead
/// limiter can never wedge a queue.
#[derive(Clone, Default)]
pub struct LimiterToken {
    limiter: Option<Weak<Limiter>>,
}

impl LimiterToken {
    pub fn disabled() -> Self {
        Self { limiter: None }
    }

    pub fn enabled(limiter: &Arc<Limiter>) -> Self {
        Self {
            limiter: Some(Arc::downgrade(limiter)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(&self.limiter, Some(weak) if weak.strong_count() > 0)
    }

    pub fn can_send(&self, queue: &str, ack_required: bool) -> bool {
        match self.upgrade() {
            Some(limiter) => limiter.can_send(queue, ack_required),
            None => true,
        }
    }

    pub fn ack(&self, n: usize) {
        if let Some(limiter) = self.upgrade() {
            limiter.ack(n);
        }
    }

    pub fn is_blocked(&self) -> bool {
        match self.upgrade() {
            Some(limiter) => limiter.is_blocked(),
            None => false,
        }
    }

    pub fn get_limit(&self) -> usize {
        match self.upgrade() {
            Some(limiter) => limiter.get_limit(),
            None => 0,
        }
    }

    pub fn register(&self, queue: impl Into<String>, notify: UnblockSink) {
        if let Some(limiter) = self.upgrade() {
            limiter.register(queue, notify);
        }
    }

    pub fn unregister(&self, queue: &str) {
        if let Some(limiter) = self.upgrade() {
            limiter.unregister(queue);
        }
    }

    fn upgrade(&self) -> Option<Arc<Limiter>> {
        self.limiter.as_ref().and_then(Weak::upgrade)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter_sink(counter: &Arc<AtomicUsize>) -> UnblockSink {
        let counter = Arc::clone(counter);
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn volume_gates_at_prefetch() {
        let limiter = Limiter::new(2);
        assert!(limiter.can_send("q", true));
        assert!(limiter.can_send("q", true));
        assert!(!limiter.can_send("q", true));
        // Deliveries not requiring ack never consume volume.
        limiter.ack(2);
        assert!(limiter.can_send("q", false));
        assert!(limiter.can_send("q", false));
        limiter.assert_invariants();
    }

    #[test]
    fn refused_queues_are_notified_on_ack() {
        let limiter = Limiter::new(1);
        let notified = Arc::new(AtomicUsize::new(0));
        limiter.register("q1", counter_sink(&notified));
        limiter.register("q2", counter_sink(&notified));

        assert!(limiter.can_send("q1", true));
        assert!(!limiter.can_send("q1", true));
        assert!(!limiter.can_send("q2", true));

        limiter.ack(1);
        assert_eq!(notified.load(Ordering::SeqCst), 2);
        // Flags were cleared: another ack notifies nobody.
        limiter.ack(1);
        assert_eq!(notified.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn block_overrides_capacity() {
        let limiter = Limiter::new(0);
        let notified = Arc::new(AtomicUsize::new(0));
        limiter.register("q", counter_sink(&notified));

        limiter.block();
        assert!(!limiter.can_send("q", false));
        limiter.unblock();
        assert_eq!(notified.load(Ordering::SeqCst), 1);
        assert!(limiter.can_send("q", false));
    }

    #[test]
    fn set_limit_reports_disabled() {
        let limiter = Limiter::new(5);
        assert!(!limiter.set_limit(3));
        assert!(limiter.set_limit(0));
        assert_eq!(limiter.get_limit(), 0);
    }

    #[test]
    fn dead_limiter_token_defaults_to_permitted() {
        let limiter = Limiter::new(1);
        let token = LimiterToken::enabled(&limiter);
        assert!(token.can_send("q", true));
        assert!(!token.can_send("q", true));

        drop(limiter);
        assert!(!token.is_enabled());
        assert!(token.can_send("q", true));
        assert!(!token.is_blocked());
        token.ack(1);
    }

    #[test]
    fn disabled_token_short_circuits() {
        let token = LimiterToken::disabled();
        assert!(token.can_send("q", true));
        assert!(!token.is_blocked());
    }
}
