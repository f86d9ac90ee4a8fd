//! Prioritised actor mailbox.
//!
//! Senders stamp each command with a priority; the receiver drains the
//! channel into a heap and pops the highest priority first, FIFO within a
//! priority. All operations on the receiving side are non-blocking except
//! the final wait for new input.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};

pub(crate) struct Prioritised<T> {
    priority: u8,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Prioritised<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<T> Eq for Prioritised<T> {}

impl<T> Ord for Prioritised<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: highest priority wins, earliest arrival breaks ties.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<T> PartialOrd for Prioritised<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub(crate) enum Received<T> {
    Item(T),
    Timeout,
    Disconnected,
}

pub(crate) struct MailboxSender<T> {
    tx: Sender<(u8, T)>,
}

impl<T> Clone for MailboxSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> MailboxSender<T> {
    pub fn send(&self, priority: u8, item: T) -> bool {
        self.tx.send((priority, item)).is_ok()
    }
}

pub(crate) struct Mailbox<T> {
    rx: Receiver<(u8, T)>,
    heap: BinaryHeap<Prioritised<T>>,
    next_seq: u64,
}

pub(crate) fn mailbox<T>() -> (MailboxSender<T>, Mailbox<T>) {
    let (tx, rx) = unbounded();
    (
        MailboxSender { tx },
        Mailbox {
            rx,
            heap: BinaryHeap::new(),
            next_seq: 0,
        },
    )
}

impl<T> Mailbox<T> {
    fn push(&mut self, priority: u8, item: T) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Prioritised {
            priority,
            seq,
            item,
        });
    }

    fn drain_channel(&mut self) -> bool {
        loop {
            match self.rx.try_recv() {
                Ok((priority, item)) => self.push(priority, item),
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    /// Waits up to `timeout` for the next command (`None` waits forever).
    pub fn recv(&mut self, timeout: Option<Duration>) -> Received<T> {
        let connected = self.drain_channel();
        if let Some(entry) = self.heap.pop() {
            return Received::Item(entry.item);
        }
        if !connected {
            return Received::Disconnected;
        }
        match timeout {
            None => match self.rx.recv() {
                Ok((priority, item)) => {
                    self.push(priority, item);
                    self.drain_channel();
                    Received::Item(self.heap.pop().expect("just pushed").item)
                }
                Err(_) => Received::Disconnected,
            },
            Some(timeout) => match self.rx.recv_timeout(timeout) {
                Ok((priority, item)) => {
                    self.push(priority, item);
                    self.drain_channel();
                    Received::Item(self.heap.pop().expect("just pushed").item)
                }
                Err(RecvTimeoutError::Timeout) => Received::Timeout,
                Err(RecvTimeoutError::Disconnected) => Received::Disconnected,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_order_with_fifo_ties() {
        let (tx, mut rx) = mailbox();
        tx.send(0, "low-1");
        tx.send(7, "high-1");
        tx.send(0, "low-2");
        tx.send(7, "high-2");
        tx.send(9, "top");

        let mut out = Vec::new();
        for _ in 0..5 {
            match rx.recv(Some(Duration::from_millis(10))) {
                Received::Item(s) => out.push(s),
                _ => panic!("expected item"),
            }
        }
        assert_eq!(out, vec!["top", "high-1", "high-2", "low-1", "low-2"]);
    }

    #[test]
    fn timeout_and_disconnect() {
        let (tx, mut rx) = mailbox::<u8>();
        assert!(matches!(
            rx.recv(Some(Duration::from_millis(5))),
            Received::Timeout
        ));
        drop(tx);
        assert!(matches!(
            rx.recv(Some(Duration::from_millis(5))),
            Received::Disconnected
        ));
    }
}
