//! Shared rig for the end-to-end queue scenarios.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::Receiver;
use tempfile::TempDir;

use sluice::backing::AckTag;
use sluice::clock::{Clock, ManualClock};
use sluice::config::QueueArgs;
use sluice::file_cache::CacheServer;
use sluice::index::QueueIndex;
use sluice::message::Message;
use sluice::queue::{spawn_queue, ChannelEvent, ChannelHandle, ChannelId, QueueConfig, QueueHandle};
use sluice::store::{MessageStore, SyncMode};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);
pub const QUIET: Duration = Duration::from_millis(120);

pub struct Broker {
    pub dir: TempDir,
    pub clock: ManualClock,
    pub server: Arc<CacheServer>,
    pub store: Arc<MessageStore>,
}

pub fn broker(sync_mode: SyncMode) -> Broker {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::new(1_000_000_000);
    let server = CacheServer::with_limit(Arc::new(clock.clone()), 512);
    let store = MessageStore::open(dir.path().join("store"), &server, sync_mode).unwrap();
    Broker {
        dir,
        clock,
        server,
        store,
    }
}

impl Broker {
    pub fn spawn(&self, config: QueueConfig, segment_entries: u64) -> QueueHandle {
        self.spawn_with_clock(config, segment_entries, Arc::new(self.clock.clone()))
    }

    pub fn spawn_with_clock(
        &self,
        config: QueueConfig,
        segment_entries: u64,
        clock: Arc<dyn Clock>,
    ) -> QueueHandle {
        let index = QueueIndex::open_with_entry_count(
            self.dir.path().join(format!("index-{}", config.name)),
            &self.server,
            segment_entries,
        )
        .unwrap();
        spawn_queue(config, Arc::clone(&self.store), index, clock)
    }
}

pub fn queue_config(name: &str) -> QueueConfig {
    QueueConfig {
        name: name.to_string(),
        durable: false,
        auto_delete: false,
        args: QueueArgs::default(),
        exclusive_owner: None,
    }
}

pub fn channel(id: ChannelId) -> (ChannelHandle, Receiver<ChannelEvent>) {
    ChannelHandle::new(id)
}

pub struct Delivery {
    pub consumer_tag: String,
    pub ack_tag: Option<AckTag>,
    pub message: Message,
    pub redelivered: bool,
}

/// Waits for the next delivery, skipping unrelated events.
pub fn recv_deliver(rx: &Receiver<ChannelEvent>) -> Delivery {
    loop {
        match rx.recv_timeout(RECV_TIMEOUT).expect("expected a delivery") {
            ChannelEvent::Deliver {
                consumer_tag,
                ack_tag,
                message,
                redelivered,
            } => {
                return Delivery {
                    consumer_tag,
                    ack_tag,
                    message,
                    redelivered,
                }
            }
            _ => continue,
        }
    }
}

pub fn assert_no_deliver(rx: &Receiver<ChannelEvent>) {
    let deadline = std::time::Instant::now() + QUIET;
    while let Ok(event) = rx.recv_deadline(deadline) {
        if let ChannelEvent::Deliver { message, .. } = event {
            panic!("unexpected delivery of {:?}", message.id());
        }
    }
}

/// Blocks until every previously sent ordinary-priority command (publishes
/// included) has been processed: an empty commit fence rides the same
/// priority lane and replies synchronously.
pub fn settle(queue: &QueueHandle) {
    queue
        .tx_commit(u64::MAX)
        .unwrap()
        .recv_timeout(RECV_TIMEOUT)
        .unwrap();
}

pub fn info_value(items: &[(&'static str, String)], key: &str) -> String {
    items
        .iter()
        .find(|(k, _)| *k == key)
        .unwrap_or_else(|| panic!("missing info item {key}"))
        .1
        .clone()
}
