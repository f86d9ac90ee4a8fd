//! AMQP-style broker queue core.
//!
//! One queue is one single-threaded actor owning a variable queue: a
//! five-stage tiered residency pipeline that moves message bodies and
//! positions between RAM and disk under a rate-derived memory budget, while
//! dispatch is gated by per-consumer link credit, per-channel prefetch
//! limits and producer-side credit flow.

pub mod backing;
pub mod clock;
pub mod config;
pub mod credit_flow;
pub mod delegate;
pub mod error;
pub mod file_cache;
pub mod index;
pub mod limiter;
pub mod message;
pub mod plugins;
pub mod queue;
pub mod recovery;
pub mod store;
pub mod vq;

pub use backing::{AckTag, BackingQueue, DurationTarget, Fetched, TimeoutKind};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ArgValue, HaPolicy, QueueArgs};
pub use error::{Error, Result};
pub use limiter::{Limiter, LimiterToken};
pub use message::{Message, MessageId, Properties};
pub use queue::{spawn_queue, ChannelEvent, ChannelHandle, QueueConfig, QueueHandle};
pub use store::{MessageStore, SyncMode};
pub use vq::VariableQueue;
