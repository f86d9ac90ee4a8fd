use std::fmt;
use std::sync::Arc;

use rand::RngCore;

/// Unique message identifier. Identity is the id; payload bytes never
/// participate in equality.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub [u8; 16]);

impl MessageId {
    pub fn fresh() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId(")?;
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Content properties carried alongside the payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    /// Per-message expiration in milliseconds, as set by the publisher.
    pub expiration_ms: Option<u64>,
    /// Absolute expiry stamped by the queue at publish, microseconds since
    /// the UNIX epoch. Survives disk round-trips so head expiry checks work
    /// on reloaded bodies.
    pub expiry_at_us: Option<u64>,
}

/// An immutable broker message.
///
/// The payload is behind an `Arc` so residency moves (dropping a body from
/// memory, reloading it from the store) never copy bytes between owners.
#[derive(Debug, Clone)]
pub struct Message {
    id: MessageId,
    persistent: bool,
    properties: Properties,
    payload: Arc<[u8]>,
}

impl Message {
    pub fn new(persistent: bool, properties: Properties, payload: impl Into<Arc<[u8]>>) -> Self {
        Self {
            id: MessageId::fresh(),
            persistent,
            properties,
            payload: payload.into(),
        }
    }

    /// Rebuilds a message read back from the store, keeping its original id.
    pub fn from_parts(
        id: MessageId,
        persistent: bool,
        properties: Properties,
        payload: impl Into<Arc<[u8]>>,
    ) -> Self {
        Self {
            id,
            persistent,
            properties,
            payload: payload.into(),
        }
    }

    pub fn transient(payload: impl Into<Arc<[u8]>>) -> Self {
        Self::new(false, Properties::default(), payload)
    }

    pub fn persistent(payload: impl Into<Arc<[u8]>>) -> Self {
        Self::new(true, Properties::default(), payload)
    }

    pub fn with_expiration_ms(mut self, ms: u64) -> Self {
        self.properties.expiration_ms = Some(ms);
        self
    }

    pub fn with_expiry_at_us(mut self, at_us: u64) -> Self {
        self.properties.expiry_at_us = Some(at_us);
        self
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_arc(&self) -> Arc<[u8]> {
        Arc::clone(&self.payload)
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Message {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_the_id() {
        let a = Message::transient(&b"same"[..]);
        let b = Message::transient(&b"same"[..]);
        assert_ne!(a, b);

        let c = Message::from_parts(a.id(), false, Properties::default(), &b"other"[..]);
        assert_eq!(a, c);
    }

    #[test]
    fn fresh_ids_do_not_collide() {
        let ids: Vec<_> = (0..64).map(|_| MessageId::fresh()).collect();
        for (i, a) in ids.iter().enumerate() {
            for b in &ids[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
