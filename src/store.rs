//! Reference-counted message body store.
//!
//! Bodies append to a single data file through the handle cache; an
//! in-memory map tracks offsets, reference counts and a read cache of hot
//! bodies. Mutations are linearised behind one lock, matching the
//! single-actor contract the queues rely on. Persistent writes are
//! confirmed back to their writing client once they are safely on disk;
//! `SyncMode::Manual` defers that moment so tests can observe the window.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::file_cache::{CacheServer, Client, HandleId, Mode, WriteBuffer};
use crate::message::{Message, MessageId, Properties};
use crate::{Error, Result};

const DATA_FILE: &str = "msgs.dat";
const WRITE_BUFFER: usize = 64 * 1024;

const FLAG_PERSISTENT: u8 = 0b0000_0001;
const FLAG_HAS_EXPIRATION: u8 = 0b0000_0010;
const FLAG_HAS_EXPIRY_AT: u8 = 0b0000_0100;

const RECORD_HEADER: usize = 41;

/// When a write counts as "on disk" for confirm purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Every write is flushed and confirmable immediately.
    WriteThrough,
    /// Writes sit unsynced until `run_pending_syncs` is called.
    Manual,
}

/// Identifies one registered writer (a queue) for confirm routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StoreClientId(u64);

type SyncCallback = Box<dyn FnOnce() + Send>;

struct Entry {
    offset: u64,
    len: usize,
    ref_count: usize,
}

struct Inner {
    cache: Client,
    data: HandleId,
    /// Running end-of-file position; reads move the handle's offset, so the
    /// next record's location is tracked here.
    append_offset: u64,
    sync_mode: SyncMode,
    entries: HashMap<MessageId, Entry>,
    read_cache: HashMap<MessageId, Message>,
    unsynced: Vec<(StoreClientId, MessageId)>,
    pending_syncs: Vec<SyncCallback>,
    confirmed: HashMap<StoreClientId, Vec<MessageId>>,
    next_client: u64,
    cache_hits: u64,
    cache_misses: u64,
}

pub struct MessageStore {
    inner: Mutex<Inner>,
}

impl MessageStore {
    pub fn open(dir: impl AsRef<Path>, server: &Arc<CacheServer>, sync_mode: SyncMode) -> Result<Arc<Self>> {
        let dir: PathBuf = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let mut cache = Client::new(server);
        let data = cache.open(
            dir.join(DATA_FILE),
            Mode::READ_WRITE,
            WriteBuffer::Limit(WRITE_BUFFER),
        )?;
        let append_offset = cache.size(data)?;
        Ok(Arc::new(Self {
            inner: Mutex::new(Inner {
                cache,
                data,
                append_offset,
                sync_mode,
                entries: HashMap::new(),
                read_cache: HashMap::new(),
                unsynced: Vec::new(),
                pending_syncs: Vec::new(),
                confirmed: HashMap::new(),
                next_client: 0,
                cache_hits: 0,
                cache_misses: 0,
            }),
        }))
    }

    pub fn register(&self) -> StoreClientId {
        let mut inner = self.inner.lock();
        let id = StoreClientId(inner.next_client);
        inner.next_client += 1;
        inner.confirmed.insert(id, Vec::new());
        id
    }

    /// Writes a body, or bumps the reference count when the id is already
    /// present. Persistent writes are queued for confirmation.
    pub fn write(&self, client: StoreClientId, msg: &Message) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(&msg.id()) {
            entry.ref_count += 1;
            return Ok(());
        }
        let record = encode_record(msg);
        let data = inner.data;
        let offset = inner.append_offset;
        inner.cache.append(data, &record)?;
        inner.append_offset += record.len() as u64;
        inner.entries.insert(
            msg.id(),
            Entry {
                offset,
                len: record.len(),
                ref_count: 1,
            },
        );
        if msg.is_persistent() {
            match inner.sync_mode {
                SyncMode::WriteThrough => {
                    let data = inner.data;
                    inner.cache.flush(data)?;
                    inner
                        .confirmed
                        .entry(client)
                        .or_default()
                        .push(msg.id());
                }
                SyncMode::Manual => inner.unsynced.push((client, msg.id())),
            }
        }
        Ok(())
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.inner.lock().entries.contains_key(id)
    }

    /// Reads a body back, via the hot cache when possible.
    pub fn read(&self, id: &MessageId) -> Result<Message> {
        let mut inner = self.inner.lock();
        if let Some(msg) = inner.read_cache.get(id) {
            let msg = msg.clone();
            inner.cache_hits += 1;
            return Ok(msg);
        }
        inner.cache_misses += 1;
        let entry = inner
            .entries
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("message {id}")))?;
        let (offset, len) = (entry.offset, entry.len);
        let data = inner.data;
        let bytes = inner.cache.pread(data, offset, len)?;
        if bytes.len() != len {
            return Err(Error::Corrupt("short read from message store"));
        }
        let msg = decode_record(&bytes)?;
        if msg.id() != *id {
            return Err(Error::Corrupt("message id mismatch in store"));
        }
        inner.read_cache.insert(*id, msg.clone());
        Ok(msg)
    }

    /// Drops one reference per id; the last reference erases the entry.
    pub fn remove(&self, ids: &[MessageId]) {
        let mut inner = self.inner.lock();
        for id in ids {
            let gone = match inner.entries.get_mut(id) {
                Some(entry) => {
                    entry.ref_count -= 1;
                    entry.ref_count == 0
                }
                None => false,
            };
            if gone {
                inner.entries.remove(id);
                inner.read_cache.remove(id);
            }
        }
    }

    /// Evicts bodies from the read cache without touching disk state, so
    /// requeued tail items stop being held hot.
    pub fn release(&self, ids: &[MessageId]) {
        let mut inner = self.inner.lock();
        for id in ids {
            inner.read_cache.remove(id);
        }
    }

    /// Asks for the given ids to be made durable. The callback fires once
    /// they are; under `Manual` that waits for `run_pending_syncs`.
    pub fn sync(&self, _ids: Vec<MessageId>, on_synced: SyncCallback) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.sync_mode {
            SyncMode::WriteThrough => {
                let data = inner.data;
                inner.cache.sync(data)?;
                drop(inner);
                on_synced();
            }
            SyncMode::Manual => inner.pending_syncs.push(on_synced),
        }
        Ok(())
    }

    /// Flushes the data file and fires every queued sync callback. Returns
    /// how many callbacks ran.
    pub fn run_pending_syncs(&self) -> Result<usize> {
        let callbacks = {
            let mut inner = self.inner.lock();
            let data = inner.data;
            inner.cache.sync(data)?;
            let newly: Vec<(StoreClientId, MessageId)> = inner.unsynced.drain(..).collect();
            for (client, id) in newly {
                inner.confirmed.entry(client).or_default().push(id);
            }
            inner.pending_syncs.drain(..).collect::<Vec<SyncCallback>>()
        };
        let count = callbacks.len();
        for callback in callbacks {
            callback();
        }
        Ok(count)
    }

    /// Ids written by `client` that have reached disk since the last drain.
    pub fn drain_confirmed(&self, client: StoreClientId) -> Vec<MessageId> {
        let mut inner = self.inner.lock();
        inner
            .confirmed
            .get_mut(&client)
            .map(std::mem::take)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (read-cache hits, misses) since open.
    pub fn cache_stats(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        (inner.cache_hits, inner.cache_misses)
    }
}

fn encode_record(msg: &Message) -> Vec<u8> {
    let payload = msg.payload();
    let props = msg.properties();
    let mut flags = 0u8;
    if msg.is_persistent() {
        flags |= FLAG_PERSISTENT;
    }
    if props.expiration_ms.is_some() {
        flags |= FLAG_HAS_EXPIRATION;
    }
    if props.expiry_at_us.is_some() {
        flags |= FLAG_HAS_EXPIRY_AT;
    }
    let mut buf = Vec::with_capacity(RECORD_HEADER + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    buf.extend_from_slice(msg.id().as_bytes());
    buf.push(flags);
    buf.extend_from_slice(&props.expiration_ms.unwrap_or(0).to_le_bytes());
    buf.extend_from_slice(&props.expiry_at_us.unwrap_or(0).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

fn decode_record(bytes: &[u8]) -> Result<Message> {
    if bytes.len() < RECORD_HEADER {
        return Err(Error::Corrupt("message record too short"));
    }
    let len = u32::from_le_bytes(bytes[0..4].try_into().expect("slice length")) as usize;
    let crc = u32::from_le_bytes(bytes[4..8].try_into().expect("slice length"));
    let mut id = [0u8; 16];
    id.copy_from_slice(&bytes[8..24]);
    let flags = bytes[24];
    let expiration = u64::from_le_bytes(bytes[25..33].try_into().expect("slice length"));
    let expiry_at = u64::from_le_bytes(bytes[33..41].try_into().expect("slice length"));
    let payload = &bytes[RECORD_HEADER..];
    if payload.len() != len {
        return Err(Error::Corrupt("message record length mismatch"));
    }
    if crc32fast::hash(payload) != crc {
        return Err(Error::Corrupt("message record crc mismatch"));
    }
    let properties = Properties {
        expiration_ms: (flags & FLAG_HAS_EXPIRATION != 0).then_some(expiration),
        expiry_at_us: (flags & FLAG_HAS_EXPIRY_AT != 0).then_some(expiry_at),
    };
    Ok(Message::from_parts(
        MessageId(id),
        flags & FLAG_PERSISTENT != 0,
        properties,
        payload.to_vec(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tempfile::TempDir;

    fn store(mode: SyncMode) -> (TempDir, Arc<MessageStore>) {
        let dir = TempDir::new().unwrap();
        let server = CacheServer::with_limit(Arc::new(ManualClock::new(0)), 64);
        let store = MessageStore::open(dir.path(), &server, mode).unwrap();
        (dir, store)
    }

    #[test]
    fn write_read_round_trip() {
        let (_dir, store) = store(SyncMode::WriteThrough);
        let client = store.register();
        let msg = Message::persistent(&b"body"[..]).with_expiration_ms(250);
        store.write(client, &msg).unwrap();

        let back = store.read(&msg.id()).unwrap();
        assert_eq!(back.id(), msg.id());
        assert_eq!(back.payload(), b"body");
        assert!(back.is_persistent());
        assert_eq!(back.properties().expiration_ms, Some(250));
    }

    #[test]
    fn refcounts_survive_one_remove() {
        let (_dir, store) = store(SyncMode::WriteThrough);
        let client = store.register();
        let msg = Message::transient(&b"shared"[..]);
        store.write(client, &msg).unwrap();
        store.write(client, &msg).unwrap();

        store.remove(&[msg.id()]);
        assert!(store.contains(&msg.id()));
        store.remove(&[msg.id()]);
        assert!(!store.contains(&msg.id()));
    }

    #[test]
    fn release_only_drops_cache_heat() {
        let (_dir, store) = store(SyncMode::WriteThrough);
        let client = store.register();
        let msg = Message::transient(&b"warm"[..]);
        store.write(client, &msg).unwrap();
        let _ = store.read(&msg.id()).unwrap();
        let _ = store.read(&msg.id()).unwrap();
        store.release(&[msg.id()]);
        let _ = store.read(&msg.id()).unwrap();
        let (hits, misses) = store.cache_stats();
        assert_eq!(hits, 1);
        assert_eq!(misses, 2);
        assert!(store.contains(&msg.id()));
    }

    #[test]
    fn manual_mode_defers_sync_and_confirms() {
        let (_dir, store) = store(SyncMode::Manual);
        let client = store.register();
        let msg = Message::persistent(&b"durable"[..]);
        store.write(client, &msg).unwrap();
        assert!(store.drain_confirmed(client).is_empty());

        let (tx, rx) = std::sync::mpsc::channel();
        store
            .sync(vec![msg.id()], Box::new(move || tx.send(()).unwrap()))
            .unwrap();
        assert!(rx.try_recv().is_err());

        assert_eq!(store.run_pending_syncs().unwrap(), 1);
        rx.try_recv().unwrap();
        assert_eq!(store.drain_confirmed(client), vec![msg.id()]);
    }

    #[test]
    fn write_through_confirms_immediately() {
        let (_dir, store) = store(SyncMode::WriteThrough);
        let client = store.register();
        let msg = Message::persistent(&b"fast"[..]);
        store.write(client, &msg).unwrap();
        assert_eq!(store.drain_confirmed(client), vec![msg.id()]);
        // Transient writes never confirm.
        let transient = Message::transient(&b"t"[..]);
        store.write(client, &transient).unwrap();
        assert!(store.drain_confirmed(client).is_empty());
    }
}
