//! Segment-granular queue index.
//!
//! The index records, per seq id, which message sits at that position,
//! whether it is persistent, and its delivered/acked markers. Entries are
//! journalled through the handle cache and folded into per-segment files
//! under journal pressure; the in-memory mirror stays authoritative for
//! reads, the files make the write path honest about its I/O.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::file_cache::{CacheServer, Client, HandleId, Mode, WriteBuffer};
use crate::message::MessageId;
use crate::{Error, Result};

/// Seq ids a segment file addresses as one unit.
pub const SEGMENT_ENTRY_COUNT: u64 = 16384;

/// Journal entries tolerated before a flush is forced.
pub const MAX_JOURNAL_ENTRIES: usize = 32768;

const JOURNAL_FILE: &str = "journal.jif";

const REC_PUBLISH: u8 = 1;
const REC_DELIVER: u8 = 2;
const REC_ACK: u8 = 3;

/// First seq id of the segment after the one holding `seq`.
pub fn next_segment_boundary(seq: u64) -> u64 {
    segment_boundary_for(seq, SEGMENT_ENTRY_COUNT)
}

pub fn segment_boundary_for(seq: u64, entry_count: u64) -> u64 {
    (seq / entry_count + 1) * entry_count
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub msg_id: MessageId,
    pub seq_id: u64,
    pub persistent: bool,
    pub delivered: bool,
}

#[derive(Debug, Clone)]
struct SegEntry {
    msg_id: MessageId,
    persistent: bool,
    delivered: bool,
}

pub struct QueueIndex {
    dir: PathBuf,
    cache: Client,
    journal: Option<HandleId>,
    segments: BTreeMap<u64, BTreeMap<u64, SegEntry>>,
    journal_entries: usize,
    entry_count: u64,
    dirty: bool,
}

impl QueueIndex {
    pub fn open(dir: impl AsRef<Path>, server: &Arc<CacheServer>) -> Result<Self> {
        Self::open_with_entry_count(dir, server, SEGMENT_ENTRY_COUNT)
    }

    /// As `open`, with a custom segment granularity. Small counts let tests
    /// exercise segment transitions without tens of thousands of messages.
    pub fn open_with_entry_count(
        dir: impl AsRef<Path>,
        server: &Arc<CacheServer>,
        entry_count: u64,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let mut cache = Client::new(server);
        let journal = cache.open(
            dir.join(JOURNAL_FILE),
            Mode::READ_WRITE,
            WriteBuffer::Infinity,
        )?;
        Ok(Self {
            dir,
            cache,
            journal: Some(journal),
            segments: BTreeMap::new(),
            journal_entries: 0,
            entry_count: entry_count.max(1),
            dirty: false,
        })
    }

    pub fn segment_entry_count(&self) -> u64 {
        self.entry_count
    }

    /// First seq id of the segment after the one holding `seq`.
    pub fn next_boundary(&self, seq: u64) -> u64 {
        segment_boundary_for(seq, self.entry_count)
    }

    fn journal_handle(&self) -> Result<HandleId> {
        self.journal.ok_or(Error::Corrupt("index terminated"))
    }

    pub fn publish(&mut self, msg_id: MessageId, seq_id: u64, persistent: bool) -> Result<()> {
        let mut record = Vec::with_capacity(26);
        record.push(REC_PUBLISH);
        record.extend_from_slice(&seq_id.to_le_bytes());
        record.extend_from_slice(msg_id.as_bytes());
        record.push(persistent as u8);
        self.journal_append(&record)?;
        self.segments.entry(seq_id / self.entry_count).or_default().insert(
            seq_id,
            SegEntry {
                msg_id,
                persistent,
                delivered: false,
            },
        );
        Ok(())
    }

    pub fn deliver(&mut self, seq_ids: &[u64]) -> Result<()> {
        for &seq_id in seq_ids {
            let mut record = Vec::with_capacity(9);
            record.push(REC_DELIVER);
            record.extend_from_slice(&seq_id.to_le_bytes());
            self.journal_append(&record)?;
            if let Some(entry) = self
                .segments
                .get_mut(&(seq_id / self.entry_count))
                .and_then(|seg| seg.get_mut(&seq_id))
            {
                entry.delivered = true;
            }
        }
        Ok(())
    }

    pub fn ack(&mut self, seq_ids: &[u64]) -> Result<()> {
        for &seq_id in seq_ids {
            let mut record = Vec::with_capacity(9);
            record.push(REC_ACK);
            record.extend_from_slice(&seq_id.to_le_bytes());
            self.journal_append(&record)?;
            let segment = seq_id / self.entry_count;
            let emptied = match self.segments.get_mut(&segment) {
                Some(seg) => {
                    seg.remove(&seq_id);
                    seg.is_empty()
                }
                None => false,
            };
            if emptied {
                self.segments.remove(&segment);
            }
        }
        Ok(())
    }

    /// Live (unacked) entries with `start <= seq < end`, ascending.
    pub fn read(&self, start: u64, end: u64) -> Vec<IndexEntry> {
        let mut out = Vec::new();
        for (_, seg) in self
            .segments
            .range(start / self.entry_count..=end.saturating_sub(1) / self.entry_count)
        {
            for (&seq_id, entry) in seg.range(start..end) {
                out.push(IndexEntry {
                    msg_id: entry.msg_id,
                    seq_id,
                    persistent: entry.persistent,
                    delivered: entry.delivered,
                });
            }
        }
        out
    }

    /// `(lowest live seq, highest live seq + 1)`, or `None` when empty.
    pub fn bounds(&self) -> Option<(u64, u64)> {
        let first = self
            .segments
            .values()
            .find_map(|seg| seg.keys().next().copied())?;
        let last = self
            .segments
            .values()
            .rev()
            .find_map(|seg| seg.keys().next_back().copied())?;
        Some((first, last + 1))
    }

    /// Whether journal pressure demands a flush before more publishes.
    pub fn flush_required(&self) -> bool {
        self.journal_entries >= MAX_JOURNAL_ENTRIES
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Folds the journal into per-segment files and resets the pressure
    /// counter. Reads are unaffected; the mirror is already current.
    pub fn flush_journal(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let journal = self.journal_handle()?;
        for (&segment, entries) in &self.segments {
            let path = self.dir.join(format!("{segment:08}.idx"));
            // Full rewrite: reopen-after-soft-close must never truncate, so
            // stale contents are removed here instead.
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
            let handle = self
                .cache
                .open(&path, Mode::WRITE, WriteBuffer::Infinity)?;
            for (&seq_id, entry) in entries {
                let mut record = Vec::with_capacity(27);
                record.push(REC_PUBLISH);
                record.extend_from_slice(&seq_id.to_le_bytes());
                record.extend_from_slice(entry.msg_id.as_bytes());
                record.push(entry.persistent as u8);
                record.push(entry.delivered as u8);
                self.cache.append(handle, &record)?;
            }
            self.cache.close(handle)?;
        }
        self.cache.flush(journal)?;
        self.journal_entries = 0;
        self.dirty = false;
        Ok(())
    }

    /// Makes the journalled records for the given seq ids durable.
    pub fn sync(&mut self, _seq_ids: &[u64]) -> Result<()> {
        let journal = self.journal_handle()?;
        self.cache.sync(journal)
    }

    /// Drops every entry, removes the on-disk index and refuses further use.
    pub fn delete_and_terminate(&mut self) -> Result<()> {
        self.segments.clear();
        self.journal_entries = 0;
        self.dirty = false;
        if let Some(journal) = self.journal.take() {
            self.cache.close(journal)?;
        }
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if name.ends_with(".idx") || name == JOURNAL_FILE {
                    std::fs::remove_file(&path)?;
                }
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.segments.values().map(|seg| seg.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    fn journal_append(&mut self, record: &[u8]) -> Result<()> {
        let journal = self.journal_handle()?;
        self.cache.append(journal, record)?;
        self.journal_entries += 1;
        self.dirty = true;
        if self.flush_required() {
            self.flush_journal()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tempfile::TempDir;

    fn index() -> (TempDir, QueueIndex) {
        let dir = TempDir::new().unwrap();
        let server = CacheServer::with_limit(Arc::new(ManualClock::new(0)), 64);
        let index = QueueIndex::open(dir.path(), &server).unwrap();
        (dir, index)
    }

    #[test]
    fn segment_boundaries() {
        assert_eq!(next_segment_boundary(0), SEGMENT_ENTRY_COUNT);
        assert_eq!(next_segment_boundary(SEGMENT_ENTRY_COUNT - 1), SEGMENT_ENTRY_COUNT);
        assert_eq!(next_segment_boundary(SEGMENT_ENTRY_COUNT), 2 * SEGMENT_ENTRY_COUNT);
    }

    #[test]
    fn publish_deliver_ack_round_trip() {
        let (_dir, mut index) = index();
        let ids: Vec<MessageId> = (0..3).map(|_| MessageId::fresh()).collect();
        for (i, id) in ids.iter().enumerate() {
            index.publish(*id, i as u64, i % 2 == 0).unwrap();
        }
        index.deliver(&[1]).unwrap();

        let entries = index.read(0, 3);
        assert_eq!(entries.len(), 3);
        assert!(entries[1].delivered);
        assert!(!entries[0].delivered);
        assert_eq!(entries[2].msg_id, ids[2]);

        index.ack(&[0, 2]).unwrap();
        let entries = index.read(0, 3);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].seq_id, 1);
        assert_eq!(index.bounds(), Some((1, 2)));

        index.ack(&[1]).unwrap();
        assert!(index.is_empty());
        assert_eq!(index.bounds(), None);
    }

    #[test]
    fn read_spans_segments() {
        let (_dir, mut index) = index();
        let low = SEGMENT_ENTRY_COUNT - 1;
        let high = SEGMENT_ENTRY_COUNT + 1;
        index.publish(MessageId::fresh(), low, false).unwrap();
        index.publish(MessageId::fresh(), high, false).unwrap();
        let entries = index.read(low, high + 1);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].seq_id, low);
        assert_eq!(entries[1].seq_id, high);
    }

    #[test]
    fn flush_writes_segment_files(){
        let (dir, mut index) = index();
        index.publish(MessageId::fresh(), 7, true).unwrap();
        index.flush_journal().unwrap();
        assert!(!index.is_dirty());
        assert!(dir.path().join(format!("{:08}.idx", 0)).exists());
    }

    #[test]
    fn delete_and_terminate_erases_files() {
        let (dir, mut index) = index();
        index.publish(MessageId::fresh(), 0, true).unwrap();
        index.flush_journal().unwrap();
        index.delete_and_terminate().unwrap();
        assert!(index.is_empty());
        assert!(!dir.path().join(format!("{:08}.idx", 0)).exists());
    }
}
