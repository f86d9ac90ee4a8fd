//! Soft-capped cache of buffered file handles.
//!
//! Clients open handles and get opaque ids back. Every handle keeps its own
//! offset, write buffer and last-used timestamp; a central server watches
//! the process-wide count of open descriptors and, over the cap, broadcasts
//! an age threshold. Clients soft-close anything older (flush + sync + close
//! the OS handle, keep the state) and reopen transparently on next use.

mod client;
mod handle;
mod server;

pub use client::{Client, HandleId};
pub use server::{CacheServer, EVICTION_INTERVAL};

/// Open mode for a handle. A path accepts many readers but one writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mode {
    pub read: bool,
    pub write: bool,
}

impl Mode {
    pub const READ: Mode = Mode {
        read: true,
        write: false,
    };
    pub const WRITE: Mode = Mode {
        read: false,
        write: true,
    };
    pub const READ_WRITE: Mode = Mode {
        read: true,
        write: true,
    };
}

/// Write-buffer policy for a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteBuffer {
    /// Every write goes straight to the OS.
    Unbuffered,
    /// Buffer without bound; flushed on sync/read/seek/close.
    Infinity,
    /// Flush once the buffer holds at least this many bytes.
    Limit(usize),
}

/// Seek target, mirroring the positions the elision table understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekTo {
    Bof(u64),
    Cur(i64),
    Eof,
}

/// Decides whether a physical `lseek` is required. Redundant positioning is
/// skipped when the handle is already where the caller asks.
pub(crate) fn needs_seek(at_eof: bool, cur_offset: u64, target: SeekTo) -> bool {
    match target {
        SeekTo::Cur(0) => false,
        SeekTo::Cur(_) => true,
        SeekTo::Eof => !at_eof,
        SeekTo::Bof(offset) => offset != cur_offset,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seek_elision_table() {
        assert!(!needs_seek(false, 10, SeekTo::Cur(0)));
        assert!(!needs_seek(true, 10, SeekTo::Cur(0)));
        assert!(!needs_seek(true, 10, SeekTo::Eof));
        assert!(needs_seek(false, 10, SeekTo::Eof));
        assert!(!needs_seek(false, 10, SeekTo::Bof(10)));
        assert!(needs_seek(false, 10, SeekTo::Bof(11)));
        assert!(needs_seek(false, 10, SeekTo::Cur(-3)));
    }
}
