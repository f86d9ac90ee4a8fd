use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use crossbeam::channel::Receiver;

use crate::file_cache::handle::HandleState;
use crate::file_cache::server::{CacheServer, Directive};
use crate::file_cache::{Mode, SeekTo, WriteBuffer};
use crate::{Error, Result};

/// Opaque reference to a handle held by one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(u64);

/// Per-process view of the cache. Owns its handles and an age tree keyed by
/// last-used time; applies the server's close directives on entry to every
/// operation, so eviction needs no cross-thread access to handle state.
pub struct Client {
    id: u64,
    server: Arc<CacheServer>,
    directives: Receiver<Directive>,
    handles: HashMap<u64, HandleState>,
    ages: BTreeMap<(u64, u64), ()>,
    next_handle: u64,
}

impl Client {
    pub fn new(server: &Arc<CacheServer>) -> Self {
        let (id, directives) = server.register_client();
        Self {
            id,
            server: Arc::clone(server),
            directives,
            handles: HashMap::new(),
            ages: BTreeMap::new(),
            next_handle: 0,
        }
    }

    pub fn open(
        &mut self,
        path: impl Into<PathBuf>,
        mode: Mode,
        policy: WriteBuffer,
    ) -> Result<HandleId> {
        self.process_directives();
        let path = path.into();
        self.server.register_path(&path, mode)?;
        let state = match HandleState::open(path.clone(), mode, policy, self.now_us()) {
            Ok(state) => state,
            Err(err) => {
                self.server.deregister_path(&path, mode);
                return Err(err);
            }
        };
        let id = self.next_handle;
        self.next_handle += 1;
        self.ages.insert((state.last_used_us, id), ());
        self.handles.insert(id, state);
        self.report(1);
        Ok(HandleId(id))
    }

    pub fn close(&mut self, handle: HandleId) -> Result<()> {
        self.process_directives();
        let mut state = self
            .handles
            .remove(&handle.0)
            .ok_or_else(|| Error::NotFound("file handle".into()))?;
        self.ages.remove(&(state.last_used_us, handle.0));
        let released = state.soft_close()?;
        self.server.deregister_path(&state.path, state.mode);
        self.report(if released { -1 } else { 0 });
        Ok(())
    }

    pub fn append(&mut self, handle: HandleId, bytes: &[u8]) -> Result<()> {
        self.with_handle(handle, |state| state.append(bytes))
    }

    pub fn read(&mut self, handle: HandleId, len: usize) -> Result<Vec<u8>> {
        self.with_handle(handle, |state| state.read(len))
    }

    pub fn seek(&mut self, handle: HandleId, target: SeekTo) -> Result<u64> {
        self.with_handle(handle, |state| state.seek(target))
    }

    /// Seek + read in one call.
    pub fn pread(&mut self, handle: HandleId, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.with_handle(handle, |state| {
            state.seek(SeekTo::Bof(offset))?;
            state.read(len)
        })
    }

    pub fn sync(&mut self, handle: HandleId) -> Result<()> {
        self.with_handle(handle, |state| state.sync())
    }

    pub fn flush(&mut self, handle: HandleId) -> Result<()> {
        self.with_handle(handle, |state| state.flush_wbuf())
    }

    pub fn position(&mut self, handle: HandleId) -> Result<u64> {
        self.with_handle(handle, |state| Ok(state.offset))
    }

    pub fn size(&mut self, handle: HandleId) -> Result<u64> {
        self.with_handle(handle, |state| state.size())
    }

    /// Number of handles currently backed by a live OS descriptor.
    pub fn open_descriptors(&self) -> usize {
        self.handles.values().filter(|h| !h.is_soft_closed()).count()
    }

    fn with_handle<T>(
        &mut self,
        handle: HandleId,
        op: impl FnOnce(&mut HandleState) -> Result<T>,
    ) -> Result<T> {
        self.process_directives();
        let now = self.now_us();
        let state = self
            .handles
            .get_mut(&handle.0)
            .ok_or_else(|| Error::NotFound("file handle".into()))?;
        let was_closed = state.is_soft_closed();
        let old_used = state.last_used_us;
        let result = op(state);
        let reopened = was_closed && !state.is_soft_closed();
        state.last_used_us = now;
        self.ages.remove(&(old_used, handle.0));
        self.ages.insert((now, handle.0), ());
        if reopened {
            self.report(1);
        }
        result
    }

    fn process_directives(&mut self) {
        while let Ok(directive) = self.directives.try_recv() {
            match directive {
                Directive::CloseOlderThan { age_us } => {
                    let threshold = self.now_us().saturating_sub(age_us);
                    let mut released = 0isize;
                    for state in self.handles.values_mut() {
                        if state.last_used_us <= threshold && !state.is_soft_closed() {
                            match state.soft_close() {
                                Ok(true) => released -= 1,
                                Ok(false) => {}
                                Err(err) => {
                                    log::warn!(
                                        "soft close of {} failed: {err}",
                                        state.path.display()
                                    );
                                }
                            }
                        }
                    }
                    if released != 0 {
                        self.report(released);
                    }
                }
            }
        }
    }

    fn report(&self, obtained_delta: isize) {
        let eldest = self.ages.keys().next().map(|(used, _)| *used);
        self.server.report(self.id, obtained_delta, eldest);
    }

    fn now_us(&self) -> u64 {
        // The server's clock is authoritative for ages so directives and
        // handle timestamps compare in the same domain.
        self.server.clock_now()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.server.deregister_client(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tempfile::TempDir;

    fn setup(limit: usize) -> (TempDir, ManualClock, Arc<CacheServer>) {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new(1_000_000);
        let server = CacheServer::with_limit(Arc::new(clock.clone()), limit);
        (dir, clock, server)
    }

    #[test]
    fn append_read_round_trip() {
        let (dir, _clock, server) = setup(64);
        let mut client = Client::new(&server);
        let path = dir.path().join("data");
        let h = client
            .open(&path, Mode::READ_WRITE, WriteBuffer::Limit(4))
            .unwrap();
        client.append(h, b"hello ").unwrap();
        client.append(h, b"world").unwrap();
        let got = client.pread(h, 0, 11).unwrap();
        assert_eq!(got, b"hello world");
        client.close(h).unwrap();
    }

    #[test]
    fn infinity_buffer_holds_until_flush() {
        let (dir, _clock, server) = setup(64);
        let mut client = Client::new(&server);
        let path = dir.path().join("buffered");
        let h = client
            .open(&path, Mode::WRITE, WriteBuffer::Infinity)
            .unwrap();
        client.append(h, b"abc").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"");
        client.flush(h).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"abc");
        client.close(h).unwrap();
    }

    #[test]
    fn second_writer_is_rejected() {
        let (dir, _clock, server) = setup(64);
        let mut a = Client::new(&server);
        let mut b = Client::new(&server);
        let path = dir.path().join("solo");
        let _h = a.open(&path, Mode::WRITE, WriteBuffer::Unbuffered).unwrap();
        let err = b.open(&path, Mode::WRITE, WriteBuffer::Unbuffered);
        assert!(matches!(err, Err(Error::WriterExists)));
        // Readers are still welcome.
        assert!(b.open(&path, Mode::READ, WriteBuffer::Unbuffered).is_ok());
    }

    #[test]
    fn over_limit_soft_closes_eldest_and_reopens() {
        let (dir, clock, server) = setup(2);
        let mut client = Client::new(&server);
        let old = client
            .open(dir.path().join("old"), Mode::READ_WRITE, WriteBuffer::Unbuffered)
            .unwrap();
        client.append(old, b"aged").unwrap();

        clock.advance_ms(10_000);
        let fresh = client
            .open(dir.path().join("fresh"), Mode::WRITE, WriteBuffer::Unbuffered)
            .unwrap();
        client.append(fresh, b"x").unwrap();

        // Hitting the cap broadcast a directive; the next operation applies it.
        clock.advance_ms(1);
        let _ = client.position(fresh).unwrap();
        assert_eq!(client.open_descriptors(), 1);

        // The soft-closed handle reopens transparently at its old offset.
        let got = client.pread(old, 0, 4).unwrap();
        assert_eq!(got, b"aged");
    }
}
