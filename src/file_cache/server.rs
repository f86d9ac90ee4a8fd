use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::clock::Clock;
use crate::file_cache::Mode;
use crate::{Error, Result};

/// How often the server re-evaluates while over the cap.
pub const EVICTION_INTERVAL: Duration = Duration::from_secs(2);

/// Descriptors left for sockets and everything else in the process.
const RESERVED_FOR_OTHERS: usize = 100;

/// Floor so a tight ulimit still leaves the cache usable.
const LIMIT_FLOOR: usize = 10;

pub(crate) enum Directive {
    /// Soft-close every handle unused for at least this long.
    CloseOlderThan { age_us: u64 },
}

struct ClientEntry {
    directives: Sender<Directive>,
    obtained: usize,
    eldest_us: Option<u64>,
}

struct PathInfo {
    readers: usize,
    has_writer: bool,
}

struct ServerInner {
    next_client: u64,
    clients: HashMap<u64, ClientEntry>,
    paths: HashMap<PathBuf, PathInfo>,
    obtained: usize,
}

/// Process-wide coordinator for open descriptors.
pub struct CacheServer {
    clock: Arc<dyn Clock>,
    limit: usize,
    inner: Mutex<ServerInner>,
}

impl CacheServer {
    pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        Self::with_limit(clock, default_limit())
    }

    pub fn with_limit(clock: Arc<dyn Clock>, limit: usize) -> Arc<Self> {
        Arc::new(Self {
            clock,
            limit: limit.max(1),
            inner: Mutex::new(ServerInner {
                next_client: 0,
                clients: HashMap::new(),
                paths: HashMap::new(),
                obtained: 0,
            }),
        })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub(crate) fn clock_now(&self) -> u64 {
        self.clock.now_us()
    }

    pub fn obtained(&self) -> usize {
        self.inner.lock().obtained
    }

    pub(crate) fn register_client(&self) -> (u64, Receiver<Directive>) {
        let (tx, rx) = unbounded();
        let mut inner = self.inner.lock();
        let id = inner.next_client;
        inner.next_client += 1;
        inner.clients.insert(
            id,
            ClientEntry {
                directives: tx,
                obtained: 0,
                eldest_us: None,
            },
        );
        (id, rx)
    }

    pub(crate) fn deregister_client(&self, id: u64) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.clients.remove(&id) {
            inner.obtained -= entry.obtained;
        }
    }

    pub(crate) fn register_path(&self, path: &PathBuf, mode: Mode) -> Result<()> {
        let mut inner = self.inner.lock();
        let info = inner.paths.entry(path.clone()).or_insert(PathInfo {
            readers: 0,
            has_writer: false,
        });
        if mode.write {
            if info.has_writer {
                return Err(Error::WriterExists);
            }
            info.has_writer = true;
        }
        if mode.read {
            info.readers += 1;
        }
        Ok(())
    }

    pub(crate) fn deregister_path(&self, path: &PathBuf, mode: Mode) {
        let mut inner = self.inner.lock();
        let remove = match inner.paths.get_mut(path) {
            Some(info) => {
                if mode.write {
                    info.has_writer = false;
                }
                if mode.read {
                    info.readers = info.readers.saturating_sub(1);
                }
                info.readers == 0 && !info.has_writer
            }
            None => false,
        };
        if remove {
            inner.paths.remove(path);
        }
    }

    /// Called by clients whenever their descriptor count or eldest handle
    /// changes. Crossing the cap triggers an immediate reduction pass.
    pub(crate) fn report(&self, client: u64, obtained_delta: isize, eldest_us: Option<u64>) {
        let over = {
            let mut inner = self.inner.lock();
            if let Some(entry) = inner.clients.get_mut(&client) {
                entry.obtained = (entry.obtained as isize + obtained_delta).max(0) as usize;
                entry.eldest_us = eldest_us;
            }
            inner.obtained = (inner.obtained as isize + obtained_delta).max(0) as usize;
            inner.obtained >= self.limit
        };
        if over {
            self.reduce_now();
        }
    }

    /// Averages the eldest ages across clients and broadcasts that age as
    /// the close threshold. Clients apply it on their next operation.
    pub fn reduce_now(&self) {
        let now = self.clock.now_us();
        let inner = self.inner.lock();
        if inner.obtained < self.limit {
            return;
        }
        let ages: Vec<u64> = inner
            .clients
            .values()
            .filter_map(|c| c.eldest_us.map(|e| now.saturating_sub(e)))
            .collect();
        if ages.is_empty() {
            return;
        }
        let average = ages.iter().sum::<u64>() / ages.len() as u64;
        log::debug!(
            "file cache over limit ({} >= {}), closing handles older than {average}us",
            inner.obtained,
            self.limit
        );
        for client in inner.clients.values() {
            let _ = client.directives.send(Directive::CloseOlderThan { age_us: average });
        }
    }

    /// Spawns the periodic re-evaluation loop. The guard stops it on drop.
    pub fn start_janitor(self: &Arc<Self>) -> JanitorGuard {
        let stop = Arc::new(AtomicBool::new(false));
        let server = Arc::clone(self);
        let flag = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            while !flag.load(Ordering::Acquire) {
                std::thread::sleep(EVICTION_INTERVAL);
                server.reduce_now();
            }
        });
        JanitorGuard {
            stop,
            handle: Some(handle),
        }
    }
}

pub struct JanitorGuard {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for JanitorGuard {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(unix)]
fn default_limit() -> usize {
    let mut rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let res = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) };
    if res != 0 {
        return 1024 - RESERVED_FOR_OTHERS;
    }
    let soft = rlim.rlim_cur as usize;
    soft.saturating_sub(RESERVED_FOR_OTHERS).max(LIMIT_FLOOR)
}

#[cfg(not(unix))]
fn default_limit() -> usize {
    10_000_000
}
