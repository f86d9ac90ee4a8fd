//! Node-grouped fan-out of one operation to many target processes.
//!
//! Callers hand over a set of targets and a function; targets are grouped by
//! owning node, one batched request goes to a worker on each remote node,
//! and local targets run inline. A panicking call surfaces as an error for
//! that target only and never aborts its peers.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crossbeam::channel::{unbounded, Sender};
use parking_lot::Mutex;

use crate::Error;

/// Identifies the node that owns a target process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

/// Anything the delegate can route: the target knows its owning node.
pub trait Addressed {
    fn node(&self) -> NodeId;
}

type Job = Box<dyn FnOnce() + Send>;

/// Worker peers for one node. Work parallelises because the peer count is a
/// small multiple of the CPU count and callers hash across them.
struct WorkerPool {
    senders: Vec<Sender<Job>>,
}

impl WorkerPool {
    fn spawn(node: &NodeId, size: usize) -> Self {
        let mut senders = Vec::with_capacity(size);
        for i in 0..size {
            let (tx, rx) = unbounded::<Job>();
            let name = format!("delegate-{}-{i}", node.0);
            std::thread::Builder::new()
                .name(name)
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })
                .expect("spawn delegate worker");
            senders.push(tx);
        }
        Self { senders }
    }
}

/// The set of nodes reachable from this process.
pub struct DelegateNet {
    local: NodeId,
    pool_size: usize,
    pools: Mutex<HashMap<NodeId, Arc<WorkerPool>>>,
}

impl DelegateNet {
    pub fn new(local: NodeId) -> Arc<Self> {
        Arc::new(Self {
            local,
            pool_size: (num_cpus::get() * 2).max(2),
            pools: Mutex::new(HashMap::new()),
        })
    }

    pub fn local_node(&self) -> &NodeId {
        &self.local
    }

    /// Makes a remote node reachable. In a real cluster this is driven by
    /// membership; tests add nodes by hand.
    pub fn add_node(&self, node: NodeId) {
        let mut pools = self.pools.lock();
        let size = self.pool_size;
        pools
            .entry(node.clone())
            .or_insert_with(|| Arc::new(WorkerPool::spawn(&node, size)));
    }

    fn pool(&self, node: &NodeId) -> Option<Arc<WorkerPool>> {
        self.pools.lock().get(node).cloned()
    }
}

/// A caller's view of the delegate. Remembers which worker peer it hashed to
/// on each node so repeated calls from one caller stay on one peer.
pub struct DelegateClient {
    net: Arc<DelegateNet>,
    caller_hash: u64,
    memo: HashMap<NodeId, usize>,
}

impl DelegateClient {
    pub fn new(net: &Arc<DelegateNet>, caller_identity: impl Hash) -> Self {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        caller_identity.hash(&mut hasher);
        Self {
            net: Arc::clone(net),
            caller_hash: hasher.finish(),
            memo: HashMap::new(),
        }
    }

    /// Applies `f` to every target, grouped per node, and gathers results in
    /// target order. Individual failures never abort peers' calls.
    pub fn invoke<T, R>(
        &mut self,
        targets: Vec<T>,
        f: Arc<dyn Fn(&T) -> R + Send + Sync>,
    ) -> Vec<(T, Result<R, Error>)>
    where
        T: Addressed + Clone + Send + 'static,
        R: Send + 'static,
    {
        // Single-node local sets run inline; effect ordering with later
        // sends from the same caller is preserved.
        if targets.iter().all(|t| t.node() == *self.net.local_node()) {
            return targets
                .into_iter()
                .map(|t| {
                    let res = run_one(&f, &t);
                    (t, res)
                })
                .collect();
        }

        let mut groups: HashMap<NodeId, Vec<(usize, T)>> = HashMap::new();
        for (i, t) in targets.into_iter().enumerate() {
            groups.entry(t.node()).or_default().push((i, t));
        }

        let (reply_tx, reply_rx) = unbounded();
        let mut expected = 0usize;
        let mut finished: Vec<Option<(T, Result<R, Error>)>> = Vec::new();

        for (node, group) in groups {
            if node == *self.net.local_node() {
                for (i, t) in group {
                    let res = run_one(&f, &t);
                    place(&mut finished, i, (t, res));
                }
                continue;
            }
            match self.net.pool(&node) {
                Some(pool) => {
                    let peer = self.peer_for(&node, pool.senders.len());
                    let f = Arc::clone(&f);
                    let tx = reply_tx.clone();
                    let fallback = group.clone();
                    expected += group.len();
                    let job: Job = Box::new(move || {
                        for (i, t) in group {
                            let res = run_one(&f, &t);
                            let _ = tx.send((i, t, res));
                        }
                    });
                    if pool.senders[peer].send(job).is_err() {
                        expected -= fallback.len();
                        for (i, t) in fallback {
                            place(
                                &mut finished,
                                i,
                                (t, Err(Error::PeerExit(format!("node {} down", node.0)))),
                            );
                        }
                    }
                }
                None => {
                    for (i, t) in group {
                        place(
                            &mut finished,
                            i,
                            (t, Err(Error::PeerExit(format!("node {} down", node.0)))),
                        );
                    }
                }
            }
        }
        drop(reply_tx);

        for _ in 0..expected {
            match reply_rx.recv() {
                Ok((i, t, res)) => place(&mut finished, i, (t, res)),
                Err(_) => break,
            }
        }
        finished.into_iter().flatten().collect()
    }

    /// Same grouping, fire-and-forget: no replies are gathered.
    pub fn invoke_no_result<T>(&mut self, targets: Vec<T>, f: Arc<dyn Fn(&T) + Send + Sync>)
    where
        T: Addressed + Clone + Send + 'static,
    {
        let mut groups: HashMap<NodeId, Vec<T>> = HashMap::new();
        for t in targets {
            groups.entry(t.node()).or_default().push(t);
        }
        for (node, group) in groups {
            if node == *self.net.local_node() {
                for t in &group {
                    let _ = catch_unwind(AssertUnwindSafe(|| f(t)));
                }
                continue;
            }
            if let Some(pool) = self.net.pool(&node) {
                let peer = self.peer_for(&node, pool.senders.len());
                let f = Arc::clone(&f);
                let job: Job = Box::new(move || {
                    for t in &group {
                        let _ = catch_unwind(AssertUnwindSafe(|| f(t)));
                    }
                });
                let _ = pool.senders[peer].send(job);
            }
        }
    }

    fn peer_for(&mut self, node: &NodeId, pool_len: usize) -> usize {
        let hash = self.caller_hash;
        *self
            .memo
            .entry(node.clone())
            .or_insert_with(|| (hash % pool_len as u64) as usize)
    }
}

fn run_one<T, R>(f: &Arc<dyn Fn(&T) -> R + Send + Sync>, target: &T) -> Result<R, Error> {
    catch_unwind(AssertUnwindSafe(|| f(target))).map_err(|panic| {
        let reason = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "panic".to_string());
        Error::PeerExit(reason)
    })
}

fn place<T>(slots: &mut Vec<Option<T>>, index: usize, value: T) {
    if slots.len() <= index {
        slots.resize_with(index + 1, || None);
    }
    slots[index] = Some(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Pid {
        node: &'static str,
        id: u32,
    }

    impl Addressed for Pid {
        fn node(&self) -> NodeId {
            NodeId::new(self.node)
        }
    }

    #[test]
    fn local_set_invokes_inline() {
        let net = DelegateNet::new(NodeId::new("a"));
        let mut client = DelegateClient::new(&net, "caller-1");
        let results = client.invoke(
            vec![Pid { node: "a", id: 1 }, Pid { node: "a", id: 2 }],
            Arc::new(|p: &Pid| p.id * 10),
        );
        let values: Vec<u32> = results.iter().map(|(_, r)| *r.as_ref().unwrap()).collect();
        assert_eq!(values, vec![10, 20]);
    }

    #[test]
    fn remote_groups_and_panics_are_isolated() {
        let net = DelegateNet::new(NodeId::new("a"));
        net.add_node(NodeId::new("b"));
        let mut client = DelegateClient::new(&net, "caller-2");
        let results = client.invoke(
            vec![
                Pid { node: "b", id: 1 },
                Pid { node: "a", id: 2 },
                Pid { node: "b", id: 13 },
            ],
            Arc::new(|p: &Pid| {
                if p.id == 13 {
                    panic!("unlucky");
                }
                p.id
            }),
        );
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].1.as_ref().unwrap(), &1);
        assert_eq!(results[1].1.as_ref().unwrap(), &2);
        assert!(matches!(results[2].1, Err(Error::PeerExit(ref r)) if r == "unlucky"));
    }

    #[test]
    fn unknown_node_is_an_exit_not_a_crash() {
        let net = DelegateNet::new(NodeId::new("a"));
        let mut client = DelegateClient::new(&net, 3u8);
        let results = client.invoke(
            vec![Pid { node: "ghost", id: 9 }],
            Arc::new(|p: &Pid| p.id),
        );
        assert!(matches!(results[0].1, Err(Error::PeerExit(_))));
    }

    #[test]
    fn caller_memoises_its_peer() {
        let net = DelegateNet::new(NodeId::new("a"));
        net.add_node(NodeId::new("b"));
        let mut client = DelegateClient::new(&net, "stable");
        let first = client.peer_for(&NodeId::new("b"), 8);
        for _ in 0..16 {
            assert_eq!(client.peer_for(&NodeId::new("b"), 8), first);
        }
    }
}
