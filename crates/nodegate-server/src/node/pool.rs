//! Fixed-capacity pool of leasable node slots.
//!
//! All lease/release transitions happen under one pool-wide lock. A lease is
//! an RAII guard: dropping it frees the node, so a node cannot stay marked
//! in-use after its connection task ends, whatever path that task took.

use crate::config::NodeRange;
use nodegate_core::{NodeKind, NodeStatus};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Status shown for a node nobody holds.
pub const STATUS_WAITING: &str = "Waiting for caller";
/// Status shown while a lease is held.
pub const STATUS_IN_USE: &str = "In use";

/// One instance slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub number: u32,
    pub kind: NodeKind,
    pub in_use: bool,
    /// Last remote address that held this node; kept after release.
    pub remote_addr: Option<String>,
    pub status: String,
}

impl Node {
    fn new(number: u32, kind: NodeKind) -> Self {
        Self {
            number,
            kind,
            in_use: false,
            remote_addr: None,
            status: STATUS_WAITING.to_string(),
        }
    }

    pub fn to_status(&self) -> NodeStatus {
        NodeStatus {
            number: self.number,
            kind: self.kind,
            in_use: self.in_use,
            status: self.status.clone(),
            remote_addr: self.remote_addr.clone(),
        }
    }
}

/// Shared pool handle. Cloning shares the same nodes.
#[derive(Debug, Clone)]
pub struct NodePool {
    nodes: Arc<Mutex<Vec<Node>>>,
}

impl NodePool {
    /// One instance node per number in `range`, plus a gateway node
    /// numbered `range.high + 1` when requested.
    pub fn new(range: NodeRange, include_gateway: bool) -> Self {
        let mut nodes: Vec<Node> = (range.low..=range.high)
            .map(|n| Node::new(n, NodeKind::Instance))
            .collect();
        if include_gateway {
            nodes.push(Node::new(range.gateway_number(), NodeKind::Gateway));
        }
        debug!(nodes = nodes.len(), "node pool created");
        Self {
            nodes: Arc::new(Mutex::new(nodes)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Node>> {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the first free node of `kind`, in number order.
    ///
    /// Returns `None` when every node of that kind is occupied.
    pub fn lease(&self, kind: NodeKind, remote_addr: Option<&str>) -> Option<NodeLease> {
        let mut nodes = self.lock();
        let node = nodes.iter_mut().find(|n| n.kind == kind && !n.in_use)?;
        node.in_use = true;
        node.status = STATUS_IN_USE.to_string();
        if let Some(addr) = remote_addr {
            node.remote_addr = Some(addr.to_string());
        }
        debug!(node = node.number, %kind, "node leased");
        Some(NodeLease {
            pool: self.clone(),
            number: node.number,
            kind,
            released: false,
        })
    }

    /// Clear the in-use flag on `number`. Releasing a free node is a no-op.
    ///
    /// Returns the node's status afterwards, or `None` for an unknown number.
    pub fn release(&self, number: u32) -> Option<NodeStatus> {
        let mut nodes = self.lock();
        let node = nodes.iter_mut().find(|n| n.number == number)?;
        if node.in_use {
            node.in_use = false;
            node.status = STATUS_WAITING.to_string();
            debug!(node = number, "node released");
        }
        Some(node.to_status())
    }

    /// Update the status text of a node.
    pub fn set_status(&self, number: u32, status: impl Into<String>) -> Option<NodeStatus> {
        let mut nodes = self.lock();
        let node = nodes.iter_mut().find(|n| n.number == number)?;
        node.status = status.into();
        Some(node.to_status())
    }

    pub fn get(&self, number: u32) -> Option<Node> {
        self.lock().iter().find(|n| n.number == number).cloned()
    }

    /// Copy of every node, for occupancy display.
    pub fn snapshot(&self) -> Vec<Node> {
        self.lock().clone()
    }

    /// Number of free nodes of `kind`.
    pub fn available(&self, kind: NodeKind) -> usize {
        self.lock()
            .iter()
            .filter(|n| n.kind == kind && !n.in_use)
            .count()
    }

    pub fn capacity(&self) -> usize {
        self.lock().len()
    }
}

/// Exclusive hold on one node. Dropping it releases the node.
#[derive(Debug)]
pub struct NodeLease {
    pool: NodePool,
    number: u32,
    kind: NodeKind,
    released: bool,
}

impl NodeLease {
    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Update this node's status text; returns the new snapshot.
    pub fn set_status(&self, status: impl Into<String>) -> Option<NodeStatus> {
        self.pool.set_status(self.number, status)
    }

    /// Release now and return the node's resulting status.
    pub fn release(mut self) -> Option<NodeStatus> {
        self.released = true;
        self.pool.release(self.number)
    }
}

impl Drop for NodeLease {
    fn drop(&mut self) {
        if !self.released {
            self.pool.release(self.number);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(low: u32, high: u32, gateway: bool) -> NodePool {
        NodePool::new(NodeRange { low, high }, gateway)
    }

    #[test]
    fn test_construction() {
        let p = pool(2, 4, true);
        let nodes = p.snapshot();
        assert_eq!(p.capacity(), 4);
        assert_eq!(
            nodes.iter().map(|n| n.number).collect::<Vec<_>>(),
            vec![2, 3, 4, 5]
        );
        assert_eq!(nodes[3].kind, NodeKind::Gateway);
        assert!(nodes.iter().all(|n| !n.in_use));
    }

    #[test]
    fn test_first_available_wins() {
        let p = pool(2, 4, false);
        let a = p.lease(NodeKind::Instance, Some("10.0.0.1")).unwrap();
        let b = p.lease(NodeKind::Instance, None).unwrap();
        assert_eq!(a.number(), 2);
        assert_eq!(b.number(), 3);
        drop(a);
        let c = p.lease(NodeKind::Instance, None).unwrap();
        assert_eq!(c.number(), 2);
    }

    #[test]
    fn test_exhaustion_and_reuse() {
        let p = pool(1, 3, false);
        let leases: Vec<_> = (0..3)
            .map(|_| p.lease(NodeKind::Instance, None).unwrap())
            .collect();
        assert!(p.lease(NodeKind::Instance, None).is_none());
        assert_eq!(p.available(NodeKind::Instance), 0);

        let mut leases = leases;
        let freed = leases.remove(1).number();
        let again = p.lease(NodeKind::Instance, None).unwrap();
        assert_eq!(again.number(), freed);
    }

    #[test]
    fn test_kinds_are_separate() {
        let p = pool(1, 1, true);
        let instance = p.lease(NodeKind::Instance, None).unwrap();
        let gateway = p.lease(NodeKind::Gateway, None).unwrap();
        assert_eq!(instance.number(), 1);
        assert_eq!(gateway.number(), 2);
        assert!(p.lease(NodeKind::Gateway, None).is_none());
        assert!(pool(1, 1, false).lease(NodeKind::Gateway, None).is_none());
    }

    #[test]
    fn test_release_is_idempotent() {
        let p = pool(1, 2, false);
        let lease = p.lease(NodeKind::Instance, Some("1.2.3.4")).unwrap();
        let number = lease.number();
        let status = lease.release().unwrap();
        assert!(!status.in_use);
        assert_eq!(status.remote_addr.as_deref(), Some("1.2.3.4"));

        let again = p.release(number).unwrap();
        assert!(!again.in_use);
        assert!(p.release(99).is_none());
        assert_eq!(p.available(NodeKind::Instance), 2);
    }

    #[test]
    fn test_status_tracks_lease() {
        let p = pool(1, 1, false);
        let lease = p.lease(NodeKind::Instance, Some("9.9.9.9")).unwrap();
        let node = p.get(1).unwrap();
        assert!(node.in_use);
        assert_eq!(node.status, STATUS_IN_USE);
        lease.set_status("Running");
        assert_eq!(p.get(1).unwrap().status, "Running");
        drop(lease);
        assert_eq!(p.get(1).unwrap().status, STATUS_WAITING);
    }

    #[test]
    fn test_concurrent_leases_never_exceed_capacity() {
        let p = pool(1, 4, false);
        let barrier = Arc::new(std::sync::Barrier::new(5));
        let handles: Vec<_> = (0..5)
            .map(|_| {
                let p = p.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    p.lease(NodeKind::Instance, None)
                })
            })
            .collect();

        let results: Vec<Option<NodeLease>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        let mut numbers: Vec<u32> = results
            .iter()
            .flatten()
            .map(|lease| lease.number())
            .collect();
        numbers.sort();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
        assert_eq!(results.iter().filter(|r| r.is_none()).count(), 1);

        drop(results);
        assert!(p.lease(NodeKind::Instance, None).is_some());
    }
}
