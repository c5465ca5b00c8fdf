// src/core/state/request.rs

//! The failover request record and the bounded FIFO ring it travels through.

use super::backend::NodeId;
use bitflags::bitflags;

/// Capacity of the request ring. Overflow makes the enqueuer report failure
/// and drop the request.
pub const MAX_REQUEST_QUEUE: usize = 10;

/// What the failover engine is being asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Failback: bring a previously detached node back into service.
    NodeUp,
    /// Detach one or more nodes.
    NodeDown,
    /// Detach, but recoverable without operator action.
    NodeQuarantine,
    /// Promote a standby to primary.
    Promote,
    /// Ask every session worker to exit at its next idle point.
    CloseIdle,
}

bitflags! {
    /// Modifiers carried alongside a request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RequestFlags: u32 {
        /// A planned detach of a reachable node, as opposed to a crash.
        const SWITCHOVER = 1 << 0;
        /// The detach is a side effect of a promotion.
        const PROMOTE = 1 << 1;
        /// Quarantine resurrection: update state without running commands.
        const UPDATE = 1 << 2;
        /// Originated from (or must be announced to) the watchdog.
        const WATCHDOG = 1 << 3;
        /// Already confirmed by the watchdog leader.
        const CONFIRMED = 1 << 4;
    }
}

/// One entry in the failover request queue.
#[derive(Debug, Clone)]
pub struct FailoverRequest {
    pub kind: RequestKind,
    pub node_ids: Vec<NodeId>,
    pub flags: RequestFlags,
}

impl FailoverRequest {
    pub fn new(kind: RequestKind, node_ids: Vec<NodeId>, flags: RequestFlags) -> Self {
        Self {
            kind,
            node_ids,
            flags,
        }
    }

    pub fn node_down(node_id: NodeId, flags: RequestFlags) -> Self {
        Self::new(RequestKind::NodeDown, vec![node_id], flags)
    }

    pub fn node_up(node_id: NodeId, flags: RequestFlags) -> Self {
        Self::new(RequestKind::NodeUp, vec![node_id], flags)
    }

    pub fn promote(node_id: NodeId, flags: RequestFlags) -> Self {
        Self::new(RequestKind::Promote, vec![node_id], flags)
    }
}

/// A bounded ring with monotonically increasing head/tail counters. The index
/// of a slot is the counter modulo the capacity; `tail - capacity >= head`
/// means the ring is full.
#[derive(Debug)]
pub struct RequestQueue {
    slots: Vec<Option<FailoverRequest>>,
    head: u64,
    tail: u64,
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestQueue {
    pub fn new() -> Self {
        Self {
            slots: vec![None; MAX_REQUEST_QUEUE],
            head: 0,
            tail: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn len(&self) -> usize {
        (self.tail - self.head) as usize
    }

    /// Appends a request, or reports `false` when the ring is full.
    pub fn push(&mut self, req: FailoverRequest) -> bool {
        if self.tail >= self.head + MAX_REQUEST_QUEUE as u64 {
            return false;
        }
        let idx = (self.tail as usize) % MAX_REQUEST_QUEUE;
        self.slots[idx] = Some(req);
        self.tail += 1;
        true
    }

    /// Consumes the oldest request, if any.
    pub fn pop(&mut self) -> Option<FailoverRequest> {
        if self.is_empty() {
            return None;
        }
        let idx = (self.head as usize) % MAX_REQUEST_QUEUE;
        self.head += 1;
        self.slots[idx].take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_preserves_fifo_order_and_rejects_overflow() {
        let mut q = RequestQueue::new();
        for i in 0..MAX_REQUEST_QUEUE {
            assert!(q.push(FailoverRequest::node_down(i as NodeId, RequestFlags::empty())));
        }
        assert!(!q.push(FailoverRequest::node_down(99, RequestFlags::empty())));
        for i in 0..MAX_REQUEST_QUEUE {
            let req = q.pop().expect("queued entry");
            assert_eq!(req.node_ids, vec![i as NodeId]);
        }
        assert!(q.pop().is_none());
    }

    #[test]
    fn ring_wraps_around() {
        let mut q = RequestQueue::new();
        for round in 0..3 {
            for i in 0..MAX_REQUEST_QUEUE {
                let id = (round * MAX_REQUEST_QUEUE + i) as NodeId;
                assert!(q.push(FailoverRequest::node_down(id, RequestFlags::SWITCHOVER)));
            }
            for i in 0..MAX_REQUEST_QUEUE {
                let id = (round * MAX_REQUEST_QUEUE + i) as NodeId;
                assert_eq!(q.pop().unwrap().node_ids, vec![id]);
            }
        }
    }
}
