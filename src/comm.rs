// src/comm.rs
//
//! Communicator seam between the staging layer and the launcher's transport.
//!
//! The store and sample list only need a narrow, byte-oriented collective
//! surface: size/payload all-gathers, per-rank broadcasts, tagged
//! point-to-point messages with completion-before-use semantics, and world /
//! node-local barriers. Production deployments back [`Comm`] with the job's
//! MPI-like transport; [`LocalComm`] is an in-process implementation over
//! threads used by tests and single-node tools.
//!
//! Tagged sends are posted non-blocking (buffered into the destination's
//! mailbox); `wait_recv` blocks only the caller, and only until its own
//! message arrives. No ordering is guaranteed between different tags.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Barrier, Condvar, Mutex};
use std::time::Duration;

use bytes::Bytes;

use crate::error::{Result, StageError};

/// How long a `LocalComm` receive waits before declaring the run wedged.
const RECV_TIMEOUT: Duration = Duration::from_secs(30);

/// Collective surface consumed by the staging layer.
pub trait Comm: Send + Sync {
    fn rank(&self) -> usize;
    fn world_size(&self) -> usize;

    /// Rank within the node (0 = node master) and ranks per node, used to
    /// coordinate shared-memory population during preload.
    fn node_rank(&self) -> usize;
    fn ranks_per_node(&self) -> usize;

    fn barrier(&self) -> Result<()>;
    fn node_barrier(&self) -> Result<()>;

    /// Gather one value from every rank, in rank order.
    fn all_gather_u64(&self, value: u64) -> Result<Vec<u64>>;

    /// Variable-length all-gather: every rank contributes a payload and
    /// receives all payloads in rank order.
    fn all_gather_bytes(&self, data: &[u8]) -> Result<Vec<Vec<u8>>>;

    /// Broadcast `data` from `root`; on non-root ranks the buffer is
    /// replaced with the root's payload.
    fn broadcast_bytes(&self, root: usize, data: &mut Vec<u8>) -> Result<()>;

    /// Post one tagged message to `dest`. Non-blocking: completion of the
    /// local call does not imply the destination has consumed it.
    fn post_send(&self, dest: usize, tag: u64, data: Bytes) -> Result<()>;

    /// Block until the matching tagged message from `src` arrives.
    fn wait_recv(&self, src: usize, tag: u64) -> Result<Bytes>;

    /// Sum a value across all ranks.
    fn all_reduce_sum(&self, value: u64) -> Result<u64> {
        Ok(self.all_gather_u64(value)?.iter().sum())
    }
}

struct Mailbox {
    inner: Mutex<HashMap<(usize, u64), VecDeque<Bytes>>>,
    cv: Condvar,
}

impl Mailbox {
    fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            cv: Condvar::new(),
        }
    }
}

struct LocalGroup {
    world: usize,
    ranks_per_node: usize,
    barrier: Barrier,
    node_barriers: Vec<Barrier>,
    slots: Mutex<Vec<Vec<u8>>>,
    mailboxes: Vec<Mailbox>,
}

/// In-process communicator: all ranks are threads sharing one group.
pub struct LocalComm {
    group: Arc<LocalGroup>,
    rank: usize,
}

impl LocalComm {
    /// Build a world of `world` ranks with `ranks_per_node` ranks per
    /// (simulated) node; returns one communicator per rank, in rank order.
    pub fn world(world: usize, ranks_per_node: usize) -> Vec<LocalComm> {
        assert!(world > 0, "world size must be positive");
        let rpn = ranks_per_node.clamp(1, world);
        let num_nodes = world.div_ceil(rpn);
        let node_barriers = (0..num_nodes)
            .map(|n| {
                let members = rpn.min(world - n * rpn);
                Barrier::new(members)
            })
            .collect();
        let group = Arc::new(LocalGroup {
            world,
            ranks_per_node: rpn,
            barrier: Barrier::new(world),
            node_barriers,
            slots: Mutex::new(vec![Vec::new(); world]),
            mailboxes: (0..world).map(|_| Mailbox::new()).collect(),
        });
        (0..world)
            .map(|rank| LocalComm {
                group: Arc::clone(&group),
                rank,
            })
            .collect()
    }

    fn poisoned() -> StageError {
        StageError::Comm("local communicator lock poisoned".to_string())
    }
}

impl Comm for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.group.world
    }

    fn node_rank(&self) -> usize {
        self.rank % self.group.ranks_per_node
    }

    fn ranks_per_node(&self) -> usize {
        self.group.ranks_per_node
    }

    fn barrier(&self) -> Result<()> {
        self.group.barrier.wait();
        Ok(())
    }

    fn node_barrier(&self) -> Result<()> {
        let node = self.rank / self.group.ranks_per_node;
        self.group.node_barriers[node].wait();
        Ok(())
    }

    fn all_gather_u64(&self, value: u64) -> Result<Vec<u64>> {
        let gathered = self.all_gather_bytes(&value.to_le_bytes())?;
        gathered
            .into_iter()
            .map(|b| {
                b.as_slice()
                    .try_into()
                    .map(u64::from_le_bytes)
                    .map_err(|_| StageError::Comm("short all-gather payload".to_string()))
            })
            .collect()
    }

    fn all_gather_bytes(&self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        {
            let mut slots = self.group.slots.lock().map_err(|_| Self::poisoned())?;
            slots[self.rank] = data.to_vec();
        }
        self.group.barrier.wait();
        let out = {
            let slots = self.group.slots.lock().map_err(|_| Self::poisoned())?;
            slots.clone()
        };
        // nobody may start the next collective before everyone has read
        self.group.barrier.wait();
        Ok(out)
    }

    fn broadcast_bytes(&self, root: usize, data: &mut Vec<u8>) -> Result<()> {
        if root >= self.group.world {
            return Err(StageError::Comm(format!(
                "broadcast root {} out of range for world size {}",
                root, self.group.world
            )));
        }
        if self.rank == root {
            let mut slots = self.group.slots.lock().map_err(|_| Self::poisoned())?;
            slots[root] = data.clone();
        }
        self.group.barrier.wait();
        if self.rank != root {
            let slots = self.group.slots.lock().map_err(|_| Self::poisoned())?;
            *data = slots[root].clone();
        }
        self.group.barrier.wait();
        Ok(())
    }

    fn post_send(&self, dest: usize, tag: u64, data: Bytes) -> Result<()> {
        let mailbox = self
            .group
            .mailboxes
            .get(dest)
            .ok_or_else(|| StageError::Comm(format!("send to unknown rank {}", dest)))?;
        let mut inner = mailbox.inner.lock().map_err(|_| Self::poisoned())?;
        inner.entry((self.rank, tag)).or_default().push_back(data);
        mailbox.cv.notify_all();
        Ok(())
    }

    fn wait_recv(&self, src: usize, tag: u64) -> Result<Bytes> {
        if src >= self.group.world {
            return Err(StageError::Comm(format!(
                "receive from unknown rank {}",
                src
            )));
        }
        let mailbox = &self.group.mailboxes[self.rank];
        let mut inner = mailbox.inner.lock().map_err(|_| Self::poisoned())?;
        loop {
            if let Some(q) = inner.get_mut(&(src, tag)) {
                if let Some(msg) = q.pop_front() {
                    return Ok(msg);
                }
            }
            let (guard, timeout) = mailbox
                .cv
                .wait_timeout(inner, RECV_TIMEOUT)
                .map_err(|_| Self::poisoned())?;
            inner = guard;
            if timeout.timed_out() {
                return Err(StageError::Comm(format!(
                    "rank {} timed out waiting for tag {} from rank {}",
                    self.rank, tag, src
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn run_world<F>(world: usize, rpn: usize, f: F)
    where
        F: Fn(LocalComm) + Send + Sync + Clone + 'static,
    {
        let comms = LocalComm::world(world, rpn);
        let handles: Vec<_> = comms
            .into_iter()
            .map(|c| {
                let f = f.clone();
                thread::spawn(move || f(c))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn all_gather_orders_by_rank() {
        run_world(4, 2, |c| {
            let got = c.all_gather_u64(c.rank() as u64 * 10).unwrap();
            assert_eq!(got, vec![0, 10, 20, 30]);
            // again, to prove the slots are reusable
            let got = c.all_gather_bytes(&[c.rank() as u8]).unwrap();
            assert_eq!(got, vec![vec![0], vec![1], vec![2], vec![3]]);
        });
    }

    #[test]
    fn broadcast_replaces_non_root_buffers() {
        run_world(3, 3, |c| {
            let mut buf = if c.rank() == 1 {
                b"payload".to_vec()
            } else {
                Vec::new()
            };
            c.broadcast_bytes(1, &mut buf).unwrap();
            assert_eq!(buf, b"payload");
        });
    }

    #[test]
    fn tagged_messages_match_by_source_and_tag() {
        run_world(2, 2, |c| {
            let peer = 1 - c.rank();
            // post out of tag order; receives still match
            c.post_send(peer, 7, Bytes::from_static(b"seven")).unwrap();
            c.post_send(peer, 3, Bytes::from_static(b"three")).unwrap();
            assert_eq!(c.wait_recv(peer, 3).unwrap(), "three");
            assert_eq!(c.wait_recv(peer, 7).unwrap(), "seven");
        });
    }

    #[test]
    fn loopback_send_to_self() {
        run_world(1, 1, |c| {
            c.post_send(0, 5, Bytes::from_static(b"me")).unwrap();
            assert_eq!(c.wait_recv(0, 5).unwrap(), "me");
        });
    }

    #[test]
    fn node_ranks_partition_world() {
        let comms = LocalComm::world(4, 2);
        let node_ranks: Vec<_> = comms.iter().map(|c| c.node_rank()).collect();
        assert_eq!(node_ranks, vec![0, 1, 0, 1]);
    }
}
