//! Distributed execution runtime boundary (external collaborator, §6).
//!
//! `Comm` is the thin surface this crate actually needs from a ranked
//! communicator: point-to-point send/recv, broadcast, and sum all-reduce.
//! `MpiComm` wires this to the `mpi` crate (rsmpi); `FakeComm` (test-only)
//! simulates `P` ranks inside a single process so the testable properties in
//! SPEC_FULL.md §8 that need `size > 1` can run under plain `cargo test`
//! without `mpirun`.
//!
//! Every call here is blocking. §4.9/§5's "non-blocking issue followed by an
//! explicit wait" describes the original's cross-process cotangent handoff;
//! this crate's `AutogradBridge` never needs it (see DESIGN.md) — each
//! rank's backward pass reads its own upstream cotangent off its own local
//! `candle` tape, so there is no buffer to overlap a send against.

use crate::error::{BraidError, BraidResult};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Ranked point-to-point + collective communication, scoped to exactly the
/// operations this crate calls (§6 of SPEC_FULL.md).
pub trait Comm {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    fn send_bytes(&self, data: &[u8], dest: usize, tag: i32) -> BraidResult<()>;
    fn recv_bytes(&self, source: usize, tag: i32) -> BraidResult<Vec<u8>>;

    fn broadcast_bytes(&self, data: &mut Vec<u8>, root: usize) -> BraidResult<()>;

    fn all_reduce_sum_f32(&self, buf: &mut [f32]) -> BraidResult<()>;
}

/// Production communicator: a thin wrapper over `mpi::topology::SimpleCommunicator`.
///
/// The `mpi` crate's blocking calls map directly onto the trait above.
pub struct MpiComm {
    world: mpi::topology::SimpleCommunicator,
}

impl MpiComm {
    /// Initializes the MPI runtime and returns a communicator over
    /// `MPI_COMM_WORLD`. Must be called at most once per process; the
    /// returned `mpi::Universe` guard is leaked deliberately (mirrors the
    /// original's process-lifetime `MPI.COMM_WORLD` handle) so `MpiComm`
    /// remains `'static`.
    pub fn world() -> Self {
        let universe = mpi::initialize().expect("MPI_Init failed");
        let world = universe.world();
        std::mem::forget(universe);
        Self { world }
    }
}

impl Comm for MpiComm {
    fn rank(&self) -> usize {
        use mpi::traits::Communicator;
        self.world.rank() as usize
    }

    fn size(&self) -> usize {
        use mpi::traits::Communicator;
        self.world.size() as usize
    }

    fn send_bytes(&self, data: &[u8], dest: usize, tag: i32) -> BraidResult<()> {
        use mpi::point_to_point::Destination;
        use mpi::traits::Communicator;
        self.world
            .process_at_rank(dest as i32)
            .send_with_tag(data, tag);
        Ok(())
    }

    fn recv_bytes(&self, source: usize, tag: i32) -> BraidResult<Vec<u8>> {
        use mpi::point_to_point::Source;
        use mpi::traits::Communicator;
        let (data, _status) = self
            .world
            .process_at_rank(source as i32)
            .receive_vec_with_tag::<u8>(tag);
        Ok(data)
    }

    fn broadcast_bytes(&self, data: &mut Vec<u8>, root: usize) -> BraidResult<()> {
        use mpi::collective::CommunicatorCollectives;
        use mpi::traits::Communicator;
        let root_process = self.world.process_at_rank(root as i32);
        let mut len = data.len() as u64;
        root_process.broadcast_into(&mut len);
        if self.rank() != root {
            data.resize(len as usize, 0);
        }
        root_process.broadcast_into(&mut data[..]);
        Ok(())
    }

    fn all_reduce_sum_f32(&self, buf: &mut [f32]) -> BraidResult<()> {
        use mpi::collective::CommunicatorCollectives;
        use mpi::collective::SystemOperation;
        let send = buf.to_vec();
        self.world
            .all_reduce_into(&send[..], buf, SystemOperation::sum());
        Ok(())
    }
}

/// In-process simulation of `P` ranks sharing a single address space,
/// used only under `#[cfg(test)]` (see SPEC_FULL.md §9, "Single-process
/// multi-rank testing"). Mailboxes are keyed by `(dest_rank, tag)`.
#[derive(Clone)]
pub struct FakeComm {
    rank: usize,
    size: usize,
    mailboxes: Rc<RefCell<HashMap<(usize, i32), Vec<Vec<u8>>>>>,
}

impl FakeComm {
    /// Builds `size` linked `FakeComm` handles, one per simulated rank.
    pub fn ring(size: usize) -> Vec<Self> {
        let mailboxes = Rc::new(RefCell::new(HashMap::new()));
        (0..size)
            .map(|rank| Self {
                rank,
                size,
                mailboxes: mailboxes.clone(),
            })
            .collect()
    }
}

impl Comm for FakeComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn send_bytes(&self, data: &[u8], dest: usize, tag: i32) -> BraidResult<()> {
        self.mailboxes
            .borrow_mut()
            .entry((dest, tag))
            .or_default()
            .push(data.to_vec());
        Ok(())
    }

    fn recv_bytes(&self, _source: usize, tag: i32) -> BraidResult<Vec<u8>> {
        let mut mailboxes = self.mailboxes.borrow_mut();
        let queue = mailboxes.entry((self.rank, tag)).or_default();
        queue
            .pop()
            .ok_or_else(|| BraidError::Comm(format!("no message for rank {} tag {}", self.rank, tag)))
    }

    fn broadcast_bytes(&self, data: &mut Vec<u8>, root: usize) -> BraidResult<()> {
        // Single-threaded simulation: root's buffer is already the agreed
        // value, every other handle only needs to converge to the same
        // bytes via a shared side-channel mailbox under a fixed tag.
        const BCAST_TAG: i32 = i32::MIN;
        if self.rank == root {
            for dest in 0..self.size {
                if dest != root {
                    self.send_bytes(data, dest, BCAST_TAG)?;
                }
            }
        } else {
            *data = self.recv_bytes(root, BCAST_TAG)?;
        }
        Ok(())
    }

    fn all_reduce_sum_f32(&self, buf: &mut [f32]) -> BraidResult<()> {
        const REDUCE_TAG: i32 = i32::MIN + 1;
        let bytes = bincode::serialize(buf).map_err(BraidError::Serialization)?;
        for dest in 0..self.size {
            if dest != self.rank {
                self.send_bytes(&bytes, dest, REDUCE_TAG)?;
            }
        }
        for _ in 0..(self.size - 1) {
            let peer = self.recv_bytes(self.rank, REDUCE_TAG)?;
            let peer: Vec<f32> = bincode::deserialize(&peer).map_err(BraidError::Serialization)?;
            for (a, b) in buf.iter_mut().zip(peer.into_iter()) {
                *a += b;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_comm_send_recv_round_trips() {
        let ranks = FakeComm::ring(2);
        ranks[0].send_bytes(&[1, 2, 3], 1, 7).unwrap();
        let got = ranks[1].recv_bytes(0, 7).unwrap();
        assert_eq!(got, vec![1, 2, 3]);
    }

    #[test]
    fn fake_comm_broadcast_reaches_every_rank() {
        let ranks = FakeComm::ring(3);
        let mut buf = b"hello".to_vec();
        ranks[0].broadcast_bytes(&mut buf, 0).unwrap();
        let mut b1 = Vec::new();
        ranks[1].broadcast_bytes(&mut b1, 0).unwrap();
        let mut b2 = Vec::new();
        ranks[2].broadcast_bytes(&mut b2, 0).unwrap();
        assert_eq!(b1, b"hello");
        assert_eq!(b2, b"hello");
    }

    #[test]
    fn fake_comm_all_reduce_sums_across_ranks() {
        let ranks = FakeComm::ring(3);
        let mut bufs = vec![vec![1.0f32], vec![2.0f32], vec![3.0f32]];
        for (r, buf) in bufs.iter_mut().enumerate() {
            ranks[r].all_reduce_sum_f32(buf).unwrap();
        }
        for buf in &bufs {
            assert_eq!(buf[0], 6.0);
        }
    }
}
