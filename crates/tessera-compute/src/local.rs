//! In-process transport: every rank is a thread of the current process.
//!
//! [`LocalCluster`] runs an SPMD closure on `N` simulated ranks. Collectives
//! rendezvous in a shared mailbox guarded by a `parking_lot` mutex; a round
//! completes once every rank has deposited its buffers and fully drains
//! before the next round may begin, so back-to-back collectives never mix.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::comm::Communicator;
use crate::transport::{CommError, SplitResult, Transport, TransportInfo, TransportKind};

/// How long a blocked rank sleeps before re-checking the abort flag.
const ABORT_POLL: Duration = Duration::from_millis(20);

const NO_COLOR: u64 = u64::MAX;

struct Round {
    generation: u64,
    arrived: usize,
    departed: usize,
    draining: bool,
    /// `slots[src][dst]`, populated while the round fills.
    slots: Vec<Option<Vec<Vec<u8>>>>,
}

struct PendingGroup {
    transport: Arc<LocalTransport>,
    remaining: usize,
}

#[derive(Default)]
struct SplitRegistry {
    /// Number of splits each rank has entered; identical across ranks under SPMD.
    epochs: Vec<u64>,
    pending: HashMap<(u64, u32), PendingGroup>,
}

/// Shared-memory transport connecting the threads of a [`LocalCluster`].
pub struct LocalTransport {
    size: usize,
    label: String,
    round: Mutex<Round>,
    ready: Condvar,
    aborted: Arc<AtomicBool>,
    splits: Mutex<SplitRegistry>,
}

impl LocalTransport {
    fn with_abort(size: usize, label: String, aborted: Arc<AtomicBool>) -> Self {
        Self {
            size,
            label,
            round: Mutex::new(Round {
                generation: 0,
                arrived: 0,
                departed: 0,
                draining: false,
                slots: (0..size).map(|_| None).collect(),
            }),
            ready: Condvar::new(),
            aborted,
            splits: Mutex::new(SplitRegistry {
                epochs: vec![0; size],
                pending: HashMap::new(),
            }),
        }
    }

    /// Create the world transport of a fresh cluster.
    pub fn world(size: usize) -> Self {
        Self::with_abort(size, "local-world".into(), Arc::new(AtomicBool::new(false)))
    }

    /// Mark the cluster as failed; blocked ranks return [`CommError::PeerAborted`].
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    fn check_rank(&self, rank: usize) -> Result<(), CommError> {
        if rank >= self.size {
            return Err(CommError::InvalidRank {
                rank,
                size: self.size,
            });
        }
        Ok(())
    }

    fn wait(&self, guard: &mut MutexGuard<'_, Round>) -> Result<(), CommError> {
        if self.aborted.load(Ordering::Acquire) {
            return Err(CommError::PeerAborted);
        }
        self.ready.wait_for(guard, ABORT_POLL);
        Ok(())
    }
}

impl Transport for LocalTransport {
    fn info(&self) -> TransportInfo {
        TransportInfo {
            name: format!("{} ({} ranks)", self.label, self.size),
            kind: TransportKind::Local,
            size: self.size,
        }
    }

    fn size(&self) -> usize {
        self.size
    }

    fn all_to_all(&self, rank: usize, outgoing: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>, CommError> {
        self.check_rank(rank)?;
        if outgoing.len() != self.size {
            return Err(CommError::CollectiveMismatch(format!(
                "rank {rank} supplied {} buffers for a group of size {}",
                outgoing.len(),
                self.size
            )));
        }

        let mut round = self.round.lock();
        while round.draining {
            self.wait(&mut round)?;
        }
        if round.slots[rank].is_some() {
            return Err(CommError::CollectiveMismatch(format!(
                "rank {rank} entered the same collective twice"
            )));
        }
        round.slots[rank] = Some(outgoing);
        round.arrived += 1;

        let generation = round.generation;
        if round.arrived == self.size {
            round.draining = true;
            round.generation += 1;
            self.ready.notify_all();
        } else {
            while round.generation == generation {
                self.wait(&mut round)?;
            }
        }

        let incoming = round
            .slots
            .iter_mut()
            .map(|slot| {
                slot.as_mut()
                    .map(|buffers| std::mem::take(&mut buffers[rank]))
                    .unwrap_or_default()
            })
            .collect();

        round.departed += 1;
        if round.departed == self.size {
            round.slots.iter_mut().for_each(|slot| *slot = None);
            round.arrived = 0;
            round.departed = 0;
            round.draining = false;
            self.ready.notify_all();
        }
        Ok(incoming)
    }

    fn split(
        &self,
        rank: usize,
        color: Option<u32>,
        key: usize,
    ) -> Result<Option<SplitResult>, CommError> {
        let word = [color.map_or(NO_COLOR, u64::from), key as u64];
        let payload = bytemuck::cast_slice::<u64, u8>(&word).to_vec();
        let incoming = self.all_to_all(rank, vec![payload; self.size])?;

        let mut entries = Vec::with_capacity(self.size);
        for buffer in &incoming {
            if buffer.len() != 16 {
                return Err(CommError::Decode(format!(
                    "split header of {} bytes, expected 16",
                    buffer.len()
                )));
            }
            let pair: Vec<u64> = bytemuck::pod_collect_to_vec(buffer);
            entries.push((pair[0], pair[1]));
        }

        let epoch = {
            let mut registry = self.splits.lock();
            let epoch = registry.epochs[rank];
            registry.epochs[rank] += 1;
            epoch
        };

        let Some(color) = color else {
            return Ok(None);
        };

        let mut members: Vec<usize> = (0..self.size)
            .filter(|&r| entries[r].0 == u64::from(color))
            .collect();
        members.sort_by_key(|&r| (entries[r].1, r));
        let new_rank = members
            .iter()
            .position(|&r| r == rank)
            .ok_or_else(|| CommError::CollectiveMismatch("caller missing from its own colour".into()))?;

        let transport = {
            let mut registry = self.splits.lock();
            let slot = (epoch, color);
            let (transport, done) = {
                let pending = registry.pending.entry(slot).or_insert_with(|| PendingGroup {
                    transport: Arc::new(Self::with_abort(
                        members.len(),
                        format!("{}/split{epoch}:{color}", self.label),
                        Arc::clone(&self.aborted),
                    )),
                    remaining: members.len(),
                });
                pending.remaining -= 1;
                (Arc::clone(&pending.transport), pending.remaining == 0)
            };
            if done {
                registry.pending.remove(&slot);
            }
            transport
        };

        log::trace!(
            "rank {rank} of {} joined colour {color} as rank {new_rank}/{}",
            self.label,
            members.len()
        );

        Ok(Some(SplitResult {
            transport,
            rank: new_rank,
            members,
        }))
    }
}

/// Poisons the cluster if the owning rank thread unwinds.
struct AbortOnPanic {
    world: Arc<LocalTransport>,
    rank: usize,
    first_panic: Arc<Mutex<Option<usize>>>,
}

impl Drop for AbortOnPanic {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.first_panic.lock().get_or_insert(self.rank);
            self.world.abort();
        }
    }
}

/// A simulated cluster of ranks backed by [`LocalTransport`].
///
/// ```
/// use tessera_compute::LocalCluster;
///
/// let ranks = LocalCluster::new(3).run(|comm| comm.rank());
/// assert_eq!(ranks, vec![0, 1, 2]);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct LocalCluster {
    size: usize,
}

impl LocalCluster {
    /// Create a cluster of `size` ranks.
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "A cluster needs at least one rank");
        Self { size }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `f` on every rank and return the per-rank results ordered by rank.
    ///
    /// If any rank panics, the cluster is aborted (blocked peers return
    /// [`CommError::PeerAborted`]) and the first panic is re-raised here.
    pub fn run<T, F>(&self, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(Communicator) -> T + Sync,
    {
        let world = Arc::new(LocalTransport::world(self.size));
        let world_ranks: Arc<[usize]> = (0..self.size).collect();
        let first_panic = Arc::new(Mutex::new(None));

        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..self.size)
                .map(|rank| {
                    let transport: Arc<dyn Transport> = world.clone();
                    let comm = Communicator::new(transport, rank, Arc::clone(&world_ranks));
                    let guard = AbortOnPanic {
                        world: Arc::clone(&world),
                        rank,
                        first_panic: Arc::clone(&first_panic),
                    };
                    let f = &f;
                    scope.spawn(move || {
                        let _guard = guard;
                        f(comm)
                    })
                })
                .collect();

            let mut results = Vec::with_capacity(self.size);
            let mut panics = Vec::new();
            for (rank, handle) in handles.into_iter().enumerate() {
                match handle.join() {
                    Ok(value) => results.push(value),
                    Err(payload) => panics.push((rank, payload)),
                }
            }
            if !panics.is_empty() {
                let origin = (*first_panic.lock()).unwrap_or(panics[0].0);
                let index = panics.iter().position(|(rank, _)| *rank == origin).unwrap_or(0);
                std::panic::resume_unwind(panics.swap_remove(index).1);
            }
            results
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_to_all_routes_by_destination() {
        let received = LocalCluster::new(3).run(|comm| {
            let me = comm.rank() as u8;
            let outgoing = (0..3u8).map(|dst| vec![me * 10 + dst]).collect();
            comm.all_to_all_bytes(outgoing).unwrap()
        });

        for (rank, incoming) in received.iter().enumerate() {
            for (src, buffer) in incoming.iter().enumerate() {
                assert_eq!(buffer, &vec![(src * 10 + rank) as u8]);
            }
        }
    }

    #[test]
    fn test_back_to_back_rounds_do_not_mix() {
        let sums = LocalCluster::new(4).run(|comm| {
            let mut total = 0usize;
            for round in 0..50 {
                let mut value = [comm.rank() + round];
                comm.all_reduce_sum(&mut value).unwrap();
                total += value[0];
            }
            total
        });
        // sum over rounds of (0+1+2+3 + 4*round)
        let expected: usize = (0..50).map(|r| 6 + 4 * r).sum();
        assert!(sums.iter().all(|&s| s == expected));
    }

    #[test]
    fn test_split_orders_members_by_key() {
        let groups = LocalCluster::new(4).run(|comm| {
            let color = (comm.rank() % 2) as u32;
            // Reverse order inside each colour.
            let key = 10 - comm.rank();
            let sub = comm.split(Some(color), key).unwrap().unwrap();
            (sub.rank(), sub.size(), sub.world_ranks().to_vec())
        });

        assert_eq!(groups[0], (1, 2, vec![2, 0]));
        assert_eq!(groups[2], (0, 2, vec![2, 0]));
        assert_eq!(groups[1], (1, 2, vec![3, 1]));
        assert_eq!(groups[3], (0, 2, vec![3, 1]));
    }

    #[test]
    fn test_split_without_colour_yields_none() {
        let joined = LocalCluster::new(3).run(|comm| {
            let color = (comm.rank() == 0).then_some(0);
            comm.split(color, comm.rank()).unwrap().map(|c| c.size())
        });
        assert_eq!(joined, vec![Some(1), None, None]);
    }

    #[test]
    fn test_wrong_buffer_count_is_rejected() {
        let transport = LocalTransport::world(2);
        let err = transport.all_to_all(0, vec![Vec::new()]).unwrap_err();
        assert!(matches!(err, CommError::CollectiveMismatch(_)));
    }

    #[test]
    fn test_panicking_rank_aborts_peers() {
        let outcome = std::panic::catch_unwind(|| {
            LocalCluster::new(2).run(|comm| {
                if comm.rank() == 1 {
                    panic!("rank 1 failed");
                }
                comm.barrier()
            })
        });
        let payload = outcome.unwrap_err();
        let message = payload.downcast_ref::<&str>().copied().unwrap_or_default();
        assert_eq!(message, "rank 1 failed");
    }
}
