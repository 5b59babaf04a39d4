//! Typed collectives over a [`Transport`].
//!
//! A [`Communicator`] binds a transport to the calling rank and records the
//! world rank of every member, so layouts living on different
//! sub-communicators can be mapped back onto a common parent group.

use std::fmt;
use std::sync::Arc;

use crate::transport::{CommError, Transport, TransportInfo};

/// A rank's handle on a process group.
#[derive(Clone)]
pub struct Communicator {
    transport: Arc<dyn Transport>,
    rank: usize,
    world_ranks: Arc<[usize]>,
}

impl fmt::Debug for Communicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Communicator")
            .field("rank", &self.rank)
            .field("size", &self.size())
            .field("world_rank", &self.world_rank())
            .finish()
    }
}

impl Communicator {
    /// Wrap a transport for `rank`. `world_ranks[r]` is the world rank of
    /// group member `r`.
    pub fn new(transport: Arc<dyn Transport>, rank: usize, world_ranks: Arc<[usize]>) -> Self {
        assert_eq!(
            transport.size(),
            world_ranks.len(),
            "World rank table must cover every member"
        );
        assert!(rank < world_ranks.len(), "Rank out of range");
        Self {
            transport,
            rank,
            world_ranks,
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.world_ranks.len()
    }

    /// World rank of the caller.
    pub fn world_rank(&self) -> usize {
        self.world_ranks[self.rank]
    }

    /// World rank of every member, indexed by rank in this group.
    pub fn world_ranks(&self) -> &[usize] {
        &self.world_ranks
    }

    /// Rank in this group of the member with world rank `world`, if any.
    pub fn rank_of_world(&self, world: usize) -> Option<usize> {
        self.world_ranks.iter().position(|&w| w == world)
    }

    /// True when both handles refer to the same process group.
    pub fn same_group(&self, other: &Communicator) -> bool {
        Arc::ptr_eq(&self.transport, &other.transport)
    }

    pub fn info(&self) -> TransportInfo {
        self.transport.info()
    }

    pub fn barrier(&self) -> Result<(), CommError> {
        self.transport.barrier(self.rank)
    }

    /// Personalised all-to-all of raw bytes.
    pub fn all_to_all_bytes(&self, outgoing: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>, CommError> {
        self.transport.all_to_all(self.rank, outgoing)
    }

    /// Every rank receives every rank's `bytes`, indexed by source rank.
    pub fn all_gather_bytes(&self, bytes: Vec<u8>) -> Result<Vec<Vec<u8>>, CommError> {
        self.all_to_all_bytes(vec![bytes; self.size()])
    }

    pub fn all_gather_u64(&self, values: &[u64]) -> Result<Vec<Vec<u64>>, CommError> {
        let bytes = bytemuck::cast_slice::<u64, u8>(values).to_vec();
        self.all_gather_bytes(bytes)?
            .iter()
            .map(|buffer| decode::<u64>(buffer))
            .collect()
    }

    /// Element-wise sum of `values` across the group, in place.
    pub fn all_reduce_sum(&self, values: &mut [usize]) -> Result<(), CommError> {
        let local: Vec<u64> = values.iter().map(|&v| v as u64).collect();
        let gathered = self.all_gather_u64(&local)?;
        for (i, slot) in values.iter_mut().enumerate() {
            let mut total = 0u64;
            for contribution in &gathered {
                let value = contribution.get(i).ok_or_else(|| {
                    CommError::CollectiveMismatch(format!(
                        "all_reduce_sum: a rank contributed {} values, expected {}",
                        contribution.len(),
                        local.len()
                    ))
                })?;
                total += value;
            }
            *slot = total as usize;
        }
        Ok(())
    }

    /// Personalised all-to-all of `f64` buffers.
    pub fn all_to_all_f64(&self, outgoing: Vec<Vec<f64>>) -> Result<Vec<Vec<f64>>, CommError> {
        let encoded = outgoing
            .iter()
            .map(|buffer| bytemuck::cast_slice::<f64, u8>(buffer).to_vec())
            .collect();
        self.all_to_all_bytes(encoded)?
            .iter()
            .map(|buffer| decode::<f64>(buffer))
            .collect()
    }

    /// Replace `data` on every rank with the contents held by `root`.
    pub fn broadcast_f64(&self, data: &mut Vec<f64>, root: usize) -> Result<(), CommError> {
        let mut bytes = if self.rank == root {
            bytemuck::cast_slice::<f64, u8>(data).to_vec()
        } else {
            Vec::new()
        };
        self.broadcast_bytes(&mut bytes, root)?;
        *data = decode::<f64>(&bytes)?;
        Ok(())
    }

    /// Broadcast raw bytes from `root`.
    pub fn broadcast_bytes(&self, data: &mut Vec<u8>, root: usize) -> Result<(), CommError> {
        if root >= self.size() {
            return Err(CommError::InvalidRank {
                rank: root,
                size: self.size(),
            });
        }
        let outgoing = if self.rank == root {
            vec![data.clone(); self.size()]
        } else {
            vec![Vec::new(); self.size()]
        };
        let mut incoming = self.all_to_all_bytes(outgoing)?;
        *data = std::mem::take(&mut incoming[root]);
        Ok(())
    }

    /// Collective split. Ranks passing `None` receive no communicator.
    pub fn split(&self, color: Option<u32>, key: usize) -> Result<Option<Communicator>, CommError> {
        let Some(result) = self.transport.split(self.rank, color, key)? else {
            return Ok(None);
        };
        let world_ranks: Arc<[usize]> = result
            .members
            .iter()
            .map(|&member| self.world_ranks[member])
            .collect();
        Ok(Some(Communicator::new(result.transport, result.rank, world_ranks)))
    }

    /// Fail on every rank unless all ranks supplied the same `fingerprint`.
    ///
    /// Call before a collective whose arguments must match across ranks; a
    /// mismatch would otherwise hang or corrupt the collective.
    pub fn verify_consistent(&self, operation: &str, fingerprint: u64) -> Result<(), CommError> {
        let gathered = self.all_gather_u64(&[fingerprint])?;
        if gathered.iter().any(|values| values.as_slice() != [fingerprint]) {
            log::warn!(
                "rank {}: SPMD fingerprint mismatch in `{operation}`: {:?}",
                self.rank,
                gathered
            );
            return Err(CommError::Inconsistent {
                operation: operation.to_string(),
            });
        }
        Ok(())
    }
}

fn decode<T: bytemuck::Pod>(bytes: &[u8]) -> Result<Vec<T>, CommError> {
    let width = std::mem::size_of::<T>();
    if bytes.len() % width != 0 {
        return Err(CommError::Decode(format!(
            "{} bytes is not a multiple of the element width {width}",
            bytes.len()
        )));
    }
    Ok(bytemuck::pod_collect_to_vec(bytes))
}
