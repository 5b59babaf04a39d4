//! Transport trait and communication error types.
//!
//! The [`Transport`] trait abstracts over the process group that carries
//! collective traffic (in-process threads, MPI) so that the layout and
//! eigensolver code in `tessera-core` stays agnostic of how ranks are
//! actually connected.

use std::sync::Arc;

use thiserror::Error;

/// Errors originating from a transport or a collective built on it.
#[derive(Debug, Error)]
pub enum CommError {
    #[error("Collective mismatch: {0}")]
    CollectiveMismatch(String),

    #[error("A peer rank aborted while this rank was blocked in a collective")]
    PeerAborted,

    #[error("Invalid rank {rank} for a group of size {size}")]
    InvalidRank { rank: usize, size: usize },

    #[error("Failed to decode collective payload: {0}")]
    Decode(String),

    #[error("SPMD consistency check failed in `{operation}`: ranks disagree on call arguments")]
    Inconsistent { operation: String },
}

/// The kind of transport a communicator runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Ranks are threads of the current process.
    Local,
    /// Ranks are MPI processes.
    Mpi,
}

/// Describes a transport instance.
#[derive(Debug, Clone)]
pub struct TransportInfo {
    pub name: String,
    pub kind: TransportKind,
    pub size: usize,
}

/// Result of a communicator split, as seen by one member of a new group.
pub struct SplitResult {
    /// Transport shared by every member of the new group.
    pub transport: Arc<dyn Transport>,
    /// Rank of the caller inside the new group.
    pub rank: usize,
    /// Ranks (in the parent group) of every new-group member, ordered by
    /// new rank.
    pub members: Vec<usize>,
}

/// Abstraction over the process group that executes collectives.
///
/// Every method is a blocking collective: all `size()` ranks must call it
/// in the same order with compatible arguments.
pub trait Transport: Send + Sync {
    /// Return information about the transport.
    fn info(&self) -> TransportInfo;

    /// Number of ranks in the group.
    fn size(&self) -> usize;

    /// Personalised all-to-all exchange.
    ///
    /// `outgoing[d]` is delivered to rank `d`; the returned vector holds, at
    /// index `s`, the buffer rank `s` addressed to `rank`. `outgoing` must
    /// have exactly `size()` entries.
    fn all_to_all(&self, rank: usize, outgoing: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>, CommError>;

    /// Partition the group by `color`.
    ///
    /// Ranks sharing a colour form a new group ordered by `(key, rank)`.
    /// Ranks passing `None` take part in the collective but receive no group.
    fn split(
        &self,
        rank: usize,
        color: Option<u32>,
        key: usize,
    ) -> Result<Option<SplitResult>, CommError>;

    /// Synchronisation barrier.
    fn barrier(&self, rank: usize) -> Result<(), CommError> {
        let empty = vec![Vec::new(); self.size()];
        self.all_to_all(rank, empty).map(|_| ())
    }
}
