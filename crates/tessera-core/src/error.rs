//! Error taxonomy for layout, redistribution and diagonalisation.
//!
//! Nothing here is recovered locally: every variant is a collective abort,
//! because a rank that recovered on its own would desynchronise the SPMD
//! call sequence of its peers.

use serde::{Deserialize, Serialize};
use tessera_compute::CommError;
use thiserror::Error;

/// Errors that can occur while laying out or diagonalising a distributed matrix.
#[derive(Debug, Error)]
pub enum DiagError {
    #[error("Invalid process-grid topology: {0}")]
    InvalidTopology(String),

    #[error("Matrix order must be at least 1")]
    InvalidMatrixOrder,

    #[error("Invalid distribution descriptor: {0}")]
    InvalidDescriptor(String),

    #[error(
        "Block-cyclic layout mismatch in {context}: local extents sum to {found}, expected {expected}"
    )]
    LayoutMismatch {
        context: String,
        expected: usize,
        found: usize,
    },

    #[error(
        "Extent mismatch: source is {src_rows}x{src_cols}, destination is {dst_rows}x{dst_cols}"
    )]
    ExtentMismatch {
        src_rows: usize,
        src_cols: usize,
        dst_rows: usize,
        dst_cols: usize,
    },

    #[error(
        "Accelerated eigensolver disagrees with the reference run for order {order} on {workers} workers \
         (max |Δλ| = {max_deviation:.3e} > {tolerance:.1e}); disable the unsafe acceleration override"
    )]
    AccelerationCorrectnessFailure {
        order: usize,
        workers: usize,
        max_deviation: f64,
        tolerance: f64,
    },

    #[error("Backend `{backend}` failed with status {code} (order {order}, {workers} workers): {message}")]
    Backend {
        backend: String,
        code: i32,
        order: usize,
        workers: usize,
        message: String,
    },

    #[error(
        "Eigenvector check failed for order {order}: {quantity} deviation {deviation:.3e} exceeds {tolerance:.1e}"
    )]
    EigenCheckFailure {
        order: usize,
        quantity: String,
        deviation: f64,
        tolerance: f64,
    },

    #[error("Communication error: {0}")]
    Comm(#[from] CommError),
}

/// Serialisable form of the errors that can arise on a subset of ranks and
/// must be re-raised identically on every other rank.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum FailureRecord {
    Acceleration {
        order: usize,
        workers: usize,
        max_deviation: f64,
        tolerance: f64,
    },
    Backend {
        backend: String,
        code: i32,
        order: usize,
        workers: usize,
        message: String,
    },
    EigenCheck {
        order: usize,
        quantity: String,
        deviation: f64,
        tolerance: f64,
    },
    LayoutMismatch {
        context: String,
        expected: usize,
        found: usize,
    },
    Other {
        message: String,
    },
}

impl From<&DiagError> for FailureRecord {
    fn from(err: &DiagError) -> Self {
        match err {
            DiagError::AccelerationCorrectnessFailure {
                order,
                workers,
                max_deviation,
                tolerance,
            } => Self::Acceleration {
                order: *order,
                workers: *workers,
                max_deviation: *max_deviation,
                tolerance: *tolerance,
            },
            DiagError::Backend {
                backend,
                code,
                order,
                workers,
                message,
            } => Self::Backend {
                backend: backend.clone(),
                code: *code,
                order: *order,
                workers: *workers,
                message: message.clone(),
            },
            DiagError::EigenCheckFailure {
                order,
                quantity,
                deviation,
                tolerance,
            } => Self::EigenCheck {
                order: *order,
                quantity: quantity.clone(),
                deviation: *deviation,
                tolerance: *tolerance,
            },
            DiagError::LayoutMismatch {
                context,
                expected,
                found,
            } => Self::LayoutMismatch {
                context: context.clone(),
                expected: *expected,
                found: *found,
            },
            other => Self::Other {
                message: other.to_string(),
            },
        }
    }
}

impl From<FailureRecord> for DiagError {
    fn from(record: FailureRecord) -> Self {
        match record {
            FailureRecord::Acceleration {
                order,
                workers,
                max_deviation,
                tolerance,
            } => Self::AccelerationCorrectnessFailure {
                order,
                workers,
                max_deviation,
                tolerance,
            },
            FailureRecord::Backend {
                backend,
                code,
                order,
                workers,
                message,
            } => Self::Backend {
                backend,
                code,
                order,
                workers,
                message,
            },
            FailureRecord::EigenCheck {
                order,
                quantity,
                deviation,
                tolerance,
            } => Self::EigenCheckFailure {
                order,
                quantity,
                deviation,
                tolerance,
            },
            FailureRecord::LayoutMismatch {
                context,
                expected,
                found,
            } => Self::LayoutMismatch {
                context,
                expected,
                found,
            },
            FailureRecord::Other { message } => {
                Self::Comm(CommError::CollectiveMismatch(format!("peer rank failed: {message}")))
            }
        }
    }
}

/// Make every rank of `comm` observe the same outcome.
///
/// Each rank contributes its local outcome; if any rank failed, all ranks
/// return the failure of the lowest failing rank.
pub(crate) fn agree<T>(
    comm: &tessera_compute::Communicator,
    outcome: Result<T, DiagError>,
) -> Result<T, DiagError> {
    let local = match &outcome {
        Ok(_) => None,
        Err(err) => Some(FailureRecord::from(err)),
    };
    let bytes = serde_json::to_vec(&local).map_err(|e| CommError::Decode(e.to_string()))?;
    for (rank, buffer) in comm.all_gather_bytes(bytes)?.iter().enumerate() {
        let record: Option<FailureRecord> =
            serde_json::from_slice(buffer).map_err(|e| CommError::Decode(e.to_string()))?;
        if let Some(record) = record {
            if rank != comm.rank() {
                log::debug!("rank {}: adopting failure reported by rank {rank}", comm.rank());
            }
            return Err(record.into());
        }
    }
    outcome
}
