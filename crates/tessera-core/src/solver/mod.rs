//! Eigensolver backends.
//!
//! The [`EigenBackend`] trait is the seam between the dispatcher and the
//! numerical kernels. Two backends ship:
//!
//! | Backend | Kernel | Needs full storage | Forbids empty columns | Accelerated path |
//! |---------|--------|--------------------|-----------------------|------------------|
//! | [`GeneralBackend`] | `faer` self-adjoint EVD on the upper triangle | no | no | no |
//! | [`PanelBackend`] | `nalgebra` implicit QR | yes | yes | `faer` EVD |
//!
//! Both collect the matrix on the lowest rank of the active group, run the
//! dense kernel there, and scatter the eigenvectors back.

pub mod check;
pub mod general;
pub mod panel;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tessera_compute::Communicator;

use crate::error::{agree, DiagError};
use crate::grid::{GridShape, ProcessGrid};
use crate::layout::{DescriptorOptions, DistributionDescriptor, Participant};
use crate::matrix::DistributedMatrix;
use crate::redistribute::redistribute;
use crate::types::Storage;

pub use check::EigenCheck;
pub use general::GeneralBackend;
pub use panel::PanelBackend;

/// Backends selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    General,
    Panel,
}

impl BackendKind {
    pub fn create(self) -> Arc<dyn EigenBackend> {
        match self {
            BackendKind::General => Arc::new(GeneralBackend),
            BackendKind::Panel => Arc::new(PanelBackend::default()),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::General => f.write_str("general"),
            BackendKind::Panel => f.write_str("panel"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "general" => Ok(BackendKind::General),
            "panel" => Ok(BackendKind::Panel),
            other => Err(format!("unknown backend `{other}` (expected `general` or `panel`)")),
        }
    }
}

/// One solve handed to a backend.
#[derive(Debug, Clone, Copy)]
pub struct SolveRequest<'a> {
    pub matrix: &'a DistributedMatrix,
    pub storage: Storage,
    /// Number of lowest eigenpairs to return, `1..=order`.
    pub neig: usize,
    /// Take the accelerated kernel, if the backend has one.
    pub accelerate: bool,
    pub check: EigenCheck,
    pub check_tolerance: f64,
}

/// A distributed symmetric eigensolver.
pub trait EigenBackend: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> BackendKind;

    /// The lower triangle must be filled before [`solve`](Self::solve).
    fn requires_full_storage(&self) -> bool;

    /// The input grid must not have a process column without data.
    fn requires_no_empty_column(&self) -> bool;

    fn supports_acceleration(&self) -> bool {
        false
    }

    /// Collective over `comm`, which must be the matrix's grid communicator.
    ///
    /// On success `eigenvectors` (same layout as the matrix) holds the
    /// eigenvectors of the `neig` lowest eigenvalues in its first `neig`
    /// columns and zeros elsewhere; the returned eigenvalues are ascending
    /// and identical on every rank.
    fn solve(
        &self,
        comm: &Communicator,
        request: &SolveRequest<'_>,
        eigenvectors: &mut DistributedMatrix,
    ) -> Result<Vec<f64>, DiagError>;
}

/// Dense eigendecomposition: ascending `values`, eigenvectors as columns.
#[derive(Debug, Clone)]
pub struct DenseEigen {
    pub values: Vec<f64>,
    pub vectors: Array2<f64>,
}

/// Failure status of a dense kernel.
#[derive(Debug, Clone)]
pub struct KernelFailure {
    pub code: i32,
    pub message: String,
}

/// Reorder eigenpairs by ascending eigenvalue.
pub(crate) fn sort_ascending(values: Vec<f64>, vectors: Array2<f64>) -> DenseEigen {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
    let sorted_vectors = Array2::from_shape_fn(vectors.raw_dim(), |(i, j)| vectors[[i, order[j]]]);
    DenseEigen {
        values: order.iter().map(|&k| values[k]).collect(),
        vectors: sorted_vectors,
    }
}

pub(crate) fn ensure_finite(eigen: &DenseEigen) -> Result<(), KernelFailure> {
    if eigen.values.iter().any(|v| !v.is_finite()) {
        return Err(KernelFailure {
            code: 2,
            message: "kernel produced a non-finite eigenvalue".into(),
        });
    }
    Ok(())
}

/// Run `kernel` on the lowest rank of `comm` and distribute its result.
///
/// The matrix is collected onto a 1x1 grid, decomposed, optionally checked,
/// and the eigenvectors are redistributed into `eigenvectors`. Any failure
/// is reported on every rank of `comm`.
pub(crate) fn solve_on_representative(
    backend: &str,
    comm: &Communicator,
    request: &SolveRequest<'_>,
    eigenvectors: &mut DistributedMatrix,
    kernel: impl FnOnce(&Array2<f64>) -> Result<DenseEigen, KernelFailure>,
) -> Result<Vec<f64>, DiagError> {
    let order = request.matrix.descriptor().global_rows();
    if order < 1 {
        return Err(DiagError::InvalidMatrixOrder);
    }
    let workers = comm.size();
    let root = comm.split((comm.rank() == 0).then_some(0), comm.rank())?;

    let mut gathered = match &root {
        Some(root) => {
            let grid = ProcessGrid::create(root, GridShape::Square)?;
            let desc = DistributionDescriptor::create(
                &grid,
                DescriptorOptions::new(order, order).block(order, order).force_block(),
            )?;
            Participant::Active(DistributedMatrix::zeros(&desc))
        }
        None => Participant::Dormant,
    };
    redistribute(comm, Participant::Active(request.matrix), gathered.as_mut())?;

    let outcome = match &gathered {
        Participant::Active(full) => kernel(full.local())
            .and_then(|dense| ensure_finite(&dense).map(|()| dense))
            .map_err(|failure| DiagError::Backend {
                backend: backend.to_string(),
                code: failure.code,
                order,
                workers,
                message: failure.message,
            })
            .and_then(|dense| {
                check::verify(
                    full.local(),
                    request.storage,
                    &dense,
                    request.neig,
                    request.check,
                    request.check_tolerance,
                )?;
                Ok(Some(dense))
            }),
        Participant::Dormant => Ok(None),
    };
    let dense = agree(comm, outcome)?;

    let mut values = Vec::new();
    let mut source = Participant::Dormant;
    if let (Some(dense), Participant::Active(full)) = (dense, &gathered) {
        let neig = request.neig.min(dense.values.len());
        values = dense.values[..neig].to_vec();
        let mut vectors = DistributedMatrix::zeros(full.descriptor());
        vectors
            .local_mut()
            .slice_mut(ndarray::s![.., ..neig])
            .assign(&dense.vectors.slice(ndarray::s![.., ..neig]));
        source = Participant::Active(vectors);
    }
    redistribute(comm, source.as_ref(), Participant::Active(eigenvectors))?;
    comm.broadcast_f64(&mut values, 0)?;
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_sort_ascending_moves_columns_with_values() {
        let sorted = sort_ascending(vec![3.0, -1.0, 2.0], array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
        assert_eq!(sorted.values, vec![-1.0, 2.0, 3.0]);
        assert_eq!(sorted.vectors, array![[2.0, 3.0, 1.0], [5.0, 6.0, 4.0]]);
    }

    #[test]
    fn test_backend_kind_parsing() {
        assert_eq!("Panel".parse::<BackendKind>().unwrap(), BackendKind::Panel);
        assert!("scalapack".parse::<BackendKind>().is_err());
        assert_eq!(BackendKind::default().to_string(), "general");
    }

    #[test]
    fn test_non_finite_values_are_rejected() {
        let eigen = DenseEigen {
            values: vec![1.0, f64::NAN],
            vectors: Array2::zeros((2, 2)),
        };
        assert_eq!(ensure_finite(&eigen).unwrap_err().code, 2);
    }
}
