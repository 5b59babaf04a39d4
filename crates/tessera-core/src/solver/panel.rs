//! Panel backend: `nalgebra`'s implicit symmetric QR, with a `faer`
//! accelerated path.
//!
//! Stricter than the general backend: it needs both triangles stored, a
//! power-of-two block and a grid with no empty process column.

use faer::Side;
use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::{Array2, ShapeBuilder};
use tessera_compute::Communicator;

use super::general::faer_eigh;
use super::{solve_on_representative, sort_ascending, BackendKind, DenseEigen, EigenBackend, KernelFailure, SolveRequest};
use crate::error::DiagError;
use crate::matrix::DistributedMatrix;
use crate::types::Storage;

#[derive(Debug, Clone, Copy, Default)]
pub struct PanelBackend {
    /// Sweep limit of the implicit QR iteration; 0 means unlimited.
    pub max_sweeps: usize,
}

impl PanelBackend {
    fn failure(&self, request: &SolveRequest<'_>, comm: &Communicator, code: i32, message: String) -> DiagError {
        DiagError::Backend {
            backend: self.name().to_string(),
            code,
            order: request.matrix.descriptor().global_rows(),
            workers: comm.size(),
            message,
        }
    }
}

impl EigenBackend for PanelBackend {
    fn name(&self) -> &str {
        "panel"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Panel
    }

    fn requires_full_storage(&self) -> bool {
        true
    }

    fn requires_no_empty_column(&self) -> bool {
        true
    }

    fn supports_acceleration(&self) -> bool {
        true
    }

    fn solve(
        &self,
        comm: &Communicator,
        request: &SolveRequest<'_>,
        eigenvectors: &mut DistributedMatrix,
    ) -> Result<Vec<f64>, DiagError> {
        let desc = request.matrix.descriptor();
        if request.storage != Storage::Full {
            return Err(self.failure(request, comm, -2, "both triangles must be stored".into()));
        }
        for block in [desc.block_rows(), desc.block_cols()] {
            if !block.is_power_of_two() {
                return Err(self.failure(request, comm, -3, format!("block size {block} is not a power of two")));
            }
        }
        let empty = desc.col_counts().iter().filter(|&&c| c == 0).count();
        if empty > 0 {
            log::warn!("panel backend running with {empty} empty process columns");
        }

        let max_sweeps = self.max_sweeps;
        if request.accelerate {
            solve_on_representative(self.name(), comm, request, eigenvectors, |matrix| {
                faer_eigh(matrix, Side::Lower)
            })
        } else {
            solve_on_representative(self.name(), comm, request, eigenvectors, |matrix| {
                implicit_qr_eigh(matrix, max_sweeps)
            })
        }
    }
}

/// Dense symmetric eigendecomposition via `nalgebra`'s implicit QR.
///
/// Status 1 means the iteration did not converge within `max_sweeps`.
pub fn implicit_qr_eigh(matrix: &Array2<f64>, max_sweeps: usize) -> Result<DenseEigen, KernelFailure> {
    let n = matrix.nrows();
    let m = DMatrix::from_fn(n, matrix.ncols(), |i, j| matrix[[i, j]]);
    if !m.is_square() {
        return Err(KernelFailure {
            code: -1,
            message: format!("matrix is {}x{}, not square", m.nrows(), m.ncols()),
        });
    }
    let eigen = SymmetricEigen::try_new(m, f64::EPSILON, max_sweeps).ok_or_else(|| KernelFailure {
        code: 1,
        message: format!("implicit QR did not converge within {max_sweeps} sweeps"),
    })?;

    let values: Vec<f64> = eigen.eigenvalues.iter().copied().collect();
    let vectors = Array2::from_shape_fn((n, n).f(), |(i, j)| eigen.eigenvectors[(i, j)]);
    Ok(sort_ascending(values, vectors))
}
