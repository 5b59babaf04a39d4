//! General-purpose backend built on `faer`'s self-adjoint eigendecomposition.
//!
//! Reads only the upper triangle, accepts any worker count and any block
//! size. Suited to every problem size this crate handles; the panel backend
//! is the one with structural requirements.

use faer::Side;
use ndarray::{Array2, ShapeBuilder};
use tessera_compute::Communicator;

use super::{solve_on_representative, sort_ascending, BackendKind, DenseEigen, EigenBackend, KernelFailure, SolveRequest};
use crate::error::DiagError;
use crate::matrix::DistributedMatrix;

#[derive(Debug, Clone, Copy, Default)]
pub struct GeneralBackend;

impl EigenBackend for GeneralBackend {
    fn name(&self) -> &str {
        "general"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::General
    }

    fn requires_full_storage(&self) -> bool {
        false
    }

    fn requires_no_empty_column(&self) -> bool {
        false
    }

    fn solve(
        &self,
        comm: &Communicator,
        request: &SolveRequest<'_>,
        eigenvectors: &mut DistributedMatrix,
    ) -> Result<Vec<f64>, DiagError> {
        solve_on_representative(self.name(), comm, request, eigenvectors, |matrix| {
            faer_eigh(matrix, Side::Upper)
        })
    }
}

/// Dense symmetric eigendecomposition via `faer`, reading the triangle
/// selected by `side`.
pub fn faer_eigh(matrix: &Array2<f64>, side: Side) -> Result<DenseEigen, KernelFailure> {
    let (rows, cols) = matrix.dim();
    if rows != cols {
        return Err(KernelFailure {
            code: -1,
            message: format!("matrix is {rows}x{cols}, not square"),
        });
    }
    let n = rows;

    let mat = faer::Mat::<f64>::from_fn(n, n, |i, j| matrix[[i, j]]);
    let evd = mat.selfadjoint_eigendecomposition(side);

    let s = evd.s().column_vector();
    let values: Vec<f64> = (0..n).map(|i| s.read(i)).collect();
    let u = evd.u();
    let vectors = Array2::from_shape_fn((n, n).f(), |(i, j)| u.read(i, j));

    Ok(sort_ascending(values, vectors))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_faer_eigh_known_spectrum() {
        let matrix = array![[2.0, -1.0, 0.0], [-1.0, 2.0, -1.0], [0.0, -1.0, 2.0]];
        let eigen = faer_eigh(&matrix, Side::Upper).unwrap();
        let expected = [2.0 - 2f64.sqrt(), 2.0, 2.0 + 2f64.sqrt()];
        for (value, want) in eigen.values.iter().zip(expected) {
            assert_abs_diff_eq!(*value, want, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_faer_eigh_reads_upper_triangle_only() {
        let matrix = array![[1.0, 2.0], [99.0, 1.0]];
        let eigen = faer_eigh(&matrix, Side::Upper).unwrap();
        assert_abs_diff_eq!(eigen.values[0], -1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(eigen.values[1], 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_faer_eigh_vectors_satisfy_definition() {
        let matrix = array![[4.0, 1.0, 0.5], [1.0, 3.0, 0.2], [0.5, 0.2, 1.0]];
        let eigen = faer_eigh(&matrix, Side::Lower).unwrap();
        for k in 0..3 {
            let v = eigen.vectors.column(k);
            let av = matrix.dot(&v);
            for i in 0..3 {
                assert_abs_diff_eq!(av[i], eigen.values[k] * v[i], epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn test_rectangular_input_is_rejected() {
        let failure = faer_eigh(&Array2::zeros((2, 3)), Side::Upper).unwrap_err();
        assert_eq!(failure.code, -1);
    }
}
