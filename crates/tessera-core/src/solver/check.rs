//! Optional a-posteriori checks of computed eigenpairs.

use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::DenseEigen;
use crate::error::DiagError;
use crate::types::Storage;

/// Which eigenpair checks run after a solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EigenCheck {
    #[default]
    Off,
    /// `max |V^T V - I|` over the returned eigenvectors.
    Orthonormality,
    /// Orthonormality plus `max |A v - λ v|`, scaled by `max(1, max |A|)`.
    Full,
}

fn entry(matrix: &Array2<f64>, storage: Storage, i: usize, j: usize) -> f64 {
    match storage {
        Storage::Upper if i > j => matrix[[j, i]],
        _ => matrix[[i, j]],
    }
}

/// Largest deviation of the first `neig` columns of `vectors` from an
/// orthonormal set.
pub fn orthonormality_deviation(vectors: &Array2<f64>, neig: usize) -> f64 {
    (0..neig)
        .into_par_iter()
        .map(|a| {
            let va = vectors.column(a);
            (0..neig)
                .map(|b| {
                    let dot = va.dot(&vectors.column(b));
                    let target = if a == b { 1.0 } else { 0.0 };
                    (dot - target).abs()
                })
                .fold(0.0, f64::max)
        })
        .reduce(|| 0.0, f64::max)
}

/// Largest entry of `A v - λ v` over the first `neig` eigenpairs.
pub fn residual_deviation(matrix: &Array2<f64>, storage: Storage, eigen: &DenseEigen, neig: usize) -> f64 {
    let n = matrix.nrows();
    (0..neig)
        .into_par_iter()
        .map(|k| {
            let v = eigen.vectors.column(k);
            let lambda = eigen.values[k];
            (0..n)
                .map(|i| {
                    let av: f64 = (0..n).map(|j| entry(matrix, storage, i, j) * v[j]).sum();
                    (av - lambda * v[i]).abs()
                })
                .fold(0.0, f64::max)
        })
        .reduce(|| 0.0, f64::max)
}

/// Run the checks selected by `mode`.
pub fn verify(
    matrix: &Array2<f64>,
    storage: Storage,
    eigen: &DenseEigen,
    neig: usize,
    mode: EigenCheck,
    tolerance: f64,
) -> Result<(), DiagError> {
    if mode == EigenCheck::Off {
        return Ok(());
    }
    let order = matrix.nrows();
    let neig = neig.min(eigen.values.len());

    let orthonormality = orthonormality_deviation(&eigen.vectors, neig);
    log::debug!("eigenvector orthonormality deviation {orthonormality:.3e}");
    if orthonormality.is_nan() || orthonormality > tolerance {
        return Err(DiagError::EigenCheckFailure {
            order,
            quantity: "orthonormality".into(),
            deviation: orthonormality,
            tolerance,
        });
    }

    if mode == EigenCheck::Full {
        let scale = (0..order)
            .flat_map(|i| (0..order).map(move |j| (i, j)))
            .fold(1.0_f64, |acc, (i, j)| acc.max(entry(matrix, storage, i, j).abs()));
        let residual = residual_deviation(matrix, storage, eigen, neig) / scale;
        log::debug!("eigenpair residual {residual:.3e}");
        if residual.is_nan() || residual > tolerance {
            return Err(DiagError::EigenCheckFailure {
                order,
                quantity: "residual".into(),
                deviation: residual,
                tolerance,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn diagonal_eigen() -> (Array2<f64>, DenseEigen) {
        let matrix = array![[1.0, 0.0], [0.0, 3.0]];
        let eigen = DenseEigen {
            values: vec![1.0, 3.0],
            vectors: Array2::eye(2),
        };
        (matrix, eigen)
    }

    #[test]
    fn test_exact_pairs_pass() {
        let (matrix, eigen) = diagonal_eigen();
        verify(&matrix, Storage::Full, &eigen, 2, EigenCheck::Full, 1e-12).unwrap();
    }

    #[test]
    fn test_wrong_value_fails_residual() {
        let (matrix, mut eigen) = diagonal_eigen();
        eigen.values[1] = 2.5;
        let err = verify(&matrix, Storage::Full, &eigen, 2, EigenCheck::Full, 1e-8).unwrap_err();
        assert!(matches!(err, DiagError::EigenCheckFailure { ref quantity, .. } if quantity == "residual"));
        // Orthonormality alone does not look at eigenvalues.
        verify(&matrix, Storage::Full, &eigen, 2, EigenCheck::Orthonormality, 1e-8).unwrap();
    }

    #[test]
    fn test_non_normalised_vector_fails() {
        let (matrix, mut eigen) = diagonal_eigen();
        eigen.vectors[[0, 0]] = 2.0;
        let err = verify(&matrix, Storage::Full, &eigen, 2, EigenCheck::Orthonormality, 1e-8).unwrap_err();
        assert!(matches!(err, DiagError::EigenCheckFailure { ref quantity, .. } if quantity == "orthonormality"));
    }

    #[test]
    fn test_upper_storage_ignores_lower_triangle() {
        let matrix = array![[2.0, 1.0], [f64::NAN, 2.0]];
        let s = std::f64::consts::FRAC_1_SQRT_2;
        let eigen = DenseEigen {
            values: vec![1.0, 3.0],
            vectors: array![[s, s], [-s, s]],
        };
        assert_abs_diff_eq!(residual_deviation(&matrix, Storage::Upper, &eigen, 2), 0.0, epsilon = 1e-12);
    }
}
