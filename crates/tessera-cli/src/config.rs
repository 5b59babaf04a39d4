//! TOML configuration deserialisation for eigensolver jobs.

use serde::Deserialize;
use tessera_core::{DiagConfig, GridShape, Storage};

/// Top-level job configuration.
#[derive(Debug, Deserialize)]
pub struct JobConfig {
    pub matrix: MatrixConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub diag: DiagConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// Test matrix to diagonalise.
#[derive(Debug, Deserialize)]
pub struct MatrixConfig {
    pub order: usize,
    #[serde(default)]
    pub kind: MatrixKind,
    #[serde(default)]
    pub storage: Storage,
    /// Number of lowest eigenpairs; all when absent.
    #[serde(default)]
    pub neig: Option<usize>,
}

/// Built-in symmetric test matrices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatrixKind {
    /// Tridiagonal `(-1, 2, -1)`.
    #[default]
    Laplacian,
    /// Hilbert matrix plus `order` on the diagonal.
    HilbertShift,
}

impl MatrixKind {
    pub fn entry(self, order: usize, i: usize, j: usize) -> f64 {
        match self {
            MatrixKind::Laplacian => {
                if i == j {
                    2.0
                } else if i.abs_diff(j) == 1 {
                    -1.0
                } else {
                    0.0
                }
            }
            MatrixKind::HilbertShift => {
                let hilbert = 1.0 / (i + j + 1) as f64;
                if i == j {
                    hilbert + order as f64
                } else {
                    hilbert
                }
            }
        }
    }

    /// Closed-form ascending spectrum, where one is known.
    pub fn exact_spectrum(self, order: usize) -> Option<Vec<f64>> {
        match self {
            MatrixKind::Laplacian => Some(
                (1..=order)
                    .map(|k| 2.0 - 2.0 * (k as f64 * std::f64::consts::PI / (order as f64 + 1.0)).cos())
                    .collect(),
            ),
            MatrixKind::HilbertShift => None,
        }
    }
}

/// Simulated cluster the job runs on.
#[derive(Debug, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Grid the input matrix is laid out on.
    #[serde(default)]
    pub grid_shape: GridShape,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            grid_shape: GridShape::default(),
        }
    }
}

fn default_workers() -> usize {
    4
}

/// Output configuration.
#[derive(Debug, Deserialize)]
pub struct OutputConfig {
    /// Output directory (default: "./output").
    #[serde(default = "default_output_dir")]
    pub directory: String,
    /// Whether to save eigenvalues as CSV (default: true).
    #[serde(default = "default_true")]
    pub save_csv: bool,
    /// Whether to save eigenvalues and diagnostics as JSON (default: true).
    #[serde(default = "default_true")]
    pub save_json: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: default_output_dir(),
            save_csv: true,
            save_json: true,
        }
    }
}

fn default_output_dir() -> String {
    "./output".into()
}
fn default_true() -> bool {
    true
}

/// Load and parse a TOML job configuration file.
pub fn load_config(path: &std::path::Path) -> anyhow::Result<JobConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: JobConfig = toml::from_str(&content)?;
    validate(&config)?;
    Ok(config)
}

fn validate(job: &JobConfig) -> anyhow::Result<()> {
    anyhow::ensure!(job.matrix.order >= 1, "matrix.order must be at least 1");
    anyhow::ensure!(job.cluster.workers >= 1, "cluster.workers must be at least 1");
    if let Some(neig) = job.matrix.neig {
        anyhow::ensure!(
            (1..=job.matrix.order).contains(&neig),
            "matrix.neig must lie in 1..={}",
            job.matrix.order
        );
    }
    anyhow::ensure!(job.diag.block_size >= 1, "diag.block_size must be at least 1");
    job.cluster
        .grid_shape
        .dimensions(job.cluster.workers)
        .map_err(|e| anyhow::anyhow!("cluster.grid_shape: {e}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use tessera_core::BackendKind;

    #[test]
    fn test_minimal_job() {
        let job: JobConfig = toml::from_str("[matrix]\norder = 10\n").unwrap();
        assert_eq!(job.matrix.kind, MatrixKind::Laplacian);
        assert_eq!(job.cluster.workers, 4);
        assert_eq!(job.diag.backend, BackendKind::General);
        assert!(validate(&job).is_ok());
    }

    #[test]
    fn test_full_job() {
        let job: JobConfig = toml::from_str(
            r#"
            [matrix]
            order = 64
            kind = "hilbert-shift"
            storage = "upper"
            neig = 8

            [cluster]
            workers = 6

            [diag]
            backend = "panel"
            panel_min_eigenvectors = 4

            [output]
            directory = "out"
            save_csv = false
            "#,
        )
        .unwrap();
        assert_eq!(job.matrix.kind, MatrixKind::HilbertShift);
        assert_eq!(job.matrix.storage, Storage::Upper);
        assert_eq!(job.diag.panel_min_eigenvectors, 4);
        assert!(!job.output.save_csv);
        assert!(job.output.save_json);
    }

    #[test]
    fn test_bundled_job_is_valid() {
        let job: JobConfig = toml::from_str(include_str!("../jobs/laplacian.toml")).unwrap();
        assert!(validate(&job).is_ok());
        assert_eq!(job.diag.backend, BackendKind::Panel);
        assert_eq!(job.diag.planner.a, 2);
    }

    #[test]
    fn test_invalid_neig_is_rejected() {
        let job: JobConfig = toml::from_str("[matrix]\norder = 4\nneig = 5\n").unwrap();
        assert!(validate(&job).is_err());
    }

    #[test]
    fn test_explicit_grid_must_fit_workers() {
        let job: JobConfig = toml::from_str(
            "[matrix]\norder = 4\n[cluster]\nworkers = 6\n[cluster.grid_shape.explicit]\nrows = 2\ncols = 2\n",
        )
        .unwrap();
        assert!(validate(&job).is_err());
    }

    #[test]
    fn test_laplacian_spectrum_is_symmetric_about_two() {
        let spectrum = MatrixKind::Laplacian.exact_spectrum(7).unwrap();
        for k in 0..7 {
            assert_abs_diff_eq!(spectrum[k] + spectrum[6 - k], 4.0, epsilon = 1e-12);
        }
        assert_eq!(MatrixKind::HilbertShift.exact_spectrum(3), None);
    }
}
