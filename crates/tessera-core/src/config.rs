//! Dispatcher configuration.
//!
//! Every field has a serde default, so an empty TOML table is a valid
//! configuration:
//!
//! ```toml
//! backend = "panel"
//! block_size = 32
//! grid_shape = "square"
//!
//! [planner]
//! a = 4
//! x = 60
//!
//! [acceleration]
//! enabled = true
//! ```

use serde::{Deserialize, Serialize};

use crate::grid::GridShape;
use crate::layout::{DescriptorOptions, DEFAULT_BLOCK_SIZE};
use crate::planner::PlannerPolicy;
use crate::solver::{BackendKind, EigenCheck};

/// When the accelerated kernel of a backend may be used.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccelerationPolicy {
    #[serde(default)]
    pub enabled: bool,
    /// Skip the size preconditions (order and block at least `min_order`).
    /// Odd orders are never accelerated.
    #[serde(default)]
    pub unsafe_override: bool,
    /// With `unsafe_override`, also run the reference kernel and compare.
    #[serde(default)]
    pub verify: bool,
    #[serde(default = "default_min_order")]
    pub min_order: usize,
    /// Largest eigenvalue difference accepted by verification.
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
}

fn default_min_order() -> usize {
    64
}

fn default_tolerance() -> f64 {
    1e-14
}

impl Default for AccelerationPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            unsafe_override: false,
            verify: false,
            min_order: default_min_order(),
            tolerance: default_tolerance(),
        }
    }
}

/// Top-level configuration of an
/// [`EigensolverDispatcher`](crate::diag::EigensolverDispatcher).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagConfig {
    #[serde(default)]
    pub backend: BackendKind,
    /// Block size for input descriptors built through
    /// [`DiagConfig::descriptor_options`] without an explicit block.
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    /// Shape of the grid built for a reduced worker set.
    #[serde(default)]
    pub grid_shape: GridShape,
    #[serde(default)]
    pub planner: PlannerPolicy,
    #[serde(default)]
    pub acceleration: AccelerationPolicy,
    /// Requests for fewer eigenvectors than this go to the general backend
    /// instead of the panel backend.
    #[serde(default = "default_panel_min_eigenvectors")]
    pub panel_min_eigenvectors: usize,
    #[serde(default)]
    pub check: EigenCheck,
    #[serde(default = "default_check_tolerance")]
    pub check_tolerance: f64,
}

fn default_block_size() -> usize {
    DEFAULT_BLOCK_SIZE
}

fn default_panel_min_eigenvectors() -> usize {
    16
}

fn default_check_tolerance() -> f64 {
    1e-8
}

impl Default for DiagConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            block_size: default_block_size(),
            grid_shape: GridShape::default(),
            planner: PlannerPolicy::default(),
            acceleration: AccelerationPolicy::default(),
            panel_min_eigenvectors: default_panel_min_eigenvectors(),
            check: EigenCheck::default(),
            check_tolerance: default_check_tolerance(),
        }
    }
}

impl DiagConfig {
    /// Options for a `rows x cols` input matrix whose blocks default to
    /// `block_size`.
    pub fn descriptor_options(&self, rows: usize, cols: usize) -> DescriptorOptions<'static> {
        DescriptorOptions::new(rows, cols).default_block_size(self.block_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::ProcessGrid;
    use crate::layout::DistributionDescriptor;
    use tessera_compute::LocalCluster;

    #[test]
    fn test_empty_table_gives_defaults() {
        let config: DiagConfig = toml::from_str("").unwrap();
        assert_eq!(config, DiagConfig::default());
        assert_eq!(config.block_size, 32);
        assert_eq!(config.planner.x, 60);
        assert_eq!(config.acceleration.min_order, 64);
    }

    #[test]
    fn test_partial_tables() {
        let config: DiagConfig = toml::from_str(
            r#"
            backend = "panel"
            check = "full"

            [planner]
            x = 15

            [acceleration]
            enabled = true
            unsafe_override = true
            "#,
        )
        .unwrap();
        assert_eq!(config.backend, BackendKind::Panel);
        assert_eq!(config.check, EigenCheck::Full);
        assert_eq!(config.planner.a, 4);
        assert_eq!(config.planner.x, 15);
        assert!(config.acceleration.unsafe_override);
        assert!(!config.acceleration.verify);
    }

    #[test]
    fn test_explicit_grid_shape() {
        let config: DiagConfig = toml::from_str(
            r#"
            [grid_shape.explicit]
            rows = 2
            cols = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.grid_shape, GridShape::Explicit { rows: 2, cols: 3 });
    }

    #[test]
    fn test_block_size_reaches_descriptor() {
        let config = DiagConfig {
            block_size: 8,
            ..Default::default()
        };
        let blocks = LocalCluster::new(2).run(|comm| {
            let grid = ProcessGrid::create(&comm, GridShape::Row).unwrap();
            let implicit = DistributionDescriptor::create(&grid, config.descriptor_options(64, 64)).unwrap();
            let explicit =
                DistributionDescriptor::create(&grid, config.descriptor_options(64, 64).block(4, 4)).unwrap();
            (implicit.block_rows(), implicit.block_cols(), explicit.block_cols())
        });
        assert!(blocks.iter().all(|&b| b == (8, 8, 4)));
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        assert!(toml::from_str::<DiagConfig>("backend = \"scalapack\"").is_err());
    }
}
