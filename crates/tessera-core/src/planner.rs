//! Choosing how many workers should diagonalise a matrix.
//!
//! Dense eigensolvers stop scaling well below the size of large process
//! groups, so small matrices are moved onto fewer workers first. The
//! heuristic count is `ceil(n / (a * x)) * a`. Backends that cannot tolerate
//! a process column without data additionally cap the count at the largest
//! value whose square grid has no empty column.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DiagError;
use crate::grid::square_grid;
use crate::layout::{cyclic, DistributionDescriptor};

/// Constants of the worker-count heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannerPolicy {
    /// Granularity of the worker count.
    #[serde(default = "default_granularity")]
    pub a: usize,
    /// Matrix rows per worker that keep the solver efficient.
    #[serde(default = "default_rows_per_worker")]
    pub x: usize,
    /// Use the heuristic count even when the empty-column search allows more.
    #[serde(default)]
    pub force_heuristic: bool,
}

fn default_granularity() -> usize {
    4
}

fn default_rows_per_worker() -> usize {
    60
}

impl Default for PlannerPolicy {
    fn default() -> Self {
        Self {
            a: default_granularity(),
            x: default_rows_per_worker(),
            force_heuristic: false,
        }
    }
}

/// The facts about a distributed matrix that planning depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanInput {
    pub matrix_order: usize,
    pub worker_count: usize,
    pub block_rows: usize,
    pub block_cols: usize,
    /// Process columns of the current grid holding no matrix column.
    pub empty_columns: usize,
}

impl PlanInput {
    pub fn from_descriptor(desc: &DistributionDescriptor) -> Self {
        Self {
            matrix_order: desc.global_rows(),
            worker_count: desc.grid().size(),
            block_rows: desc.block_rows(),
            block_cols: desc.block_cols(),
            empty_columns: desc.col_counts().iter().filter(|&&c| c == 0).count(),
        }
    }
}

/// Outcome of [`plan`]. Computed identically on every rank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RedistributionPlan {
    pub matrix_order: usize,
    pub worker_count_before: usize,
    /// Workers that take part in the solve. On the unconstrained path this
    /// is `heuristic_optimal_count` capped at `worker_count_before`, since a
    /// split can only activate ranks that already exist.
    pub worker_count_after: usize,
    pub heuristic_optimal_count: usize,
    /// Only computed for backends that forbid empty process columns.
    pub max_count_without_empty_column: Option<usize>,
    pub block_before: (usize, usize),
    pub block_after: (usize, usize),
    pub should_redistribute: bool,
}

impl fmt::Display for RedistributionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "order {}: {} -> {} workers (heuristic {}",
            self.matrix_order, self.worker_count_before, self.worker_count_after, self.heuristic_optimal_count
        )?;
        if let Some(max) = self.max_count_without_empty_column {
            write!(f, ", at most {max} without empty columns")?;
        }
        write!(
            f,
            "), blocks {}x{} -> {}x{}, {}",
            self.block_before.0,
            self.block_before.1,
            self.block_after.0,
            self.block_after.1,
            if self.should_redistribute {
                "redistributing"
            } else {
                "in place"
            }
        )
    }
}

/// `ceil(order / (a * x)) * a`.
pub fn heuristic_optimal_count(order: usize, policy: &PlannerPolicy) -> usize {
    order.div_ceil(policy.a * policy.x) * policy.a
}

/// Largest power of two not above `n` (`n >= 1`).
pub fn power_of_two_floor(n: usize) -> usize {
    1 << (usize::BITS - 1 - n.max(1).leading_zeros())
}

/// Largest worker count, searching down from `worker_count`, whose square
/// grid leaves no process column empty for an `order`-column matrix in
/// blocks of `block`.
///
/// Counts above 2 are kept even. `current_empty` is the number of empty
/// columns of the grid the matrix lives on now; when it is zero and the
/// count is already even nothing needs to change.
pub fn max_count_without_empty_column(
    order: usize,
    block: usize,
    worker_count: usize,
    current_empty: usize,
) -> usize {
    if current_empty == 0 && worker_count % 2 == 0 {
        return worker_count;
    }
    let mut candidate = worker_count;
    loop {
        let (_, cols) = square_grid(candidate);
        let empty = cyclic::empty_processes(order, block, cols);
        if empty == 0 && (candidate % 2 == 0 || candidate <= 2) {
            break;
        }
        candidate = candidate.saturating_sub(empty);
        if candidate > 2 && candidate % 2 == 1 {
            candidate -= 1;
        }
        if candidate <= 1 {
            candidate = 1;
            break;
        }
    }
    candidate
}

/// Decide the worker count and block size for diagonalising the matrix
/// described by `input`.
///
/// `requires_no_empty_column` selects the constrained path used by panel
/// backends, which also normalises the block to a power of two.
pub fn plan(
    input: &PlanInput,
    policy: &PlannerPolicy,
    requires_no_empty_column: bool,
) -> Result<RedistributionPlan, DiagError> {
    if input.matrix_order < 1 {
        return Err(DiagError::InvalidMatrixOrder);
    }
    if input.worker_count < 1 {
        return Err(DiagError::InvalidTopology("no workers to plan for".into()));
    }
    if policy.a < 1 || policy.x < 1 {
        return Err(DiagError::InvalidTopology(format!(
            "planner constants must be positive, got a={} x={}",
            policy.a, policy.x
        )));
    }

    let order = input.matrix_order;
    let before = input.worker_count;
    let heuristic = heuristic_optimal_count(order, policy);
    let block_before = (input.block_rows, input.block_cols);

    let (after, max_nz, block_after) = if requires_no_empty_column {
        let block = power_of_two_floor(input.block_rows.min(input.block_cols));
        let max_nz = max_count_without_empty_column(order, block, before, input.empty_columns);
        let after = if policy.force_heuristic {
            if heuristic <= max_nz {
                heuristic
            } else {
                before
            }
        } else if max_nz < before {
            max_nz
        } else {
            before
        };
        (after, Some(max_nz), (block, block))
    } else {
        (heuristic.min(before), None, block_before)
    };

    if requires_no_empty_column && after == before && input.empty_columns > 0 {
        log::warn!(
            "keeping {before} workers for order {order} although {} process columns are empty",
            input.empty_columns
        );
    }

    let plan = RedistributionPlan {
        matrix_order: order,
        worker_count_before: before,
        worker_count_after: after,
        heuristic_optimal_count: heuristic,
        max_count_without_empty_column: max_nz,
        block_before,
        block_after,
        should_redistribute: after < before || block_after != block_before,
    };
    log::debug!("{plan}");
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(order: usize, workers: usize, block: usize, empty_columns: usize) -> PlanInput {
        PlanInput {
            matrix_order: order,
            worker_count: workers,
            block_rows: block,
            block_cols: block,
            empty_columns,
        }
    }

    #[test]
    fn test_heuristic_count() {
        let policy = PlannerPolicy::default();
        assert_eq!(heuristic_optimal_count(128, &policy), 4);
        assert_eq!(heuristic_optimal_count(240, &policy), 4);
        assert_eq!(heuristic_optimal_count(241, &policy), 8);
        let narrow = PlannerPolicy { x: 15, ..policy };
        assert_eq!(heuristic_optimal_count(128, &narrow), 12);
    }

    #[test]
    fn test_small_matrix_moves_to_fewer_workers() {
        let plan = plan(&input(128, 8, 32, 0), &PlannerPolicy::default(), false).unwrap();
        assert_eq!(plan.heuristic_optimal_count, 4);
        assert_eq!(plan.worker_count_after, 4);
        assert!(plan.should_redistribute);
        assert_eq!(plan.max_count_without_empty_column, None);
    }

    #[test]
    fn test_large_matrix_keeps_workers() {
        let plan = plan(&input(128, 8, 32, 0), &PlannerPolicy { x: 15, ..Default::default() }, false).unwrap();
        assert_eq!(plan.heuristic_optimal_count, 12);
        assert_eq!(plan.worker_count_after, 8);
        assert!(!plan.should_redistribute);
    }

    #[test]
    fn test_constrained_search_removes_empty_columns() {
        // 64 columns in one block of 64 on a 4x4 grid: three empty columns.
        let max_nz = max_count_without_empty_column(64, 64, 16, 3);
        assert!(max_nz < 16);
        assert!(max_nz % 2 == 0 || max_nz == 1);
        let (_, cols) = square_grid(max_nz);
        assert_eq!(cyclic::empty_processes(64, 64, cols), 0);

        let plan = plan(&input(64, 16, 64, 3), &PlannerPolicy::default(), true).unwrap();
        assert_eq!(plan.max_count_without_empty_column, Some(max_nz));
        assert_eq!(plan.worker_count_after, max_nz);
        assert!(plan.should_redistribute);
    }

    #[test]
    fn test_constrained_search_keeps_full_even_grid() {
        assert_eq!(max_count_without_empty_column(1000, 32, 8, 0), 8);
    }

    #[test]
    fn test_constrained_search_trims_odd_count() {
        // 7 workers form a 1x7 grid; 100 columns in blocks of 16 fill all 7
        // columns, but the count is odd.
        assert_eq!(max_count_without_empty_column(100, 16, 7, 0), 6);
    }

    #[test]
    fn test_forced_heuristic_falls_back_to_current_count() {
        let policy = PlannerPolicy {
            x: 1,
            force_heuristic: true,
            ..Default::default()
        };
        // Heuristic 64 exceeds any count the search allows.
        let plan = plan(&input(64, 16, 64, 3), &policy, true).unwrap();
        assert_eq!(plan.heuristic_optimal_count, 64);
        assert_eq!(plan.worker_count_after, 16);
    }

    #[test]
    fn test_forced_heuristic_within_bound() {
        let policy = PlannerPolicy {
            force_heuristic: true,
            ..Default::default()
        };
        let plan = plan(&input(100, 8, 16, 0), &policy, true).unwrap();
        assert_eq!(plan.worker_count_after, 4);
    }

    #[test]
    fn test_panel_block_is_normalised() {
        let plan = plan(&input(4000, 4, 48, 0), &PlannerPolicy::default(), true).unwrap();
        assert_eq!(plan.block_after, (32, 32));
        assert_eq!(plan.worker_count_after, 4);
        assert!(plan.should_redistribute);
    }

    #[test]
    fn test_power_of_two_floor() {
        assert_eq!(power_of_two_floor(1), 1);
        assert_eq!(power_of_two_floor(48), 32);
        assert_eq!(power_of_two_floor(64), 64);
        assert_eq!(power_of_two_floor(127), 64);
    }

    #[test]
    fn test_zero_order_is_rejected() {
        let err = plan(&input(0, 4, 32, 0), &PlannerPolicy::default(), false).unwrap_err();
        assert!(matches!(err, DiagError::InvalidMatrixOrder));
    }

    #[test]
    fn test_plan_is_deterministic() {
        let a = plan(&input(500, 12, 32, 1), &PlannerPolicy::default(), true).unwrap();
        let b = plan(&input(500, 12, 32, 1), &PlannerPolicy::default(), true).unwrap();
        assert_eq!(a, b);
    }
}
