//! Two-dimensional process grids.
//!
//! A [`ProcessGrid`] arranges the ranks of a communicator as `rows x cols`,
//! row-major: rank `r` sits at `(r / cols, r % cols)`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tessera_compute::Communicator;

use crate::error::DiagError;
use crate::fingerprint;

/// Policy for choosing the grid shape of a given number of ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GridShape {
    /// As square as possible, see [`square_grid`].
    #[default]
    Square,
    /// One process row.
    Row,
    /// One process column.
    Column,
    /// A fixed shape; `rows * cols` must equal the number of ranks.
    Explicit { rows: usize, cols: usize },
}

impl GridShape {
    /// Resolve the shape for `size` ranks.
    pub fn dimensions(self, size: usize) -> Result<(usize, usize), DiagError> {
        if size < 1 {
            return Err(DiagError::InvalidTopology(
                "a process grid needs at least one rank".into(),
            ));
        }
        match self {
            GridShape::Square => Ok(square_grid(size)),
            GridShape::Row => Ok((1, size)),
            GridShape::Column => Ok((size, 1)),
            GridShape::Explicit { rows, cols } => {
                if rows * cols != size {
                    return Err(DiagError::InvalidTopology(format!(
                        "explicit grid {rows}x{cols} does not cover {size} ranks"
                    )));
                }
                Ok((rows, cols))
            }
        }
    }
}

fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Factor `size` as `rows x cols` with `rows <= cols`, as square as possible.
///
/// Among factorisations with the same `cols - rows`, the one with the larger
/// `gcd(rows, cols)` wins.
pub fn square_grid(size: usize) -> (usize, usize) {
    let size = size.max(1);
    let mut best = (1, size);
    let mut rows = 1;
    while rows * rows <= size {
        if size % rows == 0 {
            let cols = size / rows;
            let (best_rows, best_cols) = best;
            let spread = cols - rows;
            let best_spread = best_cols - best_rows;
            if spread < best_spread
                || (spread == best_spread && gcd(rows, cols) > gcd(best_rows, best_cols))
            {
                best = (rows, cols);
            }
        }
        rows += 1;
    }
    best
}

/// A `rows x cols` arrangement of the ranks of a communicator.
///
/// Shared between descriptors through `Arc`; the communicator is released
/// when the last descriptor referencing the grid is dropped.
#[derive(Debug)]
pub struct ProcessGrid {
    comm: Communicator,
    rows: usize,
    cols: usize,
    my_row: usize,
    my_col: usize,
}

impl ProcessGrid {
    /// Build a grid over every rank of `comm`. Collective over `comm`.
    pub fn create(comm: &Communicator, shape: GridShape) -> Result<Arc<Self>, DiagError> {
        let (rows, cols) = shape.dimensions(comm.size())?;
        comm.verify_consistent("ProcessGrid::create", fingerprint(&(rows, cols)))?;

        let rank = comm.rank();
        log::trace!("rank {rank}: process grid {rows}x{cols}");
        Ok(Arc::new(Self {
            comm: comm.clone(),
            rows,
            cols,
            my_row: rank / cols,
            my_col: rank % cols,
        }))
    }

    pub fn comm(&self) -> &Communicator {
        &self.comm
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn size(&self) -> usize {
        self.rows * self.cols
    }

    pub fn my_row(&self) -> usize {
        self.my_row
    }

    pub fn my_col(&self) -> usize {
        self.my_col
    }

    /// `(my_row, my_col)` of the calling rank.
    pub fn position(&self) -> (usize, usize) {
        (self.my_row, self.my_col)
    }

    /// Communicator rank at grid position `(prow, pcol)`.
    pub fn owner(&self, prow: usize, pcol: usize) -> usize {
        prow * self.cols + pcol
    }

    /// World rank at grid position `(prow, pcol)`.
    pub fn owner_world_rank(&self, prow: usize, pcol: usize) -> usize {
        self.comm.world_ranks()[self.owner(prow, pcol)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_compute::LocalCluster;

    #[test]
    fn test_square_grid_shapes() {
        assert_eq!(square_grid(1), (1, 1));
        assert_eq!(square_grid(2), (1, 2));
        assert_eq!(square_grid(6), (2, 3));
        assert_eq!(square_grid(7), (1, 7));
        assert_eq!(square_grid(12), (3, 4));
        assert_eq!(square_grid(16), (4, 4));
        assert_eq!(square_grid(18), (3, 6));
    }

    #[test]
    fn test_square_grid_covers_size() {
        for size in 1..=64 {
            let (rows, cols) = square_grid(size);
            assert_eq!(rows * cols, size);
            assert!(rows <= cols);
        }
    }

    #[test]
    fn test_explicit_shape_must_cover_ranks() {
        let err = GridShape::Explicit { rows: 2, cols: 2 }.dimensions(6).unwrap_err();
        assert!(matches!(err, DiagError::InvalidTopology(_)));
        assert_eq!(GridShape::Explicit { rows: 3, cols: 2 }.dimensions(6).unwrap(), (3, 2));
    }

    #[test]
    fn test_empty_group_is_invalid() {
        assert!(matches!(
            GridShape::Square.dimensions(0),
            Err(DiagError::InvalidTopology(_))
        ));
    }

    #[test]
    fn test_positions_are_row_major() {
        let positions = LocalCluster::new(6).run(|comm| {
            let grid = ProcessGrid::create(&comm, GridShape::Square).unwrap();
            (grid.rows(), grid.cols(), grid.position())
        });
        for (rank, &(rows, cols, (r, c))) in positions.iter().enumerate() {
            assert_eq!((rows, cols), (2, 3));
            assert_eq!((r, c), (rank / 3, rank % 3));
        }
    }

    #[test]
    fn test_grid_on_subgroup_reports_world_owners() {
        let owners = LocalCluster::new(4).run(|comm| {
            let sub = comm.split(Some((comm.rank() >= 2) as u32), comm.rank()).unwrap().unwrap();
            let grid = ProcessGrid::create(&sub, GridShape::Row).unwrap();
            (grid.owner_world_rank(0, 0), grid.owner_world_rank(0, 1))
        });
        assert_eq!(owners[0], (0, 1));
        assert_eq!(owners[3], (2, 3));
    }
}
