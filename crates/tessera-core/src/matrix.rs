//! Local storage of a block-cyclically distributed matrix.

use ndarray::{Array2, ShapeBuilder};

use crate::error::DiagError;
use crate::layout::{cyclic, DistributionDescriptor};

/// The calling rank's piece of a distributed matrix.
///
/// `local` is column-major with shape `(local_rows, local_cols)` of the
/// descriptor; local column-major order visits owned elements in global
/// column-major order.
#[derive(Debug, Clone)]
pub struct DistributedMatrix {
    descriptor: DistributionDescriptor,
    local: Array2<f64>,
}

impl DistributedMatrix {
    pub fn zeros(descriptor: &DistributionDescriptor) -> Self {
        Self {
            local: Array2::zeros((descriptor.local_rows(), descriptor.local_cols()).f()),
            descriptor: descriptor.clone(),
        }
    }

    /// Fill each owned element `(i, j)` with `f(i, j)`.
    pub fn from_global_fn(descriptor: &DistributionDescriptor, f: impl Fn(usize, usize) -> f64) -> Self {
        let rows = descriptor.row_indices();
        let cols = descriptor.col_indices();
        let local = Array2::from_shape_fn((rows.len(), cols.len()).f(), |(li, lj)| f(rows[li], cols[lj]));
        Self {
            descriptor: descriptor.clone(),
            local,
        }
    }

    /// Take the owned elements of a replicated global matrix.
    pub fn scatter_from(descriptor: &DistributionDescriptor, global: &Array2<f64>) -> Result<Self, DiagError> {
        let (rows, cols) = global.dim();
        if rows != descriptor.global_rows() || cols != descriptor.global_cols() {
            return Err(DiagError::ExtentMismatch {
                src_rows: rows,
                src_cols: cols,
                dst_rows: descriptor.global_rows(),
                dst_cols: descriptor.global_cols(),
            });
        }
        Ok(Self::from_global_fn(descriptor, |i, j| global[[i, j]]))
    }

    pub fn descriptor(&self) -> &DistributionDescriptor {
        &self.descriptor
    }

    pub fn local(&self) -> &Array2<f64> {
        &self.local
    }

    pub fn local_mut(&mut self) -> &mut Array2<f64> {
        &mut self.local
    }

    pub fn get_global(&self, i: usize, j: usize) -> Option<f64> {
        self.descriptor
            .local_index(i, j)
            .map(|(li, lj)| self.local[[li, lj]])
    }

    /// Set an owned element. Returns `false` if the caller does not own it.
    pub fn set_global(&mut self, i: usize, j: usize, value: f64) -> bool {
        match self.descriptor.local_index(i, j) {
            Some((li, lj)) => {
                self.local[[li, lj]] = value;
                true
            }
            None => false,
        }
    }

    /// Owned elements as `(i, j, value)` in global column-major order.
    pub fn local_entries(&self) -> impl Iterator<Item = (usize, usize, f64)> + '_ {
        let rows = self.descriptor.row_indices();
        let cols = self.descriptor.col_indices();
        cols.into_iter().enumerate().flat_map(move |(lj, j)| {
            let rows = rows.clone();
            rows.into_iter()
                .enumerate()
                .map(move |(li, i)| (i, j, self.local[[li, lj]]))
        })
    }

    /// Assemble the global matrix on every rank of the descriptor's grid.
    /// Collective over the grid.
    pub fn gather(&self) -> Result<Array2<f64>, DiagError> {
        let desc = &self.descriptor;
        let grid = desc.grid();
        let packed: Vec<f64> = self.local_entries().map(|(_, _, v)| v).collect();
        let incoming = grid.comm().all_to_all_f64(vec![packed; grid.size()])?;

        let mut global = Array2::zeros((desc.global_rows(), desc.global_cols()).f());
        for (rank, buffer) in incoming.iter().enumerate() {
            let (prow, pcol) = (rank / grid.cols(), rank % grid.cols());
            let local_rows = desc.row_counts()[prow];
            let local_cols = desc.col_counts()[pcol];
            if buffer.len() != local_rows * local_cols {
                return Err(DiagError::LayoutMismatch {
                    context: format!("gather from rank {rank}"),
                    expected: local_rows * local_cols,
                    found: buffer.len(),
                });
            }
            for lj in 0..local_cols {
                let j = cyclic::local_to_global(lj, desc.block_cols(), pcol, desc.first_process_col(), grid.cols());
                for li in 0..local_rows {
                    let i =
                        cyclic::local_to_global(li, desc.block_rows(), prow, desc.first_process_row(), grid.rows());
                    global[[i, j]] = buffer[lj * local_rows + li];
                }
            }
        }
        Ok(global)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{GridShape, ProcessGrid};
    use crate::layout::DescriptorOptions;
    use tessera_compute::LocalCluster;

    fn value(i: usize, j: usize) -> f64 {
        (i * 100 + j) as f64
    }

    #[test]
    fn test_local_storage_is_column_major() {
        LocalCluster::new(1).run(|comm| {
            let grid = ProcessGrid::create(&comm, GridShape::Square).unwrap();
            let desc = DistributionDescriptor::create(&grid, DescriptorOptions::new(3, 2)).unwrap();
            let m = DistributedMatrix::from_global_fn(&desc, value);
            assert_eq!(m.local().as_slice_memory_order().unwrap(), &[0.0, 100.0, 200.0, 1.0, 101.0, 201.0]);
        });
    }

    #[test]
    fn test_entries_follow_global_column_major_order() {
        let ok = LocalCluster::new(4).run(|comm| {
            let grid = ProcessGrid::create(&comm, GridShape::Square).unwrap();
            let desc = DistributionDescriptor::create(&grid, DescriptorOptions::new(11, 11).block(2, 2)).unwrap();
            let m = DistributedMatrix::from_global_fn(&desc, value);
            let keys: Vec<(usize, usize)> = m.local_entries().map(|(i, j, _)| (j, i)).collect();
            let sorted = keys.windows(2).all(|w| w[0] < w[1]);
            let values = m.local_entries().all(|(i, j, v)| v == value(i, j));
            sorted && values
        });
        assert!(ok.iter().all(|&b| b));
    }

    #[test]
    fn test_gather_reassembles_global_matrix() {
        let gathered = LocalCluster::new(6).run(|comm| {
            let grid = ProcessGrid::create(&comm, GridShape::Square).unwrap();
            let desc = DistributionDescriptor::create(&grid, DescriptorOptions::new(9, 7).block(2, 3)).unwrap();
            DistributedMatrix::from_global_fn(&desc, value).gather().unwrap()
        });
        for global in &gathered {
            assert_eq!(global.dim(), (9, 7));
            for ((i, j), &v) in global.indexed_iter() {
                assert_eq!(v, value(i, j));
            }
        }
    }

    #[test]
    fn test_set_and_get_only_owned_elements() {
        let owned = LocalCluster::new(2).run(|comm| {
            let grid = ProcessGrid::create(&comm, GridShape::Row).unwrap();
            let desc = DistributionDescriptor::create(&grid, DescriptorOptions::new(4, 4).block(2, 2)).unwrap();
            let mut m = DistributedMatrix::zeros(&desc);
            let set = m.set_global(1, 3, 5.0);
            (set, m.get_global(1, 3))
        });
        assert_eq!(owned[0], (false, None));
        assert_eq!(owned[1], (true, Some(5.0)));
    }

    #[test]
    fn test_scatter_rejects_wrong_shape() {
        LocalCluster::new(1).run(|comm| {
            let grid = ProcessGrid::create(&comm, GridShape::Square).unwrap();
            let desc = DistributionDescriptor::create(&grid, DescriptorOptions::new(3, 3)).unwrap();
            let err = DistributedMatrix::scatter_from(&desc, &Array2::zeros((2, 3))).unwrap_err();
            assert!(matches!(err, DiagError::ExtentMismatch { .. }));
        });
    }
}
