//! Moving matrices between block-cyclic layouts.
//!
//! [`redistribute`] copies a matrix from one layout to another, where the
//! two layouts may live on different (possibly disjoint) process grids. All
//! ranks of a common parent communicator take part; a rank holding neither
//! layout passes [`Participant::Dormant`] for both sides and still joins
//! every collective.
//!
//! Routing needs every rank to know both layouts, so the call starts by
//! exchanging a compact [`LayoutSummary`] of each side. Elements then travel
//! in a single all-to-all: each sender packs its owned elements in global
//! column-major order, which is also the order in which each receiver walks
//! its own elements, so no indices are transmitted.

use std::collections::HashMap;

use tessera_compute::{CommError, Communicator};

use crate::error::{agree, DiagError};
use crate::layout::{cyclic, DistributionDescriptor, Participant};
use crate::matrix::DistributedMatrix;

/// Rank-independent facts about a layout, shared with ranks that do not
/// hold it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LayoutSummary {
    rows: usize,
    cols: usize,
    block_rows: usize,
    block_cols: usize,
    first_row: usize,
    first_col: usize,
    grid_rows: usize,
    grid_cols: usize,
    /// World rank of each grid position, row-major.
    owners: Vec<usize>,
}

impl LayoutSummary {
    const HEADER: usize = 8;

    fn of(desc: &DistributionDescriptor) -> Self {
        let grid = desc.grid();
        Self {
            rows: desc.global_rows(),
            cols: desc.global_cols(),
            block_rows: desc.block_rows(),
            block_cols: desc.block_cols(),
            first_row: desc.first_process_row(),
            first_col: desc.first_process_col(),
            grid_rows: grid.rows(),
            grid_cols: grid.cols(),
            owners: grid.comm().world_ranks().to_vec(),
        }
    }

    fn encode(&self) -> Vec<u64> {
        let mut words = vec![
            self.rows,
            self.cols,
            self.block_rows,
            self.block_cols,
            self.first_row,
            self.first_col,
            self.grid_rows,
            self.grid_cols,
        ];
        words.extend_from_slice(&self.owners);
        words.into_iter().map(|w| w as u64).collect()
    }

    fn decode(words: &[u64]) -> Result<Self, CommError> {
        let words: Vec<usize> = words.iter().map(|&w| w as usize).collect();
        if words.len() < Self::HEADER || words.len() != Self::HEADER + words[6] * words[7] {
            return Err(CommError::Decode(format!(
                "layout summary of {} words is malformed",
                words.len()
            )));
        }
        Ok(Self {
            rows: words[0],
            cols: words[1],
            block_rows: words[2],
            block_cols: words[3],
            first_row: words[4],
            first_col: words[5],
            grid_rows: words[6],
            grid_cols: words[7],
            owners: words[Self::HEADER..].to_vec(),
        })
    }

    /// World rank owning global element `(i, j)`.
    fn owner(&self, i: usize, j: usize) -> usize {
        let prow = cyclic::owner_of(i, self.block_rows, self.first_row, self.grid_rows);
        let pcol = cyclic::owner_of(j, self.block_cols, self.first_col, self.grid_cols);
        self.owners[prow * self.grid_cols + pcol]
    }
}

/// Collective: every rank learns the layout held by some ranks.
fn share_layout(
    comm: &Communicator,
    held: Option<&DistributionDescriptor>,
    role: &str,
) -> Result<LayoutSummary, DiagError> {
    let words = held.map(|d| LayoutSummary::of(d).encode()).unwrap_or_default();
    let mut summary: Option<LayoutSummary> = None;
    for buffer in comm.all_gather_u64(&words)? {
        if buffer.is_empty() {
            continue;
        }
        let candidate = LayoutSummary::decode(&buffer)?;
        match &summary {
            None => summary = Some(candidate),
            Some(existing) if *existing != candidate => {
                return Err(CommError::Inconsistent {
                    operation: format!("redistribute ({role} layout differs between ranks)"),
                }
                .into());
            }
            Some(_) => {}
        }
    }
    summary.ok_or_else(|| DiagError::InvalidDescriptor(format!("no rank holds the {role} layout")))
}

/// Map from world rank to rank in `comm` for every owner of `layout`.
fn owner_ranks(comm: &Communicator, layout: &LayoutSummary) -> Result<HashMap<usize, usize>, DiagError> {
    layout
        .owners
        .iter()
        .map(|&world| {
            comm.rank_of_world(world)
                .map(|rank| (world, rank))
                .ok_or_else(|| {
                    DiagError::InvalidTopology(format!(
                        "world rank {world} owns part of a layout but is not in the redistributing group"
                    ))
                })
        })
        .collect()
}

/// Copy `source` into `dest`, collective over `comm`.
///
/// `comm` must contain every rank of both grids. Ranks outside the source
/// grid pass `Participant::Dormant` as `source`; ranks outside the
/// destination grid pass it as `dest`. Both layouts must describe a matrix of
/// the same extents.
pub fn redistribute(
    comm: &Communicator,
    source: Participant<&DistributedMatrix>,
    dest: Participant<&mut DistributedMatrix>,
) -> Result<(), DiagError> {
    let src_layout = share_layout(comm, source.active().map(|m| m.descriptor()), "source")?;
    let dst_layout = share_layout(comm, dest.active().map(|m| m.descriptor()), "destination")?;
    if (src_layout.rows, src_layout.cols) != (dst_layout.rows, dst_layout.cols) {
        return Err(DiagError::ExtentMismatch {
            src_rows: src_layout.rows,
            src_cols: src_layout.cols,
            dst_rows: dst_layout.rows,
            dst_cols: dst_layout.cols,
        });
    }
    let src_ranks = owner_ranks(comm, &src_layout)?;
    let dst_ranks = owner_ranks(comm, &dst_layout)?;

    let mut outgoing = vec![Vec::new(); comm.size()];
    if let Participant::Active(matrix) = source {
        for (i, j, value) in matrix.local_entries() {
            outgoing[dst_ranks[&dst_layout.owner(i, j)]].push(value);
        }
    }
    let incoming = comm.all_to_all_f64(outgoing)?;
    log::trace!(
        "rank {}: redistributing {}x{}, received {} elements",
        comm.rank(),
        src_layout.rows,
        src_layout.cols,
        incoming.iter().map(Vec::len).sum::<usize>()
    );

    let unpacked = match dest {
        Participant::Active(matrix) => unpack(matrix, &incoming, |i, j| src_ranks[&src_layout.owner(i, j)]),
        Participant::Dormant => expect_nothing(&incoming),
    };
    agree(comm, unpacked)
}

/// Fill `matrix` in local column-major order, taking each element from the
/// next unread slot of its source rank's buffer.
fn unpack(
    matrix: &mut DistributedMatrix,
    incoming: &[Vec<f64>],
    source_rank: impl Fn(usize, usize) -> usize,
) -> Result<(), DiagError> {
    let rows = matrix.descriptor().row_indices();
    let cols = matrix.descriptor().col_indices();
    let mut cursors = vec![0usize; incoming.len()];
    let local = matrix.local_mut();
    for (lj, &j) in cols.iter().enumerate() {
        for (li, &i) in rows.iter().enumerate() {
            let rank = source_rank(i, j);
            let value = incoming[rank].get(cursors[rank]).ok_or_else(|| DiagError::LayoutMismatch {
                context: format!("redistribute from rank {rank}"),
                expected: cursors[rank] + 1,
                found: incoming[rank].len(),
            })?;
            local[[li, lj]] = *value;
            cursors[rank] += 1;
        }
    }
    for (rank, (buffer, &read)) in incoming.iter().zip(&cursors).enumerate() {
        if buffer.len() != read {
            return Err(DiagError::LayoutMismatch {
                context: format!("redistribute from rank {rank}"),
                expected: read,
                found: buffer.len(),
            });
        }
    }
    Ok(())
}

fn expect_nothing(incoming: &[Vec<f64>]) -> Result<(), DiagError> {
    match incoming.iter().position(|buffer| !buffer.is_empty()) {
        None => Ok(()),
        Some(rank) => Err(DiagError::LayoutMismatch {
            context: format!("dormant rank received data from rank {rank}"),
            expected: 0,
            found: incoming[rank].len(),
        }),
    }
}

/// Overwrite the strict lower triangle of a square matrix with the transpose
/// of its upper triangle. Collective over the matrix's grid.
pub fn fill_lower_from_upper(matrix: &mut DistributedMatrix) -> Result<(), DiagError> {
    let desc = matrix.descriptor().clone();
    if desc.global_rows() != desc.global_cols() {
        return Err(DiagError::ExtentMismatch {
            src_rows: desc.global_rows(),
            src_cols: desc.global_cols(),
            dst_rows: desc.global_cols(),
            dst_cols: desc.global_rows(),
        });
    }
    let grid = desc.grid();
    let comm = grid.comm();

    // Element (i, j) with i < j becomes (j, i). Senders walk column-major, so
    // each receiver sees its transposed elements in row-major order.
    let mut outgoing = vec![Vec::new(); comm.size()];
    for (i, j, value) in matrix.local_entries() {
        if i < j {
            let (prow, pcol) = desc.owner_of(j, i);
            outgoing[grid.owner(prow, pcol)].push(value);
        }
    }
    let incoming = comm.all_to_all_f64(outgoing)?;

    let rows = desc.row_indices();
    let cols = desc.col_indices();
    let mut cursors = vec![0usize; comm.size()];
    let mut outcome = Ok(());
    let local = matrix.local_mut();
    'rows: for (li, &i) in rows.iter().enumerate() {
        for (lj, &j) in cols.iter().enumerate() {
            if i <= j {
                continue;
            }
            let (prow, pcol) = desc.owner_of(j, i);
            let rank = grid.owner(prow, pcol);
            match incoming[rank].get(cursors[rank]) {
                Some(&value) => local[[li, lj]] = value,
                None => {
                    outcome = Err(DiagError::LayoutMismatch {
                        context: format!("symmetrising from rank {rank}"),
                        expected: cursors[rank] + 1,
                        found: incoming[rank].len(),
                    });
                    break 'rows;
                }
            }
            cursors[rank] += 1;
        }
    }
    agree(comm, outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{GridShape, ProcessGrid};
    use crate::layout::DescriptorOptions;
    use tessera_compute::LocalCluster;

    fn value(i: usize, j: usize) -> f64 {
        1.0 + i as f64 * 0.5 - j as f64 * 0.25
    }

    fn layout(comm: &Communicator, n: usize, block: usize) -> DistributionDescriptor {
        let grid = ProcessGrid::create(comm, GridShape::Square).unwrap();
        DistributionDescriptor::create(&grid, DescriptorOptions::new(n, n).block(block, block)).unwrap()
    }

    #[test]
    fn test_same_group_relayout() {
        let ok = LocalCluster::new(4).run(|comm| {
            let src_desc = layout(&comm, 17, 2);
            let grid = ProcessGrid::create(&comm, GridShape::Row).unwrap();
            let dst_desc = DistributionDescriptor::create(&grid, DescriptorOptions::new(17, 17).block(3, 3)).unwrap();
            let src = DistributedMatrix::from_global_fn(&src_desc, value);
            let mut dst = DistributedMatrix::zeros(&dst_desc);
            redistribute(&comm, Participant::Active(&src), Participant::Active(&mut dst)).unwrap();
            let ok = dst.local_entries().all(|(i, j, v)| v == value(i, j));
            ok
        });
        assert!(ok.iter().all(|&b| b));
    }

    #[test]
    fn test_gather_onto_one_rank_with_dormant_peers() {
        let results = LocalCluster::new(3).run(|comm| {
            let src = DistributedMatrix::from_global_fn(&layout(&comm, 5, 2), value);
            let single = comm.split((comm.rank() == 0).then_some(0), comm.rank()).unwrap();
            let mut dst = single.as_ref().map(|c| DistributedMatrix::zeros(&layout(c, 5, 5)));
            let dest = match dst.as_mut() {
                Some(m) => Participant::Active(m),
                None => Participant::Dormant,
            };
            redistribute(&comm, Participant::Active(&src), dest).unwrap();
            dst.map(|m| m.local().clone())
        });
        let full = results[0].as_ref().unwrap();
        assert_eq!(full.dim(), (5, 5));
        for ((i, j), &v) in full.indexed_iter() {
            assert_eq!(v, value(i, j));
        }
        assert!(results[1].is_none() && results[2].is_none());
    }

    #[test]
    fn test_extent_mismatch_fails_everywhere() {
        let errors = LocalCluster::new(2).run(|comm| {
            let grid = ProcessGrid::create(&comm, GridShape::Row).unwrap();
            let a = DistributedMatrix::zeros(&DistributionDescriptor::create(&grid, DescriptorOptions::new(4, 4)).unwrap());
            let mut b = DistributedMatrix::zeros(&DistributionDescriptor::create(&grid, DescriptorOptions::new(4, 5)).unwrap());
            redistribute(&comm, Participant::Active(&a), Participant::Active(&mut b)).unwrap_err()
        });
        for err in errors {
            assert!(matches!(
                err,
                DiagError::ExtentMismatch {
                    src_rows: 4,
                    src_cols: 4,
                    dst_rows: 4,
                    dst_cols: 5
                }
            ));
        }
    }

    #[test]
    fn test_missing_source_is_reported() {
        let errors = LocalCluster::new(2).run(|comm| {
            let mut dst = DistributedMatrix::zeros(&layout(&comm, 4, 2));
            redistribute(&comm, Participant::Dormant, Participant::Active(&mut dst)).is_err()
        });
        assert_eq!(errors, vec![true, true]);
    }

    #[test]
    fn test_fill_lower_from_upper() {
        let ok = LocalCluster::new(6).run(|comm| {
            let desc = layout(&comm, 13, 2);
            let mut m = DistributedMatrix::from_global_fn(&desc, |i, j| if i <= j { value(i, j) } else { f64::NAN });
            fill_lower_from_upper(&mut m).unwrap();
            let ok = m.local_entries()
                .all(|(i, j, v)| v == value(i.min(j), i.max(j)));
            ok
        });
        assert!(ok.iter().all(|&b| b));
    }
}
