//! Block-cyclic index arithmetic along one matrix axis.
//!
//! An axis of length `extent` is cut into blocks of `block` indices; block
//! `b` belongs to process `(first + b) mod nprocs`. The final block may be
//! truncated. All functions here are pure and independent of any grid or
//! communicator.

/// Number of indices owned by process `proc`.
pub fn local_extent(extent: usize, block: usize, proc: usize, first: usize, nprocs: usize) -> usize {
    debug_assert!(block >= 1 && nprocs >= 1 && proc < nprocs);
    let dist = (nprocs + proc - first % nprocs) % nprocs;
    let full_blocks = extent / block;
    let mut count = (full_blocks / nprocs) * block;
    let extra = full_blocks % nprocs;
    if dist < extra {
        count += block;
    } else if dist == extra {
        count += extent % block;
    }
    count
}

/// Local extent of every process, indexed by process coordinate.
pub fn local_extents(extent: usize, block: usize, first: usize, nprocs: usize) -> Vec<usize> {
    (0..nprocs)
        .map(|p| local_extent(extent, block, p, first, nprocs))
        .collect()
}

/// Process owning global index `global`.
pub fn owner_of(global: usize, block: usize, first: usize, nprocs: usize) -> usize {
    (first + global / block) % nprocs
}

/// Position of global index `global` inside its owner's local storage.
pub fn global_to_local(global: usize, block: usize, nprocs: usize) -> usize {
    (global / (block * nprocs)) * block + global % block
}

/// Global index of local index `local` on process `proc`.
pub fn local_to_global(local: usize, block: usize, proc: usize, first: usize, nprocs: usize) -> usize {
    let dist = (nprocs + proc - first % nprocs) % nprocs;
    ((local / block) * nprocs + dist) * block + local % block
}

/// Number of indices in `[start, start + len)` owned by `proc`, counted block
/// by block.
///
/// A `start` that lands inside a block contributes a partial leading block.
pub fn owned_in_range(
    start: usize,
    len: usize,
    block: usize,
    proc: usize,
    first: usize,
    nprocs: usize,
) -> usize {
    let end = start + len;
    let cycle = block * nprocs;
    let mut owned = 0;
    let mut g = start;

    // Leading partial cycle, up to the next cycle boundary.
    let first_cycle_end = ((g / cycle) + 1) * cycle;
    while g < end.min(first_cycle_end) {
        let stop = (((g / block) + 1) * block).min(end);
        if owner_of(g, block, first, nprocs) == proc {
            owned += stop - g;
        }
        g = stop;
    }

    // Whole cycles each give exactly one block to every process.
    let whole = (end.saturating_sub(g)) / cycle;
    owned += whole * block;
    g += whole * cycle;

    while g < end {
        let stop = (((g / block) + 1) * block).min(end);
        if owner_of(g, block, first, nprocs) == proc {
            owned += stop - g;
        }
        g = stop;
    }
    owned
}

/// Number of processes owning no index of the axis.
pub fn empty_processes(extent: usize, block: usize, nprocs: usize) -> usize {
    nprocs.saturating_sub(extent.div_ceil(block))
}

/// Local extents after appending `added` indices to an axis of length
/// `extent` whose per-process extents are `counts`.
pub fn extend_local_extents(
    counts: &[usize],
    extent: usize,
    added: usize,
    block: usize,
    first: usize,
) -> Vec<usize> {
    let nprocs = counts.len();
    counts
        .iter()
        .enumerate()
        .map(|(p, &count)| count + owned_in_range(extent, added, block, p, first, nprocs))
        .collect()
}

/// Local extents of an axis of length `2 * extent`, derived from the
/// extents of the original axis.
pub fn doubled_local_extents(extent: usize, block: usize, first: usize, nprocs: usize) -> Vec<usize> {
    let base = local_extents(extent, block, first, nprocs);
    extend_local_extents(&base, extent, extent, block, first)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_extents_sum_to_extent() {
        for extent in [0, 1, 7, 31, 32, 33, 64, 100, 129, 1000] {
            for block in [1, 2, 5, 16, 32, 64] {
                for nprocs in 1..=7 {
                    for first in 0..nprocs {
                        let total: usize = local_extents(extent, block, first, nprocs).iter().sum();
                        assert_eq!(
                            total, extent,
                            "extent={extent} block={block} nprocs={nprocs} first={first}"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_index_maps_are_inverse() {
        let (block, nprocs, first) = (4, 3, 1);
        let extent = 50;
        let counts = local_extents(extent, block, first, nprocs);
        let mut seen = vec![false; extent];
        for p in 0..nprocs {
            for l in 0..counts[p] {
                let g = local_to_global(l, block, p, first, nprocs);
                assert!(g < extent);
                assert_eq!(owner_of(g, block, first, nprocs), p);
                assert_eq!(global_to_local(g, block, nprocs), l);
                assert!(!seen[g], "global index {g} owned twice");
                seen[g] = true;
            }
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn test_local_order_is_monotone_in_global_order() {
        let (block, nprocs) = (3, 4);
        for p in 0..nprocs {
            let globals: Vec<usize> = (0..local_extent(40, block, p, 2, nprocs))
                .map(|l| local_to_global(l, block, p, 2, nprocs))
                .collect();
            assert!(globals.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn test_owned_in_range_matches_extent_difference() {
        for (start, len, block, nprocs, first) in
            [(0, 100, 32, 3, 0), (100, 100, 32, 3, 0), (37, 250, 8, 5, 2), (5, 3, 16, 4, 1)]
        {
            for p in 0..nprocs {
                let expected = local_extent(start + len, block, p, first, nprocs)
                    - local_extent(start, block, p, first, nprocs);
                assert_eq!(owned_in_range(start, len, block, p, first, nprocs), expected);
            }
        }
    }

    #[test]
    fn test_doubling_one_call_equals_two_recomputations() {
        // 100 columns, block 32, three process columns.
        let direct = local_extents(200, 32, 0, 3);
        let doubled = doubled_local_extents(100, 32, 0, 3);
        let stepwise = extend_local_extents(&local_extents(100, 32, 0, 3), 100, 100, 32, 0);

        assert_eq!(direct, vec![72, 64, 64]);
        assert_eq!(doubled, direct);
        assert_eq!(stepwise, direct);
    }

    #[test]
    fn test_doubling_mid_block_adds_partial_block() {
        // 100 = 3 * 32 + 4: the second half starts inside block 3, owned by
        // process 0, which picks up the remaining 28 indices of that block.
        let base = local_extents(100, 32, 0, 3);
        assert_eq!(base, vec![36, 32, 32]);
        assert_eq!(owned_in_range(100, 28, 32, 0, 0, 3), 28);
    }

    #[test]
    fn test_empty_processes() {
        assert_eq!(empty_processes(64, 64, 4), 3);
        assert_eq!(empty_processes(64, 16, 4), 0);
        assert_eq!(empty_processes(10, 4, 8), 5);
        for (extent, block, nprocs) in [(64, 64, 4), (10, 4, 8), (129, 32, 6)] {
            let zeros = local_extents(extent, block, 0, nprocs)
                .iter()
                .filter(|&&c| c == 0)
                .count();
            assert_eq!(zeros, empty_processes(extent, block, nprocs));
        }
    }
}
