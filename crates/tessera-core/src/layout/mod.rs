//! Block-cyclic distribution descriptors.
//!
//! A [`DistributionDescriptor`] records how an `M x N` matrix is spread over
//! a [`ProcessGrid`]: block sizes, the grid coordinates owning the first
//! block, and the local extent of every process row and column. Descriptors
//! are immutable after [`create`](DistributionDescriptor::create) and are
//! shared by cloning the handle.

pub mod cyclic;

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::error::DiagError;
use crate::fingerprint;
use crate::grid::ProcessGrid;

/// Block size used when neither the caller nor a template supplies one.
pub const DEFAULT_BLOCK_SIZE: usize = 32;

/// A value a rank either holds or, as a dormant member of a collective,
/// does not.
#[derive(Debug, Clone, PartialEq)]
pub enum Participant<T> {
    Active(T),
    Dormant,
}

impl<T> Participant<T> {
    pub fn is_active(&self) -> bool {
        matches!(self, Participant::Active(_))
    }

    pub fn active(&self) -> Option<&T> {
        match self {
            Participant::Active(value) => Some(value),
            Participant::Dormant => None,
        }
    }

    pub fn active_mut(&mut self) -> Option<&mut T> {
        match self {
            Participant::Active(value) => Some(value),
            Participant::Dormant => None,
        }
    }

    pub fn into_active(self) -> Option<T> {
        match self {
            Participant::Active(value) => Some(value),
            Participant::Dormant => None,
        }
    }

    pub fn as_ref(&self) -> Participant<&T> {
        match self {
            Participant::Active(value) => Participant::Active(value),
            Participant::Dormant => Participant::Dormant,
        }
    }

    pub fn as_mut(&mut self) -> Participant<&mut T> {
        match self {
            Participant::Active(value) => Participant::Active(value),
            Participant::Dormant => Participant::Dormant,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Participant<U> {
        match self {
            Participant::Active(value) => Participant::Active(f(value)),
            Participant::Dormant => Participant::Dormant,
        }
    }
}

impl<T> From<Option<T>> for Participant<T> {
    fn from(value: Option<T>) -> Self {
        value.map_or(Participant::Dormant, Participant::Active)
    }
}

/// Inputs to [`DistributionDescriptor::create`].
///
/// Fields left `None` are copied from `template` when one is given, and
/// otherwise defaulted (blocks to [`DEFAULT_BLOCK_SIZE`], first process to 0).
#[derive(Debug, Clone, Default)]
pub struct DescriptorOptions<'a> {
    pub global_rows: Option<usize>,
    pub global_cols: Option<usize>,
    pub block_rows: Option<usize>,
    pub block_cols: Option<usize>,
    pub first_process_row: Option<usize>,
    pub first_process_col: Option<usize>,
    pub template: Option<&'a DistributionDescriptor>,
    /// Keep the requested blocks even when they exceed the per-process
    /// share of the matrix.
    pub force_block: bool,
    /// Allow `block_rows != block_cols` on square matrices.
    pub rectangular_blocks: bool,
    pub default_block_size: Option<usize>,
}

impl<'a> DescriptorOptions<'a> {
    pub fn new(global_rows: usize, global_cols: usize) -> Self {
        Self {
            global_rows: Some(global_rows),
            global_cols: Some(global_cols),
            ..Self::default()
        }
    }

    pub fn from_template(template: &'a DistributionDescriptor) -> Self {
        Self {
            template: Some(template),
            ..Self::default()
        }
    }

    pub fn block(mut self, block_rows: usize, block_cols: usize) -> Self {
        self.block_rows = Some(block_rows);
        self.block_cols = Some(block_cols);
        self
    }

    pub fn first_process(mut self, row: usize, col: usize) -> Self {
        self.first_process_row = Some(row);
        self.first_process_col = Some(col);
        self
    }

    pub fn force_block(mut self) -> Self {
        self.force_block = true;
        self
    }

    pub fn rectangular_blocks(mut self) -> Self {
        self.rectangular_blocks = true;
        self
    }

    pub fn default_block_size(mut self, block: usize) -> Self {
        self.default_block_size = Some(block);
        self
    }
}

#[derive(Debug)]
struct Layout {
    grid: Arc<ProcessGrid>,
    global_rows: usize,
    global_cols: usize,
    block_rows: usize,
    block_cols: usize,
    first_row: usize,
    first_col: usize,
    row_counts: Vec<usize>,
    col_counts: Vec<usize>,
    leading_dimension: usize,
}

/// Plain-data snapshot of a descriptor, for logs and reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DescriptorInfo {
    pub global_rows: usize,
    pub global_cols: usize,
    pub block_rows: usize,
    pub block_cols: usize,
    pub first_process_row: usize,
    pub first_process_col: usize,
    pub grid_rows: usize,
    pub grid_cols: usize,
    pub local_rows: usize,
    pub local_cols: usize,
    pub leading_dimension: usize,
    pub row_counts: Vec<usize>,
    pub col_counts: Vec<usize>,
}

/// Shared handle on an immutable block-cyclic layout.
#[derive(Debug, Clone)]
pub struct DistributionDescriptor {
    inner: Arc<Layout>,
}

impl DistributionDescriptor {
    /// Describe a matrix distributed over `grid`. Collective over the grid.
    ///
    /// Unless `force_block` is set, blocks are clamped to
    /// `max(1, ceil(extent / grid_extent))`. Square matrices get square
    /// blocks unless `rectangular_blocks` is set.
    pub fn create(grid: &Arc<ProcessGrid>, options: DescriptorOptions<'_>) -> Result<Self, DiagError> {
        let template = options.template;
        let global_rows = options
            .global_rows
            .or(template.map(|t| t.global_rows()))
            .ok_or_else(|| DiagError::InvalidDescriptor("global row count not given".into()))?;
        let global_cols = options
            .global_cols
            .or(template.map(|t| t.global_cols()))
            .ok_or_else(|| DiagError::InvalidDescriptor("global column count not given".into()))?;

        let default_block = options.default_block_size.unwrap_or(DEFAULT_BLOCK_SIZE);
        let mut block_rows = options
            .block_rows
            .or(template.map(|t| t.block_rows()))
            .unwrap_or(default_block);
        let mut block_cols = options
            .block_cols
            .or(template.map(|t| t.block_cols()))
            .unwrap_or(default_block);
        if block_rows == 0 || block_cols == 0 {
            return Err(DiagError::InvalidDescriptor(format!(
                "block sizes must be positive, got {block_rows}x{block_cols}"
            )));
        }

        if !options.force_block {
            block_rows = block_rows.min(global_rows.div_ceil(grid.rows()).max(1));
            block_cols = block_cols.min(global_cols.div_ceil(grid.cols()).max(1));
        }
        if global_rows == global_cols && !options.rectangular_blocks {
            let block = block_rows.min(block_cols);
            block_rows = block;
            block_cols = block;
        }

        let first_row = options
            .first_process_row
            .or(template.map(|t| t.first_process_row()))
            .unwrap_or(0);
        let first_col = options
            .first_process_col
            .or(template.map(|t| t.first_process_col()))
            .unwrap_or(0);
        if first_row >= grid.rows() || first_col >= grid.cols() {
            return Err(DiagError::InvalidDescriptor(format!(
                "first process ({first_row},{first_col}) is outside the {}x{} grid",
                grid.rows(),
                grid.cols()
            )));
        }

        let comm = grid.comm();
        comm.verify_consistent(
            "DistributionDescriptor::create",
            fingerprint(&(global_rows, global_cols, block_rows, block_cols, first_row, first_col)),
        )?;

        // Each process row reports its row extent once (from grid column 0),
        // and each process column its column extent once (from grid row 0).
        let (my_row, my_col) = grid.position();
        let my_rows = cyclic::local_extent(global_rows, block_rows, my_row, first_row, grid.rows());
        let my_cols = cyclic::local_extent(global_cols, block_cols, my_col, first_col, grid.cols());
        let mut table = vec![0usize; grid.rows() + grid.cols()];
        if my_col == 0 {
            table[my_row] = my_rows;
        }
        if my_row == 0 {
            table[grid.rows() + my_col] = my_cols;
        }
        comm.all_reduce_sum(&mut table)?;
        let col_counts = table.split_off(grid.rows());
        let row_counts = table;

        check_total("row distribution", &row_counts, global_rows)?;
        check_total("column distribution", &col_counts, global_cols)?;

        let descriptor = Self {
            inner: Arc::new(Layout {
                grid: Arc::clone(grid),
                global_rows,
                global_cols,
                block_rows,
                block_cols,
                first_row,
                first_col,
                leading_dimension: my_rows.max(1),
                row_counts,
                col_counts,
            }),
        };
        log::trace!("rank {}: {descriptor}", comm.rank());
        Ok(descriptor)
    }

    /// Share this descriptor. Equivalent to `clone`.
    pub fn retain(&self) -> Self {
        self.clone()
    }

    /// Give up this handle and return how many handles remain.
    pub fn release(self) -> usize {
        let remaining = Arc::strong_count(&self.inner) - 1;
        drop(self);
        remaining
    }

    /// Number of live handles on this descriptor.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// True when both live on the same process group with the same global
    /// extents and leading dimension. Block sizes and first process are not
    /// compared.
    pub fn equivalent(&self, other: &DistributionDescriptor) -> bool {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return true;
        }
        let (a, b) = (&self.inner, &other.inner);
        a.grid.comm().same_group(b.grid.comm())
            && a.global_rows == b.global_rows
            && a.global_cols == b.global_cols
            && a.leading_dimension == b.leading_dimension
    }

    /// Descriptor for the same grid and blocks with the row and/or column
    /// extent doubled.
    ///
    /// The new extents are derived from the current tables without
    /// communication.
    pub fn double(&self, grow_rows: bool, grow_cols: bool) -> Result<Self, DiagError> {
        let layout = &self.inner;
        let grid = &layout.grid;
        let (global_rows, row_counts) = if grow_rows {
            let counts = cyclic::doubled_local_extents(
                layout.global_rows,
                layout.block_rows,
                layout.first_row,
                grid.rows(),
            );
            (2 * layout.global_rows, counts)
        } else {
            (layout.global_rows, layout.row_counts.clone())
        };
        let (global_cols, col_counts) = if grow_cols {
            let counts = cyclic::doubled_local_extents(
                layout.global_cols,
                layout.block_cols,
                layout.first_col,
                grid.cols(),
            );
            (2 * layout.global_cols, counts)
        } else {
            (layout.global_cols, layout.col_counts.clone())
        };
        check_total("doubled row distribution", &row_counts, global_rows)?;
        check_total("doubled column distribution", &col_counts, global_cols)?;

        Ok(Self {
            inner: Arc::new(Layout {
                grid: Arc::clone(grid),
                global_rows,
                global_cols,
                block_rows: layout.block_rows,
                block_cols: layout.block_cols,
                first_row: layout.first_row,
                first_col: layout.first_col,
                leading_dimension: row_counts[grid.my_row()].max(1),
                row_counts,
                col_counts,
            }),
        })
    }

    pub fn grid(&self) -> &Arc<ProcessGrid> {
        &self.inner.grid
    }

    pub fn global_rows(&self) -> usize {
        self.inner.global_rows
    }

    pub fn global_cols(&self) -> usize {
        self.inner.global_cols
    }

    pub fn block_rows(&self) -> usize {
        self.inner.block_rows
    }

    pub fn block_cols(&self) -> usize {
        self.inner.block_cols
    }

    pub fn first_process_row(&self) -> usize {
        self.inner.first_row
    }

    pub fn first_process_col(&self) -> usize {
        self.inner.first_col
    }

    /// Local row extent of every process row.
    pub fn row_counts(&self) -> &[usize] {
        &self.inner.row_counts
    }

    /// Local column extent of every process column.
    pub fn col_counts(&self) -> &[usize] {
        &self.inner.col_counts
    }

    pub fn local_rows(&self) -> usize {
        self.inner.row_counts[self.inner.grid.my_row()]
    }

    pub fn local_cols(&self) -> usize {
        self.inner.col_counts[self.inner.grid.my_col()]
    }

    pub fn leading_dimension(&self) -> usize {
        self.inner.leading_dimension
    }

    /// Grid coordinates owning global element `(i, j)`.
    pub fn owner_of(&self, i: usize, j: usize) -> (usize, usize) {
        let l = &self.inner;
        (
            cyclic::owner_of(i, l.block_rows, l.first_row, l.grid.rows()),
            cyclic::owner_of(j, l.block_cols, l.first_col, l.grid.cols()),
        )
    }

    /// Local position of global element `(i, j)` if the caller owns it.
    pub fn local_index(&self, i: usize, j: usize) -> Option<(usize, usize)> {
        let l = &self.inner;
        if i >= l.global_rows || j >= l.global_cols || self.owner_of(i, j) != l.grid.position() {
            return None;
        }
        Some((
            cyclic::global_to_local(i, l.block_rows, l.grid.rows()),
            cyclic::global_to_local(j, l.block_cols, l.grid.cols()),
        ))
    }

    /// Global row index of every local row, in local order.
    pub fn row_indices(&self) -> Vec<usize> {
        let l = &self.inner;
        (0..self.local_rows())
            .map(|li| cyclic::local_to_global(li, l.block_rows, l.grid.my_row(), l.first_row, l.grid.rows()))
            .collect()
    }

    /// Global column index of every local column, in local order.
    pub fn col_indices(&self) -> Vec<usize> {
        let l = &self.inner;
        (0..self.local_cols())
            .map(|lj| cyclic::local_to_global(lj, l.block_cols, l.grid.my_col(), l.first_col, l.grid.cols()))
            .collect()
    }

    pub fn info(&self) -> DescriptorInfo {
        let l = &self.inner;
        DescriptorInfo {
            global_rows: l.global_rows,
            global_cols: l.global_cols,
            block_rows: l.block_rows,
            block_cols: l.block_cols,
            first_process_row: l.first_row,
            first_process_col: l.first_col,
            grid_rows: l.grid.rows(),
            grid_cols: l.grid.cols(),
            local_rows: self.local_rows(),
            local_cols: self.local_cols(),
            leading_dimension: l.leading_dimension,
            row_counts: l.row_counts.clone(),
            col_counts: l.col_counts.clone(),
        }
    }

    /// Hash of the rank-independent part of the layout.
    pub fn fingerprint(&self) -> u64 {
        let l = &self.inner;
        fingerprint(&(
            l.global_rows,
            l.global_cols,
            l.block_rows,
            l.block_cols,
            l.first_row,
            l.first_col,
            l.grid.rows(),
            l.grid.cols(),
            &l.row_counts,
            &l.col_counts,
        ))
    }
}

impl fmt::Display for DistributionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let l = &self.inner;
        write!(
            f,
            "{}x{} matrix in {}x{} blocks on a {}x{} grid (first process ({},{})); local {}x{}, lda {}",
            l.global_rows,
            l.global_cols,
            l.block_rows,
            l.block_cols,
            l.grid.rows(),
            l.grid.cols(),
            l.first_row,
            l.first_col,
            self.local_rows(),
            self.local_cols(),
            l.leading_dimension
        )
    }
}

fn check_total(context: &str, counts: &[usize], expected: usize) -> Result<(), DiagError> {
    let found: usize = counts.iter().sum();
    if found != expected {
        return Err(DiagError::LayoutMismatch {
            context: context.to_string(),
            expected,
            found,
        });
    }
    Ok(())
}
