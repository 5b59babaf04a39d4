//! Splitting a process group into active and dormant workers.

use std::sync::Arc;

use tessera_compute::Communicator;

use crate::error::DiagError;
use crate::grid::{GridShape, ProcessGrid};
use crate::layout::{DescriptorOptions, DistributionDescriptor, Participant};
use crate::planner::RedistributionPlan;

/// Role of a rank after a split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Active,
    Dormant,
}

/// The two halves of a split group plus the layout of the active half.
///
/// Ranks `0..worker_count_after` of the parent group become active, in
/// their original order. Dropping the subgroup releases its communicators,
/// grid and descriptor.
#[derive(Debug)]
pub struct WorkerSubgroup {
    membership: Vec<Membership>,
    active_comm: Option<Communicator>,
    dormant_comm: Option<Communicator>,
    grid: Option<Arc<ProcessGrid>>,
    descriptor: Participant<DistributionDescriptor>,
}

impl WorkerSubgroup {
    /// Split `comm` according to `plan` and lay out `template`'s matrix on
    /// the active ranks with the plan's block size. Collective over `comm`.
    pub fn split(
        comm: &Communicator,
        template: &DistributionDescriptor,
        plan: &RedistributionPlan,
        shape: GridShape,
    ) -> Result<Self, DiagError> {
        let active_count = plan.worker_count_after;
        if active_count < 1 || active_count > comm.size() {
            return Err(DiagError::InvalidTopology(format!(
                "cannot activate {active_count} of {} workers",
                comm.size()
            )));
        }
        let membership: Vec<Membership> = (0..comm.size())
            .map(|rank| {
                if rank < active_count {
                    Membership::Active
                } else {
                    Membership::Dormant
                }
            })
            .collect();
        let mine = membership[comm.rank()];

        let color = match mine {
            Membership::Active => 0,
            Membership::Dormant => 1,
        };
        let group = comm.split(Some(color), comm.rank())?;
        let (active_comm, dormant_comm) = match mine {
            Membership::Active => (group, None),
            Membership::Dormant => (None, group),
        };

        let (grid, descriptor) = match &active_comm {
            Some(active) => {
                let grid = ProcessGrid::create(active, shape)?;
                let (block_rows, block_cols) = plan.block_after;
                let mut options = DescriptorOptions::from_template(template)
                    .block(block_rows, block_cols)
                    .first_process(0, 0)
                    .force_block();
                if block_rows != block_cols {
                    options = options.rectangular_blocks();
                }
                let descriptor = DistributionDescriptor::create(&grid, options)?;
                (Some(grid), Participant::Active(descriptor))
            }
            None => (None, Participant::Dormant),
        };

        log::debug!(
            "rank {}: {:?} in a {active_count}/{} split",
            comm.rank(),
            mine,
            comm.size()
        );
        Ok(Self {
            membership,
            active_comm,
            dormant_comm,
            grid,
            descriptor,
        })
    }

    /// Membership of every parent rank.
    pub fn membership(&self) -> &[Membership] {
        &self.membership
    }

    pub fn is_active(&self) -> bool {
        self.active_comm.is_some()
    }

    pub fn active_count(&self) -> usize {
        self.membership.iter().filter(|&&m| m == Membership::Active).count()
    }

    pub fn active_comm(&self) -> Option<&Communicator> {
        self.active_comm.as_ref()
    }

    pub fn dormant_comm(&self) -> Option<&Communicator> {
        self.dormant_comm.as_ref()
    }

    pub fn grid(&self) -> Option<&Arc<ProcessGrid>> {
        self.grid.as_ref()
    }

    pub fn descriptor(&self) -> Participant<&DistributionDescriptor> {
        self.descriptor.as_ref()
    }

    /// Parent rank that speaks for the active set.
    pub fn representative(&self) -> usize {
        0
    }
}
