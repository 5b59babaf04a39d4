//! # Tessera Core
//!
//! Distributed dense symmetric eigensolving on block-cyclic layouts. This
//! crate describes how matrices are spread over process grids, moves them
//! between layouts and worker subsets, and dispatches eigensolves to a
//! configurable backend.
//!
//! ## Architecture
//!
//! Everything is SPMD: each rank calls the same functions in the same order
//! with a [`tessera_compute::Communicator`]. [`diag::EigensolverDispatcher`]
//! plans how many workers should take part, shrinks the group with
//! [`subgroup::WorkerSubgroup`] when that pays off, moves the matrix with
//! [`redistribute::redistribute`], and runs an [`solver::EigenBackend`].
//!
//! ## Modules
//!
//! - [`grid`]: Process grids and their shape policies.
//! - [`layout`]: Block-cyclic distribution descriptors and index arithmetic.
//! - [`matrix`]: Local storage of a distributed matrix.
//! - [`redistribute`]: Layout-to-layout copies and symmetrisation.
//! - [`planner`]: Worker-count and block-size planning.
//! - [`subgroup`]: Active/dormant worker splits.
//! - [`solver`]: Eigensolver backends and eigenpair checks.
//! - [`diag`]: The dispatcher tying the above together.
//! - [`config`], [`types`], [`error`]: Configuration, results and errors.

pub mod config;
pub mod diag;
pub mod error;
pub mod grid;
pub mod layout;
pub mod matrix;
pub mod planner;
pub mod redistribute;
pub mod solver;
pub mod subgroup;
pub mod types;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

pub use config::{AccelerationPolicy, DiagConfig};
pub use diag::EigensolverDispatcher;
pub use error::DiagError;
pub use grid::{GridShape, ProcessGrid};
pub use layout::{DescriptorOptions, DistributionDescriptor, Participant};
pub use matrix::DistributedMatrix;
pub use planner::{PlannerPolicy, RedistributionPlan};
pub use solver::{BackendKind, EigenBackend, EigenCheck};
pub use types::{DiagOptions, DiagnosticRecord, EigenResult, Storage};

/// Rank-independent hash used to check that SPMD call arguments agree.
pub(crate) fn fingerprint<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}
