//! The eigensolver dispatcher.
//!
//! [`EigensolverDispatcher::diagonalize`] is the entry point for computing
//! eigenpairs of a distributed real symmetric matrix. It is collective over
//! the matrix's grid and proceeds through the phases of [`DiagPhase`]:
//!
//! 1. **Planning**: pick the backend, the worker count and the block size.
//! 2. **Redistribute in**: if the plan shrinks the worker set or changes the
//!    block, split the group and move the matrix onto the active workers.
//! 3. **Solving**: symmetrise if the backend needs both triangles, then run
//!    the backend, optionally twice to verify the accelerated kernel.
//! 4. **Redistribute out**: move eigenvectors back into the caller's layout
//!    and broadcast eigenvalues to every rank.
//!
//! Every failure is observed by every rank, so callers can handle errors
//! without desynchronising.

use std::sync::Arc;

use tessera_compute::Communicator;

use crate::config::{AccelerationPolicy, DiagConfig};
use crate::error::{agree, DiagError};
use crate::fingerprint;
use crate::layout::Participant;
use crate::matrix::DistributedMatrix;
use crate::planner::{self, PlanInput};
use crate::redistribute::{fill_lower_from_upper, redistribute};
use crate::solver::{EigenBackend, GeneralBackend, SolveRequest};
use crate::subgroup::WorkerSubgroup;
use crate::types::{DiagOptions, DiagPhase, DiagnosticRecord, EigenResult, Storage};

/// Whether the accelerated kernel may run for a matrix of `order` in blocks
/// of `block`.
///
/// Odd orders never qualify. Otherwise the override skips the size
/// preconditions, which require both `order` and `block` to reach
/// `policy.min_order`.
pub fn use_acceleration(order: usize, block: usize, policy: &AccelerationPolicy) -> bool {
    if !policy.enabled || order % 2 != 0 {
        return false;
    }
    policy.unsafe_override || (order >= policy.min_order && block >= policy.min_order)
}

/// Per-call decisions handed from planning to the solve phase.
struct SolveSettings<'a> {
    backend: &'a dyn EigenBackend,
    storage: Storage,
    neig: usize,
    accelerate: bool,
    verify: bool,
}

/// Plans, redistributes and solves symmetric eigenproblems.
pub struct EigensolverDispatcher {
    config: DiagConfig,
    backend: Arc<dyn EigenBackend>,
    fallback: Arc<dyn EigenBackend>,
}

impl EigensolverDispatcher {
    pub fn new(config: DiagConfig) -> Self {
        let backend = config.backend.create();
        Self::with_backend(config, backend)
    }

    /// Use `backend` in place of the one named in `config`.
    pub fn with_backend(config: DiagConfig, backend: Arc<dyn EigenBackend>) -> Self {
        Self {
            config,
            backend,
            fallback: Arc::new(GeneralBackend),
        }
    }

    pub fn config(&self) -> &DiagConfig {
        &self.config
    }

    pub fn backend(&self) -> &dyn EigenBackend {
        self.backend.as_ref()
    }

    /// Compute eigenpairs of `matrix`. Collective over the matrix's grid.
    ///
    /// `eigenvectors` must be an `N x N` matrix on the same process group;
    /// on success its first `neig` columns hold the eigenvectors and
    /// `eigenvalues` holds the ascending eigenvalues on every rank.
    pub fn diagonalize(
        &self,
        matrix: &DistributedMatrix,
        eigenvectors: &mut DistributedMatrix,
        eigenvalues: &mut Vec<f64>,
        options: &DiagOptions,
    ) -> Result<DiagnosticRecord, DiagError> {
        let mut record = DiagnosticRecord::new(matrix.descriptor().global_rows());
        record.enter(DiagPhase::Planning);
        match self.run(matrix, eigenvectors, eigenvalues, options, &mut record) {
            Ok(()) => {
                record.enter(DiagPhase::Done);
                log::info!(
                    "diagonalised order {} with `{}` on {} of {} workers",
                    record.order,
                    record.backend,
                    record.plan.as_ref().map_or(0, |p| p.worker_count_after),
                    record.plan.as_ref().map_or(0, |p| p.worker_count_before)
                );
                Ok(record)
            }
            Err(err) => {
                record.enter(DiagPhase::Failed);
                log::error!("diagonalisation failed: {err}\n{record}");
                Err(err)
            }
        }
    }

    /// Convenience wrapper around [`diagonalize`](Self::diagonalize) that
    /// allocates the eigenvector matrix in the input's layout.
    pub fn solve(&self, matrix: &DistributedMatrix, options: &DiagOptions) -> Result<EigenResult, DiagError> {
        let mut eigenvectors = DistributedMatrix::zeros(matrix.descriptor());
        let mut eigenvalues = Vec::new();
        let record = self.diagonalize(matrix, &mut eigenvectors, &mut eigenvalues, options)?;
        Ok(EigenResult {
            eigenvalues,
            eigenvectors,
            record,
        })
    }

    fn run(
        &self,
        matrix: &DistributedMatrix,
        eigenvectors: &mut DistributedMatrix,
        eigenvalues: &mut Vec<f64>,
        options: &DiagOptions,
        record: &mut DiagnosticRecord,
    ) -> Result<(), DiagError> {
        let desc = matrix.descriptor();
        let comm = desc.grid().comm().clone();
        let order = desc.global_rows();
        if order < 1 {
            return Err(DiagError::InvalidMatrixOrder);
        }
        if desc.global_cols() != order {
            return Err(DiagError::InvalidDescriptor(format!(
                "matrix is {order}x{}, not square",
                desc.global_cols()
            )));
        }
        let out = eigenvectors.descriptor();
        if (out.global_rows(), out.global_cols()) != (order, order) {
            return Err(DiagError::ExtentMismatch {
                src_rows: order,
                src_cols: order,
                dst_rows: out.global_rows(),
                dst_cols: out.global_cols(),
            });
        }
        if !out.grid().comm().same_group(&comm) {
            return Err(DiagError::InvalidTopology(
                "eigenvector matrix lives on a different process group".into(),
            ));
        }

        let neig = options.neig.unwrap_or(order).clamp(1, order);
        comm.verify_consistent(
            "diagonalize",
            fingerprint(&(desc.fingerprint(), out.fingerprint(), neig, options.storage)),
        )?;

        let fallback_used = self.backend.requires_no_empty_column() && neig < self.config.panel_min_eigenvectors;
        let backend = if fallback_used {
            log::info!(
                "{neig} eigenvectors requested, below {}; using the `{}` backend",
                self.config.panel_min_eigenvectors,
                self.fallback.name()
            );
            self.fallback.as_ref()
        } else {
            self.backend.as_ref()
        };

        let plan = planner::plan(
            &PlanInput::from_descriptor(desc),
            &self.config.planner,
            backend.requires_no_empty_column(),
        )?;
        let block = plan.block_after.0.min(plan.block_after.1);
        let accelerate = backend.supports_acceleration() && use_acceleration(order, block, &self.config.acceleration);
        if self.config.acceleration.enabled && !accelerate {
            log::debug!("acceleration enabled but not applicable to order {order}, block {block}");
        }
        let verify = accelerate && self.config.acceleration.unsafe_override && self.config.acceleration.verify;

        record.neig = neig;
        record.backend = backend.name().to_string();
        record.fallback_used = fallback_used;
        record.acceleration_used = accelerate;
        record.acceleration_verified = verify;
        record.plan = Some(plan.clone());

        let settings = SolveSettings {
            backend,
            storage: options.storage,
            neig,
            accelerate,
            verify,
        };

        if plan.should_redistribute {
            record.enter(DiagPhase::RedistributeIn);
            let subgroup = WorkerSubgroup::split(&comm, desc, &plan, self.config.grid_shape)?;
            let mut working = subgroup.descriptor().map(DistributedMatrix::zeros);
            redistribute(&comm, Participant::Active(matrix), working.as_mut())?;

            record.enter(DiagPhase::Solving);
            let mut vectors = working.as_ref().map(|w| DistributedMatrix::zeros(w.descriptor()));
            let outcome = match (subgroup.active_comm(), working.active_mut(), vectors.active_mut()) {
                (Some(active), Some(w), Some(v)) => self.solve_active(active, w, v, &settings),
                _ => Ok(Vec::new()),
            };
            let mut values = agree(&comm, outcome)?;

            record.enter(DiagPhase::RedistributeOut);
            redistribute(&comm, vectors.as_ref(), Participant::Active(eigenvectors))?;
            comm.broadcast_f64(&mut values, subgroup.representative())?;
            *eigenvalues = values;
        } else {
            record.enter(DiagPhase::NoRedistribute);
            let mut working = matrix.clone();

            record.enter(DiagPhase::Solving);
            let outcome = self.solve_active(&comm, &mut working, eigenvectors, &settings);
            *eigenvalues = agree(&comm, outcome)?;

            record.enter(DiagPhase::RedistributeOut);
        }
        Ok(())
    }

    /// Solve on the active workers. Collective over `comm`.
    fn solve_active(
        &self,
        comm: &Communicator,
        working: &mut DistributedMatrix,
        vectors: &mut DistributedMatrix,
        settings: &SolveSettings<'_>,
    ) -> Result<Vec<f64>, DiagError> {
        let mut storage = settings.storage;
        if settings.backend.requires_full_storage() && storage == Storage::Upper {
            fill_lower_from_upper(working)?;
            storage = Storage::Full;
        }
        let request = SolveRequest {
            matrix: working,
            storage,
            neig: settings.neig,
            accelerate: settings.accelerate,
            check: self.config.check,
            check_tolerance: self.config.check_tolerance,
        };
        if !settings.verify {
            return settings.backend.solve(comm, &request, vectors);
        }

        // Reference run on an independent copy of the input.
        let reference_input = working.clone();
        let mut reference_vectors = DistributedMatrix::zeros(vectors.descriptor());
        let reference = settings.backend.solve(
            comm,
            &SolveRequest {
                matrix: &reference_input,
                accelerate: false,
                ..request
            },
            &mut reference_vectors,
        )?;
        let accelerated = settings.backend.solve(comm, &request, vectors)?;

        let tolerance = self.config.acceleration.tolerance;
        let deviation = max_deviation(&reference, &accelerated);
        log::debug!("accelerated kernel deviates by {deviation:.3e} from the reference");
        if deviation.is_nan() || deviation > tolerance {
            return Err(DiagError::AccelerationCorrectnessFailure {
                order: working.descriptor().global_rows(),
                workers: comm.size(),
                max_deviation: if deviation.is_finite() { deviation } else { f64::MAX },
                tolerance,
            });
        }
        Ok(accelerated)
    }
}

fn max_deviation(reference: &[f64], candidate: &[f64]) -> f64 {
    if reference.len() != candidate.len() {
        return f64::INFINITY;
    }
    reference
        .iter()
        .zip(candidate)
        .map(|(a, b)| (a - b).abs())
        .fold(0.0, |acc: f64, d| if acc.is_nan() || d.is_nan() { f64::NAN } else { acc.max(d) })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(unsafe_override: bool) -> AccelerationPolicy {
        AccelerationPolicy {
            enabled: true,
            unsafe_override,
            ..Default::default()
        }
    }

    #[test]
    fn test_odd_order_is_never_accelerated() {
        assert!(!use_acceleration(65, 64, &policy(false)));
        assert!(!use_acceleration(65, 64, &policy(true)));
    }

    #[test]
    fn test_size_preconditions() {
        assert!(use_acceleration(128, 64, &policy(false)));
        assert!(!use_acceleration(128, 32, &policy(false)));
        assert!(!use_acceleration(62, 64, &policy(false)));
        assert!(use_acceleration(4, 2, &policy(true)));
    }

    #[test]
    fn test_disabled_policy() {
        let off = AccelerationPolicy {
            unsafe_override: true,
            ..Default::default()
        };
        assert!(!use_acceleration(128, 64, &off));
    }

    #[test]
    fn test_max_deviation() {
        assert_eq!(max_deviation(&[1.0, 2.0], &[1.0, 2.5]), 0.5);
        assert_eq!(max_deviation(&[1.0], &[1.0, 2.0]), f64::INFINITY);
        assert!(max_deviation(&[1.0, 2.0], &[f64::NAN, 2.0]).is_nan());
    }
}
