//! Job runner: builds the test matrix on a simulated cluster and calls the
//! dispatcher on every rank.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use tessera_compute::LocalCluster;
use tessera_core::planner::{self, PlanInput, RedistributionPlan};
use tessera_core::{
    BackendKind, DiagConfig, DiagOptions, DiagnosticRecord, DistributedMatrix,
    DistributionDescriptor, EigensolverDispatcher, GridShape, PlannerPolicy, ProcessGrid,
};

use crate::config::JobConfig;

/// Results of a job, as seen by rank 0.
#[derive(Debug, Serialize)]
pub struct RunOutput {
    pub order: usize,
    pub workers: usize,
    pub eigenvalues: Vec<f64>,
    /// Closed-form eigenvalues of the test matrix, where known.
    pub reference: Option<Vec<f64>>,
    pub max_error: Option<f64>,
    pub record: DiagnosticRecord,
}

/// Run a job from a parsed configuration.
pub fn run_job(job: &JobConfig) -> Result<RunOutput> {
    let order = job.matrix.order;
    let workers = job.cluster.workers;
    let kind = job.matrix.kind;
    let options = DiagOptions {
        storage: job.matrix.storage,
        neig: job.matrix.neig,
    };
    println!("Matrix: {kind:?}, order {order}, {workers} workers");
    println!("Backend: {}", job.diag.backend);

    let results = LocalCluster::new(workers).run(|comm| {
        let grid = ProcessGrid::create(&comm, job.cluster.grid_shape)?;
        let desc = DistributionDescriptor::create(&grid, job.diag.descriptor_options(order, order))?;
        let matrix = DistributedMatrix::from_global_fn(&desc, |i, j| kind.entry(order, i, j));
        EigensolverDispatcher::new(job.diag.clone()).solve(&matrix, &options)
    });
    let result = results
        .into_iter()
        .next()
        .context("cluster returned no results")?
        .context("diagonalisation failed")?;
    log::info!("rank 0 returned {} eigenvalues", result.eigenvalues.len());

    let reference = kind
        .exact_spectrum(order)
        .map(|spectrum| spectrum[..result.eigenvalues.len()].to_vec());
    let max_error = reference.as_ref().map(|reference| {
        reference
            .iter()
            .zip(&result.eigenvalues)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max)
    });

    println!("{}", result.record);
    println!("Lowest eigenvalues:");
    for (k, value) in result.eigenvalues.iter().take(10).enumerate() {
        println!("  λ[{k}] = {value:.12}");
    }
    if let Some(err) = max_error {
        println!("Max |λ - λ_exact| = {err:.3e}");
    }

    Ok(RunOutput {
        order,
        workers,
        eigenvalues: result.eigenvalues,
        reference,
        max_error,
        record: result.record,
    })
}

/// Plan a diagonalisation without running it.
///
/// Lays out an `order x order` matrix on a square grid of `workers` ranks,
/// exactly as a job would, and plans from that layout.
pub fn plan_only(
    order: usize,
    workers: usize,
    backend: BackendKind,
    block: usize,
    policy: PlannerPolicy,
) -> Result<RedistributionPlan> {
    anyhow::ensure!(order >= 1, "order must be at least 1");
    anyhow::ensure!(workers >= 1, "workers must be at least 1");
    let config = DiagConfig {
        backend,
        block_size: block,
        planner: policy,
        ..Default::default()
    };
    let strict = config.backend.create().requires_no_empty_column();

    let plans = LocalCluster::new(workers).run(|comm| {
        let grid = ProcessGrid::create(&comm, GridShape::Square)?;
        let desc = DistributionDescriptor::create(&grid, config.descriptor_options(order, order))?;
        planner::plan(&PlanInput::from_descriptor(&desc), &config.planner, strict)
    });
    let plan = plans
        .into_iter()
        .next()
        .context("cluster returned no results")?
        .context("planning failed")?;
    log::debug!("plan for order {order} on {workers} workers: {plan}");
    Ok(plan)
}

/// Write eigenvalues (and reference values, if known) as CSV.
pub fn write_eigenvalues_csv(output: &RunOutput, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;

    match &output.reference {
        Some(reference) => {
            writeln!(file, "index,eigenvalue,reference,abs_error")?;
            for (k, (value, exact)) in output.eigenvalues.iter().zip(reference).enumerate() {
                writeln!(file, "{k},{value:.16e},{exact:.16e},{:.3e}", (value - exact).abs())?;
            }
        }
        None => {
            writeln!(file, "index,eigenvalue")?;
            for (k, value) in output.eigenvalues.iter().enumerate() {
                writeln!(file, "{k},{value:.16e}")?;
            }
        }
    }

    println!("Eigenvalues written to: {}", path.display());
    Ok(())
}

/// Write eigenvalues and the diagnostic record as JSON.
pub fn write_eigenvalues_json(output: &RunOutput, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(output).context("Failed to serialise eigenvalues")?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Eigenvalues (JSON) written to: {}", path.display());
    Ok(())
}
