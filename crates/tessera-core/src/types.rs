//! Request options, results and diagnostics of a diagonalisation.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::matrix::DistributedMatrix;
use crate::planner::RedistributionPlan;

/// Which triangle of the input matrix carries valid data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Storage {
    /// Only the upper triangle (including the diagonal) is meaningful.
    Upper,
    /// Both triangles are stored.
    #[default]
    Full,
}

/// Per-call options of [`EigensolverDispatcher::diagonalize`](crate::diag::EigensolverDispatcher::diagonalize).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DiagOptions {
    #[serde(default)]
    pub storage: Storage,
    /// Number of lowest eigenpairs wanted; `None` means all.
    #[serde(default)]
    pub neig: Option<usize>,
}

/// Stage of a diagonalisation, in the order they are entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagPhase {
    Planning,
    RedistributeIn,
    NoRedistribute,
    Solving,
    RedistributeOut,
    Done,
    Failed,
}

impl fmt::Display for DiagPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DiagPhase::Planning => "planning",
            DiagPhase::RedistributeIn => "redistribute-in",
            DiagPhase::NoRedistribute => "no-redistribute",
            DiagPhase::Solving => "solving",
            DiagPhase::RedistributeOut => "redistribute-out",
            DiagPhase::Done => "done",
            DiagPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What a diagonalisation did, identical on every rank.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticRecord {
    pub order: usize,
    pub neig: usize,
    pub backend: String,
    /// The configured backend was replaced by the general one because too
    /// few eigenvectors were requested.
    pub fallback_used: bool,
    pub plan: Option<RedistributionPlan>,
    pub acceleration_used: bool,
    pub acceleration_verified: bool,
    pub phases: Vec<DiagPhase>,
}

impl DiagnosticRecord {
    pub fn new(order: usize) -> Self {
        Self {
            order,
            neig: order,
            backend: String::new(),
            fallback_used: false,
            plan: None,
            acceleration_used: false,
            acceleration_verified: false,
            phases: Vec::new(),
        }
    }

    pub(crate) fn enter(&mut self, phase: DiagPhase) {
        log::debug!("diagonalisation of order {}: {phase}", self.order);
        self.phases.push(phase);
    }

    pub fn phase(&self) -> Option<DiagPhase> {
        self.phases.last().copied()
    }

    pub fn redistributed(&self) -> bool {
        self.plan.as_ref().is_some_and(|plan| plan.should_redistribute)
    }
}

impl fmt::Display for DiagnosticRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "order {} ({} eigenpairs), backend {}", self.order, self.neig, self.backend)?;
        if self.fallback_used {
            writeln!(f, "  small request: fell back to the general backend")?;
        }
        if let Some(plan) = &self.plan {
            writeln!(f, "  {plan}")?;
        }
        if self.acceleration_used {
            let verified = if self.acceleration_verified { ", verified" } else { "" };
            writeln!(f, "  accelerated kernel{verified}")?;
        }
        let trail: Vec<String> = self.phases.iter().map(DiagPhase::to_string).collect();
        write!(f, "  phases: {}", trail.join(" -> "))
    }
}

/// Eigenpairs returned by [`EigensolverDispatcher::solve`](crate::diag::EigensolverDispatcher::solve).
#[derive(Debug, Clone)]
pub struct EigenResult {
    /// Ascending, identical on every rank.
    pub eigenvalues: Vec<f64>,
    /// Eigenvectors as columns, in the input matrix's layout.
    pub eigenvectors: DistributedMatrix,
    pub record: DiagnosticRecord,
}
