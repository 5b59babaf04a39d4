//! Tessera command-line interface.
//!
//! Run eigensolver jobs from TOML configuration files:
//! ```sh
//! tessera run job.toml
//! tessera validate job.toml
//! tessera plan --order 4096 --workers 64 --backend panel
//! ```

mod config;
mod runner;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tessera_core::{BackendKind, PlannerPolicy};

#[derive(Parser)]
#[command(name = "tessera")]
#[command(about = "Tessera: distributed block-cyclic symmetric eigensolver")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Diagonalise a test matrix described by a TOML configuration file.
    Run {
        /// Path to the job configuration file.
        config: PathBuf,
        /// Output directory (overrides config file setting).
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate a configuration file without running the job.
    Validate {
        /// Path to the job configuration file.
        config: PathBuf,
    },
    /// Show the redistribution plan for a matrix without solving it.
    Plan {
        /// Matrix order.
        #[arg(long)]
        order: usize,
        /// Workers holding the matrix before planning.
        #[arg(long)]
        workers: usize,
        /// Backend to plan for (`general` or `panel`).
        #[arg(long, default_value = "general")]
        backend: BackendKind,
        /// Requested block size.
        #[arg(long, default_value_t = 32)]
        block: usize,
        /// Planner granularity constant.
        #[arg(long, default_value_t = 4)]
        a: usize,
        /// Planner rows-per-worker constant.
        #[arg(long, default_value_t = 60)]
        x: usize,
        /// Prefer the heuristic count over the empty-column maximum.
        #[arg(long)]
        force_heuristic: bool,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, output } => {
            println!("Tessera Eigensolver");
            println!("===================");
            let job = config::load_config(&config)?;
            println!("Configuration: {}", config.display());

            let result = runner::run_job(&job)?;

            let out_dir = output.unwrap_or_else(|| PathBuf::from(&job.output.directory));

            if job.output.save_csv {
                runner::write_eigenvalues_csv(&result, &out_dir.join("eigenvalues.csv"))?;
            }
            if job.output.save_json {
                runner::write_eigenvalues_json(&result, &out_dir.join("eigenvalues.json"))?;
            }

            println!("Diagonalisation complete.");
            Ok(())
        }
        Commands::Validate { config } => {
            let _job = config::load_config(&config)?;
            println!("Configuration is valid: {}", config.display());
            Ok(())
        }
        Commands::Plan {
            order,
            workers,
            backend,
            block,
            a,
            x,
            force_heuristic,
        } => {
            let policy = PlannerPolicy { a, x, force_heuristic };
            let plan = runner::plan_only(order, workers, backend, block, policy)?;
            println!("{plan}");
            println!("{}", serde_json::to_string_pretty(&plan)?);
            Ok(())
        }
    }
}
