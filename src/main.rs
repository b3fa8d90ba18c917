use std::error::Error as _;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use labeling_line::config::{LineConfig, ParameterOverrides};
use labeling_line::error::LineError;
use labeling_line::sim::{self, FAILURE_PROBABILITIES, SweepPlan};
use labeling_line::{logging, report};

/// Labeling line simulator: robot workers claim items from passing batches.
#[derive(Parser, Debug)]
#[command(name = "labeling_line", version, long_about = None)]
struct Cli {
    /// TOML file with `[line]` and `[run]` tables
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the line once and print a summary (default)
    Run {
        #[command(flatten)]
        line: LineArgs,

        /// Print the full report as JSON
        #[arg(long, default_value_t = false)]
        json: bool,

        /// Add one line per retired batch to the summary
        #[arg(long, default_value_t = false)]
        per_batch: bool,
    },
    /// Repeated runs over varied configurations, printed as CSV
    Sweep {
        #[command(subcommand)]
        kind: SweepKind,
    },
}

#[derive(Subcommand, Debug)]
enum SweepKind {
    /// Efficiency by primary count with no standbys
    Workers {
        #[command(flatten)]
        line: LineArgs,

        /// Repetitions per configuration
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    /// Primaries and standbys needed per failure probability
    Failures {
        #[command(flatten)]
        line: LineArgs,

        /// Repetitions per configuration
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

/// Line parameters; anything omitted falls back to the config file, then
/// to built-in defaults.
#[derive(Args, Debug, Default)]
struct LineArgs {
    /// Batches to feed
    #[arg(short, long)]
    batches: Option<usize>,

    /// Conveyor speed in cm/s
    #[arg(long)]
    line_speed: Option<f64>,

    /// Side of one batch in cm
    #[arg(long)]
    batch_size: Option<f64>,

    /// Line length in cm
    #[arg(long)]
    line_length: Option<f64>,

    #[arg(long)]
    min_items: Option<usize>,

    #[arg(long)]
    max_items: Option<usize>,

    /// Per-cycle failure probability of each primary
    #[arg(long)]
    failure_probability: Option<f64>,

    /// Worker reach speed in cm/s
    #[arg(long)]
    worker_speed: Option<f64>,

    /// Distance between stations in cm
    #[arg(long)]
    worker_spacing: Option<f64>,

    /// Gap between batches in cm
    #[arg(long)]
    batch_spacing: Option<f64>,

    #[arg(short, long)]
    primaries: Option<usize>,

    #[arg(short, long)]
    standbys: Option<usize>,

    /// Wall-clock seconds per simulated second
    #[arg(long)]
    time_scale: Option<f64>,

    #[arg(long)]
    seed: Option<u64>,

    /// Enable or disable primaries per batch from the sizing estimate
    #[arg(long, default_value_t = false)]
    demand_scaling: bool,
}

impl LineArgs {
    fn overrides(&self) -> ParameterOverrides {
        ParameterOverrides {
            line_speed: self.line_speed,
            batch_size: self.batch_size,
            line_length: self.line_length,
            min_items: self.min_items,
            max_items: self.max_items,
            failure_probability: self.failure_probability,
            worker_speed: self.worker_speed,
            worker_spacing: self.worker_spacing,
            batch_spacing: self.batch_spacing,
            primary_workers: self.primaries,
            standby_workers: self.standbys,
            time_scale: self.time_scale,
            seed: self.seed,
            demand_scaling: self.demand_scaling.then_some(true),
        }
    }

    fn load(&self, config: Option<&PathBuf>) -> Result<LineConfig, LineError> {
        LineConfig::load(config.map(PathBuf::as_path), self.overrides(), self.batches)
    }
}

fn install_cancel_handler() -> Arc<AtomicBool> {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    if let Err(err) = ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %err, "ctrl-c handler unavailable; runs cannot be interrupted");
    }
    cancel
}

fn sweep_plan(config: &LineConfig, runs: usize, cancel: Arc<AtomicBool>) -> SweepPlan {
    SweepPlan {
        base: config.overrides.clone(),
        batches: config.batches,
        runs,
        cancel,
    }
}

fn execute(cli: Cli) -> Result<(), LineError> {
    let cancel = install_cancel_handler();
    let command = cli.command.unwrap_or(Command::Run {
        line: LineArgs::default(),
        json: false,
        per_batch: false,
    });
    match command {
        Command::Run {
            line,
            json,
            per_batch,
        } => {
            let config = line.load(cli.config.as_ref())?;
            info!(
                primaries = config.params.primary_workers,
                standbys = config.params.standby_workers,
                batches = config.batches,
                "starting run"
            );
            let report = sim::run_demo(&config, cancel)?;
            if json {
                println!("{}", report::json(&report)?);
            } else {
                print!("{}", report::summary(&report, per_batch));
            }
        }
        Command::Sweep {
            kind: SweepKind::Workers { line, runs },
        } => {
            let config = line.load(cli.config.as_ref())?;
            let rows = sim::sweep_workers(&sweep_plan(&config, runs, cancel))?;
            print!("{}", report::worker_sweep_csv(&rows));
        }
        Command::Sweep {
            kind: SweepKind::Failures { line, runs },
        } => {
            let config = line.load(cli.config.as_ref())?;
            let rows =
                sim::sweep_failures(&sweep_plan(&config, runs, cancel), &FAILURE_PROBABILITIES)?;
            print!("{}", report::failure_sweep_csv(&rows));
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match execute(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let mut message = err.to_string();
            let mut source = err.source();
            while let Some(cause) = source {
                message.push_str(": ");
                message.push_str(&cause.to_string());
                source = cause.source();
            }
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
    }
}
