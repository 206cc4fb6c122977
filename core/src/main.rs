//! PFLOC: closed-loop landmark localization with a particle filter.
//!
//! A run reads a landmark map, a per-cycle control log and per-cycle vehicle-frame landmark
//! detections from CSV, drives the particle filter through every cycle and writes the estimated
//! pose of each cycle to CSV. When ground truth is supplied the per-cycle errors are written too
//! and a summary is logged.
//!
//! You can configure a run either by:
//!   1. Loading all parameters from a configuration file (TOML/JSON/YAML) with `--config`
//!   2. Specifying parameters via the `run` subcommand

use clap::{Args, Parser, Subcommand};
use log::{LevelFilter, error, info};
use std::error::Error;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use pfloc::config::{ConfigFile, FilterConfig, SimulationConfig};
use pfloc::sim::{self, ErrorSummary};
use pfloc::{EstimateStrategy, FilterError, Pose, ResamplingStrategy};

const LONG_ABOUT: &str = "PFLOC: closed-loop landmark localization with a particle filter.

Each cycle predicts every particle forward with a velocity/yaw-rate motion model, weights the
particles by how well their view of the landmark map explains the vehicle's detections, and
resamples. The estimate of each cycle is written to the output CSV.

Input files (CSV with a header row):
  map           id,x,y
  control       velocity,yaw_rate     (one row per cycle)
  observations  step,x,y              (vehicle frame, grouped by cycle)
  ground truth  x,y,theta             (optional, one row per cycle)

You can run either by:
  1. Loading all parameters from a configuration file (TOML/JSON/YAML) with --config
  2. Specifying parameters via the run subcommand";

/// Command line arguments
#[derive(Parser)]
#[command(author, version, about = "Closed-loop landmark localization with a particle filter.", long_about = LONG_ABOUT)]
struct Cli {
    /// Run from a configuration file (TOML/JSON/YAML)
    /// This option overrides any subcommand arguments
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Command to execute (ignored if --config is provided)
    #[command(subcommand)]
    command: Option<Command>,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: LevelFilter,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

/// Top-level commands
#[derive(Subcommand, Clone)]
enum Command {
    #[command(
        name = "run",
        about = "Run the particle filter over a recorded dataset",
        long_about = "Run the particle filter over a recorded dataset. The filter is initialized around the given initial pose (or the first ground truth row), then predicts, weights and resamples once per control row."
    )]
    Run(RunArgs),

    #[command(
        name = "init-config",
        about = "Write a template configuration file",
        long_about = "Write a configuration file holding every default value. The format (TOML/JSON/YAML) follows the file extension."
    )]
    InitConfig(InitConfigArgs),
}

/// Dataset, output and filter arguments for a single run
#[derive(Args, Clone, Debug)]
struct RunArgs {
    /// Landmark map CSV (id,x,y)
    #[arg(long, value_parser)]
    map: PathBuf,

    /// Control CSV (velocity,yaw_rate)
    #[arg(long, value_parser)]
    control: PathBuf,

    /// Observation CSV (step,x,y)
    #[arg(long, value_parser)]
    observations: PathBuf,

    /// Ground truth CSV (x,y,theta)
    #[arg(long, value_parser)]
    ground_truth: Option<PathBuf>,

    /// Output CSV for the per-cycle estimates
    #[arg(short, long, value_parser)]
    output: PathBuf,

    /// Append every particle pose to this file on each cycle
    #[arg(long, value_parser)]
    trace: Option<PathBuf>,

    /// Number of particles
    #[arg(long, default_value_t = 100)]
    particles: usize,

    /// RNG seed; omit to seed from system entropy
    #[arg(long)]
    seed: Option<u64>,

    /// Time between cycles (s)
    #[arg(long, default_value_t = 0.1)]
    delta_t: f64,

    /// Initial pose as x,y,theta (defaults to the first ground truth row)
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
    initial_pose: Option<Vec<f64>>,

    /// Only associate with landmarks within this range of a particle (m)
    #[arg(long)]
    sensor_range: Option<f64>,

    /// Resampling scheme
    #[arg(long, value_enum, default_value_t = ResamplingStrategy::Systematic)]
    resampling: ResamplingStrategy,

    /// Use the highest-weight particle as the estimate instead of the weighted mean
    #[arg(long)]
    highest_weight: bool,

    /// Resample when the effective sample size falls below this fraction of the particle count
    #[arg(long, default_value_t = 1.0)]
    resample_threshold: f64,
}

#[derive(Args, Clone, Debug)]
struct InitConfigArgs {
    /// Path of the configuration file to write (.toml, .json, .yaml or .yml)
    output: PathBuf,
}

impl RunArgs {
    fn into_config(self) -> Result<SimulationConfig, Box<dyn Error>> {
        let initial_pose = match self.initial_pose.as_deref() {
            Some([x, y, theta]) => Some(Pose::new(*x, *y, *theta)),
            Some(values) => {
                return Err(format!(
                    "--initial-pose expects x,y,theta but got {} values",
                    values.len()
                )
                .into());
            }
            None => None,
        };
        let estimate = if self.highest_weight {
            EstimateStrategy::HighestWeight
        } else {
            EstimateStrategy::WeightedMean
        };
        Ok(SimulationConfig {
            map: self.map,
            control: self.control,
            observations: self.observations,
            ground_truth: self.ground_truth,
            output: Some(self.output),
            trace: self.trace,
            delta_t: self.delta_t,
            initial_pose,
            filter: FilterConfig {
                num_particles: self.particles,
                seed: self.seed,
                sensor_range: self.sensor_range,
                resampling: self.resampling,
                estimate,
                resample_threshold: self.resample_threshold,
                ..Default::default()
            },
        })
    }
}

/// Route `log` records to stderr, or append them to `log_file` when one is given.
///
/// Each line carries a local timestamp, the level and the emitting module, e.g.
/// `2025-01-01 12:00:00.000 [INFO] pfloc::sim - 300 cycles: ...`.
fn init_logger(level: LevelFilter, log_file: Option<&Path>) -> pfloc::Result<()> {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level).format(|buf, record| {
        writeln!(
            buf,
            "{} [{}] {} - {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.target(),
            record.args()
        )
    });

    if let Some(path) = log_file {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder
        .try_init()
        .map_err(|e| FilterError::Config(format!("cannot install logger: {e}")))
}

fn run(config: &SimulationConfig) -> Result<(), Box<dyn Error>> {
    info!(
        "running {} particles over {}",
        config.filter.num_particles,
        config.control.display()
    );
    let results = sim::run_from_config(config).inspect_err(|e| error!("run failed: {e}"))?;
    match ErrorSummary::from_results(&results) {
        Some(summary) => println!(
            "{} cycles: mean position error {:.3} m, max {:.3} m, RMSE (x, y, theta) = ({:.3}, {:.3}, {:.4})",
            summary.cycles,
            summary.mean_position_error,
            summary.max_position_error,
            summary.rmse_x,
            summary.rmse_y,
            summary.rmse_theta
        ),
        None => {
            if let Some(last) = results.last() {
                println!("{} cycles: final estimate {}", results.len(), last.estimate());
            }
        }
    }
    Ok(())
}

fn init_config(args: &InitConfigArgs) -> Result<(), Box<dyn Error>> {
    let config = SimulationConfig {
        map: PathBuf::from("data/map.csv"),
        control: PathBuf::from("data/control.csv"),
        observations: PathBuf::from("data/observations.csv"),
        ground_truth: Some(PathBuf::from("data/ground_truth.csv")),
        output: Some(PathBuf::from("results/estimate.csv")),
        ..Default::default()
    };
    config.to_file(&args.output)?;
    info!("wrote template configuration to {}", args.output.display());
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logger(cli.log_level, cli.log_file.as_deref())?;

    if let Some(ref config_path) = cli.config {
        let config = SimulationConfig::load(config_path)?;
        return run(&config);
    }

    match cli.command {
        Some(Command::Run(args)) => {
            let config = args.into_config()?;
            config.validate()?;
            run(&config)
        }
        Some(Command::InitConfig(args)) => init_config(&args),
        None => {
            eprintln!("Error: No command provided. Use -h or --help for usage information.");
            std::process::exit(1);
        }
    }
}
