//! ftcbf: fault-tolerant certificate-filtered control loop.
//!
//! CLI entry point. Runs rollouts of the reference system against
//! certificate and identifier artifacts loaded from disk.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use ftcbf::certificate::validation::{classification_accuracy, ValidationConfig};
use ftcbf::certificate::CertificateVariant;
use ftcbf::config::LoopConfig;
use ftcbf::dynamics::reference::DecoupledLift;
use ftcbf::dynamics::DynamicsProvider;
use ftcbf::runtime::{
    load_components, run_rollout, ArtifactSources, FaultInjection, FaultMode, RolloutSpec,
};

#[derive(Parser, Debug)]
#[command(
    name = "ftcbf",
    about = "ftcbf: certificate-filtered control with actuator fault identification",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one closed-loop rollout and print its summary as JSON.
    Simulate(SimulateArgs),
    /// Check certificate sign agreement on sampled safe and unsafe states.
    Validate(ValidateArgs),
    /// Write the default loop configuration as JSON.
    WriteConfig {
        #[arg(short, long, default_value = "ftcbf.json")]
        out: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
struct SystemArgs {
    /// Artifact directories, searched in order.
    #[arg(short, long = "artifacts", default_value = "./artifacts", num_args = 1..)]
    artifact_dirs: Vec<PathBuf>,

    /// Number of actuation channels of the reference system.
    #[arg(long, default_value_t = 4)]
    channels: usize,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FaultKind {
    Zero,
    Stuck,
    Scaled,
}

#[derive(clap::Args, Debug)]
struct SimulateArgs {
    #[command(flatten)]
    system: SystemArgs,

    /// Loop configuration (JSON). Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short = 'n', long, default_value_t = 1500)]
    ticks: u64,

    /// Channel to fail.
    #[arg(long)]
    fault_channel: Option<usize>,

    #[arg(long, default_value_t = 500)]
    fault_start: u64,

    /// Exclusive end tick; the fault persists when omitted.
    #[arg(long)]
    fault_end: Option<u64>,

    #[arg(long, value_enum, default_value_t = FaultKind::Zero)]
    fault_mode: FaultKind,

    /// Stuck value or scale factor.
    #[arg(long, default_value_t = 0.0)]
    fault_value: f64,

    /// Sensor noise standard deviation.
    #[arg(long, default_value_t = 0.0)]
    noise: f64,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Also write the per-tick trace to this file.
    #[arg(long)]
    trace: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
struct ValidateArgs {
    #[command(flatten)]
    system: SystemArgs,

    #[arg(long, default_value_t = ftcbf::defaults::VALIDATION_SAMPLES)]
    samples: usize,

    #[arg(long, default_value_t = 0)]
    seed: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    tracing::info!("ftcbf v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Simulate(args) => simulate(args),
        Command::Validate(args) => validate(args),
        Command::WriteConfig { out } => LoopConfig::default()
            .save_json(&out)
            .with_context(|| format!("writing default config to {}", out.display())),
    }
}

fn reference_system(args: &SystemArgs) -> Result<Arc<DecoupledLift>> {
    if args.channels == 0 {
        bail!("--channels must be positive");
    }
    Ok(Arc::new(DecoupledLift::new(args.channels)))
}

fn simulate(args: SimulateArgs) -> Result<()> {
    let system = reference_system(&args.system)?;
    let config = match &args.config {
        Some(path) => LoopConfig::from_json_file(path)?,
        None => LoopConfig::default(),
    };

    let sources = ArtifactSources::from_dirs(&args.system.artifact_dirs);
    let components =
        load_components(&sources, system.as_ref()).context("loading loop artifacts")?;

    let faults = match args.fault_channel {
        Some(channel) => vec![FaultInjection {
            channel,
            start_tick: args.fault_start,
            end_tick: args.fault_end,
            mode: match args.fault_mode {
                FaultKind::Zero => FaultMode::Zero,
                FaultKind::Stuck => FaultMode::Stuck {
                    value: args.fault_value,
                },
                FaultKind::Scaled => FaultMode::Scaled {
                    factor: args.fault_value,
                },
            },
        }],
        None => Vec::new(),
    };

    let spec = RolloutSpec {
        initial_state: system.goal_state().to_vec(),
        ticks: args.ticks,
        faults,
        noise_std: args.noise,
        seed: args.seed,
        record_trace: args.trace.is_some(),
    };
    let dynamics: Arc<dyn DynamicsProvider> = system;
    let rollout = run_rollout(&config, dynamics, &components, &spec).context("running rollout")?;

    if let Some(path) = &args.trace {
        let text = serde_json::to_string(&rollout.trace)?;
        std::fs::write(path, text).with_context(|| format!("writing trace to {}", path.display()))?;
    }
    println!("{}", serde_json::to_string_pretty(&rollout.summary)?);
    Ok(())
}

fn validate(args: ValidateArgs) -> Result<()> {
    let system = reference_system(&args.system)?;
    let sources = ArtifactSources::from_dirs(&args.system.artifact_dirs);
    let components =
        load_components(&sources, system.as_ref()).context("loading loop artifacts")?;

    let config = ValidationConfig {
        samples_per_region: args.samples,
        seed: args.seed,
        ..ValidationConfig::default()
    };
    let mut reports = serde_json::Map::new();
    for variant in [CertificateVariant::Nominal, CertificateVariant::FaultTolerant] {
        let oracle = components.certificates.get(variant);
        let report = classification_accuracy(oracle, system.as_ref(), &config)
            .with_context(|| format!("validating {} certificate", oracle.name()))?;
        reports.insert(oracle.name().to_string(), serde_json::to_value(&report)?);
    }
    println!("{}", serde_json::to_string_pretty(&reports)?);
    Ok(())
}
