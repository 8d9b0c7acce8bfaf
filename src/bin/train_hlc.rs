//! Phase 3: HLC training (task PPO against a frozen LLC).

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use calm_rl::config::{CalmConfig, Device};
use calm_rl::env::Task;
use calm_rl::metrics::{ConsoleLogger, CsvLogger, MultiLogger};
use calm_rl::trainer::HlcTrainer;

#[derive(Parser)]
#[command(name = "train-hlc", about = "Train a task-specific high-level controller")]
struct Args {
    /// Task to train (heading|location|strike).
    #[arg(long)]
    task: Task,
    /// Phase-1 checkpoint providing the frozen LLC.
    #[arg(long)]
    llc_checkpoint: Option<PathBuf>,
    /// JSON config override file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Output directory for checkpoints and exported weights.
    #[arg(long, default_value = "checkpoints/calm")]
    output: PathBuf,
    /// Motion capture data directory.
    #[arg(long, default_value = "data/calm/motions")]
    motions: PathBuf,
    /// Training iteration count override.
    #[arg(long)]
    iterations: Option<usize>,
    /// Parallel environment count override.
    #[arg(long)]
    num_envs: Option<usize>,
    /// Compute backend (auto|cpu).
    #[arg(long)]
    device: Option<Device>,
    /// Random seed.
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = CalmConfig::new();
    config.output_dir = args.output.to_string_lossy().to_string();
    config.motion_dir = args.motions.to_string_lossy().to_string();
    config.seed = args.seed;

    if let Some(path) = &args.config {
        let overrides = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        config = config
            .merge_json(&overrides)
            .with_context(|| format!("parsing config file {}", path.display()))?;
    }
    if let Some(iterations) = args.iterations {
        config.ppo.num_iterations = iterations;
    }
    if let Some(num_envs) = args.num_envs {
        config = config.with_num_envs(num_envs);
        config.max_envs = num_envs;
    }
    if let Some(device) = args.device {
        config.device = device;
    }

    let csv_path = args.output.join(format!("hlc_{}_metrics.csv", args.task.name()));
    std::fs::create_dir_all(&args.output)?;
    let mut logger = MultiLogger::new()
        .add(ConsoleLogger::new(config.ppo.log_interval))
        .add(CsvLogger::new(&csv_path).context("creating metrics CSV")?);

    let mut trainer = HlcTrainer::new(config, args.task).context("constructing HLC trainer")?;
    if let Some(path) = &args.llc_checkpoint {
        trainer.load_llc_checkpoint(path)?;
    }
    let result = trainer.train(&mut logger);
    trainer.close();
    result
}
