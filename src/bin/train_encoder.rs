//! Phase 2: motion encoder training (InfoNCE contrastive learning).

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use calm_rl::config::{CalmConfig, Device};
use calm_rl::encoder::EncoderTrainer;
use calm_rl::motion::{load_motion_directory, standing_clip};

#[derive(Parser)]
#[command(name = "train-encoder", about = "Train the motion encoder (contrastive)")]
struct Args {
    /// Phase-1 checkpoint (accepted for pipeline symmetry; the encoder
    /// trains from motion data alone).
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
        config.encoder_training.num_iterations = iterations;
    }
    if let Some(device) = args.device {
        config.device = device;
    }
    config.validate()?;
    let _ = config.device.resolve();

    let loaded = load_motion_directory(&args.motions, 20);
    let clips: Vec<_> = if loaded.is_empty() {
        log::info!("no motion data found, using the standing clip");
        vec![standing_clip(20)]
    } else {
        log::info!("loaded {} motion clips", loaded.len());
        loaded.into_values().collect()
    };

    let mut trainer = EncoderTrainer::new(config, &clips);
    trainer.train()
}
