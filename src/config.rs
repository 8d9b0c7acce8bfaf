//! Training configuration.
//!
//! Composition of per-subsystem config structs under [`CalmConfig`], with
//! builder-style setters and validation. Binaries can merge a JSON override
//! file on top of the defaults before calling [`CalmConfig::validate`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Configuration validation error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// A count parameter must be positive.
    #[error("{field} must be > 0, got {value}")]
    InvalidCount { field: &'static str, value: usize },
    /// A parameter is outside its valid range.
    #[error("{field} must be in [{min}, {max}], got {value}")]
    OutOfRange {
        field: &'static str,
        value: f32,
        min: f32,
        max: f32,
    },
    /// Minibatch configuration is inconsistent with the rollout size.
    #[error("rollout of {transitions} transitions cannot fill a minibatch of {minibatch_size}")]
    InvalidMinibatch {
        transitions: usize,
        minibatch_size: usize,
    },
}

/// Compute backend for the numeric core.
///
/// Resolved once at startup and passed into constructors; there is no
/// process-global backend state. Only the CPU backend is implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    /// Pick the best available backend.
    #[default]
    Auto,
    /// Plain CPU execution.
    Cpu,
}

impl Device {
    /// Resolve `Auto` to a concrete backend.
    pub fn resolve(self) -> Device {
        match self {
            Device::Auto | Device::Cpu => Device::Cpu,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Auto => write!(f, "auto"),
            Device::Cpu => write!(f, "cpu"),
        }
    }
}

impl std::str::FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Device::Auto),
            "cpu" => Ok(Device::Cpu),
            other => Err(format!("unknown device '{other}' (expected auto|cpu)")),
        }
    }
}

/// Humanoid skeleton and observation layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HumanoidConfig {
    /// Degrees of freedom in the action/DOF vector.
    pub num_dof: usize,
    /// Tracked key bodies (head, hands, feet).
    pub num_key_bodies: usize,
    /// Scalars per extracted frame.
    pub per_frame_obs_dim: usize,
    /// Frames stacked for the policy observation.
    pub num_policy_obs_steps: usize,
    /// Frames stacked for the encoder observation.
    pub num_encoder_obs_steps: usize,
    /// Dimensionality of the style/intent latent code.
    pub latent_dim: usize,
}

impl Default for HumanoidConfig {
    fn default() -> Self {
        Self {
            num_dof: 37,
            num_key_bodies: 5,
            per_frame_obs_dim: 102,
            num_policy_obs_steps: 2,
            num_encoder_obs_steps: 10,
            latent_dim: 64,
        }
    }
}

impl HumanoidConfig {
    /// Stacked policy observation size.
    pub fn policy_obs_dim(&self) -> usize {
        self.per_frame_obs_dim * self.num_policy_obs_steps
    }

    /// Stacked encoder observation size.
    pub fn encoder_obs_dim(&self) -> usize {
        self.per_frame_obs_dim * self.num_encoder_obs_steps
    }
}

/// LLC policy architecture: style MLP + main MLP + mu head.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlcPolicyConfig {
    /// Style MLP hidden sizes (latent -> style embedding, tanh throughout).
    pub style_hidden: Vec<usize>,
    /// Style embedding size.
    pub style_out: usize,
    /// Main MLP hidden sizes (concat(style, obs) -> hidden, relu).
    pub main_hidden: Vec<usize>,
    /// Initial per-dimension log standard deviation.
    pub log_std_init: f32,
}

impl Default for LlcPolicyConfig {
    fn default() -> Self {
        Self {
            style_hidden: vec![256, 128],
            style_out: 64,
            main_hidden: vec![1024, 512],
            log_std_init: -1.0,
        }
    }
}

/// Value network architecture.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValueConfig {
    /// Hidden layer sizes (relu).
    pub hidden: Vec<usize>,
}

impl Default for ValueConfig {
    fn default() -> Self {
        Self {
            hidden: vec![1024, 512, 256],
        }
    }
}

/// AMP discriminator architecture and training parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AmpConfig {
    /// Hidden layer sizes (relu).
    pub hidden: Vec<usize>,
    /// Discriminator learning rate.
    pub learning_rate: f32,
    /// Gradient penalty weight (WGAN-GP lambda).
    pub grad_penalty_weight: f32,
    /// Weight of the style reward in the combined reward.
    pub style_reward_weight: f32,
    /// Weight of the task reward in the combined reward.
    pub task_reward_weight: f32,
    /// Replay pool capacity for policy-generated transition pairs.
    pub replay_capacity: usize,
}

impl Default for AmpConfig {
    fn default() -> Self {
        Self {
            hidden: vec![1024, 512],
            learning_rate: 1e-4,
            grad_penalty_weight: 10.0,
            style_reward_weight: 0.5,
            task_reward_weight: 0.5,
            replay_capacity: 100_000,
        }
    }
}

/// Motion encoder architecture.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Hidden layer sizes (relu).
    pub hidden: Vec<usize>,
    /// Latent output size.
    pub output_dim: usize,
    /// L2-normalize the output embedding.
    pub normalize_output: bool,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            hidden: vec![1024, 512],
            output_dim: 64,
            normalize_output: true,
        }
    }
}

/// Contrastive encoder training parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderTrainingConfig {
    pub learning_rate: f32,
    /// Frame-offset window for positive pairs within the same clip.
    pub positive_window: usize,
    /// Negatives drawn per anchor.
    pub negative_clips: usize,
    /// InfoNCE temperature.
    pub temperature: f32,
    pub num_iterations: usize,
    pub batch_size: usize,
    pub log_interval: usize,
    pub checkpoint_interval: usize,
}

impl Default for EncoderTrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            positive_window: 30,
            negative_clips: 4,
            temperature: 0.1,
            num_iterations: 5000,
            batch_size: 256,
            log_interval: 10,
            checkpoint_interval: 50,
        }
    }
}

/// HLC architecture for a single task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HlcTaskConfig {
    /// Hidden layer sizes (relu).
    pub hidden: Vec<usize>,
    pub learning_rate: f32,
    /// Task observation size (2 heading, 3 location, 6 strike).
    pub task_obs_dim: usize,
}

impl Default for HlcTaskConfig {
    fn default() -> Self {
        Self {
            hidden: vec![512, 256],
            learning_rate: 3e-4,
            task_obs_dim: 2,
        }
    }
}

/// All HLC task configurations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HlcConfig {
    pub heading: HlcTaskConfig,
    pub location: HlcTaskConfig,
    pub strike: HlcTaskConfig,
}

impl Default for HlcConfig {
    fn default() -> Self {
        Self {
            heading: HlcTaskConfig {
                task_obs_dim: 2,
                ..HlcTaskConfig::default()
            },
            location: HlcTaskConfig {
                task_obs_dim: 3,
                ..HlcTaskConfig::default()
            },
            strike: HlcTaskConfig {
                task_obs_dim: 6,
                ..HlcTaskConfig::default()
            },
        }
    }
}

/// Environment parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    /// Number of parallel environments.
    pub num_envs: usize,
    /// Control timestep in seconds.
    pub sim_timestep: f32,
    /// Physics substeps per control tick.
    pub sim_substeps: usize,
    /// Root height below which the episode terminates.
    pub early_termination_height: f32,
    /// Episode length cap in control ticks.
    pub max_episode_steps: usize,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            num_envs: 16,
            sim_timestep: 1.0 / 60.0,
            sim_substeps: 2,
            early_termination_height: 0.3,
            max_episode_steps: 300,
        }
    }
}

/// PPO hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PpoConfig {
    pub num_envs: usize,
    /// Rollout length per environment (steps collected before an update).
    pub horizon: usize,
    pub num_epochs: usize,
    pub minibatch_size: usize,
    pub learning_rate: f32,
    pub gamma: f32,
    pub gae_lambda: f32,
    pub clip_epsilon: f32,
    pub value_loss_coeff: f32,
    pub entropy_coeff: f32,
    pub max_grad_norm: f32,
    /// Target KL divergence. Present for config compatibility; no code path
    /// consumes it to alter control flow.
    pub kl_target: f32,
    pub num_iterations: usize,
    pub checkpoint_interval: usize,
    pub log_interval: usize,
}

impl Default for PpoConfig {
    fn default() -> Self {
        Self {
            num_envs: 16,
            horizon: 32,
            num_epochs: 5,
            minibatch_size: 512,
            learning_rate: 3e-4,
            gamma: 0.99,
            gae_lambda: 0.95,
            clip_epsilon: 0.2,
            value_loss_coeff: 0.5,
            entropy_coeff: 0.01,
            max_grad_norm: 1.0,
            kl_target: 0.01,
            num_iterations: 5000,
            checkpoint_interval: 50,
            log_interval: 10,
        }
    }
}

impl PpoConfig {
    /// Transitions per rollout across all environments.
    pub fn transitions_per_rollout(&self) -> usize {
        self.num_envs * self.horizon
    }
}

/// Top-level training configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CalmConfig {
    pub humanoid: HumanoidConfig,
    pub llc_policy: LlcPolicyConfig,
    pub value: ValueConfig,
    pub amp: AmpConfig,
    pub encoder: EncoderConfig,
    pub encoder_training: EncoderTrainingConfig,
    pub hlc: HlcConfig,
    pub env: EnvConfig,
    pub ppo: PpoConfig,

    /// Directory of motion capture clips (BVH/JSON).
    pub motion_dir: String,
    /// Output directory for checkpoints and exported weights.
    pub output_dir: String,
    /// Random seed for all stochastic components.
    pub seed: u64,
    /// Compute backend.
    pub device: Device,
    /// Use the worker-pool execution layer instead of sequential stepping.
    pub parallel: bool,
    /// Worker thread count (0 = one less than available parallelism).
    pub num_workers: usize,
    /// Cap on the environment count (0 = no cap).
    pub max_envs: usize,
}

impl CalmConfig {
    /// Create a configuration with defaults and the given output/motion paths.
    pub fn new() -> Self {
        Self {
            motion_dir: "data/calm/motions".to_string(),
            output_dir: "checkpoints/calm".to_string(),
            seed: 42,
            ..Self::default()
        }
    }

    /// Effective environment count after applying `max_envs`.
    pub fn effective_num_envs(&self) -> usize {
        if self.max_envs > 0 {
            self.env.num_envs.min(self.max_envs)
        } else {
            self.env.num_envs
        }
    }

    // Builder methods

    pub fn with_num_envs(mut self, n: usize) -> Self {
        self.env.num_envs = n;
        self.ppo.num_envs = n;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_iterations(mut self, n: usize) -> Self {
        self.ppo.num_iterations = n;
        self
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Merge a JSON override object field-by-field on top of this config.
    ///
    /// Unknown keys are ignored so override files survive config additions.
    pub fn merge_json(self, overrides: &str) -> Result<Self, serde_json::Error> {
        let mut base = serde_json::to_value(&self)?;
        let patch: serde_json::Value = serde_json::from_str(overrides)?;
        merge_value(&mut base, patch);
        serde_json::from_value(base)
    }

    /// Validate all parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.env.num_envs == 0 {
            return Err(ConfigError::InvalidCount {
                field: "env.num_envs",
                value: 0,
            });
        }
        if self.ppo.horizon == 0 {
            return Err(ConfigError::InvalidCount {
                field: "ppo.horizon",
                value: 0,
            });
        }
        if self.ppo.num_epochs == 0 {
            return Err(ConfigError::InvalidCount {
                field: "ppo.num_epochs",
                value: 0,
            });
        }
        if self.ppo.minibatch_size == 0 {
            return Err(ConfigError::InvalidCount {
                field: "ppo.minibatch_size",
                value: 0,
            });
        }
        if self.env.sim_substeps == 0 {
            return Err(ConfigError::InvalidCount {
                field: "env.sim_substeps",
                value: 0,
            });
        }
        if !(0.0..=1.0).contains(&self.ppo.gamma) {
            return Err(ConfigError::OutOfRange {
                field: "ppo.gamma",
                value: self.ppo.gamma,
                min: 0.0,
                max: 1.0,
            });
        }
        if !(0.0..=1.0).contains(&self.ppo.gae_lambda) {
            return Err(ConfigError::OutOfRange {
                field: "ppo.gae_lambda",
                value: self.ppo.gae_lambda,
                min: 0.0,
                max: 1.0,
            });
        }
        if self.ppo.clip_epsilon <= 0.0 || self.ppo.clip_epsilon > 1.0 {
            return Err(ConfigError::OutOfRange {
                field: "ppo.clip_epsilon",
                value: self.ppo.clip_epsilon,
                min: 0.0,
                max: 1.0,
            });
        }
        let transitions = self.ppo.transitions_per_rollout();
        if self.ppo.minibatch_size > transitions {
            return Err(ConfigError::InvalidMinibatch {
                transitions,
                minibatch_size: self.ppo.minibatch_size,
            });
        }
        Ok(())
    }
}

fn merge_value(base: &mut serde_json::Value, patch: serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                match base_map.get_mut(&key) {
                    Some(slot) => merge_value(slot, value),
                    None => {} // unknown key, ignore
                }
            }
        }
        (slot, value) => *slot = value,
    }
}
