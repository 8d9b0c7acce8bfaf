//! # calm-rl: hierarchical character-animation controller training
//!
//! Three-phase training pipeline for physics-based character animation:
//!
//! 1. **LLC** — a style-conditioned low-level controller trained with PPO
//!    plus an adversarial motion-prior (AMP) discriminator reward.
//! 2. **Encoder** — a motion encoder trained with InfoNCE contrastive
//!    learning over temporally windowed observations.
//! 3. **HLC** — task-specific high-level controllers trained with PPO
//!    against a frozen LLC, emitting latent commands.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  VecEnv (sequential or worker threads)                       │
//! │  ┌────────┐  ┌────────┐       ┌────────┐                    │
//! │  │ Env 0  │  │ Env 1  │  ...  │ Env N  │   CharacterSim     │
//! │  └───┬────┘  └───┬────┘       └───┬────┘   (opaque oracle)  │
//! │      └───────────┼────────────────┘                         │
//! │                  ▼                                          │
//! │        ObservationExtractor → RolloutBuffer → GAE           │
//! │                  │                              │           │
//! │        AmpTrainer (style reward,                ▼           │
//! │        WGAN-GP critic)                     ppo_update       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! All numeric kernels are explicit `ndarray` code: MLP forward/backward
//! passes, Adam, GAE, the clipped surrogate, the gradient penalty. The
//! physics simulation sits behind the [`env::CharacterSim`] trait and is
//! not part of this crate's scope.

pub mod amp;
pub mod checkpoint;
pub mod config;
pub mod encoder;
pub mod env;
pub mod math;
pub mod metrics;
pub mod motion;
pub mod nn;
pub mod observation;
pub mod ppo;
pub mod rollout;
pub mod trainer;

// Re-export commonly used types
pub use config::{
    AmpConfig, CalmConfig, ConfigError, Device, EncoderConfig, EncoderTrainingConfig, EnvConfig,
    HlcTaskConfig, HumanoidConfig, LlcPolicyConfig, PpoConfig, ValueConfig,
};
pub use env::{
    CharacterEnv, CharacterSim, KinematicSim, SequentialVecEnv, StepBatch, StepInfo, Task,
    TaskGenerator, VecEnv, WorkerVecEnv,
};
pub use motion::{load_motion_directory, standing_clip, MotionClip, MotionTransitionBuffer};
pub use nn::{Activation, Adam, Discriminator, HlcPolicy, MotionEncoder, Mlp, StylePolicy, ValueNet};
pub use observation::ObservationExtractor;
pub use ppo::{ppo_update, PpoActorCritic, PpoMetrics};
pub use rollout::{FlatRollout, RolloutBuffer, StyleRollout};
pub use trainer::{HlcTrainer, LlcTrainer};
