//! Per-phase checkpoint bundles.
//!
//! Each phase writes an opaque serialized bundle (JSON via serde) holding
//! the iteration counter, every trained network's parameter state, the
//! optimizer state, and training progress counters. Later phases read only
//! the sub-state they need: HLC training loads just the frozen LLC policy
//! out of a phase-1 bundle and ignores the rest.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use ndarray::{Array1, Array2};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::nn::policy::{HlcPolicy, StylePolicy};
use crate::nn::{Activation, Adam, LinearLayer, Mlp};

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serializable state of one linear layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerState {
    pub in_dim: usize,
    pub out_dim: usize,
    pub weight: Vec<f32>,
    pub bias: Vec<f32>,
    pub activation: Activation,
}

/// Serializable state of an MLP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MlpState {
    pub layers: Vec<LayerState>,
}

impl MlpState {
    pub fn from_mlp(mlp: &Mlp) -> Self {
        Self {
            layers: mlp
                .layers()
                .iter()
                .map(|l| LayerState {
                    in_dim: l.input_dim(),
                    out_dim: l.output_dim(),
                    weight: l.weight.iter().copied().collect(),
                    bias: l.bias.to_vec(),
                    activation: l.activation,
                })
                .collect(),
        }
    }

    pub fn to_mlp(&self) -> Mlp {
        Mlp::from_layers(
            self.layers
                .iter()
                .map(|l| LinearLayer {
                    weight: Array2::from_shape_vec((l.out_dim, l.in_dim), l.weight.clone())
                        .expect("checkpoint layer shape"),
                    bias: Array1::from_vec(l.bias.clone()),
                    activation: l.activation,
                })
                .collect(),
        )
    }
}

/// Serializable optimizer state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdamState {
    pub learning_rate: f32,
    pub step_count: u64,
    pub moments: Vec<(Vec<f32>, Vec<f32>)>,
}

impl AdamState {
    pub fn from_adam(adam: &Adam) -> Self {
        let (step_count, moments) = adam.state();
        Self {
            learning_rate: adam.learning_rate,
            step_count,
            moments,
        }
    }

    pub fn to_adam(&self) -> Adam {
        let mut adam = Adam::new(self.learning_rate);
        adam.restore(self.step_count, self.moments.clone());
        adam
    }
}

/// Serializable state of the style-conditioned LLC policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StylePolicyState {
    pub style: MlpState,
    pub main: MlpState,
    pub mu_head: MlpState,
    pub log_std: Vec<f32>,
}

impl StylePolicyState {
    pub fn from_policy(policy: &StylePolicy) -> Self {
        Self {
            style: MlpState::from_mlp(&policy.style),
            main: MlpState::from_mlp(&policy.main),
            mu_head: MlpState::from_mlp(&policy.mu_head),
            log_std: policy.log_std.to_vec(),
        }
    }

    pub fn to_policy(&self) -> StylePolicy {
        StylePolicy::from_parts(
            self.style.to_mlp(),
            self.main.to_mlp(),
            self.mu_head.to_mlp(),
            Array1::from_vec(self.log_std.clone()),
        )
    }
}

/// Phase 1 bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlcCheckpoint {
    pub iteration: usize,
    pub total_timesteps: usize,
    pub policy: StylePolicyState,
    pub value: MlpState,
    pub discriminator: MlpState,
    pub optimizer: AdamState,
    pub disc_optimizer: AdamState,
}

/// Phase 2 bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderCheckpoint {
    pub iteration: usize,
    pub encoder: MlpState,
    pub optimizer: AdamState,
}

/// Phase 3 bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HlcCheckpoint {
    pub iteration: usize,
    pub total_timesteps: usize,
    pub hlc: MlpState,
    pub hlc_log_std: Vec<f32>,
    pub value: MlpState,
    pub optimizer: AdamState,
}

/// Checkpoint file name: `{prefix}_checkpoint_{iteration:06}.json`.
pub fn checkpoint_path(dir: &Path, prefix: &str, iteration: usize) -> PathBuf {
    dir.join(format!("{prefix}_checkpoint_{iteration:06}.json"))
}

/// Write a bundle.
pub fn save_json<T: Serialize>(path: &Path, bundle: &T) -> Result<(), CheckpointError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer(writer, bundle)?;
    log::info!("checkpoint saved: {}", path.display());
    Ok(())
}

/// Read a bundle.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T, CheckpointError> {
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}

/// Load only the frozen LLC policy out of a phase-1 bundle, ignoring the
/// value/discriminator/optimizer states.
pub fn load_llc_policy(path: &Path) -> Result<StylePolicy, CheckpointError> {
    #[derive(Deserialize)]
    struct PolicyOnly {
        policy: StylePolicyState,
    }
    let partial: PolicyOnly = load_json(path)?;
    Ok(partial.policy.to_policy())
}

/// Load only the HLC policy out of a phase-3 bundle.
pub fn load_hlc_policy(path: &Path) -> Result<HlcPolicy, CheckpointError> {
    #[derive(Deserialize)]
    struct HlcOnly {
        hlc: MlpState,
        hlc_log_std: Vec<f32>,
    }
    let partial: HlcOnly = load_json(path)?;
    Ok(HlcPolicy::from_parts(
        partial.hlc.to_mlp(),
        Array1::from_vec(partial.hlc_log_std),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HumanoidConfig, LlcPolicyConfig};
    use crate::nn::randn;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use tempfile::tempdir;

    fn rng() -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(2)
    }

    fn small_policy(r: &mut ChaCha8Rng) -> StylePolicy {
        let humanoid = HumanoidConfig {
            num_dof: 4,
            num_key_bodies: 2,
            per_frame_obs_dim: 6,
            num_policy_obs_steps: 2,
            num_encoder_obs_steps: 3,
            latent_dim: 3,
        };
        let config = LlcPolicyConfig {
            style_hidden: vec![5],
            style_out: 3,
            main_hidden: vec![8, 4],
            log_std_init: -1.0,
        };
        StylePolicy::new(&config, &humanoid, r)
    }

    #[test]
    fn mlp_state_roundtrip_preserves_values() {
        let mut r = rng();
        let mlp = Mlp::new(3, &[5], 2, Activation::Relu, Activation::Tanh, &mut r);
        let restored = MlpState::from_mlp(&mlp).to_mlp();
        for (a, b) in mlp.layers().iter().zip(restored.layers()) {
            assert_eq!(a.weight, b.weight);
            assert_eq!(a.bias, b.bias);
            assert_eq!(a.activation, b.activation);
        }
    }

    #[test]
    fn checkpoint_path_format() {
        let path = checkpoint_path(Path::new("out"), "llc", 150);
        assert_eq!(path, PathBuf::from("out/llc_checkpoint_000150.json"));
    }

    #[test]
    fn llc_bundle_roundtrip() {
        let mut r = rng();
        let policy = small_policy(&mut r);
        let bundle = LlcCheckpoint {
            iteration: 42,
            total_timesteps: 1000,
            policy: StylePolicyState::from_policy(&policy),
            value: MlpState::from_mlp(&Mlp::new(
                12,
                &[6],
                1,
                Activation::Relu,
                Activation::None,
                &mut r,
            )),
            discriminator: MlpState::from_mlp(&Mlp::new(
                12,
                &[6],
                1,
                Activation::Relu,
                Activation::None,
                &mut r,
            )),
            optimizer: AdamState::from_adam(&Adam::new(3e-4)),
            disc_optimizer: AdamState::from_adam(&Adam::new(1e-4)),
        };

        let dir = tempdir().unwrap();
        let path = checkpoint_path(dir.path(), "llc", 42);
        save_json(&path, &bundle).unwrap();
        let loaded: LlcCheckpoint = load_json(&path).unwrap();
        assert_eq!(loaded.iteration, 42);
        assert_eq!(loaded.total_timesteps, 1000);
        assert_eq!(
            loaded.policy.log_std,
            bundle.policy.log_std
        );
    }

    /// HLC training reads only the policy sub-state out of an LLC bundle.
    #[test]
    fn partial_policy_load_ignores_rest() {
        let mut r = rng();
        let policy = small_policy(&mut r);
        let bundle = LlcCheckpoint {
            iteration: 7,
            total_timesteps: 10,
            policy: StylePolicyState::from_policy(&policy),
            value: MlpState::from_mlp(&Mlp::new(
                12,
                &[4],
                1,
                Activation::Relu,
                Activation::None,
                &mut r,
            )),
            discriminator: MlpState::from_mlp(&Mlp::new(
                12,
                &[4],
                1,
                Activation::Relu,
                Activation::None,
                &mut r,
            )),
            optimizer: AdamState::from_adam(&Adam::new(3e-4)),
            disc_optimizer: AdamState::from_adam(&Adam::new(1e-4)),
        };

        let dir = tempdir().unwrap();
        let path = checkpoint_path(dir.path(), "llc", 7);
        save_json(&path, &bundle).unwrap();

        let loaded = load_llc_policy(&path).unwrap();
        // The frozen policy reproduces the original's outputs.
        let latents = randn(2, 3, &mut r);
        let obs = randn(2, 12, &mut r);
        assert_eq!(policy.mean(&latents, &obs), loaded.mean(&latents, &obs));
    }
}
