//! Clipped-surrogate policy optimization.
//!
//! One algorithm serves all three policy/observation shapes (latent-
//! conditioned LLC, task-conditioned HLC) by parameterizing only how
//! stored tensors are fed to "evaluate actions": [`PpoActorCritic`]
//! binds a policy, a value function, and their shared optimizer.
//!
//! Per update: advantages are normalized once batch-wide, then
//! `num_epochs` passes run over a fresh random permutation in minibatches
//! (the final short minibatch included). Each minibatch takes one combined
//! gradient step over the concatenated policy+value parameters, with the
//! global gradient norm clipped first. Diagnostics (including approximate
//! KL) are observability outputs only; nothing early-stops on them.

use ndarray::{Array1, Array2};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::config::PpoConfig;
use crate::nn::adam::{clip_grad_norm, Adam, ParamGrad};
use crate::nn::policy::{
    gaussian_backward, HlcCache, HlcGrads, HlcPolicy, StyleCache, StyleGrads, StylePolicy,
    ValueNet,
};
use crate::nn::{Mlp, MlpCache, MlpGrads};
use crate::rollout::FlatRollout;

/// Averaged diagnostics over all minibatch updates of one call.
#[derive(Debug, Clone, Copy, Default)]
pub struct PpoMetrics {
    pub policy_loss: f32,
    pub value_loss: f32,
    pub entropy: f32,
    /// `mean(old_log_prob - new_log_prob)`; logged, never acted on.
    pub approx_kl: f32,
}

/// Recomputed quantities for one minibatch under current parameters.
pub struct Evaluation {
    pub log_probs: Array1<f32>,
    pub entropy: Array1<f32>,
    pub values: Array1<f32>,
}

/// Per-sample upstream gradients of the combined PPO loss.
pub struct LossGrads {
    pub d_log_prob: Array1<f32>,
    pub d_entropy: Array1<f32>,
    pub d_value: Array1<f32>,
}

/// A policy/value pair trainable by [`ppo_update`].
pub trait PpoActorCritic {
    type Cache;

    /// Recompute log-probabilities, entropies, and values for the indexed
    /// rows of the flattened rollout, retaining backward caches.
    fn evaluate(&self, data: &FlatRollout, indices: &[usize]) -> (Evaluation, Self::Cache);

    /// One combined gradient step from the given loss gradients.
    fn update(&mut self, cache: &Self::Cache, grads: &LossGrads, max_grad_norm: f32);
}

/// Run PPO epochs over a filled, GAE-computed rollout.
pub fn ppo_update<M: PpoActorCritic, R: Rng>(
    model: &mut M,
    data: &FlatRollout,
    config: &PpoConfig,
    rng: &mut R,
) -> PpoMetrics {
    let batch_size = data.len();
    assert!(batch_size > 0, "empty rollout");

    // Batch-wide advantage normalization, computed once before the epochs.
    let mut advantages = data.advantages.clone();
    let mean = advantages.mean().unwrap_or(0.0);
    let std = if batch_size > 1 {
        advantages.std(1.0)
    } else {
        0.0
    };
    advantages.mapv_inplace(|a| (a - mean) / (std + 1e-8));

    let mut indices: Vec<usize> = (0..batch_size).collect();
    let mut totals = PpoMetrics::default();
    let mut num_updates = 0usize;

    for _epoch in 0..config.num_epochs {
        indices.shuffle(rng);
        for chunk in indices.chunks(config.minibatch_size) {
            let m = chunk.len() as f32;
            let (eval, cache) = model.evaluate(data, chunk);

            let old_log_probs = gather(&data.log_probs, chunk);
            let mb_advantages = gather(&advantages, chunk);
            let mb_returns = gather(&data.returns, chunk);

            // Clipped surrogate objective and its per-sample gradient.
            let mut policy_loss = 0.0f32;
            let mut d_log_prob = Array1::zeros(chunk.len());
            for i in 0..chunk.len() {
                let ratio = (eval.log_probs[i] - old_log_probs[i]).exp();
                let clipped = ratio.clamp(1.0 - config.clip_epsilon, 1.0 + config.clip_epsilon);
                let surr1 = ratio * mb_advantages[i];
                let surr2 = clipped * mb_advantages[i];
                if surr1 <= surr2 {
                    policy_loss -= surr1;
                    d_log_prob[i] = -mb_advantages[i] * ratio / m;
                } else {
                    // Clipped branch active: constant in the parameters.
                    policy_loss -= surr2;
                }
            }
            policy_loss /= m;

            // Value loss: plain MSE against stored returns, no clipping.
            let mut value_loss = 0.0f32;
            let mut d_value = Array1::zeros(chunk.len());
            for i in 0..chunk.len() {
                let err = eval.values[i] - mb_returns[i];
                value_loss += err * err;
                d_value[i] = config.value_loss_coeff * 2.0 * err / m;
            }
            value_loss /= m;

            let entropy_mean = eval.entropy.mean().unwrap_or(0.0);
            let d_entropy = Array1::from_elem(chunk.len(), -config.entropy_coeff / m);

            model.update(
                &cache,
                &LossGrads {
                    d_log_prob,
                    d_entropy,
                    d_value,
                },
                config.max_grad_norm,
            );

            let approx_kl = (0..chunk.len())
                .map(|i| old_log_probs[i] - eval.log_probs[i])
                .sum::<f32>()
                / m;

            totals.policy_loss += policy_loss;
            totals.value_loss += value_loss;
            totals.entropy += entropy_mean;
            totals.approx_kl += approx_kl;
            num_updates += 1;
        }
    }

    let n = num_updates.max(1) as f32;
    PpoMetrics {
        policy_loss: totals.policy_loss / n,
        value_loss: totals.value_loss / n,
        entropy: totals.entropy / n,
        approx_kl: totals.approx_kl / n,
    }
}

fn gather(a: &Array1<f32>, indices: &[usize]) -> Array1<f32> {
    Array1::from_iter(indices.iter().map(|&i| a[i]))
}

fn gather_rows(a: &Array2<f32>, indices: &[usize]) -> Array2<f32> {
    Array2::from_shape_fn((indices.len(), a.ncols()), |(i, j)| a[[indices[i], j]])
}

fn mlp_param_grads<'a>(mlp: &'a mut Mlp, grads: &'a MlpGrads, out: &mut Vec<ParamGrad<'a>>) {
    for (layer, (gw, gb)) in mlp
        .layers_mut()
        .iter_mut()
        .zip(grads.weights.iter().zip(grads.biases.iter()))
    {
        out.push(ParamGrad {
            param: layer.weight.as_slice_mut().expect("standard layout"),
            grad: gw.as_slice().expect("standard layout"),
        });
        out.push(ParamGrad {
            param: layer.bias.as_slice_mut().expect("standard layout"),
            grad: gb.as_slice().expect("standard layout"),
        });
    }
}

fn mlp_grad_slices(grads: &mut MlpGrads) -> Vec<&mut [f32]> {
    let mut out = Vec::with_capacity(grads.weights.len() * 2);
    for w in &mut grads.weights {
        out.push(w.as_slice_mut().expect("standard layout"));
    }
    for b in &mut grads.biases {
        out.push(b.as_slice_mut().expect("standard layout"));
    }
    out
}

// ============================================================================
// LLC: style-conditioned policy + value
// ============================================================================

/// Backward caches for one LLC minibatch evaluation.
pub struct StyleEvalCache {
    policy_cache: StyleCache,
    value_cache: MlpCache,
    actions: Array2<f32>,
}

/// Style-conditioned policy, value function, and their joint optimizer.
pub struct StyleActorCritic {
    pub policy: StylePolicy,
    pub value: ValueNet,
    pub optimizer: Adam,
    policy_grads: StyleGrads,
    value_grads: MlpGrads,
}

impl StyleActorCritic {
    pub fn new(policy: StylePolicy, value: ValueNet, learning_rate: f32) -> Self {
        let policy_grads = StyleGrads::zeros_like(&policy);
        let value_grads = MlpGrads::zeros_like(&value.mlp);
        Self {
            policy,
            value,
            optimizer: Adam::new(learning_rate),
            policy_grads,
            value_grads,
        }
    }
}

impl PpoActorCritic for StyleActorCritic {
    type Cache = StyleEvalCache;

    fn evaluate(&self, data: &FlatRollout, indices: &[usize]) -> (Evaluation, Self::Cache) {
        let latents = gather_rows(
            data.latents.as_ref().expect("latent-conditioned rollout"),
            indices,
        );
        let obs = gather_rows(&data.observations, indices);
        let actions = gather_rows(&data.actions, indices);

        let (log_probs, entropy, policy_cache) = self.policy.evaluate(&latents, &obs, &actions);
        let (values, value_cache) = self.value.forward_cached(&obs);

        (
            Evaluation {
                log_probs,
                entropy,
                values,
            },
            StyleEvalCache {
                policy_cache,
                value_cache,
                actions,
            },
        )
    }

    fn update(&mut self, cache: &Self::Cache, grads: &LossGrads, max_grad_norm: f32) {
        self.policy_grads.zero();
        self.value_grads.zero();

        let d_mean = gaussian_backward(
            &cache.actions,
            &cache.policy_cache.mean,
            &self.policy.log_std,
            &grads.d_log_prob,
            &grads.d_entropy,
            &mut self.policy_grads.log_std,
        );
        self.policy
            .backward(&cache.policy_cache, &d_mean, &mut self.policy_grads);
        self.value
            .backward(&cache.value_cache, &grads.d_value, &mut self.value_grads);

        {
            let mut slices = mlp_grad_slices(&mut self.policy_grads.style);
            slices.extend(mlp_grad_slices(&mut self.policy_grads.main));
            slices.extend(mlp_grad_slices(&mut self.policy_grads.mu_head));
            slices.push(
                self.policy_grads
                    .log_std
                    .as_slice_mut()
                    .expect("standard layout"),
            );
            slices.extend(mlp_grad_slices(&mut self.value_grads));
            clip_grad_norm(&mut slices, max_grad_norm);
        }

        let mut params = Vec::new();
        mlp_param_grads(&mut self.policy.style, &self.policy_grads.style, &mut params);
        mlp_param_grads(&mut self.policy.main, &self.policy_grads.main, &mut params);
        mlp_param_grads(&mut self.policy.mu_head, &self.policy_grads.mu_head, &mut params);
        params.push(ParamGrad {
            param: self.policy.log_std.as_slice_mut().expect("standard layout"),
            grad: self
                .policy_grads
                .log_std
                .as_slice()
                .expect("standard layout"),
        });
        mlp_param_grads(&mut self.value.mlp, &self.value_grads, &mut params);
        self.optimizer.step(&mut params);
    }
}

// ============================================================================
// HLC: task-conditioned policy + value
// ============================================================================

/// Backward caches for one HLC minibatch evaluation.
pub struct HlcEvalCache {
    policy_cache: HlcCache,
    value_cache: MlpCache,
    latents: Array2<f32>,
}

/// Task-conditioned HLC policy, value function, and their joint optimizer.
///
/// Reads the rollout with task-observation/latent-command semantics:
/// `observations` hold task observations and `actions` hold the sampled
/// latent commands.
pub struct HlcActorCritic {
    pub policy: HlcPolicy,
    pub value: ValueNet,
    pub optimizer: Adam,
    policy_grads: HlcGrads,
    value_grads: MlpGrads,
}

impl HlcActorCritic {
    pub fn new(policy: HlcPolicy, value: ValueNet, learning_rate: f32) -> Self {
        let policy_grads = HlcGrads::zeros_like(&policy);
        let value_grads = MlpGrads::zeros_like(&value.mlp);
        Self {
            policy,
            value,
            optimizer: Adam::new(learning_rate),
            policy_grads,
            value_grads,
        }
    }
}

impl PpoActorCritic for HlcActorCritic {
    type Cache = HlcEvalCache;

    fn evaluate(&self, data: &FlatRollout, indices: &[usize]) -> (Evaluation, Self::Cache) {
        let task_obs = gather_rows(&data.observations, indices);
        let latents = gather_rows(&data.actions, indices);

        let (log_probs, entropy, policy_cache) = self.policy.evaluate(&task_obs, &latents);
        let (values, value_cache) = self.value.forward_cached(&task_obs);

        (
            Evaluation {
                log_probs,
                entropy,
                values,
            },
            HlcEvalCache {
                policy_cache,
                value_cache,
                latents,
            },
        )
    }

    fn update(&mut self, cache: &Self::Cache, grads: &LossGrads, max_grad_norm: f32) {
        self.policy_grads.zero();
        self.value_grads.zero();

        let d_mean = gaussian_backward(
            &cache.latents,
            &cache.policy_cache.mean,
            &self.policy.log_std,
            &grads.d_log_prob,
            &grads.d_entropy,
            &mut self.policy_grads.log_std,
        );
        self.policy
            .backward(&cache.policy_cache, &d_mean, &mut self.policy_grads);
        self.value
            .backward(&cache.value_cache, &grads.d_value, &mut self.value_grads);

        {
            let mut slices = mlp_grad_slices(&mut self.policy_grads.mlp);
            slices.push(
                self.policy_grads
                    .log_std
                    .as_slice_mut()
                    .expect("standard layout"),
            );
            slices.extend(mlp_grad_slices(&mut self.value_grads));
            clip_grad_norm(&mut slices, max_grad_norm);
        }

        let mut params = Vec::new();
        mlp_param_grads(&mut self.policy.mlp, &self.policy_grads.mlp, &mut params);
        params.push(ParamGrad {
            param: self.policy.log_std.as_slice_mut().expect("standard layout"),
            grad: self
                .policy_grads
                .log_std
                .as_slice()
                .expect("standard layout"),
        });
        mlp_param_grads(&mut self.value.mlp, &self.value_grads, &mut params);
        self.optimizer.step(&mut params);
    }
}
