//! Batched environment stepping behind a single contract.
//!
//! [`VecEnv`] is implemented by the in-process [`SequentialVecEnv`] and
//! the thread-backed [`WorkerVecEnv`](super::WorkerVecEnv); the trainer is
//! agnostic to the execution strategy. Both auto-reset terminated
//! environments, so callers always receive a valid next observation.

use std::sync::Arc;

use ndarray::Array2;

use super::character::{CharacterEnv, StepInfo};
use crate::config::CalmConfig;
use crate::motion::MotionClip;

/// Batched result of stepping all environments once.
pub struct StepBatch {
    /// `[num_envs, obs_dim]` observations. For a `done` environment this is
    /// the post-reset observation, never a terminal one.
    pub obs: Array2<f32>,
    pub rewards: Vec<f32>,
    pub dones: Vec<bool>,
    pub infos: Vec<StepInfo>,
}

/// Contract shared by the sequential and worker-pool execution layers.
pub trait VecEnv {
    fn num_envs(&self) -> usize;
    fn obs_dim(&self) -> usize;
    fn act_dim(&self) -> usize;

    /// Reset every environment; returns `[num_envs, obs_dim]`.
    fn reset(&mut self) -> Array2<f32>;

    /// Step every environment with one action row each.
    fn step(&mut self, actions: &Array2<f32>) -> StepBatch;

    /// Shut down. Idempotent.
    fn close(&mut self);
}

/// In-process execution: owns the environments and iterates them in a
/// fixed order.
pub struct SequentialVecEnv {
    envs: Vec<CharacterEnv>,
    base_seed: u64,
    obs_dim: usize,
    act_dim: usize,
}

impl SequentialVecEnv {
    pub fn new(
        config: &CalmConfig,
        num_envs: usize,
        clips: Arc<Vec<MotionClip>>,
        seed: u64,
    ) -> Self {
        let envs: Vec<CharacterEnv> = (0..num_envs)
            .map(|_| CharacterEnv::with_kinematic_sim(config, Arc::clone(&clips)))
            .collect();
        let obs_dim = envs[0].obs_dim();
        let act_dim = envs[0].act_dim();
        Self {
            envs,
            base_seed: seed,
            obs_dim,
            act_dim,
        }
    }

    /// Wrap pre-built environments (custom physics oracles).
    pub fn from_envs(envs: Vec<CharacterEnv>, seed: u64) -> Self {
        assert!(!envs.is_empty());
        let obs_dim = envs[0].obs_dim();
        let act_dim = envs[0].act_dim();
        Self {
            envs,
            base_seed: seed,
            obs_dim,
            act_dim,
        }
    }
}

impl VecEnv for SequentialVecEnv {
    fn num_envs(&self) -> usize {
        self.envs.len()
    }

    fn obs_dim(&self) -> usize {
        self.obs_dim
    }

    fn act_dim(&self) -> usize {
        self.act_dim
    }

    fn reset(&mut self) -> Array2<f32> {
        let mut obs = Array2::zeros((self.envs.len(), self.obs_dim));
        for (i, env) in self.envs.iter_mut().enumerate() {
            let row = env.reset(Some(self.base_seed + i as u64));
            obs.row_mut(i)
                .iter_mut()
                .zip(row.iter())
                .for_each(|(dst, src)| *dst = *src);
        }
        obs
    }

    fn step(&mut self, actions: &Array2<f32>) -> StepBatch {
        assert_eq!(actions.nrows(), self.envs.len());
        let mut obs = Array2::zeros((self.envs.len(), self.obs_dim));
        let mut rewards = Vec::with_capacity(self.envs.len());
        let mut dones = Vec::with_capacity(self.envs.len());
        let mut infos = Vec::with_capacity(self.envs.len());

        for (i, env) in self.envs.iter_mut().enumerate() {
            let action: Vec<f32> = actions.row(i).to_vec();
            let (mut ob, reward, done, info) = env.step(&action);
            if done {
                ob = env.reset(None);
            }
            obs.row_mut(i)
                .iter_mut()
                .zip(ob.iter())
                .for_each(|(dst, src)| *dst = *src);
            rewards.push(reward);
            dones.push(done);
            infos.push(info);
        }

        StepBatch {
            obs,
            rewards,
            dones,
            infos,
        }
    }

    fn close(&mut self) {}
}
