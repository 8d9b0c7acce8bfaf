//! Fixed-horizon rollout storage and Generalized Advantage Estimation.
//!
//! Storage is dense `[step][env]`; the write cursor strictly increases
//! from 0 to `horizon` across one collection phase and is rewound by
//! [`RolloutBuffer::reset`]. Advantages and returns hold garbage until
//! [`RolloutBuffer::compute_gae`] runs, which requires the buffer to be
//! full.
//!
//! [`StyleRollout`] extends the plain buffer with per-step latent codes
//! and the per-frame transition pairs consumed by the discriminator. The
//! HLC phase reuses the plain buffer with task-observation/latent-command
//! semantics.

use ndarray::{Array1, Array2, Array3, Axis};

/// Flattened `[horizon * num_envs]` rollout data, time-major: all
/// environments at step 0, then all at step 1, and so on. Every field uses
/// the same ordering so one index addresses one (step, env) pair.
pub struct FlatRollout {
    pub observations: Array2<f32>,
    pub actions: Array2<f32>,
    /// Conditioning codes (LLC phase only).
    pub latents: Option<Array2<f32>>,
    pub log_probs: Array1<f32>,
    pub advantages: Array1<f32>,
    pub returns: Array1<f32>,
}

impl FlatRollout {
    pub fn len(&self) -> usize {
        self.log_probs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log_probs.is_empty()
    }
}

/// Dense fixed-shape trajectory storage for on-policy updates.
pub struct RolloutBuffer {
    num_envs: usize,
    horizon: usize,
    observations: Array3<f32>,
    actions: Array3<f32>,
    log_probs: Array2<f32>,
    rewards: Array2<f32>,
    dones: Array2<f32>,
    values: Array2<f32>,
    advantages: Array2<f32>,
    returns: Array2<f32>,
    step: usize,
}

impl RolloutBuffer {
    pub fn new(num_envs: usize, horizon: usize, obs_dim: usize, act_dim: usize) -> Self {
        Self {
            num_envs,
            horizon,
            observations: Array3::zeros((horizon, num_envs, obs_dim)),
            actions: Array3::zeros((horizon, num_envs, act_dim)),
            log_probs: Array2::zeros((horizon, num_envs)),
            rewards: Array2::zeros((horizon, num_envs)),
            dones: Array2::zeros((horizon, num_envs)),
            values: Array2::zeros((horizon, num_envs)),
            advantages: Array2::zeros((horizon, num_envs)),
            returns: Array2::zeros((horizon, num_envs)),
            step: 0,
        }
    }

    pub fn horizon(&self) -> usize {
        self.horizon
    }

    pub fn num_envs(&self) -> usize {
        self.num_envs
    }

    pub fn step(&self) -> usize {
        self.step
    }

    /// Append one vectorized step at the write cursor.
    ///
    /// Exceeding `horizon` additions between resets is a caller bug.
    pub fn add(
        &mut self,
        obs: &Array2<f32>,
        actions: &Array2<f32>,
        log_probs: &Array1<f32>,
        rewards: &Array1<f32>,
        dones: &[bool],
        values: &Array1<f32>,
    ) {
        assert!(
            self.step < self.horizon,
            "rollout buffer overflow: {} additions into a horizon of {}",
            self.step + 1,
            self.horizon
        );
        let t = self.step;
        self.observations.index_axis_mut(Axis(0), t).assign(obs);
        self.actions.index_axis_mut(Axis(0), t).assign(actions);
        self.log_probs.row_mut(t).assign(log_probs);
        self.rewards.row_mut(t).assign(rewards);
        for (e, &done) in dones.iter().enumerate() {
            self.dones[[t, e]] = if done { 1.0 } else { 0.0 };
        }
        self.values.row_mut(t).assign(values);
        self.step += 1;
    }

    /// Backward GAE recursion over the full buffer.
    ///
    /// `bootstrap_values` supplies `V(s_T)` per environment for the final
    /// step. Must run exactly once per horizon, after all `horizon` steps
    /// have been added.
    pub fn compute_gae(&mut self, bootstrap_values: &Array1<f32>, gamma: f32, gae_lambda: f32) {
        assert_eq!(
            self.step, self.horizon,
            "GAE requires a full buffer ({} of {} steps added)",
            self.step, self.horizon
        );
        assert_eq!(bootstrap_values.len(), self.num_envs);

        let mut last_gae = vec![0.0f32; self.num_envs];
        for t in (0..self.horizon).rev() {
            for e in 0..self.num_envs {
                let next_value = if t == self.horizon - 1 {
                    bootstrap_values[e]
                } else {
                    self.values[[t + 1, e]]
                };
                let next_non_terminal = 1.0 - self.dones[[t, e]];
                let delta = self.rewards[[t, e]] + gamma * next_value * next_non_terminal
                    - self.values[[t, e]];
                last_gae[e] = delta + gamma * gae_lambda * next_non_terminal * last_gae[e];
                self.advantages[[t, e]] = last_gae[e];
                self.returns[[t, e]] = last_gae[e] + self.values[[t, e]];
            }
        }
    }

    /// Flatten `[horizon, num_envs, ...]` to `[horizon * num_envs, ...]`,
    /// time-major.
    pub fn flatten(&self) -> FlatRollout {
        let n = self.horizon * self.num_envs;
        let obs_dim = self.observations.len_of(Axis(2));
        let act_dim = self.actions.len_of(Axis(2));
        FlatRollout {
            observations: self
                .observations
                .clone()
                .into_shape((n, obs_dim))
                .expect("contiguous rollout storage"),
            actions: self
                .actions
                .clone()
                .into_shape((n, act_dim))
                .expect("contiguous rollout storage"),
            latents: None,
            log_probs: flatten_2d(&self.log_probs),
            advantages: flatten_2d(&self.advantages),
            returns: flatten_2d(&self.returns),
        }
    }

    /// Rewind the write cursor for the next collection phase.
    pub fn reset(&mut self) {
        self.step = 0;
    }
}

fn flatten_2d(a: &Array2<f32>) -> Array1<f32> {
    a.clone()
        .into_shape(a.len())
        .expect("contiguous rollout storage")
}

/// Rollout storage for the style-conditioned LLC phase: the plain buffer
/// plus per-step latent codes and per-frame transition pairs.
pub struct StyleRollout {
    base: RolloutBuffer,
    latents: Array3<f32>,
    pair_obs_t: Array3<f32>,
    pair_obs_t1: Array3<f32>,
}

impl StyleRollout {
    pub fn new(
        num_envs: usize,
        horizon: usize,
        obs_dim: usize,
        act_dim: usize,
        latent_dim: usize,
        per_frame_obs_dim: usize,
    ) -> Self {
        Self {
            base: RolloutBuffer::new(num_envs, horizon, obs_dim, act_dim),
            latents: Array3::zeros((horizon, num_envs, latent_dim)),
            pair_obs_t: Array3::zeros((horizon, num_envs, per_frame_obs_dim)),
            pair_obs_t1: Array3::zeros((horizon, num_envs, per_frame_obs_dim)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add(
        &mut self,
        obs: &Array2<f32>,
        actions: &Array2<f32>,
        log_probs: &Array1<f32>,
        rewards: &Array1<f32>,
        dones: &[bool],
        values: &Array1<f32>,
        latents: &Array2<f32>,
        pair_obs_t: &Array2<f32>,
        pair_obs_t1: &Array2<f32>,
    ) {
        let t = self.base.step();
        self.base.add(obs, actions, log_probs, rewards, dones, values);
        self.latents.index_axis_mut(Axis(0), t).assign(latents);
        self.pair_obs_t.index_axis_mut(Axis(0), t).assign(pair_obs_t);
        self.pair_obs_t1
            .index_axis_mut(Axis(0), t)
            .assign(pair_obs_t1);
    }

    pub fn compute_gae(&mut self, bootstrap_values: &Array1<f32>, gamma: f32, gae_lambda: f32) {
        self.base.compute_gae(bootstrap_values, gamma, gae_lambda);
    }

    pub fn flatten(&self) -> FlatRollout {
        let mut flat = self.base.flatten();
        let n = self.base.horizon() * self.base.num_envs();
        let latent_dim = self.latents.len_of(Axis(2));
        flat.latents = Some(
            self.latents
                .clone()
                .into_shape((n, latent_dim))
                .expect("contiguous rollout storage"),
        );
        flat
    }

    /// The collected per-frame transition pairs, flattened time-major —
    /// the "fake" stream appended to the discriminator's replay pool.
    pub fn flat_pairs(&self) -> (Array2<f32>, Array2<f32>) {
        let n = self.base.horizon() * self.base.num_envs();
        let dim = self.pair_obs_t.len_of(Axis(2));
        (
            self.pair_obs_t
                .clone()
                .into_shape((n, dim))
                .expect("contiguous rollout storage"),
            self.pair_obs_t1
                .clone()
                .into_shape((n, dim))
                .expect("contiguous rollout storage"),
        )
    }

    pub fn reset(&mut self) {
        self.base.reset();
    }

    pub fn step(&self) -> usize {
        self.base.step()
    }
}
