//! Network architectures for the three training phases.
//!
//! - [`StylePolicy`]: the low-level controller — style MLP (tanh) feeding a
//!   main MLP (relu) and a linear mu head, with a state-independent
//!   learnable log standard deviation per action dimension.
//! - [`ValueNet`]: observation -> scalar expected return.
//! - [`Discriminator`]: adversarial motion prior critic over frame pairs.
//! - [`MotionEncoder`]: stacked observations -> L2-normalized latent.
//! - [`HlcPolicy`]: task observation -> L2-normalized latent command.
//!
//! Diagonal-Gaussian log-probability/entropy and their backward passes are
//! shared free functions; the policies differ only in how the mean is
//! produced.

use ndarray::{concatenate, s, Array1, Array2, Axis};
use rand::Rng;

use super::{randn, Activation, Mlp, MlpCache, MlpGrads};
use crate::config::{EncoderConfig, HlcTaskConfig, HumanoidConfig, LlcPolicyConfig, ValueConfig};

const LOG_2PI: f32 = 1.837_877_1; // ln(2*pi)

// ============================================================================
// Diagonal Gaussian
// ============================================================================

/// Log probability of `actions` under `N(mean, exp(log_std))`, summed over
/// action dimensions.
pub fn gaussian_log_prob(
    actions: &Array2<f32>,
    mean: &Array2<f32>,
    log_std: &Array1<f32>,
) -> Array1<f32> {
    let mut out = Array1::zeros(actions.nrows());
    for (i, (a_row, m_row)) in actions.rows().into_iter().zip(mean.rows()).enumerate() {
        let mut lp = 0.0f32;
        for j in 0..a_row.len() {
            let std = log_std[j].exp();
            let z = (a_row[j] - m_row[j]) / std;
            lp += -0.5 * z * z - log_std[j] - 0.5 * LOG_2PI;
        }
        out[i] = lp;
    }
    out
}

/// Per-sample entropy of the diagonal Gaussian. State independent: the same
/// value for every sample in the batch.
pub fn gaussian_entropy(log_std: &Array1<f32>, batch: usize) -> Array1<f32> {
    let h: f32 = log_std.iter().map(|ls| 0.5 * (1.0 + LOG_2PI) + ls).sum();
    Array1::from_elem(batch, h)
}

/// Sample actions and their log probabilities.
pub fn sample_gaussian<R: Rng>(
    mean: &Array2<f32>,
    log_std: &Array1<f32>,
    rng: &mut R,
) -> (Array2<f32>, Array1<f32>) {
    let noise = randn(mean.nrows(), mean.ncols(), rng);
    let mut actions = mean.clone();
    for (mut a_row, n_row) in actions.rows_mut().into_iter().zip(noise.rows()) {
        for j in 0..a_row.len() {
            a_row[j] += log_std[j].exp() * n_row[j];
        }
    }
    let log_probs = gaussian_log_prob(&actions, mean, log_std);
    (actions, log_probs)
}

/// Backward pass of the Gaussian log-probability and entropy.
///
/// Given per-sample upstream gradients `d_log_prob` and `d_entropy`,
/// returns the gradient with respect to the mean and accumulates the
/// log-std gradient.
pub fn gaussian_backward(
    actions: &Array2<f32>,
    mean: &Array2<f32>,
    log_std: &Array1<f32>,
    d_log_prob: &Array1<f32>,
    d_entropy: &Array1<f32>,
    d_log_std: &mut Array1<f32>,
) -> Array2<f32> {
    let mut d_mean = Array2::zeros(mean.raw_dim());
    for i in 0..mean.nrows() {
        for j in 0..mean.ncols() {
            let std = log_std[j].exp();
            let z = (actions[[i, j]] - mean[[i, j]]) / std;
            // d logp / d mean = (a - mu) / sigma^2
            d_mean[[i, j]] = d_log_prob[i] * z / std;
            // d logp / d log_std = z^2 - 1; d H / d log_std = 1
            d_log_std[j] += d_log_prob[i] * (z * z - 1.0) + d_entropy[i];
        }
    }
    d_mean
}

// ============================================================================
// Row-wise L2 normalization
// ============================================================================

/// Normalize each row to unit length. Returns the normalized matrix and the
/// pre-normalization row norms (floored at 1e-8).
pub fn l2_normalize_rows(x: &Array2<f32>) -> (Array2<f32>, Array1<f32>) {
    let mut norms = Array1::zeros(x.nrows());
    let mut y = x.clone();
    for (i, mut row) in y.rows_mut().into_iter().enumerate() {
        let norm = row.dot(&row).sqrt().max(1e-8);
        norms[i] = norm;
        row.mapv_inplace(|v| v / norm);
    }
    (y, norms)
}

/// Backward through row-wise L2 normalization:
/// `dx = (dy - y * (y . dy)) / norm` per row.
pub fn l2_normalize_backward(
    normalized: &Array2<f32>,
    norms: &Array1<f32>,
    d_y: &Array2<f32>,
) -> Array2<f32> {
    let mut d_x = Array2::zeros(d_y.raw_dim());
    for i in 0..d_y.nrows() {
        let y = normalized.row(i);
        let dy = d_y.row(i);
        let dot = y.dot(&dy);
        for j in 0..d_y.ncols() {
            d_x[[i, j]] = (dy[j] - y[j] * dot) / norms[i];
        }
    }
    d_x
}

// ============================================================================
// Style-conditioned LLC policy
// ============================================================================

/// Low-level controller policy: `mu = mu_head(main(concat(style(z), obs)))`
/// with per-dimension learnable log standard deviation.
#[derive(Debug, Clone)]
pub struct StylePolicy {
    pub style: Mlp,
    pub main: Mlp,
    pub mu_head: Mlp,
    pub log_std: Array1<f32>,
    style_out: usize,
}

/// Forward caches for [`StylePolicy::backward`].
pub struct StyleCache {
    style_cache: MlpCache,
    main_cache: MlpCache,
    mu_cache: MlpCache,
    pub mean: Array2<f32>,
}

/// Parameter gradients for [`StylePolicy`].
pub struct StyleGrads {
    pub style: MlpGrads,
    pub main: MlpGrads,
    pub mu_head: MlpGrads,
    pub log_std: Array1<f32>,
}

impl StyleGrads {
    pub fn zeros_like(policy: &StylePolicy) -> Self {
        Self {
            style: MlpGrads::zeros_like(&policy.style),
            main: MlpGrads::zeros_like(&policy.main),
            mu_head: MlpGrads::zeros_like(&policy.mu_head),
            log_std: Array1::zeros(policy.log_std.raw_dim()),
        }
    }

    pub fn zero(&mut self) {
        self.style.zero();
        self.main.zero();
        self.mu_head.zero();
        self.log_std.fill(0.0);
    }
}

impl StylePolicy {
    pub fn new<R: Rng>(
        config: &LlcPolicyConfig,
        humanoid: &HumanoidConfig,
        rng: &mut R,
    ) -> Self {
        let style = Mlp::new(
            humanoid.latent_dim,
            &config.style_hidden,
            config.style_out,
            Activation::Tanh,
            Activation::Tanh,
            rng,
        );

        // Main MLP ends at the last hidden size; every layer carries relu.
        let main_input = config.style_out + humanoid.policy_obs_dim();
        let mut dims = vec![main_input];
        dims.extend_from_slice(&config.main_hidden);
        let acts = vec![Activation::Relu; config.main_hidden.len()];
        let main = Mlp::from_spec(&dims, &acts, rng);

        let mu_head = Mlp::from_spec(
            &[*config.main_hidden.last().unwrap(), humanoid.num_dof],
            &[Activation::None],
            rng,
        );

        Self {
            style,
            main,
            mu_head,
            log_std: Array1::from_elem(humanoid.num_dof, config.log_std_init),
            style_out: config.style_out,
        }
    }

    /// Reassemble from component networks (checkpoint loads).
    pub fn from_parts(style: Mlp, main: Mlp, mu_head: Mlp, log_std: Array1<f32>) -> Self {
        let style_out = style.output_dim();
        assert_eq!(mu_head.output_dim(), log_std.len());
        Self {
            style,
            main,
            mu_head,
            log_std,
            style_out,
        }
    }

    pub fn action_dim(&self) -> usize {
        self.mu_head.output_dim()
    }

    /// Deterministic mean action.
    pub fn mean(&self, latents: &Array2<f32>, obs: &Array2<f32>) -> Array2<f32> {
        let style_embed = self.style.forward(latents);
        let combined = concatenate(Axis(1), &[style_embed.view(), obs.view()]).unwrap();
        self.mu_head.forward(&self.main.forward(&combined))
    }

    /// Mean action with caches retained for [`StylePolicy::backward`].
    pub fn mean_cached(&self, latents: &Array2<f32>, obs: &Array2<f32>) -> StyleCache {
        let (style_embed, style_cache) = self.style.forward_cached(latents);
        let combined = concatenate(Axis(1), &[style_embed.view(), obs.view()]).unwrap();
        let (hidden, main_cache) = self.main.forward_cached(&combined);
        let (mean, mu_cache) = self.mu_head.forward_cached(&hidden);
        StyleCache {
            style_cache,
            main_cache,
            mu_cache,
            mean,
        }
    }

    /// Sample stochastic actions and their log probabilities.
    pub fn sample<R: Rng>(
        &self,
        latents: &Array2<f32>,
        obs: &Array2<f32>,
        rng: &mut R,
    ) -> (Array2<f32>, Array1<f32>) {
        let mean = self.mean(latents, obs);
        sample_gaussian(&mean, &self.log_std, rng)
    }

    /// Log probability and entropy of stored actions under the current
    /// parameters, with the cache needed for the backward pass.
    pub fn evaluate(
        &self,
        latents: &Array2<f32>,
        obs: &Array2<f32>,
        actions: &Array2<f32>,
    ) -> (Array1<f32>, Array1<f32>, StyleCache) {
        let cache = self.mean_cached(latents, obs);
        let log_probs = gaussian_log_prob(actions, &cache.mean, &self.log_std);
        let entropy = gaussian_entropy(&self.log_std, actions.nrows());
        (log_probs, entropy, cache)
    }

    /// Backpropagate a mean gradient through mu head, main MLP, and style
    /// MLP. The observation and latent input gradients are discarded.
    pub fn backward(&self, cache: &StyleCache, d_mean: &Array2<f32>, grads: &mut StyleGrads) {
        let d_hidden = self.mu_head.backward(&cache.mu_cache, d_mean, &mut grads.mu_head);
        let d_combined = self.main.backward(&cache.main_cache, &d_hidden, &mut grads.main);
        let d_style = d_combined.slice(s![.., ..self.style_out]).to_owned();
        self.style.backward(&cache.style_cache, &d_style, &mut grads.style);
    }
}

// ============================================================================
// Value network
// ============================================================================

/// MLP value function mapping observations to a scalar return estimate.
#[derive(Debug, Clone)]
pub struct ValueNet {
    pub mlp: Mlp,
}

impl ValueNet {
    pub fn new<R: Rng>(input_dim: usize, config: &ValueConfig, rng: &mut R) -> Self {
        Self {
            mlp: Mlp::new(
                input_dim,
                &config.hidden,
                1,
                Activation::Relu,
                Activation::None,
                rng,
            ),
        }
    }

    pub fn forward(&self, obs: &Array2<f32>) -> Array1<f32> {
        self.mlp.forward(obs).column(0).to_owned()
    }

    pub fn forward_cached(&self, obs: &Array2<f32>) -> (Array1<f32>, MlpCache) {
        let (out, cache) = self.mlp.forward_cached(obs);
        (out.column(0).to_owned(), cache)
    }

    pub fn backward(&self, cache: &MlpCache, d_value: &Array1<f32>, grads: &mut MlpGrads) {
        let upstream = d_value
            .view()
            .insert_axis(Axis(1))
            .to_owned();
        self.mlp.backward(cache, &upstream, grads);
    }
}

// ============================================================================
// AMP discriminator
// ============================================================================

/// Adversarial motion prior critic over `(obs_t, obs_t1)` frame pairs.
#[derive(Debug, Clone)]
pub struct Discriminator {
    pub mlp: Mlp,
}

impl Discriminator {
    pub fn new<R: Rng>(per_frame_obs_dim: usize, hidden: &[usize], rng: &mut R) -> Self {
        Self {
            mlp: Mlp::new(
                2 * per_frame_obs_dim,
                hidden,
                1,
                Activation::Relu,
                Activation::None,
                rng,
            ),
        }
    }

    /// Concatenate a transition pair into the critic's input layout.
    pub fn pair_input(obs_t: &Array2<f32>, obs_t1: &Array2<f32>) -> Array2<f32> {
        concatenate(Axis(1), &[obs_t.view(), obs_t1.view()]).unwrap()
    }

    /// Critic score per transition pair.
    pub fn score(&self, obs_t: &Array2<f32>, obs_t1: &Array2<f32>) -> Array1<f32> {
        self.mlp
            .forward(&Self::pair_input(obs_t, obs_t1))
            .column(0)
            .to_owned()
    }
}

// ============================================================================
// Motion encoder
// ============================================================================

/// Encoder mapping stacked observations to an L2-normalized latent.
#[derive(Debug, Clone)]
pub struct MotionEncoder {
    pub mlp: Mlp,
    normalize: bool,
}

/// Forward caches for [`MotionEncoder::backward`].
pub struct EncoderCache {
    mlp_cache: MlpCache,
    normalized: Option<(Array2<f32>, Array1<f32>)>,
}

impl MotionEncoder {
    pub fn new<R: Rng>(
        config: &EncoderConfig,
        humanoid: &HumanoidConfig,
        rng: &mut R,
    ) -> Self {
        Self {
            mlp: Mlp::new(
                humanoid.encoder_obs_dim(),
                &config.hidden,
                config.output_dim,
                Activation::Relu,
                Activation::None,
                rng,
            ),
            normalize: config.normalize_output,
        }
    }

    pub fn encode(&self, stacked_obs: &Array2<f32>) -> Array2<f32> {
        let raw = self.mlp.forward(stacked_obs);
        if self.normalize {
            l2_normalize_rows(&raw).0
        } else {
            raw
        }
    }

    pub fn encode_cached(&self, stacked_obs: &Array2<f32>) -> (Array2<f32>, EncoderCache) {
        let (raw, mlp_cache) = self.mlp.forward_cached(stacked_obs);
        if self.normalize {
            let (z, norms) = l2_normalize_rows(&raw);
            (
                z.clone(),
                EncoderCache {
                    mlp_cache,
                    normalized: Some((z, norms)),
                },
            )
        } else {
            (
                raw,
                EncoderCache {
                    mlp_cache,
                    normalized: None,
                },
            )
        }
    }

    pub fn backward(&self, cache: &EncoderCache, d_z: &Array2<f32>, grads: &mut MlpGrads) {
        let d_raw = match &cache.normalized {
            Some((z, norms)) => l2_normalize_backward(z, norms, d_z),
            None => d_z.clone(),
        };
        self.mlp.backward(&cache.mlp_cache, &d_raw, grads);
    }
}

// ============================================================================
// High-level controller policy
// ============================================================================

/// Task-conditioned HLC: task observation -> L2-normalized latent command
/// mean, with learnable exploration noise in latent space.
#[derive(Debug, Clone)]
pub struct HlcPolicy {
    pub mlp: Mlp,
    pub log_std: Array1<f32>,
}

/// Forward caches for [`HlcPolicy::backward`].
pub struct HlcCache {
    mlp_cache: MlpCache,
    normalized: Array2<f32>,
    norms: Array1<f32>,
    pub mean: Array2<f32>,
}

/// Parameter gradients for [`HlcPolicy`].
pub struct HlcGrads {
    pub mlp: MlpGrads,
    pub log_std: Array1<f32>,
}

impl HlcGrads {
    pub fn zeros_like(policy: &HlcPolicy) -> Self {
        Self {
            mlp: MlpGrads::zeros_like(&policy.mlp),
            log_std: Array1::zeros(policy.log_std.raw_dim()),
        }
    }

    pub fn zero(&mut self) {
        self.mlp.zero();
        self.log_std.fill(0.0);
    }
}

impl HlcPolicy {
    pub fn new<R: Rng>(
        task_config: &HlcTaskConfig,
        humanoid: &HumanoidConfig,
        rng: &mut R,
    ) -> Self {
        Self {
            mlp: Mlp::new(
                task_config.task_obs_dim,
                &task_config.hidden,
                humanoid.latent_dim,
                Activation::Relu,
                Activation::None,
                rng,
            ),
            log_std: Array1::from_elem(humanoid.latent_dim, -1.0),
        }
    }

    /// Reassemble from a network and its log-std (checkpoint loads).
    pub fn from_parts(mlp: Mlp, log_std: Array1<f32>) -> Self {
        assert_eq!(mlp.output_dim(), log_std.len());
        Self { mlp, log_std }
    }

    pub fn latent_dim(&self) -> usize {
        self.mlp.output_dim()
    }

    /// Deterministic mean latent command.
    pub fn mean(&self, task_obs: &Array2<f32>) -> Array2<f32> {
        l2_normalize_rows(&self.mlp.forward(task_obs)).0
    }

    pub fn mean_cached(&self, task_obs: &Array2<f32>) -> HlcCache {
        let (raw, mlp_cache) = self.mlp.forward_cached(task_obs);
        let (normalized, norms) = l2_normalize_rows(&raw);
        HlcCache {
            mlp_cache,
            normalized: normalized.clone(),
            norms,
            mean: normalized,
        }
    }

    /// Sample latent commands and their log probabilities.
    pub fn sample<R: Rng>(
        &self,
        task_obs: &Array2<f32>,
        rng: &mut R,
    ) -> (Array2<f32>, Array1<f32>) {
        let mean = self.mean(task_obs);
        sample_gaussian(&mean, &self.log_std, rng)
    }

    /// Log probability and entropy of stored latents under the current
    /// parameters.
    pub fn evaluate(
        &self,
        task_obs: &Array2<f32>,
        latents: &Array2<f32>,
    ) -> (Array1<f32>, Array1<f32>, HlcCache) {
        let cache = self.mean_cached(task_obs);
        let log_probs = gaussian_log_prob(latents, &cache.mean, &self.log_std);
        let entropy = gaussian_entropy(&self.log_std, latents.nrows());
        (log_probs, entropy, cache)
    }

    /// Backpropagate a mean gradient through the normalization Jacobian and
    /// the MLP.
    pub fn backward(&self, cache: &HlcCache, d_mean: &Array2<f32>, grads: &mut HlcGrads) {
        let d_raw = l2_normalize_backward(&cache.normalized, &cache.norms, d_mean);
        self.mlp.backward(&cache.mlp_cache, &d_raw, &mut grads.mlp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn rng() -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(11)
    }

    fn small_humanoid() -> HumanoidConfig {
        HumanoidConfig {
            num_dof: 6,
            num_key_bodies: 2,
            per_frame_obs_dim: 10,
            num_policy_obs_steps: 2,
            num_encoder_obs_steps: 3,
            latent_dim: 4,
        }
    }

    fn small_llc() -> LlcPolicyConfig {
        LlcPolicyConfig {
            style_hidden: vec![8],
            style_out: 4,
            main_hidden: vec![16, 8],
            log_std_init: -1.0,
        }
    }

    #[test]
    fn gaussian_log_prob_standard_normal_at_mean() {
        let actions = Array2::zeros((3, 2));
        let mean = Array2::zeros((3, 2));
        let log_std = Array1::zeros(2);
        let lp = gaussian_log_prob(&actions, &mean, &log_std);
        // log N(0; 0, 1) per dim = -0.5 * ln(2*pi); two dims
        let expected = -LOG_2PI;
        for &v in lp.iter() {
            assert_relative_eq!(v, expected, epsilon = 1e-5);
        }
    }

    #[test]
    fn gaussian_entropy_matches_closed_form() {
        let log_std = Array1::zeros(3);
        let h = gaussian_entropy(&log_std, 2);
        // 0.5 * (1 + ln 2pi) per dim, 3 dims
        let expected = 3.0 * 0.5 * (1.0 + LOG_2PI);
        assert_relative_eq!(h[0], expected, epsilon = 1e-5);
        assert_relative_eq!(h[1], expected, epsilon = 1e-5);
    }

    #[test]
    fn gaussian_backward_matches_finite_difference() {
        let mut r = rng();
        let mean = randn(2, 3, &mut r);
        let actions = randn(2, 3, &mut r);
        let log_std = Array1::from_vec(vec![-0.5, 0.0, 0.3]);

        let d_logp = Array1::from_vec(vec![1.0, 1.0]);
        let d_ent = Array1::zeros(2);
        let mut d_log_std = Array1::zeros(3);
        let d_mean = gaussian_backward(&actions, &mean, &log_std, &d_logp, &d_ent, &mut d_log_std);

        let eps = 1e-3f32;
        // d(sum logp)/d mean[0,1]
        let mut mean_up = mean.clone();
        mean_up[[0, 1]] += eps;
        let mut mean_down = mean.clone();
        mean_down[[0, 1]] -= eps;
        let numeric = (gaussian_log_prob(&actions, &mean_up, &log_std).sum()
            - gaussian_log_prob(&actions, &mean_down, &log_std).sum())
            / (2.0 * eps);
        assert_relative_eq!(d_mean[[0, 1]], numeric, epsilon = 1e-2);

        // d(sum logp)/d log_std[2]
        let mut ls_up = log_std.clone();
        ls_up[2] += eps;
        let mut ls_down = log_std.clone();
        ls_down[2] -= eps;
        let numeric = (gaussian_log_prob(&actions, &mean, &ls_up).sum()
            - gaussian_log_prob(&actions, &mean, &ls_down).sum())
            / (2.0 * eps);
        assert_relative_eq!(d_log_std[2], numeric, epsilon = 1e-2);
    }

    #[test]
    fn l2_normalize_rows_unit_length() {
        let mut r = rng();
        let x = randn(4, 6, &mut r);
        let (y, norms) = l2_normalize_rows(&x);
        for row in y.rows() {
            assert_relative_eq!(row.dot(&row).sqrt(), 1.0, epsilon = 1e-5);
        }
        assert!(norms.iter().all(|&n| n > 0.0));
    }

    #[test]
    fn l2_normalize_backward_matches_finite_difference() {
        let mut r = rng();
        let x = randn(2, 4, &mut r);
        // Loss = sum of first column of normalized output.
        let (y, norms) = l2_normalize_rows(&x);
        let mut d_y = Array2::zeros(y.raw_dim());
        d_y.column_mut(0).fill(1.0);
        let d_x = l2_normalize_backward(&y, &norms, &d_y);

        let eps = 1e-3f32;
        for &(i, j) in &[(0usize, 0usize), (1, 2)] {
            let mut up = x.clone();
            up[[i, j]] += eps;
            let mut down = x.clone();
            down[[i, j]] -= eps;
            let numeric = (l2_normalize_rows(&up).0.column(0).sum()
                - l2_normalize_rows(&down).0.column(0).sum())
                / (2.0 * eps);
            assert_relative_eq!(d_x[[i, j]], numeric, epsilon = 1e-2);
        }
    }

    #[test]
    fn style_policy_shapes() {
        let mut r = rng();
        let humanoid = small_humanoid();
        let policy = StylePolicy::new(&small_llc(), &humanoid, &mut r);
        let latents = randn(3, humanoid.latent_dim, &mut r);
        let obs = randn(3, humanoid.policy_obs_dim(), &mut r);

        let mean = policy.mean(&latents, &obs);
        assert_eq!(mean.dim(), (3, humanoid.num_dof));

        let (actions, log_probs) = policy.sample(&latents, &obs, &mut r);
        assert_eq!(actions.dim(), (3, humanoid.num_dof));
        assert_eq!(log_probs.len(), 3);
    }

    #[test]
    fn style_policy_evaluate_consistent_with_sample() {
        let mut r = rng();
        let humanoid = small_humanoid();
        let policy = StylePolicy::new(&small_llc(), &humanoid, &mut r);
        let latents = randn(4, humanoid.latent_dim, &mut r);
        let obs = randn(4, humanoid.policy_obs_dim(), &mut r);

        let (actions, sample_lp) = policy.sample(&latents, &obs, &mut r);
        let (eval_lp, _, _) = policy.evaluate(&latents, &obs, &actions);
        for (a, b) in sample_lp.iter().zip(eval_lp.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-4);
        }
    }

    #[test]
    fn style_policy_backward_matches_finite_difference() {
        let mut r = rng();
        let humanoid = small_humanoid();
        let policy = StylePolicy::new(&small_llc(), &humanoid, &mut r);
        let latents = randn(2, humanoid.latent_dim, &mut r);
        let obs = randn(2, humanoid.policy_obs_dim(), &mut r);

        // Loss = sum of the mean action matrix.
        let cache = policy.mean_cached(&latents, &obs);
        let upstream = Array2::ones(cache.mean.raw_dim());
        let mut grads = StyleGrads::zeros_like(&policy);
        policy.backward(&cache, &upstream, &mut grads);

        let eps = 1e-3f32;
        // Style MLP layer-0 weight entry (flows through tanh + main + mu).
        let mut up = policy.clone();
        up.style.layers_mut()[0].weight[[0, 0]] += eps;
        let mut down = policy.clone();
        down.style.layers_mut()[0].weight[[0, 0]] -= eps;
        let numeric =
            (up.mean(&latents, &obs).sum() - down.mean(&latents, &obs).sum()) / (2.0 * eps);
        assert_relative_eq!(grads.style.weights[0][[0, 0]], numeric, epsilon = 2e-2);

        // Mu-head weight entry.
        let mut up = policy.clone();
        up.mu_head.layers_mut()[0].weight[[1, 3]] += eps;
        let mut down = policy.clone();
        down.mu_head.layers_mut()[0].weight[[1, 3]] -= eps;
        let numeric =
            (up.mean(&latents, &obs).sum() - down.mean(&latents, &obs).sum()) / (2.0 * eps);
        assert_relative_eq!(grads.mu_head.weights[0][[1, 3]], numeric, epsilon = 2e-2);
    }

    #[test]
    fn value_net_scalar_output() {
        let mut r = rng();
        let net = ValueNet::new(8, &ValueConfig { hidden: vec![16] }, &mut r);
        let obs = randn(5, 8, &mut r);
        let v = net.forward(&obs);
        assert_eq!(v.len(), 5);
    }

    #[test]
    fn discriminator_pair_scoring() {
        let mut r = rng();
        let disc = Discriminator::new(10, &[16], &mut r);
        let t = randn(4, 10, &mut r);
        let t1 = randn(4, 10, &mut r);
        let scores = disc.score(&t, &t1);
        assert_eq!(scores.len(), 4);
        assert_eq!(disc.mlp.input_dim(), 20);
    }

    #[test]
    fn hlc_mean_is_unit_length() {
        let mut r = rng();
        let humanoid = small_humanoid();
        let task = HlcTaskConfig {
            hidden: vec![8],
            learning_rate: 3e-4,
            task_obs_dim: 2,
        };
        let hlc = HlcPolicy::new(&task, &humanoid, &mut r);
        let task_obs = randn(3, 2, &mut r);
        let mean = hlc.mean(&task_obs);
        for row in mean.rows() {
            assert_relative_eq!(row.dot(&row).sqrt(), 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn encoder_normalized_output() {
        let mut r = rng();
        let humanoid = small_humanoid();
        let config = EncoderConfig {
            hidden: vec![16],
            output_dim: 4,
            normalize_output: true,
        };
        let encoder = MotionEncoder::new(&config, &humanoid, &mut r);
        let obs = randn(3, humanoid.encoder_obs_dim(), &mut r);
        let z = encoder.encode(&obs);
        assert_eq!(z.dim(), (3, 4));
        for row in z.rows() {
            assert_relative_eq!(row.dot(&row).sqrt(), 1.0, epsilon = 1e-5);
        }
    }
}
