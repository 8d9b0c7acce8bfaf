//! Phase 1: low-level controller training.
//!
//! Per iteration: sample one L2-normalized latent per environment (held
//! fixed for the rollout), collect a fixed-horizon rollout where each
//! step's reward blends the discriminator's style reward with the task
//! (alive) reward, run the PPO update, then update the discriminator from
//! the real motion pool and the fake replay pool.

use std::path::PathBuf;

use ndarray::Array2;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::amp::{AmpMetrics, AmpTrainer};
use crate::checkpoint::{
    self, AdamState, LlcCheckpoint, MlpState, StylePolicyState,
};
use crate::config::CalmConfig;
use crate::env::{combine_rewards, CharacterEnv, SequentialVecEnv, StepInfo, VecEnv, WorkerVecEnv};
use crate::metrics::{MetricsLogger, TrainingSnapshot};
use crate::motion::MotionTransitionBuffer;
use crate::nn::export::export_llc;
use crate::nn::policy::{l2_normalize_rows, StylePolicy, ValueNet};
use crate::nn::randn;
use crate::ppo::{ppo_update, StyleActorCritic};
use crate::rollout::StyleRollout;

/// Discriminator minibatch cap per update.
const AMP_BATCH_SIZE: usize = 256;

/// Phase 1 trainer: style-conditioned PPO with an adversarial motion
/// prior.
pub struct LlcTrainer {
    config: CalmConfig,
    vec_env: Box<dyn VecEnv>,
    model: StyleActorCritic,
    amp: AmpTrainer,
    motion_buffer: MotionTransitionBuffer,
    buffer: StyleRollout,
    rng: ChaCha8Rng,
    output_dir: PathBuf,
    total_timesteps: usize,
    total_episodes: usize,
}

impl LlcTrainer {
    pub fn new(config: CalmConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let device = config.device.resolve();
        log::info!("device: {device}");

        let num_envs = config.effective_num_envs();
        let mut config = config;
        config.ppo.num_envs = num_envs;

        let clips = CharacterEnv::load_clips(&config, 20);
        let motion_buffer = CharacterEnv::build_transition_buffer(&config, &clips);

        let vec_env: Box<dyn VecEnv> = if config.parallel {
            let workers = if config.num_workers > 0 {
                config.num_workers
            } else {
                std::thread::available_parallelism()
                    .map(|n| n.get().saturating_sub(1).max(1))
                    .unwrap_or(1)
            };
            log::info!("creating {num_envs} environments across {workers} workers");
            Box::new(WorkerVecEnv::new(&config, num_envs, workers, config.seed))
        } else {
            log::info!("creating {num_envs} environments");
            Box::new(SequentialVecEnv::new(&config, num_envs, clips, config.seed))
        };

        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        let humanoid = &config.humanoid;
        let policy = StylePolicy::new(&config.llc_policy, humanoid, &mut rng);
        let value = ValueNet::new(humanoid.policy_obs_dim(), &config.value, &mut rng);
        log::info!(
            "LLC policy: latent_dim={}, obs_dim={}, act_dim={}",
            humanoid.latent_dim,
            humanoid.policy_obs_dim(),
            humanoid.num_dof
        );
        let model = StyleActorCritic::new(policy, value, config.ppo.learning_rate);
        let amp = AmpTrainer::new(&config.amp, humanoid, &mut rng);

        let buffer = StyleRollout::new(
            num_envs,
            config.ppo.horizon,
            humanoid.policy_obs_dim(),
            humanoid.num_dof,
            humanoid.latent_dim,
            humanoid.per_frame_obs_dim,
        );

        let output_dir = PathBuf::from(&config.output_dir);
        std::fs::create_dir_all(&output_dir)?;

        Ok(Self {
            config,
            vec_env,
            model,
            amp,
            motion_buffer,
            buffer,
            rng,
            output_dir,
            total_timesteps: 0,
            total_episodes: 0,
        })
    }

    /// Run the LLC training loop.
    pub fn train(&mut self, logger: &mut dyn MetricsLogger) -> anyhow::Result<()> {
        let ppo = self.config.ppo.clone();
        let amp_config = self.config.amp.clone();
        let humanoid = self.config.humanoid.clone();
        let num_envs = self.vec_env.num_envs();
        log::info!("starting LLC training for {} iterations", ppo.num_iterations);

        let mut obs = self.vec_env.reset();
        let mut episode_returns = vec![0.0f32; num_envs];

        for iteration in 0..ppo.num_iterations {
            // One style latent per environment, fixed for the rollout.
            let latents = l2_normalize_rows(&randn(num_envs, humanoid.latent_dim, &mut self.rng)).0;

            self.buffer.reset();
            let mut finished_episodes: Vec<f32> = Vec::new();
            let mut style_reward_sum = 0.0f32;

            for _step in 0..ppo.horizon {
                let (actions, log_probs) = self.model.policy.sample(&latents, &obs, &mut self.rng);
                let values = self.model.value.forward(&obs);

                let batch = self.vec_env.step(&actions);
                let (pair_t, pair_t1) = stack_pairs(&batch.infos, humanoid.per_frame_obs_dim);

                let style_reward = self.amp.compute_style_reward(&pair_t, &pair_t1);
                style_reward_sum += style_reward.mean().unwrap_or(0.0);
                let combined = combine_rewards(
                    &style_reward,
                    &batch.rewards,
                    amp_config.style_reward_weight,
                    amp_config.task_reward_weight,
                );

                for (e, (&done, &reward)) in
                    batch.dones.iter().zip(combined.iter()).enumerate()
                {
                    episode_returns[e] += reward;
                    if done {
                        finished_episodes.push(episode_returns[e]);
                        episode_returns[e] = 0.0;
                    }
                }

                self.buffer.add(
                    &obs,
                    &actions,
                    &log_probs,
                    &combined,
                    &batch.dones,
                    &values,
                    &latents,
                    &pair_t,
                    &pair_t1,
                );
                obs = batch.obs;
            }

            let bootstrap = self.model.value.forward(&obs);
            self.buffer.compute_gae(&bootstrap, ppo.gamma, ppo.gae_lambda);

            let data = self.buffer.flatten();
            let ppo_metrics = ppo_update(&mut self.model, &data, &ppo, &mut self.rng);

            // Feed the replay pool, then train the discriminator on real
            // motion transitions vs pooled policy transitions.
            let (fake_t, fake_t1) = self.buffer.flat_pairs();
            self.amp.push_fake(fake_t, fake_t1);

            let amp_batch = AMP_BATCH_SIZE.min(self.motion_buffer.len());
            let amp_metrics = if amp_batch > 0 {
                let (real_t, real_t1) = self.motion_buffer.sample(amp_batch, &mut self.rng);
                let (fake_t, fake_t1) = self.amp.sample_fake(amp_batch, &mut self.rng);
                self.amp.update(&real_t, &real_t1, &fake_t, &fake_t1)
            } else {
                AmpMetrics::default()
            };

            self.total_timesteps += num_envs * ppo.horizon;
            self.total_episodes += finished_episodes.len();

            let avg_reward = if finished_episodes.is_empty() {
                0.0
            } else {
                finished_episodes.iter().sum::<f32>() / finished_episodes.len() as f32
            };
            logger.log(
                &TrainingSnapshot::new(
                    iteration,
                    self.total_timesteps,
                    self.total_episodes,
                    avg_reward,
                )
                .with_ppo(
                    ppo_metrics.policy_loss,
                    ppo_metrics.value_loss,
                    ppo_metrics.entropy,
                )
                .with_amp(
                    amp_metrics.disc_loss,
                    amp_metrics.real_score,
                    amp_metrics.fake_score,
                    style_reward_sum / ppo.horizon as f32,
                ),
            );

            if iteration > 0 && iteration % ppo.checkpoint_interval == 0 {
                self.save(iteration)?;
            }
        }

        self.save(ppo.num_iterations)?;
        logger.flush();
        log::info!(
            "LLC training complete, total timesteps: {}",
            self.total_timesteps
        );
        Ok(())
    }

    fn save(&self, iteration: usize) -> anyhow::Result<()> {
        let bundle = LlcCheckpoint {
            iteration,
            total_timesteps: self.total_timesteps,
            policy: StylePolicyState::from_policy(&self.model.policy),
            value: MlpState::from_mlp(&self.model.value.mlp),
            discriminator: MlpState::from_mlp(&self.amp.discriminator.mlp),
            optimizer: AdamState::from_adam(&self.model.optimizer),
            disc_optimizer: AdamState::from_adam(self.amp.optimizer()),
        };
        let path = checkpoint::checkpoint_path(&self.output_dir, "llc", iteration);
        checkpoint::save_json(&path, &bundle)?;
        export_llc(&self.model.policy, &self.output_dir)?;
        Ok(())
    }

    /// Shut the execution layer down. Idempotent.
    pub fn close(&mut self) {
        self.vec_env.close();
    }
}

/// Stack the per-frame transition pairs out of a step's info records.
fn stack_pairs(infos: &[StepInfo], dim: usize) -> (Array2<f32>, Array2<f32>) {
    let mut obs_t = Array2::zeros((infos.len(), dim));
    let mut obs_t1 = Array2::zeros((infos.len(), dim));
    for (i, info) in infos.iter().enumerate() {
        obs_t
            .row_mut(i)
            .iter_mut()
            .zip(info.obs_t.iter())
            .for_each(|(dst, src)| *dst = *src);
        obs_t1
            .row_mut(i)
            .iter_mut()
            .zip(info.obs_t1.iter())
            .for_each(|(dst, src)| *dst = *src);
    }
    (obs_t, obs_t1)
}
