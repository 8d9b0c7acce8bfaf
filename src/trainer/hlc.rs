//! Phase 3: task-specific high-level controller training.
//!
//! The HLC maps task observations to latent commands; a frozen LLC maps
//! (latent, observation) to joint actions. PPO runs over the task
//! observation / latent command stream with task-shaped rewards, reusing
//! the same buffer and update machinery as phase 1.

use std::path::{Path, PathBuf};

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::checkpoint::{self, AdamState, HlcCheckpoint, MlpState};
use crate::config::{CalmConfig, HlcTaskConfig, ValueConfig};
use crate::env::{CharacterEnv, SequentialVecEnv, StepInfo, Task, TaskGenerator, VecEnv};
use crate::metrics::{MetricsLogger, TrainingSnapshot};
use crate::nn::export::export_hlc;
use crate::nn::policy::{l2_normalize_rows, HlcPolicy, StylePolicy, ValueNet};
use crate::ppo::{ppo_update, HlcActorCritic};
use crate::rollout::RolloutBuffer;

/// Phase 3 trainer: task PPO against a frozen LLC.
pub struct HlcTrainer {
    config: CalmConfig,
    task: Task,
    vec_env: SequentialVecEnv,
    llc: StylePolicy,
    model: HlcActorCritic,
    task_gen: TaskGenerator,
    buffer: RolloutBuffer,
    rng: ChaCha8Rng,
    output_dir: PathBuf,
    total_timesteps: usize,
    total_episodes: usize,
}

impl HlcTrainer {
    pub fn new(config: CalmConfig, task: Task) -> anyhow::Result<Self> {
        config.validate()?;
        let device = config.device.resolve();
        log::info!("device: {device}");

        let num_envs = config.effective_num_envs();
        let mut config = config;
        config.ppo.num_envs = num_envs;

        let clips = CharacterEnv::load_clips(&config, 20);
        log::info!("creating {num_envs} environments");
        let vec_env = SequentialVecEnv::new(&config, num_envs, clips, config.seed);

        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        let humanoid = &config.humanoid;
        let task_config = task_config_for(&config, task).clone();

        // Fresh LLC weights unless a phase-1 checkpoint is loaded.
        let llc = StylePolicy::new(&config.llc_policy, humanoid, &mut rng);

        let hlc = HlcPolicy::new(&task_config, humanoid, &mut rng);
        let value = ValueNet::new(
            task_config.task_obs_dim,
            &ValueConfig {
                hidden: task_config.hidden.clone(),
            },
            &mut rng,
        );
        log::info!(
            "HLC ({}): task_obs_dim={}, latent_dim={}",
            task.name(),
            task_config.task_obs_dim,
            humanoid.latent_dim
        );
        let model = HlcActorCritic::new(hlc, value, task_config.learning_rate);

        let task_gen = TaskGenerator::new(task, num_envs);
        let buffer = RolloutBuffer::new(
            num_envs,
            config.ppo.horizon,
            task_config.task_obs_dim,
            humanoid.latent_dim,
        );

        let output_dir = PathBuf::from(&config.output_dir);
        std::fs::create_dir_all(&output_dir)?;

        Ok(Self {
            config,
            task,
            vec_env,
            llc,
            model,
            task_gen,
            buffer,
            rng,
            output_dir,
            total_timesteps: 0,
            total_episodes: 0,
        })
    }

    /// Replace the LLC with frozen weights from a phase-1 checkpoint.
    pub fn load_llc_checkpoint(&mut self, path: &Path) -> anyhow::Result<()> {
        self.llc = checkpoint::load_llc_policy(path)?;
        log::info!("loaded frozen LLC from {}", path.display());
        Ok(())
    }

    /// Run the HLC training loop.
    pub fn train(&mut self, logger: &mut dyn MetricsLogger) -> anyhow::Result<()> {
        let ppo = self.config.ppo.clone();
        let num_envs = self.vec_env.num_envs();
        log::info!(
            "starting HLC ({}) training for {} iterations",
            self.task.name(),
            ppo.num_iterations
        );

        let mut obs = self.vec_env.reset();
        self.task_gen.reset_all(&mut self.rng);
        // No step has run yet: task observations start from neutral state.
        let mut last_infos: Vec<StepInfo> = (0..num_envs)
            .map(|_| neutral_info(self.config.humanoid.per_frame_obs_dim))
            .collect();
        let mut episode_returns = vec![0.0f32; num_envs];

        for iteration in 0..ppo.num_iterations {
            self.buffer.reset();
            let mut finished_episodes: Vec<f32> = Vec::new();

            for _step in 0..ppo.horizon {
                let task_obs = self.task_gen.task_obs(&last_infos);

                // HLC emits a latent command; the frozen LLC turns it into
                // joint actions.
                let (latents, log_probs) = self.model.policy.sample(&task_obs, &mut self.rng);
                let commands = l2_normalize_rows(&latents).0;
                let actions = self.llc.mean(&commands, &obs);

                let batch = self.vec_env.step(&actions);
                let rewards = self.task_gen.reward(&batch.infos);
                let values = self.model.value.forward(&task_obs);

                for (e, (&done, &reward)) in
                    batch.dones.iter().zip(rewards.iter()).enumerate()
                {
                    episode_returns[e] += reward;
                    if done {
                        finished_episodes.push(episode_returns[e]);
                        episode_returns[e] = 0.0;
                    }
                }

                self.buffer.add(
                    &task_obs,
                    &latents,
                    &log_probs,
                    &ndarray::Array1::from_vec(rewards),
                    &batch.dones,
                    &values,
                );

                // Fresh goals for environments that just terminated.
                self.task_gen.reset_targets(&batch.dones, &mut self.rng);
                last_infos = batch.infos;
                obs = batch.obs;
            }

            let final_task_obs = self.task_gen.task_obs(&last_infos);
            let bootstrap = self.model.value.forward(&final_task_obs);
            self.buffer.compute_gae(&bootstrap, ppo.gamma, ppo.gae_lambda);

            let data = self.buffer.flatten();
            let metrics = ppo_update(&mut self.model, &data, &ppo, &mut self.rng);

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
                .with_ppo(metrics.policy_loss, metrics.value_loss, metrics.entropy),
            );

            if iteration > 0 && iteration % ppo.checkpoint_interval == 0 {
                self.save(iteration)?;
            }
        }

        self.save(ppo.num_iterations)?;
        logger.flush();
        log::info!("HLC ({}) training complete", self.task.name());
        Ok(())
    }

    fn save(&self, iteration: usize) -> anyhow::Result<()> {
        let bundle = HlcCheckpoint {
            iteration,
            total_timesteps: self.total_timesteps,
            hlc: MlpState::from_mlp(&self.model.policy.mlp),
            hlc_log_std: self.model.policy.log_std.to_vec(),
            value: MlpState::from_mlp(&self.model.value.mlp),
            optimizer: AdamState::from_adam(&self.model.optimizer),
        };
        let prefix = format!("hlc_{}", self.task.name());
        let path = checkpoint::checkpoint_path(&self.output_dir, &prefix, iteration);
        checkpoint::save_json(&path, &bundle)?;
        export_hlc(&self.model.policy, self.task.name(), &self.output_dir)?;
        Ok(())
    }

    /// Shut the execution layer down. Idempotent.
    pub fn close(&mut self) {
        self.vec_env.close();
    }
}

fn task_config_for(config: &CalmConfig, task: Task) -> &HlcTaskConfig {
    match task {
        Task::Heading => &config.hlc.heading,
        Task::Location => &config.hlc.location,
        Task::Strike => &config.hlc.strike,
    }
}

fn neutral_info(per_frame_obs_dim: usize) -> StepInfo {
    StepInfo {
        obs_t: vec![0.0; per_frame_obs_dim],
        obs_t1: vec![0.0; per_frame_obs_dim],
        root_height: 1.0,
        root_pos: [0.0, 1.0, 0.0],
        heading: 0.0,
        hand_pos: [0.0; 3],
        episode_length: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{
        checkpoint_path, save_json, LlcCheckpoint, StylePolicyState,
    };
    use crate::metrics::ConsoleLogger;
    use crate::nn::{Activation, Adam, Mlp};
    use rand_chacha::ChaCha8Rng;

    fn tiny_config(dir: &std::path::Path) -> CalmConfig {
        let mut c = CalmConfig::new().with_num_envs(2).with_iterations(2);
        c.motion_dir = "/nonexistent/motions".to_string();
        c.output_dir = dir.to_string_lossy().to_string();
        c.ppo.horizon = 4;
        c.ppo.minibatch_size = 8;
        c.ppo.num_epochs = 1;
        c.ppo.checkpoint_interval = 100;
        c.llc_policy.style_hidden = vec![8];
        c.llc_policy.main_hidden = vec![16, 8];
        c.value.hidden = vec![16];
        c.hlc.heading.hidden = vec![16];
        c
    }

    #[test]
    fn two_iterations_produce_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let config = tiny_config(dir.path());
        let mut trainer = HlcTrainer::new(config, Task::Heading).unwrap();
        let mut logger = ConsoleLogger::new(1);
        trainer.train(&mut logger).unwrap();
        trainer.close();

        assert!(dir
            .path()
            .join("hlc_heading_checkpoint_000002.json")
            .exists());
        assert!(dir.path().join("hlc_heading.bin").exists());
    }

    #[test]
    fn loads_frozen_llc_from_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let config = tiny_config(dir.path());

        // Write a phase-1 bundle whose policy we can recognize.
        let mut rng = ChaCha8Rng::seed_from_u64(99);
        let llc = StylePolicy::new(&config.llc_policy, &config.humanoid, &mut rng);
        let dummy = MlpState::from_mlp(&Mlp::new(
            4,
            &[4],
            1,
            Activation::Relu,
            Activation::None,
            &mut rng,
        ));
        let bundle = LlcCheckpoint {
            iteration: 1,
            total_timesteps: 1,
            policy: StylePolicyState::from_policy(&llc),
            value: dummy.clone(),
            discriminator: dummy,
            optimizer: AdamState::from_adam(&Adam::new(1e-3)),
            disc_optimizer: AdamState::from_adam(&Adam::new(1e-4)),
        };
        let llc_path = checkpoint_path(dir.path(), "llc", 1);
        save_json(&llc_path, &bundle).unwrap();

        let mut trainer = HlcTrainer::new(config, Task::Location).unwrap();
        trainer.load_llc_checkpoint(&llc_path).unwrap();
        assert_eq!(
            trainer.llc.log_std.to_vec(),
            llc.log_std.to_vec()
        );
        trainer.close();
    }
}
