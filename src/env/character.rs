//! Single character training episode.
//!
//! State machine: `Uninitialized -> Reset -> Running* -> Terminal ->
//! Reset -> ...`. Resets draw a random reference motion frame and place
//! the body there with small pose noise; steps clamp the action, map it
//! onto the actuators, advance the physics oracle, and report the AMP
//! transition pair alongside the stacked policy observation.

use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::sim::{BodyState, CharacterSim, KinematicSim};
use super::PELVIS_DOFS;
use crate::config::CalmConfig;
use crate::math::heading_angle;
use crate::motion::MotionClip;
use crate::motion::MotionTransitionBuffer;
use crate::observation::ObservationExtractor;

/// Uniform pose noise applied at reference-state initialization.
const RESET_POSE_NOISE: f32 = 0.05;

/// Auxiliary per-step data.
///
/// `obs_t`/`obs_t1` are the pre-/post-step per-frame (unstacked)
/// observations — the unit of real-vs-fake comparison for the
/// discriminator. After a reset, `obs_t` is the frame produced during the
/// reset; it is all-zero only before the very first frame ever extracted.
#[derive(Debug, Clone)]
pub struct StepInfo {
    pub obs_t: Vec<f32>,
    pub obs_t1: Vec<f32>,
    pub root_height: f32,
    pub root_pos: [f32; 3],
    pub heading: f32,
    pub hand_pos: [f32; 3],
    pub episode_length: usize,
}

/// One character episode driven by an opaque physics oracle.
pub struct CharacterEnv {
    sim: Box<dyn CharacterSim>,
    extractor: ObservationExtractor,
    clips: Arc<Vec<MotionClip>>,
    rng: ChaCha8Rng,
    sim_timestep: f32,
    sim_substeps: usize,
    early_termination_height: f32,
    max_episode_steps: usize,
    num_dof: usize,
    episode_length: usize,
    prev_per_frame_obs: Option<Vec<f32>>,
    obs_dim: usize,
    act_dim: usize,
}

impl CharacterEnv {
    /// Build an environment around an explicit physics oracle.
    ///
    /// The logical-action-to-actuator mapping is fixed here and validated
    /// once: the oracle must expose exactly `num_dof - PELVIS_DOFS`
    /// position actuators.
    pub fn new(config: &CalmConfig, clips: Arc<Vec<MotionClip>>, sim: Box<dyn CharacterSim>) -> Self {
        let humanoid = &config.humanoid;
        assert_eq!(
            sim.num_dof(),
            humanoid.num_dof,
            "oracle DOF count does not match the configured skeleton"
        );
        assert_eq!(
            sim.num_actuators(),
            humanoid.num_dof - PELVIS_DOFS,
            "oracle actuator count does not match the action mapping"
        );
        Self {
            sim,
            extractor: ObservationExtractor::new(humanoid),
            clips,
            rng: ChaCha8Rng::seed_from_u64(42),
            sim_timestep: config.env.sim_timestep,
            sim_substeps: config.env.sim_substeps,
            early_termination_height: config.env.early_termination_height,
            max_episode_steps: config.env.max_episode_steps,
            num_dof: humanoid.num_dof,
            episode_length: 0,
            prev_per_frame_obs: None,
            obs_dim: humanoid.policy_obs_dim(),
            act_dim: humanoid.num_dof,
        }
    }

    /// Convenience constructor using the built-in kinematic oracle.
    pub fn with_kinematic_sim(config: &CalmConfig, clips: Arc<Vec<MotionClip>>) -> Self {
        let sim = KinematicSim::new(
            config.humanoid.num_dof,
            config.humanoid.num_key_bodies,
            config.env.sim_timestep,
            config.env.sim_substeps,
        );
        Self::new(config, clips, Box::new(sim))
    }

    pub fn obs_dim(&self) -> usize {
        self.obs_dim
    }

    pub fn act_dim(&self) -> usize {
        self.act_dim
    }

    /// Reset the episode. Draws a random clip and start offset, places the
    /// body there with pose noise, clears the observation history, and
    /// returns the first stacked policy observation.
    pub fn reset(&mut self, seed: Option<u64>) -> Vec<f32> {
        if let Some(seed) = seed {
            self.rng = ChaCha8Rng::seed_from_u64(seed);
        }
        self.extractor.reset();
        self.episode_length = 0;
        self.prev_per_frame_obs = None;

        let state = self.initial_state();
        self.sim.reset_to(&state);

        // Extract two frames so the policy's 2-step window is populated
        // and a pre-step frame exists for the first AMP pair.
        let frame = self.extract_per_frame_obs();
        self.prev_per_frame_obs = Some(frame);
        let frame = self.extract_per_frame_obs();
        self.prev_per_frame_obs = Some(frame);

        self.extractor.policy_obs()
    }

    /// Reference-state initialization: random clip, random frame offset,
    /// uniform pose noise.
    fn initial_state(&mut self) -> BodyState {
        let num_key_bodies = self.sim.state().key_body_positions.len();
        let mut state = BodyState::standing(self.num_dof, num_key_bodies, 1.0);

        if !self.clips.is_empty() {
            let clip_idx = self.rng.gen_range(0..self.clips.len());
            let clip = &self.clips[clip_idx];
            if !clip.is_empty() {
                let offset = self.rng.gen_range(0..clip.len().max(2) - 1);
                let frame = &clip.frames[offset.min(clip.len() - 1)];
                state.root_pos = frame.root_pos;
                state.root_rot = frame.root_rot;
                state.dof_positions = self
                    .extractor
                    .dof_positions_from_rotations(&frame.joint_rotations);
            }
        }

        for dof in state.dof_positions.iter_mut().skip(PELVIS_DOFS) {
            *dof += self.rng.gen_range(-RESET_POSE_NOISE..RESET_POSE_NOISE);
        }
        state
    }

    /// Advance one control tick.
    ///
    /// Returns `(policy_obs, reward, done, info)`. The reward is the alive
    /// bonus only; style and task rewards are combined by the caller. The
    /// `done` flag ORs fall detection with the episode-length cap and does
    /// not distinguish success from failure.
    pub fn step(&mut self, action: &[f32]) -> (Vec<f32>, f32, bool, StepInfo) {
        assert_eq!(action.len(), self.act_dim);

        let obs_t = self
            .prev_per_frame_obs
            .clone()
            .unwrap_or_else(|| vec![0.0; self.extractor.per_frame_obs_dim()]);

        // Map the logical action onto the actuators: clamp to [-1, 1],
        // skip the pelvis DOFs, scale into each control range.
        let ranges = self.sim.control_ranges().to_vec();
        let mut controls = vec![0.0f32; ranges.len()];
        for (a, &(low, high)) in ranges.iter().enumerate() {
            let v = action[a + PELVIS_DOFS].clamp(-1.0, 1.0);
            controls[a] = 0.5 * (low + high) + 0.5 * (high - low) * v;
        }

        self.sim.step(&controls, self.sim_substeps);
        self.episode_length += 1;

        let obs_t1 = self.extract_per_frame_obs();
        self.prev_per_frame_obs = Some(obs_t1.clone());

        let policy_obs = self.extractor.policy_obs();
        let state = self.sim.state();
        let root_height = state.root_pos[1];

        // Alive bonus; adversarial/task shaping is applied externally.
        let reward = 1.0;

        let done = root_height < self.early_termination_height
            || self.episode_length >= self.max_episode_steps;

        let info = StepInfo {
            obs_t,
            obs_t1,
            root_height,
            root_pos: state.root_pos,
            heading: heading_angle(state.root_rot),
            hand_pos: state
                .key_body_positions
                .get(1)
                .copied()
                .unwrap_or([0.0; 3]),
            episode_length: self.episode_length,
        };

        (policy_obs, reward, done, info)
    }

    fn extract_per_frame_obs(&mut self) -> Vec<f32> {
        let state = self.sim.state();
        self.extractor.extract_frame(
            state.root_pos,
            state.root_rot,
            state.root_lin_vel,
            state.root_ang_vel,
            &state.dof_positions,
            &state.key_body_positions,
            self.sim_timestep,
        )
    }

    /// Build the shared clip list for a set of environments, falling back
    /// to the synthetic standing clip when the directory has nothing.
    pub fn load_clips(config: &CalmConfig, num_joints: usize) -> Arc<Vec<MotionClip>> {
        let loaded =
            crate::motion::load_motion_directory(std::path::Path::new(&config.motion_dir), num_joints);
        if loaded.is_empty() {
            log::info!("no motion data found, using the standing clip for bootstrap");
            Arc::new(vec![crate::motion::standing_clip(num_joints)])
        } else {
            log::info!("loaded {} motion clips", loaded.len());
            Arc::new(loaded.into_values().collect())
        }
    }

    /// Build the real-transition pool from the same clips.
    pub fn build_transition_buffer(
        config: &CalmConfig,
        clips: &[MotionClip],
    ) -> MotionTransitionBuffer {
        let mut buffer = MotionTransitionBuffer::new(&config.humanoid);
        let n = buffer.extract_from_clips(
            clips.iter().map(|c| ("", c)),
            &config.humanoid,
        );
        log::info!("extracted {n} motion transitions for the discriminator");
        buffer
    }
}
