//! Task targets and reward shaping for HLC training.
//!
//! Each environment holds an independently sampled goal (heading angle,
//! target position, or strike target) regenerated whenever that
//! environment's episode terminates.

use ndarray::{Array1, Array2};
use rand::Rng;

use super::character::StepInfo;

/// HLC task kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    /// Face a target direction. Task obs: `(sin, cos)` of the target angle.
    Heading,
    /// Reach a target position. Task obs: target relative to the root.
    Location,
    /// Bring the hand to a strike target. Task obs: target + hand position.
    Strike,
}

impl Task {
    pub fn obs_dim(&self) -> usize {
        match self {
            Task::Heading => 2,
            Task::Location => 3,
            Task::Strike => 6,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Task::Heading => "heading",
            Task::Location => "location",
            Task::Strike => "strike",
        }
    }
}

impl std::str::FromStr for Task {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "heading" => Ok(Task::Heading),
            "location" => Ok(Task::Location),
            "strike" => Ok(Task::Strike),
            other => Err(format!(
                "unknown task '{other}' (expected heading|location|strike)"
            )),
        }
    }
}

/// Per-environment goal state and the task observation/reward mapping.
pub struct TaskGenerator {
    task: Task,
    num_envs: usize,
    target_headings: Vec<f32>,
    target_positions: Vec<[f32; 3]>,
}

impl TaskGenerator {
    pub fn new(task: Task, num_envs: usize) -> Self {
        Self {
            task,
            num_envs,
            target_headings: vec![0.0; num_envs],
            target_positions: vec![[0.0; 3]; num_envs],
        }
    }

    pub fn task(&self) -> Task {
        self.task
    }

    pub fn obs_dim(&self) -> usize {
        self.task.obs_dim()
    }

    /// Randomize targets for every environment.
    pub fn reset_all<R: Rng>(&mut self, rng: &mut R) {
        let mask = vec![true; self.num_envs];
        self.reset_targets(&mask, rng);
    }

    /// Randomize targets for the masked environments only.
    pub fn reset_targets<R: Rng>(&mut self, mask: &[bool], rng: &mut R) {
        assert_eq!(mask.len(), self.num_envs);
        for (i, &hit) in mask.iter().enumerate() {
            if !hit {
                continue;
            }
            match self.task {
                Task::Heading => {
                    self.target_headings[i] =
                        rng.gen_range(-std::f32::consts::PI..std::f32::consts::PI);
                }
                Task::Location => {
                    // Uniform over the arena at ground level.
                    self.target_positions[i] = [
                        rng.gen_range(-3.0..3.0),
                        0.0,
                        rng.gen_range(-3.0..3.0),
                    ];
                }
                Task::Strike => {
                    // Above the ground, within arm's reach.
                    self.target_positions[i] = [
                        rng.gen_range(-1.0..1.0),
                        rng.gen_range(-1.0..1.0) + 1.0,
                        rng.gen_range(-1.0..1.0),
                    ];
                }
            }
        }
    }

    /// Task observations for the current environment states.
    pub fn task_obs(&self, infos: &[StepInfo]) -> Array2<f32> {
        assert_eq!(infos.len(), self.num_envs);
        let mut obs = Array2::zeros((self.num_envs, self.obs_dim()));
        for (i, info) in infos.iter().enumerate() {
            match self.task {
                Task::Heading => {
                    obs[[i, 0]] = self.target_headings[i].sin();
                    obs[[i, 1]] = self.target_headings[i].cos();
                }
                Task::Location => {
                    let target = self.target_positions[i];
                    for k in 0..3 {
                        obs[[i, k]] = target[k] - info.root_pos[k];
                    }
                }
                Task::Strike => {
                    let target = self.target_positions[i];
                    for k in 0..3 {
                        obs[[i, k]] = target[k];
                        obs[[i, 3 + k]] = info.hand_pos[k];
                    }
                }
            }
        }
        obs
    }

    /// Task reward per environment, bounded to (0, 1].
    pub fn reward(&self, infos: &[StepInfo]) -> Vec<f32> {
        assert_eq!(infos.len(), self.num_envs);
        infos
            .iter()
            .enumerate()
            .map(|(i, info)| match self.task {
                Task::Heading => {
                    let mut diff = (info.heading - self.target_headings[i]).abs();
                    diff = diff.min(2.0 * std::f32::consts::PI - diff);
                    (-2.0 * diff).exp()
                }
                Task::Location => {
                    let d = distance(info.root_pos, self.target_positions[i]);
                    (-d).exp()
                }
                Task::Strike => {
                    let d = distance(info.hand_pos, self.target_positions[i]);
                    (-5.0 * d).exp()
                }
            })
            .collect()
    }
}

fn distance(a: [f32; 3], b: [f32; 3]) -> f32 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    let dz = a[2] - b[2];
    (dx * dx + dy * dy + dz * dz).sqrt()
}

/// Weighted combination of the adversarial style reward and a task reward:
/// `r = w_style * r_style + w_task * r_task`.
pub fn combine_rewards(
    style_reward: &Array1<f32>,
    task_reward: &[f32],
    style_weight: f32,
    task_weight: f32,
) -> Array1<f32> {
    assert_eq!(style_reward.len(), task_reward.len());
    Array1::from_iter(
        style_reward
            .iter()
            .zip(task_reward.iter())
            .map(|(&s, &t)| style_weight * s + task_weight * t),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn info(root_pos: [f32; 3], heading: f32, hand_pos: [f32; 3]) -> StepInfo {
        StepInfo {
            obs_t: vec![],
            obs_t1: vec![],
            root_height: root_pos[1],
            root_pos,
            heading,
            hand_pos,
            episode_length: 0,
        }
    }

    #[test]
    fn task_obs_dims() {
        assert_eq!(Task::Heading.obs_dim(), 2);
        assert_eq!(Task::Location.obs_dim(), 3);
        assert_eq!(Task::Strike.obs_dim(), 6);
    }

    #[test]
    fn task_parse() {
        assert_eq!("heading".parse::<Task>().unwrap(), Task::Heading);
        assert_eq!("strike".parse::<Task>().unwrap(), Task::Strike);
        assert!("fly".parse::<Task>().is_err());
    }

    #[test]
    fn heading_reward_peaks_at_target() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let mut gen = TaskGenerator::new(Task::Heading, 1);
        gen.reset_all(&mut rng);
        let target = gen.target_headings[0];

        let aligned = gen.reward(&[info([0.0; 3], target, [0.0; 3])]);
        assert_relative_eq!(aligned[0], 1.0, epsilon = 1e-5);

        let off = gen.reward(&[info([0.0; 3], target + 1.0, [0.0; 3])]);
        assert!(off[0] < aligned[0]);
    }

    #[test]
    fn heading_reward_wraps_around() {
        let mut gen = TaskGenerator::new(Task::Heading, 1);
        gen.target_headings[0] = std::f32::consts::PI - 0.05;
        // A heading just past -pi is angularly close to the target.
        let r = gen.reward(&[info([0.0; 3], -std::f32::consts::PI + 0.05, [0.0; 3])]);
        assert!(r[0] > (-2.0f32 * 0.2).exp());
    }

    #[test]
    fn location_obs_is_relative() {
        let mut gen = TaskGenerator::new(Task::Location, 1);
        gen.target_positions[0] = [2.0, 0.0, -1.0];
        let obs = gen.task_obs(&[info([0.5, 1.0, 0.5], 0.0, [0.0; 3])]);
        assert_relative_eq!(obs[[0, 0]], 1.5, epsilon = 1e-6);
        assert_relative_eq!(obs[[0, 2]], -1.5, epsilon = 1e-6);
    }

    #[test]
    fn location_reward_decays_with_distance() {
        let mut gen = TaskGenerator::new(Task::Location, 2);
        gen.target_positions = vec![[1.0, 0.0, 0.0]; 2];
        let rewards = gen.reward(&[
            info([1.0, 0.0, 0.0], 0.0, [0.0; 3]),
            info([3.0, 0.0, 0.0], 0.0, [0.0; 3]),
        ]);
        assert_relative_eq!(rewards[0], 1.0, epsilon = 1e-5);
        assert_relative_eq!(rewards[1], (-2.0f32).exp(), epsilon = 1e-5);
    }

    #[test]
    fn strike_obs_holds_target_and_hand() {
        let mut gen = TaskGenerator::new(Task::Strike, 1);
        gen.target_positions[0] = [0.5, 1.2, 0.0];
        let obs = gen.task_obs(&[info([0.0; 3], 0.0, [0.1, 0.9, 0.2])]);
        assert_relative_eq!(obs[[0, 1]], 1.2, epsilon = 1e-6);
        assert_relative_eq!(obs[[0, 4]], 0.9, epsilon = 1e-6);
    }

    #[test]
    fn masked_reset_only_touches_done_envs() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let mut gen = TaskGenerator::new(Task::Heading, 3);
        gen.reset_all(&mut rng);
        let before = gen.target_headings.clone();
        gen.reset_targets(&[false, true, false], &mut rng);
        assert_eq!(gen.target_headings[0], before[0]);
        assert_eq!(gen.target_headings[2], before[2]);
        assert_ne!(gen.target_headings[1], before[1]);
    }

    #[test]
    fn combine_rewards_weighted_sum() {
        let style = Array1::from_vec(vec![1.0, 0.0]);
        let task = vec![0.0, 1.0];
        let combined = combine_rewards(&style, &task, 0.5, 0.5);
        assert_relative_eq!(combined[0], 0.5, epsilon = 1e-6);
        assert_relative_eq!(combined[1], 0.5, epsilon = 1e-6);
    }
}
