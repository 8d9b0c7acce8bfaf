//! Real-transition pool for discriminator training.
//!
//! Pre-extracts `(obs_t, obs_t1)` pairs of consecutive per-frame
//! observations from all motion clips once at startup. Immutable after
//! construction; sampled with replacement.

use ndarray::Array2;
use rand::Rng;

use super::clip::MotionClip;
use crate::config::HumanoidConfig;
use crate::observation::ObservationExtractor;

/// Joint indices of the tracked key bodies in the motion skeleton:
/// head, r_hand, l_hand, r_foot, l_foot.
pub(crate) const KEY_BODY_JOINT_INDICES: [usize; 5] = [4, 13, 9, 19, 16];

/// Pre-extracted real `(obs_t, obs_t1)` transition pairs.
pub struct MotionTransitionBuffer {
    obs_dim: usize,
    obs_t: Vec<Vec<f32>>,
    obs_t1: Vec<Vec<f32>>,
}

impl MotionTransitionBuffer {
    pub fn new(humanoid: &HumanoidConfig) -> Self {
        Self {
            obs_dim: humanoid.per_frame_obs_dim,
            obs_t: Vec::new(),
            obs_t1: Vec::new(),
        }
    }

    /// Extract transition pairs from all clips. Pairs containing any
    /// non-finite value are dropped (the count is logged). Returns the
    /// total number of stored transitions.
    pub fn extract_from_clips<'a>(
        &mut self,
        clips: impl IntoIterator<Item = (&'a str, &'a MotionClip)>,
        humanoid: &HumanoidConfig,
    ) -> usize {
        let mut removed = 0usize;
        for (_name, clip) in clips {
            let frame_obs = extract_clip_observations(clip, humanoid);
            for pair in frame_obs.windows(2) {
                let finite =
                    pair[0].iter().all(|v| v.is_finite()) && pair[1].iter().all(|v| v.is_finite());
                if finite {
                    self.obs_t.push(pair[0].clone());
                    self.obs_t1.push(pair[1].clone());
                } else {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            log::warn!("removed {removed} motion transitions with non-finite values");
        }
        self.obs_t.len()
    }

    pub fn len(&self) -> usize {
        self.obs_t.len()
    }

    pub fn is_empty(&self) -> bool {
        self.obs_t.is_empty()
    }

    /// Sample `batch_size` transition pairs with replacement. An empty
    /// pool yields zero matrices.
    pub fn sample<R: Rng>(&self, batch_size: usize, rng: &mut R) -> (Array2<f32>, Array2<f32>) {
        let mut obs_t = Array2::zeros((batch_size, self.obs_dim));
        let mut obs_t1 = Array2::zeros((batch_size, self.obs_dim));
        if self.obs_t.is_empty() {
            return (obs_t, obs_t1);
        }
        for i in 0..batch_size {
            let idx = rng.gen_range(0..self.obs_t.len());
            obs_t
                .row_mut(i)
                .iter_mut()
                .zip(self.obs_t[idx].iter())
                .for_each(|(dst, src)| *dst = *src);
            obs_t1
                .row_mut(i)
                .iter_mut()
                .zip(self.obs_t1[idx].iter())
                .for_each(|(dst, src)| *dst = *src);
        }
        (obs_t, obs_t1)
    }
}

/// Per-frame observations of a whole clip with a fresh extractor, using
/// finite-difference velocities against the previous frame.
pub(crate) fn extract_clip_observations(
    clip: &MotionClip,
    humanoid: &HumanoidConfig,
) -> Vec<Vec<f32>> {
    let dt = clip.frame_dt();
    let mut extractor = ObservationExtractor::new(humanoid);
    let mut out = Vec::with_capacity(clip.frames.len());

    for (i, frame) in clip.frames.iter().enumerate() {
        let key_bodies = key_body_positions(frame.joint_positions.as_slice(), humanoid);
        let prev = if i > 0 { Some(&clip.frames[i - 1]) } else { None };
        let obs = extractor.extract_frame_from_motion(
            frame.root_pos,
            frame.root_rot,
            &frame.joint_rotations,
            &key_bodies,
            dt,
            prev.map(|f| f.root_pos),
            prev.map(|f| f.root_rot),
        );
        out.push(obs);
    }
    out
}

/// Pick the key body positions out of the full joint position list,
/// zero-filling slots whose joint index is out of range.
pub(crate) fn key_body_positions(
    joint_positions: &[[f32; 3]],
    humanoid: &HumanoidConfig,
) -> Vec<[f32; 3]> {
    let mut out = vec![[0.0f32; 3]; humanoid.num_key_bodies];
    for (k, &idx) in KEY_BODY_JOINT_INDICES
        .iter()
        .take(humanoid.num_key_bodies)
        .enumerate()
    {
        if idx < joint_positions.len() {
            out[k] = joint_positions[idx];
        }
    }
    out
}
