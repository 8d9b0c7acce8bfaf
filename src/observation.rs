//! Per-frame observation extraction and temporal stacking.
//!
//! Per-frame layout (102 dims for the default humanoid):
//!
//! ```text
//! root_height(1) + heading-free_root_rot_6D(6) + heading-frame_lin_vel(3) +
//! heading-frame_ang_vel(3) + dof_positions(37) + dof_velocities(37) +
//! key_body_positions_rel_root_in_heading_frame(5*3) = 102
//! ```
//!
//! Coordinate system: Y-up, forward axis (0, 0, 1).

use std::collections::VecDeque;

use crate::config::HumanoidConfig;
use crate::math::{
    heading_angle, matrix_to_euler_xyz, quat_inverse, quat_mul, quat_normalize,
    quat_to_axis_angle, quat_to_rotation_matrix, quat_to_tan_norm_6d, remove_heading,
    rotate_to_heading_frame,
};

/// Angular velocities from finite differences are clamped here to reject
/// differentiation spikes from quaternion wrap-around or bad motion data.
const MAX_ANG_VEL: f32 = 50.0;

/// Observation values are sanitized into this range; physics and motion
/// data occasionally emit non-finite values at contact discontinuities.
const OBS_CLAMP: f32 = 100.0;

/// Joint-to-DOF map: each joint contributes its Euler XYZ angles (all
/// three, or just X for hinge joints) to the 37-entry DOF vector.
const JOINT_DOF_MAP: [(usize, &[usize]); 15] = [
    (0, &[0, 1, 2]),  // pelvis
    (1, &[0, 1, 2]),  // abdomen
    (2, &[0, 1, 2]),  // chest
    (3, &[0, 1, 2]),  // neck
    (4, &[0, 1, 2]),  // head
    (5, &[0, 1, 2]),  // r_upper_arm
    (6, &[0]),        // r_lower_arm (elbow)
    (7, &[0, 1, 2]),  // l_upper_arm
    (8, &[0]),        // l_lower_arm (elbow)
    (9, &[0, 1, 2]),  // r_thigh
    (10, &[0]),       // r_shin (knee)
    (11, &[0, 1, 2]), // r_foot (ankle)
    (12, &[0, 1, 2]), // l_thigh
    (13, &[0]),       // l_shin (knee)
    (14, &[0, 1, 2]), // l_foot (ankle)
];

/// Extracts per-frame observations and maintains a temporal history ring
/// for stacked policy/encoder observations.
#[derive(Debug, Clone)]
pub struct ObservationExtractor {
    per_frame_obs_dim: usize,
    num_dof: usize,
    num_key_bodies: usize,
    num_policy_obs_steps: usize,
    num_encoder_obs_steps: usize,
    max_history: usize,
    history: VecDeque<Vec<f32>>,
    prev_dof_positions: Vec<f32>,
    prev_root_rot: [f32; 4],
    has_previous: bool,
}

impl ObservationExtractor {
    pub fn new(config: &HumanoidConfig) -> Self {
        let max_history = config.num_policy_obs_steps.max(config.num_encoder_obs_steps);
        Self {
            per_frame_obs_dim: config.per_frame_obs_dim,
            num_dof: config.num_dof,
            num_key_bodies: config.num_key_bodies,
            num_policy_obs_steps: config.num_policy_obs_steps,
            num_encoder_obs_steps: config.num_encoder_obs_steps,
            max_history,
            history: VecDeque::with_capacity(max_history),
            prev_dof_positions: vec![0.0; config.num_dof],
            prev_root_rot: [1.0, 0.0, 0.0, 0.0],
            has_previous: false,
        }
    }

    /// Clear history and previous-frame state.
    pub fn reset(&mut self) {
        self.history.clear();
        self.prev_dof_positions.iter_mut().for_each(|v| *v = 0.0);
        self.prev_root_rot = [1.0, 0.0, 0.0, 0.0];
        self.has_previous = false;
    }

    pub fn per_frame_obs_dim(&self) -> usize {
        self.per_frame_obs_dim
    }

    /// Extract a single frame observation from physics state and append it
    /// to the history.
    ///
    /// `key_body_positions` holds `num_key_bodies` world positions.
    pub fn extract_frame(
        &mut self,
        root_pos: [f32; 3],
        root_rot: [f32; 4],
        root_vel: [f32; 3],
        root_ang_vel: [f32; 3],
        dof_positions: &[f32],
        key_body_positions: &[[f32; 3]],
        delta_time: f32,
    ) -> Vec<f32> {
        assert_eq!(dof_positions.len(), self.num_dof);
        assert_eq!(key_body_positions.len(), self.num_key_bodies);

        let mut obs = vec![0.0f32; self.per_frame_obs_dim];
        let mut idx = 0;

        // 1) Root height (Y-up)
        obs[idx] = root_pos[1];
        idx += 1;

        // 2) Heading-invariant root rotation (6D)
        let heading_free = remove_heading(root_rot);
        obs[idx..idx + 6].copy_from_slice(&quat_to_tan_norm_6d(heading_free));
        idx += 6;

        // 3) Root linear velocity in heading frame
        let heading = heading_angle(root_rot);
        let local_vel = rotate_to_heading_frame(root_vel, heading);
        obs[idx..idx + 3].copy_from_slice(&local_vel);
        idx += 3;

        // 4) Root angular velocity in heading frame (zero without a
        //    previous frame to difference against)
        if self.has_previous && delta_time > 0.0 {
            let local_ang_vel = rotate_to_heading_frame(root_ang_vel, heading);
            obs[idx..idx + 3].copy_from_slice(&local_ang_vel);
        }
        idx += 3;

        // 5) DOF positions
        obs[idx..idx + self.num_dof].copy_from_slice(dof_positions);
        idx += self.num_dof;

        // 6) DOF velocities via finite difference
        if self.has_previous && delta_time > 0.0 {
            for j in 0..self.num_dof {
                obs[idx + j] = (dof_positions[j] - self.prev_dof_positions[j]) / delta_time;
            }
        }
        idx += self.num_dof;

        // 7) Key body positions relative to root, in heading frame
        for kb in key_body_positions {
            let rel = [
                kb[0] - root_pos[0],
                kb[1] - root_pos[1],
                kb[2] - root_pos[2],
            ];
            let local = rotate_to_heading_frame(rel, heading);
            obs[idx..idx + 3].copy_from_slice(&local);
            idx += 3;
        }

        assert_eq!(idx, self.per_frame_obs_dim);

        sanitize(&mut obs);

        if self.history.len() == self.max_history {
            self.history.pop_front();
        }
        self.history.push_back(obs.clone());
        self.prev_dof_positions.copy_from_slice(dof_positions);
        self.prev_root_rot = root_rot;
        self.has_previous = true;

        obs
    }

    /// Extract an observation from motion-clip data, computing velocities
    /// by finite differences when a previous frame is supplied.
    #[allow(clippy::too_many_arguments)]
    pub fn extract_frame_from_motion(
        &mut self,
        root_pos: [f32; 3],
        root_rot: [f32; 4],
        joint_rotations: &[[f32; 4]],
        key_body_positions: &[[f32; 3]],
        delta_time: f32,
        prev_root_pos: Option<[f32; 3]>,
        prev_root_rot: Option<[f32; 4]>,
    ) -> Vec<f32> {
        let root_vel = match prev_root_pos {
            Some(prev) if delta_time > 0.0 => [
                (root_pos[0] - prev[0]) / delta_time,
                (root_pos[1] - prev[1]) / delta_time,
                (root_pos[2] - prev[2]) / delta_time,
            ],
            _ => [0.0; 3],
        };

        let root_ang_vel = match prev_root_rot {
            Some(prev) if delta_time > 0.0 => {
                let delta_rot = quat_normalize(quat_mul(root_rot, quat_inverse(prev)));
                let (axis, angle) = quat_to_axis_angle(delta_rot);
                let scale = angle / delta_time;
                [
                    (axis[0] * scale).clamp(-MAX_ANG_VEL, MAX_ANG_VEL),
                    (axis[1] * scale).clamp(-MAX_ANG_VEL, MAX_ANG_VEL),
                    (axis[2] * scale).clamp(-MAX_ANG_VEL, MAX_ANG_VEL),
                ]
            }
            _ => [0.0; 3],
        };

        let dof_positions = self.dof_positions_from_rotations(joint_rotations);

        self.extract_frame(
            root_pos,
            root_rot,
            root_vel,
            root_ang_vel,
            &dof_positions,
            key_body_positions,
            delta_time,
        )
    }

    /// Decompose joint quaternions into the DOF vector via Euler XYZ.
    pub fn dof_positions_from_rotations(&self, joint_rotations: &[[f32; 4]]) -> Vec<f32> {
        let mut dof_positions = vec![0.0f32; self.num_dof];
        let mut dof_idx = 0;
        for &(joint_idx, axes) in JOINT_DOF_MAP.iter() {
            if joint_idx < joint_rotations.len() {
                let m = quat_to_rotation_matrix(joint_rotations[joint_idx]);
                let euler = matrix_to_euler_xyz(&m);
                for &axis in axes {
                    if dof_idx < self.num_dof {
                        dof_positions[dof_idx] = euler[axis];
                    }
                    dof_idx += 1;
                }
            } else {
                dof_idx += axes.len();
            }
        }
        dof_positions
    }

    /// Most recent frame, if any.
    pub fn last_frame(&self) -> Option<&[f32]> {
        self.history.back().map(|f| f.as_slice())
    }

    /// Stacked observation for the policy (oldest to newest).
    pub fn policy_obs(&self) -> Vec<f32> {
        self.stacked_obs(self.num_policy_obs_steps)
    }

    /// Stacked observation for the encoder (oldest to newest).
    pub fn encoder_obs(&self) -> Vec<f32> {
        self.stacked_obs(self.num_encoder_obs_steps)
    }

    /// Stack the most recent `num_steps` frames oldest-first, left-padding
    /// with zeros when fewer frames have been recorded since the last
    /// reset. The oldest-first ordering is load-bearing: downstream
    /// networks are trained on it.
    pub fn stacked_obs(&self, num_steps: usize) -> Vec<f32> {
        let dim = self.per_frame_obs_dim;
        let mut stacked = vec![0.0f32; num_steps * dim];
        let available = num_steps.min(self.history.len());
        for s in 0..available {
            let frame_idx = self.history.len() - available + s;
            let offset = (num_steps - available + s) * dim;
            stacked[offset..offset + dim].copy_from_slice(&self.history[frame_idx]);
        }
        stacked
    }
}

/// Replace non-finite values and clamp into the observation range.
fn sanitize(obs: &mut [f32]) {
    for v in obs.iter_mut() {
        if v.is_nan() {
            *v = 0.0;
        } else if *v == f32::INFINITY {
            *v = OBS_CLAMP;
        } else if *v == f32::NEG_INFINITY {
            *v = -OBS_CLAMP;
        }
        *v = v.clamp(-OBS_CLAMP, OBS_CLAMP);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn config() -> HumanoidConfig {
        HumanoidConfig::default()
    }

    fn extract_height(extractor: &mut ObservationExtractor, height: f32) -> Vec<f32> {
        extractor.extract_frame(
            [0.0, height, 0.0],
            [1.0, 0.0, 0.0, 0.0],
            [0.0; 3],
            [0.0; 3],
            &vec![0.0; 37],
            &[[0.0; 3]; 5],
            1.0 / 60.0,
        )
    }

    #[test]
    fn root_height_lands_in_first_slot() {
        let mut ex = ObservationExtractor::new(&config());
        let obs = extract_height(&mut ex, 0.93);
        assert_relative_eq!(obs[0], 0.93, epsilon = 1e-6);
    }

    #[test]
    fn identity_rotation_encodes_identity_columns() {
        let mut ex = ObservationExtractor::new(&config());
        let obs = extract_height(&mut ex, 1.0);
        // 6D slots hold the first two columns of the identity matrix.
        assert_eq!(&obs[1..7], &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn first_frame_velocities_are_zero() {
        let mut ex = ObservationExtractor::new(&config());
        let obs = ex.extract_frame(
            [0.0, 1.0, 0.0],
            [1.0, 0.0, 0.0, 0.0],
            [1.0, 2.0, 3.0],
            [4.0, 5.0, 6.0],
            &vec![0.5; 37],
            &[[0.0; 3]; 5],
            1.0 / 60.0,
        );
        // Linear velocity is passed through (slots 7..10); angular velocity
        // and DOF velocity need a previous frame.
        assert_relative_eq!(obs[7], 1.0, epsilon = 1e-5);
        assert_eq!(&obs[10..13], &[0.0, 0.0, 0.0]);
        let dof_vel = &obs[13 + 37..13 + 74];
        assert!(dof_vel.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn dof_velocity_from_finite_difference() {
        let mut ex = ObservationExtractor::new(&config());
        let dt = 0.1;
        let mut dofs = vec![0.0f32; 37];
        ex.extract_frame(
            [0.0, 1.0, 0.0],
            [1.0, 0.0, 0.0, 0.0],
            [0.0; 3],
            [0.0; 3],
            &dofs,
            &[[0.0; 3]; 5],
            dt,
        );
        dofs[3] = 0.2;
        let obs = ex.extract_frame(
            [0.0, 1.0, 0.0],
            [1.0, 0.0, 0.0, 0.0],
            [0.0; 3],
            [0.0; 3],
            &dofs,
            &[[0.0; 3]; 5],
            dt,
        );
        let dof_vel_start = 13 + 37;
        assert_relative_eq!(obs[dof_vel_start + 3], 2.0, epsilon = 1e-4);
    }

    #[test]
    fn non_finite_values_sanitized() {
        let mut ex = ObservationExtractor::new(&config());
        let obs = ex.extract_frame(
            [0.0, f32::NAN, 0.0],
            [1.0, 0.0, 0.0, 0.0],
            [f32::INFINITY, 0.0, f32::NEG_INFINITY],
            [0.0; 3],
            &vec![0.0; 37],
            &[[0.0; 3]; 5],
            1.0 / 60.0,
        );
        assert_eq!(obs[0], 0.0); // NaN -> 0
        assert_eq!(obs[7], 100.0); // +Inf -> clamp
        assert_eq!(obs[9], -100.0); // -Inf -> clamp
        assert!(obs.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn stacking_is_oldest_first() {
        let mut ex = ObservationExtractor::new(&config());
        for i in 1..=4 {
            extract_height(&mut ex, i as f32 * 0.1);
        }
        let stacked = ex.stacked_obs(3);
        let dim = 102;
        // Last 3 of 4 frames, oldest of those first.
        assert_relative_eq!(stacked[0], 0.2, epsilon = 1e-6);
        assert_relative_eq!(stacked[dim], 0.3, epsilon = 1e-6);
        assert_relative_eq!(stacked[2 * dim], 0.4, epsilon = 1e-6);
    }

    #[test]
    fn stacking_left_pads_with_zeros() {
        let mut ex = ObservationExtractor::new(&config());
        extract_height(&mut ex, 0.7);
        let stacked = ex.stacked_obs(3);
        let dim = 102;
        // Two empty slots first, then the single recorded frame.
        assert!(stacked[..2 * dim].iter().all(|&v| v == 0.0));
        assert_relative_eq!(stacked[2 * dim], 0.7, epsilon = 1e-6);
    }

    #[test]
    fn reset_clears_history() {
        let mut ex = ObservationExtractor::new(&config());
        extract_height(&mut ex, 1.0);
        extract_height(&mut ex, 1.1);
        ex.reset();
        assert!(ex.last_frame().is_none());
        let stacked = ex.policy_obs();
        assert!(stacked.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn motion_angular_velocity_clamped() {
        let mut ex = ObservationExtractor::new(&config());
        let joints = vec![[1.0f32, 0.0, 0.0, 0.0]; 15];
        // Near-pi yaw flip over a tiny dt would differentiate to a huge
        // angular velocity; the clamp bounds it to +/-50 rad/s.
        ex.extract_frame_from_motion(
            [0.0, 1.0, 0.0],
            [1.0, 0.0, 0.0, 0.0],
            &joints,
            &[[0.0; 3]; 5],
            1e-3,
            None,
            None,
        );
        let spin = [(1.5f32).cos(), 0.0, (1.5f32).sin(), 0.0];
        let obs = ex.extract_frame_from_motion(
            [0.0, 1.0, 0.0],
            spin,
            &joints,
            &[[0.0; 3]; 5],
            1e-3,
            Some([0.0, 1.0, 0.0]),
            Some([1.0, 0.0, 0.0, 0.0]),
        );
        for &v in &obs[10..13] {
            assert!(v.abs() <= 50.0 + 1e-4, "ang vel {v} exceeds clamp");
        }
    }

    #[test]
    fn key_bodies_relative_in_heading_frame() {
        let mut ex = ObservationExtractor::new(&config());
        // Body facing 90 degrees yaw: a key body one unit ahead in world +X
        // appears one unit forward (+Z) in the heading frame.
        let yaw = std::f32::consts::FRAC_PI_2;
        let rot = [(yaw * 0.5).cos(), 0.0, (yaw * 0.5).sin(), 0.0];
        let mut key_bodies = [[0.0f32; 3]; 5];
        key_bodies[0] = [1.0, 1.0, 0.0];
        let obs = ex.extract_frame(
            [0.0, 1.0, 0.0],
            rot,
            [0.0; 3],
            [0.0; 3],
            &vec![0.0; 37],
            &key_bodies,
            1.0 / 60.0,
        );
        let kb_start = 13 + 74;
        assert_relative_eq!(obs[kb_start], 0.0, epsilon = 1e-5);
        assert_relative_eq!(obs[kb_start + 2], 1.0, epsilon = 1e-5);
    }
}
