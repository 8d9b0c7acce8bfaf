//! The physics stepping oracle seam.
//!
//! Physics simulation itself is out of scope: the trainer only needs a
//! stepping oracle that accepts actuator controls and reports body state.
//! [`CharacterSim`] is that seam; [`KinematicSim`] is a deterministic
//! stand-in used for tests and bootstrap runs without a physics backend.

use crate::env::PELVIS_DOFS;
use crate::math::{heading_angle, rotate_to_heading_frame};

/// Raw body state reported by the simulation.
#[derive(Debug, Clone)]
pub struct BodyState {
    pub root_pos: [f32; 3],
    /// Unit quaternion (w, x, y, z).
    pub root_rot: [f32; 4],
    pub root_lin_vel: [f32; 3],
    pub root_ang_vel: [f32; 3],
    /// Joint angles, `num_dof` entries (first three are pelvis).
    pub dof_positions: Vec<f32>,
    /// World positions of the tracked key bodies.
    pub key_body_positions: Vec<[f32; 3]>,
}

impl BodyState {
    /// Neutral standing state at the given root height.
    pub fn standing(num_dof: usize, num_key_bodies: usize, height: f32) -> Self {
        Self {
            root_pos: [0.0, height, 0.0],
            root_rot: [1.0, 0.0, 0.0, 0.0],
            root_lin_vel: [0.0; 3],
            root_ang_vel: [0.0; 3],
            dof_positions: vec![0.0; num_dof],
            key_body_positions: vec![[0.0; 3]; num_key_bodies],
        }
    }
}

/// Opaque physics stepping oracle.
///
/// Implementations own all simulation state. `controls` passed to
/// [`CharacterSim::step`] are already mapped into the per-actuator control
/// ranges by the caller.
pub trait CharacterSim: Send {
    /// Logical DOF count (including the un-actuated pelvis DOFs).
    fn num_dof(&self) -> usize;

    /// Position-actuator count (`num_dof - PELVIS_DOFS`).
    fn num_actuators(&self) -> usize;

    /// Per-actuator control range (low, high).
    fn control_ranges(&self) -> &[(f32, f32)];

    /// Place the body at the given state.
    fn reset_to(&mut self, state: &BodyState);

    /// Advance `substeps` physics substeps driving the actuators toward
    /// `controls` (`num_actuators` values inside their control ranges).
    fn step(&mut self, controls: &[f32], substeps: usize);

    /// Current body state.
    fn state(&self) -> BodyState;
}

/// Fixed key-body offsets of the stand-in body, local frame
/// (head, r_hand, l_hand, r_foot, l_foot).
const KEY_BODY_OFFSETS: [[f32; 3]; 5] = [
    [0.0, 0.65, 0.0],
    [-0.45, 0.2, 0.1],
    [0.45, 0.2, 0.1],
    [-0.1, -0.95, 0.05],
    [0.1, -0.95, 0.05],
];

/// Deterministic kinematic stand-in for the physics oracle.
///
/// Actuated DOFs track their targets with a first-order rate limit; the
/// root height relaxes toward its reset height. Good enough to exercise
/// every trainer code path reproducibly; not a dynamics model.
pub struct KinematicSim {
    num_dof: usize,
    dt: f32,
    tracking_gain: f32,
    control_ranges: Vec<(f32, f32)>,
    state: BodyState,
    reset_height: f32,
}

impl KinematicSim {
    pub fn new(num_dof: usize, num_key_bodies: usize, sim_timestep: f32, sim_substeps: usize) -> Self {
        let num_actuators = num_dof.saturating_sub(PELVIS_DOFS);
        let substep_dt = sim_timestep / sim_substeps.max(1) as f32;
        Self {
            num_dof,
            dt: substep_dt,
            tracking_gain: 0.35,
            control_ranges: vec![(-1.2, 1.2); num_actuators],
            state: BodyState::standing(num_dof, num_key_bodies, 1.0),
            reset_height: 1.0,
        }
    }

    fn update_key_bodies(&mut self) {
        let heading = heading_angle(self.state.root_rot);
        for (k, offset) in KEY_BODY_OFFSETS
            .iter()
            .take(self.state.key_body_positions.len())
            .enumerate()
        {
            // Rotate the local offset into the world by the body heading.
            let world = rotate_to_heading_frame(*offset, -heading);
            self.state.key_body_positions[k] = [
                self.state.root_pos[0] + world[0],
                self.state.root_pos[1] + world[1],
                self.state.root_pos[2] + world[2],
            ];
        }
    }
}

impl CharacterSim for KinematicSim {
    fn num_dof(&self) -> usize {
        self.num_dof
    }

    fn num_actuators(&self) -> usize {
        self.control_ranges.len()
    }

    fn control_ranges(&self) -> &[(f32, f32)] {
        &self.control_ranges
    }

    fn reset_to(&mut self, state: &BodyState) {
        assert_eq!(state.dof_positions.len(), self.num_dof);
        self.state = state.clone();
        self.reset_height = state.root_pos[1];
        self.update_key_bodies();
    }

    fn step(&mut self, controls: &[f32], substeps: usize) {
        assert_eq!(controls.len(), self.num_actuators());
        for _ in 0..substeps.max(1) {
            for (a, &target) in controls.iter().enumerate() {
                let j = PELVIS_DOFS + a;
                let current = self.state.dof_positions[j];
                self.state.dof_positions[j] = current + (target - current) * self.tracking_gain;
            }

            // Root height relaxes toward the reset height.
            let h = self.state.root_pos[1];
            self.state.root_pos[1] = h + (self.reset_height - h) * 0.1;
            self.state.root_lin_vel = [
                0.0,
                (self.state.root_pos[1] - h) / self.dt,
                0.0,
            ];
            self.state.root_ang_vel = [0.0; 3];
        }
        self.update_key_bodies();
    }

    fn state(&self) -> BodyState {
        self.state.clone()
    }
}
