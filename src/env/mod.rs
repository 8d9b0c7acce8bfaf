//! Environment stepping: the opaque physics oracle seam, the character
//! episode state machine, task targets, and the parallel execution layer.

mod character;
mod sim;
mod task;
mod vec_env;
mod workers;

pub use character::{CharacterEnv, StepInfo};
pub use sim::{BodyState, CharacterSim, KinematicSim};
pub use task::{combine_rewards, Task, TaskGenerator};
pub use vec_env::{SequentialVecEnv, StepBatch, VecEnv};
pub use workers::WorkerVecEnv;

/// Root DOFs carried by the free joint rather than position actuators.
pub const PELVIS_DOFS: usize = 3;
