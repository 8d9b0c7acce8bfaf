//! Motion capture reference data: clip model, file loaders, and the
//! pre-extracted real-transition pool used by the AMP discriminator.

mod clip;
mod loader;
mod transitions;

pub use clip::{standing_clip, MotionClip, MotionFrame};
pub use loader::{load_bvh, load_json, load_motion_directory, MotionError};
pub use transitions::MotionTransitionBuffer;

pub(crate) use transitions::extract_clip_observations;
