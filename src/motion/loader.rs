//! Motion file loaders: a simplified BVH variant and a JSON schema.
//!
//! Both formats parse into the same [`MotionClip`] shape. Malformed
//! individual files are logged and skipped so a single bad asset cannot
//! abort a long training run.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use super::clip::{MotionClip, MotionFrame};
use crate::math::euler_to_quat;

/// BVH root positions are in centimeters.
const CM_TO_M: f32 = 0.01;

#[derive(Debug, thiserror::Error)]
pub enum MotionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bvh parse error: {0}")]
    Bvh(String),
    #[error("unsupported extension for {0}")]
    UnsupportedExtension(String),
}

/// Load a BVH motion capture file (hierarchy + per-frame channel floats).
pub fn load_bvh(path: &Path, num_joints: usize) -> Result<MotionClip, MotionError> {
    let content = std::fs::read_to_string(path)?;
    let lines: Vec<&str> = content.lines().collect();
    let mut idx = 0;

    // Parse hierarchy
    let mut joint_names: Vec<String> = Vec::new();
    let mut joint_offsets: Vec<[f32; 3]> = Vec::new();
    let mut joint_parents: Vec<i32> = Vec::new();
    let mut parent_stack: Vec<i32> = vec![-1];

    while idx < lines.len() {
        let line = lines[idx].trim();
        if line.starts_with("ROOT") || line.starts_with("JOINT") {
            let name = line
                .split_whitespace()
                .last()
                .ok_or_else(|| MotionError::Bvh("joint without a name".into()))?;
            joint_names.push(name.to_string());
            joint_parents.push(*parent_stack.last().unwrap());
        } else if line.starts_with("End Site") {
            idx += 1;
            while idx < lines.len() && !lines[idx].contains('}') {
                idx += 1;
            }
            idx += 1;
            continue;
        } else if line.starts_with("OFFSET") {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 4 {
                return Err(MotionError::Bvh(format!("malformed OFFSET: {line}")));
            }
            let parse = |s: &str| {
                s.parse::<f32>()
                    .map_err(|_| MotionError::Bvh(format!("bad OFFSET value: {s}")))
            };
            joint_offsets.push([parse(parts[1])?, parse(parts[2])?, parse(parts[3])?]);
        } else if line == "{" {
            if !joint_names.is_empty() {
                parent_stack.push(joint_names.len() as i32 - 1);
            }
        } else if line == "}" {
            parent_stack.pop();
        } else if line.starts_with("MOTION") {
            idx += 1;
            break;
        }
        idx += 1;
    }

    // Motion header
    let mut num_frames = 0usize;
    let mut frame_time = 1.0f32 / 30.0;
    while idx < lines.len() {
        let line = lines[idx].trim();
        if let Some(rest) = line.strip_prefix("Frames:") {
            num_frames = rest
                .trim()
                .parse()
                .map_err(|_| MotionError::Bvh(format!("bad frame count: {line}")))?;
        } else if let Some(rest) = line.strip_prefix("Frame Time:") {
            frame_time = rest
                .trim()
                .parse()
                .map_err(|_| MotionError::Bvh(format!("bad frame time: {line}")))?;
            idx += 1;
            break;
        }
        idx += 1;
    }
    if frame_time <= 0.0 {
        return Err(MotionError::Bvh(format!("non-positive frame time {frame_time}")));
    }

    let fps = 1.0 / frame_time;
    let mut frames = Vec::with_capacity(num_frames);

    for _ in 0..num_frames {
        if idx >= lines.len() {
            break;
        }
        let values: Vec<f32> = lines[idx]
            .split_whitespace()
            .map(|v| v.parse::<f32>().unwrap_or(0.0))
            .collect();
        idx += 1;
        if values.len() < 3 {
            continue;
        }

        let root_pos = [
            values[0] * CM_TO_M,
            values[1] * CM_TO_M,
            values[2] * CM_TO_M,
        ];

        let mut joint_rotations = vec![[1.0f32, 0.0, 0.0, 0.0]; num_joints];
        let mut offset = 3;
        for j in 0..joint_names.len().min(num_joints) {
            if offset + 3 <= values.len() {
                let rx = values[offset].to_radians();
                let ry = values[offset + 1].to_radians();
                let rz = values[offset + 2].to_radians();
                joint_rotations[j] = euler_to_quat(rx, ry, rz);
                offset += 3;
            }
        }

        // Naive forward kinematics: accumulate scaled parent offsets.
        let mut joint_positions = vec![[0.0f32; 3]; num_joints];
        joint_positions[0] = root_pos;
        for j in 1..joint_names.len().min(num_joints) {
            let parent = joint_parents[j];
            if parent >= 0 && (parent as usize) < num_joints {
                let p = joint_positions[parent as usize];
                let o = joint_offsets.get(j).copied().unwrap_or([0.0; 3]);
                joint_positions[j] = [
                    p[0] + o[0] * CM_TO_M,
                    p[1] + o[1] * CM_TO_M,
                    p[2] + o[2] * CM_TO_M,
                ];
            }
        }

        frames.push(MotionFrame {
            root_pos,
            root_rot: joint_rotations[0],
            joint_positions,
            joint_rotations,
        });
    }

    Ok(MotionClip { fps, frames })
}

#[derive(Deserialize)]
struct JsonFrame {
    root_pos: [f32; 3],
    root_rot: [f32; 4],
    #[serde(default)]
    joint_positions: Vec<[f32; 3]>,
    #[serde(default)]
    joint_rotations: Vec<[f32; 4]>,
}

#[derive(Deserialize)]
struct JsonClip {
    fps: f32,
    frames: Vec<JsonFrame>,
}

/// Load a JSON motion file, padding or trimming joints to `num_joints`.
pub fn load_json(path: &Path, num_joints: usize) -> Result<MotionClip, MotionError> {
    let content = std::fs::read_to_string(path)?;
    let raw: JsonClip = serde_json::from_str(&content)?;

    let frames = raw
        .frames
        .into_iter()
        .map(|f| {
            let mut joint_positions = f.joint_positions;
            let mut joint_rotations = f.joint_rotations;
            joint_positions.resize(num_joints, [0.0; 3]);
            joint_rotations.resize(num_joints, [1.0, 0.0, 0.0, 0.0]);
            MotionFrame {
                root_pos: f.root_pos,
                root_rot: f.root_rot,
                joint_positions,
                joint_rotations,
            }
        })
        .collect();

    Ok(MotionClip {
        fps: raw.fps,
        frames,
    })
}

/// Load all `.bvh`/`.json` clips under a directory (recursive).
///
/// Files that fail to parse are logged and skipped. A missing directory
/// yields an empty map; callers fall back to a synthetic standing clip.
pub fn load_motion_directory(dir: &Path, num_joints: usize) -> BTreeMap<String, MotionClip> {
    let mut clips = BTreeMap::new();
    if !dir.exists() {
        return clips;
    }
    collect_clips(dir, num_joints, &mut clips);
    clips
}

fn collect_clips(dir: &Path, num_joints: usize, clips: &mut BTreeMap<String, MotionClip>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("failed to read motion directory {}: {e}", dir.display());
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_clips(&path, num_joints, clips);
            continue;
        }
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        let result = match ext.as_deref() {
            Some("bvh") => load_bvh(&path, num_joints),
            Some("json") => load_json(&path, num_joints),
            _ => continue,
        };
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("clip")
            .to_string();
        match result {
            Ok(clip) if !clip.is_empty() => {
                clips.insert(name, clip);
            }
            Ok(_) => {
                log::warn!("skipping empty motion clip {}", path.display());
            }
            Err(e) => {
                log::warn!("failed to load {}: {e}", path.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::io::Write;
    use tempfile::tempdir;

    const SAMPLE_BVH: &str = "\
HIERARCHY
ROOT Hips
{
    OFFSET 0.0 0.0 0.0
    CHANNELS 6 Xposition Yposition Zposition Zrotation Xrotation Yrotation
    JOINT Spine
    {
        OFFSET 0.0 10.0 0.0
        CHANNELS 3 Zrotation Xrotation Yrotation
        End Site
        {
            OFFSET 0.0 5.0 0.0
        }
    }
}
MOTION
Frames: 2
Frame Time: 0.033333
0.0 100.0 0.0 0.0 0.0 0.0 0.0 0.0 0.0
1.0 100.0 0.0 90.0 0.0 0.0 0.0 0.0 0.0
";

    #[test]
    fn bvh_parses_frames_and_converts_units() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("walk.bvh");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(SAMPLE_BVH.as_bytes())
            .unwrap();

        let clip = load_bvh(&path, 4).unwrap();
        assert_eq!(clip.frames.len(), 2);
        assert_relative_eq!(clip.fps, 30.0, epsilon = 0.1);
        // 100 cm -> 1 m
        assert_relative_eq!(clip.frames[0].root_pos[1], 1.0, epsilon = 1e-5);
        assert_relative_eq!(clip.frames[1].root_pos[0], 0.01, epsilon = 1e-5);
        // Second frame has a 90-degree root rotation.
        let q = clip.frames[1].root_rot;
        let norm = (q[0] * q[0] + q[1] * q[1] + q[2] * q[2] + q[3] * q[3]).sqrt();
        assert_relative_eq!(norm, 1.0, epsilon = 1e-4);
        // FK: spine sits 0.1 m above the root.
        assert_relative_eq!(
            clip.frames[0].joint_positions[1][1],
            1.0 + 0.1,
            epsilon = 1e-4
        );
    }

    #[test]
    fn json_pads_and_trims_joints() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("clip.json");
        let json = r#"{
            "fps": 60.0,
            "frames": [{
                "root_pos": [0.0, 1.0, 0.0],
                "root_rot": [1.0, 0.0, 0.0, 0.0],
                "joint_positions": [[0.0, 1.0, 0.0]],
                "joint_rotations": [[1.0, 0.0, 0.0, 0.0]]
            }]
        }"#;
        std::fs::write(&path, json).unwrap();

        let clip = load_json(&path, 3).unwrap();
        assert_eq!(clip.frames[0].joint_positions.len(), 3);
        assert_eq!(clip.frames[0].joint_rotations.len(), 3);
        assert_eq!(clip.frames[0].joint_rotations[2], [1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn directory_load_skips_malformed_files() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("good.json"), r#"{
            "fps": 30.0,
            "frames": [{"root_pos": [0,1,0], "root_rot": [1,0,0,0]}]
        }"#)
        .unwrap();
        std::fs::write(dir.path().join("bad.json"), "{ not json").unwrap();
        std::fs::write(dir.path().join("ignored.txt"), "not a clip").unwrap();

        let clips = load_motion_directory(dir.path(), 2);
        assert_eq!(clips.len(), 1);
        assert!(clips.contains_key("good"));
    }

    #[test]
    fn missing_directory_yields_empty_map() {
        let clips = load_motion_directory(Path::new("/nonexistent/motions"), 20);
        assert!(clips.is_empty());
    }
}
