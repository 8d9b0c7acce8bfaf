//! Contrastive motion-encoder training (phase 2).
//!
//! The encoder maps temporally windowed observations to L2-normalized
//! latents. Training is InfoNCE: positives come from the *same* clip
//! within a frame-offset window of the anchor (the anchor itself as a
//! documented fallback when the clip is too short); negatives come from
//! *different* clips, one independent draw per slot, falling back to
//! random same-clip windows in the degenerate single-clip case.

use std::path::Path;

use ndarray::Array2;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::checkpoint::{self, EncoderCheckpoint};
use crate::config::CalmConfig;
use crate::motion::MotionClip;
use crate::nn::export::export_encoder;
use crate::nn::policy::MotionEncoder;
use crate::nn::{Adam, MlpGrads, ParamGrad};

/// One stacked-observation window tagged with its source clip and frame
/// offset (used to define positives).
pub struct ClipWindow {
    pub clip_idx: usize,
    pub offset: usize,
    pub obs: Vec<f32>,
}

/// Sliding windows of `num_encoder_obs_steps` consecutive per-frame
/// observations from each clip, stride 1.
pub fn extract_clip_windows(
    clips: &[MotionClip],
    config: &CalmConfig,
) -> Vec<ClipWindow> {
    let humanoid = &config.humanoid;
    let steps = humanoid.num_encoder_obs_steps;
    let frame_dim = humanoid.per_frame_obs_dim;
    let mut windows = Vec::new();

    for (clip_idx, clip) in clips.iter().enumerate() {
        let frame_obs = crate::motion::extract_clip_observations(clip, humanoid);
        if frame_obs.len() < steps {
            continue;
        }
        for start in 0..=frame_obs.len() - steps {
            let mut stacked = Vec::with_capacity(steps * frame_dim);
            for frame in &frame_obs[start..start + steps] {
                stacked.extend_from_slice(frame);
            }
            windows.push(ClipWindow {
                clip_idx,
                offset: start,
                obs: stacked,
            });
        }
    }
    windows
}

/// Phase 2 trainer: InfoNCE over windowed observations.
pub struct EncoderTrainer {
    config: CalmConfig,
    pub encoder: MotionEncoder,
    optimizer: Adam,
    grads: MlpGrads,
    windows: Vec<ClipWindow>,
    /// Window indices grouped by clip (only clips that produced windows).
    by_clip: Vec<Vec<usize>>,
    rng: ChaCha8Rng,
    obs_dim: usize,
}

impl EncoderTrainer {
    pub fn new(config: CalmConfig, clips: &[MotionClip]) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        let encoder = MotionEncoder::new(&config.encoder, &config.humanoid, &mut rng);
        let grads = MlpGrads::zeros_like(&encoder.mlp);
        let optimizer = Adam::new(config.encoder_training.learning_rate);

        let windows = extract_clip_windows(clips, &config);
        log::info!("extracted {} encoder windows", windows.len());

        let mut groups: std::collections::BTreeMap<usize, Vec<usize>> = Default::default();
        for (i, w) in windows.iter().enumerate() {
            groups.entry(w.clip_idx).or_default().push(i);
        }
        let by_clip: Vec<Vec<usize>> = groups.into_values().collect();

        let obs_dim = config.humanoid.encoder_obs_dim();
        Self {
            config,
            encoder,
            optimizer,
            grads,
            windows,
            by_clip,
            rng,
            obs_dim,
        }
    }

    pub fn num_windows(&self) -> usize {
        self.windows.len()
    }

    /// Sample anchor/positive/negative windows per the contrastive policy.
    ///
    /// Returns `(anchors [b, d], positives [b, d], negatives [b*k, d])`
    /// with negatives laid out anchor-major.
    pub fn sample_batch(
        &mut self,
        batch_size: usize,
    ) -> (Array2<f32>, Array2<f32>, Array2<f32>) {
        assert!(!self.by_clip.is_empty(), "no encoder windows available");
        let k = self.config.encoder_training.negative_clips;
        let positive_window = self.config.encoder_training.positive_window;

        let mut anchors = Array2::zeros((batch_size, self.obs_dim));
        let mut positives = Array2::zeros((batch_size, self.obs_dim));
        let mut negatives = Array2::zeros((batch_size * k, self.obs_dim));

        for b in 0..batch_size {
            let group = self.rng.gen_range(0..self.by_clip.len());
            let clip_windows = &self.by_clip[group];
            let anchor_idx = clip_windows[self.rng.gen_range(0..clip_windows.len())];
            let anchor_offset = self.windows[anchor_idx].offset;
            copy_row(&mut anchors, b, &self.windows[anchor_idx].obs);

            // Positive: same clip within the frame-offset window, excluding
            // the anchor's own offset; self as fallback.
            let candidates: Vec<usize> = clip_windows
                .iter()
                .copied()
                .filter(|&i| {
                    let offset = self.windows[i].offset;
                    offset != anchor_offset
                        && offset.abs_diff(anchor_offset) <= positive_window
                })
                .collect();
            let positive_idx = if candidates.is_empty() {
                anchor_idx
            } else {
                candidates[self.rng.gen_range(0..candidates.len())]
            };
            copy_row(&mut positives, b, &self.windows[positive_idx].obs);

            // Negatives: independent draws from other clips; same-clip
            // fallback when only one clip exists.
            for n in 0..k {
                let negative_idx = if self.by_clip.len() > 1 {
                    let mut other = self.rng.gen_range(0..self.by_clip.len() - 1);
                    if other >= group {
                        other += 1;
                    }
                    let wins = &self.by_clip[other];
                    wins[self.rng.gen_range(0..wins.len())]
                } else {
                    clip_windows[self.rng.gen_range(0..clip_windows.len())]
                };
                copy_row(&mut negatives, b * k + n, &self.windows[negative_idx].obs);
            }
        }

        (anchors, positives, negatives)
    }

    /// One InfoNCE gradient step. Returns the loss.
    pub fn train_iteration(&mut self, batch_size: usize) -> f32 {
        let k = self.config.encoder_training.negative_clips;
        let temperature = self.config.encoder_training.temperature;

        let (anchors, positives, negatives) = self.sample_batch(batch_size);

        let (z_a, cache_a) = self.encoder.encode_cached(&anchors);
        let (z_p, cache_p) = self.encoder.encode_cached(&positives);
        let (z_n, cache_n) = self.encoder.encode_cached(&negatives);

        // Logits: positive similarity first, label 0.
        let b = batch_size;
        let mut logits = Array2::zeros((b, 1 + k));
        for i in 0..b {
            logits[[i, 0]] = z_a.row(i).dot(&z_p.row(i)) / temperature;
            for j in 0..k {
                logits[[i, 1 + j]] = z_a.row(i).dot(&z_n.row(i * k + j)) / temperature;
            }
        }

        // Cross-entropy with label 0 and its gradient.
        let mut loss = 0.0f32;
        let mut d_logits = Array2::zeros((b, 1 + k));
        for i in 0..b {
            let row = logits.row(i);
            let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let sum_exp: f32 = row.iter().map(|&l| (l - max).exp()).sum();
            loss += -(row[0] - max) + sum_exp.ln();
            for c in 0..1 + k {
                let p = (row[c] - max).exp() / sum_exp;
                d_logits[[i, c]] = (p - if c == 0 { 1.0 } else { 0.0 }) / b as f32;
            }
        }
        loss /= b as f32;

        // Backward through the similarities into each embedding group.
        let mut d_z_a: Array2<f32> = Array2::zeros(z_a.raw_dim());
        let mut d_z_p: Array2<f32> = Array2::zeros(z_p.raw_dim());
        let mut d_z_n: Array2<f32> = Array2::zeros(z_n.raw_dim());
        for i in 0..b {
            let d0 = d_logits[[i, 0]] / temperature;
            for d in 0..self.encoder.mlp.output_dim() {
                d_z_a[[i, d]] += d0 * z_p[[i, d]];
                d_z_p[[i, d]] += d0 * z_a[[i, d]];
            }
            for j in 0..k {
                let dj = d_logits[[i, 1 + j]] / temperature;
                for d in 0..self.encoder.mlp.output_dim() {
                    d_z_a[[i, d]] += dj * z_n[[i * k + j, d]];
                    d_z_n[[i * k + j, d]] += dj * z_a[[i, d]];
                }
            }
        }

        self.grads.zero();
        self.encoder.backward(&cache_a, &d_z_a, &mut self.grads);
        self.encoder.backward(&cache_p, &d_z_p, &mut self.grads);
        self.encoder.backward(&cache_n, &d_z_n, &mut self.grads);

        let mut params = Vec::new();
        for (layer, (gw, gb)) in self
            .encoder
            .mlp
            .layers_mut()
            .iter_mut()
            .zip(self.grads.weights.iter().zip(self.grads.biases.iter()))
        {
            params.push(ParamGrad {
                param: layer.weight.as_slice_mut().expect("standard layout"),
                grad: gw.as_slice().expect("standard layout"),
            });
            params.push(ParamGrad {
                param: layer.bias.as_slice_mut().expect("standard layout"),
                grad: gb.as_slice().expect("standard layout"),
            });
        }
        self.optimizer.step(&mut params);

        loss
    }

    /// Run the full training loop with periodic checkpoints and exports.
    pub fn train(&mut self) -> anyhow::Result<()> {
        let training = self.config.encoder_training.clone();
        let output_dir = std::path::PathBuf::from(&self.config.output_dir);
        std::fs::create_dir_all(&output_dir)?;
        log::info!(
            "starting encoder training for {} iterations",
            training.num_iterations
        );

        for iteration in 0..training.num_iterations {
            let start = std::time::Instant::now();
            let loss = self.train_iteration(training.batch_size);

            if iteration % training.log_interval == 0 {
                log::info!(
                    "iter {iteration:6} | loss={loss:.4} | time={:.3}s",
                    start.elapsed().as_secs_f32()
                );
            }
            if iteration > 0 && iteration % training.checkpoint_interval == 0 {
                self.save(&output_dir, iteration)?;
            }
        }

        self.save(&output_dir, training.num_iterations)?;
        log::info!("encoder training complete");
        Ok(())
    }

    fn save(&self, output_dir: &Path, iteration: usize) -> anyhow::Result<()> {
        let bundle = EncoderCheckpoint {
            iteration,
            encoder: checkpoint::MlpState::from_mlp(&self.encoder.mlp),
            optimizer: checkpoint::AdamState::from_adam(&self.optimizer),
        };
        let path = checkpoint::checkpoint_path(output_dir, "encoder", iteration);
        checkpoint::save_json(&path, &bundle)?;
        export_encoder(&self.encoder, output_dir)?;
        Ok(())
    }
}

fn copy_row(dst: &mut Array2<f32>, row: usize, src: &[f32]) {
    dst.row_mut(row)
        .iter_mut()
        .zip(src.iter())
        .for_each(|(d, s)| *d = *s);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion::{standing_clip, MotionFrame};
    use approx::assert_relative_eq;

    fn small_config() -> CalmConfig {
        let mut c = CalmConfig::new();
        c.humanoid.num_encoder_obs_steps = 4;
        c.encoder.hidden = vec![16];
        c.encoder.output_dim = 6;
        c.encoder_training.negative_clips = 2;
        c.encoder_training.positive_window = 3;
        c.encoder_training.batch_size = 8;
        c
    }

    /// Clip whose root height varies per frame so windows are distinct.
    fn ramp_clip(len: usize, base: f32) -> MotionClip {
        let frames = (0..len)
            .map(|i| MotionFrame {
                root_pos: [0.0, base + i as f32 * 0.01, 0.0],
                root_rot: [1.0, 0.0, 0.0, 0.0],
                joint_positions: vec![[0.0; 3]; 20],
                joint_rotations: vec![[1.0, 0.0, 0.0, 0.0]; 20],
            })
            .collect();
        MotionClip { fps: 60.0, frames }
    }

    #[test]
    fn windows_cover_each_clip() {
        let config = small_config();
        let clips = vec![ramp_clip(10, 1.0), ramp_clip(6, 2.0)];
        let windows = extract_clip_windows(&clips, &config);
        // (10 - 4 + 1) + (6 - 4 + 1) windows
        assert_eq!(windows.len(), 7 + 3);
        assert_eq!(windows[0].obs.len(), 4 * 102);
        assert!(windows.iter().any(|w| w.clip_idx == 1));
    }

    #[test]
    fn short_clips_produce_no_windows() {
        let config = small_config();
        let clips = vec![ramp_clip(2, 1.0)];
        let windows = extract_clip_windows(&clips, &config);
        assert!(windows.is_empty());
    }

    #[test]
    fn negatives_come_from_other_clips() {
        let config = small_config();
        let clips = vec![ramp_clip(12, 1.0), ramp_clip(12, 5.0)];
        let mut trainer = EncoderTrainer::new(config, &clips);
        let (anchors, _, negatives) = trainer.sample_batch(4);

        // Clip heights differ by >= 4: the first scalar of each window is
        // the root height, so negatives must sit in the other clip's band.
        for b in 0..4 {
            let anchor_height = anchors[[b, 0]];
            for n in 0..2 {
                let neg_height = negatives[[b * 2 + n, 0]];
                assert!(
                    (anchor_height - neg_height).abs() > 1.0,
                    "negative drawn from the anchor clip"
                );
            }
        }
    }

    #[test]
    fn single_clip_falls_back_to_same_clip_negatives() {
        let config = small_config();
        let clips = vec![ramp_clip(12, 1.0)];
        let mut trainer = EncoderTrainer::new(config, &clips);
        // Must not panic; negatives are same-clip draws.
        let (_, _, negatives) = trainer.sample_batch(4);
        assert_eq!(negatives.nrows(), 8);
        assert!(negatives.iter().any(|&v| v != 0.0));
    }

    #[test]
    fn positives_respect_offset_window() {
        let mut config = small_config();
        config.encoder_training.positive_window = 1;
        let clips = vec![ramp_clip(20, 1.0)];
        let mut trainer = EncoderTrainer::new(config, &clips);
        let (anchors, positives, _) = trainer.sample_batch(16);
        for b in 0..16 {
            // Height ramps 0.01 per frame: a window offset of <= 1 frame
            // keeps the leading height within 0.01.
            let delta = (anchors[[b, 0]] - positives[[b, 0]]).abs();
            assert!(delta <= 0.011, "positive outside the offset window: {delta}");
        }
    }

    #[test]
    fn training_reduces_loss_on_separable_clips() {
        let mut config = small_config();
        config.encoder_training.learning_rate = 1e-3;
        let clips = vec![ramp_clip(16, 0.5), ramp_clip(16, 3.0)];
        let mut trainer = EncoderTrainer::new(config, &clips);

        let early: f32 = (0..5).map(|_| trainer.train_iteration(8)).sum::<f32>() / 5.0;
        for _ in 0..80 {
            trainer.train_iteration(8);
        }
        let late: f32 = (0..5).map(|_| trainer.train_iteration(8)).sum::<f32>() / 5.0;
        assert!(
            late < early,
            "contrastive loss did not decrease: {early} -> {late}"
        );
    }

    #[test]
    fn loss_is_log_k_plus_one_at_start_for_identical_inputs() {
        // With anchor == positive == negatives (all the same window), every
        // similarity is equal and the loss is ln(1 + k).
        let mut config = small_config();
        config.encoder_training.negative_clips = 3;
        let clips = vec![ramp_clip(5, 1.0)]; // one window per draw region
        config.humanoid.num_encoder_obs_steps = 5;
        let mut trainer = EncoderTrainer::new(config, &clips);
        let loss = trainer.train_iteration(4);
        assert_relative_eq!(loss, (4.0f32).ln(), epsilon = 1e-3);
    }
}
