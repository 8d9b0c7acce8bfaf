//! Binary weight export for the runtime consumers.
//!
//! Two little-endian formats are in use:
//!
//! - **General policy format**, magic `0x4D4C5001` (`"MLP\x01"`):
//!   `[magic][layer_count]`, then per layer
//!   `[in_dim][out_dim][weights: out*in f32 row-major][biases: out f32]`.
//!   Carries no activation tags.
//! - **Multi-network format**, magic `0x4D4C5031` (`"MLP1"`), version 1:
//!   same shape plus a per-layer activation tag
//!   (`0 = none, 1 = relu, 2 = tanh`) after the dimensions.
//!
//! The written file size must exactly equal the computed header +
//! per-layer byte count; a mismatch is a hard assertion failure because it
//! would silently corrupt the downstream runtime's load.

use ndarray::{Array1, Array2};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use super::policy::{HlcPolicy, MotionEncoder, StylePolicy};
use super::{Activation, LinearLayer, Mlp};

/// Magic for the single-file general policy format.
pub const POLICY_MAGIC: u32 = 0x4D4C_5001;
/// Magic for the multi-network character-animation format.
pub const MLP_MAGIC: u32 = 0x4D4C_5031;
/// Version field of the multi-network format.
pub const MLP_VERSION: u32 = 1;

/// Errors reading a weight file back.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("bad magic 0x{found:08X} (expected 0x{expected:08X})")]
    BadMagic { found: u32, expected: u32 },
    #[error("unsupported format version {0}")]
    BadVersion(u32),
    #[error("unknown activation tag {0}")]
    BadActivation(u32),
    #[error("layer {layer}: truncated weight data")]
    Truncated { layer: usize },
    #[error("{0} unexpected trailing bytes")]
    TrailingBytes(usize),
}

fn write_u32<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_f32_slice<W: Write>(w: &mut W, values: impl Iterator<Item = f32>) -> io::Result<()> {
    for v in values {
        w.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

fn read_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_f32_vec<R: Read>(r: &mut R, count: usize) -> io::Result<Vec<f32>> {
    let mut bytes = vec![0u8; count * 4];
    r.read_exact(&mut bytes)?;
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn layer_bytes(layer: &LinearLayer, with_activation: bool) -> usize {
    let header = if with_activation { 12 } else { 8 };
    header + 4 * (layer.weight.len() + layer.bias.len())
}

fn assert_file_size(path: &Path, expected: usize) {
    let actual = std::fs::metadata(path)
        .map(|m| m.len() as usize)
        .unwrap_or(0);
    assert_eq!(
        actual, expected,
        "export size mismatch for {}: wrote {actual} bytes, expected {expected}",
        path.display()
    );
}

/// Write layers in the general policy format (magic `0x4D4C5001`).
pub fn write_policy_bin(path: &Path, layers: &[LinearLayer]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    {
        let mut w = BufWriter::new(File::create(path)?);
        write_u32(&mut w, POLICY_MAGIC)?;
        write_u32(&mut w, layers.len() as u32)?;
        for layer in layers {
            write_u32(&mut w, layer.input_dim() as u32)?;
            write_u32(&mut w, layer.output_dim() as u32)?;
            write_f32_slice(&mut w, layer.weight.iter().copied())?;
            write_f32_slice(&mut w, layer.bias.iter().copied())?;
        }
        w.flush()?;
    }
    let expected = 8 + layers.iter().map(|l| layer_bytes(l, false)).sum::<usize>();
    assert_file_size(path, expected);
    log::info!(
        "exported {} layers to {} ({} bytes)",
        layers.len(),
        path.display(),
        expected
    );
    Ok(())
}

/// Read a general-format policy file. The format carries no activation
/// tags, so every reconstructed layer is `Activation::None`.
pub fn read_policy_bin(path: &Path) -> Result<Mlp, ExportError> {
    let mut r = BufReader::new(File::open(path)?);
    let magic = read_u32(&mut r)?;
    if magic != POLICY_MAGIC {
        return Err(ExportError::BadMagic {
            found: magic,
            expected: POLICY_MAGIC,
        });
    }
    let layer_count = read_u32(&mut r)? as usize;
    let mut layers = Vec::with_capacity(layer_count);
    for layer in 0..layer_count {
        let in_dim = read_u32(&mut r)? as usize;
        let out_dim = read_u32(&mut r)? as usize;
        let weights =
            read_f32_vec(&mut r, out_dim * in_dim).map_err(|_| ExportError::Truncated { layer })?;
        let biases = read_f32_vec(&mut r, out_dim).map_err(|_| ExportError::Truncated { layer })?;
        layers.push(LinearLayer {
            weight: Array2::from_shape_vec((out_dim, in_dim), weights).expect("shape from header"),
            bias: Array1::from_vec(biases),
            activation: Activation::None,
        });
    }
    let mut trailing = Vec::new();
    r.read_to_end(&mut trailing)?;
    if !trailing.is_empty() {
        return Err(ExportError::TrailingBytes(trailing.len()));
    }
    Ok(Mlp::from_layers(layers))
}

/// Write layers in the multi-network format (magic `0x4D4C5031`), taking
/// the per-layer activation tags straight from the in-memory records.
pub fn write_mlp_bin(path: &Path, layers: &[LinearLayer]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    {
        let mut w = BufWriter::new(File::create(path)?);
        write_u32(&mut w, MLP_MAGIC)?;
        write_u32(&mut w, MLP_VERSION)?;
        write_u32(&mut w, layers.len() as u32)?;
        for layer in layers {
            write_u32(&mut w, layer.input_dim() as u32)?;
            write_u32(&mut w, layer.output_dim() as u32)?;
            write_u32(&mut w, layer.activation as u32)?;
            write_f32_slice(&mut w, layer.weight.iter().copied())?;
            write_f32_slice(&mut w, layer.bias.iter().copied())?;
        }
        w.flush()?;
    }
    let expected = 12 + layers.iter().map(|l| layer_bytes(l, true)).sum::<usize>();
    assert_file_size(path, expected);
    log::info!(
        "exported {} layers to {} ({} bytes)",
        layers.len(),
        path.display(),
        expected
    );
    Ok(())
}

/// Read a multi-network format file back into an [`Mlp`], activation tags
/// included.
pub fn read_mlp_bin(path: &Path) -> Result<Mlp, ExportError> {
    let mut r = BufReader::new(File::open(path)?);
    let magic = read_u32(&mut r)?;
    if magic != MLP_MAGIC {
        return Err(ExportError::BadMagic {
            found: magic,
            expected: MLP_MAGIC,
        });
    }
    let version = read_u32(&mut r)?;
    if version != MLP_VERSION {
        return Err(ExportError::BadVersion(version));
    }
    let layer_count = read_u32(&mut r)? as usize;
    let mut layers = Vec::with_capacity(layer_count);
    for layer in 0..layer_count {
        let in_dim = read_u32(&mut r)? as usize;
        let out_dim = read_u32(&mut r)? as usize;
        let tag = read_u32(&mut r)?;
        let activation = Activation::from_tag(tag).ok_or(ExportError::BadActivation(tag))?;
        let weights =
            read_f32_vec(&mut r, out_dim * in_dim).map_err(|_| ExportError::Truncated { layer })?;
        let biases = read_f32_vec(&mut r, out_dim).map_err(|_| ExportError::Truncated { layer })?;
        layers.push(LinearLayer {
            weight: Array2::from_shape_vec((out_dim, in_dim), weights).expect("shape from header"),
            bias: Array1::from_vec(biases),
            activation,
        });
    }
    let mut trailing = Vec::new();
    r.read_to_end(&mut trailing)?;
    if !trailing.is_empty() {
        return Err(ExportError::TrailingBytes(trailing.len()));
    }
    Ok(Mlp::from_layers(layers))
}

/// Export the LLC's three component networks:
/// `llc_style.bin` (tanh), `llc_main.bin` (relu), `llc_mu_head.bin` (linear).
pub fn export_llc(policy: &StylePolicy, output_dir: &Path) -> io::Result<()> {
    write_mlp_bin(&output_dir.join("llc_style.bin"), policy.style.layers())?;
    write_mlp_bin(&output_dir.join("llc_main.bin"), policy.main.layers())?;
    write_mlp_bin(&output_dir.join("llc_mu_head.bin"), policy.mu_head.layers())?;
    Ok(())
}

/// Export the motion encoder to `encoder.bin`. L2 normalization of the
/// output is applied by the runtime, not encoded in the file.
pub fn export_encoder(encoder: &MotionEncoder, output_dir: &Path) -> io::Result<()> {
    write_mlp_bin(&output_dir.join("encoder.bin"), encoder.mlp.layers())
}

/// Export an HLC to `hlc_{task}.bin`.
pub fn export_hlc(hlc: &HlcPolicy, task: &str, output_dir: &Path) -> io::Result<()> {
    write_mlp_bin(&output_dir.join(format!("hlc_{task}.bin")), hlc.mlp.layers())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::randn;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use tempfile::tempdir;

    fn rng() -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(3)
    }

    #[test]
    fn mlp_bin_roundtrip_is_bit_exact() {
        let mut r = rng();
        let mlp = Mlp::new(6, &[8, 4], 2, Activation::Relu, Activation::None, &mut r);
        let dir = tempdir().unwrap();
        let path = dir.path().join("net.bin");

        write_mlp_bin(&path, mlp.layers()).unwrap();
        let loaded = read_mlp_bin(&path).unwrap();

        assert_eq!(loaded.layers().len(), mlp.layers().len());
        for (a, b) in mlp.layers().iter().zip(loaded.layers()) {
            assert_eq!(a.activation, b.activation);
            assert_eq!(a.weight, b.weight); // exact f32 equality
            assert_eq!(a.bias, b.bias);
        }

        // Forward pass computed from the read-back arrays matches.
        let x = randn(5, 6, &mut r);
        let y1 = mlp.forward(&x);
        let y2 = loaded.forward(&x);
        for (a, b) in y1.iter().zip(y2.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-4);
        }
    }

    #[test]
    fn policy_bin_roundtrip() {
        let mut r = rng();
        let mlp = Mlp::new(4, &[6], 3, Activation::None, Activation::None, &mut r);
        let dir = tempdir().unwrap();
        let path = dir.path().join("policy.bin");

        write_policy_bin(&path, mlp.layers()).unwrap();
        let loaded = read_policy_bin(&path).unwrap();

        for (a, b) in mlp.layers().iter().zip(loaded.layers()) {
            assert_eq!(a.weight, b.weight);
            assert_eq!(a.bias, b.bias);
        }
        let x = randn(2, 4, &mut r);
        let y1 = mlp.forward(&x);
        let y2 = loaded.forward(&x);
        for (a, b) in y1.iter().zip(y2.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-4);
        }
    }

    #[test]
    fn reader_rejects_wrong_magic() {
        let mut r = rng();
        let mlp = Mlp::new(2, &[], 1, Activation::None, Activation::None, &mut r);
        let dir = tempdir().unwrap();
        let path = dir.path().join("wrong.bin");

        write_policy_bin(&path, mlp.layers()).unwrap();
        assert!(matches!(
            read_mlp_bin(&path),
            Err(ExportError::BadMagic { .. })
        ));
    }

    #[test]
    fn reader_rejects_trailing_bytes() {
        let mut r = rng();
        let mlp = Mlp::new(2, &[], 1, Activation::None, Activation::None, &mut r);
        let dir = tempdir().unwrap();
        let path = dir.path().join("trailing.bin");
        write_mlp_bin(&path, mlp.layers()).unwrap();

        use std::io::Write as _;
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[0u8; 3]).unwrap();
        drop(f);

        assert!(matches!(
            read_mlp_bin(&path),
            Err(ExportError::TrailingBytes(3))
        ));
    }

    #[test]
    fn expected_file_sizes() {
        let mut r = rng();
        // 3 -> 5 -> 2: layer0 = 12 + (15 + 5)*4 = 92, layer1 = 12 + (10 + 2)*4 = 60
        let mlp = Mlp::new(3, &[5], 2, Activation::Relu, Activation::None, &mut r);
        let dir = tempdir().unwrap();
        let path = dir.path().join("sized.bin");
        write_mlp_bin(&path, mlp.layers()).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 12 + 92 + 60);
    }

    #[test]
    fn llc_export_writes_three_files_with_expected_tags() {
        use crate::config::{HumanoidConfig, LlcPolicyConfig};
        let mut r = rng();
        let humanoid = HumanoidConfig {
            num_dof: 4,
            num_key_bodies: 2,
            per_frame_obs_dim: 8,
            num_policy_obs_steps: 2,
            num_encoder_obs_steps: 4,
            latent_dim: 3,
        };
        let config = LlcPolicyConfig {
            style_hidden: vec![6],
            style_out: 3,
            main_hidden: vec![10, 5],
            log_std_init: -1.0,
        };
        let policy = StylePolicy::new(&config, &humanoid, &mut r);
        let dir = tempdir().unwrap();

        export_llc(&policy, dir.path()).unwrap();

        let style = read_mlp_bin(&dir.path().join("llc_style.bin")).unwrap();
        assert!(style.layers().iter().all(|l| l.activation == Activation::Tanh));
        let main = read_mlp_bin(&dir.path().join("llc_main.bin")).unwrap();
        assert!(main.layers().iter().all(|l| l.activation == Activation::Relu));
        let mu = read_mlp_bin(&dir.path().join("llc_mu_head.bin")).unwrap();
        assert!(mu.layers().iter().all(|l| l.activation == Activation::None));
        assert_eq!(mu.output_dim(), 4);
    }
}
