//! Explicit feed-forward networks with hand-derived backward passes.
//!
//! A network is a plain ordered list of [`LinearLayer`] records — weight
//! matrix, bias vector, activation tag. The same record shape is what the
//! binary export format encodes, so the in-memory and on-disk
//! representations share one definition (see [`export`]).
//!
//! Gradients are computed by explicit backward passes rather than an
//! autodiff framework: [`Mlp::backward`] for parameter/input gradients, and
//! [`Mlp::input_gradient`] + [`Mlp::penalty_backward`] for the second-order
//! path needed by the WGAN gradient penalty.

pub mod adam;
pub mod export;
pub mod policy;

pub use adam::{clip_grad_norm, Adam, ParamGrad};
pub use export::{
    export_encoder, export_hlc, export_llc, read_mlp_bin, read_policy_bin, write_mlp_bin,
    write_policy_bin, ExportError,
};
pub use policy::{
    gaussian_entropy, gaussian_log_prob, l2_normalize_rows, sample_gaussian, Discriminator,
    HlcPolicy, MotionEncoder, StylePolicy, ValueNet,
};

use ndarray::{Array1, Array2, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Per-layer activation. The discriminant values double as the on-disk
/// activation tags of the multi-network export format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    None = 0,
    Relu = 1,
    Tanh = 2,
}

impl Activation {
    /// Apply the activation elementwise in place.
    pub fn apply(self, a: &mut Array2<f32>) {
        match self {
            Activation::None => {}
            Activation::Relu => a.mapv_inplace(|v| v.max(0.0)),
            Activation::Tanh => a.mapv_inplace(f32::tanh),
        }
    }

    /// Derivative given pre-activation `a` and post-activation `h`.
    fn derivative(self, a: &Array2<f32>, h: &Array2<f32>) -> Option<Array2<f32>> {
        match self {
            Activation::None => None,
            Activation::Relu => Some(a.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 })),
            Activation::Tanh => Some(h.mapv(|v| 1.0 - v * v)),
        }
    }

    /// Decode an on-disk activation tag.
    pub fn from_tag(tag: u32) -> Option<Activation> {
        match tag {
            0 => Some(Activation::None),
            1 => Some(Activation::Relu),
            2 => Some(Activation::Tanh),
            _ => None,
        }
    }
}

/// One fully-connected layer: `h = act(x W^T + b)`.
///
/// Weight layout is `[out_dim, in_dim]` row-major, matching the export
/// format byte-for-byte.
#[derive(Debug, Clone)]
pub struct LinearLayer {
    pub weight: Array2<f32>,
    pub bias: Array1<f32>,
    pub activation: Activation,
}

impl LinearLayer {
    pub fn input_dim(&self) -> usize {
        self.weight.ncols()
    }

    pub fn output_dim(&self) -> usize {
        self.weight.nrows()
    }
}

/// Ordered list of linear layers with explicit forward/backward passes.
#[derive(Debug, Clone)]
pub struct Mlp {
    layers: Vec<LinearLayer>,
}

/// Forward-pass cache for [`Mlp::backward`]: the input of each layer and
/// its pre-activation.
pub struct MlpCache {
    inputs: Vec<Array2<f32>>,
    preacts: Vec<Array2<f32>>,
    outputs: Vec<Array2<f32>>,
}

/// Parameter gradients matching an [`Mlp`]'s layer list.
#[derive(Debug, Clone)]
pub struct MlpGrads {
    pub weights: Vec<Array2<f32>>,
    pub biases: Vec<Array1<f32>>,
}

impl MlpGrads {
    pub fn zeros_like(mlp: &Mlp) -> Self {
        Self {
            weights: mlp
                .layers
                .iter()
                .map(|l| Array2::zeros(l.weight.raw_dim()))
                .collect(),
            biases: mlp
                .layers
                .iter()
                .map(|l| Array1::zeros(l.bias.raw_dim()))
                .collect(),
        }
    }

    pub fn zero(&mut self) {
        for w in &mut self.weights {
            w.fill(0.0);
        }
        for b in &mut self.biases {
            b.fill(0.0);
        }
    }
}

/// Cache of the input-gradient pass, consumed by [`Mlp::penalty_backward`].
pub struct AdjointCache {
    /// dD/da_l per layer, from the downward sweep.
    preact_grads: Vec<Array2<f32>>,
    /// Activation masks per layer (None for identity layers).
    masks: Vec<Option<Array2<f32>>>,
}

impl Mlp {
    /// Build from explicit layer dimensions and per-layer activations.
    ///
    /// `dims` has `len = layers + 1` (input dim first); `activations` one
    /// entry per layer. Weights are Xavier-uniform, biases zero.
    pub fn from_spec<R: Rng>(dims: &[usize], activations: &[Activation], rng: &mut R) -> Self {
        assert_eq!(
            dims.len(),
            activations.len() + 1,
            "layer spec mismatch: {} dims for {} activations",
            dims.len(),
            activations.len()
        );
        let layers = dims
            .windows(2)
            .zip(activations.iter())
            .map(|(pair, &activation)| {
                let (input, output) = (pair[0], pair[1]);
                let limit = (6.0 / (input + output) as f32).sqrt();
                let weight =
                    Array2::from_shape_fn((output, input), |_| rng.gen_range(-limit..limit));
                LinearLayer {
                    weight,
                    bias: Array1::zeros(output),
                    activation,
                }
            })
            .collect();
        Self { layers }
    }

    /// Standard hidden-stack constructor: `hidden_act` on every hidden
    /// layer, `output_act` on the final layer.
    pub fn new<R: Rng>(
        input_dim: usize,
        hidden: &[usize],
        output_dim: usize,
        hidden_act: Activation,
        output_act: Activation,
        rng: &mut R,
    ) -> Self {
        let mut dims = Vec::with_capacity(hidden.len() + 2);
        dims.push(input_dim);
        dims.extend_from_slice(hidden);
        dims.push(output_dim);
        let mut acts = vec![hidden_act; hidden.len()];
        acts.push(output_act);
        Self::from_spec(&dims, &acts, rng)
    }

    /// Assemble from pre-built layers (export readers, checkpoint loads).
    pub fn from_layers(layers: Vec<LinearLayer>) -> Self {
        assert!(!layers.is_empty(), "an MLP needs at least one layer");
        for pair in layers.windows(2) {
            assert_eq!(
                pair[0].output_dim(),
                pair[1].input_dim(),
                "layer dimension mismatch"
            );
        }
        Self { layers }
    }

    pub fn layers(&self) -> &[LinearLayer] {
        &self.layers
    }

    pub fn layers_mut(&mut self) -> &mut [LinearLayer] {
        &mut self.layers
    }

    pub fn input_dim(&self) -> usize {
        self.layers[0].input_dim()
    }

    pub fn output_dim(&self) -> usize {
        self.layers.last().unwrap().output_dim()
    }

    /// Forward pass without caches.
    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        let mut h = x.clone();
        for layer in &self.layers {
            let mut a = h.dot(&layer.weight.t());
            a += &layer.bias;
            layer.activation.apply(&mut a);
            h = a;
        }
        h
    }

    /// Forward pass retaining the caches needed for [`Mlp::backward`].
    pub fn forward_cached(&self, x: &Array2<f32>) -> (Array2<f32>, MlpCache) {
        let mut inputs = Vec::with_capacity(self.layers.len());
        let mut preacts = Vec::with_capacity(self.layers.len());
        let mut outputs = Vec::with_capacity(self.layers.len());
        let mut h = x.clone();
        for layer in &self.layers {
            inputs.push(h.clone());
            let mut a = h.dot(&layer.weight.t());
            a += &layer.bias;
            preacts.push(a.clone());
            layer.activation.apply(&mut a);
            outputs.push(a.clone());
            h = a;
        }
        (
            h,
            MlpCache {
                inputs,
                preacts,
                outputs,
            },
        )
    }

    /// Backward pass: accumulate parameter gradients into `grads` and
    /// return the gradient with respect to the input batch.
    pub fn backward(
        &self,
        cache: &MlpCache,
        upstream: &Array2<f32>,
        grads: &mut MlpGrads,
    ) -> Array2<f32> {
        let mut d_h = upstream.clone();
        for (l, layer) in self.layers.iter().enumerate().rev() {
            let d_a = match layer
                .activation
                .derivative(&cache.preacts[l], &cache.outputs[l])
            {
                Some(mask) => &d_h * &mask,
                None => d_h,
            };
            grads.weights[l] += &d_a.t().dot(&cache.inputs[l]);
            grads.biases[l] += &d_a.sum_axis(Axis(0));
            d_h = d_a.dot(&layer.weight);
        }
        d_h
    }

    /// Per-sample gradient of a scalar-output network with respect to its
    /// input, plus the adjoint cache for [`Mlp::penalty_backward`].
    ///
    /// The output layer must be linear (`Activation::None`).
    pub fn input_gradient(&self, cache: &MlpCache) -> (Array2<f32>, AdjointCache) {
        let batch = cache.inputs[0].nrows();
        assert_eq!(self.output_dim(), 1, "input_gradient expects a scalar head");
        assert_eq!(
            self.layers.last().unwrap().activation,
            Activation::None,
            "scalar head must be linear"
        );

        let layer_count = self.layers.len();
        let mut preact_grads = vec![Array2::zeros((0, 0)); layer_count];
        let mut masks: Vec<Option<Array2<f32>>> = Vec::with_capacity(layer_count);
        for (l, layer) in self.layers.iter().enumerate() {
            masks.push(
                layer
                    .activation
                    .derivative(&cache.preacts[l], &cache.outputs[l]),
            );
        }

        let mut d_h: Array2<f32> = Array2::ones((batch, 1));
        for (l, layer) in self.layers.iter().enumerate().rev() {
            let d_a = match &masks[l] {
                Some(mask) => &d_h * mask,
                None => d_h,
            };
            d_h = d_a.dot(&layer.weight);
            preact_grads[l] = d_a;
        }
        (d_h, AdjointCache { preact_grads, masks })
    }

    /// Second-order backward for the gradient penalty: accumulate the
    /// gradient of a penalty `P(g)` (where `g` is the input gradient from
    /// [`Mlp::input_gradient`]) with respect to the layer weights.
    ///
    /// Exact for None/ReLU activations, whose masks are locally constant;
    /// callers must not use it on tanh networks. Biases receive no
    /// gradient from this path.
    pub fn penalty_backward(
        &self,
        adjoint: &AdjointCache,
        d_input_grad: &Array2<f32>,
        grads: &mut MlpGrads,
    ) {
        debug_assert!(
            self.layers
                .iter()
                .all(|l| matches!(l.activation, Activation::None | Activation::Relu)),
            "penalty_backward requires piecewise-linear activations"
        );
        let mut r = d_input_grad.clone();
        let last = self.layers.len() - 1;
        for (l, layer) in self.layers.iter().enumerate() {
            let t = &adjoint.preact_grads[l];
            grads.weights[l] += &t.t().dot(&r);
            if l == last {
                break;
            }
            let d_t = r.dot(&layer.weight.t());
            r = match &adjoint.masks[l] {
                Some(mask) => &d_t * mask,
                None => d_t,
            };
        }
    }

    /// Total parameter count.
    pub fn num_params(&self) -> usize {
        self.layers
            .iter()
            .map(|l| l.weight.len() + l.bias.len())
            .sum()
    }
}

/// Standard normal sample via Box–Muller.
pub fn standard_normal<R: Rng>(rng: &mut R) -> f32 {
    let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
    let u2: f32 = rng.gen::<f32>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()
}

/// Matrix of independent standard normals.
pub fn randn<R: Rng>(rows: usize, cols: usize, rng: &mut R) -> Array2<f32> {
    Array2::from_shape_fn((rows, cols), |_| standard_normal(rng))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn rng() -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(7)
    }

    #[test]
    fn forward_shapes() {
        let mut r = rng();
        let mlp = Mlp::new(4, &[8, 8], 2, Activation::Relu, Activation::None, &mut r);
        let x = randn(5, 4, &mut r);
        let y = mlp.forward(&x);
        assert_eq!(y.dim(), (5, 2));
        assert_eq!(mlp.input_dim(), 4);
        assert_eq!(mlp.output_dim(), 2);
    }

    #[test]
    fn cached_forward_matches_plain() {
        let mut r = rng();
        let mlp = Mlp::new(3, &[6], 2, Activation::Tanh, Activation::None, &mut r);
        let x = randn(4, 3, &mut r);
        let y1 = mlp.forward(&x);
        let (y2, _) = mlp.forward_cached(&x);
        for (a, b) in y1.iter().zip(y2.iter()) {
            assert_relative_eq!(a, b);
        }
    }

    /// Finite-difference check of the full backward pass.
    #[test]
    fn backward_matches_finite_difference() {
        let mut r = rng();
        let mlp = Mlp::new(3, &[5], 1, Activation::Tanh, Activation::None, &mut r);
        let x = randn(2, 3, &mut r);

        // Loss = sum of outputs.
        let (y, cache) = mlp.forward_cached(&x);
        let upstream = Array2::ones(y.raw_dim());
        let mut grads = MlpGrads::zeros_like(&mlp);
        let dx = mlp.backward(&cache, &upstream, &mut grads);

        let eps = 1e-3f32;
        // Check a few weight entries of layer 0.
        for &(i, j) in &[(0usize, 0usize), (2, 1), (4, 2)] {
            let mut bumped = mlp.clone();
            bumped.layers_mut()[0].weight[[i, j]] += eps;
            let up = bumped.forward(&x).sum();
            let mut bumped_down = mlp.clone();
            bumped_down.layers_mut()[0].weight[[i, j]] -= eps;
            let down = bumped_down.forward(&x).sum();
            let numeric = (up - down) / (2.0 * eps);
            assert_relative_eq!(grads.weights[0][[i, j]], numeric, epsilon = 1e-2);
        }
        // Check an input entry.
        let mut x_up = x.clone();
        x_up[[0, 1]] += eps;
        let mut x_down = x.clone();
        x_down[[0, 1]] -= eps;
        let numeric = (mlp.forward(&x_up).sum() - mlp.forward(&x_down).sum()) / (2.0 * eps);
        assert_relative_eq!(dx[[0, 1]], numeric, epsilon = 1e-2);
    }

    #[test]
    fn input_gradient_matches_finite_difference() {
        let mut r = rng();
        let mlp = Mlp::new(4, &[6, 6], 1, Activation::Relu, Activation::None, &mut r);
        let x = randn(3, 4, &mut r);
        let (_, cache) = mlp.forward_cached(&x);
        let (g, _) = mlp.input_gradient(&cache);

        let eps = 1e-3f32;
        for &(row, col) in &[(0usize, 0usize), (1, 2), (2, 3)] {
            let mut x_up = x.clone();
            x_up[[row, col]] += eps;
            let mut x_down = x.clone();
            x_down[[row, col]] -= eps;
            let numeric =
                (mlp.forward(&x_up)[[row, 0]] - mlp.forward(&x_down)[[row, 0]]) / (2.0 * eps);
            assert_relative_eq!(g[[row, col]], numeric, epsilon = 1e-2);
        }
    }

    /// The gradient-penalty weight gradient against central differences of
    /// the penalty computed from scratch.
    #[test]
    fn penalty_backward_matches_finite_difference() {
        let mut r = rng();
        let mlp = Mlp::new(3, &[5], 1, Activation::Relu, Activation::None, &mut r);
        let x = randn(4, 3, &mut r);

        let penalty = |m: &Mlp| -> f32 {
            let (_, cache) = m.forward_cached(&x);
            let (g, _) = m.input_gradient(&cache);
            let n = g.nrows() as f32;
            g.rows()
                .into_iter()
                .map(|row| {
                    let norm = row.dot(&row).sqrt();
                    (norm - 1.0).powi(2)
                })
                .sum::<f32>()
                / n
        };

        let (_, cache) = mlp.forward_cached(&x);
        let (g, adjoint) = mlp.input_gradient(&cache);
        let n = g.nrows() as f32;
        let mut d_g = g.clone();
        for mut row in d_g.rows_mut() {
            let norm = row.dot(&row).sqrt().max(1e-8);
            let scale = 2.0 * (norm - 1.0) / (n * norm);
            row.mapv_inplace(|v| v * scale);
        }
        let mut grads = MlpGrads::zeros_like(&mlp);
        mlp.penalty_backward(&adjoint, &d_g, &mut grads);

        let eps = 1e-3f32;
        for &(layer, i, j) in &[(0usize, 0usize, 0usize), (0, 3, 2), (1, 0, 4)] {
            let mut up = mlp.clone();
            up.layers_mut()[layer].weight[[i, j]] += eps;
            let mut down = mlp.clone();
            down.layers_mut()[layer].weight[[i, j]] -= eps;
            let numeric = (penalty(&up) - penalty(&down)) / (2.0 * eps);
            assert_relative_eq!(grads.weights[layer][[i, j]], numeric, epsilon = 2e-2);
        }
    }

    #[test]
    fn standard_normal_moments() {
        let mut r = rng();
        let n = 20_000;
        let samples: Vec<f32> = (0..n).map(|_| standard_normal(&mut r)).collect();
        let mean = samples.iter().sum::<f32>() / n as f32;
        let var = samples.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n as f32;
        assert!(mean.abs() < 0.05, "mean {mean}");
        assert!((var - 1.0).abs() < 0.1, "var {var}");
    }

    #[test]
    fn xavier_init_bounds() {
        let mut r = rng();
        let mlp = Mlp::new(10, &[], 10, Activation::None, Activation::None, &mut r);
        let limit = (6.0 / 20.0f32).sqrt();
        for &w in mlp.layers()[0].weight.iter() {
            assert!(w.abs() <= limit);
        }
        assert!(mlp.layers()[0].bias.iter().all(|&b| b == 0.0));
    }
}
