//! Native `ndarray` building blocks.
//!
//! Convolution, inference-form batch normalization and the two classifier
//! layer types used by the experts and the gate. Feature maps use the
//! `[batch, channels, height, width]` layout throughout.

use ndarray::{s, Array1, Array2, Array4, ArrayView1, Axis};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal, Uniform};
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, ModelResult};

const BN_EPS: f32 = 1e-5;
const NORM_EPS: f32 = 1e-12;

fn kaiming_std(fan_in: usize) -> f32 {
    (2.0 / fan_in.max(1) as f32).sqrt()
}

// ---------------------------------------------------------------------------
// Conv2d
// ---------------------------------------------------------------------------

/// Bias-free 2-D convolution with a square kernel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conv2d {
    /// `[out_channels, in_channels, kernel, kernel]`
    weight: Array4<f32>,
    stride: usize,
    padding: usize,
}

impl Conv2d {
    /// Kaiming-normal initialised convolution.
    pub fn new<R: Rng>(
        rng: &mut R,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
    ) -> Self {
        let std = kaiming_std(in_channels * kernel * kernel);
        let weight = Array4::from_shape_fn((out_channels, in_channels, kernel, kernel), |_| {
            let z: f32 = StandardNormal.sample(&mut *rng);
            z * std
        });
        Conv2d { weight, stride: stride.max(1), padding }
    }

    /// Build from explicit weights.
    pub fn from_weight(weight: Array4<f32>, stride: usize, padding: usize) -> Self {
        Conv2d { weight, stride: stride.max(1), padding }
    }

    /// Number of input channels.
    pub fn in_channels(&self) -> usize {
        self.weight.dim().1
    }

    /// Number of output channels.
    pub fn out_channels(&self) -> usize {
        self.weight.dim().0
    }

    /// Number of learned values.
    pub fn num_parameters(&self) -> usize {
        self.weight.len()
    }

    /// Check the invariants [`Conv2d::new`] establishes: a square kernel and a
    /// non-zero stride.
    pub fn validate(&self) -> ModelResult<()> {
        let (oc, ic, kh, kw) = self.weight.dim();
        if kh != kw || kh == 0 {
            return Err(ModelError::shape_mismatch(vec![oc, ic, kh, kh], vec![oc, ic, kh, kw]));
        }
        if self.stride == 0 {
            return Err(ModelError::tensor_op("convolution stride must be > 0"));
        }
        Ok(())
    }

    /// Spatial output size for an `h × w` input.
    pub fn output_hw(&self, h: usize, w: usize) -> (usize, usize) {
        let k = self.weight.dim().2;
        (
            (h + 2 * self.padding).saturating_sub(k) / self.stride + 1,
            (w + 2 * self.padding).saturating_sub(k) / self.stride + 1,
        )
    }

    /// Convolve a `[B, C_in, H, W]` batch via im2col and one matmul per sample.
    pub fn forward(&self, x: &Array4<f32>) -> ModelResult<Array4<f32>> {
        let (batch, channels, h, w) = x.dim();
        let (oc, ic, k, _) = self.weight.dim();
        if channels != ic || h + 2 * self.padding < k || w + 2 * self.padding < k {
            return Err(ModelError::shape_mismatch(
                vec![batch, ic, h.max(k), w.max(k)],
                vec![batch, channels, h, w],
            ));
        }
        let (oh, ow) = self.output_hw(h, w);
        let (stride, pad) = (self.stride as isize, self.padding as isize);

        let kernel = Array2::from_shape_fn((oc, ic * k * k), |(o, r)| {
            self.weight[[o, r / (k * k), (r / k) % k, r % k]]
        });

        let mut out = Array4::<f32>::zeros((batch, oc, oh, ow));
        let mut cols = Array2::<f32>::zeros((ic * k * k, oh * ow));
        for b in 0..batch {
            cols.fill(0.0);
            for c in 0..ic {
                for ky in 0..k {
                    for kx in 0..k {
                        let row = (c * k + ky) * k + kx;
                        for oy in 0..oh {
                            let iy = oy as isize * stride + ky as isize - pad;
                            if iy < 0 || iy >= h as isize {
                                continue;
                            }
                            for ox in 0..ow {
                                let ix = ox as isize * stride + kx as isize - pad;
                                if ix < 0 || ix >= w as isize {
                                    continue;
                                }
                                cols[[row, oy * ow + ox]] = x[[b, c, iy as usize, ix as usize]];
                            }
                        }
                    }
                }
            }
            let y = kernel.dot(&cols);
            for (o, plane) in y.outer_iter().enumerate() {
                for (idx, &v) in plane.iter().enumerate() {
                    out[[b, o, idx / ow, idx % ow]] = v;
                }
            }
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// BatchNorm2d
// ---------------------------------------------------------------------------

/// Batch normalization evaluated with running statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchNorm2d {
    gamma: Array1<f32>,
    beta: Array1<f32>,
    running_mean: Array1<f32>,
    running_var: Array1<f32>,
}

impl BatchNorm2d {
    /// Identity-initialised normalization over `channels`.
    pub fn new(channels: usize) -> Self {
        BatchNorm2d {
            gamma: Array1::ones(channels),
            beta: Array1::zeros(channels),
            running_mean: Array1::zeros(channels),
            running_var: Array1::ones(channels),
        }
    }

    /// Build from explicit affine parameters and running statistics.
    pub fn from_stats(
        gamma: Array1<f32>,
        beta: Array1<f32>,
        running_mean: Array1<f32>,
        running_var: Array1<f32>,
    ) -> ModelResult<Self> {
        let bn = BatchNorm2d { gamma, beta, running_mean, running_var };
        bn.validate()?;
        Ok(bn)
    }

    /// Check that parameters and running statistics agree in length.
    pub fn validate(&self) -> ModelResult<()> {
        let n = self.gamma.len();
        for v in [&self.beta, &self.running_mean, &self.running_var] {
            if v.len() != n {
                return Err(ModelError::shape_mismatch(vec![n], vec![v.len()]));
            }
        }
        Ok(())
    }

    /// Number of normalised channels.
    pub fn channels(&self) -> usize {
        self.gamma.len()
    }

    /// Learned values (running statistics are buffers, not parameters).
    pub fn num_parameters(&self) -> usize {
        self.gamma.len() + self.beta.len()
    }

    /// Normalise a `[B, C, H, W]` batch channel-wise.
    pub fn forward(&self, x: &Array4<f32>) -> ModelResult<Array4<f32>> {
        let (batch, channels, h, w) = x.dim();
        if channels != self.channels() {
            return Err(ModelError::shape_mismatch(
                vec![batch, self.channels(), h, w],
                vec![batch, channels, h, w],
            ));
        }
        let mut out = x.clone();
        for (c, mut plane) in out.axis_iter_mut(Axis(1)).enumerate() {
            let scale = self.gamma[c] / (self.running_var[c] + BN_EPS).sqrt();
            let shift = self.beta[c] - self.running_mean[c] * scale;
            plane.mapv_inplace(|v| v * scale + shift);
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Linear
// ---------------------------------------------------------------------------

/// Fully connected layer `y = x Wᵀ + b`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Linear {
    /// `[out_features, in_features]`
    weight: Array2<f32>,
    bias: Array1<f32>,
}

/// Gradient of a [`Linear`] layer, shaped like its parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearGrad {
    /// `∂L/∂W`, `[out_features, in_features]`.
    pub weight: Array2<f32>,
    /// `∂L/∂b`, `[out_features]`.
    pub bias: Array1<f32>,
}

impl Linear {
    /// Kaiming-normal weights, zero bias.
    pub fn new<R: Rng>(rng: &mut R, in_features: usize, out_features: usize) -> Self {
        let std = kaiming_std(in_features);
        let weight = Array2::from_shape_fn((out_features, in_features), |_| {
            let z: f32 = StandardNormal.sample(&mut *rng);
            z * std
        });
        Linear { weight, bias: Array1::zeros(out_features) }
    }

    /// Build from explicit parameters.
    pub fn from_parts(weight: Array2<f32>, bias: Array1<f32>) -> ModelResult<Self> {
        let layer = Linear { weight, bias };
        layer.validate()?;
        Ok(layer)
    }

    /// Check that the bias has one entry per output.
    pub fn validate(&self) -> ModelResult<()> {
        if self.weight.nrows() != self.bias.len() {
            return Err(ModelError::shape_mismatch(
                vec![self.weight.nrows()],
                vec![self.bias.len()],
            ));
        }
        Ok(())
    }

    /// Input width.
    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    /// Output width.
    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    /// Weight matrix, `[out_features, in_features]`.
    pub fn weight(&self) -> &Array2<f32> {
        &self.weight
    }

    /// Bias vector.
    pub fn bias(&self) -> &Array1<f32> {
        &self.bias
    }

    /// Number of learned values.
    pub fn num_parameters(&self) -> usize {
        self.weight.len() + self.bias.len()
    }

    /// Apply to a `[B, in_features]` batch.
    pub fn forward(&self, x: &Array2<f32>) -> ModelResult<Array2<f32>> {
        if x.ncols() != self.in_features() {
            return Err(ModelError::shape_mismatch(
                vec![x.nrows(), self.in_features()],
                vec![x.nrows(), x.ncols()],
            ));
        }
        Ok(x.dot(&self.weight.t()) + &self.bias)
    }

    /// Zero gradient with this layer's shapes.
    pub fn zero_grad(&self) -> LinearGrad {
        LinearGrad {
            weight: Array2::zeros(self.weight.raw_dim()),
            bias: Array1::zeros(self.bias.raw_dim()),
        }
    }

    /// Plain gradient step `θ ← θ - lr · g`.
    pub fn step(&mut self, grad: &LinearGrad, lr: f32) -> ModelResult<()> {
        if grad.weight.dim() != self.weight.dim() || grad.bias.len() != self.bias.len() {
            return Err(ModelError::shape_mismatch(
                vec![self.weight.nrows(), self.weight.ncols()],
                vec![grad.weight.nrows(), grad.weight.ncols()],
            ));
        }
        self.weight.scaled_add(-lr, &grad.weight);
        self.bias.scaled_add(-lr, &grad.bias);
        Ok(())
    }
}

impl LinearGrad {
    /// Element-wise accumulate `other` into `self`.
    pub fn accumulate(&mut self, other: &LinearGrad) {
        self.weight += &other.weight;
        self.bias += &other.bias;
    }
}

// ---------------------------------------------------------------------------
// NormedLinear
// ---------------------------------------------------------------------------

/// Cosine-similarity classifier: `normalize_rows(x) · normalize_cols(W)`.
///
/// Outputs lie in `[-1, 1]`; the caller multiplies them by a scale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormedLinear {
    /// `[in_features, out_features]`
    weight: Array2<f32>,
}

impl NormedLinear {
    /// Uniform `[-1, 1]` weights with unit-norm columns.
    pub fn new<R: Rng>(rng: &mut R, in_features: usize, out_features: usize) -> Self {
        let dist = Uniform::new_inclusive(-1.0_f32, 1.0);
        let raw = Array2::from_shape_fn((in_features, out_features), |_| dist.sample(&mut *rng));
        NormedLinear { weight: l2_normalize_cols(&raw) }
    }

    /// Input width.
    pub fn in_features(&self) -> usize {
        self.weight.nrows()
    }

    /// Number of learned values.
    pub fn num_parameters(&self) -> usize {
        self.weight.len()
    }

    /// Apply to a `[B, in_features]` batch.
    pub fn forward(&self, x: &Array2<f32>) -> ModelResult<Array2<f32>> {
        if x.ncols() != self.in_features() {
            return Err(ModelError::shape_mismatch(
                vec![x.nrows(), self.in_features()],
                vec![x.nrows(), x.ncols()],
            ));
        }
        Ok(l2_normalize_rows(x).dot(&l2_normalize_cols(&self.weight)))
    }
}

// ---------------------------------------------------------------------------
// Free functions
// ---------------------------------------------------------------------------

/// Element-wise `max(0, x)`.
pub fn relu(x: Array4<f32>) -> Array4<f32> {
    x.mapv_into(|v| v.max(0.0))
}

/// Mean over the spatial axes: `[B, C, H, W] → [B, C]`.
pub fn global_avg_pool(x: &Array4<f32>) -> Array2<f32> {
    let (batch, channels, h, w) = x.dim();
    let area = (h * w).max(1) as f32;
    Array2::from_shape_fn((batch, channels), |(b, c)| {
        x.slice(s![b, c, .., ..]).sum() / area
    })
}

fn l2_norm(v: ArrayView1<f32>) -> f32 {
    v.dot(&v).sqrt().max(NORM_EPS)
}

/// Scale every row to unit L2 norm.
pub fn l2_normalize_rows(x: &Array2<f32>) -> Array2<f32> {
    let mut out = x.clone();
    for mut row in out.rows_mut() {
        let n = l2_norm(row.view());
        row.mapv_inplace(|v| v / n);
    }
    out
}

/// Scale every column to unit L2 norm.
pub fn l2_normalize_cols(x: &Array2<f32>) -> Array2<f32> {
    let mut out = x.clone();
    for mut col in out.columns_mut() {
        let n = l2_norm(col.view());
        col.mapv_inplace(|v| v / n);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn conv_identity_kernel_preserves_input() {
        let mut weight = Array4::zeros((1, 1, 3, 3));
        weight[[0, 0, 1, 1]] = 1.0;
        let conv = Conv2d::from_weight(weight, 1, 1);
        let x = Array4::from_shape_fn((2, 1, 4, 4), |(b, _, h, w)| (b * 16 + h * 4 + w) as f32);
        let y = conv.forward(&x).unwrap();
        assert_eq!(y, x);
    }

    #[test]
    fn conv_stride_two_halves_resolution() {
        let mut rng = StdRng::seed_from_u64(0);
        let conv = Conv2d::new(&mut rng, 3, 8, 3, 2, 1);
        let y = conv.forward(&Array4::ones((1, 3, 8, 8))).unwrap();
        assert_eq!(y.dim(), (1, 8, 4, 4));
        let y = conv.forward(&Array4::ones((1, 3, 7, 7))).unwrap();
        assert_eq!(y.dim(), (1, 8, 4, 4));
    }

    #[test]
    fn conv_box_filter_counts_valid_taps() {
        let conv = Conv2d::from_weight(Array4::ones((1, 1, 3, 3)), 1, 1);
        let y = conv.forward(&Array4::ones((1, 1, 3, 3))).unwrap();
        // Corners see 4 taps, edges 6, centre 9.
        assert_eq!(y[[0, 0, 0, 0]], 4.0);
        assert_eq!(y[[0, 0, 0, 1]], 6.0);
        assert_eq!(y[[0, 0, 1, 1]], 9.0);
    }

    #[test]
    fn conv_rejects_wrong_channel_count() {
        let mut rng = StdRng::seed_from_u64(0);
        let conv = Conv2d::new(&mut rng, 3, 4, 3, 1, 1);
        assert!(matches!(
            conv.forward(&Array4::zeros((1, 2, 4, 4))),
            Err(ModelError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn batch_norm_applies_running_stats() {
        let bn = BatchNorm2d::from_stats(
            array![2.0],
            array![1.0],
            array![3.0],
            array![4.0 - BN_EPS],
        )
        .unwrap();
        let y = bn.forward(&Array4::from_elem((1, 1, 2, 2), 5.0)).unwrap();
        // (5 - 3) / 2 * 2 + 1
        for &v in y.iter() {
            assert_abs_diff_eq!(v, 3.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn validate_catches_inconsistent_parameters() {
        let bn = BatchNorm2d {
            gamma: Array1::ones(3),
            beta: Array1::zeros(3),
            running_mean: Array1::zeros(3),
            running_var: Array1::ones(2),
        };
        assert!(matches!(bn.validate(), Err(ModelError::ShapeMismatch { .. })));

        let linear = Linear { weight: Array2::zeros((2, 3)), bias: Array1::zeros(1) };
        assert!(linear.validate().is_err());

        let conv = Conv2d { weight: Array4::zeros((1, 1, 3, 2)), stride: 1, padding: 1 };
        assert!(conv.validate().is_err());
        let conv = Conv2d { weight: Array4::zeros((1, 1, 3, 3)), stride: 0, padding: 1 };
        assert!(conv.validate().is_err());
    }

    #[test]
    fn linear_matches_manual_product() {
        let layer = Linear::from_parts(array![[1.0, 2.0], [0.0, -1.0]], array![0.5, 0.0]).unwrap();
        let y = layer.forward(&array![[1.0, 1.0], [2.0, 0.0]]).unwrap();
        assert_eq!(y, array![[3.5, -1.0], [2.5, 0.0]]);
    }

    #[test]
    fn linear_step_moves_against_gradient() {
        let mut layer = Linear::from_parts(array![[1.0]], array![0.0]).unwrap();
        let grad = LinearGrad { weight: array![[2.0]], bias: array![-1.0] };
        layer.step(&grad, 0.5).unwrap();
        assert_eq!(layer.weight()[[0, 0]], 0.0);
        assert_eq!(layer.bias()[0], 0.5);
    }

    #[test]
    fn normed_linear_outputs_cosines() {
        let mut rng = StdRng::seed_from_u64(7);
        let head = NormedLinear::new(&mut rng, 6, 4);
        let x = Array2::from_shape_fn((3, 6), |(i, j)| (i + j) as f32 - 2.0);
        let y = head.forward(&x).unwrap();
        assert!(y.iter().all(|&v| (-1.0 - 1e-5..=1.0 + 1e-5).contains(&v)));
    }

    #[test]
    fn global_pool_and_normalize() {
        let x = Array4::from_shape_fn((1, 2, 2, 2), |(_, c, _, _)| if c == 0 { 3.0 } else { 4.0 });
        let pooled = global_avg_pool(&x);
        assert_eq!(pooled, array![[3.0, 4.0]]);
        let unit = l2_normalize_rows(&pooled);
        assert_abs_diff_eq!(unit[[0, 0]], 0.6, epsilon = 1e-6);
        assert_abs_diff_eq!(unit[[0, 1]], 0.8, epsilon = 1e-6);
    }

    #[test]
    fn normalize_zero_row_stays_finite() {
        let unit = l2_normalize_rows(&Array2::zeros((1, 3)));
        assert!(unit.iter().all(|v| v.is_finite()));
    }
}
