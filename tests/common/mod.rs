//! Shared fixtures and f64 scalar reference implementations of both losses.
#![allow(dead_code)]

use ndarray::{ArrayD, IxDyn};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use pixelasg::config::PixelCnnConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub fn rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// 2x3 image, 2 mixture components: small enough for per-element finite differences.
pub fn small_config() -> PixelCnnConfig {
    PixelCnnConfig::new().with_image_size(2, 3).with_nr_mix(2)
}

pub fn random_mixture_params(config: &PixelCnnConfig, rng: &mut StdRng, scale: f32) -> ArrayD<f32> {
    ArrayD::random_using(
        IxDyn(&[config.mixture_channels(), config.height, config.width]),
        Uniform::new(-scale, scale),
        rng,
    )
}

/// Quantised image in `[-1, 1]` with at least one sub-pixel in each edge bin.
pub fn random_image(config: &PixelCnnConfig, rng: &mut StdRng) -> ArrayD<f32> {
    let top = (config.num_levels - 1) as f32;
    let mut image = ArrayD::from_shape_fn(IxDyn(&[config.channels, config.height, config.width]), |_| {
        rng.gen_range(0..config.num_levels) as f32 / top * 2.0 - 1.0
    });
    image[[0, 0, 0]] = -1.0;
    image[[1, 0, 1]] = 1.0;
    image
}

fn softplus(x: f64) -> f64 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn log_sum_exp(xs: &[f64]) -> f64 {
    let m = xs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    m + xs.iter().map(|x| (x - m).exp()).sum::<f64>().ln()
}

/// Log-probability of one sub-pixel value under one logistic component.
pub fn logistic_bin_log_prob(x: f64, mean: f64, log_scale: f64, num_levels: usize) -> f64 {
    let half_bin = 1.0 / (num_levels - 1) as f64;
    let inv = (-log_scale).exp();
    let centered = x - mean;
    let plus_in = inv * (centered + half_bin);
    let min_in = inv * (centered - half_bin);
    let mid_in = inv * centered;

    if x < -0.999 {
        plus_in - softplus(plus_in)
    } else if x > 0.999 {
        -softplus(min_in)
    } else {
        let cdf_delta = sigmoid(plus_in) - sigmoid(min_in);
        if cdf_delta > 1e-5 {
            cdf_delta.max(1e-12).ln()
        } else {
            mid_in - log_scale - 2.0 * softplus(mid_in) - ((num_levels - 1) as f64 / 2.0).ln()
        }
    }
}

/// Direct per-pixel evaluation of the discretized logistic mixture NLL.
pub fn mixture_nll(x: &ArrayD<f32>, l: &ArrayD<f32>, config: &PixelCnnConfig) -> f64 {
    let nr = config.nr_mix;
    let p = |ch: usize, h: usize, w: usize| l[[ch, h, w]] as f64;
    let mut nll = 0.0;

    for h in 0..config.height {
        for w in 0..config.width {
            let logits: Vec<f64> = (0..nr).map(|k| p(k, h, w)).collect();
            let norm = log_sum_exp(&logits);
            let xs: Vec<f64> = (0..3).map(|c| x[[c, h, w]] as f64).collect();

            let per_component: Vec<f64> = (0..nr)
                .map(|k| {
                    let mean = |c: usize| p(nr + c * 3 * nr + k, h, w);
                    let log_scale = |c: usize| p(nr + c * 3 * nr + nr + k, h, w).max(config.min_log_scale as f64);
                    let coeff = |c: usize| p(nr + c * 3 * nr + 2 * nr + k, h, w).tanh();

                    let means = [
                        mean(0),
                        mean(1) + coeff(0) * xs[0],
                        mean(2) + coeff(1) * xs[0] + coeff(2) * xs[1],
                    ];
                    let lp: f64 = (0..3)
                        .map(|c| logistic_bin_log_prob(xs[c], means[c], log_scale(c), config.num_levels))
                        .sum();
                    lp + logits[k] - norm
                })
                .collect();
            nll -= log_sum_exp(&per_component);
        }
    }
    nll
}

/// `sum_j (logsumexp(pred[:, j]) - sum_r target[r, j] * pred[r, j])` over the
/// row-major `[num_levels, C * H * W]` view of `prediction`.
pub fn category_nll(target: &ArrayD<f32>, prediction: &ArrayD<f32>, config: &PixelCnnConfig) -> f64 {
    let dims = config.dims();
    let flat: Vec<f64> = prediction.iter().map(|&v| v as f64).collect();
    let mut nll = 0.0;
    for j in 0..dims {
        let column: Vec<f64> = (0..config.num_levels).map(|r| flat[r * dims + j]).collect();
        let picked: f64 = (0..config.num_levels)
            .map(|r| target[[r, j]] as f64 * column[r])
            .sum();
        nll += log_sum_exp(&column) - picked;
    }
    nll
}

/// Central differences of `f` around `z`, in f64.
pub fn numeric_grad(z: &ArrayD<f32>, eps: f32, f: impl Fn(&ArrayD<f32>) -> f64) -> ArrayD<f32> {
    let mut grad = ArrayD::<f32>::zeros(z.raw_dim());
    for (i, g) in grad.iter_mut().enumerate() {
        let mut plus = z.clone();
        let mut minus = z.clone();
        plus.as_slice_mut().expect("standard layout")[i] += eps;
        minus.as_slice_mut().expect("standard layout")[i] -= eps;
        let step = plus.as_slice().expect("standard layout")[i] as f64
            - minus.as_slice().expect("standard layout")[i] as f64;
        *g = ((f(&plus) - f(&minus)) / step) as f32;
    }
    grad
}

/// `|a - n| <= atol + rtol * max(|a|, |n|)` elementwise.
pub fn assert_close(actual: &ArrayD<f32>, expected: &ArrayD<f32>, atol: f32, rtol: f32) {
    assert_eq!(actual.shape(), expected.shape(), "shapes differ");
    for (i, (a, e)) in actual.iter().zip(expected.iter()).enumerate() {
        let bound = atol + rtol * a.abs().max(e.abs());
        assert!(
            (a - e).abs() <= bound,
            "element {}: got {:.6}, expected {:.6} (bound {:.2e})",
            i,
            a,
            e,
            bound
        );
    }
}
