//! Discretized mixture of logistics likelihood (PixelCNN++).
//!
//! Every sub-pixel is modelled as a mixture of `nr_mix` logistic distributions
//! whose mass is integrated over the quantisation bin the observed value falls
//! into. The green and blue means depend linearly on the preceding sub-pixels
//! of the same pixel.

use crate::config::PixelCnnConfig;
use crate::losses::{log_prob_from_logits, log_sum_exp};
use crate::tensor::Tensor;

/// Edge bins: values beyond these thresholds are the lowest/highest level.
const EDGE: f32 = 0.999;
/// Below this bin mass the density at the bin centre is used instead.
const MIN_CDF_DELTA: f32 = 1e-5;
const CDF_DELTA_FLOOR: f32 = 1e-12;

/// CHW -> HWC.
pub(crate) fn to_hwc(t: &Tensor) -> Tensor {
    t.transpose(0, 1).transpose(1, 2)
}

/// The per-channel parameters of every mixture component, in HWC layout.
pub(crate) struct MixtureParams {
    /// `[H, W, nr_mix]`
    pub logit_probs: Tensor,
    /// `[H, W, 3, nr_mix]` each.
    pub means: Tensor,
    pub log_scales: Tensor,
    pub coeffs: Tensor,
}

/// Splits HWC network output `[H, W, 10 * nr_mix]` into mixture parameters.
///
/// The leading reshape pins the channel count, so any other size of `l` fails
/// shape inference instead of leaving channels unread.
pub(crate) fn unpack(l: &Tensor, nr_mix: usize, config: &PixelCnnConfig) -> MixtureParams {
    let (h, w, c) = (config.height, config.width, config.channels);
    let l = l.reshape(&[h, w, 10 * nr_mix]);
    let logit_probs = l.slice(2, 0, nr_mix);
    let rest = l.slice(2, nr_mix, 10 * nr_mix).reshape(&[h, w, c, 3 * nr_mix]);

    MixtureParams {
        logit_probs,
        means: rest.slice(3, 0, nr_mix),
        log_scales: rest
            .slice(3, nr_mix, 2 * nr_mix)
            .maximum_scalar(config.min_log_scale),
        coeffs: rest.slice(3, 2 * nr_mix, 3 * nr_mix).tanh(),
    }
}

/// Negative log-likelihood of image `x` under the mixture `l`.
///
/// # Arguments
///
/// * `x` - Image in `[-1, 1]`, `[C, H, W]`.
/// * `l` - Network output, `[10 * nr_mix, H, W]`.
///
/// # Returns
///
/// Shape `[1]`: the summed NLL in nats over every sub-pixel.
pub fn discretized_mix_logistic_loss(x: &Tensor, l: &Tensor, config: &PixelCnnConfig) -> Tensor {
    let (h, w, c) = (config.height, config.width, config.channels);
    let nr_mix = config.nr_mix;

    let x = to_hwc(x).reshape(&[h, w, c, 1]);
    let l = to_hwc(l);
    let params = unpack(&l, nr_mix, config);

    // Green and blue means are shifted by the already known sub-pixels.
    let x0 = x.slice(2, 0, 1);
    let x1 = x.slice(2, 1, 2);
    let coeff = |i: usize| params.coeffs.slice(2, i, i + 1);
    let m1 = params.means.slice(2, 0, 1);
    let m2 = &params.means.slice(2, 1, 2) + &(&coeff(0) * &x0);
    let m3 = &(&params.means.slice(2, 2, 3) + &(&coeff(1) * &x0)) + &(&coeff(2) * &x1);
    let means = m1.concat(&[&m2, &m3], 2);

    let centered_x = &x - &means;
    let inv_stdv = params.log_scales.neg().exp();
    let half_bin = config.bin_width() / 2.0;

    let plus_in = &inv_stdv * &centered_x.add_scalar(half_bin);
    let cdf_plus = plus_in.sigmoid();
    let min_in = &inv_stdv * &centered_x.add_scalar(-half_bin);
    let cdf_min = min_in.sigmoid();

    // log P for the lowest level: log sigmoid(plus_in)
    let log_cdf_plus = &plus_in - &plus_in.softplus();
    // log P for the highest level: log(1 - sigmoid(min_in))
    let log_one_minus_cdf_min = min_in.softplus().neg();
    let cdf_delta = &cdf_plus - &cdf_min;

    let mid_in = &inv_stdv * &centered_x;
    let log_pdf_mid = &(&mid_in - &params.log_scales) - &mid_in.softplus().mul_scalar(2.0);
    let log_half_levels = ((config.num_levels - 1) as f32 / 2.0).ln();

    let interior = cdf_delta.greater_than(MIN_CDF_DELTA).select(
        &cdf_delta.maximum_scalar(CDF_DELTA_FLOOR).log(),
        &log_pdf_mid.add_scalar(-log_half_levels),
    );
    let upper = x.greater_than(EDGE).select(&log_one_minus_cdf_min, &interior);
    let log_probs = x.less_than(-EDGE).select(&log_cdf_plus, &upper);

    // [H, W, 3, nr_mix] -> [H, W, nr_mix]
    let log_probs = log_probs.sum_axis(2).reshape(&[h, w, nr_mix]);
    let log_probs = &log_probs + &log_prob_from_logits(&params.logit_probs, 2);

    let per_pixel = log_sum_exp(&log_probs, 2);
    per_pixel.sum().neg().reshape(&[1])
}
