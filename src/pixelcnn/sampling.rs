//! Drawing images from a discretized logistic mixture.

use super::mixture::{to_hwc, unpack};
use crate::config::PixelCnnConfig;
use crate::error::{PixelCnnError, Result};
use crate::tensor::Tensor;
use ndarray::{ArrayD, IxDyn};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::Rng;

/// Uniform draws stay away from 0 and 1 so the logs below stay finite.
const U_MIN: f32 = 1e-5;
const U_MAX: f32 = 1.0 - 1e-5;

fn uniform_noise<R: Rng + ?Sized>(shape: &[usize], rng: &mut R) -> ArrayD<f32> {
    ArrayD::random_using(IxDyn(shape), Uniform::new(U_MIN, U_MAX), rng)
}

/// Samples one image from mixture parameters `l` (`[10 * nr_mix, H, W]`).
///
/// A component is picked per pixel with the Gumbel-max trick, a value is drawn
/// from its logistic by inverse CDF, and the channels are clipped to `[-1, 1]`
/// in order, each one feeding the mean of the next through the mixture
/// coefficients. No rounding to the nearest level is applied.
///
/// The noise is drawn from `rng` while building the graph and embedded as
/// literals, so the result is reproducible for a seeded RNG.
///
/// # Returns
///
/// `[C, H, W]`, `[3, 32, 32]` for the default config.
///
/// # Errors
///
/// [`PixelCnnError::MixtureCount`] if `nr_mix` differs from `config.nr_mix`.
/// An `l` of the wrong size fails shape inference when the graph is run.
pub fn sample_from_discretized_mix_logistic<R: Rng + ?Sized>(
    l: &Tensor,
    nr_mix: usize,
    config: &PixelCnnConfig,
    rng: &mut R,
) -> Result<Tensor> {
    if nr_mix != config.nr_mix {
        return Err(PixelCnnError::MixtureCount {
            requested: nr_mix,
            configured: config.nr_mix,
        });
    }
    let (h, w, c) = (config.height, config.width, config.channels);
    let context = &l.context;

    let l = to_hwc(l);
    let params = unpack(&l, nr_mix, config);

    // Gumbel-max: argmax(logits + g), g = -log(-log(u)).
    let u = Tensor::new_literal(context, uniform_noise(&[h, w, nr_mix], rng), "gumbel_u");
    let gumbel = &params.logit_probs - &u.log().neg().log();
    let sel = gumbel.argmax(2).one_hot(nr_mix).reshape(&[h, w, 1, nr_mix]);

    let pick = |t: &Tensor| (t * &sel).sum_axis(3).reshape(&[h, w, c]);
    let means = pick(&params.means);
    // Already floored per component by `unpack`.
    let log_scales = pick(&params.log_scales);
    let coeffs = pick(&params.coeffs);

    // Inverse CDF of the logistic: log(u) - log(1 - u).
    let u = Tensor::new_literal(context, uniform_noise(&[h, w, c], rng), "logistic_u");
    let logistic = &u.log() - &u.neg().add_scalar(1.0).log();
    let x = &means + &(&log_scales.exp() * &logistic);

    let coeff = |i: usize| coeffs.slice(2, i, i + 1);
    let x0 = x.slice(2, 0, 1).clamp(-1.0, 1.0);
    let x1 = (&x.slice(2, 1, 2) + &(&coeff(0) * &x0)).clamp(-1.0, 1.0);
    let x2 = (&(&x.slice(2, 2, 3) + &(&coeff(1) * &x0)) + &(&coeff(2) * &x1)).clamp(-1.0, 1.0);

    // HWC -> CHW
    Ok(x0.concat(&[&x1, &x2], 2).transpose(1, 2).transpose(0, 1))
}
