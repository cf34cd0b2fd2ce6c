//! Numerically stable softmax-family building blocks in graph paradigm.
//!
//! Functions here take symbolic `Tensor` descriptors and append the nodes that
//! compute the value; nothing is evaluated until a backend runs the graph.
//! The PixelCNN likelihoods in [`crate::pixelcnn`] are assembled from them.
//!
//! All reductions keep the reduced axis with length 1, so results broadcast
//! straight back against their input.

use crate::tensor::Tensor;

// ============================================================================
// Log-sum-exp
// ============================================================================

/// `log(sum(exp(x)))` along `axis`, computed as `m + log(sum(exp(x - m)))`
/// with `m = max(x)` so large logits do not overflow.
///
/// # Arguments
///
/// * `x` - Symbolic `Tensor` of any rank.
/// * `axis` - Axis to reduce; it is kept with length 1.
pub fn log_sum_exp(x: &Tensor, axis: usize) -> Tensor {
    let m = x.max_axis(axis);
    let shifted = x - &m;
    let summed = shifted.exp().sum_axis(axis).log();
    &m + &summed
}

/// Log-softmax along `axis`: `x - log_sum_exp(x)`. Same shape as `x`.
pub fn log_prob_from_logits(x: &Tensor, axis: usize) -> Tensor {
    let lse = log_sum_exp(x, axis);
    x - &lse
}

// ============================================================================
// Cross-entropy
// ============================================================================

/// Cross-entropy between `softmax(logits)` and a (one-hot or soft) `targets`
/// distribution along `axis`.
///
/// Formula: `CE = logsumexp(logits) - sum(targets * logits)`, which is
/// `-sum(targets * log_softmax(logits))` whenever `targets` sums to 1.
///
/// # Returns
///
/// Per-column losses; `axis` is kept with length 1.
pub fn cross_entropy_with_softmax(logits: &Tensor, targets: &Tensor, axis: usize) -> Tensor {
    let lse = log_sum_exp(logits, axis);
    let picked = (targets * logits).sum_axis(axis);
    &lse - &picked
}
