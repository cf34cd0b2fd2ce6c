//! Categorical (256-way softmax) likelihood.

use crate::config::PixelCnnConfig;
use crate::error::{PixelCnnError, Result};
use crate::losses::cross_entropy_with_softmax;
use crate::tensor::Tensor;
use ndarray::{ArrayD, IxDyn};

/// Summed cross-entropy of a per-sub-pixel softmax over `num_levels` levels.
///
/// # Arguments
///
/// * `target` - One-hot levels, `[num_levels, C * H * W]`
///   (see [`encode_one_hot_targets`]).
/// * `prediction` - Logits, `[C * num_levels, H, W]`. The row-major reshape
///   to `[num_levels, C * H * W]` means channel `k * C + c` holds the logit of
///   level `k` for colour `c`.
///
/// # Returns
///
/// Scalar NLL in nats.
pub fn softmax_256_loss(target: &Tensor, prediction: &Tensor, config: &PixelCnnConfig) -> Tensor {
    let (levels, dims) = (config.num_levels, config.dims());
    let logits = prediction.reshape(&[levels, dims]);
    // Pinned like the logits: a narrower target would otherwise broadcast.
    let target = target.reshape(&[levels, dims]);
    cross_entropy_with_softmax(&logits, &target, 0).sum()
}

/// Quantises an image in `[-1, 1]` (`[C, H, W]`) to levels and one-hot encodes
/// it as the `[num_levels, C * H * W]` target of [`softmax_256_loss`].
///
/// Values outside `[-1, 1]` are clipped to the edge levels.
pub fn encode_one_hot_targets(image: &ArrayD<f32>, config: &PixelCnnConfig) -> Result<ArrayD<f32>> {
    let expected = [config.channels, config.height, config.width];
    if image.shape() != expected {
        return Err(PixelCnnError::ShapeMismatch {
            name: "image",
            expected: expected.to_vec(),
            actual: image.shape().to_vec(),
        });
    }

    let top = (config.num_levels - 1) as f32;
    let mut target = ArrayD::<f32>::zeros(IxDyn(&[config.num_levels, config.dims()]));
    // Iteration order is the row-major CHW flattening.
    for (column, &value) in image.iter().enumerate() {
        let level = ((value.clamp(-1.0, 1.0) + 1.0) / 2.0 * top).round() as usize;
        target[[level, column]] = 1.0;
    }
    Ok(target)
}
