//! PixelCNN output likelihoods and the mixture sampler.
//!
//! Two output heads are supported:
//!
//! - **mixture**: discretized mixture of logistics over the continuous
//!   `[-1, 1]` image ([`discretized_mix_logistic_loss`]);
//! - **category**: an independent 256-way softmax per sub-pixel
//!   ([`softmax_256_loss`]).
//!
//! Both are built as symbolic graphs, so their gradients w.r.t. the network
//! output `z` come from [`crate::autograd`]. [`evaluate_loss`] and
//! [`sample_image`] run the graphs eagerly on the CPU backend.
//!
//! Layout is unbatched CHW throughout.

pub mod category;
pub mod mixture;
pub mod sampling;

pub use category::{encode_one_hot_targets, softmax_256_loss};
pub use mixture::discretized_mix_logistic_loss;
pub use sampling::sample_from_discretized_mix_logistic;

use crate::asg::Value;
use crate::config::PixelCnnConfig;
use crate::error::{PixelCnnError, Result};
use crate::runtime::cpu_backend::CpuBackend;
use crate::runtime::session::Session;
use crate::tensor::{GraphContext, Tensor};
use ndarray::ArrayD;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Graph input names.
pub const INPUT_NORM: &str = "input_norm";
pub const TARGET: &str = "target";
pub const Z: &str = "z";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LossKind {
    Category,
    Mixture,
}

impl LossKind {
    pub const ALL: [LossKind; 2] = [LossKind::Category, LossKind::Mixture];

    pub fn name(self) -> &'static str {
        match self {
            LossKind::Category => "category",
            LossKind::Mixture => "mixture",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }
}

impl fmt::Display for LossKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LossKind {
    type Err = PixelCnnError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(s).ok_or_else(|| PixelCnnError::UnknownLossKind(s.to_string()))
    }
}

/// Builds the loss selected by name.
///
/// * `"category"` - `softmax_256_loss(target, z)`;
/// * `"mixture"` - `discretized_mix_logistic_loss(input_norm, z)`.
///
/// Any other name yields `None`.
pub fn loss_function(
    input_norm: &Tensor,
    target: &Tensor,
    z: &Tensor,
    loss: &str,
    config: &PixelCnnConfig,
) -> Option<Tensor> {
    LossKind::from_name(loss).map(|kind| loss_function_for(kind, input_norm, target, z, config))
}

pub fn loss_function_for(
    kind: LossKind,
    input_norm: &Tensor,
    target: &Tensor,
    z: &Tensor,
    config: &PixelCnnConfig,
) -> Tensor {
    match kind {
        LossKind::Category => softmax_256_loss(target, z, config),
        LossKind::Mixture => discretized_mix_logistic_loss(input_norm, z, config),
    }
}

fn check_shape(name: &'static str, actual: &[usize], expected: &[usize]) -> Result<()> {
    if actual != expected {
        return Err(PixelCnnError::ShapeMismatch {
            name,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        });
    }
    Ok(())
}

/// Checks `x` is `[C, H, W]` and `l` is `[10 * nr_mix, H, W]` for `config`.
pub fn validate_mixture_shapes(x: &[usize], l: &[usize], config: &PixelCnnConfig) -> Result<()> {
    check_shape(INPUT_NORM, x, &[config.channels, config.height, config.width])?;
    check_shape(Z, l, &[config.mixture_channels(), config.height, config.width])
}

/// Checks `target` is `[num_levels, C * H * W]` and `prediction` is
/// `[C * num_levels, H, W]` for `config`.
pub fn validate_category_shapes(
    target: &[usize],
    prediction: &[usize],
    config: &PixelCnnConfig,
) -> Result<()> {
    check_shape(TARGET, target, &[config.num_levels, config.dims()])?;
    check_shape(Z, prediction, &[config.category_channels(), config.height, config.width])
}

/// Converts a summed NLL in nats to bits per sub-pixel.
pub fn bits_per_dim(nll: f32, config: &PixelCnnConfig) -> f32 {
    nll / (config.dims() as f32 * std::f32::consts::LN_2)
}

/// Concrete data for [`evaluate_loss`]. Only the tensors the chosen loss reads
/// are required.
#[derive(Debug, Clone)]
pub struct LossInputs {
    pub input_norm: Option<ArrayD<f32>>,
    pub target: Option<ArrayD<f32>>,
    pub z: ArrayD<f32>,
}

#[derive(Debug, Clone)]
pub struct LossReport {
    pub kind: LossKind,
    /// Summed NLL in nats.
    pub loss: f32,
    pub bits_per_dim: f32,
    /// `d loss / d z`, when requested.
    pub grad_z: Option<ArrayD<f32>>,
}

/// Validates `inputs`, builds the `kind` loss graph and runs it on the CPU.
pub fn evaluate_loss(
    kind: LossKind,
    inputs: &LossInputs,
    config: &PixelCnnConfig,
    with_grad: bool,
) -> Result<LossReport> {
    config.validate()?;

    let mut feeds = HashMap::from([(Z.to_string(), Value::Tensor(inputs.z.clone()))]);
    match kind {
        LossKind::Mixture => {
            let x = inputs.input_norm.as_ref().ok_or(PixelCnnError::MissingTensor(INPUT_NORM))?;
            validate_mixture_shapes(x.shape(), inputs.z.shape(), config)?;
            feeds.insert(INPUT_NORM.to_string(), Value::Tensor(x.clone()));
        }
        LossKind::Category => {
            let target = inputs.target.as_ref().ok_or(PixelCnnError::MissingTensor(TARGET))?;
            validate_category_shapes(target.shape(), inputs.z.shape(), config)?;
            feeds.insert(TARGET.to_string(), Value::Tensor(target.clone()));
        }
    }

    let context = GraphContext::shared();
    let input_norm = Tensor::new_input(&context, INPUT_NORM);
    let target = Tensor::new_input(&context, TARGET);
    let z = Tensor::new_input(&context, Z);
    let loss = loss_function_for(kind, &input_norm, &target, &z, config);
    let graph = context.borrow().main_graph().clone();
    debug!(%kind, nodes = graph.nodes.len(), "loss graph built");

    let session = Session::new(CpuBackend::new());
    let (value, grad_z) = if with_grad {
        let (value, mut grads) = session.value_and_grad(&graph, loss.node_id, &[Z], &feeds)?;
        (value, grads.pop().map(Value::into_tensor))
    } else {
        let mut values = session.evaluate(&graph, &[loss.node_id], &feeds)?;
        (values.remove(0), None)
    };

    let loss = value.into_tensor().sum();
    let report = LossReport {
        kind,
        loss,
        bits_per_dim: bits_per_dim(loss, config),
        grad_z,
    };
    debug!(%kind, loss = report.loss, bits_per_dim = report.bits_per_dim, "loss evaluated");
    Ok(report)
}

/// Draws one `[C, H, W]` image from mixture parameters `z` (`[10 * nr_mix, H, W]`).
pub fn sample_image<R: Rng + ?Sized>(
    z: &ArrayD<f32>,
    config: &PixelCnnConfig,
    rng: &mut R,
) -> Result<ArrayD<f32>> {
    config.validate()?;
    check_shape(Z, z.shape(), &[config.mixture_channels(), config.height, config.width])?;

    let context = GraphContext::shared();
    let l = Tensor::new_input(&context, Z);
    let image = sample_from_discretized_mix_logistic(&l, config.nr_mix, config, rng)?;
    let graph = context.borrow().main_graph().clone();

    let feeds = HashMap::from([(Z.to_string(), Value::Tensor(z.clone()))]);
    let mut values = Session::new(CpuBackend::new()).evaluate(&graph, &[image.node_id], &feeds)?;
    debug!(nodes = graph.nodes.len(), "image sampled");
    Ok(values.remove(0).into_tensor())
}
