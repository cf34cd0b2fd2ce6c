//! Loss values against the scalar reference implementations.

mod common;

use common::{random_image, random_mixture_params, rng, small_config};
use ndarray::{Array3, ArrayD, IxDyn};
use pixelasg::analysis::shape_inference::ShapeInferenceError;
use pixelasg::asg::Value;
use pixelasg::config::PixelCnnConfig;
use pixelasg::pixelcnn::{self, loss_function, LossInputs, LossKind, INPUT_NORM, TARGET, Z};
use pixelasg::runtime::cpu_backend::CpuBackend;
use pixelasg::runtime::session::{Session, SessionError};
use pixelasg::tensor::{GraphContext, Tensor};
use std::collections::HashMap;

fn assert_rel(actual: f32, expected: f64, rtol: f64) {
    let err = (actual as f64 - expected).abs();
    assert!(
        err <= rtol * expected.abs().max(1.0),
        "got {}, expected {} (rel err {:.2e})",
        actual,
        expected,
        err / expected.abs().max(1.0)
    );
}

fn mixture_loss(x: &ArrayD<f32>, z: &ArrayD<f32>, config: &PixelCnnConfig) -> f32 {
    let inputs = LossInputs { input_norm: Some(x.clone()), target: None, z: z.clone() };
    pixelcnn::evaluate_loss(LossKind::Mixture, &inputs, config, false).unwrap().loss
}

/// `z` for `nr_mix = 1`, one pixel: logit, then per channel mean, log-scale, coeff.
fn single_component(params: [[f32; 3]; 3]) -> ArrayD<f32> {
    let mut z = vec![0.0f32];
    for [mean, log_scale, coeff] in params {
        z.extend([mean, log_scale, coeff]);
    }
    ArrayD::from_shape_vec(IxDyn(&[10, 1, 1]), z).unwrap()
}

#[test]
fn mixture_loss_matches_reference_on_random_data() {
    let config = small_config();
    let mut rng = rng(42);
    let x = random_image(&config, &mut rng);
    let z = random_mixture_params(&config, &mut rng, 1.0);

    assert_rel(mixture_loss(&x, &z, &config), common::mixture_nll(&x, &z, &config), 1e-4);
}

#[test]
fn mixture_loss_matches_reference_at_default_size() {
    let config = PixelCnnConfig::default();
    let mut rng = rng(1);
    let x = random_image(&config, &mut rng);
    let z = random_mixture_params(&config, &mut rng, 1.0);

    let loss = mixture_loss(&x, &z, &config);
    assert_rel(loss, common::mixture_nll(&x, &z, &config), 1e-4);
    assert!(loss > 0.0);
}

#[test]
fn edge_bins_use_tail_mass() {
    let config = PixelCnnConfig::new().with_image_size(1, 1).with_nr_mix(1);
    let x = ArrayD::from_shape_vec(IxDyn(&[3, 1, 1]), vec![-1.0, 1.0, 0.0]).unwrap();
    let z = single_component([[0.0; 3]; 3]);

    let half = 1.0f64 / 255.0;
    let sigmoid = |v: f64| 1.0 / (1.0 + (-v).exp());
    let expected = -(sigmoid(-1.0 + half).ln() + (1.0 - sigmoid(1.0 - half)).ln()
        + (sigmoid(half) - sigmoid(-half)).ln());

    assert_rel(mixture_loss(&x, &z, &config), expected, 1e-4);
}

#[test]
fn low_probability_bins_use_density_at_centre() {
    let config = PixelCnnConfig::new().with_image_size(1, 1).with_nr_mix(1);
    // Narrow components far from interior observations: the bin mass underflows.
    let x = ArrayD::from_shape_vec(IxDyn(&[3, 1, 1]), vec![0.0, -0.5, 0.5]).unwrap();
    let z = single_component([[0.9, -6.0, 0.0], [0.9, -6.0, 0.0], [-0.9, -6.0, 0.0]]);

    let expected = common::mixture_nll(&x, &z, &config);
    let loss = mixture_loss(&x, &z, &config);
    assert!(loss.is_finite());
    assert!(expected > 100.0);
    assert_rel(loss, expected, 1e-4);
}

#[test]
fn log_scales_are_floored() {
    let config = PixelCnnConfig::new().with_image_size(1, 1).with_nr_mix(1);
    let x = ArrayD::from_shape_vec(IxDyn(&[3, 1, 1]), vec![0.2, 0.2, 0.2]).unwrap();
    let at_floor = single_component([[0.2, -7.0, 0.0]; 3]);
    let below_floor = single_component([[0.2, -30.0, 0.0]; 3]);

    assert_eq!(mixture_loss(&x, &at_floor, &config), mixture_loss(&x, &below_floor, &config));
}

#[test]
fn category_loss_matches_reference() {
    let config = small_config();
    let mut rng = rng(5);
    let image = random_image(&config, &mut rng);
    let target = pixelcnn::encode_one_hot_targets(&image, &config).unwrap();
    let z = Array3::from_shape_fn((config.category_channels(), config.height, config.width), |(c, h, w)| {
        ((c * 13 + h * 7 + w * 3) % 17) as f32 * 0.4 - 3.0
    })
    .into_dyn();

    let inputs = LossInputs { input_norm: None, target: Some(target.clone()), z: z.clone() };
    let report = pixelcnn::evaluate_loss(LossKind::Category, &inputs, &config, false).unwrap();

    assert_rel(report.loss, common::category_nll(&target, &z, &config), 1e-4);
    assert_eq!(report.bits_per_dim, pixelcnn::bits_per_dim(report.loss, &config));
}

#[test]
fn uniform_category_logits_cost_eight_bits() {
    let config = small_config();
    let image = ArrayD::zeros(IxDyn(&[3, config.height, config.width]));
    let inputs = LossInputs {
        input_norm: None,
        target: Some(pixelcnn::encode_one_hot_targets(&image, &config).unwrap()),
        z: ArrayD::zeros(IxDyn(&[config.category_channels(), config.height, config.width])),
    };
    let report = pixelcnn::evaluate_loss(LossKind::Category, &inputs, &config, false).unwrap();
    assert!((report.bits_per_dim - 8.0).abs() < 1e-4);
}

#[test]
fn loss_function_dispatches_by_name() {
    let config = small_config();
    let mut rng = rng(9);
    let x = random_image(&config, &mut rng);
    let z_mix = random_mixture_params(&config, &mut rng, 1.0);

    let context = GraphContext::shared();
    let input_norm = Tensor::new_input(&context, INPUT_NORM);
    let target = Tensor::new_input(&context, TARGET);
    let z = Tensor::new_input(&context, Z);

    assert!(loss_function(&input_norm, &target, &z, "softmax", &config).is_none());
    assert!(loss_function(&input_norm, &target, &z, "", &config).is_none());
    let loss = loss_function(&input_norm, &target, &z, "mixture", &config).unwrap();

    let graph = context.borrow().main_graph().clone();
    let feeds = HashMap::from([
        (INPUT_NORM.to_string(), Value::Tensor(x.clone())),
        (Z.to_string(), Value::Tensor(z_mix.clone())),
    ]);
    let values = Session::new(CpuBackend::new())
        .evaluate(&graph, &[loss.node_id], &feeds)
        .unwrap();

    let value = values[0].clone().into_tensor();
    assert_eq!(value.shape(), &[1]);
    assert_rel(value[[0]], common::mixture_nll(&x, &z_mix, &config), 1e-4);
}

#[test]
fn mismatched_mixture_channels_are_rejected() {
    let config = small_config();
    let inputs = LossInputs {
        input_norm: Some(ArrayD::zeros(IxDyn(&[3, 2, 3]))),
        target: None,
        z: ArrayD::zeros(IxDyn(&[30, 2, 3])),
    };
    let err = pixelcnn::evaluate_loss(LossKind::Mixture, &inputs, &config, false).unwrap_err();
    assert!(matches!(err, pixelasg::PixelCnnError::ShapeMismatch { name: "z", .. }));
}

/// Builds the named loss on fresh inputs and runs it with `feeds`.
fn run_named_loss(
    name: &str,
    config: &PixelCnnConfig,
    feeds: HashMap<String, Value>,
) -> Result<Vec<Value>, SessionError> {
    let context = GraphContext::shared();
    let input_norm = Tensor::new_input(&context, INPUT_NORM);
    let target = Tensor::new_input(&context, TARGET);
    let z = Tensor::new_input(&context, Z);
    let loss = loss_function(&input_norm, &target, &z, name, config).unwrap();
    let graph = context.borrow().main_graph().clone();
    Session::new(CpuBackend::new()).evaluate(&graph, &[loss.node_id], &feeds)
}

#[test]
fn mixture_graph_rejects_extra_parameter_channels() {
    let config = small_config();
    let x = random_image(&config, &mut rng(11));
    // 30 channels: three components' worth for a two-component config.
    let z = ArrayD::zeros(IxDyn(&[30, config.height, config.width]));
    let feeds = HashMap::from([
        (INPUT_NORM.to_string(), Value::Tensor(x)),
        (Z.to_string(), Value::Tensor(z)),
    ]);

    let err = run_named_loss("mixture", &config, feeds).unwrap_err();
    assert!(matches!(err, SessionError::Shape(ShapeInferenceError::ReshapeMismatch { .. })), "{}", err);
}

#[test]
fn category_graph_rejects_narrow_target() {
    let config = small_config();
    let feeds = HashMap::from([
        (TARGET.to_string(), Value::Tensor(ArrayD::zeros(IxDyn(&[config.num_levels, 1])))),
        (
            Z.to_string(),
            Value::Tensor(ArrayD::zeros(IxDyn(&[config.category_channels(), config.height, config.width]))),
        ),
    ]);

    let err = run_named_loss("category", &config, feeds).unwrap_err();
    assert!(matches!(err, SessionError::Shape(ShapeInferenceError::ReshapeMismatch { .. })), "{}", err);
}
