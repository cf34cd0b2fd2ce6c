//! Properties of images drawn from a discretized logistic mixture.

mod common;

use common::{random_mixture_params, rng};
use ndarray::{ArrayD, IxDyn};
use pixelasg::asg::Value;
use pixelasg::config::PixelCnnConfig;
use pixelasg::pixelcnn::{sample_from_discretized_mix_logistic, sample_image, Z};
use pixelasg::runtime::cpu_backend::CpuBackend;
use pixelasg::runtime::session::{Session, SessionError};
use pixelasg::tensor::{GraphContext, Tensor};
use pixelasg::PixelCnnError;
use std::collections::HashMap;

/// Index into `z` of parameter `slot` (0 mean, 1 log-scale, 2 coeff) of
/// component `k`, channel `c`.
fn param(nr_mix: usize, c: usize, slot: usize, k: usize) -> usize {
    nr_mix + c * 3 * nr_mix + slot * nr_mix + k
}

/// Mixture parameters with tiny scales, zero coefficients and zero logits.
fn sharp_params(config: &PixelCnnConfig) -> ArrayD<f32> {
    let mut z = ArrayD::zeros(IxDyn(&[config.mixture_channels(), config.height, config.width]));
    for c in 0..3 {
        for k in 0..config.nr_mix {
            z.index_axis_mut(ndarray::Axis(0), param(config.nr_mix, c, 1, k)).fill(-20.0);
        }
    }
    z
}

#[test]
fn default_sample_is_a_3x32x32_image_in_range() {
    let config = PixelCnnConfig::default();
    let mut rng = rng(0);
    let z = random_mixture_params(&config, &mut rng, 2.0);

    let image = sample_image(&z, &config, &mut rng).unwrap();
    assert_eq!(image.shape(), &[3, 32, 32]);
    assert!(image.iter().all(|v| (-1.0..=1.0).contains(v)));
    assert!(image.iter().any(|&v| v != image[[0, 0, 0]]));
}

#[test]
fn sampling_is_deterministic_for_a_seed() {
    let config = PixelCnnConfig::new().with_image_size(4, 4).with_nr_mix(3);
    let z = random_mixture_params(&config, &mut rng(1), 1.0);

    let a = sample_image(&z, &config, &mut rng(99)).unwrap();
    let b = sample_image(&z, &config, &mut rng(99)).unwrap();
    let c = sample_image(&z, &config, &mut rng(100)).unwrap();
    assert_eq!(a, b);
    assert_ne!(a, c);
}

#[test]
fn tiny_scales_reproduce_the_means_in_chw_order() {
    let config = PixelCnnConfig::new().with_image_size(3, 2).with_nr_mix(2);
    let mut z = sharp_params(&config);
    let mean = |c: usize, h: usize, w: usize| 0.1 * c as f32 + 0.2 * h as f32 - 0.3 * w as f32;
    for c in 0..3 {
        for h in 0..3 {
            for w in 0..2 {
                for k in 0..2 {
                    z[[param(2, c, 0, k), h, w]] = mean(c, h, w);
                }
            }
        }
    }

    let image = sample_image(&z, &config, &mut rng(2)).unwrap();
    assert_eq!(image.shape(), &[3, 3, 2]);
    for ((c, h, w), &v) in image.clone().into_dimensionality::<ndarray::Ix3>().unwrap().indexed_iter() {
        assert!((v - mean(c, h, w)).abs() < 0.02, "pixel ({}, {}, {}) = {}", c, h, w, v);
    }
}

#[test]
fn dominant_logit_selects_its_component() {
    let config = PixelCnnConfig::new().with_image_size(2, 2).with_nr_mix(3);
    let mut z = sharp_params(&config);
    for k in 0..3 {
        z.index_axis_mut(ndarray::Axis(0), k).fill(if k == 1 { 40.0 } else { -40.0 });
        for c in 0..3 {
            z.index_axis_mut(ndarray::Axis(0), param(3, c, 0, k)).fill(-0.6 + 0.5 * k as f32);
        }
    }

    for seed in 0..5 {
        let image = sample_image(&z, &config, &mut rng(seed)).unwrap();
        assert!(image.iter().all(|v| (v + 0.1).abs() < 0.02), "seed {}: {:?}", seed, image);
    }
}

#[test]
fn coefficients_chain_channels_and_clip() {
    let config = PixelCnnConfig::new().with_image_size(1, 1).with_nr_mix(1);
    let mut z = sharp_params(&config);
    z[[param(1, 0, 0, 0), 0, 0]] = 0.5;
    z[[param(1, 1, 0, 0), 0, 0]] = 0.2;
    z[[param(1, 2, 0, 0), 0, 0]] = 0.9;
    // tanh(100) == 1: green gets +red, blue gets +red.
    z[[param(1, 0, 2, 0), 0, 0]] = 100.0;
    z[[param(1, 1, 2, 0), 0, 0]] = 100.0;

    let image = sample_image(&z, &config, &mut rng(4)).unwrap();
    assert!((image[[0, 0, 0]] - 0.5).abs() < 0.02);
    assert!((image[[1, 0, 0]] - 0.7).abs() < 0.02);
    // 0.9 + 0.5 clips to the upper bound.
    assert_eq!(image[[2, 0, 0]], 1.0);
}

#[test]
fn wrong_parameter_shape_is_rejected() {
    let config = PixelCnnConfig::new().with_image_size(2, 2);
    let z = ArrayD::zeros(IxDyn(&[10, 2, 2]));
    assert!(sample_image(&z, &config, &mut rng(0)).is_err());
}

#[test]
fn component_count_must_match_config() {
    let config = PixelCnnConfig::new().with_image_size(2, 2).with_nr_mix(2);
    let context = GraphContext::shared();
    let l = Tensor::new_input(&context, Z);

    let err = sample_from_discretized_mix_logistic(&l, 1, &config, &mut rng(0)).unwrap_err();
    assert!(matches!(err, PixelCnnError::MixtureCount { requested: 1, configured: 2 }));
}

#[test]
fn sampler_graph_rejects_short_parameters() {
    let config = PixelCnnConfig::new().with_image_size(2, 2).with_nr_mix(2);
    let context = GraphContext::shared();
    let l = Tensor::new_input(&context, Z);
    let image = sample_from_discretized_mix_logistic(&l, 2, &config, &mut rng(0)).unwrap();
    let graph = context.borrow().main_graph().clone();

    // One component's worth of channels for a two-component config.
    let feeds = HashMap::from([(Z.to_string(), Value::Tensor(ArrayD::zeros(IxDyn(&[10, 2, 2]))))]);
    let err = Session::new(CpuBackend::new())
        .evaluate(&graph, &[image.node_id], &feeds)
        .unwrap_err();
    assert!(matches!(err, SessionError::Shape(_)), "{}", err);
}
