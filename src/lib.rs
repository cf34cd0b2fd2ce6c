//! # pixelasg: PixelCNN likelihoods on an Abstract Semantic Graph
//!
//! The two PixelCNN output likelihoods (discretized mixture of logistics and
//! a per-sub-pixel 256-way softmax) and the mixture sampler, written as
//! symbolic graphs over a small autodiff engine built around the
//! **Abstract Semantic Graph (ASG)**.
//!
//! ## Usage Example
//!
//! ```no_run
//! use pixelasg::config::PixelCnnConfig;
//! use pixelasg::pixelcnn::loss_function;
//! use pixelasg::tensor::{GraphContext, Tensor};
//!
//! // 1. Create graph context
//! let context = GraphContext::shared();
//!
//! // 2. Define symbolic inputs
//! let input_norm = Tensor::new_input(&context, "input_norm");
//! let target = Tensor::new_input(&context, "target");
//! let z = Tensor::new_input(&context, "z");
//!
//! // 3. Build the loss graph
//! let loss = loss_function(&input_norm, &target, &z, "mixture", &PixelCnnConfig::default());
//! assert!(loss.is_some());
//!
//! // Graph is ready for shape inference, differentiation and execution on a backend.
//! ```

pub mod analysis;
pub mod asg;
pub mod autograd;
pub mod config;
pub mod error;
pub mod losses;
pub mod pixelcnn;
pub mod runtime;
pub mod serialization;
pub mod tensor;

pub use error::{PixelCnnError, Result};
