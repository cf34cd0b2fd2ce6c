//! # Graph Analysis Module
//!
//! Analysis passes that process the ASG before execution.
//!
//! - [`ShapeInference`](shape_inference::ShapeInference): propagates tensor shapes
//!   through the graph, detecting shape mismatches before runtime.
//!
//! ```text
//! ASG (untyped) -> Shape Inference -> ASG (with shapes/dtypes)
//! ```
//!
//! The autograd pass needs the forward graph's shapes, so shape inference always
//! runs before [`crate::autograd::Gradients::build`].
//!
//! ## Example
//!
//! ```ignore
//! use pixelasg::analysis::shape_inference::ShapeInference;
//!
//! let mut graph = context.borrow().main_graph().clone();
//! let shapes = HashMap::from([
//!     ("z".to_string(), (vec![100, 32, 32], DType::F32)),
//! ]);
//! ShapeInference::run(&mut graph, &shapes)?;
//! ```

pub mod shape_inference;
