//! Autograd: builds the graph of gradients d(loss)/d(node).
//!
//! Algorithm:
//!  - walk the forward graph in reverse topological order starting at the loss;
//!  - for every node with an upstream gradient dL/dY, emit its contributions to
//!    the operands and accumulate them (sum);
//!  - the result is a separate `grad` ASG whose outputs are dL/d(wrt_i).
//!
//! Forward values are referenced through `External` nodes named
//! `external_{asg}_{node}`. They are resolved from the memo produced by the
//! forward run, so the gradient graph must be executed with that memo.
//!
//! Comparisons, `ArgMax` and `OneHot` have zero derivative and stop the gradient.

use crate::analysis::shape_inference::{ShapeInference, ShapeInferenceError};
use crate::asg::{Asg, AsgError, NodeId, NodeType, Shape, Value};
use ndarray::{ArrayD, IxDyn};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum AutogradError {
    #[error("ASG: {0}")]
    Asg(#[from] AsgError),
    #[error("Shape: {0}")]
    Shape(#[from] ShapeInferenceError),
    #[error("Node {0} has no shape; run shape inference on the forward graph first")]
    MissingShape(NodeId),
}

pub type AutogradResult<T> = Result<T, AutogradError>;

/// Name of the `External` node that mirrors `node` of graph `asg`.
pub fn external_name(asg: usize, node: NodeId) -> String {
    format!("external_{}_{}", asg, node)
}

/// Public entry point: owns the forward graph and emits gradient graphs for it.
pub struct Gradients {
    forward: Asg,
}

impl Gradients {
    pub fn new(forward: Asg) -> Self {
        Self { forward }
    }

    /// Builds the gradient graph of `loss_id` w.r.t. each node in `wrt`.
    ///
    /// The returned graph has one output per `wrt` entry, in the same order.
    /// A node the loss does not depend on gets a zero gradient.
    pub fn build(&self, loss_id: NodeId, wrt: &[NodeId]) -> AutogradResult<Asg> {
        let mut autograd = Autograd::new(&self.forward);
        autograd.backward(loss_id)?;

        let mut outputs = Vec::with_capacity(wrt.len());
        for &target in wrt {
            let id = match autograd.gmap.get(&target).copied() {
                Some(g) => g,
                None => {
                    let shape = autograd.shape_of(target)?;
                    autograd.lit_tensor(ArrayD::zeros(IxDyn(&shape)))
                }
            };
            outputs.push(id);
        }

        let mut grad = autograd.grad;
        grad.set_outputs(outputs);
        debug!(
            forward_nodes = self.forward.nodes.len(),
            grad_nodes = grad.nodes.len(),
            "gradient graph built"
        );
        Ok(grad)
    }
}

// --------------------------- Autograd implementation ---------------------------

struct Autograd<'a> {
    /// Forward graph.
    src: &'a Asg,
    /// Gradient graph under construction.
    grad: Asg,
    /// Forward node -> its accumulated gradient node in `grad`.
    gmap: HashMap<NodeId, NodeId>,
    /// Forward node -> its `External` mirror in `grad`.
    externals: HashMap<NodeId, NodeId>,
}

impl<'a> Autograd<'a> {
    fn new(src: &'a Asg) -> Self {
        Self {
            src,
            grad: Asg::new(src.id + 1, Some("grad".to_string())),
            gmap: HashMap::new(),
            externals: HashMap::new(),
        }
    }

    fn backward(&mut self, loss_id: NodeId) -> AutogradResult<()> {
        let order = ShapeInference::topological_sort_from(self.src, &[loss_id])?;

        // Seed dL/dL = 1 with the loss' own shape (the mixture loss is `[1]`).
        let loss_shape = self.shape_of(loss_id)?;
        let seed = self.lit_tensor(ArrayD::ones(IxDyn(&loss_shape)));
        self.gmap.insert(loss_id, seed);

        for &id in order.iter().rev() {
            let g_out = match self.gmap.get(&id).copied() {
                Some(g) => g,
                None => continue,
            };
            let node_type = self.src.get_node(id)?.node_type.clone();

            match node_type {
                // Leaves: dL/dX is already accumulated.
                NodeType::Input { .. }
                | NodeType::Parameter { .. }
                | NodeType::Literal(_)
                | NodeType::External { .. } => {}

                // -------- Binary --------
                NodeType::Add(a, b) => {
                    self.acc_reduced(id, a, g_out)?;
                    self.acc_reduced(id, b, g_out)?;
                }
                NodeType::Subtract(a, b) => {
                    self.acc_reduced(id, a, g_out)?;
                    let neg = self.add_node(NodeType::Negate(g_out));
                    self.acc_reduced(id, b, neg)?;
                }
                NodeType::Multiply(a, b) => {
                    let a_val = self.external(a)?;
                    let b_val = self.external(b)?;
                    let g_a = self.add_node(NodeType::Multiply(g_out, b_val));
                    let g_b = self.add_node(NodeType::Multiply(g_out, a_val));
                    self.acc_reduced(id, a, g_a)?;
                    self.acc_reduced(id, b, g_b)?;
                }
                NodeType::Divide(a, b) => {
                    let a_val = self.external(a)?;
                    let b_val = self.external(b)?;
                    // g_a = g / b
                    let g_a = self.add_node(NodeType::Divide(g_out, b_val));
                    // g_b = -g * a / b^2
                    let b2 = self.add_node(NodeType::Multiply(b_val, b_val));
                    let num = self.add_node(NodeType::Multiply(g_out, a_val));
                    let ratio = self.add_node(NodeType::Divide(num, b2));
                    let g_b = self.add_node(NodeType::Negate(ratio));
                    self.acc_reduced(id, a, g_a)?;
                    self.acc_reduced(id, b, g_b)?;
                }

                // Comparisons and index ops: zero derivative.
                NodeType::GreaterThan(..)
                | NodeType::Less(..)
                | NodeType::Equal(..)
                | NodeType::ArgMax(..)
                | NodeType::OneHot { .. } => {}

                NodeType::Select { condition, on_true, on_false } => {
                    // The mask multiplies the upstream gradient, never the local
                    // derivative, so an unselected branch cannot leak NaN.
                    let mask = self.external(condition)?;
                    let g_true = self.add_node(NodeType::Multiply(g_out, mask));
                    let g_false = self.add_node(NodeType::Subtract(g_out, g_true));
                    self.acc_reduced(id, on_true, g_true)?;
                    self.acc_reduced(id, on_false, g_false)?;
                }

                // -------- Unary --------
                NodeType::Negate(x) => {
                    let g_x = self.add_node(NodeType::Negate(g_out));
                    self.acc(x, g_x);
                }
                NodeType::Exp(x) => {
                    let y = self.external(id)?;
                    let g_x = self.add_node(NodeType::Multiply(g_out, y));
                    self.acc(x, g_x);
                }
                NodeType::Log(x) => {
                    let x_val = self.external(x)?;
                    let g_x = self.add_node(NodeType::Divide(g_out, x_val));
                    self.acc(x, g_x);
                }
                NodeType::Tanh(x) => {
                    // 1 - tanh^2
                    let y = self.external(id)?;
                    let y2 = self.add_node(NodeType::Multiply(y, y));
                    let one = self.lit_scalar(1.0);
                    let local = self.add_node(NodeType::Subtract(one, y2));
                    let g_x = self.add_node(NodeType::Multiply(g_out, local));
                    self.acc(x, g_x);
                }
                NodeType::Sigmoid(x) => {
                    let y = self.external(id)?;
                    let one = self.lit_scalar(1.0);
                    let one_minus = self.add_node(NodeType::Subtract(one, y));
                    let local = self.add_node(NodeType::Multiply(y, one_minus));
                    let g_x = self.add_node(NodeType::Multiply(g_out, local));
                    self.acc(x, g_x);
                }
                NodeType::Softplus(x, beta) => {
                    // d/dx log(1 + exp(beta x)) / beta = sigmoid(beta x)
                    let mut arg = self.external(x)?;
                    if beta != 1.0 {
                        let b = self.lit_scalar(beta);
                        arg = self.add_node(NodeType::Multiply(arg, b));
                    }
                    let local = self.add_node(NodeType::Sigmoid(arg));
                    let g_x = self.add_node(NodeType::Multiply(g_out, local));
                    self.acc(x, g_x);
                }
                NodeType::Clamp(x, min, max) => {
                    // Gradient passes only strictly inside (min, max).
                    let x_val = self.external(x)?;
                    let lo = self.lit_scalar(min);
                    let hi = self.lit_scalar(max);
                    let above = self.add_node(NodeType::GreaterThan(x_val, lo));
                    let below = self.add_node(NodeType::Less(x_val, hi));
                    let mask = self.add_node(NodeType::Multiply(above, below));
                    let g_x = self.add_node(NodeType::Multiply(g_out, mask));
                    self.acc(x, g_x);
                }

                // -------- Reductions --------
                NodeType::Sum(x) | NodeType::SumAxis(x, _) => {
                    let x_val = self.external(x)?;
                    let g_x = self.add_node(NodeType::Broadcast(g_out, x_val));
                    self.acc(x, g_x);
                }
                NodeType::MaxAxis(x, axis) => {
                    // Split the gradient evenly between tied maxima.
                    let x_val = self.external(x)?;
                    let y = self.external(id)?;
                    let mask = self.add_node(NodeType::Equal(x_val, y));
                    let count = self.add_node(NodeType::SumAxis(mask, axis));
                    let share = self.add_node(NodeType::Divide(g_out, count));
                    let g_x = self.add_node(NodeType::Multiply(mask, share));
                    self.acc(x, g_x);
                }

                // -------- Layout --------
                NodeType::Reshape(x, _) => {
                    let shape = self.shape_of(x)?;
                    let shape_lit = self.lit_shape(&shape);
                    let g_x = self.add_node(NodeType::Reshape(g_out, shape_lit));
                    self.acc(x, g_x);
                }
                NodeType::Transpose(x, a1, a2) => {
                    let g_x = self.add_node(NodeType::Transpose(g_out, a2, a1));
                    self.acc(x, g_x);
                }
                NodeType::Slice { input, axis, start, .. } => {
                    let len = self.shape_of(input)?[axis];
                    let g_x = self.add_node(NodeType::SliceGrad {
                        grad_output: g_out,
                        axis,
                        start,
                        len,
                    });
                    self.acc(input, g_x);
                }
                NodeType::SliceGrad { grad_output, axis, start, .. } => {
                    let len = self.shape_of(grad_output)?[axis];
                    let g_x = self.add_node(NodeType::Slice {
                        input: g_out,
                        axis,
                        start,
                        end: start + len,
                    });
                    self.acc(grad_output, g_x);
                }
                NodeType::Concat { inputs, axis } => {
                    let mut offset = 0;
                    for part in inputs {
                        let len = self.shape_of(part)?[axis];
                        let g_part = self.add_node(NodeType::Slice {
                            input: g_out,
                            axis,
                            start: offset,
                            end: offset + len,
                        });
                        self.acc(part, g_part);
                        offset += len;
                    }
                }
                NodeType::Broadcast(x, _) => {
                    let x_val = self.external(x)?;
                    let g_x = self.add_node(NodeType::ReduceSumTo(g_out, x_val));
                    self.acc(x, g_x);
                }
                NodeType::ReduceSumTo(x, _) => {
                    let x_val = self.external(x)?;
                    let g_x = self.add_node(NodeType::Broadcast(g_out, x_val));
                    self.acc(x, g_x);
                }
            }
        }

        Ok(())
    }

    fn add_node(&mut self, node_type: NodeType) -> NodeId {
        self.grad.add_node(None, node_type)
    }

    fn lit_scalar(&mut self, v: f32) -> NodeId {
        self.lit_tensor(ndarray::arr0(v).into_dyn())
    }

    fn lit_tensor(&mut self, data: ArrayD<f32>) -> NodeId {
        self.grad.add_node(None, NodeType::Literal(Value::Tensor(data)))
    }

    fn lit_shape(&mut self, shape: &[usize]) -> NodeId {
        let data = ndarray::Array1::from(shape.iter().map(|&d| d as f32).collect::<Vec<_>>());
        self.lit_tensor(data.into_dyn())
    }

    /// `External` mirror of a forward node, created once per node.
    fn external(&mut self, src_id: NodeId) -> AutogradResult<NodeId> {
        if let Some(&id) = self.externals.get(&src_id) {
            return Ok(id);
        }
        let src = self.src.get_node(src_id)?;
        let shape = src.shape.clone().ok_or(AutogradError::MissingShape(src_id))?;
        let dtype = src.dtype;
        let name = external_name(self.src.id, src_id);
        let id = self.grad.add_node(
            Some(name.clone()),
            NodeType::External {
                name,
                source_asg_id: self.src.id,
                source_node_id: src_id,
            },
        );
        let node = self.grad.get_node_mut(id)?;
        node.shape = Some(shape);
        node.dtype = dtype;
        self.externals.insert(src_id, id);
        Ok(id)
    }

    fn shape_of(&self, src_id: NodeId) -> AutogradResult<Shape> {
        self.src
            .get_node(src_id)?
            .shape
            .clone()
            .ok_or(AutogradError::MissingShape(src_id))
    }

    /// Accumulation: dL/d(target) += contrib.
    fn acc(&mut self, target: NodeId, contrib: NodeId) {
        let total = match self.gmap.get(&target).copied() {
            Some(prev) => self.add_node(NodeType::Add(prev, contrib)),
            None => contrib,
        };
        self.gmap.insert(target, total);
    }

    /// Like `acc`, but first sums a broadcast gradient back to the operand's shape.
    fn acc_reduced(&mut self, node: NodeId, operand: NodeId, g: NodeId) -> AutogradResult<()> {
        let contrib = if self.shape_of(node)? == self.shape_of(operand)? {
            g
        } else {
            let target = self.external(operand)?;
            self.add_node(NodeType::ReduceSumTo(g, target))
        };
        self.acc(operand, contrib);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asg::DType;
    use crate::tensor::{GraphContext, Tensor};

    fn forward_graph(build: impl Fn(&Tensor) -> Tensor, shape: &[usize]) -> (Asg, NodeId, NodeId) {
        let ctx = GraphContext::shared();
        let x = Tensor::new_input(&ctx, "x");
        let y = build(&x);
        let mut graph = ctx.borrow().main_graph().clone();
        graph.set_output(y.node_id);
        let shapes = HashMap::from([("x".to_string(), (shape.to_vec(), DType::F32))]);
        ShapeInference::run(&mut graph, &shapes).unwrap();
        (graph, y.node_id, x.node_id)
    }

    #[test]
    fn gradient_graph_is_shape_consistent() {
        let (graph, loss, x) = forward_graph(
            |x| {
                let a = x.slice(1, 0, 2).tanh();
                let b = x.slice(1, 2, 4).softplus();
                (&a * &b).sum_axis(1).max_axis(0).sum()
            },
            &[3, 4],
        );
        let mut grad = Gradients::new(graph).build(loss, &[x]).unwrap();
        ShapeInference::run(&mut grad, &HashMap::new()).unwrap();

        let out = grad.outputs[0];
        assert_eq!(grad.get_node(out).unwrap().shape, Some(vec![3, 4]));
    }

    #[test]
    fn unrelated_node_gets_zero_gradient() {
        let ctx = GraphContext::shared();
        let x = Tensor::new_input(&ctx, "x");
        let unused = Tensor::new_input(&ctx, "unused");
        let y = x.exp().sum();
        let mut graph = ctx.borrow().main_graph().clone();
        graph.set_outputs(vec![y.node_id, unused.node_id]);
        let shapes = HashMap::from([
            ("x".to_string(), (vec![2], DType::F32)),
            ("unused".to_string(), (vec![5], DType::F32)),
        ]);
        ShapeInference::run(&mut graph, &shapes).unwrap();

        let grad = Gradients::new(graph).build(y.node_id, &[unused.node_id]).unwrap();
        let node = grad.get_node(grad.outputs[0]).unwrap();
        assert!(matches!(&node.node_type, NodeType::Literal(Value::Tensor(t)) if t.shape() == [5]));
    }

    #[test]
    fn requires_forward_shapes() {
        let ctx = GraphContext::shared();
        let x = Tensor::new_input(&ctx, "x");
        let y = (&x * &x).sum();
        let graph = ctx.borrow().main_graph().clone();

        let err = Gradients::new(graph).build(y.node_id, &[x.node_id]).unwrap_err();
        assert!(matches!(err, AutogradError::MissingShape(_)));
    }
}
