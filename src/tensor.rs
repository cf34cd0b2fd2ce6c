//! `Tensor` and `GraphContext`.
//!
//! A `Tensor` holds no data. It is a lightweight handle to a node in the
//! Abstract Semantic Graph (ASG), and every operation on it appends a new node
//! instead of computing anything. `GraphContext` owns the graph being built.

use crate::asg::{Asg, NodeId, NodeType, Value};
use ndarray::{Array1, ArrayD};
use std::cell::RefCell;
use std::ops::{Add, Div, Mul, Sub};
use std::rc::Rc;

/// Owns the main graph while it is being built.
///
/// Shared between handles as `Rc<RefCell<GraphContext>>`.
#[derive(Debug, Clone)]
pub struct GraphContext {
    main_graph: Asg,
}

impl GraphContext {
    pub fn new() -> Self {
        Self {
            main_graph: Asg::new(0, Some("main".to_string())),
        }
    }

    pub fn main_graph_mut(&mut self) -> &mut Asg {
        &mut self.main_graph
    }

    pub fn main_graph(&self) -> &Asg {
        &self.main_graph
    }

    /// Convenience for `Rc::new(RefCell::new(GraphContext::new()))`.
    pub fn shared() -> Rc<RefCell<GraphContext>> {
        Rc::new(RefCell::new(Self::new()))
    }
}

impl Default for GraphContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Symbolic handle to a node of the graph in `context`.
#[derive(Debug, Clone)]
pub struct Tensor {
    pub node_id: NodeId,
    pub context: Rc<RefCell<GraphContext>>,
}

impl Tensor {
    /// Creates an `Input` node. Inputs are fed with real data at run time.
    pub fn new_input(context: &Rc<RefCell<GraphContext>>, name: &str) -> Self {
        let mut ctx = context.borrow_mut();
        let graph = ctx.main_graph_mut();
        let node_id = graph.add_node(
            Some(name.to_string()),
            NodeType::Input {
                name: name.to_string(),
            },
        );
        graph.inputs.push(node_id);

        Self {
            node_id,
            context: Rc::clone(context),
        }
    }

    /// Creates a trainable `Parameter` node.
    pub fn new_parameter(context: &Rc<RefCell<GraphContext>>, name: &str) -> Self {
        let node_id = context.borrow_mut().main_graph_mut().add_node(
            Some(name.to_string()),
            NodeType::Parameter {
                name: name.to_string(),
            },
        );
        Self {
            node_id,
            context: Rc::clone(context),
        }
    }

    /// Embeds constant data into the graph.
    pub fn new_literal(context: &Rc<RefCell<GraphContext>>, data: ArrayD<f32>, name: &str) -> Self {
        let node_id = context.borrow_mut().main_graph_mut().add_node(
            Some(name.to_string()),
            NodeType::Literal(Value::Tensor(data)),
        );
        Self {
            node_id,
            context: Rc::clone(context),
        }
    }

    /// 0-d constant.
    pub fn scalar(context: &Rc<RefCell<GraphContext>>, value: f32) -> Self {
        let node_id = context
            .borrow_mut()
            .main_graph_mut()
            .add_node(None, NodeType::Literal(Value::Tensor(ndarray::arr0(value).into_dyn())));
        Self {
            node_id,
            context: Rc::clone(context),
        }
    }

    /// Appends `node_type` to the graph this handle lives in.
    fn derive(&self, node_type: NodeType) -> Self {
        let node_id = self
            .context
            .borrow_mut()
            .main_graph_mut()
            .add_node(None, node_type);
        Self {
            node_id,
            context: Rc::clone(&self.context),
        }
    }

    fn constant(&self, value: f32) -> Self {
        Self::scalar(&self.context, value)
    }

    // --- Elementwise math ---

    pub fn neg(&self) -> Self {
        self.derive(NodeType::Negate(self.node_id))
    }

    pub fn exp(&self) -> Self {
        self.derive(NodeType::Exp(self.node_id))
    }

    pub fn log(&self) -> Self {
        self.derive(NodeType::Log(self.node_id))
    }

    pub fn tanh(&self) -> Self {
        self.derive(NodeType::Tanh(self.node_id))
    }

    pub fn sigmoid(&self) -> Self {
        self.derive(NodeType::Sigmoid(self.node_id))
    }

    /// `log(1 + exp(x))`.
    pub fn softplus(&self) -> Self {
        self.derive(NodeType::Softplus(self.node_id, 1.0))
    }

    pub fn clamp(&self, min: f32, max: f32) -> Self {
        self.derive(NodeType::Clamp(self.node_id, min, max))
    }

    /// `max(x, floor)`.
    pub fn maximum_scalar(&self, floor: f32) -> Self {
        self.clamp(floor, f32::MAX)
    }

    pub fn add_scalar(&self, value: f32) -> Self {
        let c = self.constant(value);
        self + &c
    }

    pub fn mul_scalar(&self, value: f32) -> Self {
        let c = self.constant(value);
        self * &c
    }

    // --- Comparisons and selection ---

    pub fn greater_than(&self, threshold: f32) -> Self {
        let c = self.constant(threshold);
        self.derive(NodeType::GreaterThan(self.node_id, c.node_id))
    }

    pub fn less_than(&self, threshold: f32) -> Self {
        let c = self.constant(threshold);
        self.derive(NodeType::Less(self.node_id, c.node_id))
    }

    /// Treats `self` as a 0/1 mask: picks `on_true` where it is non-zero.
    pub fn select(&self, on_true: &Tensor, on_false: &Tensor) -> Self {
        self.derive(NodeType::Select {
            condition: self.node_id,
            on_true: on_true.node_id,
            on_false: on_false.node_id,
        })
    }

    // --- Reductions ---

    pub fn sum(&self) -> Self {
        self.derive(NodeType::Sum(self.node_id))
    }

    /// Sum over `axis`, keeping it with length 1.
    pub fn sum_axis(&self, axis: usize) -> Self {
        self.derive(NodeType::SumAxis(self.node_id, axis))
    }

    /// Max over `axis`, keeping it with length 1.
    pub fn max_axis(&self, axis: usize) -> Self {
        self.derive(NodeType::MaxAxis(self.node_id, axis))
    }

    pub fn argmax(&self, axis: usize) -> Self {
        self.derive(NodeType::ArgMax(self.node_id, axis))
    }

    pub fn one_hot(&self, depth: usize) -> Self {
        self.derive(NodeType::OneHot {
            indices: self.node_id,
            depth,
        })
    }

    // --- Layout ---

    pub fn reshape(&self, shape: &[usize]) -> Self {
        let shape_data = Array1::from(shape.iter().map(|&d| d as f32).collect::<Vec<_>>()).into_dyn();
        let shape_node = self
            .context
            .borrow_mut()
            .main_graph_mut()
            .add_node(None, NodeType::Literal(Value::Tensor(shape_data)));
        self.derive(NodeType::Reshape(self.node_id, shape_node))
    }

    pub fn transpose(&self, axis1: usize, axis2: usize) -> Self {
        self.derive(NodeType::Transpose(self.node_id, axis1, axis2))
    }

    /// `self[.., start..end, ..]` along `axis`; the axis is kept.
    pub fn slice(&self, axis: usize, start: usize, end: usize) -> Self {
        self.derive(NodeType::Slice {
            input: self.node_id,
            axis,
            start,
            end,
        })
    }

    /// Concatenates `self` followed by `others` along `axis`.
    pub fn concat(&self, others: &[&Tensor], axis: usize) -> Self {
        let mut inputs = Vec::with_capacity(others.len() + 1);
        inputs.push(self.node_id);
        inputs.extend(others.iter().map(|t| t.node_id));
        self.derive(NodeType::Concat { inputs, axis })
    }
}

// Operator sugar so graphs read like `a + b`.

impl Add<&Tensor> for &Tensor {
    type Output = Tensor;
    fn add(self, rhs: &Tensor) -> Self::Output {
        self.derive(NodeType::Add(self.node_id, rhs.node_id))
    }
}

impl Sub<&Tensor> for &Tensor {
    type Output = Tensor;
    fn sub(self, rhs: &Tensor) -> Self::Output {
        self.derive(NodeType::Subtract(self.node_id, rhs.node_id))
    }
}

impl Mul<&Tensor> for &Tensor {
    type Output = Tensor;
    fn mul(self, rhs: &Tensor) -> Self::Output {
        self.derive(NodeType::Multiply(self.node_id, rhs.node_id))
    }
}

impl Div<&Tensor> for &Tensor {
    type Output = Tensor;
    fn div(self, rhs: &Tensor) -> Self::Output {
        self.derive(NodeType::Divide(self.node_id, rhs.node_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operations_append_nodes() {
        let ctx = GraphContext::shared();
        let x = Tensor::new_input(&ctx, "x");
        let y = x.tanh().slice(2, 0, 4).sum_axis(2);

        let graph = ctx.borrow().main_graph().clone();
        assert_eq!(graph.inputs, vec![x.node_id]);
        assert!(matches!(
            graph.get_node(y.node_id).unwrap().node_type,
            NodeType::SumAxis(_, 2)
        ));
    }

    #[test]
    fn reshape_stores_shape_literal() {
        let ctx = GraphContext::shared();
        let x = Tensor::new_input(&ctx, "x");
        let r = x.reshape(&[4, 8, 1]);

        let graph = ctx.borrow().main_graph().clone();
        let NodeType::Reshape(_, shape_id) = graph.get_node(r.node_id).unwrap().node_type else {
            panic!("expected a reshape node");
        };
        let NodeType::Literal(Value::Tensor(shape)) = &graph.get_node(shape_id).unwrap().node_type
        else {
            panic!("shape operand must be a literal");
        };
        assert_eq!(shape.iter().copied().collect::<Vec<_>>(), vec![4.0, 8.0, 1.0]);
    }

    #[test]
    fn concat_keeps_operand_order() {
        let ctx = GraphContext::shared();
        let a = Tensor::new_input(&ctx, "a");
        let b = Tensor::new_input(&ctx, "b");
        let c = Tensor::new_input(&ctx, "c");
        let joined = a.concat(&[&b, &c], 1);

        let graph = ctx.borrow().main_graph().clone();
        assert_eq!(
            graph.get_node(joined.node_id).unwrap().node_type.operands(),
            vec![a.node_id, b.node_id, c.node_id]
        );
    }
}
