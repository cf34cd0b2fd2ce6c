//! ASG: the Abstract Semantic Graph that every loss and sampler is built on.
//!
//! A graph is a flat map of nodes. Each node names its operands by id, so the
//! graph is a DAG rooted at `outputs`. Shapes and dtypes are filled in later by
//! [`crate::analysis::shape_inference`].

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Node identifier, unique within one graph.
pub type NodeId = usize;
/// Graph identifier.
pub type AsgId = usize;
/// Tensor shape.
pub type Shape = Vec<usize>;

pub type AsgResult<T> = std::result::Result<T, AsgError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AsgError {
    #[error("Node with ID {0} not found")]
    NodeNotFound(NodeId),
    #[error("Graph with ID {0} not found")]
    AsgNotFound(AsgId),
    #[error("Invalid shape on node {0}")]
    InvalidShape(NodeId),
    #[error("Operation not supported: {0}")]
    UnsupportedOperation(String),
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub enum DType {
    F32,
    /// Integer-valued data stored as `f32` (arg-max indices).
    I32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Node id (duplicates the HashMap key for convenience).
    pub id: NodeId,
    pub name: Option<String>,
    pub node_type: NodeType,
    pub shape: Option<Shape>,
    pub dtype: Option<DType>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeType {
    // Data
    Input { name: String },
    Parameter { name: String },
    Literal(Value),
    /// A node of another graph, resolved from the execution memo.
    External { name: String, source_asg_id: AsgId, source_node_id: NodeId },

    // Binary, numpy broadcasting
    Add(NodeId, NodeId),
    Subtract(NodeId, NodeId),
    Multiply(NodeId, NodeId),
    Divide(NodeId, NodeId),
    /// 1.0 where `lhs > rhs`, else 0.0.
    GreaterThan(NodeId, NodeId),
    /// 1.0 where `lhs < rhs`, else 0.0.
    Less(NodeId, NodeId),
    /// 1.0 where `lhs == rhs`, else 0.0.
    Equal(NodeId, NodeId),
    /// `condition != 0 ? on_true : on_false`, elementwise with broadcasting.
    Select { condition: NodeId, on_true: NodeId, on_false: NodeId },

    // Unary
    Negate(NodeId),
    Exp(NodeId),
    Log(NodeId),
    Tanh(NodeId),
    Sigmoid(NodeId),
    /// `log(1 + exp(beta * x)) / beta`
    Softplus(NodeId, f32),
    Clamp(NodeId, f32, f32),

    // Reductions
    Sum(NodeId),
    /// Sum over one axis, keepdim=1.
    SumAxis(NodeId, usize),
    /// Max over one axis, keepdim=1.
    MaxAxis(NodeId, usize),
    /// Index of the max along one axis; the axis is dropped.
    ArgMax(NodeId, usize),
    /// Appends a trailing axis of length `depth`.
    OneHot { indices: NodeId, depth: usize },

    // Layout
    /// Second operand is a literal holding the target shape.
    Reshape(NodeId, NodeId),
    Transpose(NodeId, usize, usize),
    /// `input[.., start..end, ..]` along `axis`.
    Slice { input: NodeId, axis: usize, start: usize, end: usize },
    /// Scatters `grad_output` into zeros of length `len` along `axis` at `start`.
    SliceGrad { grad_output: NodeId, axis: usize, start: usize, len: usize },
    Concat { inputs: Vec<NodeId>, axis: usize },
    /// Broadcasts the first operand to the shape of the second.
    Broadcast(NodeId, NodeId),
    /// Sums the first operand down to the shape of the second.
    ReduceSumTo(NodeId, NodeId),
}

impl NodeType {
    /// Operand ids in evaluation order.
    pub fn operands(&self) -> Vec<NodeId> {
        match self {
            NodeType::Input { .. }
            | NodeType::Parameter { .. }
            | NodeType::Literal(_)
            | NodeType::External { .. } => vec![],

            NodeType::Add(a, b)
            | NodeType::Subtract(a, b)
            | NodeType::Multiply(a, b)
            | NodeType::Divide(a, b)
            | NodeType::GreaterThan(a, b)
            | NodeType::Less(a, b)
            | NodeType::Equal(a, b)
            | NodeType::Reshape(a, b)
            | NodeType::Broadcast(a, b)
            | NodeType::ReduceSumTo(a, b) => vec![*a, *b],

            NodeType::Select { condition, on_true, on_false } => {
                vec![*condition, *on_true, *on_false]
            }

            NodeType::Negate(a)
            | NodeType::Exp(a)
            | NodeType::Log(a)
            | NodeType::Tanh(a)
            | NodeType::Sigmoid(a)
            | NodeType::Softplus(a, _)
            | NodeType::Clamp(a, _, _)
            | NodeType::Sum(a)
            | NodeType::SumAxis(a, _)
            | NodeType::MaxAxis(a, _)
            | NodeType::ArgMax(a, _)
            | NodeType::Transpose(a, _, _) => vec![*a],

            NodeType::OneHot { indices, .. } => vec![*indices],
            NodeType::Slice { input, .. } => vec![*input],
            NodeType::SliceGrad { grad_output, .. } => vec![*grad_output],
            NodeType::Concat { inputs, .. } => inputs.clone(),
        }
    }

    /// Short operation name, used in logs and error messages.
    pub fn op_name(&self) -> &'static str {
        match self {
            NodeType::Input { .. } => "Input",
            NodeType::Parameter { .. } => "Parameter",
            NodeType::Literal(_) => "Literal",
            NodeType::External { .. } => "External",
            NodeType::Add(..) => "Add",
            NodeType::Subtract(..) => "Subtract",
            NodeType::Multiply(..) => "Multiply",
            NodeType::Divide(..) => "Divide",
            NodeType::GreaterThan(..) => "GreaterThan",
            NodeType::Less(..) => "Less",
            NodeType::Equal(..) => "Equal",
            NodeType::Select { .. } => "Select",
            NodeType::Negate(_) => "Negate",
            NodeType::Exp(_) => "Exp",
            NodeType::Log(_) => "Log",
            NodeType::Tanh(_) => "Tanh",
            NodeType::Sigmoid(_) => "Sigmoid",
            NodeType::Softplus(..) => "Softplus",
            NodeType::Clamp(..) => "Clamp",
            NodeType::Sum(_) => "Sum",
            NodeType::SumAxis(..) => "SumAxis",
            NodeType::MaxAxis(..) => "MaxAxis",
            NodeType::ArgMax(..) => "ArgMax",
            NodeType::OneHot { .. } => "OneHot",
            NodeType::Reshape(..) => "Reshape",
            NodeType::Transpose(..) => "Transpose",
            NodeType::Slice { .. } => "Slice",
            NodeType::SliceGrad { .. } => "SliceGrad",
            NodeType::Concat { .. } => "Concat",
            NodeType::Broadcast(..) => "Broadcast",
            NodeType::ReduceSumTo(..) => "ReduceSumTo",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Tensor(ArrayD<f32>),
    ScalarF32(f32),
}

impl Value {
    /// Views any value as an `ArrayD`; scalars become 0-d arrays.
    pub fn into_tensor(self) -> ArrayD<f32> {
        match self {
            Value::Tensor(arr) => arr,
            Value::ScalarF32(v) => ndarray::arr0(v).into_dyn(),
        }
    }

    pub fn shape(&self) -> Shape {
        match self {
            Value::Tensor(arr) => arr.shape().to_vec(),
            Value::ScalarF32(_) => vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asg {
    pub id: AsgId,
    pub name: Option<String>,
    pub nodes: HashMap<NodeId, Node>,
    pub inputs: Vec<NodeId>,
    pub outputs: Vec<NodeId>,
}

impl Asg {
    pub fn new(id: AsgId, name: Option<String>) -> Self {
        Self { id, name, nodes: HashMap::new(), inputs: vec![], outputs: vec![] }
    }

    pub fn add_node(&mut self, name: Option<String>, node_type: NodeType) -> NodeId {
        let new_id = self.nodes.len();
        let mut node = Node { id: new_id, name, node_type, shape: None, dtype: None };

        // Literals carry their shape from the start so inference never stalls on them.
        if let NodeType::Literal(value) = &node.node_type {
            node.shape = Some(value.shape());
            node.dtype = Some(DType::F32);
        }

        self.nodes.insert(new_id, node);
        new_id
    }

    pub fn set_outputs(&mut self, outputs: Vec<NodeId>) {
        self.outputs = outputs;
    }

    pub fn set_output(&mut self, output: NodeId) {
        self.set_outputs(vec![output]);
    }

    pub fn get_node(&self, id: NodeId) -> AsgResult<&Node> {
        self.nodes.get(&id).ok_or(AsgError::NodeNotFound(id))
    }

    pub fn get_node_mut(&mut self, id: NodeId) -> AsgResult<&mut Node> {
        self.nodes.get_mut(&id).ok_or(AsgError::NodeNotFound(id))
    }

    /// Looks up an `Input` or `Parameter` node by its name.
    pub fn find_named(&self, name: &str) -> Option<NodeId> {
        self.nodes.values().find_map(|n| match &n.node_type {
            NodeType::Input { name: n_name } | NodeType::Parameter { name: n_name }
                if n_name == name =>
            {
                Some(n.id)
            }
            _ => None,
        })
    }
}
