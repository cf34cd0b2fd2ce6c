//! Module for shape and data type inference (Shape Inference).
//!
//! Traverses the computation graph and determines the shape
//! and data type of the output tensor for each node based on its input shapes and operation type.

use crate::asg::{Asg, AsgError, DType, Node, NodeId, NodeType, Shape, Value};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::trace;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShapeInferenceError {
    #[error("Graph error: {0}")]
    AsgError(#[from] AsgError),

    #[error("Shape information missing for node {0}. \
             This may mean the node has not been processed by shape inference yet or the graph contains a cyclic dependency.")]
    MissingShapeInfo(NodeId),

    #[error("Initial shape not specified for '{0}'. \
             Add the shape to the initial_shapes HashMap when calling ShapeInference::run().")]
    MissingInitialShape(String),

    #[error("Invalid axis {axis} for node {node_id}: tensor has rank {rank}.")]
    InvalidAxis { node_id: NodeId, axis: usize, rank: usize },

    #[error("Invalid slice {start}..{end} on axis of length {len} at node {node_id}.")]
    InvalidSlice { node_id: NodeId, start: usize, end: usize, len: usize },

    #[error("Cannot reshape {from:?} into {to:?} at node {node_id}: element counts differ.")]
    ReshapeMismatch { node_id: NodeId, from: Shape, to: Shape },

    #[error("Node {0} must be a Literal for shape computation (e.g., for Reshape operation). \
             Dynamic shapes are not supported.")]
    NotALiteral(NodeId),

    #[error("Incompatible shapes for operation '{op}' at node {node_id}: {shapes:?}.")]
    IncompatibleShapes { op: String, node_id: NodeId, shapes: Vec<Shape> },

    #[error("Broadcast error: cannot broadcast shapes {0:?} and {1:?} to a common shape.")]
    BroadcastError(Shape, Shape),
}

type Result<T> = std::result::Result<T, ShapeInferenceError>;

/// Numpy broadcasting of two shapes, `None` if they are incompatible.
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Option<Shape> {
    let rank = a.len().max(b.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let da = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
        let db = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return None,
        };
    }
    Some(out)
}

/// Structure that performs shape inference for ASG.
pub struct ShapeInference;

impl ShapeInference {
    /// Runs the shape inference process for the graph.
    ///
    /// Modifies the graph in-place, filling in the `shape` and `dtype` fields for each node.
    ///
    /// # Arguments
    /// * `asg` - Mutable reference to the graph to analyze.
    /// * `initial_shapes` - Shapes and types for `Input`, `Parameter` and `External`
    ///   nodes, keyed by node name. A node that already carries a shape may be omitted.
    pub fn run(asg: &mut Asg, initial_shapes: &HashMap<String, (Shape, DType)>) -> Result<()> {
        let sorted_nodes = Self::topological_sort(asg)?;

        for node_id in sorted_nodes {
            let mut node = asg.get_node(node_id)?.clone();
            let (shape, dtype) = Self::infer_node_shape(asg, &node, initial_shapes)?;
            trace!(node_id, op = node.node_type.op_name(), ?shape, "inferred shape");

            node.shape = Some(shape);
            node.dtype = Some(dtype);
            asg.nodes.insert(node_id, node);
        }

        Ok(())
    }

    /// Main shape inference logic for a single node.
    fn infer_node_shape(
        asg: &Asg,
        node: &Node,
        initial_shapes: &HashMap<String, (Shape, DType)>,
    ) -> Result<(Shape, DType)> {
        match &node.node_type {
            NodeType::Input { name }
            | NodeType::Parameter { name }
            | NodeType::External { name, .. } => match initial_shapes.get(name) {
                Some(found) => Ok(found.clone()),
                None => match &node.shape {
                    Some(shape) => Ok((shape.clone(), node.dtype.unwrap_or(DType::F32))),
                    None => Err(ShapeInferenceError::MissingInitialShape(name.clone())),
                },
            },

            NodeType::Literal(value) => match value {
                Value::Tensor(arr) => Ok((arr.shape().to_vec(), DType::F32)),
                Value::ScalarF32(_) => Ok((vec![], DType::F32)),
            },

            NodeType::Add(l, r)
            | NodeType::Subtract(l, r)
            | NodeType::Multiply(l, r)
            | NodeType::Divide(l, r)
            | NodeType::GreaterThan(l, r)
            | NodeType::Less(l, r)
            | NodeType::Equal(l, r) => {
                let (ls, _) = Self::get_shape_dtype(asg, *l)?;
                let (rs, _) = Self::get_shape_dtype(asg, *r)?;
                let out = broadcast_shapes(&ls, &rs)
                    .ok_or_else(|| ShapeInferenceError::BroadcastError(ls, rs))?;
                // Comparisons return 0.0 or 1.0, so everything here is F32.
                Ok((out, DType::F32))
            }

            NodeType::Select { condition, on_true, on_false } => {
                let (cs, _) = Self::get_shape_dtype(asg, *condition)?;
                let (ts, _) = Self::get_shape_dtype(asg, *on_true)?;
                let (fs, _) = Self::get_shape_dtype(asg, *on_false)?;
                let branches = broadcast_shapes(&ts, &fs)
                    .ok_or_else(|| ShapeInferenceError::BroadcastError(ts.clone(), fs.clone()))?;
                let out = broadcast_shapes(&cs, &branches)
                    .ok_or(ShapeInferenceError::BroadcastError(cs, branches))?;
                Ok((out, DType::F32))
            }

            // Element-wise operations - shape unchanged
            NodeType::Negate(id)
            | NodeType::Exp(id)
            | NodeType::Log(id)
            | NodeType::Tanh(id)
            | NodeType::Sigmoid(id)
            | NodeType::Softplus(id, _)
            | NodeType::Clamp(id, _, _) => Self::get_shape_dtype(asg, *id),

            NodeType::Sum(_) => Ok((vec![], DType::F32)),

            NodeType::SumAxis(id, axis) | NodeType::MaxAxis(id, axis) => {
                let (mut shape, dtype) = Self::get_shape_dtype(asg, *id)?;
                Self::check_axis(node.id, *axis, shape.len())?;
                // Keep the axis with length 1 so the result broadcasts against the input.
                shape[*axis] = 1;
                Ok((shape, dtype))
            }

            NodeType::ArgMax(id, axis) => {
                let (mut shape, _) = Self::get_shape_dtype(asg, *id)?;
                Self::check_axis(node.id, *axis, shape.len())?;
                shape.remove(*axis);
                Ok((shape, DType::I32))
            }

            NodeType::OneHot { indices, depth } => {
                let (mut shape, _) = Self::get_shape_dtype(asg, *indices)?;
                shape.push(*depth);
                Ok((shape, DType::F32))
            }

            NodeType::Transpose(id, axis1, axis2) => {
                let (mut shape, dtype) = Self::get_shape_dtype(asg, *id)?;
                Self::check_axis(node.id, (*axis1).max(*axis2), shape.len())?;
                shape.swap(*axis1, *axis2);
                Ok((shape, dtype))
            }

            NodeType::Reshape(data_id, shape_id) => {
                let (from, dtype) = Self::get_shape_dtype(asg, *data_id)?;
                let shape_node = asg.get_node(*shape_id)?;
                if let NodeType::Literal(Value::Tensor(shape_tensor)) = &shape_node.node_type {
                    let to: Shape = shape_tensor.iter().map(|&x| x as usize).collect();
                    if from.iter().product::<usize>() != to.iter().product::<usize>() {
                        return Err(ShapeInferenceError::ReshapeMismatch { node_id: node.id, from, to });
                    }
                    Ok((to, dtype))
                } else {
                    Err(ShapeInferenceError::NotALiteral(*shape_id))
                }
            }

            NodeType::Slice { input, axis, start, end } => {
                let (mut shape, dtype) = Self::get_shape_dtype(asg, *input)?;
                Self::check_axis(node.id, *axis, shape.len())?;
                let len = shape[*axis];
                if start >= end || *end > len {
                    return Err(ShapeInferenceError::InvalidSlice {
                        node_id: node.id,
                        start: *start,
                        end: *end,
                        len,
                    });
                }
                shape[*axis] = end - start;
                Ok((shape, dtype))
            }

            NodeType::SliceGrad { grad_output, axis, start, len } => {
                let (mut shape, dtype) = Self::get_shape_dtype(asg, *grad_output)?;
                Self::check_axis(node.id, *axis, shape.len())?;
                if start + shape[*axis] > *len {
                    return Err(ShapeInferenceError::InvalidSlice {
                        node_id: node.id,
                        start: *start,
                        end: start + shape[*axis],
                        len: *len,
                    });
                }
                shape[*axis] = *len;
                Ok((shape, dtype))
            }

            NodeType::Concat { inputs, axis } => {
                let shapes = inputs
                    .iter()
                    .map(|id| Self::get_shape_dtype(asg, *id).map(|(s, _)| s))
                    .collect::<Result<Vec<_>>>()?;
                let first = shapes.first().cloned().ok_or_else(|| {
                    ShapeInferenceError::IncompatibleShapes {
                        op: "Concat".to_string(),
                        node_id: node.id,
                        shapes: vec![],
                    }
                })?;
                Self::check_axis(node.id, *axis, first.len())?;
                let compatible = shapes.iter().all(|s| {
                    s.len() == first.len()
                        && s.iter().zip(&first).enumerate().all(|(i, (a, b))| i == *axis || a == b)
                });
                if !compatible {
                    return Err(ShapeInferenceError::IncompatibleShapes {
                        op: "Concat".to_string(),
                        node_id: node.id,
                        shapes,
                    });
                }
                let mut out = first;
                out[*axis] = shapes.iter().map(|s| s[*axis]).sum();
                Ok((out, DType::F32))
            }

            NodeType::Broadcast(source_id, target_id) => {
                let (source_shape, dtype) = Self::get_shape_dtype(asg, *source_id)?;
                let (target_shape, _) = Self::get_shape_dtype(asg, *target_id)?;
                match broadcast_shapes(&source_shape, &target_shape) {
                    Some(out) if out == target_shape => Ok((target_shape, dtype)),
                    _ => Err(ShapeInferenceError::BroadcastError(source_shape, target_shape)),
                }
            }

            NodeType::ReduceSumTo(source_id, target_shape_provider_id) => {
                let (_, dtype) = Self::get_shape_dtype(asg, *source_id)?;
                let (target_shape, _) = Self::get_shape_dtype(asg, *target_shape_provider_id)?;
                Ok((target_shape, dtype))
            }
        }
    }

    fn check_axis(node_id: NodeId, axis: usize, rank: usize) -> Result<()> {
        if axis >= rank {
            return Err(ShapeInferenceError::InvalidAxis { node_id, axis, rank });
        }
        Ok(())
    }

    /// Helper function to get already computed shape and type for a node.
    fn get_shape_dtype(asg: &Asg, node_id: NodeId) -> Result<(Shape, DType)> {
        let node = asg.get_node(node_id)?;
        match (&node.shape, &node.dtype) {
            (Some(s), Some(d)) => Ok((s.clone(), *d)),
            _ => Err(ShapeInferenceError::MissingShapeInfo(node_id)),
        }
    }

    /// Performs topological sort of the graph.
    /// Returns a vector of node IDs in order suitable for computation.
    pub fn topological_sort(asg: &Asg) -> Result<Vec<NodeId>> {
        // Every output is a root, not just the first one.
        Self::topological_sort_from(asg, &asg.outputs)
    }

    /// Topological order of everything `roots` depend on.
    pub fn topological_sort_from(asg: &Asg, roots: &[NodeId]) -> Result<Vec<NodeId>> {
        let mut sorted = Vec::new();
        let mut visited = HashSet::new();
        for root in roots {
            Self::build_sorted_graph(*root, asg, &mut visited, &mut sorted)?;
        }
        Ok(sorted)
    }

    fn build_sorted_graph(
        node_id: NodeId,
        asg: &Asg,
        visited: &mut HashSet<NodeId>,
        sorted: &mut Vec<NodeId>,
    ) -> Result<()> {
        if visited.contains(&node_id) {
            return Ok(());
        }

        let node = asg.get_node(node_id)?;
        for input_id in node.node_type.operands() {
            Self::build_sorted_graph(input_id, asg, visited, sorted)?;
        }

        if visited.insert(node_id) {
            sorted.push(node_id);
        }
        Ok(())
    }
}
