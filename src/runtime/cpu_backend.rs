//! CPU backend for executing an ASG.
//!
//! Walks the graph in topological order and evaluates every node with `ndarray`.

use super::backend::{Backend, Memo, RuntimeError};
use crate::analysis::shape_inference::{broadcast_shapes, ShapeInference};
use crate::asg::{Asg, AsgId, NodeId, NodeType, Value};
use ndarray::{ArrayD, Axis, IxDyn, Slice, Zip};
use std::collections::HashMap;
use tracing::debug;

/// Execution state for one graph run on the CPU.
struct ExecutionContext<'a> {
    graphs: HashMap<AsgId, &'a Asg>,
    /// Values computed so far, keyed by (AsgId, NodeId).
    memo: Memo<Value>,
}

impl<'a> ExecutionContext<'a> {
    fn new(main_asg: &'a Asg, initial_memo: Memo<Value>) -> Self {
        let mut graphs = HashMap::new();
        graphs.insert(main_asg.id, main_asg);
        Self {
            graphs,
            memo: initial_memo,
        }
    }

    /// Computes one node. Operands must already be in the memo (topological order).
    fn evaluate_node(&mut self, asg_id: AsgId, node_id: NodeId) -> Result<Value, RuntimeError> {
        if let Some(value) = self.memo.get(&(asg_id, node_id)) {
            return Ok(value.clone());
        }

        let asg: &'a Asg = *self
            .graphs
            .get(&asg_id)
            .ok_or(RuntimeError::GraphNotFound(asg_id))?;
        let node = asg
            .nodes
            .get(&node_id)
            .ok_or(RuntimeError::NodeNotFound(node_id, asg_id))?;

        let result = match &node.node_type {
            NodeType::Input { name } => {
                return Err(RuntimeError::MissingInput(name.clone(), node.id));
            }
            NodeType::Parameter { name } => {
                return Err(RuntimeError::MissingParameter(name.clone(), node.id));
            }
            NodeType::Literal(value) => Ok(value.clone()),
            NodeType::External { source_asg_id, source_node_id, .. } => self
                .memo
                .get(&(*source_asg_id, *source_node_id))
                .cloned()
                .ok_or(RuntimeError::NodeNotFound(*source_node_id, *source_asg_id)),

            NodeType::Add(l, r)
            | NodeType::Subtract(l, r)
            | NodeType::Multiply(l, r)
            | NodeType::Divide(l, r)
            | NodeType::GreaterThan(l, r)
            | NodeType::Less(l, r)
            | NodeType::Equal(l, r) => {
                let lhs = self.operand(asg_id, *l)?;
                let rhs = self.operand(asg_id, *r)?;
                let f: fn(f32, f32) -> f32 = match &node.node_type {
                    NodeType::Add(..) => |a, b| a + b,
                    NodeType::Subtract(..) => |a, b| a - b,
                    NodeType::Multiply(..) => |a, b| a * b,
                    NodeType::Divide(..) => |a, b| a / b,
                    NodeType::GreaterThan(..) => |a, b| if a > b { 1.0 } else { 0.0 },
                    NodeType::Less(..) => |a, b| if a < b { 1.0 } else { 0.0 },
                    _ => |a, b| if a == b { 1.0 } else { 0.0 },
                };
                op_binary(&lhs, &rhs, f)
            }

            NodeType::Select { condition, on_true, on_false } => {
                let c = self.operand(asg_id, *condition)?;
                let t = self.operand(asg_id, *on_true)?;
                let f = self.operand(asg_id, *on_false)?;
                op_select(&c, &t, &f)
            }

            NodeType::Negate(op)
            | NodeType::Exp(op)
            | NodeType::Log(op)
            | NodeType::Tanh(op)
            | NodeType::Sigmoid(op) => {
                let a = self.operand(asg_id, *op)?;
                let f: fn(f32) -> f32 = match &node.node_type {
                    NodeType::Negate(_) => |x| -x,
                    NodeType::Exp(_) => f32::exp,
                    NodeType::Log(_) => f32::ln,
                    NodeType::Tanh(_) => f32::tanh,
                    _ => stable_sigmoid,
                };
                Ok(Value::Tensor(a.mapv(f)))
            }
            NodeType::Softplus(op, beta) => {
                let a = self.operand(asg_id, *op)?;
                Ok(Value::Tensor(a.mapv(|x| stable_softplus(x, *beta))))
            }
            NodeType::Clamp(op, min_val, max_val) => {
                let a = self.operand(asg_id, *op)?;
                Ok(Value::Tensor(a.mapv(|x| x.max(*min_val).min(*max_val))))
            }

            NodeType::Sum(op) => {
                let a = self.operand(asg_id, *op)?;
                Ok(Value::Tensor(ndarray::arr0(a.sum()).into_dyn()))
            }
            NodeType::SumAxis(op, axis) => {
                let a = self.operand(asg_id, *op)?;
                check_axis(*axis, &a)?;
                Ok(Value::Tensor(a.sum_axis(Axis(*axis)).insert_axis(Axis(*axis))))
            }
            NodeType::MaxAxis(op, axis) => {
                let a = self.operand(asg_id, *op)?;
                check_axis(*axis, &a)?;
                let max = a.map_axis(Axis(*axis), |lane| {
                    lane.fold(f32::NEG_INFINITY, |m, &v| m.max(v))
                });
                Ok(Value::Tensor(max.insert_axis(Axis(*axis))))
            }
            NodeType::ArgMax(op, axis) => {
                let a = self.operand(asg_id, *op)?;
                check_axis(*axis, &a)?;
                Ok(Value::Tensor(op_argmax(&a, *axis)))
            }
            NodeType::OneHot { indices, depth } => {
                let idx = self.operand(asg_id, *indices)?;
                op_one_hot(&idx, *depth).map(Value::Tensor)
            }

            NodeType::Reshape(data, shape) => {
                let a = self.operand(asg_id, *data)?;
                let provider = self.operand(asg_id, *shape)?;
                op_reshape(&a, &provider).map(Value::Tensor)
            }
            NodeType::Transpose(op, ax1, ax2) => {
                let a = self.operand(asg_id, *op)?;
                op_transpose(a, *ax1, *ax2).map(Value::Tensor)
            }
            NodeType::Slice { input, axis, start, end } => {
                let a = self.operand(asg_id, *input)?;
                op_slice(&a, *axis, *start, *end).map(Value::Tensor)
            }
            NodeType::SliceGrad { grad_output, axis, start, len } => {
                let g = self.operand(asg_id, *grad_output)?;
                op_slice_grad(&g, *axis, *start, *len).map(Value::Tensor)
            }
            NodeType::Concat { inputs, axis } => {
                let parts = inputs
                    .iter()
                    .map(|id| self.operand(asg_id, *id))
                    .collect::<Result<Vec<_>, _>>()?;
                let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
                ndarray::concatenate(Axis(*axis), &views)
                    .map(Value::Tensor)
                    .map_err(|e| RuntimeError::ShapeError(format!("Concat: {}", e)))
            }
            NodeType::Broadcast(source, target) => {
                let s = self.operand(asg_id, *source)?;
                let t = self.operand(asg_id, *target)?;
                s.broadcast(t.shape())
                    .map(|view| Value::Tensor(view.to_owned()))
                    .ok_or_else(|| {
                        RuntimeError::ShapeError(format!(
                            "Cannot broadcast {:?} to {:?}",
                            s.shape(),
                            t.shape()
                        ))
                    })
            }
            NodeType::ReduceSumTo(source, target) => {
                let s = self.operand(asg_id, *source)?;
                let t = self.operand(asg_id, *target)?;
                op_reduce_sum_to(s, t.shape()).map(Value::Tensor)
            }
        }?;

        self.memo.insert((asg_id, node_id), result.clone());
        Ok(result)
    }

    fn operand(&mut self, asg_id: AsgId, node_id: NodeId) -> Result<ArrayD<f32>, RuntimeError> {
        self.evaluate_node(asg_id, node_id).map(Value::into_tensor)
    }
}

pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for CpuBackend {
    type DeviceData = Value;

    fn load_data(
        &self,
        data: &HashMap<String, Value>,
    ) -> Result<HashMap<String, Self::DeviceData>, RuntimeError> {
        Ok(data.clone())
    }

    fn run(
        &self,
        main_asg: &Asg,
        initial_memo: Memo<Self::DeviceData>,
    ) -> Result<(Vec<Self::DeviceData>, Memo<Self::DeviceData>), RuntimeError> {
        let sorted_nodes = ShapeInference::topological_sort(main_asg)
            .map_err(|e| RuntimeError::ShapeError(format!("Topological sort failed: {}", e)))?;
        debug!(graph = main_asg.id, nodes = sorted_nodes.len(), "cpu run");

        let mut context = ExecutionContext::new(main_asg, initial_memo);
        for node_id in sorted_nodes {
            context.evaluate_node(main_asg.id, node_id)?;
        }

        let mut results = Vec::with_capacity(main_asg.outputs.len());
        for output_node_id in &main_asg.outputs {
            let result = context
                .memo
                .get(&(main_asg.id, *output_node_id))
                .ok_or(RuntimeError::NodeNotFound(*output_node_id, main_asg.id))?
                .clone();
            results.push(result);
        }
        Ok((results, context.memo))
    }

    fn retrieve_data(&self, device_data: &[Self::DeviceData]) -> Result<Vec<Value>, RuntimeError> {
        Ok(device_data.to_vec())
    }
}

fn stable_sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// `log(1 + exp(beta * x)) / beta` without overflow for large `|x|`.
fn stable_softplus(x: f32, beta: f32) -> f32 {
    let bx = beta * x;
    (bx.max(0.0) + (-bx.abs()).exp().ln_1p()) / beta
}

fn check_axis(axis: usize, a: &ArrayD<f32>) -> Result<(), RuntimeError> {
    if axis >= a.ndim() {
        return Err(RuntimeError::ShapeError(format!(
            "axis {} out of range for shape {:?}",
            axis,
            a.shape()
        )));
    }
    Ok(())
}

fn op_binary(a: &ArrayD<f32>, b: &ArrayD<f32>, f: fn(f32, f32) -> f32) -> Result<Value, RuntimeError> {
    let shape = broadcast_shapes(a.shape(), b.shape()).ok_or_else(|| {
        RuntimeError::ShapeError(format!("Incompatible shapes {:?} and {:?}", a.shape(), b.shape()))
    })?;
    let (av, bv) = match (a.broadcast(IxDyn(&shape)), b.broadcast(IxDyn(&shape))) {
        (Some(av), Some(bv)) => (av, bv),
        _ => {
            return Err(RuntimeError::ShapeError(format!(
                "Cannot broadcast {:?} and {:?} to {:?}",
                a.shape(),
                b.shape(),
                shape
            )))
        }
    };
    Ok(Value::Tensor(Zip::from(&av).and(&bv).map_collect(|&x, &y| f(x, y))))
}

fn op_select(c: &ArrayD<f32>, t: &ArrayD<f32>, f: &ArrayD<f32>) -> Result<Value, RuntimeError> {
    let shape = broadcast_shapes(t.shape(), f.shape())
        .and_then(|s| broadcast_shapes(c.shape(), &s))
        .ok_or_else(|| {
            RuntimeError::ShapeError(format!(
                "Select: incompatible shapes {:?}, {:?}, {:?}",
                c.shape(),
                t.shape(),
                f.shape()
            ))
        })?;
    let dim = IxDyn(&shape);
    match (c.broadcast(dim.clone()), t.broadcast(dim.clone()), f.broadcast(dim)) {
        (Some(cv), Some(tv), Some(fv)) => Ok(Value::Tensor(
            Zip::from(&cv)
                .and(&tv)
                .and(&fv)
                .map_collect(|&m, &x, &y| if m != 0.0 { x } else { y }),
        )),
        _ => Err(RuntimeError::ShapeError(format!("Select: cannot broadcast to {:?}", shape))),
    }
}

fn op_argmax(a: &ArrayD<f32>, axis: usize) -> ArrayD<f32> {
    a.map_axis(Axis(axis), |lane| {
        let mut best = 0;
        let mut best_val = f32::NEG_INFINITY;
        for (i, &v) in lane.iter().enumerate() {
            if v > best_val {
                best_val = v;
                best = i;
            }
        }
        best as f32
    })
}

fn op_one_hot(indices: &ArrayD<f32>, depth: usize) -> Result<ArrayD<f32>, RuntimeError> {
    let mut shape = indices.shape().to_vec();
    shape.push(depth);
    let mut out = ArrayD::<f32>::zeros(IxDyn(&shape));
    let last = Axis(shape.len() - 1);
    for (mut lane, &idx) in out.lanes_mut(last).into_iter().zip(indices.iter()) {
        let i = idx as usize;
        if idx < 0.0 || i >= depth {
            return Err(RuntimeError::ComputationError(format!(
                "one-hot index {} out of range for depth {}",
                idx, depth
            )));
        }
        lane[i] = 1.0;
    }
    Ok(out)
}

fn op_reshape(source: &ArrayD<f32>, shape_provider: &ArrayD<f32>) -> Result<ArrayD<f32>, RuntimeError> {
    let shape: Vec<usize> = shape_provider.iter().map(|&x| x as usize).collect();
    source
        .to_shape(shape.as_slice())
        .map(|view| view.into_owned())
        .map_err(|e| {
            RuntimeError::ShapeError(format!("Reshape {:?} -> {:?}: {}", source.shape(), shape, e))
        })
}

fn op_transpose(a: ArrayD<f32>, axis1: usize, axis2: usize) -> Result<ArrayD<f32>, RuntimeError> {
    check_axis(axis1.max(axis2), &a)?;
    let mut axes: Vec<_> = (0..a.ndim()).collect();
    axes.swap(axis1, axis2);
    // Materialize in row-major order so later reshapes see the logical layout.
    Ok(a.permuted_axes(axes).as_standard_layout().into_owned())
}

fn op_slice(a: &ArrayD<f32>, axis: usize, start: usize, end: usize) -> Result<ArrayD<f32>, RuntimeError> {
    check_axis(axis, a)?;
    if start >= end || end > a.shape()[axis] {
        return Err(RuntimeError::ShapeError(format!(
            "slice {}..{} out of range for axis {} of {:?}",
            start,
            end,
            axis,
            a.shape()
        )));
    }
    Ok(a.slice_axis(Axis(axis), Slice::from(start..end)).to_owned())
}

fn op_slice_grad(g: &ArrayD<f32>, axis: usize, start: usize, len: usize) -> Result<ArrayD<f32>, RuntimeError> {
    check_axis(axis, g)?;
    let width = g.shape()[axis];
    if start + width > len {
        return Err(RuntimeError::ShapeError(format!(
            "slice gradient of width {} at {} exceeds length {}",
            width, start, len
        )));
    }
    let mut shape = g.shape().to_vec();
    shape[axis] = len;
    let mut out = ArrayD::<f32>::zeros(IxDyn(&shape));
    out.slice_axis_mut(Axis(axis), Slice::from(start..start + width))
        .assign(g);
    Ok(out)
}

fn op_reduce_sum_to(mut source: ArrayD<f32>, target_shape: &[usize]) -> Result<ArrayD<f32>, RuntimeError> {
    let target_rank = target_shape.len();
    while source.ndim() > target_rank {
        source = source.sum_axis(Axis(0));
    }

    // Axes the target holds as 1 but the source expanded.
    for axis in (0..target_rank).rev() {
        if target_shape[axis] == 1 && source.shape()[axis] > 1 {
            source = source.sum_axis(Axis(axis)).insert_axis(Axis(axis));
        }
    }

    if source.shape() != target_shape {
        return Err(RuntimeError::ShapeError(format!(
            "Cannot reduce {:?} to {:?}",
            source.shape(),
            target_shape
        )));
    }
    Ok(source)
}
