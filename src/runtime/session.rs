//! `Session`: the glue that takes a symbolic graph plus named data to values.
//!
//! Every caller needs the same steps (shape inference from the fed data, memo
//! seeding, forward run, optional gradient graph run), so they live here once.

use super::backend::{Backend, Memo, RuntimeError};
use crate::analysis::shape_inference::{ShapeInference, ShapeInferenceError};
use crate::asg::{Asg, DType, NodeId, Shape, Value};
use crate::autograd::{AutogradError, Gradients};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Runtime: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("Shape inference: {0}")]
    Shape(#[from] ShapeInferenceError),
    #[error("Autograd: {0}")]
    Autograd(#[from] AutogradError),
    #[error("Graph has no input or parameter named '{0}'")]
    UnknownInput(String),
    #[error("Backend returned {got} values, expected {expected}")]
    OutputCount { expected: usize, got: usize },
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Runs graphs on a backend `B`.
pub struct Session<B: Backend> {
    backend: B,
}

impl<B: Backend> Session<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Evaluates `outputs` of `graph` with the inputs fed by name.
    pub fn evaluate(
        &self,
        graph: &Asg,
        outputs: &[NodeId],
        feeds: &HashMap<String, Value>,
    ) -> SessionResult<Vec<Value>> {
        let mut graph = graph.clone();
        graph.set_outputs(outputs.to_vec());
        let (values, _) = self.forward(&mut graph, feeds)?;
        Ok(values)
    }

    /// Evaluates the scalar-or-tensor `loss` and its gradient w.r.t. each named input.
    ///
    /// Gradients are returned in `wrt` order, each with the shape of its input.
    pub fn value_and_grad(
        &self,
        graph: &Asg,
        loss: NodeId,
        wrt: &[&str],
        feeds: &HashMap<String, Value>,
    ) -> SessionResult<(Value, Vec<Value>)> {
        let mut forward = graph.clone();
        forward.set_output(loss);

        let wrt_ids = wrt
            .iter()
            .map(|name| {
                forward
                    .find_named(name)
                    .ok_or_else(|| SessionError::UnknownInput(name.to_string()))
            })
            .collect::<SessionResult<Vec<_>>>()?;

        let (mut values, memo) = self.forward(&mut forward, feeds)?;
        let loss_value = values.pop().ok_or(SessionError::OutputCount { expected: 1, got: 0 })?;

        let mut grad_graph = Gradients::new(forward).build(loss, &wrt_ids)?;
        // External nodes already carry the forward shapes.
        ShapeInference::run(&mut grad_graph, &HashMap::new())?;

        let (grad_outputs, _) = self.backend.run(&grad_graph, memo)?;
        let grads = self.backend.retrieve_data(&grad_outputs)?;
        if grads.len() != wrt.len() {
            return Err(SessionError::OutputCount { expected: wrt.len(), got: grads.len() });
        }
        debug!(wrt = ?wrt, "gradients computed");
        Ok((loss_value, grads))
    }

    /// Infers shapes from the feeds, seeds the memo and runs the graph.
    fn forward(
        &self,
        graph: &mut Asg,
        feeds: &HashMap<String, Value>,
    ) -> SessionResult<(Vec<Value>, Memo<B::DeviceData>)> {
        let shapes: HashMap<String, (Shape, DType)> = feeds
            .iter()
            .map(|(name, value)| (name.clone(), (value.shape(), DType::F32)))
            .collect();
        ShapeInference::run(graph, &shapes)?;

        let device_data = self.backend.load_data(feeds)?;
        let mut memo: Memo<B::DeviceData> = HashMap::new();
        for (name, data) in device_data {
            let node_id = graph
                .find_named(&name)
                .ok_or_else(|| SessionError::UnknownInput(name.clone()))?;
            memo.insert((graph.id, node_id), data);
        }

        let (outputs, memo) = self.backend.run(graph, memo)?;
        let values = self.backend.retrieve_data(&outputs)?;
        if values.len() != graph.outputs.len() {
            return Err(SessionError::OutputCount {
                expected: graph.outputs.len(),
                got: values.len(),
            });
        }
        Ok((values, memo))
    }
}
