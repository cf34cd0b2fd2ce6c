//! Abstract interface (trait) for graph execution backends.

use crate::asg::{Asg, AsgId, NodeId, Value};
use std::collections::HashMap;
use thiserror::Error;

/// Errors raised while executing a graph. Shared by every backend.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("Node with ID {0} not found in graph {1}. Check that the graph was built correctly and all nodes exist.")]
    NodeNotFound(NodeId, AsgId),

    #[error("Graph with ID {0} not found in the execution context.")]
    GraphNotFound(AsgId),

    #[error("Tensor shape error: {0}. Check the dimensions of the input tensors.")]
    ShapeError(String),

    #[error("Missing value for input '{0}' (node ID: {1}). Add it to the initial memo before calling backend.run().")]
    MissingInput(String, NodeId),

    #[error("Missing value for parameter '{0}' (node ID: {1}). Initialize the parameter before running the graph.")]
    MissingParameter(String, NodeId),

    #[error("Computation error: {0}")]
    ComputationError(String),
}

/// Cache of already computed node values, keyed by `(AsgId, NodeId)`.
pub type Memo<T> = HashMap<(AsgId, NodeId), T>;

/// Common interface of an execution backend.
///
/// A backend takes an ASG plus data and returns the values of the graph outputs.
pub trait Backend {
    /// Device-side representation of a tensor.
    type DeviceData: std::fmt::Debug;

    /// Moves host data onto the device.
    fn load_data(
        &self,
        data: &HashMap<String, Value>,
    ) -> Result<HashMap<String, Self::DeviceData>, RuntimeError>;

    /// Executes the graph, reusing and extending the memo.
    ///
    /// # Arguments
    /// * `main_asg` - Graph to execute.
    /// * `initial_memo` - Inputs, parameters and, for a gradient graph, every value
    ///   of the forward run its `External` nodes refer to.
    ///
    /// # Returns
    /// The output values (in `main_asg.outputs` order) and the final memo.
    fn run(
        &self,
        main_asg: &Asg,
        initial_memo: Memo<Self::DeviceData>,
    ) -> Result<(Vec<Self::DeviceData>, Memo<Self::DeviceData>), RuntimeError>;

    /// Copies results back to the host.
    fn retrieve_data(&self, device_data: &[Self::DeviceData]) -> Result<Vec<Value>, RuntimeError>;
}
