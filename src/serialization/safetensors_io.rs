//! Reading and writing tensors in the SafeTensors format.
//!
//! SafeTensors is the HuggingFace container for named tensors: a JSON header
//! followed by raw little-endian buffers. The CLI uses it to read `z`,
//! `input_norm` and `target` and to write gradients and sampled images.

use crate::asg::Value;
use ndarray::{ArrayD, IxDyn};
use safetensors::serialize_to_file;
use safetensors::tensor::{SafeTensors, TensorView};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SafeTensorsError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SafeTensors error: {0}")]
    SafeTensorsError(#[from] safetensors::SafeTensorError),

    #[error("Unsupported dtype: {0}")]
    UnsupportedDtype(String),

    #[error("Tensor shape error: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Tensor '{0}' not found")]
    TensorNotFound(String),
}

type Result<T> = std::result::Result<T, SafeTensorsError>;

/// Saves every `Value::Tensor` of `tensors` as F32. Scalars are stored as 0-d tensors.
///
/// # Example
///
/// ```rust,ignore
/// use pixelasg::serialization::save_safetensors;
///
/// let tensors = HashMap::from([("image".to_string(), Value::Tensor(image))]);
/// save_safetensors("sample.safetensors", &tensors)?;
/// ```
pub fn save_safetensors<P: AsRef<Path>>(path: P, tensors: &HashMap<String, Value>) -> Result<()> {
    // Byte buffers must outlive the views that borrow them.
    let buffers: Vec<(&str, Vec<usize>, Vec<u8>)> = tensors
        .iter()
        .map(|(name, value)| {
            let arr = value.clone().into_tensor();
            let bytes = arr.iter().flat_map(|x| x.to_le_bytes()).collect();
            (name.as_str(), arr.shape().to_vec(), bytes)
        })
        .collect();

    let views = buffers
        .iter()
        .map(|(name, shape, bytes)| {
            TensorView::new(safetensors::Dtype::F32, shape.clone(), bytes).map(|view| (*name, view))
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;

    serialize_to_file(views, &None, path.as_ref())?;
    Ok(())
}

fn decode(shape: &[usize], floats: Vec<f32>) -> Result<Value> {
    let len = floats.len();
    ArrayD::from_shape_vec(IxDyn(shape), floats)
        .map(Value::Tensor)
        .map_err(|_| SafeTensorsError::ShapeMismatch {
            expected: shape.to_vec(),
            actual: vec![len],
        })
}

fn to_value(tensor: &TensorView<'_>) -> Result<Value> {
    let data = tensor.data();
    match tensor.dtype() {
        safetensors::Dtype::F32 => {
            let floats = data
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            decode(tensor.shape(), floats)
        }
        safetensors::Dtype::F64 => {
            let floats = data
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32)
                .collect();
            decode(tensor.shape(), floats)
        }
        other => Err(SafeTensorsError::UnsupportedDtype(format!("{:?}", other))),
    }
}

/// Loads every tensor of a SafeTensors file. F64 data is narrowed to f32.
pub fn load_safetensors<P: AsRef<Path>>(path: P) -> Result<HashMap<String, Value>> {
    let buffer = fs::read(path)?;
    let tensors = SafeTensors::deserialize(&buffer)?;

    tensors
        .tensors()
        .into_iter()
        .map(|(name, view)| to_value(&view).map(|value| (name, value)))
        .collect()
}

/// Loads the tensor called `name`.
pub fn load_tensor<P: AsRef<Path>>(path: P, name: &str) -> Result<Value> {
    let buffer = fs::read(path)?;
    let tensors = SafeTensors::deserialize(&buffer)?;
    match tensors.tensor(name) {
        Ok(view) => to_value(&view),
        Err(safetensors::SafeTensorError::TensorNotFound(_)) => {
            Err(SafeTensorsError::TensorNotFound(name.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Names of the tensors in a SafeTensors file, sorted.
pub fn list_tensors<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let buffer = fs::read(path)?;
    let tensors = SafeTensors::deserialize(&buffer)?;
    let mut names: Vec<String> = tensors.names().into_iter().cloned().collect();
    names.sort();
    Ok(names)
}
