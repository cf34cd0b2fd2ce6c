//! Tensor file I/O.
//!
//! Only the SafeTensors container is supported; JSON is used for
//! [`crate::config::PixelCnnConfig`] and lives there.

pub mod safetensors_io;

pub use safetensors_io::{list_tensors, load_safetensors, load_tensor, save_safetensors, SafeTensorsError};
