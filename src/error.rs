//! Crate-level error type for the PixelCNN entry points.

use crate::config::ConfigError;
use crate::runtime::session::SessionError;
use crate::serialization::SafeTensorsError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PixelCnnError {
    #[error("Unknown loss kind '{0}', expected 'category' or 'mixture'")]
    UnknownLossKind(String),

    #[error("Shape mismatch for '{name}': expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Mixture has {requested} components but the configuration expects {configured}")]
    MixtureCount { requested: usize, configured: usize },

    #[error("Tensor '{0}' is required but was not provided")]
    MissingTensor(&'static str),

    #[error("Configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Graph execution: {0}")]
    Session(#[from] SessionError),

    #[error("SafeTensors: {0}")]
    SafeTensors(#[from] SafeTensorsError),
}

pub type Result<T> = std::result::Result<T, PixelCnnError>;
