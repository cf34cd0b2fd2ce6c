//! Hyperparameters of the PixelCNN output layer.
//!
//! The defaults describe the classic CIFAR-10 setup: 32x32 RGB images with
//! 256 intensity levels and a 10-component logistic mixture.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

type Result<T> = std::result::Result<T, ConfigError>;

/// Shape and likelihood settings shared by both losses and the sampler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PixelCnnConfig {
    /// Image channels. The mixture parametrisation is written for RGB.
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    /// Intensity levels per sub-pixel.
    pub num_levels: usize,
    /// Logistic components per pixel.
    pub nr_mix: usize,
    /// Floor applied to predicted log-scales.
    pub min_log_scale: f32,
}

impl Default for PixelCnnConfig {
    fn default() -> Self {
        Self {
            channels: 3,
            height: 32,
            width: 32,
            num_levels: 256,
            nr_mix: 10,
            min_log_scale: -7.0,
        }
    }
}

impl PixelCnnConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image_size(mut self, height: usize, width: usize) -> Self {
        self.height = height;
        self.width = width;
        self
    }

    pub fn with_nr_mix(mut self, nr_mix: usize) -> Self {
        self.nr_mix = nr_mix;
        self
    }

    pub fn with_num_levels(mut self, num_levels: usize) -> Self {
        self.num_levels = num_levels;
        self
    }

    /// Reads and validates a JSON config. Missing fields take their defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.channels != 3 {
            return Err(ConfigError::Invalid {
                field: "channels",
                reason: format!("the mixture model is defined for 3 channels, got {}", self.channels),
            });
        }
        if self.height == 0 || self.width == 0 {
            return Err(ConfigError::Invalid {
                field: "height/width",
                reason: format!("image must be non-empty, got {}x{}", self.height, self.width),
            });
        }
        if self.num_levels < 2 {
            return Err(ConfigError::Invalid {
                field: "num_levels",
                reason: format!("need at least 2 levels, got {}", self.num_levels),
            });
        }
        if self.nr_mix == 0 {
            return Err(ConfigError::Invalid {
                field: "nr_mix",
                reason: "need at least one mixture component".to_string(),
            });
        }
        if !self.min_log_scale.is_finite() {
            return Err(ConfigError::Invalid {
                field: "min_log_scale",
                reason: format!("must be finite, got {}", self.min_log_scale),
            });
        }
        Ok(())
    }

    /// Channels of the mixture output: per component one logit plus
    /// mean, log-scale and coefficient for each of the 3 channels.
    pub fn mixture_channels(&self) -> usize {
        10 * self.nr_mix
    }

    /// Channels of the categorical output: `num_levels` logits per sub-pixel.
    pub fn category_channels(&self) -> usize {
        self.channels * self.num_levels
    }

    /// Width of one quantisation bin on the `[-1, 1]` scale.
    pub fn bin_width(&self) -> f32 {
        2.0 / (self.num_levels - 1) as f32
    }

    /// Sub-pixels per image, the denominator of bits/dim.
    pub fn dims(&self) -> usize {
        self.channels * self.height * self.width
    }
}
