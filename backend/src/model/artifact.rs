use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ModelLoadError {
    #[error("Failed to read model artifact: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed model artifact: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid model: {0}")]
    Invalid(String),
}

/// On-disk description of the pretrained network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub name: String,
    #[serde(default = "default_classes")]
    pub classes: Vec<String>,
    #[serde(default = "default_input_size")]
    pub input_size: u32,
    #[serde(default)]
    pub normalization: Normalization,
    pub target_layer: String,
    pub layers: Vec<LayerSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Normalization {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Default for Normalization {
    fn default() -> Self {
        Self {
            mean: [0.0; 3],
            std: [1.0; 3],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerSpec {
    Conv2d {
        name: String,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        #[serde(default = "default_stride")]
        stride: usize,
        #[serde(default)]
        padding: usize,
        weight: Vec<f32>,
        bias: Vec<f32>,
    },
    Relu {
        name: String,
    },
    MaxPool2d {
        name: String,
        kernel_size: usize,
        stride: usize,
    },
    GlobalAvgPool {
        name: String,
    },
    Linear {
        name: String,
        in_features: usize,
        out_features: usize,
        weight: Vec<f32>,
        bias: Vec<f32>,
    },
}

impl LayerSpec {
    pub fn name(&self) -> &str {
        match self {
            LayerSpec::Conv2d { name, .. }
            | LayerSpec::Relu { name }
            | LayerSpec::MaxPool2d { name, .. }
            | LayerSpec::GlobalAvgPool { name }
            | LayerSpec::Linear { name, .. } => name,
        }
    }
}

fn default_classes() -> Vec<String> {
    vec!["cancer".into(), "normal".into()]
}

fn default_input_size() -> u32 {
    crate::pipeline::preprocess::INPUT_SIZE
}

fn default_stride() -> usize {
    1
}

impl ModelArtifact {
    pub fn from_json(json: &str) -> Result<Self, ModelLoadError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelLoadError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}
