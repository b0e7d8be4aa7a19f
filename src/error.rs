use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("checkpoint not found and MODEL_URL not provided, expected at {}", .0.display())]
    CheckpointNotFound(PathBuf),

    #[error("failed to download checkpoint from {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: Box<ureq::Error>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("resize error: {0}")]
    Resize(#[from] fast_image_resize::ResizeError),

    #[error("ONNX Runtime error: {0}")]
    Ort(#[from] ort::Error),

    #[error("shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("unexpected model signature: {0}")]
    Signature(String),

    #[error("label count mismatch: model has {expected} classes, {actual} labels given")]
    LabelCount { expected: usize, actual: usize },

    #[error("failed to decode ONNX model: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("invalid ONNX graph: {0}")]
    InvalidGraph(String),

    #[error("weight loading failed: {0}")]
    WeightMismatch(String),

    #[error("{tool} exited with {status}")]
    Tool { tool: String, status: std::process::ExitStatus },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Poisoned(String),
}

pub type Result<T> = std::result::Result<T, Error>;
