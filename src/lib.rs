pub mod checkpoint;
pub mod cli;
pub mod error;
pub mod export;
pub mod labels;
pub mod logging;
pub mod model;
pub mod onnx;
pub mod postprocess;
pub mod preprocess;
pub mod service;

pub use crate::checkpoint::ensure_checkpoint_available;
pub use crate::cli::{Args, ConvertArgs};
pub use crate::error::{Error, Result};
pub use crate::labels::{default_labels, load_class_mapping};
pub use crate::model::{Classify, OnnxClassifier, OnnxModel};
pub use crate::postprocess::{format_predictions, Prediction, PredictionResponse};
pub use crate::preprocess::{PreprocessConfig, Processor};
pub use crate::service::router;
