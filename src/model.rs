use std::path::Path;
use std::sync::Mutex;

use image::DynamicImage;
use ndarray::{Axis, Ix2};
use ort::execution_providers::{CPUExecutionProvider, CUDAExecutionProvider, ExecutionProviderDispatch};
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::Session;
use ort::value::ValueType;
use tracing::info;

use crate::error::{Error, Result};
use crate::postprocess::{confidences, softmax};
use crate::preprocess::Processor;

pub const OUTPUT_NAME: &str = "logits";

pub struct OnnxModel {
    provider: [ExecutionProviderDispatch; 1],
    threads: Option<usize>,
}

impl OnnxModel {
    pub fn new(cuda: bool, threads: Option<usize>) -> Self {
        let provider = if cuda {
            [CUDAExecutionProvider::default().build().error_on_failure()]
        } else {
            [CPUExecutionProvider::default().build()]
        };
        Self { provider, threads }
    }

    fn builder(&self) -> Result<SessionBuilder> {
        let mut builder = SessionBuilder::new()?
            .with_execution_providers(self.provider.clone())?
            .with_optimization_level(GraphOptimizationLevel::Level3)?;
        if let Some(threads) = self.threads {
            builder = builder.with_intra_threads(threads)?;
        }
        Ok(builder)
    }

    pub fn load_model<P: AsRef<Path>>(&self, model_path: P) -> Result<Session> {
        let model_path = model_path.as_ref();
        info!(path = %model_path.display(), threads = ?self.threads, "Loading ONNX model");
        Ok(self.builder()?.commit_from_file(model_path)?)
    }

    pub fn load_model_from_memory(&self, bytes: &[u8]) -> Result<Session> {
        Ok(self.builder()?.commit_from_memory(bytes)?)
    }
}

/// Image classifier injected into the HTTP handlers.
pub trait Classify: Send + Sync {
    fn labels(&self) -> &[String];

    /// Returns `(label, probability)` pairs in model output order.
    fn classify(&self, image: &DynamicImage) -> Result<Vec<(String, f32)>>;
}

pub struct OnnxClassifier {
    session: Mutex<Session>,
    processor: Processor,
    labels: Vec<String>,
    input_name: String,
    output_name: String,
}

impl OnnxClassifier {
    pub fn new(session: Session, processor: Processor, labels: Vec<String>) -> Result<Self> {
        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .ok_or_else(|| Error::Signature("model has no inputs".into()))?;
        let output = session
            .outputs
            .iter()
            .find(|o| o.name == OUTPUT_NAME)
            .or_else(|| session.outputs.first())
            .ok_or_else(|| Error::Signature("model has no outputs".into()))?;

        if let ValueType::Tensor { dimensions, .. } = &output.output_type {
            check_label_count(dimensions, labels.len())?;
        }

        info!(input = %input_name, output = %output.name, classes = labels.len(), "Model loaded successfully");
        let output_name = output.name.clone();
        Ok(Self {
            session: Mutex::new(session),
            processor,
            labels,
            input_name,
            output_name,
        })
    }
}

/// The class dimension must equal the label count when it is static.
pub fn check_label_count(dimensions: &[i64], labels: usize) -> Result<()> {
    match dimensions.last() {
        Some(&classes) if classes > 0 && classes as usize != labels => Err(Error::LabelCount {
            expected: classes as usize,
            actual: labels,
        }),
        _ => Ok(()),
    }
}

impl Classify for OnnxClassifier {
    fn labels(&self) -> &[String] {
        &self.labels
    }

    fn classify(&self, image: &DynamicImage) -> Result<Vec<(String, f32)>> {
        let xs = self.processor.preprocess(image)?;

        let session = self.session.lock().map_err(|e| Error::Poisoned(e.to_string()))?;
        let ys = session.run(ort::inputs![self.input_name.as_str() => xs.view()]?)?;
        let logits = ys[self.output_name.as_str()].try_extract_tensor::<f32>()?;
        let logits = logits.into_dimensionality::<Ix2>()?;
        if logits.nrows() == 0 {
            return Err(Error::Signature("model returned an empty batch".into()));
        }

        let probabilities = softmax(logits.index_axis(Axis(0), 0));
        Ok(confidences(&self.labels, &probabilities))
    }
}
