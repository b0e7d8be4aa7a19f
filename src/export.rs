//! One-shot conversion pipelines. Every step must succeed; the first failure aborts the run.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use ndarray::Array4;
use ort::session::Session;
use prost::Message;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cli::{ExportArgs, Quantization, QuantizeArgs, TfjsArgs, TfjsFormat};
use crate::error::{Error, Result};
use crate::model::{OnnxModel, OUTPUT_NAME};
use crate::onnx::layout::{INPUT_LAYOUT, INTERNAL_LAYOUT};
use crate::onnx::quantize::{quantize_dynamic, to_float16};
use crate::onnx::{check_export_opset, check_model, expect_classifier, graft_initializers, load_model, save_model, to_nhwc};
use crate::preprocess::PreprocessConfig;

pub const META_FILE: &str = "export_meta.json";

/// Sidecar read by the web/mobile frontend next to the TF.js model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportMeta {
    pub img_size: usize,
    pub num_classes: usize,
    pub mean: [f32; 3],
    pub std: [f32; 3],
    pub input_layout: String,
    pub internal_layout: String,
    pub output: String,
}

impl ExportMeta {
    pub fn new(img_size: usize, num_classes: usize, preprocess: &PreprocessConfig) -> Self {
        Self {
            img_size,
            num_classes,
            mean: preprocess.mean,
            std: preprocess.std,
            input_layout: INPUT_LAYOUT.to_string(),
            internal_layout: INTERNAL_LAYOUT.to_string(),
            output: OUTPUT_NAME.to_string(),
        }
    }

    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join(META_FILE);
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }
}

/// Runs the graph once on a seeded random input and checks the logits.
pub fn verify_forward(session: &Session, img_size: usize, num_classes: usize) -> Result<Vec<f32>> {
    let input_name = session
        .inputs
        .first()
        .map(|i| i.name.clone())
        .ok_or_else(|| Error::Signature("model has no inputs".into()))?;
    let output_name = session
        .outputs
        .first()
        .map(|o| o.name.clone())
        .ok_or_else(|| Error::Signature("model has no outputs".into()))?;

    let mut rng = StdRng::seed_from_u64(0);
    let dummy = Array4::from_shape_fn((1, 3, img_size, img_size), |_| rng.gen_range(-1.0f32..1.0));
    let ys = session.run(ort::inputs![input_name.as_str() => dummy.view()]?)?;
    let logits = ys[output_name.as_str()].try_extract_tensor::<f32>()?;

    if logits.shape() != [1, num_classes] {
        return Err(Error::Signature(format!(
            "forward pass produced shape {:?}, expected [1, {num_classes}]",
            logits.shape()
        )));
    }
    if logits.iter().any(|v| !v.is_finite()) {
        return Err(Error::Signature("forward pass produced non-finite logits".into()));
    }
    Ok(logits.iter().copied().collect())
}

pub fn run_tool(program: &str, args: &[String]) -> Result<()> {
    info!("Running: {} {}", program, args.join(" "));
    let status = Command::new(program).args(args).status()?;
    if !status.success() {
        return Err(Error::Tool { tool: program.to_string(), status });
    }
    Ok(())
}

fn quantize_flag(quantize: Quantization) -> Option<&'static str> {
    match quantize {
        Quantization::None => None,
        Quantization::Float16 => Some("--quantize_float16"),
        Quantization::Uint8 => Some("--quantize_uint8"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelSource {
    SavedModel,
    KerasH5,
    Keras,
}

impl ModelSource {
    pub fn detect(path: &Path) -> Result<Self> {
        if path.is_dir() {
            return Ok(Self::SavedModel);
        }
        match path.extension().and_then(|e| e.to_str()).map(str::to_lowercase).as_deref() {
            Some("h5") => Ok(Self::KerasH5),
            Some("keras") => Ok(Self::Keras),
            _ => Err(Error::Signature(format!(
                "{} is neither a SavedModel directory nor a .h5/.keras file",
                path.display()
            ))),
        }
    }

    fn input_format(self) -> &'static str {
        match self {
            Self::SavedModel => "tf_saved_model",
            Self::KerasH5 => "keras",
            Self::Keras => "keras_keras",
        }
    }
}

/// Arguments for `tensorflowjs_converter`.
pub fn converter_args(
    source: ModelSource,
    format: TfjsFormat,
    quantize: Quantization,
    input: &Path,
    output: &Path,
) -> Result<Vec<String>> {
    let output_format = match (format, source) {
        (TfjsFormat::Graph, _) => "tfjs_graph_model",
        (TfjsFormat::Layers, ModelSource::SavedModel) => {
            return Err(Error::Signature("layers output needs a Keras model as input".into()));
        }
        (TfjsFormat::Layers, _) => "tfjs_layers_model",
    };

    let mut args = vec![
        format!("--input_format={}", source.input_format()),
        format!("--output_format={output_format}"),
    ];
    if source == ModelSource::SavedModel {
        args.push("--signature_name=serving_default".into());
        args.push("--saved_model_tags=serve".into());
    }
    args.extend(quantize_flag(quantize).map(String::from));
    args.push(input.display().to_string());
    args.push(output.display().to_string());
    Ok(args)
}

/// `banana.fp16.onnx` -> `banana.fp16.dyn.onnx`.
pub fn dynamic_output_path(output: &Path) -> PathBuf {
    let name = output.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let dynamic = match name.strip_suffix(".onnx") {
        Some(stem) => format!("{stem}.dyn.onnx"),
        None => format!("{name}.dyn.onnx"),
    };
    output.with_file_name(dynamic)
}

/// ONNX -> (weights) -> check -> verify -> NHWC ONNX -> SavedModel -> TF.js -> metadata.
pub fn export(args: &ExportArgs) -> Result<()> {
    info!(onnx = %args.onnx.display(), "Loading ONNX graph");
    let mut model = load_model(&args.onnx)?;

    if let Some(weights) = &args.weights {
        info!(weights = %weights.display(), strict = args.strict, "Loading weights");
        let source = load_model(weights)?;
        let report = graft_initializers(&mut model, &source, args.strict)?;
        info!("Missing keys: {:?} Unexpected: {:?}", report.missing, report.unexpected);
    }

    check_model(&model)?;
    check_export_opset(&model)?;
    expect_classifier(&model, args.img_size, args.num_classes)?;
    info!("ONNX check passed");

    if args.no_verify {
        warn!("Skipping ONNX Runtime forward pass");
    } else {
        let session = OnnxModel::new(false, None).load_model_from_memory(&model.encode_to_vec())?;
        let logits = verify_forward(&session, args.img_size, args.num_classes)?;
        info!(?logits, "Forward pass verified");
    }

    to_nhwc(&mut model)?;
    let nhwc_path = args.work_dir.join("banana.nhwc.onnx");
    save_model(&model, &nhwc_path)?;

    if args.skip_tf {
        warn!("Skipping SavedModel and TF.js conversion");
    } else {
        let saved_model = args.work_dir.join("saved_model");
        if saved_model.exists() {
            fs::remove_dir_all(&saved_model)?;
        }
        info!(saved_model = %saved_model.display(), "Converting ONNX -> TensorFlow SavedModel");
        run_tool(
            &args.onnx_tf,
            &[
                "convert".to_string(),
                "-i".to_string(),
                nhwc_path.display().to_string(),
                "-o".to_string(),
                saved_model.display().to_string(),
            ],
        )?;

        fs::create_dir_all(&args.output)?;
        info!("Converting to TFJS graph model ...");
        let converter = converter_args(
            ModelSource::SavedModel,
            TfjsFormat::Graph,
            args.quantize,
            &saved_model,
            &args.output,
        )?;
        run_tool(&args.tfjs_converter, &converter)?;
        info!(output = %args.output.display(), "TFJS export complete");
    }

    let preprocess = PreprocessConfig { height: args.img_size, width: args.img_size, ..Default::default() };
    let meta_path = ExportMeta::new(args.img_size, args.num_classes, &preprocess).write(&args.output)?;
    info!(meta = %meta_path.display(), "Done");
    Ok(())
}

/// Writes the float16 model and, when asked, a dynamic uint8 variant of the float32 input.
pub fn quantize(args: &QuantizeArgs) -> Result<Vec<PathBuf>> {
    info!(input = %args.input.display(), "Loading ONNX");
    let model = load_model(&args.input)?;
    check_model(&model)?;

    let mut written = Vec::new();
    let mut fp16 = model.clone();
    to_float16(&mut fp16, args.keep_io_types)?;
    save_model(&fp16, &args.output)?;
    written.push(args.output.clone());

    if args.also_dynamic {
        let dynamic_path = dynamic_output_path(&args.output);
        info!(output = %dynamic_path.display(), "Applying dynamic quant to linear ops");
        let mut dynamic = model;
        quantize_dynamic(&mut dynamic)?;
        save_model(&dynamic, &dynamic_path)?;
        written.push(dynamic_path);
    }
    Ok(written)
}

pub fn tfjs(args: &TfjsArgs) -> Result<()> {
    let source = ModelSource::detect(&args.input)?;
    fs::create_dir_all(&args.output_dir)?;
    info!(input = %args.input.display(), ?source, "Converting to TensorFlow.js");
    let converter = converter_args(source, args.format, args.quantize, &args.input, &args.output_dir)?;
    run_tool(&args.tfjs_converter, &converter)?;
    info!(output = %args.output_dir.display(), "Done");
    Ok(())
}
