use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::service::DEFAULT_MAX_UPLOAD_BYTES;

#[derive(Parser, Clone, Debug)]
#[command(author, version, about = "Banana disease classifier API", long_about = None)]
pub struct Args {
    /// ONNX checkpoint path
    #[arg(long, env = "MODEL_PATH", default_value = "best_model.onnx")]
    pub model_path: PathBuf,

    /// URL to download the checkpoint from when it is missing
    #[arg(long, env = "MODEL_URL")]
    pub model_url: Option<String>,

    /// Optional labels file, one class per line
    #[arg(long, env = "LABELS_PATH")]
    pub labels: Option<PathBuf>,

    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "PORT", default_value_t = 8000)]
    pub port: u16,

    #[arg(long, env = "MAX_UPLOAD_BYTES", default_value_t = DEFAULT_MAX_UPLOAD_BYTES)]
    pub max_upload_bytes: usize,

    /// Use the CUDA execution provider
    #[arg(long)]
    pub cuda: bool,

    /// Intra-op threads for ONNX Runtime
    #[arg(long)]
    pub threads: Option<usize>,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Convert the classifier into deployment formats", long_about = None)]
pub struct ConvertArgs {
    #[command(subcommand)]
    pub command: ConvertCommand,
}

#[derive(Subcommand, Debug)]
pub enum ConvertCommand {
    /// ONNX -> NHWC ONNX -> SavedModel -> TF.js, plus export_meta.json
    Export(ExportArgs),
    /// ONNX -> float16 ONNX, optionally also dynamic uint8
    Quantize(QuantizeArgs),
    /// SavedModel or Keras model -> TF.js
    Tfjs(TfjsArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct ExportArgs {
    /// Exported ONNX graph of the classifier
    #[arg(long, default_value = "build_export/banana.onnx")]
    pub onnx: PathBuf,

    /// ONNX file whose initializers replace the graph's weights
    #[arg(long)]
    pub weights: Option<PathBuf>,

    /// Fail on missing, unexpected or mis-shaped weights
    #[arg(long)]
    pub strict: bool,

    #[arg(long, default_value = "build_export")]
    pub work_dir: PathBuf,

    #[arg(long, default_value = "assets/models/banana")]
    pub output: PathBuf,

    #[arg(long, default_value_t = 224)]
    pub img_size: usize,

    #[arg(long, default_value_t = 9)]
    pub num_classes: usize,

    #[arg(long, value_enum, default_value_t = Quantization::None)]
    pub quantize: Quantization,

    /// Skip the ONNX Runtime forward pass check
    #[arg(long)]
    pub no_verify: bool,

    /// Stop after the ONNX artifacts and metadata
    #[arg(long)]
    pub skip_tf: bool,

    #[arg(long, default_value = "onnx-tf")]
    pub onnx_tf: String,

    #[arg(long, default_value = "tensorflowjs_converter")]
    pub tfjs_converter: String,
}

#[derive(clap::Args, Debug, Clone)]
pub struct QuantizeArgs {
    #[arg(long = "in")]
    pub input: PathBuf,

    #[arg(long = "out")]
    pub output: PathBuf,

    /// Also write a dynamic uint8 variant next to the output (`.dyn.onnx`)
    #[arg(long)]
    pub also_dynamic: bool,

    /// Keep float32 graph inputs and outputs in the float16 model
    #[arg(long)]
    pub keep_io_types: bool,
}

#[derive(clap::Args, Debug, Clone)]
pub struct TfjsArgs {
    /// SavedModel directory, `.h5` or `.keras` file
    #[arg(long)]
    pub input: PathBuf,

    #[arg(long)]
    pub output_dir: PathBuf,

    #[arg(long, value_enum, default_value_t = TfjsFormat::Graph)]
    pub format: TfjsFormat,

    #[arg(long, value_enum, default_value_t = Quantization::None)]
    pub quantize: Quantization,

    #[arg(long, default_value = "tensorflowjs_converter")]
    pub tfjs_converter: String,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Quantization {
    None,
    Float16,
    Uint8,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TfjsFormat {
    Graph,
    Layers,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_defaults() {
        let args = Args::try_parse_from(["leaflens"]).unwrap();
        assert_eq!(args.port, 8000);
        assert_eq!(args.max_upload_bytes, DEFAULT_MAX_UPLOAD_BYTES);
        assert!(!args.cuda);
    }

    #[test]
    fn serve_flags_override() {
        let args = Args::try_parse_from([
            "leaflens",
            "--model-path",
            "ckpt/model.onnx",
            "--model-url",
            "https://example.com/model.onnx",
            "--port",
            "9000",
        ])
        .unwrap();
        assert_eq!(args.model_path, PathBuf::from("ckpt/model.onnx"));
        assert_eq!(args.model_url.as_deref(), Some("https://example.com/model.onnx"));
        assert_eq!(args.port, 9000);
    }

    #[test]
    fn quantize_subcommand() {
        let args = ConvertArgs::try_parse_from([
            "leaflens-convert",
            "quantize",
            "--in",
            "build_export/banana.onnx",
            "--out",
            "build_export/banana.fp16.onnx",
            "--also-dynamic",
        ])
        .unwrap();
        let ConvertCommand::Quantize(q) = args.command else {
            panic!("expected quantize");
        };
        assert!(q.also_dynamic);
        assert!(!q.keep_io_types);
        assert_eq!(q.output, PathBuf::from("build_export/banana.fp16.onnx"));
    }

    #[test]
    fn tfjs_rejects_unknown_quantization() {
        let err = ConvertArgs::try_parse_from([
            "leaflens-convert",
            "tfjs",
            "--input",
            "m",
            "--output-dir",
            "o",
            "--quantize",
            "int4",
        ]);
        assert!(err.is_err());
    }
}
