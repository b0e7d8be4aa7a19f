use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use leaflens::{
    default_labels, ensure_checkpoint_available, load_class_mapping, router, Args, Classify, OnnxClassifier,
    OnnxModel, PreprocessConfig, Processor,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    leaflens::logging::init()?;
    let args = Args::parse();

    // Load the model once, before accepting traffic.
    let classifier = tokio::task::spawn_blocking({
        let args = args.clone();
        move || -> anyhow::Result<OnnxClassifier> {
            let checkpoint = ensure_checkpoint_available(&args.model_path, args.model_url.as_deref())?;
            let labels = match &args.labels {
                Some(path) => load_class_mapping(path)
                    .with_context(|| format!("failed to read labels from {}", path.display()))?,
                None => default_labels(),
            };
            ort::init().with_name("leaflens").commit()?;
            let session = OnnxModel::new(args.cuda, args.threads).load_model(&checkpoint)?;
            Ok(OnnxClassifier::new(session, Processor::new(PreprocessConfig::default()), labels)?)
        }
    })
    .await??;
    info!(classes = classifier.labels().len(), "Classifier ready");

    let app = router(Arc::new(classifier), args.max_upload_bytes);
    let addr = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Banana Disease Detector API listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    info!("Shutting down");
}
