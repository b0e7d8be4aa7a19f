//! HTTP API: `GET /` and `POST /predict/`.

use std::sync::Arc;

use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use crate::model::Classify;
use crate::postprocess::{format_predictions, PredictionResponse};

pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;
const PREDICTION_FAILED: &str = "Prediction failed due to server error.";

#[derive(Clone)]
pub struct AppState {
    classifier: Arc<dyn Classify>,
}

impl AppState {
    pub fn new(classifier: Arc<dyn Classify>) -> Self {
        Self { classifier }
    }
}

pub fn router(classifier: Arc<dyn Classify>, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/predict/", post(predict))
        .route("/predict", post(predict))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(AppState::new(classifier))
}

async fn root() -> impl IntoResponse {
    Json(json!({
        "status": "Banana Disease Detector API is running",
        "model_status": "Loaded",
    }))
}

async fn predict(State(state): State<AppState>, multipart: Result<Multipart, MultipartRejection>) -> Response {
    let multipart = match multipart {
        Ok(multipart) => multipart,
        Err(rejection) => {
            error!(error = %rejection, "Inference Error: request is not a multipart upload");
            return prediction_failed();
        }
    };
    let contents = match read_file_field(multipart).await {
        Ok(Some(bytes)) => bytes,
        Ok(None) => {
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({ "error": "Missing multipart field `file`." })),
            )
                .into_response();
        }
        Err(e) => {
            error!(error = %e, "Inference Error: failed to read upload");
            return prediction_failed();
        }
    };
    debug!(bytes = contents.len(), "Received image");

    let classifier = state.classifier.clone();
    let result = tokio::task::spawn_blocking(move || -> crate::Result<PredictionResponse> {
        let image = image::load_from_memory(&contents)?;
        let confidences = classifier.classify(&image)?;
        Ok(format_predictions(confidences))
    })
    .await;

    match result {
        Ok(Ok(response)) => Json(response).into_response(),
        Ok(Err(e)) => {
            error!(error = %e, "Inference Error");
            prediction_failed()
        }
        Err(e) => {
            error!(error = %e, "Inference Error: worker task failed");
            prediction_failed()
        }
    }
}

async fn read_file_field(mut multipart: Multipart) -> Result<Option<Vec<u8>>, MultipartError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some("file") {
            return Ok(Some(field.bytes().await?.to_vec()));
        }
    }
    Ok(None)
}

// Failures stay HTTP 200 so the app can read the body.
fn prediction_failed() -> Response {
    (StatusCode::OK, Json(json!({ "error": PREDICTION_FAILED }))).into_response()
}
