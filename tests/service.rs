//! HTTP behaviour of the router with a stub classifier in place of ONNX Runtime.

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use image::{DynamicImage, GrayImage, ImageFormat, Luma, RgbImage};
use serde_json::Value;
use tower::ServiceExt;

use leaflens::service::DEFAULT_MAX_UPLOAD_BYTES;
use leaflens::{default_labels, router, Classify, Error};

const BOUNDARY: &str = "leaflens-test-boundary";

struct StubClassifier {
    labels: Vec<String>,
    calls: AtomicUsize,
}

impl StubClassifier {
    fn new() -> Self {
        Self { labels: default_labels(), calls: AtomicUsize::new(0) }
    }
}

impl Classify for StubClassifier {
    fn labels(&self) -> &[String] {
        &self.labels
    }

    fn classify(&self, image: &DynamicImage) -> leaflens::Result<Vec<(String, f32)>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(image.width() > 0);
        let probs = [0.01, 0.02, 0.03, 0.04, 0.05, 0.10, 0.60, 0.10, 0.05];
        Ok(self.labels.iter().cloned().zip(probs).collect())
    }
}

struct FailingClassifier(Vec<String>);

impl Classify for FailingClassifier {
    fn labels(&self) -> &[String] {
        &self.0
    }

    fn classify(&self, _image: &DynamicImage) -> leaflens::Result<Vec<(String, f32)>> {
        Err(Error::Signature("model exploded".into()))
    }
}

fn app(classifier: Arc<dyn Classify>) -> Router {
    router(classifier, DEFAULT_MAX_UPLOAD_BYTES)
}

fn png_bytes(image: DynamicImage) -> Vec<u8> {
    let mut buf = Vec::new();
    image.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png).unwrap();
    buf
}

fn multipart_request(uri: &str, field: &str, contents: &[u8]) -> Request<Body> {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
    body.extend_from_slice(
        format!("Content-Disposition: form-data; name=\"{field}\"; filename=\"leaf.png\"\r\n").as_bytes(),
    );
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(contents);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
        .body(Body::from(body))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn root_reports_status() {
    let response = app(Arc::new(StubClassifier::new()))
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    assert_eq!(json["status"], "Banana Disease Detector API is running");
    assert_eq!(json["model_status"], "Loaded");
}

#[tokio::test]
async fn predict_returns_ranked_predictions() {
    let classifier = Arc::new(StubClassifier::new());
    let png = png_bytes(DynamicImage::ImageRgb8(RgbImage::new(40, 30)));
    let response = app(classifier.clone())
        .oneshot(multipart_request("/predict/", "file", &png))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    assert_eq!(json["top1"]["label"], "Healthy Banana");
    assert_eq!(json["top1"], json["topK"][0]);
    assert_eq!(json["predictions"], json["topK"]);

    let top_k = json["topK"].as_array().unwrap();
    assert_eq!(top_k.len(), 9);
    let probs: Vec<f64> = top_k.iter().map(|p| p["probability"].as_f64().unwrap()).collect();
    assert!(probs.windows(2).all(|w| w[0] >= w[1]));
    assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn predict_accepts_grayscale_upload_without_trailing_slash() {
    let classifier = Arc::new(StubClassifier::new());
    let png = png_bytes(DynamicImage::ImageLuma8(GrayImage::from_pixel(16, 16, Luma([200]))));
    let response = app(classifier.clone())
        .oneshot(multipart_request("/predict", "file", &png))
        .await
        .unwrap();

    let json = json_body(response).await;
    assert!(json.get("error").is_none(), "{json}");
    assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn malformed_upload_returns_error_json() {
    let classifier = Arc::new(StubClassifier::new());
    let response = app(classifier.clone())
        .oneshot(multipart_request("/predict/", "file", b"definitely not an image"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    assert_eq!(json["error"], "Prediction failed due to server error.");
    assert!(json.get("top1").is_none());
    assert_eq!(classifier.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn inference_failure_returns_error_json() {
    let png = png_bytes(DynamicImage::ImageRgb8(RgbImage::new(8, 8)));
    let response = app(Arc::new(FailingClassifier(default_labels())))
        .oneshot(multipart_request("/predict/", "file", &png))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["error"], "Prediction failed due to server error.");
}

#[tokio::test]
async fn missing_file_field_is_unprocessable() {
    let response = app(Arc::new(StubClassifier::new()))
        .oneshot(multipart_request("/predict/", "image", b"whatever"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert!(json_body(response).await["error"].is_string());
}

#[tokio::test]
async fn non_multipart_body_returns_error_json() {
    let classifier = Arc::new(StubClassifier::new());
    let request = Request::builder()
        .method("POST")
        .uri("/predict/")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{}"))
        .unwrap();
    let response = app(classifier.clone()).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["error"], "Prediction failed due to server error.");

    let request = Request::builder()
        .method("POST")
        .uri("/predict")
        .header(header::CONTENT_TYPE, "multipart/form-data")
        .body(Body::from("no boundary"))
        .unwrap();
    let response = app(classifier.clone()).oneshot(request).await.unwrap();
    assert_eq!(json_body(response).await["error"], "Prediction failed due to server error.");
    assert_eq!(classifier.calls.load(Ordering::SeqCst), 0);
}
