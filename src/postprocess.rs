use std::cmp::Reverse;

use ndarray::{Array1, ArrayView1};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

/// Applies softmax to a 1D array and returns a new Array1<f32>.
pub fn softmax(slice: ArrayView1<f32>) -> Array1<f32> {
    let max_val = slice.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exp_vals: Array1<f32> = slice.mapv(|x| (x - max_val).exp());
    let sum_exp: f32 = exp_vals.sum();
    exp_vals.mapv(|v| v / sum_exp)
}

/// Pairs each label with the probability at the same output position.
pub fn confidences(labels: &[String], probabilities: &Array1<f32>) -> Vec<(String, f32)> {
    labels
        .iter()
        .cloned()
        .zip(probabilities.iter().copied())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: String,
    pub probability: f32,
}

impl Prediction {
    pub fn unknown() -> Self {
        Self {
            label: "Unknown".to_string(),
            probability: 0.0,
        }
    }
}

/// Body returned by `POST /predict/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResponse {
    pub top1: Prediction,
    #[serde(rename = "topK")]
    pub top_k: Vec<Prediction>,
    pub predictions: Vec<Prediction>,
}

/// Ranks label probabilities in descending order. Ties keep their input order.
pub fn format_predictions<I>(confidences: I) -> PredictionResponse
where
    I: IntoIterator<Item = (String, f32)>,
{
    let mut top_k: Vec<Prediction> = confidences
        .into_iter()
        .map(|(label, probability)| Prediction { label, probability })
        .collect();
    top_k.sort_by_key(|p| Reverse(OrderedFloat(p.probability)));

    let top1 = top_k.first().cloned().unwrap_or_else(Prediction::unknown);
    PredictionResponse {
        top1,
        predictions: top_k.clone(),
        top_k,
    }
}
