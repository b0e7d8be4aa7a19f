//! Loads weights from one ONNX file into the graph of another, matching initializers by name.

use std::collections::HashMap;

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::onnx::proto::{ModelProto, TensorProto};
use crate::onnx::{graph, graph_mut};

#[derive(Debug, Clone, PartialEq)]
pub struct ShapeMismatch {
    pub name: String,
    pub expected: Vec<i64>,
    pub found: Vec<i64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    pub loaded: usize,
    /// In the target graph but absent from the weights file.
    pub missing: Vec<String>,
    /// In the weights file but unknown to the target graph.
    pub unexpected: Vec<String>,
    pub mismatched: Vec<ShapeMismatch>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty() && self.mismatched.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "missing keys: {:?}, unexpected keys: {:?}, shape mismatches: {:?}",
            self.missing,
            self.unexpected,
            self.mismatched.iter().map(|m| m.name.as_str()).collect::<Vec<_>>()
        )
    }
}

fn compatible(target: &TensorProto, source: &TensorProto) -> bool {
    target.dims == source.dims && target.data_type == source.data_type
}

/// Copies matching initializers from `source` into `target`.
///
/// In strict mode any missing, unexpected or mis-shaped tensor is an error and
/// `target` is left untouched. Otherwise mismatches are logged and skipped.
pub fn graft_initializers(target: &mut ModelProto, source: &ModelProto, strict: bool) -> Result<LoadReport> {
    let weights: HashMap<&str, &TensorProto> = graph(source)?
        .initializer
        .iter()
        .map(|t| (t.name.as_str(), t))
        .collect();

    let mut report = LoadReport::default();
    let mut known = Vec::new();
    for tensor in &graph(target)?.initializer {
        known.push(tensor.name.as_str());
        match weights.get(tensor.name.as_str()) {
            None => report.missing.push(tensor.name.clone()),
            Some(w) if !compatible(tensor, w) => report.mismatched.push(ShapeMismatch {
                name: tensor.name.clone(),
                expected: tensor.dims.clone(),
                found: w.dims.clone(),
            }),
            Some(_) => report.loaded += 1,
        }
    }
    report.unexpected = weights
        .keys()
        .filter(|name| !known.contains(name))
        .map(|name| name.to_string())
        .collect();
    report.unexpected.sort();

    if strict && !report.is_clean() {
        return Err(Error::WeightMismatch(report.summary()));
    }

    for tensor in &mut graph_mut(target)?.initializer {
        if let Some(w) = weights.get(tensor.name.as_str()) {
            if compatible(tensor, w) {
                *tensor = (*w).clone();
            }
        }
    }

    if report.is_clean() {
        info!(loaded = report.loaded, "All weights loaded");
    } else {
        warn!(
            loaded = report.loaded,
            missing = ?report.missing,
            unexpected = ?report.unexpected,
            mismatched = ?report.mismatched,
            "Weights loaded non-strictly"
        );
    }
    Ok(report)
}
