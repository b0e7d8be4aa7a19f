use std::collections::HashSet;
use std::fmt;

use crate::error::{Error, Result};
use crate::onnx::proto::{data_type, tensor_shape_proto::dimension, type_proto, GraphProto, ModelProto, ValueInfoProto};
use crate::onnx::{default_opset, graph};

/// Scaled dot-product attention in the ViT branch exports to opset 14 ops.
pub const MIN_OPSET: i64 = 14;

/// Structural validation of a model before it is handed to a converter.
pub fn check_model(model: &ModelProto) -> Result<()> {
    if model.ir_version <= 0 {
        return Err(Error::InvalidGraph("ir_version is not set".into()));
    }
    required_opset(model)?;
    check_graph(graph(model)?, &HashSet::new())
}

/// The TF.js export path additionally needs opset [`MIN_OPSET`].
pub fn check_export_opset(model: &ModelProto) -> Result<()> {
    let opset = required_opset(model)?;
    if opset < MIN_OPSET {
        return Err(Error::InvalidGraph(format!("opset {opset} is below the required {MIN_OPSET}")));
    }
    Ok(())
}

fn required_opset(model: &ModelProto) -> Result<i64> {
    default_opset(model).ok_or_else(|| Error::InvalidGraph("no opset imported for the default domain".into()))
}

fn check_graph<'a>(graph: &'a GraphProto, outer: &HashSet<&'a str>) -> Result<()> {
    let mut defined: HashSet<&str> = outer.clone();
    defined.extend(graph.input.iter().map(|i| i.name.as_str()));
    defined.extend(graph.initializer.iter().map(|t| t.name.as_str()));

    for node in &graph.node {
        for input in node.input.iter().filter(|i| !i.is_empty()) {
            if !defined.contains(input.as_str()) {
                return Err(Error::InvalidGraph(format!(
                    "node '{}' ({}) reads undefined value '{}'",
                    node.name, node.op_type, input
                )));
            }
        }
        for attr in &node.attribute {
            for sub in attr.g.iter().chain(attr.graphs.iter()) {
                check_graph(sub, &defined)?;
            }
        }
        for output in node.output.iter().filter(|o| !o.is_empty()) {
            if !defined.insert(output.as_str()) {
                return Err(Error::InvalidGraph(format!("value '{output}' is produced more than once")));
            }
        }
    }

    for output in &graph.output {
        if !defined.contains(output.name.as_str()) {
            return Err(Error::InvalidGraph(format!("graph output '{}' is never produced", output.name)));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub enum Dim {
    Value(i64),
    Param(String),
    Unknown,
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Value(v) => write!(f, "{v}"),
            Dim::Param(p) => write!(f, "{p}"),
            Dim::Unknown => write!(f, "?"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TensorSignature {
    pub name: String,
    pub elem_type: i32,
    pub dims: Vec<Dim>,
}

impl TensorSignature {
    fn from_value_info(info: &ValueInfoProto) -> Self {
        let tensor = info.r#type.as_ref().and_then(|t| match &t.value {
            Some(type_proto::Value::TensorType(tensor)) => Some(tensor),
            _ => None,
        });
        let dims = tensor
            .and_then(|t| t.shape.as_ref())
            .map(|shape| {
                shape
                    .dim
                    .iter()
                    .map(|d| match &d.value {
                        Some(dimension::Value::DimValue(v)) => Dim::Value(*v),
                        Some(dimension::Value::DimParam(p)) => Dim::Param(p.clone()),
                        None => Dim::Unknown,
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self {
            name: info.name.clone(),
            elem_type: tensor.map(|t| t.elem_type).unwrap_or(data_type::UNDEFINED),
            dims,
        }
    }

    pub fn shape_string(&self) -> String {
        let dims: Vec<String> = self.dims.iter().map(|d| d.to_string()).collect();
        format!("[{}]", dims.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GraphSignature {
    pub inputs: Vec<TensorSignature>,
    pub outputs: Vec<TensorSignature>,
}

impl GraphSignature {
    /// Graph inputs that are also initializers are weights, not feeds, and are skipped.
    pub fn of(model: &ModelProto) -> Result<Self> {
        let graph = graph(model)?;
        let weights: HashSet<&str> = graph.initializer.iter().map(|t| t.name.as_str()).collect();
        Ok(Self {
            inputs: graph
                .input
                .iter()
                .filter(|i| !weights.contains(i.name.as_str()))
                .map(TensorSignature::from_value_info)
                .collect(),
            outputs: graph.output.iter().map(TensorSignature::from_value_info).collect(),
        })
    }
}

fn dim_matches(dim: &Dim, expected: i64) -> bool {
    matches!(dim, Dim::Value(v) if *v == expected)
}

// A batch dim may be fixed or symbolic.
fn is_batch_dim(dim: &Dim) -> bool {
    !matches!(dim, Dim::Value(v) if *v < 1)
}

/// Checks the `[N,3,S,S] float32 -> [N,C]` classifier signature.
pub fn expect_classifier(model: &ModelProto, img_size: usize, num_classes: usize) -> Result<GraphSignature> {
    let signature = GraphSignature::of(model)?;
    let [input] = signature.inputs.as_slice() else {
        return Err(Error::Signature(format!("expected one input, found {}", signature.inputs.len())));
    };
    let [output] = signature.outputs.as_slice() else {
        return Err(Error::Signature(format!("expected one output, found {}", signature.outputs.len())));
    };

    let size = img_size as i64;
    let input_ok = input.elem_type == data_type::FLOAT
        && input.dims.len() == 4
        && is_batch_dim(&input.dims[0])
        && dim_matches(&input.dims[1], 3)
        && dim_matches(&input.dims[2], size)
        && dim_matches(&input.dims[3], size);
    if !input_ok {
        return Err(Error::Signature(format!(
            "input '{}' has shape {}, expected [N, 3, {size}, {size}] float32",
            input.name,
            input.shape_string()
        )));
    }

    let output_ok = output.dims.len() == 2
        && is_batch_dim(&output.dims[0])
        && dim_matches(&output.dims[1], num_classes as i64);
    if !output_ok {
        return Err(Error::Signature(format!(
            "output '{}' has shape {}, expected [N, {num_classes}]",
            output.name,
            output.shape_string()
        )));
    }
    Ok(signature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onnx::node;
    use crate::onnx::testing::tiny_classifier;

    #[test]
    fn tiny_classifier_is_valid() {
        check_model(&tiny_classifier()).unwrap();
    }

    #[test]
    fn undefined_input_is_rejected() {
        let mut model = tiny_classifier();
        model.graph.as_mut().unwrap().node[1].input[1] = "missing.weight".into();
        let err = check_model(&model).unwrap_err().to_string();
        assert!(err.contains("missing.weight"), "{err}");
    }

    #[test]
    fn duplicate_output_is_rejected() {
        let mut model = tiny_classifier();
        let graph = model.graph.as_mut().unwrap();
        graph.node.push(node("Identity", "dup", &["scores"], &["features"]));
        assert!(check_model(&model).is_err());
    }

    #[test]
    fn old_opset_is_structurally_valid_but_not_exportable() {
        let mut model = tiny_classifier();
        model.opset_import[0].version = 13;
        check_model(&model).unwrap();
        assert!(check_export_opset(&model).is_err());

        model.opset_import.clear();
        assert!(check_model(&model).is_err());
    }

    #[test]
    fn signature_accepts_symbolic_batch() {
        let signature = expect_classifier(&tiny_classifier(), 8, 9).unwrap();
        assert_eq!(signature.inputs[0].name, "input");
        assert_eq!(signature.inputs[0].dims[0], Dim::Param("batch".into()));
        assert_eq!(signature.outputs[0].shape_string(), "[batch, 9]");
    }

    #[test]
    fn signature_rejects_wrong_class_count() {
        let err = expect_classifier(&tiny_classifier(), 8, 10).unwrap_err();
        assert!(matches!(err, Error::Signature(_)));
        assert!(expect_classifier(&tiny_classifier(), 224, 9).is_err());
    }
}
