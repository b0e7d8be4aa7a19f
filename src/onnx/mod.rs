//! Native ONNX graph tooling used by the conversion pipelines.

pub mod checker;
pub mod graft;
pub mod layout;
pub mod proto;
pub mod quantize;

use std::fs;
use std::path::Path;

use prost::Message;
use tracing::info;

use crate::error::{Error, Result};
use proto::{attribute_type, data_type, AttributeProto, GraphProto, ModelProto, NodeProto, TensorProto};

pub use checker::{check_export_opset, check_model, expect_classifier, Dim, GraphSignature, TensorSignature};
pub use graft::{graft_initializers, LoadReport};
pub use layout::to_nhwc;

pub fn load_model<P: AsRef<Path>>(path: P) -> Result<ModelProto> {
    let path = path.as_ref();
    let bytes = fs::read(path)?;
    let model = ModelProto::decode(bytes.as_slice())?;
    info!(path = %path.display(), bytes = bytes.len(), "Loaded ONNX graph");
    Ok(model)
}

pub fn save_model<P: AsRef<Path>>(model: &ModelProto, path: P) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let bytes = model.encode_to_vec();
    fs::write(path, &bytes)?;
    info!(path = %path.display(), bytes = bytes.len(), "Saved ONNX graph");
    Ok(())
}

/// Opset version imported for the default (`ai.onnx`) domain.
pub fn default_opset(model: &ModelProto) -> Option<i64> {
    model
        .opset_import
        .iter()
        .find(|o| o.domain.is_empty() || o.domain == "ai.onnx")
        .map(|o| o.version)
}

pub fn graph(model: &ModelProto) -> Result<&GraphProto> {
    model
        .graph
        .as_ref()
        .ok_or_else(|| Error::InvalidGraph("model has no graph".into()))
}

pub fn graph_mut(model: &mut ModelProto) -> Result<&mut GraphProto> {
    model
        .graph
        .as_mut()
        .ok_or_else(|| Error::InvalidGraph("model has no graph".into()))
}

/// Reads a float32 tensor from either `raw_data` or `float_data`.
pub fn tensor_f32(tensor: &TensorProto) -> Result<Vec<f32>> {
    if tensor.data_type != data_type::FLOAT {
        return Err(Error::InvalidGraph(format!(
            "tensor {} has data type {}, expected float32",
            tensor.name, tensor.data_type
        )));
    }
    if !tensor.external_data.is_empty() {
        return Err(Error::InvalidGraph(format!(
            "tensor {} uses external data, which is not supported",
            tensor.name
        )));
    }
    if tensor.raw_data.is_empty() {
        return Ok(tensor.float_data.clone());
    }
    if tensor.raw_data.len() % 4 != 0 {
        return Err(Error::InvalidGraph(format!("tensor {} has truncated raw data", tensor.name)));
    }
    Ok(tensor
        .raw_data
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

pub fn float_tensor(name: &str, dims: Vec<i64>, values: &[f32]) -> TensorProto {
    TensorProto {
        name: name.to_string(),
        dims,
        data_type: data_type::FLOAT,
        raw_data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        ..Default::default()
    }
}

pub fn uint8_tensor(name: &str, dims: Vec<i64>, values: Vec<u8>) -> TensorProto {
    TensorProto {
        name: name.to_string(),
        dims,
        data_type: data_type::UINT8,
        raw_data: values,
        ..Default::default()
    }
}

pub fn node(op_type: &str, name: &str, inputs: &[&str], outputs: &[&str]) -> NodeProto {
    NodeProto {
        op_type: op_type.to_string(),
        name: name.to_string(),
        input: inputs.iter().map(|s| s.to_string()).collect(),
        output: outputs.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

pub fn attr_int(name: &str, value: i64) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        r#type: Some(attribute_type::INT),
        i: Some(value),
        ..Default::default()
    }
}

pub fn attr_ints(name: &str, values: Vec<i64>) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        r#type: Some(attribute_type::INTS),
        ints: values,
        ..Default::default()
    }
}

/// Renames every use of `from` as a node input, descending into subgraphs.
pub(crate) fn rename_input(graph: &mut GraphProto, from: &str, to: &str) {
    for node in &mut graph.node {
        for input in node.input.iter_mut().filter(|i| i.as_str() == from) {
            *input = to.to_string();
        }
        for attr in &mut node.attribute {
            for sub in attr.g.iter_mut().chain(attr.graphs.iter_mut()) {
                rename_input(sub, from, to);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::proto::*;
    use super::*;

    pub fn value_info(name: &str, elem_type: i32, dims: &[i64]) -> ValueInfoProto {
        let dim = dims
            .iter()
            .map(|&d| tensor_shape_proto::Dimension {
                value: Some(if d < 0 {
                    tensor_shape_proto::dimension::Value::DimParam("batch".into())
                } else {
                    tensor_shape_proto::dimension::Value::DimValue(d)
                }),
                ..Default::default()
            })
            .collect();
        ValueInfoProto {
            name: name.to_string(),
            r#type: Some(TypeProto {
                value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                    elem_type,
                    shape: Some(TensorShapeProto { dim }),
                })),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// `input[N,3,8,8] -> Flatten -> MatMul(W) -> Add(B) -> logits[N,9]`, plus an
    /// activation-by-activation MatMul that quantization must leave alone.
    pub fn tiny_classifier() -> ModelProto {
        let features = 3 * 8 * 8;
        let weights: Vec<f32> = (0..features * 9).map(|i| ((i % 17) as f32 - 8.0) / 10.0).collect();
        let bias: Vec<f32> = (0..9).map(|i| i as f32 * 0.01).collect();

        let mut transpose = node("Transpose", "t", &["features"], &["features_t"]);
        transpose.attribute.push(attr_ints("perm", vec![1, 0]));

        let graph = GraphProto {
            name: "tiny".into(),
            node: vec![
                node("Flatten", "flatten", &["input"], &["features"]),
                node("MatMul", "fc", &["features", "fc.weight"], &["fc_out"]),
                node("Add", "fc_bias", &["fc_out", "fc.bias"], &["scores"]),
                transpose,
                node("MatMul", "gram", &["features_t", "features"], &["gram"]),
                node("Identity", "out", &["scores"], &["logits"]),
            ],
            initializer: vec![
                float_tensor("fc.weight", vec![features, 9], &weights),
                float_tensor("fc.bias", vec![9], &bias),
            ],
            input: vec![value_info("input", data_type::FLOAT, &[-1, 3, 8, 8])],
            output: vec![value_info("logits", data_type::FLOAT, &[-1, 9])],
            ..Default::default()
        };

        ModelProto {
            ir_version: 8,
            producer_name: "pytorch".into(),
            opset_import: vec![OperatorSetIdProto { domain: String::new(), version: 17 }],
            graph: Some(graph),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_load_keeps_graph() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tiny.onnx");
        let model = testing::tiny_classifier();

        save_model(&model, &path).unwrap();
        let loaded = load_model(&path).unwrap();
        assert_eq!(loaded, model);
    }

    #[test]
    fn tensor_f32_reads_both_encodings() {
        let raw = float_tensor("w", vec![2], &[1.5, -2.0]);
        assert_eq!(tensor_f32(&raw).unwrap(), vec![1.5, -2.0]);

        let typed = TensorProto {
            data_type: data_type::FLOAT,
            float_data: vec![0.25],
            ..Default::default()
        };
        assert_eq!(tensor_f32(&typed).unwrap(), vec![0.25]);

        let ints = TensorProto { data_type: data_type::INT64, ..Default::default() };
        assert!(tensor_f32(&ints).is_err());
    }

    #[test]
    fn default_opset_accepts_both_domain_spellings() {
        let mut model = testing::tiny_classifier();
        assert_eq!(default_opset(&model), Some(17));
        model.opset_import[0].domain = "ai.onnx".into();
        assert_eq!(default_opset(&model), Some(17));
        model.opset_import.clear();
        assert_eq!(default_opset(&model), None);
    }

    #[test]
    fn zero_valued_attribute_survives_reencoding() {
        // name="axis", i=0, type=INT, in field-number order.
        let bytes = [0x0a, 0x04, b'a', b'x', b'i', b's', 0x18, 0x00, 0xa0, 0x01, 0x02];
        let attr = AttributeProto::decode(&bytes[..]).unwrap();
        assert_eq!(attr.i, Some(0));
        assert_eq!(attr.r#type, Some(attribute_type::INT));
        assert_eq!(attr.encode_to_vec(), bytes);
        assert_eq!(attr_int("axis", 0).encode_to_vec(), bytes);
    }

    #[test]
    fn zero_axis_kept_through_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("concat.onnx");
        let mut model = testing::tiny_classifier();
        let mut concat = node("Concat", "cat", &["scores", "scores"], &["pair"]);
        concat.attribute.push(attr_int("axis", 0));
        graph_mut(&mut model).unwrap().node.push(concat);

        save_model(&model, &path).unwrap();
        let loaded = load_model(&path).unwrap();
        let cat = graph(&loaded).unwrap().node.last().unwrap();
        assert_eq!(cat.attribute[0].i, Some(0));
        assert_eq!(loaded, model);
    }
}
