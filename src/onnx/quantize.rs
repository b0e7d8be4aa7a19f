//! Weight precision reduction: float16 conversion and dynamic uint8 quantization.

use std::collections::{HashMap, HashSet};

use half::f16;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::onnx::proto::{data_type, type_proto, GraphProto, ModelProto, TensorProto, ValueInfoProto};
use crate::onnx::{attr_int, default_opset, float_tensor, graph_mut, node, rename_input, tensor_f32, uint8_tensor};

/// Smallest positive float16 subnormal.
const F16_MIN_POSITIVE: f32 = 5.96e-08;
const F16_MAX_FINITE: f32 = 65504.0;

/// `DynamicQuantizeLinear` first appears in opset 11.
const DYNAMIC_QUANT_MIN_OPSET: i64 = 11;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Float16Report {
    pub tensors: usize,
    pub casts: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DynamicReport {
    pub quantized: usize,
    pub skipped: usize,
}

/// Clamps into the float16 finite range and flushes tiny magnitudes to the smallest subnormal.
pub fn clamp_to_f16(v: f32) -> f16 {
    let v = if v > 0.0 && v < F16_MIN_POSITIVE {
        F16_MIN_POSITIVE
    } else if v < 0.0 && v > -F16_MIN_POSITIVE {
        -F16_MIN_POSITIVE
    } else if v > F16_MAX_FINITE && v.is_finite() {
        F16_MAX_FINITE
    } else if v < -F16_MAX_FINITE && v.is_finite() {
        -F16_MAX_FINITE
    } else {
        v
    };
    f16::from_f32(v)
}

fn tensor_to_f16(tensor: &mut TensorProto) -> Result<bool> {
    if tensor.data_type != data_type::FLOAT {
        return Ok(false);
    }
    let values = tensor_f32(tensor)?;
    tensor.raw_data = values
        .iter()
        .flat_map(|&v| clamp_to_f16(v).to_le_bytes())
        .collect();
    tensor.float_data.clear();
    tensor.data_type = data_type::FLOAT16;
    Ok(true)
}

fn value_info_to_f16(info: &mut ValueInfoProto) {
    if let Some(type_proto::Value::TensorType(tensor)) = info.r#type.as_mut().and_then(|t| t.value.as_mut()) {
        if tensor.elem_type == data_type::FLOAT {
            tensor.elem_type = data_type::FLOAT16;
        }
    }
}

fn is_float(info: &ValueInfoProto) -> bool {
    matches!(
        info.r#type.as_ref().and_then(|t| t.value.as_ref()),
        Some(type_proto::Value::TensorType(tensor)) if tensor.elem_type == data_type::FLOAT
    )
}

fn graph_to_f16(graph: &mut GraphProto, convert_io: bool) -> Result<usize> {
    let converted: Vec<bool> = graph
        .initializer
        .par_iter_mut()
        .map(tensor_to_f16)
        .collect::<Result<_>>()?;
    let mut count = converted.into_iter().filter(|&c| c).count();

    for node in &mut graph.node {
        let is_cast = node.op_type == "Cast" && node.domain.is_empty();
        for attr in &mut node.attribute {
            if is_cast && attr.name == "to" && attr.i == Some(i64::from(data_type::FLOAT)) {
                attr.i = Some(i64::from(data_type::FLOAT16));
            }
            if let Some(t) = attr.t.as_mut() {
                count += usize::from(tensor_to_f16(t)?);
            }
            for t in &mut attr.tensors {
                count += usize::from(tensor_to_f16(t)?);
            }
            for sub in attr.g.iter_mut().chain(attr.graphs.iter_mut()) {
                count += graph_to_f16(sub, true)?;
            }
        }
    }

    graph.value_info.iter_mut().for_each(value_info_to_f16);
    // Inputs backed by an initializer follow the tensor's new type.
    let weights: HashSet<&str> = graph.initializer.iter().map(|t| t.name.as_str()).collect();
    graph
        .input
        .iter_mut()
        .filter(|i| convert_io || weights.contains(i.name.as_str()))
        .for_each(value_info_to_f16);
    if convert_io {
        graph.output.iter_mut().for_each(value_info_to_f16);
    }
    Ok(count)
}

fn cast_to(name: &str, input: &str, output: &str, to: i32) -> crate::onnx::proto::NodeProto {
    let mut cast = node("Cast", name, &[input], &[output]);
    cast.attribute.push(attr_int("to", i64::from(to)));
    cast
}

/// Converts float32 weights and value types to float16.
///
/// With `keep_io_types` the graph keeps float32 inputs and outputs and casts at
/// the boundary.
pub fn to_float16(model: &mut ModelProto, keep_io_types: bool) -> Result<Float16Report> {
    let graph = graph_mut(model)?;
    let tensors = graph_to_f16(graph, !keep_io_types)?;
    let mut casts = 0;

    if keep_io_types {
        let weights: HashSet<String> = graph.initializer.iter().map(|t| t.name.clone()).collect();
        let float_inputs: Vec<String> = graph
            .input
            .iter()
            .filter(|i| is_float(i) && !weights.contains(&i.name))
            .map(|i| i.name.clone())
            .collect();
        let float_outputs: Vec<String> = graph
            .output
            .iter()
            .filter(|o| is_float(o))
            .map(|o| o.name.clone())
            .collect();

        for name in float_inputs.iter().rev() {
            let internal = format!("{name}_fp16");
            rename_input(graph, name, &internal);
            graph.node.insert(0, cast_to(&format!("{name}_cast"), name, &internal, data_type::FLOAT16));
            casts += 1;
        }
        for name in &float_outputs {
            let internal = format!("{name}_fp16");
            for output in graph.node.iter_mut().flat_map(|n| n.output.iter_mut()) {
                if output == name {
                    *output = internal.clone();
                }
            }
            rename_input(graph, name, &internal);
            graph.node.push(cast_to(&format!("{name}_cast"), &internal, name, data_type::FLOAT));
            casts += 1;
        }
    }

    info!(tensors, casts, keep_io_types, "Converted model to float16");
    Ok(Float16Report { tensors, casts })
}

/// Asymmetric per-tensor uint8 quantization over a range that always contains zero.
pub fn quantize_weight(values: &[f32]) -> (Vec<u8>, f32, u8) {
    let rmin = values.iter().fold(0.0f32, |a, &b| a.min(b));
    let rmax = values.iter().fold(0.0f32, |a, &b| a.max(b));
    let scale = if rmax > rmin { (rmax - rmin) / 255.0 } else { 1.0 };
    let zero_point = (-rmin / scale).round().clamp(0.0, 255.0) as u8;
    let quantized = values
        .iter()
        .map(|&v| ((v / scale).round() + zero_point as f32).clamp(0.0, 255.0) as u8)
        .collect();
    (quantized, scale, zero_point)
}

struct QuantizedTensor {
    value: String,
    scale: String,
    zero_point: String,
}

fn referenced_values(graph: &GraphProto, into: &mut HashSet<String>) {
    for node in &graph.node {
        into.extend(node.input.iter().cloned());
        for attr in &node.attribute {
            for sub in attr.g.iter().chain(attr.graphs.iter()) {
                referenced_values(sub, into);
            }
        }
    }
    into.extend(graph.output.iter().map(|o| o.name.clone()));
}

/// Rewrites `MatMul(A, W)` with a 2-D float32 initializer `W` as
/// `DynamicQuantizeLinear(A) -> MatMulInteger -> Cast -> Mul(scale_a * scale_w)`.
pub fn quantize_dynamic(model: &mut ModelProto) -> Result<DynamicReport> {
    let opset = default_opset(model).unwrap_or(0);
    if opset < DYNAMIC_QUANT_MIN_OPSET {
        return Err(Error::InvalidGraph(format!(
            "dynamic quantization needs opset {DYNAMIC_QUANT_MIN_OPSET}, model has {opset}"
        )));
    }
    let graph = graph_mut(model)?;

    let weights: HashMap<String, usize> = graph
        .initializer
        .iter()
        .enumerate()
        .map(|(i, t)| (t.name.clone(), i))
        .collect();
    let mut new_initializers = Vec::new();
    let mut quantized_weights: HashMap<String, QuantizedTensor> = HashMap::new();
    let mut quantized_activations: HashMap<String, QuantizedTensor> = HashMap::new();
    let mut report = DynamicReport::default();
    let mut nodes = Vec::with_capacity(graph.node.len());

    for matmul in std::mem::take(&mut graph.node) {
        let eligible = matmul.op_type == "MatMul"
            && matmul.domain.is_empty()
            && matmul.input.len() == 2
            && weights
                .get(&matmul.input[1])
                .map(|&i| &graph.initializer[i])
                .is_some_and(|w| w.data_type == data_type::FLOAT && w.dims.len() == 2);
        if !eligible {
            if matmul.op_type == "MatMul" {
                report.skipped += 1;
            }
            nodes.push(matmul);
            continue;
        }

        let (activation, weight_name) = (&matmul.input[0], &matmul.input[1]);
        if !quantized_weights.contains_key(weight_name) {
            let weight = &graph.initializer[weights[weight_name]];
            let (values, scale, zero_point) = quantize_weight(&tensor_f32(weight)?);
            let q = QuantizedTensor {
                value: format!("{weight_name}_quantized"),
                scale: format!("{weight_name}_scale"),
                zero_point: format!("{weight_name}_zero_point"),
            };
            new_initializers.push(uint8_tensor(&q.value, weight.dims.clone(), values));
            new_initializers.push(float_tensor(&q.scale, vec![], &[scale]));
            new_initializers.push(uint8_tensor(&q.zero_point, vec![], vec![zero_point]));
            debug!(weight = %weight_name, scale, zero_point, "Quantized weight");
            quantized_weights.insert(weight_name.clone(), q);
        }
        if !quantized_activations.contains_key(activation) {
            let q = QuantizedTensor {
                value: format!("{activation}_quantized"),
                scale: format!("{activation}_scale"),
                zero_point: format!("{activation}_zero_point"),
            };
            nodes.push(node(
                "DynamicQuantizeLinear",
                &format!("{activation}_QuantizeLinear"),
                &[activation.as_str()],
                &[q.value.as_str(), q.scale.as_str(), q.zero_point.as_str()],
            ));
            quantized_activations.insert(activation.clone(), q);
        }

        let a = &quantized_activations[activation];
        let w = &quantized_weights[weight_name];
        let output = &matmul.output[0];
        let prefix = if matmul.name.is_empty() { output.clone() } else { matmul.name.clone() };
        let int_out = format!("{output}_output_quantized");
        let float_out = format!("{output}_output_quantized_cast_output");
        let scale_out = format!("{output}_scales_mul_output");

        nodes.push(node(
            "MatMulInteger",
            &format!("{prefix}_quant"),
            &[a.value.as_str(), w.value.as_str(), a.zero_point.as_str(), w.zero_point.as_str()],
            &[int_out.as_str()],
        ));
        nodes.push(cast_to(&format!("{prefix}_output_quantized_cast"), &int_out, &float_out, data_type::FLOAT));
        nodes.push(node("Mul", &format!("{prefix}_scales_mul"), &[a.scale.as_str(), w.scale.as_str()], &[scale_out.as_str()]));
        nodes.push(node("Mul", &format!("{prefix}_output_scale_mul"), &[float_out.as_str(), scale_out.as_str()], &[output.as_str()]));
        report.quantized += 1;
    }
    graph.node = nodes;

    let mut referenced = HashSet::new();
    referenced_values(graph, &mut referenced);
    let removed: HashSet<String> = quantized_weights
        .keys()
        .filter(|name| !referenced.contains(*name))
        .cloned()
        .collect();
    graph.initializer.retain(|t| !removed.contains(&t.name));
    graph.input.retain(|i| !removed.contains(&i.name));
    graph.initializer.extend(new_initializers);

    info!(quantized = report.quantized, skipped = report.skipped, "Applied dynamic uint8 quantization");
    Ok(report)
}
