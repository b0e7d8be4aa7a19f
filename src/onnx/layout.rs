use crate::error::{Error, Result};
use crate::onnx::checker::GraphSignature;
use crate::onnx::proto::{tensor_shape_proto::Dimension, type_proto};
use crate::onnx::{attr_ints, graph_mut, node, rename_input};

pub const INPUT_LAYOUT: &str = "NHWC";
pub const INTERNAL_LAYOUT: &str = "NCHW";

/// Exposes an NHWC graph input in front of an NCHW network.
///
/// The input keeps its name; the original consumers read `<name>_nchw`, produced
/// by a leading `Transpose(perm=[0,3,1,2])`.
pub fn to_nhwc(model: &mut crate::onnx::proto::ModelProto) -> Result<()> {
    let signature = GraphSignature::of(model)?;
    let [input] = signature.inputs.as_slice() else {
        return Err(Error::Signature(format!(
            "NHWC rewrite needs exactly one input, found {}",
            signature.inputs.len()
        )));
    };
    if input.dims.len() != 4 {
        return Err(Error::Signature(format!(
            "NHWC rewrite needs a rank-4 input, '{}' has shape {}",
            input.name,
            input.shape_string()
        )));
    }
    let name = input.name.clone();
    let nchw = format!("{name}_nchw");

    let graph = graph_mut(model)?;
    rename_input(graph, &name, &nchw);

    let info = graph
        .input
        .iter_mut()
        .find(|i| i.name == name)
        .ok_or_else(|| Error::InvalidGraph(format!("graph input '{name}' disappeared")))?;
    if let Some(type_proto::Value::TensorType(tensor)) = info.r#type.as_mut().and_then(|t| t.value.as_mut()) {
        if let Some(shape) = tensor.shape.as_mut() {
            let dims: &mut Vec<Dimension> = &mut shape.dim;
            // [N, C, H, W] -> [N, H, W, C]
            let channels = dims.remove(1);
            dims.push(channels);
        }
    }

    let mut transpose = node("Transpose", "nhwc_to_nchw", &[name.as_str()], &[nchw.as_str()]);
    transpose.attribute.push(attr_ints("perm", vec![0, 3, 1, 2]));
    graph.node.insert(0, transpose);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onnx::checker::{check_model, Dim};
    use crate::onnx::testing::tiny_classifier;

    #[test]
    fn input_becomes_nhwc() {
        let mut model = tiny_classifier();
        to_nhwc(&mut model).unwrap();

        let signature = GraphSignature::of(&model).unwrap();
        assert_eq!(signature.inputs[0].name, "input");
        assert_eq!(
            signature.inputs[0].dims,
            vec![Dim::Param("batch".into()), Dim::Value(8), Dim::Value(8), Dim::Value(3)]
        );

        let graph = model.graph.as_ref().unwrap();
        assert_eq!(graph.node[0].op_type, "Transpose");
        assert_eq!(graph.node[0].attribute[0].ints, vec![0, 3, 1, 2]);
        assert_eq!(graph.node[1].input, vec!["input_nchw".to_string()]);
        check_model(&model).unwrap();
    }

    #[test]
    fn rank_two_input_is_rejected() {
        let mut model = tiny_classifier();
        let graph = model.graph.as_mut().unwrap();
        graph.input[0] = crate::onnx::testing::value_info("input", 1, &[-1, 192]);
        assert!(to_nhwc(&mut model).is_err());
    }
}
