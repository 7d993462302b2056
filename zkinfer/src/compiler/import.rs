//! Model and input file loading.
//!
//! Model files use a small JSON interchange layout:
//!
//! ```json
//! {
//!   "name": "mlp",
//!   "input_dim": 2,
//!   "layers": [
//!     {"op": "linear", "in_dim": 2, "out_dim": 1, "weights": [[0.5, -1.0]], "bias": [0.1]},
//!     {"op": "relu", "dim": 1}
//!   ]
//! }
//! ```
//!
//! Input and calibration files follow `{"input_data": [[...]], "output_data": [[...]]}`.

use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::compiler::graph::{DescriptorBuilder, DescriptorError, LinearParams, ModelDescriptor};
use crate::compiler::settings::CalibrationData;
use crate::components::activation::ActivationType;
use crate::witness::InputData;

/// Errors from model or input loading.
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Unsupported op: {0}")]
    UnsupportedOp(String),
    #[error("layer {layer}: missing field `{field}`")]
    MissingField { layer: usize, field: &'static str },
    #[error("invalid model: {0}")]
    Descriptor(#[from] DescriptorError),
    #[error("input file has no samples")]
    EmptyInput,
}

#[derive(Debug, Deserialize)]
struct ModelFile {
    #[serde(default)]
    name: Option<String>,
    input_dim: usize,
    layers: Vec<LayerEntry>,
}

#[derive(Debug, Deserialize)]
struct LayerEntry {
    op: String,
    #[serde(default)]
    in_dim: Option<usize>,
    #[serde(default)]
    out_dim: Option<usize>,
    #[serde(default)]
    dim: Option<usize>,
    #[serde(default)]
    weights: Option<Vec<Vec<f64>>>,
    #[serde(default)]
    bias: Option<Vec<f64>>,
}

#[derive(Debug, Deserialize)]
struct SampleFile {
    input_data: Vec<Vec<f64>>,
    #[serde(default)]
    output_data: Option<Vec<Vec<f64>>>,
}

fn read_file(path: &Path) -> Result<String, ImportError> {
    std::fs::read_to_string(path).map_err(|source| ImportError::Io {
        path: path.display().to_string(),
        source,
    })
}

/// Parse a model document into a validated descriptor.
pub fn parse_model_json(text: &str) -> Result<ModelDescriptor, ImportError> {
    let file: ModelFile = serde_json::from_str(text)?;
    let mut builder = DescriptorBuilder::new(file.input_dim);
    if let Some(name) = &file.name {
        builder.name(name);
    }

    let mut declared = Vec::with_capacity(file.layers.len());
    for (i, entry) in file.layers.into_iter().enumerate() {
        declared.push((entry.in_dim.or(entry.dim), entry.out_dim.or(entry.dim)));
        match entry.op.to_ascii_lowercase().as_str() {
            "linear" | "gemm" | "dense" => {
                let weights = entry.weights.ok_or(ImportError::MissingField {
                    layer: i,
                    field: "weights",
                })?;
                let bias = match entry.bias {
                    Some(b) => b,
                    None => vec![0.0; weights.len()],
                };
                builder.linear(LinearParams { weights, bias });
            }
            "relu" => {
                builder.activation(ActivationType::Relu);
            }
            "sigmoid" => {
                builder.activation(ActivationType::Sigmoid);
            }
            "identity" => {
                builder.activation(ActivationType::Identity);
            }
            other => return Err(ImportError::UnsupportedOp(other.to_string())),
        }
    }

    let descriptor = builder.build();
    // Declared dims are optional; when present they must match the chained shapes.
    for (i, (layer, (declared_in, declared_out))) in
        descriptor.layers.iter().zip(declared).enumerate()
    {
        if let Some(d) = declared_in {
            if d != layer.in_dim {
                return Err(DescriptorError::DimMismatch {
                    layer: i,
                    expected: layer.in_dim,
                    actual: d,
                }
                .into());
            }
        }
        if let Some(d) = declared_out {
            if d != layer.output_dim() {
                return Err(DescriptorError::DimMismatch {
                    layer: i,
                    expected: layer.output_dim(),
                    actual: d,
                }
                .into());
            }
        }
    }
    descriptor.validate()?;
    Ok(descriptor)
}

/// Load a model document from disk.
pub fn load_model_json(path: &Path) -> Result<ModelDescriptor, ImportError> {
    let descriptor = parse_model_json(&read_file(path)?)?;
    info!(
        path = %path.display(),
        layers = descriptor.num_layers(),
        params = descriptor.num_parameters(),
        "loaded model"
    );
    Ok(descriptor)
}

/// Load a concrete input. Only the first sample row is used.
pub fn load_input_json(path: &Path) -> Result<InputData, ImportError> {
    let file: SampleFile = serde_json::from_str(&read_file(path)?)?;
    let first = file
        .input_data
        .into_iter()
        .next()
        .ok_or(ImportError::EmptyInput)?;
    Ok(InputData::new(first))
}

/// Load calibration samples, with optional expected outputs.
pub fn load_calibration_json(path: &Path) -> Result<CalibrationData, ImportError> {
    let file: SampleFile = serde_json::from_str(&read_file(path)?)?;
    if file.input_data.is_empty() {
        return Err(ImportError::EmptyInput);
    }
    Ok(CalibrationData {
        inputs: file.input_data,
        outputs: file.output_data,
    })
}

/// The benchmark MLP: `depth` hidden `Linear(width→width) + ReLU` blocks and
/// a `Linear(width→1)` head, every weight and bias set to a constant.
pub fn build_mlp(depth: usize, width: usize, weight: f64, bias: f64) -> ModelDescriptor {
    let mut builder = DescriptorBuilder::new(width);
    builder.name(&format!("mlp_d{depth}_w{width}"));
    for _ in 0..depth {
        builder
            .linear_constant(width, weight, bias)
            .activation(ActivationType::Relu);
    }
    builder.linear_constant(1, weight, bias);
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::graph::LayerKind;

    const MODEL: &str = r#"{
        "name": "tiny",
        "input_dim": 2,
        "layers": [
            {"op": "linear", "in_dim": 2, "out_dim": 3,
             "weights": [[1.0, 0.0], [0.0, 1.0], [0.5, 0.5]], "bias": [0.0, 0.1, 0.2]},
            {"op": "relu", "dim": 3},
            {"op": "linear", "in_dim": 3, "out_dim": 1, "weights": [[1.0, 1.0, 1.0]]},
            {"op": "sigmoid", "dim": 1}
        ]
    }"#;

    #[test]
    fn test_parse_model() {
        let desc = parse_model_json(MODEL).unwrap();
        assert_eq!(desc.name, "tiny");
        assert_eq!(desc.num_layers(), 4);
        assert_eq!(desc.output_dim(), 1);
        match &desc.layers[2].kind {
            LayerKind::Linear(p) => assert_eq!(p.bias, vec![0.0]),
            other => panic!("expected linear, got {other:?}"),
        }
    }

    #[test]
    fn test_unsupported_op() {
        let text = r#"{"input_dim": 2, "layers": [{"op": "conv2d"}]}"#;
        assert!(matches!(
            parse_model_json(text),
            Err(ImportError::UnsupportedOp(op)) if op == "conv2d"
        ));
    }

    #[test]
    fn test_declared_dim_mismatch() {
        let text = r#"{"input_dim": 2, "layers": [
            {"op": "linear", "in_dim": 3, "out_dim": 1, "weights": [[1.0, 1.0]]}
        ]}"#;
        assert!(matches!(
            parse_model_json(text),
            Err(ImportError::Descriptor(DescriptorError::DimMismatch { .. }))
        ));
    }

    fn deep_document(depth: usize, head_out_dim: usize) -> String {
        let mut layers = vec![r#"{"op": "identity", "dim": 2}"#.to_string(); depth];
        layers.push(format!(
            r#"{{"op": "linear", "in_dim": 2, "out_dim": {head_out_dim}, "weights": [[1.0, 1.0]]}}"#
        ));
        format!(r#"{{"input_dim": 2, "layers": [{}]}}"#, layers.join(","))
    }

    #[test]
    fn test_deep_document_dims_checked_once_built() {
        let desc = parse_model_json(&deep_document(400, 1)).unwrap();
        assert_eq!(desc.num_layers(), 401);
        assert_eq!(desc.output_dim(), 1);

        assert!(matches!(
            parse_model_json(&deep_document(400, 3)),
            Err(ImportError::Descriptor(DescriptorError::DimMismatch {
                layer: 400,
                expected: 1,
                actual: 3
            }))
        ));
    }

    #[test]
    fn test_missing_weights() {
        let text = r#"{"input_dim": 2, "layers": [{"op": "linear", "out_dim": 1}]}"#;
        assert!(matches!(
            parse_model_json(text),
            Err(ImportError::MissingField { layer: 0, field: "weights" })
        ));
    }

    #[test]
    fn test_build_mlp_shape() {
        let desc = build_mlp(4, 5, 1.0, 1.0);
        assert_eq!(desc.num_layers(), 9);
        assert_eq!(desc.linear_depth(), 5);
        assert_eq!(desc.input_dim, 5);
        assert_eq!(desc.output_dim(), 1);
        assert!(desc.validate().is_ok());
    }

    #[test]
    fn test_load_input_file() {
        let dir = std::env::temp_dir().join(format!("zkinfer-import-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("input.json");
        std::fs::write(&path, r#"{"input_data": [[0.5, -0.5], [1.0, 1.0]]}"#).unwrap();

        let input = load_input_json(&path).unwrap();
        assert_eq!(input.values, vec![0.5, -0.5]);

        let calib = load_calibration_json(&path).unwrap();
        assert_eq!(calib.inputs.len(), 2);
        assert!(calib.outputs.is_none());

        std::fs::remove_dir_all(&dir).ok();
    }
}
