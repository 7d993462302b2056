//! Model descriptor: the static description of a feed-forward network.
//!
//! A descriptor is an ordered list of layer specs. Linear layers carry their
//! trained parameters because the compiled circuit embeds them as constants.
//! Descriptors are immutable once built and are identified by a content hash.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::components::activation::ActivationType;
use crate::gadgets::quantize::FixedPoint;
use crate::hash::{hash_json, ContentHash};

/// Operation kinds a settings op-support table can list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Linear,
    Relu,
    Sigmoid,
    Identity,
}

impl OpKind {
    pub fn all() -> BTreeSet<OpKind> {
        [OpKind::Linear, OpKind::Relu, OpKind::Sigmoid, OpKind::Identity]
            .into_iter()
            .collect()
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OpKind::Linear => "linear",
            OpKind::Relu => "relu",
            OpKind::Sigmoid => "sigmoid",
            OpKind::Identity => "identity",
        };
        f.write_str(s)
    }
}

/// Trained parameters of a dense layer: `y = W·x + b`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearParams {
    /// Row-major `[out_dim][in_dim]`.
    pub weights: Vec<Vec<f64>>,
    pub bias: Vec<f64>,
}

impl LinearParams {
    /// Every weight equal to `weight`, every bias equal to `bias`.
    pub fn constant(in_dim: usize, out_dim: usize, weight: f64, bias: f64) -> Self {
        Self {
            weights: vec![vec![weight; in_dim]; out_dim],
            bias: vec![bias; out_dim],
        }
    }

    /// Largest absolute row sum, i.e. the ∞-norm of `W`.
    pub fn row_abs_sum_max(&self) -> f64 {
        self.weights
            .iter()
            .map(|row| row.iter().map(|w| w.abs()).sum::<f64>())
            .fold(0.0, f64::max)
    }

    /// Weights at scale `s` and biases at scale `2s`, matching the accumulator.
    pub fn quantize(&self, fp: FixedPoint) -> (Vec<Vec<i64>>, Vec<i64>) {
        let bias_fp = FixedPoint::new(2 * fp.scale);
        let weights = self
            .weights
            .iter()
            .map(|row| row.iter().map(|&w| fp.quantize(w)).collect())
            .collect();
        let bias = self.bias.iter().map(|&b| bias_fp.quantize(b)).collect();
        (weights, bias)
    }

    pub fn forward(&self, input: &[f64]) -> Vec<f64> {
        self.weights
            .iter()
            .zip(&self.bias)
            .map(|(row, b)| row.iter().zip(input).map(|(w, x)| w * x).sum::<f64>() + b)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    Linear(LinearParams),
    Activation(ActivationType),
}

/// A single layer. `out_dim` is `None` for shape-preserving layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub kind: LayerKind,
    pub in_dim: usize,
    pub out_dim: Option<usize>,
}

impl LayerSpec {
    pub fn output_dim(&self) -> usize {
        self.out_dim.unwrap_or(self.in_dim)
    }

    pub fn op_kind(&self) -> OpKind {
        match &self.kind {
            LayerKind::Linear(_) => OpKind::Linear,
            LayerKind::Activation(act) => act.op_kind(),
        }
    }

    /// Number of trained parameters.
    pub fn num_parameters(&self) -> usize {
        match &self.kind {
            LayerKind::Linear(p) => p.weights.iter().map(Vec::len).sum::<usize>() + p.bias.len(),
            LayerKind::Activation(_) => 0,
        }
    }
}

/// Structural problems in a descriptor.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DescriptorError {
    #[error("descriptor has no layers")]
    Empty,
    #[error("input dimension must be positive")]
    ZeroInput,
    #[error("layer {layer}: expected in_dim {expected}, got {actual}")]
    DimMismatch {
        layer: usize,
        expected: usize,
        actual: usize,
    },
    #[error("layer {layer}: linear layer needs out_dim")]
    MissingOutDim { layer: usize },
    #[error("layer {layer}: activation must preserve shape ({in_dim} -> {out_dim})")]
    ActivationReshape {
        layer: usize,
        in_dim: usize,
        out_dim: usize,
    },
    #[error("layer {layer}: weight shape {rows}x{cols} does not match {out_dim}x{in_dim}")]
    WeightShape {
        layer: usize,
        rows: usize,
        cols: usize,
        out_dim: usize,
        in_dim: usize,
    },
    #[error("layer {layer}: bias length {actual} does not match out_dim {expected}")]
    BiasShape {
        layer: usize,
        expected: usize,
        actual: usize,
    },
    #[error("layer {layer}: non-finite parameter")]
    NonFinite { layer: usize },
}

/// Static description of a fixed-topology feed-forward network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub input_dim: usize,
    pub layers: Vec<LayerSpec>,
}

impl ModelDescriptor {
    pub fn output_dim(&self) -> usize {
        self.layers
            .last()
            .map(LayerSpec::output_dim)
            .unwrap_or(self.input_dim)
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn num_parameters(&self) -> usize {
        self.layers.iter().map(LayerSpec::num_parameters).sum()
    }

    /// Distinct operation kinds used by this network.
    pub fn op_kinds(&self) -> BTreeSet<OpKind> {
        self.layers.iter().map(LayerSpec::op_kind).collect()
    }

    /// Number of linear layers, whatever sits between them.
    pub fn linear_depth(&self) -> usize {
        self.layers
            .iter()
            .filter(|l| matches!(l.kind, LayerKind::Linear(_)))
            .count()
    }

    /// Content hash over the canonical encoding.
    pub fn hash(&self) -> ContentHash {
        // Serializing plain structs of numbers and strings cannot fail.
        hash_json("zkinfer/descriptor/v1", self).unwrap_or(ContentHash::ZERO)
    }

    /// Check that layer shapes chain and parameters match their shapes.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        if self.input_dim == 0 {
            return Err(DescriptorError::ZeroInput);
        }
        if self.layers.is_empty() {
            return Err(DescriptorError::Empty);
        }
        let mut current = self.input_dim;
        for (i, layer) in self.layers.iter().enumerate() {
            if layer.in_dim != current {
                return Err(DescriptorError::DimMismatch {
                    layer: i,
                    expected: current,
                    actual: layer.in_dim,
                });
            }
            match &layer.kind {
                LayerKind::Linear(params) => {
                    let out_dim = layer
                        .out_dim
                        .ok_or(DescriptorError::MissingOutDim { layer: i })?;
                    let cols_ok = params.weights.iter().all(|r| r.len() == layer.in_dim);
                    if params.weights.len() != out_dim || !cols_ok {
                        return Err(DescriptorError::WeightShape {
                            layer: i,
                            rows: params.weights.len(),
                            cols: params.weights.first().map(Vec::len).unwrap_or(0),
                            out_dim,
                            in_dim: layer.in_dim,
                        });
                    }
                    if params.bias.len() != out_dim {
                        return Err(DescriptorError::BiasShape {
                            layer: i,
                            expected: out_dim,
                            actual: params.bias.len(),
                        });
                    }
                    let finite = params.weights.iter().flatten().all(|w| w.is_finite())
                        && params.bias.iter().all(|b| b.is_finite());
                    if !finite {
                        return Err(DescriptorError::NonFinite { layer: i });
                    }
                }
                LayerKind::Activation(_) => {
                    if let Some(out_dim) = layer.out_dim {
                        if out_dim != layer.in_dim {
                            return Err(DescriptorError::ActivationReshape {
                                layer: i,
                                in_dim: layer.in_dim,
                                out_dim,
                            });
                        }
                    }
                }
            }
            current = layer.output_dim();
        }
        Ok(())
    }

    /// Floating-point reference forward pass.
    pub fn forward(&self, input: &[f64]) -> Vec<f64> {
        self.layers.iter().fold(input.to_vec(), |x, layer| match &layer.kind {
            LayerKind::Linear(params) => params.forward(&x),
            LayerKind::Activation(act) => x.iter().map(|&v| act.eval_f64(v)).collect(),
        })
    }
}

/// Fluent builder for sequential descriptors.
pub struct DescriptorBuilder {
    name: String,
    input_dim: usize,
    layers: Vec<LayerSpec>,
}

impl DescriptorBuilder {
    pub fn new(input_dim: usize) -> Self {
        Self {
            name: "model".to_string(),
            input_dim,
            layers: Vec::new(),
        }
    }

    pub fn name(&mut self, name: &str) -> &mut Self {
        self.name = name.to_string();
        self
    }

    pub fn current_dim(&self) -> usize {
        self.layers
            .last()
            .map(LayerSpec::output_dim)
            .unwrap_or(self.input_dim)
    }

    /// Add a dense layer with explicit parameters.
    pub fn linear(&mut self, params: LinearParams) -> &mut Self {
        let in_dim = self.current_dim();
        let out_dim = params.weights.len();
        self.layers.push(LayerSpec {
            kind: LayerKind::Linear(params),
            in_dim,
            out_dim: Some(out_dim),
        });
        self
    }

    /// Add a dense layer whose weights and biases are all the same value.
    pub fn linear_constant(&mut self, out_dim: usize, weight: f64, bias: f64) -> &mut Self {
        let params = LinearParams::constant(self.current_dim(), out_dim, weight, bias);
        self.linear(params)
    }

    pub fn activation(&mut self, act: ActivationType) -> &mut Self {
        let in_dim = self.current_dim();
        self.layers.push(LayerSpec {
            kind: LayerKind::Activation(act),
            in_dim,
            out_dim: None,
        });
        self
    }

    pub fn build(&self) -> ModelDescriptor {
        ModelDescriptor {
            name: self.name.clone(),
            input_dim: self.input_dim,
            layers: self.layers.clone(),
        }
    }
}
