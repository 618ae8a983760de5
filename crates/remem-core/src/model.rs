//! The per-cell network: three affine layers with ReLU between them.

use std::fmt;

use ndarray::{Array1, Array2, ArrayView1};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::constants::{MAX_TOKEN, MIN_HIDDEN_DIM};

#[derive(Debug, Clone, PartialEq)]
pub enum ModelError {
    DimensionMismatch { expected: usize, actual: usize },
    MalformedLayers(String),
    NonFiniteOutput { index: usize },
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::DimensionMismatch { expected, actual } => {
                write!(f, "input has {actual} dimensions, model expects {expected}")
            }
            ModelError::MalformedLayers(msg) => write!(f, "malformed model: {msg}"),
            ModelError::NonFiniteOutput { index } => {
                write!(f, "model output {index} is not a number")
            }
        }
    }
}

impl std::error::Error for ModelError {}

/// Layer widths of a cell model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Architecture {
    pub input_dim: usize,
    pub hidden_dim: usize,
    pub output_dim: usize,
}

impl Architecture {
    /// Fixed width heuristic: `max(128, (input + output) / 2)`.
    /// Chosen once per cell, never tuned.
    pub fn for_cell(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            hidden_dim: MIN_HIDDEN_DIM.max((input_dim + output_dim) / 2),
            output_dim,
        }
    }
}

/// Affine layer `y = W x + b`, `W` stored as `(out, in)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Dense {
    pub weight: Array2<f32>,
    pub bias: Array1<f32>,
}

impl Dense {
    /// Uniform init in `±1/sqrt(fan_in)` for weights and bias.
    fn init(fan_in: usize, fan_out: usize, rng: &mut impl Rng) -> Self {
        let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
        Self {
            weight: Array2::from_shape_fn((fan_out, fan_in), |_| rng.random_range(-bound..bound)),
            bias: Array1::from_shape_fn(fan_out, |_| rng.random_range(-bound..bound)),
        }
    }

    fn zeros_like(&self) -> Self {
        Self {
            weight: Array2::zeros(self.weight.raw_dim()),
            bias: Array1::zeros(self.bias.raw_dim()),
        }
    }

    pub fn in_dim(&self) -> usize {
        self.weight.ncols()
    }

    pub fn out_dim(&self) -> usize {
        self.weight.nrows()
    }

    fn forward(&self, x: ArrayView1<'_, f32>) -> Array1<f32> {
        self.weight.dot(&x) + &self.bias
    }
}

/// Intermediate activations of one forward pass, kept for backprop.
pub(crate) struct Trace {
    pub z1: Array1<f32>,
    pub h1: Array1<f32>,
    pub z2: Array1<f32>,
    pub h2: Array1<f32>,
    pub output: Array1<f32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CellModel {
    pub input: Dense,
    pub hidden: Dense,
    pub output: Dense,
}

impl CellModel {
    pub fn new(arch: Architecture, rng: &mut impl Rng) -> Self {
        Self {
            input: Dense::init(arch.input_dim, arch.hidden_dim, rng),
            hidden: Dense::init(arch.hidden_dim, arch.hidden_dim, rng),
            output: Dense::init(arch.hidden_dim, arch.output_dim, rng),
        }
    }

    /// Same shapes, all zeros. Used for gradient and optimizer-moment buffers.
    pub(crate) fn zeros_like(&self) -> Self {
        Self {
            input: self.input.zeros_like(),
            hidden: self.hidden.zeros_like(),
            output: self.output.zeros_like(),
        }
    }

    pub(crate) fn layers(&self) -> [&Dense; 3] {
        [&self.input, &self.hidden, &self.output]
    }

    pub(crate) fn layers_mut(&mut self) -> [&mut Dense; 3] {
        [&mut self.input, &mut self.hidden, &mut self.output]
    }

    pub fn architecture(&self) -> Architecture {
        Architecture {
            input_dim: self.input.in_dim(),
            hidden_dim: self.input.out_dim(),
            output_dim: self.output.out_dim(),
        }
    }

    /// Check that the layers chain together; returns the architecture if so.
    ///
    /// Deserialized parameters are untrusted, so loaders call this before
    /// evaluating.
    pub fn validate(&self) -> Result<Architecture, ModelError> {
        let arch = self.architecture();
        let check = |name: &str, layer: &Dense, fan_in: usize, fan_out: usize| {
            if layer.in_dim() != fan_in || layer.out_dim() != fan_out {
                return Err(ModelError::MalformedLayers(format!(
                    "{name} layer is {}x{}, expected {fan_out}x{fan_in}",
                    layer.out_dim(),
                    layer.in_dim()
                )));
            }
            if layer.bias.len() != fan_out {
                return Err(ModelError::MalformedLayers(format!(
                    "{name} bias has {} entries, expected {fan_out}",
                    layer.bias.len()
                )));
            }
            Ok(())
        };
        check("input", &self.input, arch.input_dim, arch.hidden_dim)?;
        check("hidden", &self.hidden, arch.hidden_dim, arch.hidden_dim)?;
        check("output", &self.output, arch.hidden_dim, arch.output_dim)?;
        Ok(arch)
    }

    pub(crate) fn trace(&self, x: ArrayView1<'_, f32>) -> Trace {
        let z1 = self.input.forward(x);
        let h1 = z1.mapv(relu);
        let z2 = self.hidden.forward(h1.view());
        let h2 = z2.mapv(relu);
        let output = self.output.forward(h2.view());
        Trace {
            z1,
            h1,
            z2,
            h2,
            output,
        }
    }

    /// Raw real-valued output for `context`.
    pub fn evaluate(&self, context: &[f32]) -> Result<Vec<f32>, ModelError> {
        let expected = self.input.in_dim();
        if context.len() != expected {
            return Err(ModelError::DimensionMismatch {
                expected,
                actual: context.len(),
            });
        }
        Ok(self.trace(ArrayView1::from(context)).output.to_vec())
    }

    /// Evaluate and snap every output to the nearest valid token.
    pub fn reconstruct_tokens(&self, context: &[f32]) -> Result<Vec<u16>, ModelError> {
        self.evaluate(context)?
            .into_iter()
            .enumerate()
            .map(|(index, v)| to_token(v).ok_or(ModelError::NonFiniteOutput { index }))
            .collect()
    }
}

fn relu(v: f32) -> f32 {
    v.max(0.0)
}

/// Round half-to-even and clamp into `[0, 4095]`. `None` for NaN.
pub fn to_token(v: f32) -> Option<u16> {
    if v.is_nan() {
        return None;
    }
    Some(v.round_ties_even().clamp(0.0, MAX_TOKEN as f32) as u16)
}
