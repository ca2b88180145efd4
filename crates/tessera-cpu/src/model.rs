//! JSON model description understood by the CPU engine.
//!
//! ```json
//! {
//!   "name": "sr-2x",
//!   "inputs":  [{ "name": "x", "dims": [1, 1, 8, 8], "precision": "fp32" }],
//!   "outputs": [{ "name": "y", "precision": "fp32", "op": { "kind": "upsample", "scale": 2 } }],
//!   "latency_ms": 0
//! }
//! ```
//!
//! Every output is computed from the first input.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tessera_core::error::{EngineError, Result};
use tessera_core::types::Precision;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelDescription {
    pub name: String,
    pub inputs: Vec<InputDescription>,
    pub outputs: Vec<OutputDescription>,
    /// Simulated compute time per request run.
    #[serde(default)]
    pub latency_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputDescription {
    pub name: String,
    /// NCHW.
    pub dims: [usize; 4],
    pub precision: Precision,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputDescription {
    pub name: String,
    pub precision: Precision,
    #[serde(default)]
    pub op: Op,
}

/// Per-row computation producing an output from the first input.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Op {
    /// Copy.
    #[default]
    Identity,
    /// Nearest-neighbour spatial upscale.
    Upsample { scale: usize },
    /// Multiply every element.
    Gain { factor: f32 },
    /// Per-channel mean; output is `[N, C, 1, 1]`.
    ChannelMean,
}

impl Op {
    /// NCHW output dims for NCHW input dims.
    pub fn output_dims(&self, input: [usize; 4]) -> [usize; 4] {
        let [n, c, h, w] = input;
        match *self {
            Self::Identity | Self::Gain { .. } => input,
            Self::Upsample { scale } => [n, c, h * scale, w * scale],
            Self::ChannelMean => [n, c, 1, 1],
        }
    }
}

impl ModelDescription {
    pub fn from_json(json: &str) -> Result<Self> {
        let desc: Self = serde_json::from_str(json)
            .map_err(|e| EngineError::ModelRead(format!("model description: {e}")))?;
        desc.validate()?;
        Ok(desc)
    }

    fn validate(&self) -> Result<()> {
        if self.inputs.is_empty() || self.outputs.is_empty() {
            return Err(EngineError::ModelRead(
                "model must declare at least one input and one output".into(),
            ));
        }
        let mut seen = HashSet::new();
        for name in self
            .inputs
            .iter()
            .map(|p| &p.name)
            .chain(self.outputs.iter().map(|p| &p.name))
        {
            if !seen.insert(name) {
                return Err(EngineError::ModelRead(format!("duplicate port name \"{name}\"")));
            }
        }
        for input in &self.inputs {
            if input.dims.contains(&0) {
                return Err(EngineError::ModelRead(format!(
                    "input \"{}\" has a zero dimension: {:?}",
                    input.name, input.dims
                )));
            }
        }
        for output in &self.outputs {
            if let Op::Upsample { scale: 0 } = output.op {
                return Err(EngineError::ModelRead(format!(
                    "output \"{}\" upsample scale must be positive",
                    output.name
                )));
            }
        }
        Ok(())
    }
}
