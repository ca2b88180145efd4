//! Stub ONNX Runtime engine for builds without the `ort-runtime` feature.
//!
//! Every model read fails with [`EngineError::UnsupportedFeature`] so callers
//! can still select the engine by name and report a useful error.

use std::path::Path;

use tessera_core::backend::{InferenceEngine, Network};
use tessera_core::error::{EngineError, Result};

pub const ORT_CPU_DEVICE: &str = "CPU";

#[derive(Clone, Debug, Default)]
pub struct OrtEngine;

impl OrtEngine {
    pub fn new() -> Self {
        Self
    }
}

impl InferenceEngine for OrtEngine {
    fn name(&self) -> &str {
        "onnxruntime"
    }

    fn read_network(&self, path: &Path) -> Result<Box<dyn Network>> {
        Err(EngineError::UnsupportedFeature(format!(
            "cannot read {}: tessera-ort was built without the ort-runtime feature",
            path.display()
        )))
    }

    fn available_devices(&self) -> Vec<String> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_reports_missing_runtime() {
        let engine = OrtEngine::new();
        assert!(engine.available_devices().is_empty());
        let err = engine
            .read_network(Path::new("model.onnx"))
            .err()
            .expect("stub cannot read");
        match err {
            EngineError::UnsupportedFeature(msg) => assert!(msg.contains("ort-runtime")),
            other => panic!("unexpected error variant: {other:?}"),
        }
    }
}
