//! Scheduler configuration.
//!
//! Resolved from filter options (or the CLI) into plain values before the
//! scheduler is built.  Deserializes from JSON with every field optional.

use serde::{Deserialize, Serialize};
use tessera_core::error::{EngineError, Result};

/// Upper bound accepted for `batch_size`.
pub const MAX_BATCH_SIZE: usize = 1000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Engine device the network is compiled for.
    pub device: String,
    /// Number of request slots; `0` picks a value from the host's parallelism.
    pub nireq: usize,
    /// Sub-inferences packed into one slot.
    pub batch_size: usize,
    /// Report input height/width as unknown and reshape on output probes.
    pub input_resizable: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            device: "CPU".to_string(),
            nireq: 0,
            batch_size: 1,
            input_resizable: false,
        }
    }
}

impl SchedulerConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| EngineError::Config(format!("config JSON: {e}")))
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_BATCH_SIZE).contains(&self.batch_size) {
            return Err(EngineError::Config(format!(
                "batch_size must be in 1..={MAX_BATCH_SIZE}, got {}",
                self.batch_size
            )));
        }
        if self.device.trim().is_empty() {
            return Err(EngineError::Config("device must not be empty".into()));
        }
        Ok(())
    }

    /// Slot count after resolving `0` to `available_parallelism / 2 + 1`.
    pub fn resolved_nireq(&self) -> usize {
        if self.nireq > 0 {
            return self.nireq;
        }
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        cpus / 2 + 1
    }
}
