//! Typed error hierarchy for the scheduler and its engines.
//!
//! Uses `thiserror` for library-grade errors.  Every failure is a returned
//! value; nothing in the scheduler unwinds across the engine boundary.
//!
//! # Error codes
//!
//! Each variant maps to a stable integer code via [`EngineError::error_code`]
//! for structured telemetry without string parsing.

use std::fmt;

/// Which side of the model a binding lives on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindingKind {
    Input,
    Output,
}

impl fmt::Display for BindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => f.write_str("input"),
            Self::Output => f.write_str("output"),
        }
    }
}

/// Coarse error taxonomy used by callers deciding what to do with a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Allocation failed for a task, sub-inference or slot.
    ResourceExhaustion,
    /// The engine does not honour the model contract (names, shapes, precision).
    ContractViolation,
    /// Compile, dispatch or run failed inside the engine.
    Execution,
    /// Unsupported option combination, rejected before engine work.
    Configuration,
    /// Lifecycle misuse or a broken internal invariant.
    Invariant,
}

/// All errors originating from tessera.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // ── Resource exhaustion ──────────────────────────────────────────
    #[error("Allocation failed: {0}")]
    Allocation(String),

    #[error(
        "Partial submission: {queued} sub-inference(s) already queued and not retracted: {reason}"
    )]
    PartialSubmission { queued: usize, reason: String },

    // ── Engine contract ──────────────────────────────────────────────
    #[error("Could not find {kind} \"{name}\" in model, all {kind}(s) are: \"{available}\"")]
    MissingBinding {
        kind: BindingKind,
        name: String,
        available: String,
    },

    #[error("Output batch dimension {rows} is smaller than slot occupancy {occupancy}")]
    BatchUnderflow { occupancy: usize, rows: usize },

    #[error("Unsupported precision: {0}")]
    UnsupportedPrecision(String),

    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    // ── Execution ────────────────────────────────────────────────────
    #[error("Failed to read network: {0}")]
    ModelRead(String),

    #[error("Failed to compile network: {0}")]
    Compile(String),

    #[error("Dispatch failed: {0}")]
    Dispatch(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    // ── Configuration ────────────────────────────────────────────────
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(String),

    // ── Lifecycle / invariants ───────────────────────────────────────
    #[error("Model is unusable after a failed initialization")]
    ModelUnusable,

    #[error("Model has been torn down")]
    Closed,

    #[error("Slot pool closed")]
    PoolClosed,

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

impl EngineError {
    /// Stable integer error code for structured telemetry.
    ///
    /// Codes are grouped by category:
    /// - 1xx: resource exhaustion
    /// - 2xx: engine contract
    /// - 3xx: execution
    /// - 4xx: configuration
    /// - 6xx: lifecycle/invariant
    pub fn error_code(&self) -> u32 {
        match self {
            Self::Allocation(_) => 100,
            Self::PartialSubmission { .. } => 101,
            Self::MissingBinding { .. } => 200,
            Self::BatchUnderflow { .. } => 201,
            Self::UnsupportedPrecision(_) => 202,
            Self::DimensionMismatch(_) => 203,
            Self::ModelRead(_) => 300,
            Self::Compile(_) => 301,
            Self::Dispatch(_) => 302,
            Self::Inference(_) => 303,
            Self::Config(_) => 400,
            Self::UnsupportedFeature(_) => 401,
            Self::ModelUnusable => 600,
            Self::Closed => 601,
            Self::PoolClosed => 602,
            Self::InvariantViolation(_) => 603,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self.error_code() / 100 {
            1 => ErrorCategory::ResourceExhaustion,
            2 => ErrorCategory::ContractViolation,
            3 => ErrorCategory::Execution,
            4 => ErrorCategory::Configuration,
            _ => ErrorCategory::Invariant,
        }
    }

    /// Whether the model stays usable after this error (the caller may submit again).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Dispatch(_)
                | Self::Inference(_)
                | Self::Config(_)
                | Self::UnsupportedFeature(_)
                | Self::PartialSubmission { .. }
        )
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, EngineError>;
