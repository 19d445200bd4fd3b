//! Error taxonomy for the audit engine.
//!
//! Every estimator and statistic error is returned to the caller. Numerical
//! instability that does not invalidate a result is carried as a
//! [`NumericalWarning`] value on the posterior instead.

use serde::{Deserialize, Serialize};

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, AuditError>;

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("degenerate context in {input}: {reason}")]
    DegenerateContext { input: String, reason: String },

    #[error("resolution mismatch in {input}: nside {found} cannot be reconciled with nside {expected}")]
    ResolutionMismatch {
        input: String,
        expected: u32,
        found: u32,
    },

    #[error("dimension mismatch in {what}: expected {expected}, found {found}")]
    DimensionMismatch {
        what: String,
        expected: usize,
        found: usize,
    },

    #[error("singular update in {stage}: {reason}")]
    SingularUpdate { stage: String, reason: String },

    #[error("insufficient bandwidth: {available} multipoles in band, {required} required")]
    InsufficientBandwidth { available: usize, required: usize },

    #[error("calibration missing for {track} ({statistic}): run a null ensemble first")]
    CalibrationMissing { track: String, statistic: String },

    #[error("invalid resolution: nside {nside} is not a positive power of two")]
    InvalidResolution { nside: u32 },

    #[error("rank cap exceeded for {what}: {rank} > cap {cap}")]
    RankCapExceeded {
        what: String,
        rank: usize,
        cap: usize,
    },

    #[error("invalid noise model: {reason}")]
    InvalidNoiseModel { reason: String },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("null bias exceeded for {statistic}: mean {mean:.6} outside tolerance ±{tolerance:.6}")]
    BiasExceeded {
        statistic: String,
        mean: f64,
        tolerance: f64,
    },

    #[error("trial failure rate {rate:.3} exceeds tolerance {tolerance:.3} ({failed}/{attempted}); first failure: {first}")]
    FailureRateExceeded {
        failed: usize,
        attempted: usize,
        rate: f64,
        tolerance: f64,
        first: String,
    },

    #[error("ensemble cancelled after {completed} of {requested} trials")]
    Cancelled { completed: usize, requested: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AuditError {
    pub(crate) fn degenerate(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DegenerateContext {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn dims(what: impl Into<String>, expected: usize, found: usize) -> Self {
        Self::DimensionMismatch {
            what: what.into(),
            expected,
            found,
        }
    }

    pub(crate) fn singular(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SingularUpdate {
            stage: stage.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Short machine-readable name of the error class.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DegenerateContext { .. } => "degenerate_context",
            Self::ResolutionMismatch { .. } => "resolution_mismatch",
            Self::DimensionMismatch { .. } => "dimension_mismatch",
            Self::SingularUpdate { .. } => "singular_update",
            Self::InsufficientBandwidth { .. } => "insufficient_bandwidth",
            Self::CalibrationMissing { .. } => "calibration_missing",
            Self::InvalidResolution { .. } => "invalid_resolution",
            Self::RankCapExceeded { .. } => "rank_cap_exceeded",
            Self::InvalidNoiseModel { .. } => "invalid_noise_model",
            Self::InvalidConfig { .. } => "invalid_config",
            Self::BiasExceeded { .. } => "bias_exceeded",
            Self::FailureRateExceeded { .. } => "failure_rate_exceeded",
            Self::Cancelled { .. } => "cancelled",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }
}

/// Non-fatal numerical instability surfaced alongside a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericalWarning {
    pub stage: String,
    pub condition_number: f64,
    pub threshold: f64,
}

impl std::fmt::Display for NumericalWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: condition number {:.3e} exceeds threshold {:.3e}",
            self.stage, self.condition_number, self.threshold
        )
    }
}
