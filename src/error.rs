//! Typed failures for the control stack.
//!
//! Recoverable conditions (QP infeasibility, a rejected identifier report)
//! never surface as `Err` from the per-tick path; they are folded into the
//! tick report and logged. Everything here is either a startup failure or a
//! caller contract violation.

use std::path::PathBuf;

use thiserror::Error;

/// A vector or matrix did not have the dimension a component was built for.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{what}: expected {expected}, got {actual}")]
pub struct DimensionError {
    pub what: &'static str,
    pub expected: usize,
    pub actual: usize,
}

impl DimensionError {
    pub fn check(what: &'static str, expected: usize, actual: usize) -> Result<(), Self> {
        if expected == actual {
            Ok(())
        } else {
            Err(Self {
                what,
                expected,
                actual,
            })
        }
    }
}

/// Reasons the QP solver could not return a solution.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QpError {
    #[error("box bounds are contradictory on variable {index}: {lower} > {upper}")]
    ContradictoryBounds { index: usize, lower: f64, upper: f64 },

    #[error("inequality row {row} cannot be satisfied inside the box (best {best:.6e} > {rhs:.6e})")]
    Infeasible { row: usize, best: f64, rhs: f64 },

    #[error("no convergence after {iterations} iterations (max violation {violation:.3e})")]
    NotConverged { iterations: usize, violation: f64 },

    #[error("objective weight on variable {index} must be positive and finite, got {weight}")]
    InvalidObjective { index: usize, weight: f64 },

    #[error("problem data is not finite")]
    NonFinite,

    #[error(transparent)]
    Dimension(#[from] DimensionError),
}

/// Artifact (network weights) load/save failures.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode {path}: {reason}")]
    Decode { path: PathBuf, reason: String },

    #[error("failed to encode artifact: {0}")]
    Encode(String),

    #[error("artifact {path} is malformed: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("no source configured for {kind} artifact")]
    NoSources { kind: String },
}

/// Configuration validation failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{field} must be {requirement}, got {value}")]
    OutOfRange {
        field: &'static str,
        requirement: &'static str,
        value: f64,
    },

    #[error("{field} has {actual} entries but the system has {expected} control channels")]
    ChannelCount {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("recovery_threshold ({recovery}) must exceed detection_threshold ({detection})")]
    ThresholdOrder { detection: f64, recovery: f64 },
}

/// One failed attempt in an artifact fallback chain.
#[derive(Debug)]
pub struct LoadAttempt {
    pub path: PathBuf,
    pub error: ArtifactError,
}

/// Fatal startup failure: the loop must not run.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("every source for the {kind} artifact failed: {}", format_attempts(.attempts))]
    ArtifactUnavailable {
        kind: String,
        attempts: Vec<LoadAttempt>,
    },

    #[error("{kind} artifact is incompatible with the system: {reason}")]
    Incompatible { kind: String, reason: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Dimension(#[from] DimensionError),
}

/// Failures while building or running a loop outside the per-tick
/// recoverable paths.
#[derive(Debug, Error)]
pub enum LoopError {
    #[error(transparent)]
    Startup(#[from] StartupError),

    #[error(transparent)]
    Dimension(#[from] DimensionError),

    #[error("invalid sensor noise: {0}")]
    Noise(String),
}

fn format_attempts(attempts: &[LoadAttempt]) -> String {
    if attempts.is_empty() {
        return "no sources configured".to_string();
    }
    attempts
        .iter()
        .map(|a| format!("[{}: {}]", a.path.display(), a.error))
        .collect::<Vec<_>>()
        .join(" ")
}
