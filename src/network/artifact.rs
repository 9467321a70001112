//! Pretrained weight artifacts: encoding and the startup fallback chain.
//!
//! Artifacts are serde values stored either as bincode (`.bin`, the
//! default) or JSON (`.json`). Loading happens once, before the control loop
//! exists; a chain of candidate paths is tried in order and the first one
//! that decodes and passes validation wins.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ArtifactError, LoadAttempt, StartupError};
use crate::network::layers::FeedForward;

/// On-disk encoding, chosen from the file extension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encoding {
    Bincode,
    Json,
}

impl Encoding {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Encoding::Json,
            _ => Encoding::Bincode,
        }
    }
}

/// Weights of one scalar certificate network.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CertificateArtifact {
    /// Free-form label (e.g. "nominal", "fault_tolerant").
    pub name: String,

    /// State dimension the network was trained on.
    pub state_dim: usize,

    pub network: FeedForward,
}

impl CertificateArtifact {
    /// Structural checks that do not need the dynamics model.
    pub fn validate(&self) -> Result<(), String> {
        self.network.validate()?;
        if self.network.input_dim() != Some(self.state_dim) {
            return Err(format!(
                "network input width {:?} does not match state_dim {}",
                self.network.input_dim(),
                self.state_dim
            ));
        }
        if self.network.output_dim() != Some(1) {
            return Err(format!(
                "certificate must have a scalar output, got {:?}",
                self.network.output_dim()
            ));
        }
        Ok(())
    }
}

/// Read and decode an artifact.
pub fn load<T: DeserializeOwned>(path: &Path) -> Result<T, ArtifactError> {
    let bytes = std::fs::read(path).map_err(|source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    decode(&bytes, Encoding::from_path(path)).map_err(|reason| ArtifactError::Decode {
        path: path.to_path_buf(),
        reason,
    })
}

/// Encode and write an artifact.
pub fn save<T: Serialize>(value: &T, path: &Path) -> Result<(), ArtifactError> {
    let bytes = match Encoding::from_path(path) {
        Encoding::Bincode => {
            bincode::serialize(value).map_err(|e| ArtifactError::Encode(e.to_string()))?
        }
        Encoding::Json => {
            serde_json::to_vec_pretty(value).map_err(|e| ArtifactError::Encode(e.to_string()))?
        }
    };
    std::fs::write(path, bytes).map_err(|source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn decode<T: DeserializeOwned>(bytes: &[u8], encoding: Encoding) -> Result<T, String> {
    match encoding {
        Encoding::Bincode => bincode::deserialize(bytes).map_err(|e| e.to_string()),
        Encoding::Json => serde_json::from_slice(bytes).map_err(|e| e.to_string()),
    }
}

/// A successfully resolved artifact and where it came from.
#[derive(Debug)]
pub struct Loaded<T> {
    pub artifact: T,
    pub source: PathBuf,
    /// Failed attempts before `source` succeeded.
    pub skipped: Vec<LoadAttempt>,
}

impl<T> Loaded<T> {
    /// Whether a fallback (not the primary source) was used.
    pub fn used_fallback(&self) -> bool {
        !self.skipped.is_empty()
    }
}

/// Ordered list of candidate locations for one artifact.
#[derive(Clone, Debug)]
pub struct FallbackChain {
    pub kind: String,
    pub sources: Vec<PathBuf>,
}

impl FallbackChain {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            sources: Vec::new(),
        }
    }

    /// Append a candidate; earlier candidates take precedence.
    pub fn then(mut self, path: impl Into<PathBuf>) -> Self {
        self.sources.push(path.into());
        self
    }

    /// Try each source in order. `validate` runs on every decoded artifact;
    /// a validation failure counts as a failed attempt and the chain moves on.
    /// A chain with no sources fails with [`ArtifactError::NoSources`].
    pub fn resolve<T, F>(&self, validate: F) -> Result<Loaded<T>, StartupError>
    where
        T: DeserializeOwned,
        F: Fn(&T) -> Result<(), String>,
    {
        if self.sources.is_empty() {
            return Err(ArtifactError::NoSources {
                kind: self.kind.clone(),
            }
            .into());
        }
        let mut attempts = Vec::new();
        for path in &self.sources {
            let outcome = load::<T>(path).and_then(|artifact| match validate(&artifact) {
                Ok(()) => Ok(artifact),
                Err(reason) => Err(ArtifactError::Malformed {
                    path: path.clone(),
                    reason,
                }),
            });
            match outcome {
                Ok(artifact) => {
                    tracing::info!(
                        kind = %self.kind,
                        source = %path.display(),
                        fallbacks_skipped = attempts.len(),
                        "artifact loaded"
                    );
                    return Ok(Loaded {
                        artifact,
                        source: path.clone(),
                        skipped: attempts,
                    });
                }
                Err(error) => {
                    tracing::warn!(
                        kind = %self.kind,
                        source = %path.display(),
                        %error,
                        "artifact source failed, trying next"
                    );
                    attempts.push(LoadAttempt {
                        path: path.clone(),
                        error,
                    });
                }
            }
        }
        Err(StartupError::ArtifactUnavailable {
            kind: self.kind.clone(),
            attempts,
        })
    }
}
