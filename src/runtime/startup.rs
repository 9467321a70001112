//! Startup: resolve every artifact before a loop can exist.
//!
//! Each artifact has its own ordered fallback chain. Any chain that runs
//! out of sources aborts startup with a [`StartupError`] naming the
//! artifact and every path tried.

use std::path::{Path, PathBuf};

use crate::certificate::{BarrierOracle, CertificatePair};
use crate::dynamics::DynamicsProvider;
use crate::error::StartupError;
use crate::identify::{FaultIdentifier, IdentifierArtifact};
use crate::network::artifact::{CertificateArtifact, FallbackChain};

pub const NOMINAL_CERTIFICATE: &str = "nominal_certificate";
pub const FAULT_TOLERANT_CERTIFICATE: &str = "fault_tolerant_certificate";
pub const IDENTIFIER: &str = "identifier";

/// Where to look for each artifact.
#[derive(Clone, Debug)]
pub struct ArtifactSources {
    pub nominal: FallbackChain,
    pub fault_tolerant: FallbackChain,
    pub identifier: FallbackChain,
}

impl ArtifactSources {
    /// Search `dirs` in order; within a directory try `<stem>.bin` then
    /// `<stem>.json`.
    pub fn from_dirs<P: AsRef<Path>>(dirs: &[P]) -> Self {
        let chain = |kind: &str, stem: &str| {
            dirs.iter().fold(FallbackChain::new(kind), |chain, dir| {
                chain
                    .then(dir.as_ref().join(format!("{stem}.bin")))
                    .then(dir.as_ref().join(format!("{stem}.json")))
            })
        };
        Self {
            nominal: chain("nominal certificate", NOMINAL_CERTIFICATE),
            fault_tolerant: chain("fault-tolerant certificate", FAULT_TOLERANT_CERTIFICATE),
            identifier: chain("identifier", IDENTIFIER),
        }
    }
}

/// Everything loaded from disk, immutable for the life of the loop.
#[derive(Clone, Debug)]
pub struct LoopComponents {
    pub certificates: CertificatePair,
    pub identifier: FaultIdentifier,
    /// Paths the three artifacts were loaded from.
    pub sources: Vec<PathBuf>,
}

/// Resolve all three chains against `dynamics`.
pub fn load_components(
    sources: &ArtifactSources,
    dynamics: &dyn DynamicsProvider,
) -> Result<LoopComponents, StartupError> {
    let n = dynamics.n_dims();
    let m = dynamics.n_controls();
    let p = dynamics.output_dim();
    let envelope = dynamics.safe_limits();

    let certificate_fits = |a: &CertificateArtifact| -> Result<(), String> {
        a.validate()?;
        if a.state_dim != n {
            return Err(format!("trained for {} states, system has {n}", a.state_dim));
        }
        Ok(())
    };
    let nominal = sources.nominal.resolve(certificate_fits)?;
    let fault_tolerant = sources.fault_tolerant.resolve(certificate_fits)?;

    let identifier = sources.identifier.resolve(|a: &IdentifierArtifact| -> Result<(), String> {
        a.validate()?;
        if a.control_dim != m || a.output_dim != p {
            return Err(format!(
                "built for {} channels and {} outputs, system has {m} and {p}",
                a.control_dim, a.output_dim
            ));
        }
        Ok(())
    })?;

    let used = vec![
        nominal.source.clone(),
        fault_tolerant.source.clone(),
        identifier.source.clone(),
    ];
    let fallbacks = [
        nominal.used_fallback(),
        fault_tolerant.used_fallback(),
        identifier.used_fallback(),
    ]
    .iter()
    .filter(|f| **f)
    .count();

    let certificates = CertificatePair::new(
        BarrierOracle::new(nominal.artifact, &envelope)?,
        BarrierOracle::new(fault_tolerant.artifact, &envelope)?,
    )?;
    let identifier = FaultIdentifier::new(identifier.artifact)?;

    tracing::info!(
        states = n,
        channels = m,
        window = identifier.window_len(),
        fallbacks,
        "loop components loaded"
    );
    Ok(LoopComponents {
        certificates,
        identifier,
        sources: used,
    })
}
