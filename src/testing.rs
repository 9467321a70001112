//! Hand-built artifacts shared by the unit tests.
//!
//! The certificates are affine in the normalized state and the identifier
//! is a single linear layer that reads only the Δy columns, so expected
//! behavior can be worked out by hand.

use ndarray::{Array1, Array2};

use crate::certificate::{BarrierOracle, CertificatePair};
use crate::config::LoopConfig;
use crate::dynamics::reference::DecoupledLift;
use crate::dynamics::DynamicsProvider;
use crate::identify::{FaultIdentifier, IdentifierArtifact, IdentifierModel};
use crate::network::artifact::CertificateArtifact;
use crate::network::layers::{FeedForward, Layer};
use crate::runtime::startup::LoopComponents;

fn affine_certificate(name: &str, channels: usize, bias: f64) -> CertificateArtifact {
    CertificateArtifact {
        name: name.to_string(),
        state_dim: channels,
        network: FeedForward::new(vec![Layer::linear(
            Array2::ones((1, channels)),
            Array1::from_elem(1, bias),
        )]),
    }
}

/// h = Σ normalized state + 1; equals 1 at the goal of [`DecoupledLift`].
pub fn nominal_certificate(channels: usize) -> CertificateArtifact {
    affine_certificate("nominal", channels, 1.0)
}

/// Same slope as the nominal certificate with more margin.
pub fn fault_tolerant_certificate(channels: usize) -> CertificateArtifact {
    affine_certificate("fault_tolerant", channels, 1.5)
}

/// logitⱼ = 4 − 6 · Σₜ Δyⱼ(t). A channel whose output falls short of the
/// prediction by 1.0 summed over the window gets a low confidence.
pub fn shortfall_identifier(window_len: usize, channels: usize) -> IdentifierArtifact {
    let width = 3 * channels;
    let mut weight = Array2::zeros((channels, window_len * width));
    for t in 0..window_len {
        for j in 0..channels {
            weight[[j, t * width + channels + j]] = -6.0;
        }
    }
    IdentifierArtifact {
        window_len,
        output_dim: channels,
        control_dim: channels,
        model: IdentifierModel::Feedforward {
            head: FeedForward::new(vec![Layer::linear(weight, Array1::from_elem(channels, 4.0))]),
        },
    }
}

/// Components for a [`DecoupledLift`] with `channels` channels, built in
/// memory.
pub fn components(channels: usize, window_len: usize) -> LoopComponents {
    let envelope = DecoupledLift::new(channels).safe_limits();
    let certificates = CertificatePair::new(
        BarrierOracle::new(nominal_certificate(channels), &envelope).expect("nominal"),
        BarrierOracle::new(fault_tolerant_certificate(channels), &envelope)
            .expect("fault tolerant"),
    )
    .expect("pair");
    LoopComponents {
        certificates,
        identifier: FaultIdentifier::new(shortfall_identifier(window_len, channels))
            .expect("identifier"),
        sources: Vec::new(),
    }
}

/// Loop settings tuned for the shortfall identifier.
pub fn scenario_config(window_len: usize) -> LoopConfig {
    LoopConfig {
        window_len,
        detection_threshold: 0.02,
        confirm_persistence: 75,
        confirm_confidence: 0.2,
        relaxation_penalty: 1e-3,
        recovery_threshold: 0.1,
        recovery_persistence: 50,
        derivative_decay: 0.1,
        ..LoopConfig::default()
    }
}
