//! Actuator fault identification from recent trajectory history.

pub mod classifier;
pub mod lstm;
pub mod window;

pub use classifier::{FaultIdentifier, IdentifierArtifact, IdentifierModel, IdentifierReport};
pub use window::{TrajectoryBuffer, WindowSample};
