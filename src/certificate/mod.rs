//! Learned safety certificates.

pub mod active;
pub mod oracle;
pub mod validation;

pub use active::{CertificatePair, CertificateVariant};
pub use oracle::BarrierOracle;
