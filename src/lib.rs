//! # ftcbf
//!
//! **Fault-tolerant certificate filtering**: a fixed-cadence control loop
//! that keeps a control-affine system inside a learned safe set while one
//! of its actuators may fail.
//!
//! ## Components
//!
//! 1. **Barrier oracle**: pretrained network h(x) with an analytic gradient
//! 2. **Safety filter**: per-tick QP projecting the nominal control onto
//!    the certificate constraint
//! 3. **Fault monitor**: NOMINAL / SUSPECT / CONFIRMED state machine driven
//!    by the estimated certificate derivative
//! 4. **Fault identifier**: window classifier scoring each actuator channel
//! 5. **Trajectory buffer**: fixed-length history feeding the identifier
//!
//! ## Tick
//!
//! dynamics → certificate → QP → integrate → window → derivative →
//! identifier → transition. See [`runtime::ControlLoop::step`].

pub mod certificate;
pub mod config;
pub mod dynamics;
pub mod error;
pub mod filter;
pub mod identify;
pub mod monitor;
pub mod network;
pub mod runtime;

#[cfg(test)]
pub(crate) mod testing;

/// Numerical constants shared across components.
pub mod defaults {
    /// Substituted for h when the certificate is exactly zero, so the
    /// relaxation column of the QP never vanishes.
    pub const H_EPSILON: f64 = 1e-4;

    /// Weight of h in the derivative estimate ḣ + decay · h.
    pub const DERIVATIVE_DECAY: f64 = 0.1;

    /// Default sampled states per region when validating a certificate.
    pub const VALIDATION_SAMPLES: usize = 2000;
}
