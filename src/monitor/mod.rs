//! Online fault detection from the certificate derivative.

pub mod derivative;
pub mod fault_monitor;

pub use derivative::DerivativeEstimator;
pub use fault_monitor::{
    DetectionSource, FaultMonitor, FaultState, MonitorCounters, MonitorSettings, Transition,
};
