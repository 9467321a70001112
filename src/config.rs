//! Runtime configuration for the control loop.
//!
//! Every tunable lives in [`LoopConfig`] and is threaded into the loop
//! constructor. Configs are JSON files; missing fields take their defaults.

use std::path::Path;

use anyhow::{Context, Result};
use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::defaults;
use crate::dynamics::Limits;
use crate::error::ConfigError;
use crate::filter::FilterSettings;
use crate::monitor::DetectionSource;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Control period in seconds.
    pub dt: f64,

    /// Identifier window length L.
    pub window_len: usize,

    /// ḣ_est below this raises suspicion.
    pub detection_threshold: f64,

    /// Ticks a suspicion and an identifier candidate must both persist.
    pub confirm_persistence: usize,

    /// ḣ_est above this counts toward recovery.
    pub recovery_threshold: f64,

    pub recovery_persistence: usize,

    /// Worst-case magnitude per channel used when a channel is faulted.
    /// Defaults to the larger absolute control limit.
    pub actuator_bounds: Option<Vec<f64>>,

    /// ρ on the relaxation coefficient.
    pub relaxation_penalty: f64,

    /// Upper bound on the relaxation coefficient. Unbounded when absent.
    pub relaxation_cap: Option<f64>,

    /// Decay weight in ḣ_est = Δh/dt + decay · h.
    pub derivative_decay: f64,

    /// Identifier min confidence below this raises suspicion
    /// (identifier-driven detection only).
    pub confidence_threshold: f64,

    /// Identifier min confidence must stay below this to confirm.
    pub confirm_confidence: f64,

    pub detection_source: DetectionSource,

    /// Objective weight per channel. Defaults to 1.
    pub control_weights: Option<Vec<f64>>,

    /// Run the identifier every N ticks once the window is full.
    pub identify_every: usize,

    /// Scale the faulted channel's exclusion by the identifier's loss
    /// estimate instead of excluding it fully.
    pub graded_authority: bool,

    /// QP solves slower than this are counted as over budget.
    pub qp_budget_us: u64,

    /// Samples kept per telemetry metric.
    pub telemetry_window: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            dt: 0.01,
            window_len: 100,
            detection_threshold: 0.0,
            confirm_persistence: 75,
            recovery_threshold: 0.1,
            recovery_persistence: 50,
            actuator_bounds: None,
            relaxation_penalty: 1.0,
            relaxation_cap: None,
            derivative_decay: defaults::DERIVATIVE_DECAY,
            confidence_threshold: 0.5,
            confirm_confidence: 0.2,
            detection_source: DetectionSource::Derivative,
            control_weights: None,
            identify_every: 1,
            graded_authority: false,
            qp_budget_us: 1_000,
            telemetry_window: 1_000,
        }
    }
}

impl LoopConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    pub fn save_json(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text).with_context(|| format!("writing config {}", path.display()))
    }

    /// Check ranges and per-channel table widths against `n_controls`.
    pub fn validate(&self, n_controls: usize) -> Result<(), ConfigError> {
        positive("dt", self.dt)?;
        positive("relaxation_penalty", self.relaxation_penalty)?;
        at_least_one("window_len", self.window_len)?;
        at_least_one("confirm_persistence", self.confirm_persistence)?;
        at_least_one("recovery_persistence", self.recovery_persistence)?;
        at_least_one("identify_every", self.identify_every)?;
        at_least_one("telemetry_window", self.telemetry_window)?;
        finite("detection_threshold", self.detection_threshold)?;
        finite("recovery_threshold", self.recovery_threshold)?;
        if !(self.derivative_decay.is_finite() && self.derivative_decay >= 0.0) {
            return Err(ConfigError::OutOfRange {
                field: "derivative_decay",
                requirement: "finite and non-negative",
                value: self.derivative_decay,
            });
        }
        unit_interval("confidence_threshold", self.confidence_threshold)?;
        unit_interval("confirm_confidence", self.confirm_confidence)?;
        if let Some(cap) = self.relaxation_cap {
            if cap.is_nan() || cap < 0.0 {
                return Err(ConfigError::OutOfRange {
                    field: "relaxation_cap",
                    requirement: "non-negative",
                    value: cap,
                });
            }
        }
        if self.recovery_threshold <= self.detection_threshold {
            return Err(ConfigError::ThresholdOrder {
                detection: self.detection_threshold,
                recovery: self.recovery_threshold,
            });
        }
        if let Some(bounds) = &self.actuator_bounds {
            channel_table("actuator_bounds", bounds, n_controls)?;
            for b in bounds {
                if !(b.is_finite() && *b >= 0.0) {
                    return Err(ConfigError::OutOfRange {
                        field: "actuator_bounds",
                        requirement: "finite and non-negative",
                        value: *b,
                    });
                }
            }
        }
        if let Some(weights) = &self.control_weights {
            channel_table("control_weights", weights, n_controls)?;
            for w in weights {
                positive("control_weights", *w)?;
            }
        }
        Ok(())
    }

    /// Filter parameters for a system with the given control box.
    pub fn filter_settings(&self, control_limits: &Limits) -> FilterSettings {
        let mut settings = FilterSettings::for_limits(control_limits, self.relaxation_penalty);
        if let Some(w) = &self.control_weights {
            settings.control_weights = Array1::from(w.clone());
        }
        if let Some(b) = &self.actuator_bounds {
            settings.actuator_bounds = Array1::from(b.clone());
        }
        settings.relaxation_cap = self.relaxation_cap.unwrap_or(f64::INFINITY);
        settings
    }
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            requirement: "finite and positive",
            value,
        })
    }
}

fn finite(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            requirement: "finite",
            value,
        })
    }
}

fn at_least_one(field: &'static str, value: usize) -> Result<(), ConfigError> {
    if value >= 1 {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            requirement: "at least 1",
            value: value as f64,
        })
    }
}

fn unit_interval(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            requirement: "within [0, 1]",
            value,
        })
    }
}

fn channel_table(field: &'static str, table: &[f64], n_controls: usize) -> Result<(), ConfigError> {
    if table.len() == n_controls {
        Ok(())
    } else {
        Err(ConfigError::ChannelCount {
            field,
            expected: n_controls,
            actual: table.len(),
        })
    }
}
