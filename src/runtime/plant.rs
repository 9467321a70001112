//! Plant-side effects the controller does not know about: actuator faults
//! and sensor noise.

use ndarray::{Array1, ArrayView1};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::error::LoopError;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FaultMode {
    /// Channel produces nothing.
    Zero,
    /// Channel is stuck at a fixed value.
    Stuck { value: f64 },
    /// Channel delivers a fraction of the command.
    Scaled { factor: f64 },
}

/// A fault on one channel over ticks `[start_tick, end_tick)`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FaultInjection {
    pub channel: usize,
    pub start_tick: u64,
    /// Exclusive. `None` keeps the fault for the rest of the run.
    pub end_tick: Option<u64>,
    pub mode: FaultMode,
}

impl FaultInjection {
    pub fn is_active(&self, tick: u64) -> bool {
        tick >= self.start_tick && self.end_tick.map_or(true, |end| tick < end)
    }

    fn apply(&self, u: &mut Array1<f64>) {
        if let Some(v) = u.get_mut(self.channel) {
            *v = match self.mode {
                FaultMode::Zero => 0.0,
                FaultMode::Stuck { value } => value,
                FaultMode::Scaled { factor } => *v * factor,
            };
        }
    }
}

/// Additive Gaussian noise on the measured output.
#[derive(Clone, Debug)]
pub struct SensorNoise {
    distribution: Normal<f64>,
    rng: StdRng,
}

impl SensorNoise {
    /// `std_dev` must be finite and non-negative.
    pub fn new(std_dev: f64, seed: u64) -> Result<Self, LoopError> {
        if !(std_dev.is_finite() && std_dev >= 0.0) {
            return Err(LoopError::Noise(format!(
                "standard deviation must be finite and non-negative, got {std_dev}"
            )));
        }
        let distribution =
            Normal::new(0.0, std_dev).map_err(|e| LoopError::Noise(e.to_string()))?;
        Ok(Self {
            distribution,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn corrupt(&mut self, y: &mut Array1<f64>) {
        for v in y.iter_mut() {
            *v += self.distribution.sample(&mut self.rng);
        }
    }
}

/// What happens between the emitted control and the physical system.
#[derive(Clone, Debug, Default)]
pub struct Plant {
    faults: Vec<FaultInjection>,
    noise: Option<SensorNoise>,
}

impl Plant {
    /// Actuators deliver exactly what is commanded and sensors are exact.
    pub fn ideal() -> Self {
        Self::default()
    }

    pub fn with_fault(mut self, fault: FaultInjection) -> Self {
        self.faults.push(fault);
        self
    }

    pub fn with_noise(mut self, noise: SensorNoise) -> Self {
        self.noise = Some(noise);
        self
    }

    /// Control actually applied at `tick`.
    pub fn actuate(&self, tick: u64, commanded: ArrayView1<f64>) -> Array1<f64> {
        let mut applied = commanded.to_owned();
        for fault in self.faults.iter().filter(|f| f.is_active(tick)) {
            fault.apply(&mut applied);
        }
        applied
    }

    /// Measured output.
    pub fn sense(&mut self, mut y: Array1<f64>) -> Array1<f64> {
        if let Some(noise) = self.noise.as_mut() {
            noise.corrupt(&mut y);
        }
        y
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_fault_window_is_half_open() {
        let f = FaultInjection {
            channel: 0,
            start_tick: 5,
            end_tick: Some(7),
            mode: FaultMode::Zero,
        };
        assert!(!f.is_active(4));
        assert!(f.is_active(5));
        assert!(f.is_active(6));
        assert!(!f.is_active(7));
    }

    #[test]
    fn test_fault_modes() {
        let u = array![1.0, 2.0, 3.0];
        let plant = Plant::ideal()
            .with_fault(FaultInjection {
                channel: 0,
                start_tick: 0,
                end_tick: None,
                mode: FaultMode::Zero,
            })
            .with_fault(FaultInjection {
                channel: 1,
                start_tick: 0,
                end_tick: None,
                mode: FaultMode::Stuck { value: 0.5 },
            })
            .with_fault(FaultInjection {
                channel: 2,
                start_tick: 0,
                end_tick: None,
                mode: FaultMode::Scaled { factor: 0.2 },
            });
        let applied = plant.actuate(10, u.view());
        assert_eq!(applied[0], 0.0);
        assert_eq!(applied[1], 0.5);
        assert!((applied[2] - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_out_of_range_channel_is_ignored() {
        let plant = Plant::ideal().with_fault(FaultInjection {
            channel: 9,
            start_tick: 0,
            end_tick: None,
            mode: FaultMode::Zero,
        });
        assert_eq!(plant.actuate(0, array![1.0].view()), array![1.0]);
    }

    #[test]
    fn test_noise_is_seeded() {
        let mut a = Plant::ideal().with_noise(SensorNoise::new(0.1, 42).expect("noise"));
        let mut b = Plant::ideal().with_noise(SensorNoise::new(0.1, 42).expect("noise"));
        let ya = a.sense(array![1.0, 2.0]);
        let yb = b.sense(array![1.0, 2.0]);
        assert_eq!(ya, yb);
        assert!(ya != array![1.0, 2.0]);
    }

    #[test]
    fn test_noise_rejects_bad_std_dev() {
        for std_dev in [-1.0, -1e-9, f64::NAN, f64::INFINITY] {
            assert!(
                matches!(SensorNoise::new(std_dev, 0), Err(LoopError::Noise(_))),
                "{std_dev}"
            );
        }
        assert!(SensorNoise::new(0.0, 0).is_ok());
    }

    #[test]
    fn test_fault_mode_json() {
        let f: FaultInjection = serde_json::from_str(
            r#"{ "channel": 1, "start_tick": 500, "end_tick": 700, "mode": { "mode": "zero" } }"#,
        )
        .expect("parse");
        assert_eq!(f.mode, FaultMode::Zero);
        let s: FaultMode =
            serde_json::from_str(r#"{ "mode": "stuck", "value": 0.3 }"#).expect("parse");
        assert_eq!(s, FaultMode::Stuck { value: 0.3 });
    }
}
