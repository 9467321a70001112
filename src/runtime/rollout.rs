//! Closed-loop rollouts with injected faults.
//!
//! A rollout builds a fresh [`ControlLoop`], runs it for a fixed number of
//! ticks and folds the tick reports into a [`RolloutSummary`]. Batches run
//! in parallel; every rollout shares the same `Arc` weights and owns the
//! rest of its state.

use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::control_loop::{ControlLoop, TickReport};
use super::plant::{FaultInjection, Plant, SensorNoise};
use super::startup::LoopComponents;
use crate::certificate::CertificateVariant;
use crate::config::LoopConfig;
use crate::dynamics::DynamicsProvider;
use crate::error::LoopError;
use crate::monitor::{FaultState, Transition};

/// One rollout to run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RolloutSpec {
    pub initial_state: Vec<f64>,
    pub ticks: u64,
    #[serde(default)]
    pub faults: Vec<FaultInjection>,
    /// Standard deviation of the sensor noise; 0 disables it. Negative or
    /// non-finite values are rejected.
    #[serde(default)]
    pub noise_std: f64,
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub record_trace: bool,
}

/// Per-tick record kept when `record_trace` is set.
#[derive(Clone, Debug, Serialize)]
pub struct TraceRow {
    pub tick: u64,
    pub state: Vec<f64>,
    pub commanded: Vec<f64>,
    pub applied: Vec<f64>,
    pub h: f64,
    pub derivative: Option<f64>,
    pub relaxation: f64,
    pub variant: CertificateVariant,
    pub fault_state: FaultState,
    pub fault_channel: Option<usize>,
    pub fallback: bool,
}

impl From<&TickReport> for TraceRow {
    fn from(r: &TickReport) -> Self {
        Self {
            tick: r.tick,
            state: r.state.to_vec(),
            commanded: r.commanded.to_vec(),
            applied: r.applied.to_vec(),
            h: r.h,
            derivative: r.derivative,
            relaxation: r.relaxation,
            variant: r.variant,
            fault_state: r.fault_state,
            fault_channel: r.fault_channel,
            fallback: r.filter_status.is_fallback(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RolloutSummary {
    pub ticks: u64,
    /// Fraction of ticks whose state was inside the safe set.
    pub safe_fraction: f64,
    /// Fraction of ticks whose state was inside the unsafe set.
    pub unsafe_fraction: f64,
    /// Fraction of classified states where the sign of h matched the set.
    pub agreement_fraction: f64,
    /// Fraction of ticks where the best reachable rate kept ḣ + decay·h ≥ 0.
    pub rate_feasible_fraction: f64,
    pub fallback_ticks: u64,
    pub suspect_tick: Option<u64>,
    pub confirmation_tick: Option<u64>,
    pub confirmed_channel: Option<usize>,
    pub recovery_tick: Option<u64>,
    pub min_h: f64,
    pub final_state: Vec<f64>,
}

#[derive(Clone, Debug)]
pub struct Rollout {
    pub summary: RolloutSummary,
    pub trace: Vec<TraceRow>,
}

#[derive(Default)]
struct Tally {
    ticks: u64,
    safe: u64,
    unsafe_: u64,
    classified: u64,
    agreed: u64,
    rate_feasible: u64,
    fallback: u64,
    suspect_tick: Option<u64>,
    confirmation_tick: Option<u64>,
    confirmed_channel: Option<usize>,
    recovery_tick: Option<u64>,
    min_h: Option<f64>,
}

impl Tally {
    fn record(&mut self, dynamics: &dyn DynamicsProvider, decay: f64, r: &TickReport) {
        self.ticks += 1;
        let x = r.state.view();
        let safe = dynamics.safe_mask(x);
        let unsafe_ = dynamics.unsafe_mask(x);
        if safe {
            self.safe += 1;
        }
        if unsafe_ {
            self.unsafe_ += 1;
        }
        if safe || unsafe_ {
            self.classified += 1;
            if (safe && r.h >= 0.0) || (unsafe_ && r.h < 0.0) {
                self.agreed += 1;
            }
        }
        if r.achievable_rate + decay * r.h >= 0.0 {
            self.rate_feasible += 1;
        }
        if r.filter_status.is_fallback() {
            self.fallback += 1;
        }
        self.min_h = Some(self.min_h.map_or(r.h, |m| m.min(r.h)));

        // First occurrence of each event.
        match r.transition {
            Transition::Suspected if self.suspect_tick.is_none() => {
                self.suspect_tick = Some(r.tick)
            }
            Transition::Confirmed { channel } if self.confirmation_tick.is_none() => {
                self.confirmation_tick = Some(r.tick);
                self.confirmed_channel = Some(channel);
            }
            Transition::Recovered if self.recovery_tick.is_none() => {
                self.recovery_tick = Some(r.tick)
            }
            _ => {}
        }
    }

    fn finish(self, final_state: Vec<f64>) -> RolloutSummary {
        let frac = |n: u64, d: u64| if d == 0 { 1.0 } else { n as f64 / d as f64 };
        RolloutSummary {
            ticks: self.ticks,
            safe_fraction: frac(self.safe, self.ticks),
            unsafe_fraction: if self.ticks == 0 {
                0.0
            } else {
                self.unsafe_ as f64 / self.ticks as f64
            },
            agreement_fraction: frac(self.agreed, self.classified),
            rate_feasible_fraction: frac(self.rate_feasible, self.ticks),
            fallback_ticks: self.fallback,
            suspect_tick: self.suspect_tick,
            confirmation_tick: self.confirmation_tick,
            confirmed_channel: self.confirmed_channel,
            recovery_tick: self.recovery_tick,
            min_h: self.min_h.unwrap_or(f64::NAN),
            final_state,
        }
    }
}

/// Run one rollout from scratch.
pub fn run_rollout(
    config: &LoopConfig,
    dynamics: Arc<dyn DynamicsProvider>,
    components: &LoopComponents,
    spec: &RolloutSpec,
) -> Result<Rollout, LoopError> {
    let mut plant = spec
        .faults
        .iter()
        .fold(Plant::ideal(), |plant, fault| plant.with_fault(*fault));
    if spec.noise_std != 0.0 {
        plant = plant.with_noise(SensorNoise::new(spec.noise_std, spec.seed)?);
    }

    let mut control = ControlLoop::new(
        config.clone(),
        Arc::clone(&dynamics),
        components.clone(),
        spec.initial_state.clone().into(),
        plant,
    )?;

    let mut tally = Tally::default();
    let mut trace = Vec::new();
    for _ in 0..spec.ticks {
        let report = control.step()?;
        tally.record(dynamics.as_ref(), config.derivative_decay, &report);
        if spec.record_trace {
            trace.push(TraceRow::from(&report));
        }
    }

    let summary = tally.finish(control.state().to_vec());
    tracing::info!(
        ticks = summary.ticks,
        safe = summary.safe_fraction,
        confirmed = ?summary.confirmation_tick,
        recovered = ?summary.recovery_tick,
        "rollout finished"
    );
    Ok(Rollout { summary, trace })
}

/// Run independent rollouts in parallel. Results keep the order of `specs`.
pub fn run_batch(
    config: &LoopConfig,
    dynamics: Arc<dyn DynamicsProvider>,
    components: &LoopComponents,
    specs: &[RolloutSpec],
) -> Vec<Result<Rollout, LoopError>> {
    specs
        .par_iter()
        .map(|spec| run_rollout(config, Arc::clone(&dynamics), components, spec))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dynamics::reference::DecoupledLift;
    use crate::runtime::plant::FaultMode;
    use crate::testing;

    const CHANNELS: usize = 4;
    const WINDOW: usize = 100;

    fn lost_channel_one() -> FaultInjection {
        FaultInjection {
            channel: 1,
            start_tick: 500,
            end_tick: Some(700),
            mode: FaultMode::Zero,
        }
    }

    fn spec(ticks: u64, faults: Vec<FaultInjection>) -> RolloutSpec {
        RolloutSpec {
            initial_state: vec![5.0; CHANNELS],
            ticks,
            faults,
            noise_std: 0.0,
            seed: 0,
            record_trace: false,
        }
    }

    fn run(spec: &RolloutSpec) -> Rollout {
        run_rollout(
            &testing::scenario_config(WINDOW),
            Arc::new(DecoupledLift::new(CHANNELS)),
            &testing::components(CHANNELS, WINDOW),
            spec,
        )
        .expect("rollout")
    }

    #[test]
    fn test_lost_actuator_is_confirmed_then_recovered() {
        let rollout = run(&spec(1_000, vec![lost_channel_one()]));
        let s = &rollout.summary;

        assert_eq!(s.suspect_tick, Some(501));
        let confirmed = s.confirmation_tick.expect("confirmed");
        assert!(
            (500 + WINDOW as u64..=500 + WINDOW as u64 + 75 + 5).contains(&confirmed),
            "confirmed at {confirmed}"
        );
        assert_eq!(s.confirmed_channel, Some(1));

        let recovered = s.recovery_tick.expect("recovered");
        assert!(recovered > 700 && recovered <= 700 + 50 + 5, "recovered at {recovered}");

        assert_eq!(s.unsafe_fraction, 0.0);
        assert_eq!(s.safe_fraction, 1.0);
        assert_eq!(s.agreement_fraction, 1.0);
        assert_eq!(s.fallback_ticks, 0);
        assert!(s.min_h > 0.0);
    }

    #[test]
    fn test_fault_free_run_stays_nominal() {
        let rollout = run(&RolloutSpec {
            record_trace: true,
            ..spec(300, Vec::new())
        });
        let s = &rollout.summary;
        assert!(s.suspect_tick.is_none());
        assert!(s.confirmation_tick.is_none());
        assert_eq!(rollout.trace.len(), 300);
        assert!(rollout.trace.iter().all(|row| {
            row.fault_state == FaultState::Nominal && row.variant == CertificateVariant::Nominal
        }));
        assert!(s.final_state.iter().all(|v| (v - 5.0).abs() < 1e-12));
        assert_eq!(s.rate_feasible_fraction, 1.0);
    }

    #[test]
    fn test_noisy_rollouts_are_reproducible() {
        let noisy = RolloutSpec {
            noise_std: 1e-3,
            seed: 7,
            ..spec(200, Vec::new())
        };
        let a = run(&noisy).summary;
        let b = run(&noisy).summary;
        assert_eq!(a, b);
    }

    #[test]
    fn test_batch_keeps_order() {
        let specs = vec![spec(800, vec![lost_channel_one()]), spec(200, Vec::new())];
        let results = run_batch(
            &testing::scenario_config(WINDOW),
            Arc::new(DecoupledLift::new(CHANNELS)),
            &testing::components(CHANNELS, WINDOW),
            &specs,
        );
        assert_eq!(results.len(), 2);
        let first = results[0].as_ref().expect("first");
        let second = results[1].as_ref().expect("second");
        assert_eq!(first.summary.ticks, 800);
        assert_eq!(first.summary.confirmed_channel, Some(1));
        assert_eq!(second.summary.ticks, 200);
        assert!(second.summary.confirmation_tick.is_none());
    }

    #[test]
    fn test_bad_initial_state_is_an_error() {
        let bad = RolloutSpec {
            initial_state: vec![5.0],
            ..spec(10, Vec::new())
        };
        let err = run_rollout(
            &testing::scenario_config(WINDOW),
            Arc::new(DecoupledLift::new(CHANNELS)),
            &testing::components(CHANNELS, WINDOW),
            &bad,
        )
        .err()
        .expect("error");
        assert!(matches!(err, LoopError::Startup(_)));
    }

    #[test]
    fn test_negative_noise_is_rejected() {
        let bad = RolloutSpec {
            noise_std: -1e-3,
            ..spec(10, Vec::new())
        };
        let err = run_rollout(
            &testing::scenario_config(WINDOW),
            Arc::new(DecoupledLift::new(CHANNELS)),
            &testing::components(CHANNELS, WINDOW),
            &bad,
        )
        .err()
        .expect("error");
        assert!(matches!(err, LoopError::Noise(_)));
    }
}
