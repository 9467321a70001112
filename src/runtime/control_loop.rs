//! The fault-tolerant control loop.
//!
//! One call to [`ControlLoop::step`] runs a full tick in a fixed order:
//! dynamics → certificate → safety QP → integrate → window update →
//! derivative estimate → identifier → monitor transition. The loop holds
//! no resources between ticks, so a caller may stop after any step.

use std::sync::Arc;
use std::time::Instant;

use ndarray::Array1;

use super::health::{HealthMonitor, HealthReport};
use super::plant::Plant;
use super::startup::LoopComponents;
use crate::certificate::{CertificatePair, CertificateVariant};
use crate::config::LoopConfig;
use crate::dynamics::integrate::euler_step;
use crate::dynamics::DynamicsProvider;
use crate::error::{DimensionError, StartupError};
use crate::filter::{achievable_rate, ChannelFault, FilterInput, FilterStatus, SafetyFilter};
use crate::identify::{FaultIdentifier, IdentifierReport, TrajectoryBuffer, WindowSample};
use crate::monitor::{DerivativeEstimator, FaultMonitor, FaultState, MonitorSettings, Transition};

/// Everything observable about one tick.
#[derive(Clone, Debug)]
pub struct TickReport {
    pub tick: u64,
    /// State the tick started from.
    pub state: Array1<f64>,
    /// State after integration.
    pub next_state: Array1<f64>,
    /// Control emitted by the filter.
    pub commanded: Array1<f64>,
    /// Control the plant actually applied.
    pub applied: Array1<f64>,
    pub h: f64,
    pub derivative: Option<f64>,
    /// Best certificate rate reachable inside the control box.
    pub achievable_rate: f64,
    pub relaxation: f64,
    pub variant: CertificateVariant,
    pub fault: Option<ChannelFault>,
    pub filter_status: FilterStatus,
    pub qp_latency_us: f64,
    pub identifier: Option<IdentifierReport>,
    pub transition: Transition,
    /// Monitor state after this tick's transition.
    pub fault_state: FaultState,
    pub fault_channel: Option<usize>,
}

pub struct ControlLoop {
    config: LoopConfig,
    dynamics: Arc<dyn DynamicsProvider>,
    certificates: CertificatePair,
    identifier: FaultIdentifier,
    filter: SafetyFilter,
    monitor: FaultMonitor,
    estimator: DerivativeEstimator,
    buffer: TrajectoryBuffer,
    plant: Plant,
    health: HealthMonitor,
    state: Array1<f64>,
    tick: u64,
    last_control: Option<Array1<f64>>,
    last_report: Option<IdentifierReport>,
    full_ticks: u64,
}

impl ControlLoop {
    pub fn new(
        config: LoopConfig,
        dynamics: Arc<dyn DynamicsProvider>,
        components: LoopComponents,
        initial_state: Array1<f64>,
        plant: Plant,
    ) -> Result<Self, StartupError> {
        let n = dynamics.n_dims();
        let m = dynamics.n_controls();
        config.validate(m)?;
        DimensionError::check("initial state", n, initial_state.len())?;
        DimensionError::check("certificate state", n, components.certificates.state_dim())?;

        let identifier = components.identifier;
        if identifier.window_len() != config.window_len {
            return Err(StartupError::Incompatible {
                kind: "identifier".to_string(),
                reason: format!(
                    "window length {} differs from configured {}",
                    identifier.window_len(),
                    config.window_len
                ),
            });
        }
        if identifier.control_dim() != m || identifier.output_dim() != dynamics.output_dim() {
            return Err(StartupError::Incompatible {
                kind: "identifier".to_string(),
                reason: format!(
                    "built for {} channels and {} outputs, system has {m} and {}",
                    identifier.control_dim(),
                    identifier.output_dim(),
                    dynamics.output_dim()
                ),
            });
        }

        let control_limits = dynamics.control_limits();
        if let Some(i) = control_limits.first_inverted() {
            return Err(StartupError::Incompatible {
                kind: "dynamics".to_string(),
                reason: format!("control limits inverted on channel {i}"),
            });
        }
        let filter = SafetyFilter::new(config.filter_settings(&control_limits), control_limits)?;

        let buffer = TrajectoryBuffer::new(config.window_len, dynamics.output_dim(), m);
        let monitor = FaultMonitor::new(MonitorSettings::from(&config), m);
        let estimator = DerivativeEstimator::new(config.dt, config.derivative_decay);
        let health = HealthMonitor::new(config.telemetry_window, config.qp_budget_us);

        tracing::info!(
            states = n,
            channels = m,
            dt = config.dt,
            window = config.window_len,
            "control loop ready"
        );
        Ok(Self {
            config,
            dynamics,
            certificates: components.certificates,
            identifier,
            filter,
            monitor,
            estimator,
            buffer,
            plant,
            health,
            state: initial_state,
            tick: 0,
            last_control: None,
            last_report: None,
            full_ticks: 0,
        })
    }

    pub fn fault_state(&self) -> FaultState {
        self.monitor.state()
    }

    pub fn fault_channel(&self) -> Option<usize> {
        self.monitor.channel()
    }

    pub fn last_control(&self) -> Option<&Array1<f64>> {
        self.last_control.as_ref()
    }

    pub fn state(&self) -> &Array1<f64> {
        &self.state
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn telemetry(&self) -> HealthReport {
        self.health.report()
    }

    /// Fault the filter should account for this tick.
    fn active_fault(&self) -> Option<ChannelFault> {
        let channel = self.monitor.channel()?;
        if self.config.graded_authority {
            if let Some(report) = &self.last_report {
                let loss = report.loss_estimate();
                if let Some(l) = loss.get(channel) {
                    return Some(ChannelFault::partial(channel, *l));
                }
            }
        }
        Some(ChannelFault::total(channel))
    }

    /// Feed the monitor. Only reports the monitor admits are kept for
    /// graded authority.
    fn observe(
        &mut self,
        tick: u64,
        derivative: Option<f64>,
        report: Option<&IdentifierReport>,
    ) -> Transition {
        let transition = self.monitor.observe(tick, derivative, report);
        if let Some(r) = report.filter(|r| self.monitor.admits(r)) {
            self.last_report = Some(r.clone());
        }
        transition
    }

    /// Run one tick.
    pub fn step(&mut self) -> Result<TickReport, DimensionError> {
        let tick = self.tick;
        let x = self.state.view();
        let dynamics = self.dynamics.as_ref();

        let f = dynamics.f(x);
        let g = dynamics.g(x);
        let u_ref = dynamics.nominal_control(x);

        let variant = self.monitor.state().certificate_variant();
        let (h, grad_h) = self.certificates.get(variant).evaluate(x)?;
        let fault = self.active_fault();

        let started = Instant::now();
        let outcome = self.filter.solve(&FilterInput {
            u_ref: u_ref.view(),
            f: f.view(),
            g: g.view(),
            h,
            grad_h: grad_h.view(),
            fault,
        })?;
        let qp_latency_us = started.elapsed().as_secs_f64() * 1e6;
        let rate = achievable_rate(grad_h.view(), f.view(), g.view(), self.filter.limits(), fault);

        let applied = self.plant.actuate(tick, outcome.u.view());
        let predicted = euler_step(dynamics, x, outcome.u.view(), self.config.dt);
        let next = euler_step(dynamics, x, applied.view(), self.config.dt);

        let y = self.plant.sense(dynamics.output(next.view()));
        let dy = dynamics.output(predicted.view()) - &y;
        self.buffer.push(WindowSample {
            y,
            dy,
            u: outcome.u.clone(),
        })?;

        let derivative = self.estimator.update(h);

        let report = if self.buffer.is_full() {
            self.full_ticks += 1;
            if (self.full_ticks - 1) % self.config.identify_every as u64 == 0 {
                self.identifier.identify(&self.buffer)
            } else {
                None
            }
        } else {
            None
        };

        let transition = self.observe(tick, derivative, report.as_ref());
        match transition {
            Transition::Confirmed { .. } => {
                self.estimator.reset();
                self.health.confirmations += 1;
            }
            Transition::Recovered => {
                self.estimator.reset();
                self.health.recoveries += 1;
            }
            _ => {}
        }
        self.health.record_tick(
            tick,
            qp_latency_us,
            h,
            derivative,
            outcome.status.is_fallback(),
        );
        self.health.rejected_reports = self.monitor.counters().rejected_reports;

        tracing::debug!(
            tick,
            h,
            ?derivative,
            relaxation = outcome.relaxation,
            state = ?self.monitor.state(),
            "tick"
        );

        let report = TickReport {
            tick,
            state: self.state.clone(),
            next_state: next.clone(),
            commanded: outcome.u.clone(),
            applied,
            h,
            derivative,
            achievable_rate: rate,
            relaxation: outcome.relaxation,
            variant,
            fault,
            filter_status: outcome.status,
            qp_latency_us,
            identifier: report,
            transition,
            fault_state: self.monitor.state(),
            fault_channel: self.monitor.channel(),
        };

        self.state = next;
        self.last_control = Some(outcome.u);
        self.tick += 1;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dynamics::reference::DecoupledLift;
    use crate::runtime::plant::{FaultInjection, FaultMode};
    use crate::testing;
    use ndarray::array;

    fn build(channels: usize, config: LoopConfig, plant: Plant) -> ControlLoop {
        let sys = DecoupledLift::new(channels);
        let x0 = sys.goal_state();
        ControlLoop::new(
            config.clone(),
            Arc::new(sys),
            testing::components(channels, config.window_len),
            x0,
            plant,
        )
        .expect("loop")
    }

    #[test]
    fn test_hover_is_steady_and_nominal() {
        let mut lp = build(2, testing::scenario_config(10), Plant::ideal());
        for _ in 0..200 {
            let r = lp.step().expect("step");
            assert_eq!(r.fault_state, FaultState::Nominal);
            assert_eq!(r.filter_status, FilterStatus::Solved);
            assert!(lp.filter.limits().contains(r.commanded.view()));
        }
        assert_eq!(lp.tick(), 200);
        assert!((lp.state()[0] - 5.0).abs() < 1e-12);
        assert_eq!(lp.last_control(), Some(&array![1.0, 1.0]));
        let t = lp.telemetry();
        assert_eq!(t.total_ticks, 200);
        assert_eq!(t.fallback_ticks, 0);
    }

    #[test]
    fn test_first_tick_has_no_derivative() {
        let mut lp = build(2, testing::scenario_config(10), Plant::ideal());
        assert!(lp.step().expect("step").derivative.is_none());
        let d = lp.step().expect("step").derivative.expect("estimate");
        // Steady state: only the decay term remains.
        assert!((d - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_identifier_waits_for_full_window() {
        let mut lp = build(2, testing::scenario_config(10), Plant::ideal());
        for t in 0..12 {
            let r = lp.step().expect("step");
            assert_eq!(r.identifier.is_some(), t >= 9, "tick {t}");
        }
    }

    #[test]
    fn test_identify_every_skips_ticks() {
        let mut config = testing::scenario_config(10);
        config.identify_every = 3;
        let mut lp = build(2, config, Plant::ideal());
        let evaluated: Vec<u64> = (0..16)
            .filter_map(|_| {
                let r = lp.step().expect("step");
                r.identifier.map(|_| r.tick)
            })
            .collect();
        assert_eq!(evaluated, vec![9, 12, 15]);
    }

    #[test]
    fn test_rejects_mismatched_window() {
        let sys = DecoupledLift::new(2);
        let x0 = sys.goal_state();
        let err = ControlLoop::new(
            testing::scenario_config(20),
            Arc::new(sys),
            testing::components(2, 10),
            x0,
            Plant::ideal(),
        )
        .err()
        .expect("mismatch");
        assert!(matches!(err, StartupError::Incompatible { .. }));
    }

    #[test]
    fn test_rejects_bad_initial_state() {
        let sys = DecoupledLift::new(2);
        let err = ControlLoop::new(
            testing::scenario_config(10),
            Arc::new(sys),
            testing::components(2, 10),
            array![5.0],
            Plant::ideal(),
        )
        .err()
        .expect("mismatch");
        assert!(matches!(err, StartupError::Dimension(_)));
    }

    fn lost_channel(channel: usize, start_tick: u64) -> Plant {
        Plant::ideal().with_fault(FaultInjection {
            channel,
            start_tick,
            end_tick: None,
            mode: FaultMode::Zero,
        })
    }

    #[test]
    fn test_output_deviation_tracks_lost_channel() {
        let plant = lost_channel(1, 0);
        let mut lp = build(2, testing::scenario_config(10), plant);
        let r = lp.step().expect("step");
        assert_eq!(r.applied[1], 0.0);
        assert!(r.commanded[1] > 0.0);
        let last = lp.buffer.iter().last().expect("sample");
        assert_eq!(last.dy[0], 0.0);
        assert!((last.dy[1] - 0.01 * r.commanded[1]).abs() < 1e-12);
    }

    #[test]
    fn test_rejected_report_never_sets_authority_loss() {
        let config = LoopConfig {
            graded_authority: true,
            confirm_persistence: 5,
            ..testing::scenario_config(10)
        };
        let mut lp = build(2, config, Plant::ideal());
        let suspect = IdentifierReport::from_confidences(array![0.9, 0.05]).expect("report");
        for t in 0..5 {
            lp.observe(t, Some(-1.0), Some(&suspect));
        }
        assert_eq!(lp.fault_state(), FaultState::Confirmed);
        assert_eq!(lp.fault_channel(), Some(1));

        let poisoned = IdentifierReport {
            confidences: array![0.9, f64::NAN],
            candidate: 0,
            min_confidence: 0.9,
        };
        assert_eq!(lp.observe(5, Some(-1.0), Some(&poisoned)), Transition::Stay);
        assert_eq!(lp.monitor.counters().rejected_reports, 1);

        // The loss still comes from the last admitted report.
        let fault = lp.active_fault().expect("fault");
        assert_eq!(fault.channel, 1);
        assert!((fault.authority_loss - 0.95).abs() < 1e-12);

        let r = lp.step().expect("step");
        assert_eq!(r.fault, Some(fault));
        assert_eq!(r.filter_status, FilterStatus::Solved);
        assert!(lp.filter.limits().contains(r.commanded.view()));
    }

    #[test]
    fn test_graded_authority_reaches_filter() {
        let config = LoopConfig {
            graded_authority: true,
            ..testing::scenario_config(100)
        };
        let mut lp = build(4, config, lost_channel(1, 500));
        let mut confirmed = false;
        for _ in 0..700 {
            let r = lp.step().expect("step");
            assert!(r.fault.is_none() || confirmed);
            if let Transition::Confirmed { channel } = r.transition {
                assert_eq!(channel, 1);
                confirmed = true;
                break;
            }
        }
        assert!(confirmed);

        let mut previous = lp.last_report.clone().expect("report");
        for _ in 0..20 {
            let r = lp.step().expect("step");
            let fault = r.fault.expect("fault");
            assert_eq!(fault.channel, 1);
            assert_eq!(fault.authority_loss, previous.loss_estimate()[1]);
            assert!(
                fault.authority_loss > 0.0 && fault.authority_loss < 1.0,
                "loss {}",
                fault.authority_loss
            );
            assert_eq!(r.variant, CertificateVariant::FaultTolerant);
            assert_eq!(r.filter_status, FilterStatus::Solved);
            assert!(lp.filter.limits().contains(r.commanded.view()));
            assert!(r.h > 0.0);
            previous = r.identifier.expect("report");
        }
    }
}
