//! Persistence-based fault state machine.
//!
//! NOMINAL → SUSPECT when the detection signal drops below threshold.
//! SUSPECT → CONFIRMED once the suspicion and a stable identifier candidate
//! have both persisted for `confirm_persistence` ticks.
//! SUSPECT → NOMINAL if the signal clears first.
//! CONFIRMED → NOMINAL after `recovery_persistence` ticks of ḣ_est above the
//! recovery threshold.
//!
//! A tick with no reading for the relevant signal leaves every counter
//! untouched.

use serde::{Deserialize, Serialize};

use crate::certificate::CertificateVariant;
use crate::config::LoopConfig;
use crate::identify::IdentifierReport;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultState {
    Nominal,
    Suspect,
    Confirmed,
}

impl FaultState {
    pub fn certificate_variant(self) -> CertificateVariant {
        match self {
            FaultState::Confirmed => CertificateVariant::FaultTolerant,
            FaultState::Nominal | FaultState::Suspect => CertificateVariant::Nominal,
        }
    }
}

/// Which signal can move the monitor out of NOMINAL.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionSource {
    /// ḣ_est below `detection_threshold`.
    #[default]
    Derivative,
    /// Identifier min confidence below `confidence_threshold`.
    Identifier,
    Either,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MonitorSettings {
    pub detection_threshold: f64,
    pub confirm_persistence: usize,
    pub recovery_threshold: f64,
    pub recovery_persistence: usize,
    pub confidence_threshold: f64,
    pub confirm_confidence: f64,
    pub detection_source: DetectionSource,
}

impl From<&LoopConfig> for MonitorSettings {
    fn from(config: &LoopConfig) -> Self {
        Self {
            detection_threshold: config.detection_threshold,
            confirm_persistence: config.confirm_persistence,
            recovery_threshold: config.recovery_threshold,
            recovery_persistence: config.recovery_persistence,
            confidence_threshold: config.confidence_threshold,
            confirm_confidence: config.confirm_confidence,
            detection_source: config.detection_source,
        }
    }
}

/// What changed on a tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    Stay,
    Suspected,
    /// Suspicion cleared before confirmation.
    Cleared,
    Confirmed { channel: usize },
    Recovered,
}

/// Monitor counters, exposed for telemetry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MonitorCounters {
    pub suspect_ticks: usize,
    pub candidate_streak: usize,
    pub recovery_streak: usize,
    pub rejected_reports: u64,
}

#[derive(Clone, Debug)]
pub struct FaultMonitor {
    settings: MonitorSettings,
    n_channels: usize,
    state: FaultState,
    channel: Option<usize>,
    suspect_since: Option<u64>,
    candidate: Option<usize>,
    counters: MonitorCounters,
}

impl FaultMonitor {
    pub fn new(settings: MonitorSettings, n_channels: usize) -> Self {
        Self {
            settings,
            n_channels,
            state: FaultState::Nominal,
            channel: None,
            suspect_since: None,
            candidate: None,
            counters: MonitorCounters::default(),
        }
    }

    pub fn state(&self) -> FaultState {
        self.state
    }

    /// Faulty channel, only while CONFIRMED.
    pub fn channel(&self) -> Option<usize> {
        self.channel
    }

    pub fn suspect_since(&self) -> Option<u64> {
        self.suspect_since
    }

    pub fn counters(&self) -> &MonitorCounters {
        &self.counters
    }

    /// Advance one tick.
    pub fn observe(
        &mut self,
        tick: u64,
        derivative: Option<f64>,
        report: Option<&IdentifierReport>,
    ) -> Transition {
        let report = report.filter(|r| self.accept(tick, r));
        if self.state != FaultState::Confirmed {
            if let Some(r) = report {
                self.track_candidate(r);
            }
        }

        let transition = match self.state {
            FaultState::Nominal => match self.detect(derivative, report) {
                Some(true) => {
                    self.state = FaultState::Suspect;
                    self.suspect_since = Some(tick);
                    self.counters.suspect_ticks = 1;
                    Transition::Suspected
                }
                _ => Transition::Stay,
            },
            FaultState::Suspect => match self.detect(derivative, report) {
                Some(false) => {
                    self.state = FaultState::Nominal;
                    self.suspect_since = None;
                    self.counters.suspect_ticks = 0;
                    Transition::Cleared
                }
                Some(true) => {
                    self.counters.suspect_ticks += 1;
                    self.try_confirm()
                }
                None => self.try_confirm(),
            },
            FaultState::Confirmed => {
                if let Some(d) = derivative {
                    if d > self.settings.recovery_threshold {
                        self.counters.recovery_streak += 1;
                    } else {
                        self.counters.recovery_streak = 0;
                    }
                }
                if self.counters.recovery_streak >= self.settings.recovery_persistence {
                    self.state = FaultState::Nominal;
                    self.channel = None;
                    self.suspect_since = None;
                    self.candidate = None;
                    self.counters.suspect_ticks = 0;
                    self.counters.candidate_streak = 0;
                    self.counters.recovery_streak = 0;
                    Transition::Recovered
                } else {
                    Transition::Stay
                }
            }
        };

        match transition {
            Transition::Suspected => tracing::info!(tick, ?derivative, "fault suspected"),
            Transition::Cleared => tracing::info!(tick, "suspicion cleared"),
            Transition::Confirmed { channel } => {
                tracing::info!(tick, channel, "actuator fault confirmed")
            }
            Transition::Recovered => tracing::info!(tick, "actuator recovered"),
            Transition::Stay => {}
        }
        transition
    }

    /// Whether a report is well formed for this monitor's channel count.
    /// Reports that fail this are counted and ignored by [`observe`](Self::observe).
    pub fn admits(&self, report: &IdentifierReport) -> bool {
        report.candidate < self.n_channels
            && report.confidences.len() == self.n_channels
            && report.min_confidence.is_finite()
            && report.confidences.iter().all(|c| c.is_finite())
    }

    fn accept(&mut self, tick: u64, report: &IdentifierReport) -> bool {
        let valid = self.admits(report);
        if !valid {
            self.counters.rejected_reports += 1;
            tracing::warn!(
                tick,
                candidate = report.candidate,
                width = report.confidences.len(),
                channels = self.n_channels,
                "identifier report rejected"
            );
        }
        valid
    }

    fn track_candidate(&mut self, report: &IdentifierReport) {
        if report.min_confidence < self.settings.confirm_confidence {
            if self.candidate == Some(report.candidate) {
                self.counters.candidate_streak += 1;
            } else {
                self.candidate = Some(report.candidate);
                self.counters.candidate_streak = 1;
            }
        } else {
            self.candidate = None;
            self.counters.candidate_streak = 0;
        }
    }

    /// `Some(true)` when the detection signal is below threshold, `None`
    /// when the signal is unavailable this tick.
    fn detect(&self, derivative: Option<f64>, report: Option<&IdentifierReport>) -> Option<bool> {
        let by_derivative = derivative.map(|d| d < self.settings.detection_threshold);
        let by_identifier = report.map(|r| r.min_confidence < self.settings.confidence_threshold);
        match self.settings.detection_source {
            DetectionSource::Derivative => by_derivative,
            DetectionSource::Identifier => by_identifier,
            DetectionSource::Either => match (by_derivative, by_identifier) {
                (None, None) => None,
                (a, b) => Some(a.unwrap_or(false) || b.unwrap_or(false)),
            },
        }
    }

    fn try_confirm(&mut self) -> Transition {
        let persistence = self.settings.confirm_persistence;
        match self.candidate {
            Some(channel)
                if self.counters.suspect_ticks >= persistence
                    && self.counters.candidate_streak >= persistence =>
            {
                self.state = FaultState::Confirmed;
                self.channel = Some(channel);
                self.counters.recovery_streak = 0;
                Transition::Confirmed { channel }
            }
            _ => Transition::Stay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array1};

    fn settings() -> MonitorSettings {
        MonitorSettings {
            detection_threshold: 0.02,
            confirm_persistence: 5,
            recovery_threshold: 0.1,
            recovery_persistence: 3,
            confidence_threshold: 0.5,
            confirm_confidence: 0.2,
            detection_source: DetectionSource::Derivative,
        }
    }

    fn report(candidate: usize, min: f64) -> IdentifierReport {
        let mut confidences = Array1::from_elem(3, 0.9);
        confidences[candidate.min(2)] = min;
        IdentifierReport {
            confidences,
            candidate,
            min_confidence: min,
        }
    }

    #[test]
    fn test_liveness_never_leaves_nominal() {
        let mut m = FaultMonitor::new(settings(), 3);
        let low = report(1, 0.01);
        for t in 0..1_000 {
            let d = 0.02 + (t % 7) as f64 * 0.01;
            m.observe(t, Some(d), Some(&low));
            assert_eq!(m.state(), FaultState::Nominal);
        }
    }

    #[test]
    fn test_transient_suspicion_clears() {
        let mut m = FaultMonitor::new(settings(), 3);
        assert_eq!(m.observe(0, Some(-1.0), None), Transition::Suspected);
        assert_eq!(m.suspect_since(), Some(0));
        assert_eq!(m.observe(1, Some(-1.0), None), Transition::Stay);
        assert_eq!(m.observe(2, Some(0.5), None), Transition::Cleared);
        assert_eq!(m.state(), FaultState::Nominal);
        assert!(m.suspect_since().is_none());
    }

    #[test]
    fn test_never_confirms_without_identifier() {
        let mut m = FaultMonitor::new(settings(), 3);
        for t in 0..100 {
            m.observe(t, Some(-1.0), None);
        }
        assert_eq!(m.state(), FaultState::Suspect);
        assert!(m.channel().is_none());
    }

    #[test]
    fn test_confirms_after_both_persist() {
        let mut m = FaultMonitor::new(settings(), 3);
        let r = report(2, 0.05);
        let mut confirmed_at = None;
        for t in 0..20 {
            if let Transition::Confirmed { channel } = m.observe(t, Some(-1.0), Some(&r)) {
                assert_eq!(channel, 2);
                confirmed_at = Some(t);
                break;
            }
        }
        assert_eq!(confirmed_at, Some(4));
        assert_eq!(m.state(), FaultState::Confirmed);
        assert_eq!(m.channel(), Some(2));
        assert_eq!(m.state().certificate_variant(), CertificateVariant::FaultTolerant);
    }

    #[test]
    fn test_candidate_change_restarts_streak() {
        let mut m = FaultMonitor::new(settings(), 3);
        for t in 0..4 {
            m.observe(t, Some(-1.0), Some(&report(0, 0.05)));
        }
        assert_eq!(m.counters().candidate_streak, 4);
        m.observe(4, Some(-1.0), Some(&report(1, 0.05)));
        assert_eq!(m.counters().candidate_streak, 1);
        assert_eq!(m.state(), FaultState::Suspect);
        for t in 5..9 {
            m.observe(t, Some(-1.0), Some(&report(1, 0.05)));
        }
        assert_eq!(m.state(), FaultState::Confirmed);
        assert_eq!(m.channel(), Some(1));
    }

    #[test]
    fn test_confident_report_breaks_streak() {
        let mut m = FaultMonitor::new(settings(), 3);
        for t in 0..4 {
            m.observe(t, Some(-1.0), Some(&report(0, 0.05)));
        }
        m.observe(4, Some(-1.0), Some(&report(0, 0.6)));
        assert_eq!(m.counters().candidate_streak, 0);
        assert_eq!(m.state(), FaultState::Suspect);
    }

    #[test]
    fn test_recovery_requires_persistence() {
        let mut m = FaultMonitor::new(settings(), 3);
        let r = report(0, 0.05);
        for t in 0..5 {
            m.observe(t, Some(-1.0), Some(&r));
        }
        assert_eq!(m.state(), FaultState::Confirmed);

        assert_eq!(m.observe(5, Some(0.5), None), Transition::Stay);
        assert_eq!(m.observe(6, Some(0.5), None), Transition::Stay);
        // Dip resets the streak.
        assert_eq!(m.observe(7, Some(0.05), None), Transition::Stay);
        assert_eq!(m.counters().recovery_streak, 0);
        for t in 8..10 {
            assert_eq!(m.observe(t, Some(0.5), None), Transition::Stay);
        }
        assert_eq!(m.observe(10, Some(0.5), None), Transition::Recovered);
        assert_eq!(m.state(), FaultState::Nominal);
        assert!(m.channel().is_none());
    }

    #[test]
    fn test_missing_estimate_leaves_counters() {
        let mut m = FaultMonitor::new(settings(), 3);
        m.observe(0, Some(-1.0), None);
        m.observe(1, Some(-1.0), None);
        let before = m.counters().clone();
        assert_eq!(m.observe(2, None, None), Transition::Stay);
        assert_eq!(m.counters(), &before);
        assert_eq!(m.state(), FaultState::Suspect);
    }

    #[test]
    fn test_rejected_report_keeps_previous_candidate() {
        let mut m = FaultMonitor::new(settings(), 3);
        for t in 0..3 {
            m.observe(t, Some(-1.0), Some(&report(1, 0.05)));
        }
        let out_of_range = IdentifierReport {
            confidences: array![0.9, 0.9, 0.9],
            candidate: 7,
            min_confidence: 0.05,
        };
        m.observe(3, Some(-1.0), Some(&out_of_range));
        let nan = IdentifierReport {
            confidences: array![0.9, f64::NAN, 0.9],
            candidate: 1,
            min_confidence: f64::NAN,
        };
        assert!(!m.admits(&out_of_range));
        assert!(!m.admits(&nan));
        assert!(m.admits(&report(1, 0.05)));
        m.observe(4, Some(-1.0), Some(&nan));
        assert_eq!(m.counters().rejected_reports, 2);
        assert_eq!(m.counters().candidate_streak, 3);
        m.observe(5, Some(-1.0), Some(&report(1, 0.05)));
        m.observe(6, Some(-1.0), Some(&report(1, 0.05)));
        assert_eq!(m.state(), FaultState::Confirmed);
        assert_eq!(m.channel(), Some(1));
    }

    #[test]
    fn test_identifier_detection_source() {
        let mut s = settings();
        s.detection_source = DetectionSource::Identifier;
        let mut m = FaultMonitor::new(s, 3);
        // Derivative is healthy, identifier is not.
        assert_eq!(m.observe(0, Some(1.0), Some(&report(0, 0.3))), Transition::Suspected);
        // No report: no reading, no change.
        assert_eq!(m.observe(1, Some(1.0), None), Transition::Stay);
        assert_eq!(m.state(), FaultState::Suspect);
        assert_eq!(m.observe(2, Some(-1.0), Some(&report(0, 0.9))), Transition::Cleared);
    }

    #[test]
    fn test_either_detection_source() {
        let mut s = settings();
        s.detection_source = DetectionSource::Either;
        let mut m = FaultMonitor::new(s, 3);
        assert_eq!(m.observe(0, None, Some(&report(0, 0.9))), Transition::Stay);
        assert_eq!(m.observe(1, Some(-1.0), Some(&report(0, 0.9))), Transition::Suspected);
    }
}
