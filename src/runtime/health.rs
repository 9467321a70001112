//! Loop telemetry: rolling per-tick metrics and an overall health status.

use std::collections::VecDeque;

use serde::Serialize;

/// Health status levels.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum HealthStatus {
    /// All metrics nominal.
    Healthy,
    /// Some metrics are degraded but within tolerance.
    Degraded(String),
    /// Critical issue requiring attention.
    Critical(String),
}

/// A metric sample.
#[derive(Clone, Debug)]
pub struct MetricSample {
    pub tick: u64,
    pub value: f64,
}

/// Which side of a threshold is bad.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Bound {
    /// Values at or above the threshold are bad.
    Upper,
    /// Values below the threshold are bad.
    Lower,
}

/// What the thresholds are compared against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Aggregate {
    Latest,
    Mean,
}

/// A rolling metric tracker.
#[derive(Clone, Debug)]
pub struct MetricTracker {
    /// Metric name.
    pub name: String,

    /// Rolling window of samples.
    pub samples: VecDeque<MetricSample>,

    /// Maximum window size.
    pub max_samples: usize,

    pub warn_threshold: Option<f64>,
    pub critical_threshold: Option<f64>,
    pub bound: Bound,
    pub aggregate: Aggregate,
}

impl MetricTracker {
    pub fn new(name: &str, max_samples: usize) -> Self {
        Self {
            name: name.to_string(),
            samples: VecDeque::with_capacity(max_samples),
            max_samples: max_samples.max(1),
            warn_threshold: None,
            critical_threshold: None,
            bound: Bound::Upper,
            aggregate: Aggregate::Latest,
        }
    }

    /// Upper-bound thresholds.
    pub fn with_thresholds(mut self, warn: f64, critical: f64) -> Self {
        self.warn_threshold = Some(warn);
        self.critical_threshold = Some(critical);
        self.bound = Bound::Upper;
        self
    }

    /// Lower-bound thresholds.
    pub fn with_floor(mut self, warn: f64, critical: f64) -> Self {
        self.warn_threshold = Some(warn);
        self.critical_threshold = Some(critical);
        self.bound = Bound::Lower;
        self
    }

    /// Judge the window mean instead of the latest value.
    pub fn on_mean(mut self) -> Self {
        self.aggregate = Aggregate::Mean;
        self
    }

    pub fn record(&mut self, tick: u64, value: f64) {
        if self.samples.len() >= self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(MetricSample { tick, value });
    }

    pub fn latest(&self) -> Option<f64> {
        self.samples.back().map(|s| s.value)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Mean over the window.
    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.samples.iter().map(|s| s.value).sum();
        sum / self.samples.len() as f64
    }

    /// Standard deviation over the window.
    pub fn std_dev(&self) -> f64 {
        if self.samples.len() < 2 {
            return 0.0;
        }
        let mean = self.mean();
        let var: f64 = self
            .samples
            .iter()
            .map(|s| (s.value - mean).powi(2))
            .sum::<f64>()
            / (self.samples.len() - 1) as f64;
        var.sqrt()
    }

    pub fn min(&self) -> f64 {
        self.samples
            .iter()
            .map(|s| s.value)
            .fold(f64::INFINITY, f64::min)
    }

    /// 99th percentile.
    pub fn p99(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut values: Vec<f64> = self.samples.iter().map(|s| s.value).collect();
        values.sort_by(f64::total_cmp);
        let idx = ((values.len() as f64) * 0.99) as usize;
        values[idx.min(values.len() - 1)]
    }

    fn breaches(&self, value: f64, threshold: f64) -> bool {
        match self.bound {
            Bound::Upper => value >= threshold,
            Bound::Lower => value < threshold,
        }
    }

    pub fn status(&self) -> HealthStatus {
        let value = match self.aggregate {
            Aggregate::Latest => self.latest(),
            Aggregate::Mean => (!self.samples.is_empty()).then(|| self.mean()),
        };
        let Some(val) = value else {
            return HealthStatus::Healthy;
        };
        let side = match self.bound {
            Bound::Upper => ">=",
            Bound::Lower => "<",
        };
        if let Some(crit) = self.critical_threshold {
            if self.breaches(val, crit) {
                return HealthStatus::Critical(format!(
                    "{}: {:.4} {} critical {}",
                    self.name, val, side, crit
                ));
            }
        }
        if let Some(warn) = self.warn_threshold {
            if self.breaches(val, warn) {
                return HealthStatus::Degraded(format!(
                    "{}: {:.4} {} warn {}",
                    self.name, val, side, warn
                ));
            }
        }
        HealthStatus::Healthy
    }

    /// Latest value more than three standard deviations from the mean.
    pub fn is_anomalous(&self) -> bool {
        if let Some(val) = self.latest() {
            let std = self.std_dev();
            if std > 1e-12 {
                return ((val - self.mean()) / std).abs() > 3.0;
            }
        }
        false
    }

    /// Degraded while the latest value is an outlier.
    pub fn outlier_status(&self) -> HealthStatus {
        match self.latest() {
            Some(val) if self.is_anomalous() => HealthStatus::Degraded(format!(
                "{}: {:.4} outlier against mean {:.4}",
                self.name,
                val,
                self.mean()
            )),
            _ => HealthStatus::Healthy,
        }
    }
}

/// Telemetry for one control loop.
#[derive(Clone, Debug)]
pub struct HealthMonitor {
    /// QP solve latency (µs).
    pub qp_latency_us: MetricTracker,

    /// Active certificate value h.
    pub certificate: MetricTracker,

    /// ḣ_est, when available. A sudden jump marks the loop degraded.
    pub derivative: MetricTracker,

    /// 1 on fallback ticks, 0 otherwise.
    pub fallback: MetricTracker,

    pub qp_budget_us: u64,
    pub total_ticks: u64,
    pub fallback_ticks: u64,
    pub over_budget_ticks: u64,
    pub rejected_reports: u64,
    pub confirmations: u64,
    pub recoveries: u64,
}

impl HealthMonitor {
    pub fn new(window: usize, qp_budget_us: u64) -> Self {
        let budget = qp_budget_us as f64;
        Self {
            qp_latency_us: MetricTracker::new("qp_latency_us", window)
                .with_thresholds(budget, 5.0 * budget),
            certificate: MetricTracker::new("certificate", window).with_floor(0.0, -0.5),
            derivative: MetricTracker::new("derivative", window),
            fallback: MetricTracker::new("fallback_rate", window)
                .with_thresholds(0.05, 0.5)
                .on_mean(),
            qp_budget_us,
            total_ticks: 0,
            fallback_ticks: 0,
            over_budget_ticks: 0,
            rejected_reports: 0,
            confirmations: 0,
            recoveries: 0,
        }
    }

    /// Record one tick.
    pub fn record_tick(
        &mut self,
        tick: u64,
        qp_latency_us: f64,
        h: f64,
        derivative: Option<f64>,
        fallback: bool,
    ) {
        self.total_ticks += 1;
        self.qp_latency_us.record(tick, qp_latency_us);
        self.certificate.record(tick, h);
        if let Some(d) = derivative {
            self.derivative.record(tick, d);
        }
        self.fallback.record(tick, if fallback { 1.0 } else { 0.0 });
        if fallback {
            self.fallback_ticks += 1;
        }
        if qp_latency_us > self.qp_budget_us as f64 {
            self.over_budget_ticks += 1;
        }
    }

    pub fn overall_status(&self) -> HealthStatus {
        let checks = [
            self.qp_latency_us.status(),
            self.certificate.status(),
            self.fallback.status(),
            self.derivative.outlier_status(),
        ];

        for check in &checks {
            if matches!(check, HealthStatus::Critical(_)) {
                return check.clone();
            }
        }

        for check in &checks {
            if matches!(check, HealthStatus::Degraded(_)) {
                return check.clone();
            }
        }

        HealthStatus::Healthy
    }

    pub fn report(&self) -> HealthReport {
        HealthReport {
            status: self.overall_status(),
            total_ticks: self.total_ticks,
            fallback_ticks: self.fallback_ticks,
            over_budget_ticks: self.over_budget_ticks,
            rejected_reports: self.rejected_reports,
            confirmations: self.confirmations,
            recoveries: self.recoveries,
            avg_qp_latency_us: self.qp_latency_us.mean(),
            p99_qp_latency_us: self.qp_latency_us.p99(),
            min_certificate: self.certificate.latest().map(|_| self.certificate.min()),
            last_derivative: self.derivative.latest(),
        }
    }
}

/// Telemetry snapshot.
#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub total_ticks: u64,
    pub fallback_ticks: u64,
    pub over_budget_ticks: u64,
    pub rejected_reports: u64,
    pub confirmations: u64,
    pub recoveries: u64,
    pub avg_qp_latency_us: f64,
    pub p99_qp_latency_us: f64,
    /// Smallest h in the telemetry window.
    pub min_certificate: Option<f64>,
    pub last_derivative: Option<f64>,
}
