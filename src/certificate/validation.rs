//! Sampling-based check that a certificate separates safe from unsafe states.

use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use super::oracle::BarrierOracle;
use crate::dynamics::{DynamicsProvider, Limits};
use crate::error::DimensionError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Region {
    Safe,
    Unsafe,
}

/// Uniform samples from a box, one per row.
pub fn sample_box(limits: &Limits, rng: &mut StdRng, count: usize) -> Array2<f64> {
    let dim = limits.dim();
    let mut out = Array2::zeros((count, dim));
    for mut row in out.axis_iter_mut(Axis(0)) {
        for (j, v) in row.iter_mut().enumerate() {
            let (lo, hi) = (limits.lower[j], limits.upper[j]);
            *v = if hi > lo { rng.gen_range(lo..hi) } else { lo };
        }
    }
    out
}

/// Rejection-sample up to `count` states of `region` from the state limits.
/// Best effort: gives up after `count * max_tries_per_sample` draws, so the
/// result may hold fewer rows than requested.
pub fn sample_with_mask<D: DynamicsProvider + ?Sized>(
    dynamics: &D,
    region: Region,
    rng: &mut StdRng,
    count: usize,
    max_tries_per_sample: usize,
) -> Array2<f64> {
    let limits = dynamics.state_limits();
    let mut kept: Vec<Array1<f64>> = Vec::with_capacity(count);
    let budget = count.saturating_mul(max_tries_per_sample.max(1));
    let mut draws = 0;
    while kept.len() < count && draws < budget {
        let batch = sample_box(&limits, rng, (count - kept.len()).max(16));
        for row in batch.axis_iter(Axis(0)) {
            draws += 1;
            let hit = match region {
                Region::Safe => dynamics.safe_mask(row),
                Region::Unsafe => dynamics.unsafe_mask(row),
            };
            if hit {
                kept.push(row.to_owned());
                if kept.len() == count {
                    break;
                }
            }
        }
    }
    if kept.len() < count {
        tracing::warn!(
            ?region,
            requested = count,
            found = kept.len(),
            "masked sampling fell short"
        );
    }
    let mut out = Array2::zeros((kept.len(), limits.dim()));
    for (i, row) in kept.iter().enumerate() {
        out.row_mut(i).assign(row);
    }
    out
}

/// Per-region classification result.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ValidationReport {
    pub safe_samples: usize,
    pub safe_correct: usize,
    pub unsafe_samples: usize,
    pub unsafe_correct: usize,
    /// Smallest h seen on safe samples.
    pub min_safe_h: Option<f64>,
    /// Largest h seen on unsafe samples.
    pub max_unsafe_h: Option<f64>,
}

impl ValidationReport {
    pub fn safe_accuracy(&self) -> f64 {
        ratio(self.safe_correct, self.safe_samples)
    }

    pub fn unsafe_accuracy(&self) -> f64 {
        ratio(self.unsafe_correct, self.unsafe_samples)
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        1.0
    } else {
        num as f64 / den as f64
    }
}

/// Settings for [`classification_accuracy`].
#[derive(Clone, Debug)]
pub struct ValidationConfig {
    pub samples_per_region: usize,
    pub max_tries_per_sample: usize,
    pub seed: u64,
    /// Safe states count as correct when h ≥ −tolerance; unsafe when h < tolerance.
    pub tolerance: f64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            samples_per_region: crate::defaults::VALIDATION_SAMPLES,
            max_tries_per_sample: 50,
            seed: 0,
            tolerance: 0.0,
        }
    }
}

/// h ≥ 0 on safe samples and h < 0 on unsafe samples, counted per region.
pub fn classification_accuracy<D: DynamicsProvider + ?Sized>(
    oracle: &BarrierOracle,
    dynamics: &D,
    config: &ValidationConfig,
) -> Result<ValidationReport, DimensionError> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let safe = sample_with_mask(
        dynamics,
        Region::Safe,
        &mut rng,
        config.samples_per_region,
        config.max_tries_per_sample,
    );
    let unsafe_states = sample_with_mask(
        dynamics,
        Region::Unsafe,
        &mut rng,
        config.samples_per_region,
        config.max_tries_per_sample,
    );

    let h_safe = oracle.value_batch(safe.view())?;
    let h_unsafe = oracle.value_batch(unsafe_states.view())?;

    let report = ValidationReport {
        safe_samples: h_safe.len(),
        safe_correct: h_safe.iter().filter(|h| **h >= -config.tolerance).count(),
        unsafe_samples: h_unsafe.len(),
        unsafe_correct: h_unsafe.iter().filter(|h| **h < config.tolerance).count(),
        min_safe_h: h_safe.iter().copied().reduce(f64::min),
        max_unsafe_h: h_unsafe.iter().copied().reduce(f64::max),
    };
    tracing::info!(
        certificate = oracle.name(),
        safe_accuracy = report.safe_accuracy(),
        unsafe_accuracy = report.unsafe_accuracy(),
        "certificate validation finished"
    );
    Ok(report)
}
