//! Control-affine dynamics boundary: ẋ = f(x) + g(x) u.
//!
//! Dynamics models are supplied by the caller. The loop only consumes the
//! [`DynamicsProvider`] capability set; model parameters are bound into the
//! provider when it is constructed.

pub mod integrate;
pub mod reference;

use ndarray::{Array1, Array2, ArrayView1};

use crate::error::DimensionError;

/// Per-dimension box `[lower, upper]`.
#[derive(Clone, Debug, PartialEq)]
pub struct Limits {
    pub upper: Array1<f64>,
    pub lower: Array1<f64>,
}

impl Limits {
    pub fn new(upper: Array1<f64>, lower: Array1<f64>) -> Result<Self, DimensionError> {
        DimensionError::check("limits lower bound", upper.len(), lower.len())?;
        Ok(Self { upper, lower })
    }

    /// Same scalar box on every dimension.
    pub fn uniform(dim: usize, lower: f64, upper: f64) -> Self {
        Self {
            upper: Array1::from_elem(dim, upper),
            lower: Array1::from_elem(dim, lower),
        }
    }

    pub fn dim(&self) -> usize {
        self.upper.len()
    }

    pub fn midpoint(&self) -> Array1<f64> {
        (&self.upper + &self.lower) / 2.0
    }

    pub fn half_range(&self) -> Array1<f64> {
        (&self.upper - &self.lower) / 2.0
    }

    /// Index of the first dimension with `lower > upper`, if any.
    pub fn first_inverted(&self) -> Option<usize> {
        self.lower
            .iter()
            .zip(self.upper.iter())
            .position(|(lo, hi)| lo > hi)
    }

    pub fn contains(&self, x: ArrayView1<f64>) -> bool {
        x.iter()
            .zip(self.lower.iter().zip(self.upper.iter()))
            .all(|(v, (lo, hi))| *v >= *lo && *v <= *hi)
    }

    pub fn clamp(&self, x: ArrayView1<f64>) -> Array1<f64> {
        let mut out = x.to_owned();
        self.clamp_inplace(&mut out);
        out
    }

    pub fn clamp_inplace(&self, x: &mut Array1<f64>) {
        for ((v, lo), hi) in x.iter_mut().zip(self.lower.iter()).zip(self.upper.iter()) {
            *v = v.clamp(*lo, *hi);
        }
    }

    /// Largest absolute bound per dimension.
    pub fn magnitude(&self) -> Array1<f64> {
        self.lower
            .iter()
            .zip(self.upper.iter())
            .map(|(lo, hi)| lo.abs().max(hi.abs()))
            .collect()
    }
}

/// Capability set of a control-affine system.
pub trait DynamicsProvider: Send + Sync {
    /// State dimension n.
    fn n_dims(&self) -> usize;

    /// Number of actuation channels m.
    fn n_controls(&self) -> usize;

    /// Drift term f(x) ∈ R^n.
    fn f(&self, x: ArrayView1<f64>) -> Array1<f64>;

    /// Input matrix g(x) ∈ R^{n × m}.
    fn g(&self, x: ArrayView1<f64>) -> Array2<f64>;

    /// Expected range of states.
    fn state_limits(&self) -> Limits;

    /// Admissible control box.
    fn control_limits(&self) -> Limits;

    /// Safe operating envelope used to normalize certificate inputs.
    fn safe_limits(&self) -> Limits {
        self.state_limits()
    }

    fn safe_mask(&self, x: ArrayView1<f64>) -> bool;

    fn unsafe_mask(&self, x: ArrayView1<f64>) -> bool;

    /// Reference controller the safety filter stays close to.
    fn nominal_control(&self, x: ArrayView1<f64>) -> Array1<f64>;

    /// Measured output y(x). Defaults to full state.
    fn output(&self, x: ArrayView1<f64>) -> Array1<f64> {
        x.to_owned()
    }

    fn output_dim(&self) -> usize {
        self.n_dims()
    }

    /// ẋ = f(x) + g(x) u.
    fn closed_loop(&self, x: ArrayView1<f64>, u: ArrayView1<f64>) -> Array1<f64> {
        self.f(x) + self.g(x).dot(&u)
    }
}
