//! A small reference system used by the CLI and the tests.
//!
//! `DecoupledLift` has one state per actuation channel. Each channel holds
//! its state up against a constant sink: ẋⱼ = −drift + gain · uⱼ, with
//! uⱼ ∈ [0, u_max]. A channel that loses authority sinks at `drift`.

use ndarray::{Array1, Array2, ArrayView1};

use super::{DynamicsProvider, Limits};

#[derive(Clone, Debug)]
pub struct DecoupledLift {
    pub channels: usize,
    pub drift: f64,
    pub gain: f64,
    pub u_max: f64,
    pub state_lower: f64,
    pub state_upper: f64,
    /// Lower edge of the safe envelope.
    pub safe_floor: f64,
    /// Upper edge of the safe envelope.
    pub safe_ceiling: f64,
    /// Below this on any channel the state is unsafe.
    pub unsafe_floor: f64,
    pub goal: f64,
    /// Proportional gain of the nominal controller.
    pub k_p: f64,
}

impl DecoupledLift {
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            drift: 1.0,
            gain: 1.0,
            u_max: 2.0,
            state_lower: 0.0,
            state_upper: 10.0,
            safe_floor: 1.0,
            safe_ceiling: 9.0,
            unsafe_floor: 0.5,
            goal: 5.0,
            k_p: 1.0,
        }
    }

    /// Control that holds every channel still.
    pub fn hover_control(&self) -> Array1<f64> {
        Array1::from_elem(self.channels, self.drift / self.gain)
    }

    pub fn goal_state(&self) -> Array1<f64> {
        Array1::from_elem(self.channels, self.goal)
    }
}

impl DynamicsProvider for DecoupledLift {
    fn n_dims(&self) -> usize {
        self.channels
    }

    fn n_controls(&self) -> usize {
        self.channels
    }

    fn f(&self, _x: ArrayView1<f64>) -> Array1<f64> {
        Array1::from_elem(self.channels, -self.drift)
    }

    fn g(&self, _x: ArrayView1<f64>) -> Array2<f64> {
        Array2::eye(self.channels) * self.gain
    }

    fn state_limits(&self) -> Limits {
        Limits::uniform(self.channels, self.state_lower, self.state_upper)
    }

    fn control_limits(&self) -> Limits {
        Limits::uniform(self.channels, 0.0, self.u_max)
    }

    fn safe_limits(&self) -> Limits {
        Limits::uniform(self.channels, self.safe_floor, self.safe_ceiling)
    }

    fn safe_mask(&self, x: ArrayView1<f64>) -> bool {
        x.iter()
            .all(|v| *v >= self.safe_floor && *v <= self.safe_ceiling)
    }

    fn unsafe_mask(&self, x: ArrayView1<f64>) -> bool {
        x.iter().any(|v| *v < self.unsafe_floor)
    }

    fn nominal_control(&self, x: ArrayView1<f64>) -> Array1<f64> {
        x.mapv(|v| self.drift / self.gain + self.k_p * (self.goal - v))
    }
}
