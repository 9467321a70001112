//! Explicit-Euler stepping for control-affine systems.

use ndarray::{Array1, ArrayView1};

use super::DynamicsProvider;

/// x⁺ = x + (f(x) + g(x) u) · dt, clamped to the provider's state limits.
pub fn euler_step<D: DynamicsProvider + ?Sized>(
    dynamics: &D,
    x: ArrayView1<f64>,
    u: ArrayView1<f64>,
    dt: f64,
) -> Array1<f64> {
    let mut next = &x + &(dynamics.closed_loop(x, u) * dt);
    dynamics.state_limits().clamp_inplace(&mut next);
    next
}
