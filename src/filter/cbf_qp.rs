//! Per-tick certificate QP.
//!
//! Decision variable z = (u, s) with s the relaxation coefficient on h:
//!
//! minimize   Σᵢ wᵢ (uᵢ − u_refᵢ)² + ρ s²
//! subject to −(∇h·g) u − s·h ≤ ∇h·f
//!            u ∈ control box, 0 ≤ s ≤ s_max
//!
//! A faulted channel j with authority loss λ keeps (1 − λ) of its column in
//! the constraint and moves λ of its worst case, |∇h·g_j|·b_j, to the
//! right-hand side.

use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2};

use crate::defaults::H_EPSILON;
use crate::dynamics::Limits;
use crate::error::{DimensionError, QpError};
use crate::filter::qp::{ProjectionSolver, QpProblem, QpSolver};

/// A channel the filter must treat (partly) as an adversarial disturbance.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChannelFault {
    pub channel: usize,
    /// Fraction of authority lost, in [0, 1]. 1 removes the channel.
    pub authority_loss: f64,
}

impl ChannelFault {
    /// Full loss of one channel.
    pub fn total(channel: usize) -> Self {
        Self {
            channel,
            authority_loss: 1.0,
        }
    }

    /// Loss is clamped to [0, 1]; a non-finite loss counts as total.
    pub fn partial(channel: usize, authority_loss: f64) -> Self {
        let authority_loss = if authority_loss.is_finite() {
            authority_loss.clamp(0.0, 1.0)
        } else {
            1.0
        };
        Self {
            channel,
            authority_loss,
        }
    }

    /// Pick the worst channel from a per-channel loss estimate.
    /// `None` when no channel has lost anything.
    pub fn from_loss_estimate(losses: ArrayView1<f64>) -> Option<Self> {
        losses
            .iter()
            .enumerate()
            .filter(|(_, l)| l.is_finite() && **l > 0.0)
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(channel, loss)| Self::partial(channel, *loss))
    }
}

/// Static filter parameters, fixed when the loop is built.
#[derive(Clone, Debug)]
pub struct FilterSettings {
    /// Per-channel objective weights wᵢ.
    pub control_weights: Array1<f64>,
    /// ρ on the relaxation coefficient.
    pub relaxation_penalty: f64,
    /// Upper bound on s. May be infinite.
    pub relaxation_cap: f64,
    /// b_j used for a faulted channel's worst case.
    pub actuator_bounds: Array1<f64>,
}

impl FilterSettings {
    /// Unit weights and bounds taken from the control box.
    pub fn for_limits(limits: &Limits, relaxation_penalty: f64) -> Self {
        Self {
            control_weights: Array1::ones(limits.dim()),
            relaxation_penalty,
            relaxation_cap: f64::INFINITY,
            actuator_bounds: limits.magnitude(),
        }
    }
}

/// One tick's worth of filter inputs. Nothing here is retained.
#[derive(Clone, Debug)]
pub struct FilterInput<'a> {
    pub u_ref: ArrayView1<'a, f64>,
    pub f: ArrayView1<'a, f64>,
    pub g: ArrayView2<'a, f64>,
    pub h: f64,
    pub grad_h: ArrayView1<'a, f64>,
    pub fault: Option<ChannelFault>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FilterStatus {
    Solved,
    /// Solver failed; the clipped reference was emitted instead.
    Fallback(QpError),
}

impl FilterStatus {
    pub fn is_fallback(&self) -> bool {
        matches!(self, FilterStatus::Fallback(_))
    }
}

#[derive(Clone, Debug)]
pub struct FilterOutcome {
    pub u: Array1<f64>,
    /// Relaxation coefficient s (0 on fallback).
    pub relaxation: f64,
    pub status: FilterStatus,
}

pub struct SafetyFilter {
    settings: FilterSettings,
    limits: Limits,
    solver: Box<dyn QpSolver>,
}

impl SafetyFilter {
    pub fn new(settings: FilterSettings, limits: Limits) -> Result<Self, DimensionError> {
        Self::with_solver(settings, limits, Box::new(ProjectionSolver::default()))
    }

    pub fn with_solver(
        settings: FilterSettings,
        limits: Limits,
        solver: Box<dyn QpSolver>,
    ) -> Result<Self, DimensionError> {
        let m = limits.dim();
        DimensionError::check("control weights", m, settings.control_weights.len())?;
        DimensionError::check("actuator bounds", m, settings.actuator_bounds.len())?;
        Ok(Self {
            settings,
            limits,
            solver,
        })
    }

    pub fn n_controls(&self) -> usize {
        self.limits.dim()
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn settings(&self) -> &FilterSettings {
        &self.settings
    }

    /// Build the QP for one tick.
    pub fn build_problem(&self, input: &FilterInput<'_>) -> Result<QpProblem, DimensionError> {
        let m = self.n_controls();
        let n = input.grad_h.len();
        DimensionError::check("reference control", m, input.u_ref.len())?;
        DimensionError::check("drift term", n, input.f.len())?;
        DimensionError::check("input matrix rows", n, input.g.nrows())?;
        DimensionError::check("input matrix columns", m, input.g.ncols())?;
        if let Some(fault) = input.fault {
            if fault.channel >= m {
                return Err(DimensionError {
                    what: "fault channel (must be below channel count)",
                    expected: m,
                    actual: fault.channel,
                });
            }
        }

        let lf = input.grad_h.dot(&input.f);
        let mut lg = input.grad_h.dot(&input.g);
        let mut rhs = lf;
        if let Some(fault) = input.fault {
            let j = fault.channel;
            let loss = fault.authority_loss;
            rhs -= loss * lg[j].abs() * self.settings.actuator_bounds[j];
            lg[j] *= 1.0 - loss;
        }
        let h = if input.h == 0.0 { H_EPSILON } else { input.h };

        let mut a = Array2::zeros((1, m + 1));
        a.slice_mut(s![0, ..m]).assign(&(-&lg));
        a[[0, m]] = -h;

        let mut p_diag = Array1::zeros(m + 1);
        let mut q = Array1::zeros(m + 1);
        for i in 0..m {
            let w = self.settings.control_weights[i];
            p_diag[i] = 2.0 * w;
            q[i] = -2.0 * w * input.u_ref[i];
        }
        p_diag[m] = 2.0 * self.settings.relaxation_penalty;

        let mut lower = Array1::zeros(m + 1);
        let mut upper = Array1::zeros(m + 1);
        lower.slice_mut(s![..m]).assign(&self.limits.lower);
        upper.slice_mut(s![..m]).assign(&self.limits.upper);
        upper[m] = self.settings.relaxation_cap;

        Ok(QpProblem {
            p_diag,
            q,
            a,
            b: Array1::from_elem(1, rhs),
            lower,
            upper,
        })
    }

    /// Safe control for one tick. Solver failures degrade to the clipped
    /// reference; only malformed inputs are errors.
    pub fn solve(&self, input: &FilterInput<'_>) -> Result<FilterOutcome, DimensionError> {
        let problem = self.build_problem(input)?;
        let m = self.n_controls();

        let outcome = match self.solver.solve(&problem) {
            Ok(solution) => FilterOutcome {
                u: solution.z.slice(s![..m]).to_owned(),
                relaxation: solution.z[m],
                status: FilterStatus::Solved,
            },
            Err(error) => {
                tracing::warn!(%error, h = input.h, "safety QP failed, emitting clipped reference");
                FilterOutcome {
                    u: self.limits.clamp(input.u_ref),
                    relaxation: 0.0,
                    status: FilterStatus::Fallback(error),
                }
            }
        };
        debug_assert!(self.limits.contains(outcome.u.view()));
        Ok(outcome)
    }
}

/// Best certificate rate reachable inside the control box:
/// ∇h·f + Σᵢ maxᵤ (∇h·gᵢ) uᵢ, with a faulted channel contributing its
/// worst case instead of its best.
pub fn achievable_rate(
    grad_h: ArrayView1<f64>,
    f: ArrayView1<f64>,
    g: ArrayView2<f64>,
    limits: &Limits,
    fault: Option<ChannelFault>,
) -> f64 {
    let lg = grad_h.dot(&g);
    let mut rate = grad_h.dot(&f);
    for (i, l) in lg.iter().enumerate() {
        let (lo, hi) = (limits.lower[i], limits.upper[i]);
        let best = (l * lo).max(l * hi);
        let worst = (l * lo).min(l * hi);
        let loss = match fault {
            Some(fc) if fc.channel == i => fc.authority_loss,
            _ => 0.0,
        };
        rate += (1.0 - loss) * best + loss * worst;
    }
    rate
}
