//! Box-constrained QP with a diagonal objective.
//!
//! minimize   ½ zᵀ diag(p) z + qᵀ z
//! subject to A z ≤ b,  lower ≤ z ≤ upper
//!
//! One inequality row (the per-tick certificate QP) is solved exactly by a
//! search over its Lagrange multiplier: for fixed μ the minimizer is
//! z(μ) = clip(t − μ a / p, lower, upper) with t = −q / p, and a·z(μ) is
//! non-increasing in μ, so bisection finds the smallest feasible μ.
//!
//! Several rows fall back to Dykstra's alternating projection in the
//! p^{1/2}-scaled coordinates, where the objective is a plain Euclidean
//! distance to the scaled target.

use ndarray::{Array1, Array2, ArrayView1};

use crate::error::{DimensionError, QpError};

/// Problem data. Bounds may be infinite; everything else must be finite.
#[derive(Clone, Debug)]
pub struct QpProblem {
    /// Diagonal of the quadratic term. Strictly positive.
    pub p_diag: Array1<f64>,
    pub q: Array1<f64>,
    /// Inequality rows `A`, one per constraint.
    pub a: Array2<f64>,
    pub b: Array1<f64>,
    pub lower: Array1<f64>,
    pub upper: Array1<f64>,
}

impl QpProblem {
    pub fn n_vars(&self) -> usize {
        self.p_diag.len()
    }

    /// Unconstrained minimizer −q / p.
    pub fn target(&self) -> Array1<f64> {
        -&self.q / &self.p_diag
    }

    pub fn objective(&self, z: ArrayView1<f64>) -> f64 {
        z.iter()
            .zip(self.p_diag.iter().zip(self.q.iter()))
            .map(|(zi, (pi, qi))| 0.5 * pi * zi * zi + qi * zi)
            .sum()
    }

    /// Largest positive violation over inequality rows and box bounds.
    pub fn max_violation(&self, z: ArrayView1<f64>) -> f64 {
        let rows = (self.a.dot(&z) - &self.b)
            .iter()
            .fold(0.0_f64, |acc, v| acc.max(*v));
        let bounds = z
            .iter()
            .zip(self.lower.iter().zip(self.upper.iter()))
            .fold(0.0_f64, |acc, (v, (lo, hi))| acc.max(lo - v).max(v - hi));
        rows.max(bounds)
    }

    fn check(&self) -> Result<(), QpError> {
        let n = self.n_vars();
        DimensionError::check("qp linear term", n, self.q.len())?;
        DimensionError::check("qp constraint columns", n, self.a.ncols())?;
        DimensionError::check("qp constraint rhs", self.a.nrows(), self.b.len())?;
        DimensionError::check("qp lower bound", n, self.lower.len())?;
        DimensionError::check("qp upper bound", n, self.upper.len())?;

        for (index, &weight) in self.p_diag.iter().enumerate() {
            if !(weight.is_finite() && weight > 0.0) {
                return Err(QpError::InvalidObjective { index, weight });
            }
        }
        let finite = self
            .q
            .iter()
            .chain(self.a.iter())
            .chain(self.b.iter())
            .all(|v| v.is_finite());
        let bounds_ok = self
            .lower
            .iter()
            .chain(self.upper.iter())
            .all(|v| !v.is_nan());
        if !finite || !bounds_ok {
            return Err(QpError::NonFinite);
        }
        for (index, (&lower, &upper)) in self.lower.iter().zip(self.upper.iter()).enumerate() {
            if lower > upper {
                return Err(QpError::ContradictoryBounds {
                    index,
                    lower,
                    upper,
                });
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct QpSolution {
    pub z: Array1<f64>,

    /// Bisection or projection sweeps used.
    pub iterations: usize,

    /// Number of inequality rows holding with equality.
    pub active_constraints: usize,
}

/// Solver boundary used by the safety filter.
pub trait QpSolver: Send + Sync {
    fn solve(&self, problem: &QpProblem) -> Result<QpSolution, QpError>;
}

/// Iteration limits for [`ProjectionSolver`].
#[derive(Clone, Debug)]
pub struct SolverConfig {
    /// Cap on Dykstra sweeps (multi-row problems).
    pub max_iterations: usize,

    /// Cap on multiplier bisection steps (single-row problems).
    pub bisection_steps: usize,

    /// Feasibility tolerance on the final iterate.
    pub tolerance: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_iterations: 2_000,
            bisection_steps: 200,
            tolerance: 1e-9,
        }
    }
}

/// Built-in solver: exact multiplier search for one row, Dykstra otherwise.
#[derive(Clone, Debug, Default)]
pub struct ProjectionSolver {
    pub config: SolverConfig,
}

impl ProjectionSolver {
    pub fn new(config: SolverConfig) -> Self {
        Self { config }
    }
}

impl QpSolver for ProjectionSolver {
    fn solve(&self, problem: &QpProblem) -> Result<QpSolution, QpError> {
        problem.check()?;
        let mut solution = match problem.a.nrows() {
            0 => QpSolution {
                z: clip(problem.target().view(), problem),
                iterations: 0,
                active_constraints: 0,
            },
            1 => solve_single_row(problem, &self.config)?,
            _ => solve_dykstra(problem, &self.config)?,
        };
        // Exact box membership for the caller, whatever the path.
        for ((v, lo), hi) in solution
            .z
            .iter_mut()
            .zip(problem.lower.iter())
            .zip(problem.upper.iter())
        {
            *v = v.clamp(*lo, *hi);
        }
        solution.active_constraints = (problem.a.dot(&solution.z) - &problem.b)
            .iter()
            .filter(|r| r.abs() <= 1e-6)
            .count();
        Ok(solution)
    }
}

fn clip(z: ArrayView1<f64>, problem: &QpProblem) -> Array1<f64> {
    z.iter()
        .zip(problem.lower.iter().zip(problem.upper.iter()))
        .map(|(v, (lo, hi))| v.clamp(*lo, *hi))
        .collect()
}

/// Smallest value of `a·z` over the box.
fn box_minimum(a: ArrayView1<f64>, problem: &QpProblem) -> f64 {
    a.iter()
        .zip(problem.lower.iter().zip(problem.upper.iter()))
        .map(|(ai, (lo, hi))| {
            if *ai > 0.0 {
                ai * lo
            } else if *ai < 0.0 {
                ai * hi
            } else {
                0.0
            }
        })
        .sum()
}

fn solve_single_row(problem: &QpProblem, config: &SolverConfig) -> Result<QpSolution, QpError> {
    let a = problem.a.row(0);
    let b = problem.b[0];
    let target = problem.target();
    let step = &a / &problem.p_diag;

    let at = |mu: f64| -> Array1<f64> {
        let shifted = &target - &(&step * mu);
        clip(shifted.view(), problem)
    };

    let z0 = at(0.0);
    if a.dot(&z0) <= b {
        return Ok(QpSolution {
            z: z0,
            iterations: 0,
            active_constraints: 0,
        });
    }

    let best = box_minimum(a, problem);
    if best > b + config.tolerance {
        return Err(QpError::Infeasible { row: 0, best, rhs: b });
    }

    // Bracket: grow μ until z(μ) is feasible.
    let mut lo = 0.0_f64;
    let mut hi = 1.0_f64;
    let mut iterations = 0;
    loop {
        let z = at(hi);
        if a.dot(&z) <= b + config.tolerance {
            break;
        }
        iterations += 1;
        if iterations > config.bisection_steps || !hi.is_finite() {
            return Err(QpError::NotConverged {
                iterations,
                violation: a.dot(&z) - b,
            });
        }
        lo = hi;
        hi *= 2.0;
    }

    for _ in 0..config.bisection_steps {
        let mid = 0.5 * (lo + hi);
        if mid <= lo || mid >= hi {
            break;
        }
        iterations += 1;
        if a.dot(&at(mid)) <= b {
            hi = mid;
        } else {
            lo = mid;
        }
    }

    Ok(QpSolution {
        z: at(hi),
        iterations,
        active_constraints: 1,
    })
}

/// Project onto a single halfspace n·y ≤ c.
fn project_halfspace(y: &Array1<f64>, normal: &Array1<f64>, offset: f64) -> Array1<f64> {
    let dot = normal.dot(y);
    if dot <= offset {
        y.clone()
    } else {
        let norm_sq = normal.dot(normal);
        if norm_sq <= f64::EPSILON {
            return y.clone();
        }
        y - &(normal * ((dot - offset) / norm_sq))
    }
}

fn solve_dykstra(problem: &QpProblem, config: &SolverConfig) -> Result<QpSolution, QpError> {
    let n = problem.n_vars();
    let rows = problem.a.nrows();

    for row in 0..rows {
        let best = box_minimum(problem.a.row(row), problem);
        if best > problem.b[row] + config.tolerance {
            return Err(QpError::Infeasible {
                row,
                best,
                rhs: problem.b[row],
            });
        }
    }

    // y = sqrt(p) ⊙ z turns the objective into ½‖y − sqrt(p) ⊙ t‖².
    let scale = problem.p_diag.mapv(f64::sqrt);
    let normals: Vec<Array1<f64>> = (0..rows)
        .map(|r| &problem.a.row(r) / &scale)
        .collect();
    let lower = &problem.lower * &scale;
    let upper = &problem.upper * &scale;

    let mut y = &problem.target() * &scale;
    // One correction per halfspace plus one for the box.
    let mut corrections: Vec<Array1<f64>> = vec![Array1::zeros(n); rows + 1];
    let mut residual = f64::MAX;
    let mut iterations = 0;

    for iter in 0..config.max_iterations {
        let y_old = y.clone();

        for (i, normal) in normals.iter().enumerate() {
            let corrected = &y + &corrections[i];
            let projected = project_halfspace(&corrected, normal, problem.b[i]);
            corrections[i] = &corrected - &projected;
            y = projected;
        }

        let corrected = &y + &corrections[rows];
        let projected: Array1<f64> = corrected
            .iter()
            .zip(lower.iter().zip(upper.iter()))
            .map(|(v, (lo, hi))| v.clamp(*lo, *hi))
            .collect();
        corrections[rows] = &corrected - &projected;
        y = projected;

        let diff = &y - &y_old;
        residual = diff.dot(&diff).sqrt();
        iterations = iter + 1;
        if residual < config.tolerance {
            break;
        }
    }

    let z = &y / &scale;
    let violation = problem.max_violation(z.view());
    if violation > config.tolerance.max(1e-7) {
        return Err(QpError::NotConverged {
            iterations,
            violation,
        });
    }
    tracing::trace!(iterations, residual, "dykstra converged");

    Ok(QpSolution {
        z,
        iterations,
        active_constraints: 0,
    })
}
