//! Safety filter: the per-tick certificate QP and the solver behind it.

pub mod cbf_qp;
pub mod qp;

pub use cbf_qp::{
    achievable_rate, ChannelFault, FilterInput, FilterOutcome, FilterSettings, FilterStatus,
    SafetyFilter,
};
pub use qp::{ProjectionSolver, QpProblem, QpSolution, QpSolver, SolverConfig};
