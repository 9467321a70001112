//! Runtime: artifact startup, the per-tick control loop, plant-side fault
//! injection, telemetry and offline rollouts.

pub mod control_loop;
pub mod health;
pub mod plant;
pub mod rollout;
pub mod startup;

pub use control_loop::{ControlLoop, TickReport};
pub use health::{HealthMonitor, HealthReport, HealthStatus};
pub use plant::{FaultInjection, FaultMode, Plant, SensorNoise};
pub use rollout::{run_batch, run_rollout, Rollout, RolloutSpec, RolloutSummary, TraceRow};
pub use startup::{load_components, ArtifactSources, LoopComponents};
