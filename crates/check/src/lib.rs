//! # Hive Check Crate
//!
//! Runs verification checks against a cluster while churning its
//! membership stage by stage.
//!
//! ## Modules
//! - `check`: the `Check` trait, `Options`, reports and check errors
//! - `stage`: stage plans and deterministic assignment planning
//! - `executor`: the stage executor and run errors
//! - `metrics`: observations and push-gateway reporting
//! - `checks`: round-trip, pinned-content and signed-chunk probes

pub mod check;
pub mod checks;
pub mod executor;
pub mod metrics;
pub mod stage;

pub use check::{Check, CheckError, CheckReport, Options};
pub use executor::{
    AggregateError, AssignmentError, CheckSchedule, ExecutorConfig, RunError, RunSummary,
    StageExecutor,
};
pub use metrics::{MemorySink, MetricsSink, NoopSink, Observation, PushGateway};
pub use stage::{Action, Actions, Assignment, Stage, StagePlan, Update};
