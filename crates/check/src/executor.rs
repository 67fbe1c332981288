//! Stage executor.
//!
//! Applies a stage plan to a cluster one stage at a time and runs a check
//! between stages.
//!
//! ## Per stage
//!
//! 1. Plan: [`plan_stage`] turns counts into `(group, node, action)`
//!    assignments. An infeasible stage fails here, before any platform call.
//! 2. Apply: one task per assignment on a `JoinSet`, at most `buffer` in
//!    flight (semaphore). Every task is joined before the stage counts as
//!    applied.
//! 3. On the first failed task the remaining tasks are aborted and the run
//!    fails with an [`AggregateError`]. Completed side effects stay.
//! 4. Check: the check runs against the settled cluster under
//!    `check_timeout`; a failure ends the run.
//!
//! Stages are strictly ordered: stage N+1 is not planned before stage N and
//! its check have completed. An empty plan runs the check once against the
//! cluster as it is.

use std::sync::Arc;
use std::time::Duration;

use hive_cluster::{Cluster, ClusterError, NodeOptions};
use hive_common::{RunConfig, SeededRng};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::check::{Check, CheckError, CheckReport, Options};
use crate::stage::{plan_stage, Action, Assignment, NameCounters, PlanError, Stage};

// ════════════════════════════════════════════════════════════════════════════
// CONFIGURATION
// ════════════════════════════════════════════════════════════════════════════

/// When the check runs relative to stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckSchedule {
    /// After every applied stage.
    EveryStage,
    /// Once, after the last stage.
    FinalStage,
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Membership operations in flight at once.
    pub buffer: usize,
    /// Bound for a single add/start/stop/delete.
    pub operation_timeout: Duration,
    /// Bound for applying a whole stage.
    pub stage_timeout: Duration,
    /// Bound for one check invocation.
    pub check_timeout: Duration,
    pub schedule: CheckSchedule,
    /// Also run the check once against the initial cluster.
    pub check_before_stages: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            buffer: 12,
            operation_timeout: Duration::from_secs(5 * 60),
            stage_timeout: Duration::from_secs(10 * 60),
            check_timeout: Duration::from_secs(15 * 60),
            schedule: CheckSchedule::EveryStage,
            check_before_stages: false,
        }
    }
}

impl ExecutorConfig {
    pub fn from_config(cfg: &RunConfig) -> Self {
        Self {
            buffer: cfg.buffer.max(1),
            operation_timeout: Duration::from_secs(cfg.timeouts.operation_secs),
            stage_timeout: Duration::from_secs(cfg.timeouts.stage_secs),
            check_timeout: Duration::from_secs(cfg.timeouts.check_secs),
            ..Self::default()
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// ERRORS
// ════════════════════════════════════════════════════════════════════════════

/// A membership operation that failed, with the node it targeted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("stage {stage}: {action} {group}/{node}: {source}")]
pub struct AssignmentError {
    pub stage: usize,
    pub group: String,
    pub node: String,
    pub action: Action,
    #[source]
    pub source: ClusterError,
}

/// First failure of a stage barrier plus how many siblings were cut short.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{first} ({cancelled} sibling operations cancelled)")]
pub struct AggregateError {
    pub first: AssignmentError,
    pub cancelled: usize,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("stage {stage}: cannot plan update for group {group}: {reason}")]
    InvalidPlan {
        stage: usize,
        group: String,
        reason: String,
    },

    #[error(transparent)]
    Stage(#[from] AggregateError),

    #[error("stage {stage} not applied within {timeout:?} ({cancelled} operations cancelled)")]
    StageTimeout {
        stage: usize,
        timeout: Duration,
        cancelled: usize,
    },

    #[error("{}: check {check} failed: {source}", describe_point(.stage))]
    Check {
        /// `None` for the check against the initial cluster.
        stage: Option<usize>,
        check: String,
        #[source]
        source: CheckError,
    },

    #[error("stage {stage}: membership task failed: {message}")]
    Task { stage: usize, message: String },
}

fn describe_point(stage: &Option<usize>) -> String {
    match stage {
        Some(s) => format!("after stage {}", s),
        None => "before stages".to_string(),
    }
}

impl From<PlanError> for RunError {
    fn from(e: PlanError) -> Self {
        RunError::InvalidPlan {
            stage: e.stage,
            group: e.group,
            reason: e.reason,
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// SUMMARY
// ════════════════════════════════════════════════════════════════════════════

/// What a successful run did.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub seed: i64,
    pub stages_applied: usize,
    pub checks_passed: usize,
    /// Every applied assignment, in stage order.
    pub assignments: Vec<Assignment>,
    pub reports: Vec<CheckReport>,
}

impl RunSummary {
    pub fn observation_count(&self) -> usize {
        self.reports.iter().map(|r| r.observations.len()).sum()
    }
}

// ════════════════════════════════════════════════════════════════════════════
// EXECUTOR
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default)]
pub struct StageExecutor {
    config: ExecutorConfig,
}

impl StageExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Apply `stages` in order, running `check` per the configured schedule.
    ///
    /// `rng` is the run's only source of randomness; it drives both member
    /// selection and the check's own choices.
    pub async fn run(
        &self,
        cluster: &Cluster,
        check: &dyn Check,
        options: &Options,
        stages: &[Stage],
        rng: &mut SeededRng,
    ) -> Result<RunSummary, RunError> {
        let mut summary = RunSummary {
            seed: options.seed,
            ..RunSummary::default()
        };
        info!(
            seed = options.seed,
            stages = stages.len(),
            check = check.name(),
            buffer = self.config.buffer,
            "starting run"
        );

        // structural problems surface before anything is touched
        for (i, stage) in stages.iter().enumerate() {
            for u in &stage.updates {
                if let Err(e) = cluster.node_group(&u.node_group) {
                    return Err(RunError::InvalidPlan {
                        stage: i,
                        group: u.node_group.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        // with nothing to apply the check still has to run once
        if self.config.check_before_stages || stages.is_empty() {
            let report = self.run_check(cluster, check, options, rng, None).await?;
            summary.checks_passed += 1;
            summary.reports.push(report);
        }

        let mut counters = NameCounters::default();
        for (i, stage) in stages.iter().enumerate() {
            let assignments = plan_stage(i, stage, cluster, &mut counters, rng)?;
            self.apply_stage(cluster, i, &assignments).await?;
            summary.stages_applied += 1;
            summary.assignments.extend(assignments);
            info!(stage = i, sizes = ?cluster.sizes(), "stage applied");

            let last = i + 1 == stages.len();
            if self.config.schedule == CheckSchedule::EveryStage || last {
                let report = self.run_check(cluster, check, options, rng, Some(i)).await?;
                summary.checks_passed += 1;
                summary.reports.push(report);
            }
        }

        info!(
            seed = summary.seed,
            stages = summary.stages_applied,
            checks = summary.checks_passed,
            assignments = summary.assignments.len(),
            "run succeeded"
        );
        Ok(summary)
    }

    /// Run the check once against the cluster as it is.
    pub async fn run_once(
        &self,
        cluster: &Cluster,
        check: &dyn Check,
        options: &Options,
        rng: &mut SeededRng,
    ) -> Result<RunSummary, RunError> {
        let report = self.run_check(cluster, check, options, rng, None).await?;
        Ok(RunSummary {
            seed: options.seed,
            checks_passed: 1,
            reports: vec![report],
            ..RunSummary::default()
        })
    }

    async fn apply_stage(
        &self,
        cluster: &Cluster,
        stage: usize,
        assignments: &[Assignment],
    ) -> Result<(), RunError> {
        let permits = Arc::new(Semaphore::new(self.config.buffer.max(1)));
        let limit = self.config.operation_timeout;
        let mut set = JoinSet::new();

        for a in assignments {
            let group = cluster.node_group(&a.group).map_err(|e| RunError::InvalidPlan {
                stage,
                group: a.group.clone(),
                reason: e.to_string(),
            })?;
            let permits = Arc::clone(&permits);
            let a = a.clone();
            set.spawn(async move {
                let result = match permits.acquire_owned().await {
                    Ok(_permit) => match a.action {
                        Action::Add => group
                            .add_start(&a.node, NodeOptions::default(), limit)
                            .await
                            .map(|_| ()),
                        Action::Start => group.start(&a.node, limit).await,
                        Action::Stop => group.stop(&a.node, limit).await,
                        Action::Delete => group.delete(&a.node, limit).await,
                    },
                    Err(e) => Err(ClusterError::Task(e.to_string())),
                };
                result.map_err(|source| AssignmentError {
                    stage: a.stage,
                    group: a.group,
                    node: a.node,
                    action: a.action,
                    source,
                })
            });
        }

        let deadline = Instant::now() + self.config.stage_timeout;
        loop {
            let joined = match tokio::time::timeout_at(deadline, set.join_next()).await {
                Ok(Some(joined)) => joined,
                Ok(None) => return Ok(()),
                Err(_) => {
                    let cancelled = abort_and_count(&mut set).await;
                    error!(stage, cancelled, "stage deadline exceeded");
                    return Err(RunError::StageTimeout {
                        stage,
                        timeout: self.config.stage_timeout,
                        cancelled,
                    });
                }
            };

            match joined {
                Ok(Ok(())) => {}
                Ok(Err(first)) => {
                    let cancelled = abort_and_count(&mut set).await;
                    error!(
                        stage,
                        group = %first.group,
                        node = %first.node,
                        action = %first.action,
                        cancelled,
                        error = %first.source,
                        "membership operation failed"
                    );
                    return Err(AggregateError { first, cancelled }.into());
                }
                Err(e) => {
                    abort_and_count(&mut set).await;
                    return Err(RunError::Task {
                        stage,
                        message: e.to_string(),
                    });
                }
            }
        }
    }

    async fn run_check(
        &self,
        cluster: &Cluster,
        check: &dyn Check,
        options: &Options,
        rng: &mut SeededRng,
        stage: Option<usize>,
    ) -> Result<CheckReport, RunError> {
        let limit = self.config.check_timeout;
        let outcome = match tokio::time::timeout(limit, check.run(cluster, options, rng)).await {
            Ok(result) => result,
            Err(_) => Err(CheckError::Timeout(limit)),
        };

        if options.metrics_enabled {
            if let Err(e) = options.metrics.push().await {
                warn!(check = check.name(), error = %e, "metrics push failed");
            }
        }

        match outcome {
            Ok(report) => {
                info!(check = check.name(), stage = ?stage, observations = report.observations.len(), "check passed");
                Ok(report)
            }
            Err(source) => {
                error!(check = check.name(), stage = ?stage, error = %source, "check failed");
                Err(RunError::Check {
                    stage,
                    check: check.name().to_string(),
                    source,
                })
            }
        }
    }
}

/// Abort every task still in the set and count the ones that were cut
/// short (as opposed to having finished on their own).
async fn abort_and_count<T: 'static>(set: &mut JoinSet<T>) -> usize {
    set.abort_all();
    let mut cancelled = 0;
    while let Some(joined) = set.join_next().await {
        if matches!(joined, Err(ref e) if e.is_cancelled()) {
            cancelled += 1;
        }
    }
    cancelled
}
