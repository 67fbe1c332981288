//! The check contract.
//!
//! A check runs against a cluster snapshot and either passes with a
//! [`CheckReport`] or fails with a [`CheckError`]. Checks only use the data
//! plane; they never add, start, stop or delete members. Every random choice
//! a check makes is drawn from the run's [`SeededRng`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hive_cluster::{Cluster, ClusterError, NodeError};
use hive_common::{Address, RetryConfig, RunConfig, SeededRng};
use thiserror::Error;

use crate::metrics::{MetricsSink, NoopSink, Observation};

/// Group the signed-chunk probe uploads through by default.
pub const DEFAULT_NODE_GROUP: &str = "bee";

// ════════════════════════════════════════════════════════════════════════════
// OPTIONS
// ════════════════════════════════════════════════════════════════════════════

/// Read-only inputs of a check invocation.
#[derive(Clone)]
pub struct Options {
    pub seed: i64,
    /// Node store size in chunks.
    pub store_size: usize,
    pub store_size_divisor: usize,
    /// Pause between GC pressure and the durability assertions.
    pub gc_wait: Duration,
    /// Budget for retried data-plane calls.
    pub retry: RetryConfig,
    /// Bound for one probe (e.g. one ping).
    pub probe_timeout: Duration,
    /// Fan-out bound for probes.
    pub buffer: usize,
    pub node_group: String,
    pub metrics_enabled: bool,
    pub metrics: Arc<dyn MetricsSink>,
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("seed", &self.seed)
            .field("store_size", &self.store_size)
            .field("store_size_divisor", &self.store_size_divisor)
            .field("gc_wait", &self.gc_wait)
            .field("probe_timeout", &self.probe_timeout)
            .field("buffer", &self.buffer)
            .field("node_group", &self.node_group)
            .field("metrics_enabled", &self.metrics_enabled)
            .finish()
    }
}

impl Default for Options {
    fn default() -> Self {
        Self {
            seed: 0,
            store_size: 1000,
            store_size_divisor: 4,
            gc_wait: Duration::from_secs(5),
            retry: RetryConfig::default(),
            probe_timeout: Duration::from_secs(30),
            buffer: 12,
            node_group: DEFAULT_NODE_GROUP.to_string(),
            metrics_enabled: false,
            metrics: Arc::new(NoopSink),
        }
    }
}

impl Options {
    pub fn from_config(cfg: &RunConfig, seed: i64, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            seed,
            store_size: cfg.pinning.store_size,
            store_size_divisor: cfg.pinning.store_size_divisor,
            gc_wait: Duration::from_secs(cfg.pinning.gc_wait_secs),
            retry: cfg.pinning.retry.clone(),
            buffer: cfg.buffer.max(1),
            metrics_enabled: cfg.metrics.enabled,
            metrics,
            ..Self::default()
        }
    }

    /// Forward an observation to the sink when metrics are enabled.
    pub fn record(&self, observation: Observation) {
        if self.metrics_enabled {
            self.metrics.observe(observation);
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// OUTCOME
// ════════════════════════════════════════════════════════════════════════════

/// Successful outcome of one check invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckReport {
    pub check: String,
    pub observations: Vec<Observation>,
}

impl CheckReport {
    pub fn new(check: impl Into<String>) -> Self {
        Self {
            check: check.into(),
            observations: Vec::new(),
        }
    }

    /// Keep the observation in the report and forward it to the sink.
    pub fn record(&mut self, options: &Options, observation: Observation) {
        options.record(observation.clone());
        self.observations.push(observation);
    }
}

#[derive(Debug, Error)]
pub enum CheckError {
    /// A pinned chunk is gone after garbage collection pressure.
    #[error("node {node} lost pinned chunk {address}")]
    ContentLost { node: String, address: Address },

    /// Retrieved data differs from what was uploaded.
    #[error("integrity mismatch for {address} on {node}: {reason}")]
    IntegrityMismatch {
        node: String,
        address: Address,
        reason: String,
    },

    #[error("probe from {node} to {peer} timed out after {timeout:?}")]
    ProbeTimeout {
        node: String,
        peer: String,
        timeout: Duration,
    },

    #[error("no running nodes in {0}")]
    NoNodes(String),

    #[error("check did not finish within {0:?}")]
    Timeout(Duration),

    #[error("invalid check input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Node(#[from] NodeError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error("check task failed: {0}")]
    Task(String),
}

// ════════════════════════════════════════════════════════════════════════════
// CHECK TRAIT
// ════════════════════════════════════════════════════════════════════════════

#[async_trait]
pub trait Check: Send + Sync {
    fn name(&self) -> &str;

    async fn run(
        &self,
        cluster: &Cluster,
        options: &Options,
        rng: &mut SeededRng,
    ) -> Result<CheckReport, CheckError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MemorySink;

    #[test]
    fn record_respects_metrics_flag() {
        let sink = Arc::new(MemorySink::new());
        let mut options = Options {
            metrics: sink.clone(),
            ..Options::default()
        };
        let mut report = CheckReport::new("ping");

        report.record(&options, Observation::counter("a", 1.0));
        assert!(sink.observations().is_empty());
        assert_eq!(report.observations.len(), 1);

        options.metrics_enabled = true;
        report.record(&options, Observation::counter("b", 1.0));
        assert_eq!(sink.named("b").len(), 1);
        assert_eq!(report.observations.len(), 2);
    }

    #[test]
    fn options_from_config() {
        let mut cfg = RunConfig::default();
        cfg.pinning.store_size = 48;
        cfg.pinning.store_size_divisor = 12;
        let opts = Options::from_config(&cfg, -7, Arc::new(NoopSink));
        assert_eq!(opts.seed, -7);
        assert_eq!(opts.store_size / opts.store_size_divisor, 4);
        assert_eq!(opts.buffer, 12);
        assert!(!opts.metrics_enabled);
    }
}
