//! All-pairs round-trip probe.
//!
//! Every running node pings the overlay of every other running node. The
//! check passes when each probe is answered within `probe_timeout`; each
//! pair's RTT is recorded.

use std::sync::Arc;

use async_trait::async_trait;
use hive_cluster::{Cluster, NodeError};
use hive_common::retry::retry_with_backoff;
use hive_common::SeededRng;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::check::{Check, CheckError, CheckReport, Options};
use crate::metrics::Observation;

pub const NAME: &str = "ping";

#[derive(Debug, Default, Clone, Copy)]
pub struct PingCheck;

impl PingCheck {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Check for PingCheck {
    fn name(&self) -> &str {
        NAME
    }

    async fn run(
        &self,
        cluster: &Cluster,
        options: &Options,
        rng: &mut SeededRng,
    ) -> Result<CheckReport, CheckError> {
        let nodes = cluster.running_nodes();
        let overlays = cluster.overlays().await?;

        let mut pairs = Vec::new();
        for node in &nodes {
            for peer in &nodes {
                if node.name() == peer.name() {
                    continue;
                }
                let overlay = overlays
                    .get(peer.name())
                    .copied()
                    .ok_or_else(|| NodeError::NotRunning {
                        node: peer.name().to_string(),
                    })?;
                pairs.push((node.clone(), peer.name().to_string(), overlay));
            }
        }
        rng.shuffle(&mut pairs);

        let permits = Arc::new(Semaphore::new(options.buffer.max(1)));
        let mut set = JoinSet::new();
        for (node, peer, overlay) in pairs {
            let permits = Arc::clone(&permits);
            let retry = options.retry.clone();
            let limit = options.probe_timeout;
            set.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| CheckError::Task(e.to_string()))?;
                let probe = retry_with_backoff(&retry, NodeError::is_retryable, || node.ping(&overlay));
                match tokio::time::timeout(limit, probe).await {
                    Ok(result) => {
                        let rtt = result.into_result()?;
                        Ok((node.name().to_string(), peer, rtt))
                    }
                    Err(_) => Err(CheckError::ProbeTimeout {
                        node: node.name().to_string(),
                        peer,
                        timeout: limit,
                    }),
                }
            });
        }

        let mut report = CheckReport::new(NAME);
        let mut rtts = Vec::new();
        while let Some(joined) = set.join_next().await {
            let outcome = joined.map_err(|e| CheckError::Task(e.to_string())).and_then(|r| r);
            match outcome {
                Ok(result) => rtts.push(result),
                Err(e) => {
                    set.abort_all();
                    return Err(e);
                }
            }
        }

        // report in a stable order regardless of completion order
        rtts.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
        for (node, peer, rtt) in &rtts {
            debug!(node = %node, peer = %peer, rtt = ?rtt, "pong");
            report.record(
                options,
                Observation::gauge("hive_ping_rtt_seconds", rtt.as_secs_f64())
                    .with_label("node", node.as_str())
                    .with_label("peer", peer.as_str()),
            );
        }
        report.record(
            options,
            Observation::counter("hive_ping_pairs_total", rtts.len() as f64),
        );
        info!(nodes = nodes.len(), pairs = rtts.len(), "all pings answered");
        Ok(report)
    }
}
