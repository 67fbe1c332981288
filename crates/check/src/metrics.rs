//! Metrics reporting for checks.
//!
//! Checks record scalar [`Observation`]s; a [`MetricsSink`] buffers them
//! and pushes them to an external time-series store. Push failures are the
//! caller's to log; they never change a check outcome.
//!
//! | Sink | Use |
//! |------|-----|
//! | [`PushGateway`] | Prometheus push gateway, text exposition format |
//! | [`MemorySink`] | tests |
//! | [`NoopSink`] | metrics disabled |

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use thiserror::Error;
use tracing::debug;

// ════════════════════════════════════════════════════════════════════════════
// OBSERVATION
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Gauge,
    Counter,
}

impl MetricKind {
    fn as_str(self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Counter => "counter",
        }
    }
}

/// One named scalar with labels.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub name: String,
    pub kind: MetricKind,
    pub labels: BTreeMap<String, String>,
    pub value: f64,
}

impl Observation {
    pub fn gauge(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            kind: MetricKind::Gauge,
            labels: BTreeMap::new(),
            value,
        }
    }

    pub fn counter(name: impl Into<String>, value: f64) -> Self {
        Self {
            kind: MetricKind::Counter,
            ..Self::gauge(name, value)
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Render observations in Prometheus text exposition format.
///
/// Observations sharing a name are emitted under one `# TYPE` line, in the
/// order the name was first seen.
pub fn to_prometheus(observations: &[Observation]) -> String {
    let mut order: Vec<&str> = Vec::new();
    let mut by_name: BTreeMap<&str, Vec<&Observation>> = BTreeMap::new();
    for o in observations {
        let entry = by_name.entry(o.name.as_str()).or_default();
        if entry.is_empty() {
            order.push(o.name.as_str());
        }
        entry.push(o);
    }

    let mut out = String::new();
    for name in order {
        let group = &by_name[name];
        let _ = writeln!(out, "# TYPE {} {}", name, group[0].kind.as_str());
        for o in group {
            if o.labels.is_empty() {
                let _ = writeln!(out, "{} {}", name, o.value);
            } else {
                let labels: Vec<String> = o
                    .labels
                    .iter()
                    .map(|(k, v)| format!("{}=\"{}\"", k, escape_label(v)))
                    .collect();
                let _ = writeln!(out, "{}{{{}}} {}", name, labels.join(","), o.value);
            }
        }
    }
    out
}

fn escape_label(v: &str) -> String {
    v.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

// ════════════════════════════════════════════════════════════════════════════
// SINKS
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("metrics push failed: {0}")]
    Request(String),

    #[error("push gateway answered {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[async_trait]
pub trait MetricsSink: Send + Sync {
    /// Buffer one observation.
    fn observe(&self, observation: Observation);

    /// Send everything buffered since the last push.
    async fn push(&self) -> Result<(), MetricsError>;
}

/// Prometheus push gateway client.
///
/// Pushes to `{url}/metrics/job/{job}/namespace/{namespace}`.
pub struct PushGateway {
    url: String,
    job: String,
    namespace: String,
    client: Client,
    pending: Mutex<Vec<Observation>>,
}

impl PushGateway {
    pub fn new(
        url: impl Into<String>,
        job: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Result<Self, MetricsError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| MetricsError::Request(e.to_string()))?;
        Ok(Self {
            url: url.into().trim_end_matches('/').to_string(),
            job: job.into(),
            namespace: namespace.into(),
            client,
            pending: Mutex::new(Vec::new()),
        })
    }

    pub fn push_url(&self) -> String {
        format!(
            "{}/metrics/job/{}/namespace/{}",
            self.url, self.job, self.namespace
        )
    }
}

#[async_trait]
impl MetricsSink for PushGateway {
    fn observe(&self, observation: Observation) {
        self.pending.lock().push(observation);
    }

    async fn push(&self) -> Result<(), MetricsError> {
        let batch = std::mem::take(&mut *self.pending.lock());
        if batch.is_empty() {
            return Ok(());
        }
        let body = to_prometheus(&batch);
        debug!(url = %self.push_url(), observations = batch.len(), "pushing metrics");

        let resp = self
            .client
            .post(self.push_url())
            .header("content-type", "text/plain; version=0.0.4")
            .body(body)
            .send()
            .await
            .map_err(|e| MetricsError::Request(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(MetricsError::Rejected {
                status: resp.status().as_u16(),
                body: resp.text().await.unwrap_or_default(),
            })
        }
    }
}

/// Keeps every observation in memory.
#[derive(Default)]
pub struct MemorySink {
    observed: Mutex<Vec<Observation>>,
    pushes: AtomicUsize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observations(&self) -> Vec<Observation> {
        self.observed.lock().clone()
    }

    pub fn named(&self, name: &str) -> Vec<Observation> {
        self.observed
            .lock()
            .iter()
            .filter(|o| o.name == name)
            .cloned()
            .collect()
    }

    pub fn push_count(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetricsSink for MemorySink {
    fn observe(&self, observation: Observation) {
        self.observed.lock().push(observation);
    }

    async fn push(&self) -> Result<(), MetricsError> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

#[async_trait]
impl MetricsSink for NoopSink {
    fn observe(&self, _observation: Observation) {}

    async fn push(&self) -> Result<(), MetricsError> {
        Ok(())
    }
}
