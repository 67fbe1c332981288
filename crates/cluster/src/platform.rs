//! Provisioning platform seam.
//!
//! The engine only needs coarse-grained workload control: create a named
//! workload from a [`WorkloadSpec`], start it, stop it, delete it and ask
//! whether it is running. [`HttpPlatform`] speaks a small JSON REST API;
//! [`MockPlatform`](crate::mock::MockPlatform) keeps everything in memory.
//!
//! ## HTTP API
//!
//! | Call | Request |
//! |------|---------|
//! | create | `POST {base}/namespaces/{ns}/workloads` (201, 409 on duplicate) |
//! | connect / is_running | `GET {base}/namespaces/{ns}/workloads/{name}` |
//! | start / stop | `POST {base}/namespaces/{ns}/workloads/{name}/start` or `/stop` |
//! | delete | `DELETE {base}/namespaces/{ns}/workloads/{name}` |

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hive_common::config::PersistenceConfig;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bee_client::{BeeClient, DEFAULT_REQUEST_TIMEOUT};
use crate::error::PlatformError;
use crate::node::{Endpoint, NodeApi};

// ════════════════════════════════════════════════════════════════════════════
// WORKLOAD CONFIGURATION
// ════════════════════════════════════════════════════════════════════════════

/// Identity keys handed to a workload so its network identity is known in
/// advance (bootnodes).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeKeys {
    /// Hex-encoded overlay signing key.
    pub swarm_key: String,
    /// Hex-encoded transport key.
    pub libp2p_key: String,
}

/// Per-node options given to `add`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeOptions {
    pub keys: Option<NodeKeys>,
    /// Replaces the group's bootnode list for this node when set.
    pub bootnodes: Option<Vec<String>>,
}

/// Options shared by every member of a node group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeGroupOptions {
    pub image: String,
    pub labels: BTreeMap<String, String>,
    pub persistence: Option<PersistenceConfig>,
    pub bootnodes: Vec<String>,
    /// Interval between readiness probes while starting or stopping.
    pub readiness_poll: Duration,
}

impl Default for NodeGroupOptions {
    fn default() -> Self {
        Self {
            image: "ethersphere/bee:latest".to_string(),
            labels: BTreeMap::new(),
            persistence: None,
            bootnodes: Vec::new(),
            readiness_poll: Duration::from_millis(500),
        }
    }
}

/// Everything the platform needs to create one workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub group: String,
    pub name: String,
    pub image: String,
    pub labels: BTreeMap<String, String>,
    pub persistence: Option<PersistenceConfig>,
    pub bootnodes: Vec<String>,
    pub keys: Option<NodeKeys>,
}

impl WorkloadSpec {
    pub fn new(group: &str, name: &str, group_opts: &NodeGroupOptions, opts: &NodeOptions) -> Self {
        Self {
            group: group.to_string(),
            name: name.to_string(),
            image: group_opts.image.clone(),
            labels: group_opts.labels.clone(),
            persistence: group_opts.persistence.clone(),
            bootnodes: opts
                .bootnodes
                .clone()
                .unwrap_or_else(|| group_opts.bootnodes.clone()),
            keys: opts.keys.clone(),
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// PLATFORM TRAIT
// ════════════════════════════════════════════════════════════════════════════

/// Workload provisioning.
///
/// Workload names are unique per platform. `start` and `stop` only issue
/// the transition; callers poll [`is_running`](Platform::is_running) until
/// the desired state is reached.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Create the workload and return a data-plane client for it.
    async fn create(&self, spec: &WorkloadSpec) -> Result<Arc<dyn NodeApi>, PlatformError>;

    /// Data-plane client for an existing workload.
    async fn connect(&self, group: &str, name: &str) -> Result<Arc<dyn NodeApi>, PlatformError>;

    async fn start(&self, name: &str) -> Result<(), PlatformError>;

    async fn stop(&self, name: &str) -> Result<(), PlatformError>;

    /// Remove the workload and release its resources.
    async fn delete(&self, name: &str) -> Result<(), PlatformError>;

    async fn is_running(&self, name: &str) -> Result<bool, PlatformError>;
}

// ════════════════════════════════════════════════════════════════════════════
// HTTP PLATFORM
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
struct WorkloadStatus {
    running: bool,
    api_url: String,
    debug_api_url: String,
}

/// Client for a REST provisioning service.
#[derive(Clone)]
pub struct HttpPlatform {
    base_url: String,
    namespace: String,
    client: Client,
    node_timeout: Duration,
}

impl HttpPlatform {
    pub fn new(base_url: impl Into<String>, namespace: impl Into<String>) -> Result<Self, PlatformError> {
        Self::with_timeout(base_url, namespace, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(
        base_url: impl Into<String>,
        namespace: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, PlatformError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PlatformError::Request(format!("building http client: {}", e)))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            namespace: namespace.into(),
            client,
            node_timeout: timeout,
        })
    }

    fn workloads_url(&self) -> String {
        format!("{}/namespaces/{}/workloads", self.base_url, self.namespace)
    }

    fn workload_url(&self, name: &str) -> String {
        format!("{}/{}", self.workloads_url(), name)
    }

    fn client_for(&self, name: &str, endpoint: Endpoint) -> Result<Arc<dyn NodeApi>, PlatformError> {
        let client = BeeClient::new(name, endpoint, self.node_timeout)
            .map_err(|e| PlatformError::Request(e.to_string()))?;
        Ok(Arc::new(client))
    }

    async fn check(&self, name: &str, resp: Result<Response, reqwest::Error>) -> Result<Response, PlatformError> {
        let resp = resp.map_err(|e| PlatformError::Request(e.to_string()))?;
        match resp.status() {
            s if s.is_success() => Ok(resp),
            StatusCode::NOT_FOUND => Err(PlatformError::NotFound(name.to_string())),
            StatusCode::CONFLICT => Err(PlatformError::AlreadyExists(name.to_string())),
            s => Err(PlatformError::Rejected {
                name: name.to_string(),
                status: s.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            }),
        }
    }

    async fn status(&self, name: &str) -> Result<WorkloadStatus, PlatformError> {
        let resp = self.client.get(self.workload_url(name)).send().await;
        let resp = self.check(name, resp).await?;
        resp.json::<WorkloadStatus>()
            .await
            .map_err(|e| PlatformError::Request(format!("decoding status of {}: {}", name, e)))
    }
}

#[async_trait]
impl Platform for HttpPlatform {
    async fn create(&self, spec: &WorkloadSpec) -> Result<Arc<dyn NodeApi>, PlatformError> {
        debug!(name = %spec.name, group = %spec.group, image = %spec.image, "creating workload");
        let resp = self.client.post(self.workloads_url()).json(spec).send().await;
        let resp = self.check(&spec.name, resp).await?;
        let status = resp
            .json::<WorkloadStatus>()
            .await
            .map_err(|e| PlatformError::Request(format!("decoding workload {}: {}", spec.name, e)))?;
        self.client_for(
            &spec.name,
            Endpoint {
                api_url: status.api_url,
                debug_api_url: status.debug_api_url,
            },
        )
    }

    async fn connect(&self, _group: &str, name: &str) -> Result<Arc<dyn NodeApi>, PlatformError> {
        let status = self.status(name).await?;
        self.client_for(
            name,
            Endpoint {
                api_url: status.api_url,
                debug_api_url: status.debug_api_url,
            },
        )
    }

    async fn start(&self, name: &str) -> Result<(), PlatformError> {
        let resp = self
            .client
            .post(format!("{}/start", self.workload_url(name)))
            .send()
            .await;
        self.check(name, resp).await.map(|_| ())
    }

    async fn stop(&self, name: &str) -> Result<(), PlatformError> {
        let resp = self
            .client
            .post(format!("{}/stop", self.workload_url(name)))
            .send()
            .await;
        self.check(name, resp).await.map(|_| ())
    }

    async fn delete(&self, name: &str) -> Result<(), PlatformError> {
        let resp = self.client.delete(self.workload_url(name)).send().await;
        self.check(name, resp).await.map(|_| ())
    }

    async fn is_running(&self, name: &str) -> Result<bool, PlatformError> {
        Ok(self.status(name).await?.running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_bootnodes_override_group() {
        let group = NodeGroupOptions {
            bootnodes: vec!["/dns4/bootnode-0/tcp/1634".into()],
            ..NodeGroupOptions::default()
        };
        let spec = WorkloadSpec::new("bee", "bee-0", &group, &NodeOptions::default());
        assert_eq!(spec.bootnodes, group.bootnodes);

        let own = NodeOptions {
            bootnodes: Some(Vec::new()),
            ..NodeOptions::default()
        };
        let spec = WorkloadSpec::new("bee", "bee-0", &group, &own);
        assert!(spec.bootnodes.is_empty());
        assert_eq!(spec.group, "bee");
        assert_eq!(spec.image, "ethersphere/bee:latest");
    }

    #[test]
    fn urls_include_namespace() {
        let platform = HttpPlatform::new("http://platform:8080/", "hive").expect("client");
        assert_eq!(
            platform.workload_url("bee-1"),
            "http://platform:8080/namespaces/hive/workloads/bee-1"
        );
    }
}
