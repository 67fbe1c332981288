//! Node data-plane API and the per-member node handle.
//!
//! [`NodeApi`] is the seam to one participant process: content upload,
//! download, pinning and peer probes. [`Node`] wraps an implementation with
//! the member's lifecycle state so that a stopped or deleted member rejects
//! I/O until it is started again.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hive_common::retry::{retry_with_backoff, RetryConfig, RetryResult};
use hive_common::Address;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::NodeError;

/// Overlay address of a node in the storage network.
pub type Overlay = Address;

/// Where a provisioned workload can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub api_url: String,
    pub debug_api_url: String,
}

// ════════════════════════════════════════════════════════════════════════════
// DATA-PLANE TRAIT
// ════════════════════════════════════════════════════════════════════════════

/// Data-plane operations of one node.
///
/// ## Contract
///
/// - Implementations do not retry internally; callers decide.
/// - Transient transport failures are reported as [`NodeError::Network`] or
///   [`NodeError::Timeout`] so that [`NodeError::is_retryable`] holds.
/// - Missing content is [`NodeError::ContentNotFound`] for downloads and
///   `Ok(false)` for [`has_content`](NodeApi::has_content).
#[async_trait]
pub trait NodeApi: Send + Sync {
    /// Workload name this client talks to.
    fn name(&self) -> &str;

    fn endpoint(&self) -> &Endpoint;

    async fn overlay(&self) -> Result<Overlay, NodeError>;

    /// Round-trip probe to a peer; returns the measured RTT.
    async fn ping(&self, peer: &Overlay) -> Result<Duration, NodeError>;

    async fn upload_content(&self, data: &[u8], pin: bool) -> Result<Address, NodeError>;

    async fn download_content(&self, address: &Address) -> Result<Vec<u8>, NodeError>;

    /// Raw chunk in wire form.
    async fn download_chunk(&self, address: &Address) -> Result<Vec<u8>, NodeError>;

    async fn pin_content(&self, address: &Address) -> Result<(), NodeError>;

    async fn unpin_content(&self, address: &Address) -> Result<(), NodeError>;

    /// Whether the node stores the chunk locally.
    async fn has_content(&self, address: &Address) -> Result<bool, NodeError>;

    /// Upload an owner-signed chunk; `owner`, `id` and `signature` are hex.
    async fn upload_signed_chunk(
        &self,
        owner: &str,
        id: &str,
        signature: &str,
        data: &[u8],
    ) -> Result<Address, NodeError>;
}

// ════════════════════════════════════════════════════════════════════════════
// MEMBER STATE
// ════════════════════════════════════════════════════════════════════════════

/// Lifecycle state of a group member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberState {
    /// Provisioned but never started.
    Added,
    Running,
    Stopped,
    /// Removed from its group; handles kept by callers stay inert.
    Deleted,
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberState::Added => write!(f, "added"),
            MemberState::Running => write!(f, "running"),
            MemberState::Stopped => write!(f, "stopped"),
            MemberState::Deleted => write!(f, "deleted"),
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// NODE HANDLE
// ════════════════════════════════════════════════════════════════════════════

/// Handle to one member of a node group.
///
/// Cloning is cheap; clones share the lifecycle state, so a handle taken
/// before a stop observes the stop.
#[derive(Clone)]
pub struct Node {
    name: String,
    group: String,
    api: Arc<dyn NodeApi>,
    state: Arc<RwLock<MemberState>>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("group", &self.group)
            .field("state", &self.state())
            .finish()
    }
}

impl Node {
    pub(crate) fn new(
        name: impl Into<String>,
        group: impl Into<String>,
        api: Arc<dyn NodeApi>,
        state: MemberState,
    ) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
            api,
            state: Arc::new(RwLock::new(state)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.api.endpoint()
    }

    pub fn state(&self) -> MemberState {
        *self.state.read()
    }

    pub fn is_running(&self) -> bool {
        self.state() == MemberState::Running
    }

    pub(crate) fn set_state(&self, state: MemberState) {
        *self.state.write() = state;
    }

    fn ensure_running(&self) -> Result<(), NodeError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(NodeError::NotRunning {
                node: self.name.clone(),
            })
        }
    }

    pub async fn overlay(&self) -> Result<Overlay, NodeError> {
        self.ensure_running()?;
        self.api.overlay().await
    }

    pub async fn ping(&self, peer: &Overlay) -> Result<Duration, NodeError> {
        self.ensure_running()?;
        self.api.ping(peer).await
    }

    pub async fn upload_content(&self, data: &[u8], pin: bool) -> Result<Address, NodeError> {
        self.ensure_running()?;
        self.api.upload_content(data, pin).await
    }

    pub async fn download_content(&self, address: &Address) -> Result<Vec<u8>, NodeError> {
        self.ensure_running()?;
        self.api.download_content(address).await
    }

    pub async fn download_chunk(&self, address: &Address) -> Result<Vec<u8>, NodeError> {
        self.ensure_running()?;
        self.api.download_chunk(address).await
    }

    pub async fn pin_content(&self, address: &Address) -> Result<(), NodeError> {
        self.ensure_running()?;
        self.api.pin_content(address).await
    }

    pub async fn unpin_content(&self, address: &Address) -> Result<(), NodeError> {
        self.ensure_running()?;
        self.api.unpin_content(address).await
    }

    pub async fn has_content(&self, address: &Address) -> Result<bool, NodeError> {
        self.ensure_running()?;
        self.api.has_content(address).await
    }

    /// [`has_content`](Self::has_content) under a bounded retry budget.
    ///
    /// Retries on transient errors and on a negative answer, since content
    /// may still be settling. Returns `Ok(false)` once the budget is spent
    /// without finding the chunk.
    pub async fn has_content_retry(
        &self,
        address: &Address,
        retry: &RetryConfig,
    ) -> Result<bool, NodeError> {
        let result = retry_with_backoff(
            retry,
            |e: &NodeError| e.is_retryable() || matches!(e, NodeError::ContentNotFound { .. }),
            || {
                let node = self;
                async move {
                    match node.has_content(address).await {
                        Ok(true) => Ok(()),
                        Ok(false) => Err(NodeError::ContentNotFound {
                            node: node.name.clone(),
                            address: *address,
                        }),
                        Err(e) => Err(e),
                    }
                }
            },
        )
        .await;

        match result {
            RetryResult::Success { .. } => Ok(true),
            RetryResult::Exhausted {
                last_error: NodeError::ContentNotFound { .. },
                ..
            } => Ok(false),
            RetryResult::Exhausted { last_error, .. } => Err(last_error),
        }
    }

    pub async fn upload_signed_chunk(
        &self,
        owner: &str,
        id: &str,
        signature: &str,
        data: &[u8],
    ) -> Result<Address, NodeError> {
        self.ensure_running()?;
        self.api.upload_signed_chunk(owner, id, signature, data).await
    }
}

/// Sort key that orders `bee-2` before `bee-10`.
pub fn node_order_key(name: &str) -> (&str, Option<u64>, &str) {
    match name.rsplit_once('-') {
        Some((prefix, idx)) => match idx.parse::<u64>() {
            Ok(n) => (prefix, Some(n), name),
            Err(_) => (name, None, name),
        },
        None => (name, None, name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockNode;

    fn handle(state: MemberState) -> (Node, Arc<MockNode>) {
        let mock = Arc::new(MockNode::new("bee-0", 1024));
        mock.set_running(true);
        let node = Node::new("bee-0", "bee", mock.clone(), state);
        (node, mock)
    }

    #[tokio::test]
    async fn stopped_member_rejects_io() {
        let (node, _) = handle(MemberState::Stopped);
        let err = node.upload_content(b"abc", false).await.unwrap_err();
        assert_eq!(err, NodeError::NotRunning { node: "bee-0".into() });

        node.set_state(MemberState::Running);
        assert!(node.upload_content(b"abc", false).await.is_ok());
    }

    #[tokio::test]
    async fn clones_share_state() {
        let (node, _) = handle(MemberState::Running);
        let other = node.clone();
        node.set_state(MemberState::Deleted);
        assert!(!other.is_running());
        assert!(other.overlay().await.is_err());
    }

    #[tokio::test]
    async fn has_content_retry_reports_missing() {
        let (node, _) = handle(MemberState::Running);
        let addr = Address::new([1u8; 32]);
        let found = node
            .has_content_retry(&addr, &RetryConfig::fixed(3, Duration::ZERO))
            .await
            .expect("no transport error");
        assert!(!found);

        let stored = node.upload_content(b"payload", true).await.expect("upload");
        let found = node
            .has_content_retry(&stored, &RetryConfig::fixed(3, Duration::ZERO))
            .await
            .expect("no transport error");
        assert!(found);
    }

    #[tokio::test]
    async fn has_content_retry_surfaces_not_running() {
        let (node, _) = handle(MemberState::Stopped);
        let err = node
            .has_content_retry(&Address::new([0u8; 32]), &RetryConfig::fixed(3, Duration::ZERO))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::NotRunning { .. }));
    }

    #[test]
    fn order_key_is_numeric() {
        let mut names = vec!["bee-10", "bee-2", "bee-1", "bootnode-0"];
        names.sort_by(|a, b| node_order_key(a).cmp(&node_order_key(b)));
        assert_eq!(names, vec!["bee-1", "bee-2", "bee-10", "bootnode-0"]);
    }
}
