//! Error types for node, platform and cluster operations.
//!
//! | Layer | Type | Raised by |
//! |-------|------|-----------|
//! | Data plane | [`NodeError`] | [`NodeApi`](crate::node::NodeApi) calls and [`Node`](crate::node::Node) handles |
//! | Provisioning | [`PlatformError`] | [`Platform`](crate::platform::Platform) calls |
//! | Membership | [`ClusterError`] | [`NodeGroup`](crate::node_group::NodeGroup) and [`Cluster`](crate::cluster::Cluster) |
//!
//! Every variant names the node and group it concerns so a failure can be
//! traced back to one member of one group.

use std::time::Duration;

use hive_common::Address;
use thiserror::Error;

// ════════════════════════════════════════════════════════════════════════════
// NODE ERROR
// ════════════════════════════════════════════════════════════════════════════

/// Failure of a data-plane call against one node.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NodeError {
    /// Transient I/O failure. Retryable.
    #[error("network error talking to {node}: {message}")]
    Network { node: String, message: String },

    /// The call did not complete before its deadline. Retryable.
    #[error("request to {node} timed out")]
    Timeout { node: String },

    /// The member is stopped or deleted and rejects I/O.
    #[error("node {node} is not running")]
    NotRunning { node: String },

    /// The node does not hold the requested content.
    #[error("node {node} does not have {address}")]
    ContentNotFound { node: String, address: Address },

    /// The node answered with an unexpected status.
    #[error("node {node} answered {status}: {body}")]
    Api {
        node: String,
        status: u16,
        body: String,
    },

    /// The node answered with a body that could not be understood.
    #[error("invalid response from {node}: {message}")]
    InvalidResponse { node: String, message: String },
}

impl NodeError {
    /// Whether a bounded retry may help.
    pub fn is_retryable(&self) -> bool {
        matches!(self, NodeError::Network { .. } | NodeError::Timeout { .. })
    }
}

// ════════════════════════════════════════════════════════════════════════════
// PLATFORM ERROR
// ════════════════════════════════════════════════════════════════════════════

/// Failure reported by the provisioning platform.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlatformError {
    #[error("workload {0} already exists")]
    AlreadyExists(String),

    #[error("workload {0} not found")]
    NotFound(String),

    /// The platform could not be reached or the request failed in transit.
    #[error("platform request failed: {0}")]
    Request(String),

    /// The platform refused the request.
    #[error("platform rejected {name}: {status} {body}")]
    Rejected {
        name: String,
        status: u16,
        body: String,
    },
}

// ════════════════════════════════════════════════════════════════════════════
// CLUSTER ERROR
// ════════════════════════════════════════════════════════════════════════════

/// Membership and lookup failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    #[error("node group {0} not found")]
    GroupNotFound(String),

    #[error("node group {0} already registered")]
    DuplicateGroup(String),

    #[error("node {node} not found in group {group}")]
    NotFound { group: String, node: String },

    #[error("node {node} already exists in group {group}")]
    DuplicateName { group: String, node: String },

    #[error("provisioning {node} in group {group}: {source}")]
    Provision {
        group: String,
        node: String,
        #[source]
        source: PlatformError,
    },

    #[error("node {node} in group {group} did not start within {timeout:?}")]
    StartTimeout {
        group: String,
        node: String,
        timeout: Duration,
    },

    #[error("node {node} in group {group} did not stop within {timeout:?}")]
    StopTimeout {
        group: String,
        node: String,
        timeout: Duration,
    },

    #[error("node {node} in group {group} was not deleted within {timeout:?}")]
    DeleteTimeout {
        group: String,
        node: String,
        timeout: Duration,
    },

    /// Non-timeout platform failure during start, stop or delete.
    #[error("{action} {node} in group {group}: {source}")]
    Platform {
        group: String,
        node: String,
        action: &'static str,
        #[source]
        source: PlatformError,
    },

    /// Data-plane failure during a cluster lookup (e.g. resolving overlays).
    #[error(transparent)]
    Node(#[from] NodeError),

    /// A spawned setup task panicked or was cancelled.
    #[error("task failed: {0}")]
    Task(String),
}
