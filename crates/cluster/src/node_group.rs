//! Node groups: named, role-homogeneous sets of nodes and their lifecycle.
//!
//! ## Lifecycle
//!
//! ```text
//! add ──► Added ──start──► Running ◄──start── Stopped
//!                             │                  ▲
//!                             └───────stop───────┘
//! delete (any state) ──► removed, name free again
//! ```
//!
//! Operations on different names may run concurrently. The member table
//! lock is never held across an await; a name being added is reserved so a
//! concurrent `add` of the same name fails fast with `DuplicateName`.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::{timeout, Instant};
use tracing::{debug, info};

use crate::error::{ClusterError, NodeError, PlatformError};
use crate::node::{node_order_key, MemberState, Node, Overlay};
use crate::platform::{NodeGroupOptions, NodeOptions, Platform, WorkloadSpec};

#[derive(Default)]
struct Members {
    nodes: BTreeMap<String, Node>,
    /// Names reserved by an in-flight `add`.
    pending: HashSet<String>,
}

/// Releases an `add` reservation on every exit path.
struct Reservation<'a> {
    group: &'a NodeGroup,
    name: String,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.group.members.write().pending.remove(&self.name);
    }
}

/// Puts a member back in its prior state unless the delete went through,
/// including when the delete future is dropped mid-flight.
struct PendingDelete {
    node: Node,
    previous: MemberState,
    done: bool,
}

impl Drop for PendingDelete {
    fn drop(&mut self) {
        if !self.done {
            self.node.set_state(self.previous);
        }
    }
}

pub struct NodeGroup {
    name: String,
    options: NodeGroupOptions,
    platform: Arc<dyn Platform>,
    members: RwLock<Members>,
}

impl std::fmt::Debug for NodeGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeGroup")
            .field("name", &self.name)
            .field("size", &self.size())
            .finish()
    }
}

impl NodeGroup {
    pub fn new(name: impl Into<String>, options: NodeGroupOptions, platform: Arc<dyn Platform>) -> Self {
        Self {
            name: name.into(),
            options,
            platform,
            members: RwLock::new(Members::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &NodeGroupOptions {
        &self.options
    }

    // ────────────────────────────────────────────────────────────────────────
    // lifecycle
    // ────────────────────────────────────────────────────────────────────────

    /// Provision a new member under `name`.
    ///
    /// The member is registered as [`MemberState::Added`]; it is not
    /// reachable until started.
    pub async fn add(&self, name: &str, opts: NodeOptions) -> Result<Node, ClusterError> {
        let _reservation = self.reserve(name)?;

        let spec = WorkloadSpec::new(&self.name, name, &self.options, &opts);
        let api = self
            .platform
            .create(&spec)
            .await
            .map_err(|source| ClusterError::Provision {
                group: self.name.clone(),
                node: name.to_string(),
                source,
            })?;

        let node = Node::new(name, self.name.clone(), api, MemberState::Added);
        self.members.write().nodes.insert(name.to_string(), node.clone());
        debug!(group = %self.name, node = name, "node added");
        Ok(node)
    }

    /// [`add`](Self::add) followed by [`start`](Self::start), both within
    /// `limit`.
    pub async fn add_start(
        &self,
        name: &str,
        opts: NodeOptions,
        limit: Duration,
    ) -> Result<Node, ClusterError> {
        let deadline = Instant::now() + limit;
        let node = match tokio::time::timeout_at(deadline, self.add(name, opts)).await {
            Ok(result) => result?,
            Err(_) => return Err(self.start_timeout(name, limit)),
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        self.start(name, remaining).await.map_err(|e| match e {
            ClusterError::StartTimeout { .. } => self.start_timeout(name, limit),
            other => other,
        })?;
        Ok(node)
    }

    /// Bring a member to running. A running member is left alone.
    pub async fn start(&self, name: &str, limit: Duration) -> Result<(), ClusterError> {
        let node = self.node(name)?;
        if node.is_running() {
            debug!(group = %self.name, node = name, "already running");
            return Ok(());
        }

        let transition = self.transition(name, "start", true);
        match timeout(limit, transition).await {
            Ok(result) => result?,
            Err(_) => return Err(self.start_timeout(name, limit)),
        }

        node.set_state(MemberState::Running);
        info!(group = %self.name, node = name, "node started");
        Ok(())
    }

    /// Bring a member to stopped. A member that is not running is left alone.
    pub async fn stop(&self, name: &str, limit: Duration) -> Result<(), ClusterError> {
        let node = self.node(name)?;
        if !node.is_running() {
            debug!(group = %self.name, node = name, state = %node.state(), "already stopped");
            return Ok(());
        }

        // reject I/O from the moment the stop is issued
        node.set_state(MemberState::Stopped);
        let transition = self.transition(name, "stop", false);
        match timeout(limit, transition).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ClusterError::StopTimeout {
                    group: self.name.clone(),
                    node: name.to_string(),
                    timeout: limit,
                })
            }
        }

        info!(group = %self.name, node = name, "node stopped");
        Ok(())
    }

    /// Remove a member and release its workload.
    ///
    /// A failed, timed-out or cancelled delete leaves the member in the state
    /// it had.
    pub async fn delete(&self, name: &str, limit: Duration) -> Result<(), ClusterError> {
        let node = self.node(name)?;
        let mut pending = PendingDelete {
            previous: node.state(),
            node: node.clone(),
            done: false,
        };
        node.set_state(MemberState::Deleted);

        let outcome = match timeout(limit, self.platform.delete(name)).await {
            Ok(Ok(())) => Ok(()),
            // already gone on the platform side
            Ok(Err(PlatformError::NotFound(_))) => {
                debug!(group = %self.name, node = name, "workload already removed");
                Ok(())
            }
            Ok(Err(source)) => Err(ClusterError::Platform {
                group: self.name.clone(),
                node: name.to_string(),
                action: "delete",
                source,
            }),
            Err(_) => Err(ClusterError::DeleteTimeout {
                group: self.name.clone(),
                node: name.to_string(),
                timeout: limit,
            }),
        };
        outcome?;

        pending.done = true;
        self.members.write().nodes.remove(name);
        info!(group = %self.name, node = name, "node deleted");
        Ok(())
    }

    /// Register a workload that already exists on the platform.
    pub async fn attach(&self, name: &str) -> Result<Node, ClusterError> {
        let _reservation = self.reserve(name)?;
        let platform_err = |source| ClusterError::Platform {
            group: self.name.clone(),
            node: name.to_string(),
            action: "attach",
            source,
        };

        let api = self.platform.connect(&self.name, name).await.map_err(platform_err)?;
        let running = self.platform.is_running(name).await.map_err(platform_err)?;
        let state = if running {
            MemberState::Running
        } else {
            MemberState::Stopped
        };

        let node = Node::new(name, self.name.clone(), api, state);
        self.members.write().nodes.insert(name.to_string(), node.clone());
        debug!(group = %self.name, node = name, %state, "node attached");
        Ok(node)
    }

    fn reserve(&self, name: &str) -> Result<Reservation<'_>, ClusterError> {
        let mut members = self.members.write();
        if members.nodes.contains_key(name) || !members.pending.insert(name.to_string()) {
            return Err(ClusterError::DuplicateName {
                group: self.name.clone(),
                node: name.to_string(),
            });
        }
        Ok(Reservation {
            group: self,
            name: name.to_string(),
        })
    }

    /// Issue a start or stop and poll until the platform reports `want`.
    fn transition<'a>(
        &'a self,
        name: &'a str,
        action: &'static str,
        want: bool,
    ) -> impl Future<Output = Result<(), ClusterError>> + Send + 'a {
        async move {
            let platform_err = |source| ClusterError::Platform {
                group: self.name.clone(),
                node: name.to_string(),
                action,
                source,
            };

            if want {
                self.platform.start(name).await.map_err(platform_err)?;
            } else {
                self.platform.stop(name).await.map_err(platform_err)?;
            }

            loop {
                if self.platform.is_running(name).await.map_err(platform_err)? == want {
                    return Ok(());
                }
                tokio::time::sleep(self.options.readiness_poll).await;
            }
        }
    }

    fn start_timeout(&self, name: &str, limit: Duration) -> ClusterError {
        ClusterError::StartTimeout {
            group: self.name.clone(),
            node: name.to_string(),
            timeout: limit,
        }
    }

    // ────────────────────────────────────────────────────────────────────────
    // lookups
    // ────────────────────────────────────────────────────────────────────────

    pub fn node(&self, name: &str) -> Result<Node, ClusterError> {
        self.members
            .read()
            .nodes
            .get(name)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound {
                group: self.name.clone(),
                node: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.members.read().nodes.contains_key(name)
    }

    pub fn size(&self) -> usize {
        self.members.read().nodes.len()
    }

    /// Members ordered by name index (`bee-2` before `bee-10`).
    pub fn nodes_sorted(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.members.read().nodes.values().cloned().collect();
        nodes.sort_by(|a, b| node_order_key(a.name()).cmp(&node_order_key(b.name())));
        nodes
    }

    pub fn node_names(&self) -> Vec<String> {
        self.names_where(|_| true)
    }

    pub fn running_names(&self) -> Vec<String> {
        self.names_where(Node::is_running)
    }

    /// Members that are not running (never started or stopped).
    pub fn stopped_names(&self) -> Vec<String> {
        self.names_where(|n| !n.is_running())
    }

    pub fn running_nodes(&self) -> Vec<Node> {
        self.nodes_sorted().into_iter().filter(Node::is_running).collect()
    }

    fn names_where(&self, keep: impl Fn(&Node) -> bool) -> Vec<String> {
        self.nodes_sorted()
            .into_iter()
            .filter(|n| keep(n))
            .map(|n| n.name().to_string())
            .collect()
    }

    /// Overlays of the running members, keyed by node name.
    pub async fn overlays(&self) -> Result<BTreeMap<String, Overlay>, NodeError> {
        let mut out = BTreeMap::new();
        for node in self.running_nodes() {
            let overlay = node.overlay().await?;
            out.insert(node.name().to_string(), overlay);
        }
        Ok(out)
    }
}
