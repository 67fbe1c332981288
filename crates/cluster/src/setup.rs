//! Building a [`Cluster`] either by starting fresh workloads or by attaching
//! to workloads that already run.
//!
//! Both modes register the same groups with the same options, so the stage
//! executor and the checks see one model regardless of how the cluster came
//! to be:
//!
//! - `bootnodes` (`bootnode-0..b`), each bootnode knowing the others
//! - one group per worker role (`bee`, `drone` by default) with
//!   `{group}-0..n`, all pointed at every bootnode

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use hive_common::config::{image_version, PersistenceConfig, RunConfig};
use hive_common::SeededRng;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::cluster::Cluster;
use crate::error::ClusterError;
use crate::node_group::NodeGroup;
use crate::platform::{NodeGroupOptions, NodeKeys, NodeOptions, Platform};

pub const BOOTNODE_GROUP: &str = "bootnodes";
pub const DEFAULT_GROUPS: [&str; 2] = ["bee", "drone"];

/// Port the node's peer-to-peer listener binds to.
const P2P_PORT: u16 = 1634;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupMode {
    /// Create and start every workload.
    Start,
    /// Register workloads that already exist.
    Attach,
}

#[derive(Debug, Clone)]
pub struct ClusterSetup {
    pub mode: SetupMode,
    pub cluster_name: String,
    pub namespace: String,
    pub image: String,
    pub persistence: Option<PersistenceConfig>,
    pub bootnode_count: usize,
    pub node_count: usize,
    pub groups: Vec<String>,
    /// Concurrent add/start bound.
    pub buffer: usize,
    /// Bound for bringing up one group.
    pub timeout: Duration,
    pub readiness_poll: Duration,
}

impl ClusterSetup {
    pub fn from_config(cfg: &RunConfig) -> Self {
        Self {
            mode: if cfg.start_cluster {
                SetupMode::Start
            } else {
                SetupMode::Attach
            },
            cluster_name: cfg.cluster_name.clone(),
            namespace: cfg.namespace.clone(),
            image: cfg.image.clone(),
            persistence: cfg
                .persistence
                .enabled
                .then(|| cfg.persistence.clone()),
            bootnode_count: cfg.bootnode_count,
            node_count: cfg.node_count,
            groups: DEFAULT_GROUPS.iter().map(|g| g.to_string()).collect(),
            buffer: cfg.buffer.max(1),
            timeout: Duration::from_secs(cfg.timeouts.setup_secs),
            readiness_poll: Duration::from_millis(500),
        }
    }

    /// DNS multiaddr of bootnode `i`.
    pub fn bootnode_address(&self, i: usize) -> String {
        format!(
            "/dns4/bootnode-{}-headless.{}.svc.cluster.local/tcp/{}",
            i, self.namespace, P2P_PORT
        )
    }

    fn group_options(&self, group: &str, component: &str) -> NodeGroupOptions {
        let mut labels = BTreeMap::new();
        labels.insert("app.kubernetes.io/component".to_string(), component.to_string());
        labels.insert("app.kubernetes.io/part-of".to_string(), group.to_string());
        labels.insert(
            "app.kubernetes.io/version".to_string(),
            image_version(&self.image).to_string(),
        );
        NodeGroupOptions {
            image: self.image.clone(),
            labels,
            persistence: self.persistence.clone(),
            bootnodes: (0..self.bootnode_count)
                .map(|i| self.bootnode_address(i))
                .collect(),
            readiness_poll: self.readiness_poll,
        }
    }

    /// Build the cluster. Bootnodes come up before any worker group.
    ///
    /// `rng` supplies the bootnode identity keys.
    pub async fn run(
        &self,
        platform: Arc<dyn Platform>,
        rng: &mut SeededRng,
    ) -> Result<Cluster, ClusterError> {
        let mut cluster = Cluster::new(self.cluster_name.clone(), platform);
        info!(
            cluster = %self.cluster_name,
            mode = ?self.mode,
            bootnodes = self.bootnode_count,
            nodes = self.node_count,
            "setting up cluster"
        );

        if self.mode == SetupMode::Start || self.bootnode_count > 0 {
            let bg = cluster.add_node_group(BOOTNODE_GROUP, self.group_options(BOOTNODE_GROUP, "bootnode"))?;
            let members = (0..self.bootnode_count)
                .map(|i| {
                    let name = format!("bootnode-{}", i);
                    let opts = NodeOptions {
                        keys: Some(NodeKeys {
                            swarm_key: hex::encode(rng.random_id()),
                            libp2p_key: hex::encode(rng.random_id()),
                        }),
                        bootnodes: Some(
                            (0..self.bootnode_count)
                                .filter(|j| *j != i)
                                .map(|j| self.bootnode_address(j))
                                .collect(),
                        ),
                    };
                    (name, opts)
                })
                .collect();
            self.populate(&bg, members).await?;
            info!(group = BOOTNODE_GROUP, count = self.bootnode_count, "bootnodes ready");
        }

        for group in &self.groups {
            let ng = cluster.add_node_group(group, self.group_options(group, "node"))?;
            let members = (0..self.node_count)
                .map(|i| (format!("{}-{}", group, i), NodeOptions::default()))
                .collect();
            self.populate(&ng, members).await?;
            info!(group = %group, count = self.node_count, "node group ready");
        }

        Ok(cluster)
    }

    /// Add-start or attach every member concurrently, bounded by `buffer`.
    async fn populate(
        &self,
        group: &Arc<NodeGroup>,
        members: Vec<(String, NodeOptions)>,
    ) -> Result<(), ClusterError> {
        let permits = Arc::new(Semaphore::new(self.buffer.max(1)));
        let mut set = JoinSet::new();

        for (name, opts) in members {
            let group = Arc::clone(group);
            let permits = Arc::clone(&permits);
            let mode = self.mode;
            let limit = self.timeout;
            set.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| ClusterError::Task(e.to_string()))?;
                match mode {
                    SetupMode::Start => group.add_start(&name, opts, limit).await.map(|_| ()),
                    SetupMode::Attach => group.attach(&name).await.map(|_| ()),
                }
            });
        }

        while let Some(joined) = set.join_next().await {
            let result = joined.map_err(|e| ClusterError::Task(e.to_string())).and_then(|r| r);
            if let Err(e) = result {
                warn!(group = %group.name(), error = %e, "setup failed, aborting siblings");
                set.abort_all();
                return Err(e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PlatformError;
    use crate::mock::{MockPlatform, PlatformAction};

    fn setup(mode: SetupMode) -> ClusterSetup {
        let mut cfg = RunConfig::default();
        cfg.bootnode_count = 2;
        cfg.node_count = 3;
        cfg.image = "ethersphere/bee:1.2.0".to_string();
        let mut s = ClusterSetup::from_config(&cfg);
        s.mode = mode;
        s.readiness_poll = Duration::from_millis(5);
        s
    }

    #[tokio::test]
    async fn start_mode_provisions_every_group() {
        let platform = Arc::new(MockPlatform::new());
        let s = setup(SetupMode::Start);
        let cluster = s
            .run(platform.clone(), &mut SeededRng::new(1))
            .await
            .expect("setup");

        let sizes = cluster.sizes();
        assert_eq!(sizes["bootnodes"], 2);
        assert_eq!(sizes["bee"], 3);
        assert_eq!(sizes["drone"], 3);
        assert_eq!(cluster.running_nodes().len(), 8);

        let bee = cluster.node_group("bee").expect("bee");
        assert_eq!(bee.options().labels["app.kubernetes.io/version"], "1.2.0");
        assert_eq!(bee.options().bootnodes.len(), 2);
        assert_eq!(platform.group_of("drone-2").as_deref(), Some("drone"));
    }

    #[tokio::test]
    async fn attach_mode_uses_existing_workloads() {
        let platform = Arc::new(MockPlatform::new());
        for i in 0..2 {
            platform.seed_workload("bootnodes", &format!("bootnode-{}", i), true);
        }
        for g in DEFAULT_GROUPS {
            for i in 0..3 {
                platform.seed_workload(g, &format!("{}-{}", g, i), i != 1);
            }
        }

        let cluster = setup(SetupMode::Attach)
            .run(platform.clone(), &mut SeededRng::new(1))
            .await
            .expect("attach");
        assert_eq!(cluster.size(), 8);
        assert_eq!(
            cluster.node_group("bee").expect("bee").stopped_names(),
            vec!["bee-1"]
        );
        assert_eq!(platform.call_count(PlatformAction::Create), 0);
    }

    #[tokio::test]
    async fn failure_in_one_member_fails_setup() {
        let platform = Arc::new(MockPlatform::new());
        platform.fail_on(
            PlatformAction::Create,
            "drone-1",
            PlatformError::Request("no capacity".into()),
        );
        let err = setup(SetupMode::Start)
            .run(platform, &mut SeededRng::new(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Provision { ref node, .. } if node == "drone-1"));
    }
}
