//! The cluster: named node groups over one provisioning platform.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::task::JoinSet;

use crate::error::{ClusterError, NodeError};
use crate::node::{Node, Overlay};
use crate::node_group::NodeGroup;
use crate::platform::{NodeGroupOptions, Platform};

/// Named collection of node groups.
///
/// Groups are registered through `&mut self` while the cluster is being
/// built; once the cluster is shared the set of group names is fixed, while
/// each group's members keep changing.
pub struct Cluster {
    name: String,
    platform: Arc<dyn Platform>,
    groups: BTreeMap<String, Arc<NodeGroup>>,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("name", &self.name)
            .field("sizes", &self.sizes())
            .finish()
    }
}

impl Cluster {
    pub fn new(name: impl Into<String>, platform: Arc<dyn Platform>) -> Self {
        Self {
            name: name.into(),
            platform,
            groups: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_node_group(
        &mut self,
        name: &str,
        options: NodeGroupOptions,
    ) -> Result<Arc<NodeGroup>, ClusterError> {
        if self.groups.contains_key(name) {
            return Err(ClusterError::DuplicateGroup(name.to_string()));
        }
        let group = Arc::new(NodeGroup::new(name, options, Arc::clone(&self.platform)));
        self.groups.insert(name.to_string(), Arc::clone(&group));
        Ok(group)
    }

    pub fn node_group(&self, name: &str) -> Result<Arc<NodeGroup>, ClusterError> {
        self.groups
            .get(name)
            .cloned()
            .ok_or_else(|| ClusterError::GroupNotFound(name.to_string()))
    }

    pub fn node_groups(&self) -> impl Iterator<Item = &Arc<NodeGroup>> {
        self.groups.values()
    }

    pub fn group_names(&self) -> Vec<String> {
        self.groups.keys().cloned().collect()
    }

    /// Member count per group.
    pub fn sizes(&self) -> BTreeMap<String, usize> {
        self.groups
            .iter()
            .map(|(name, g)| (name.clone(), g.size()))
            .collect()
    }

    /// Total member count across groups.
    pub fn size(&self) -> usize {
        self.groups.values().map(|g| g.size()).sum()
    }

    /// Running nodes of every group, grouped by group name and ordered by
    /// index within each group.
    pub fn running_nodes(&self) -> Vec<Node> {
        self.groups.values().flat_map(|g| g.running_nodes()).collect()
    }

    /// Look a node up by name in whichever group holds it.
    pub fn node(&self, name: &str) -> Result<Node, ClusterError> {
        let mut found = self.groups.values().filter_map(|g| g.node(name).ok());
        match (found.next(), found.next()) {
            (Some(node), None) => Ok(node),
            (Some(node), Some(_)) => Err(ClusterError::DuplicateName {
                group: node.group().to_string(),
                node: name.to_string(),
            }),
            (None, _) => Err(ClusterError::NotFound {
                group: "*".to_string(),
                node: name.to_string(),
            }),
        }
    }

    /// Overlays of every running node, keyed by node name.
    ///
    /// Resolved concurrently; the first failure is returned.
    pub async fn overlays(&self) -> Result<BTreeMap<String, Overlay>, NodeError> {
        let mut set = JoinSet::new();
        for node in self.running_nodes() {
            set.spawn(async move {
                let overlay = node.overlay().await?;
                Ok::<_, NodeError>((node.name().to_string(), overlay))
            });
        }

        let mut out = BTreeMap::new();
        while let Some(joined) = set.join_next().await {
            let (name, overlay) = joined.map_err(|e| NodeError::Network {
                node: "*".to_string(),
                message: format!("overlay task failed: {}", e),
            })??;
            out.insert(name, overlay);
        }
        Ok(out)
    }

    /// The running node whose overlay is `overlay`.
    pub async fn node_by_overlay(&self, overlay: &Overlay) -> Result<Node, ClusterError> {
        for (name, o) in self.overlays().await? {
            if o == *overlay {
                return self.node(&name);
            }
        }
        Err(ClusterError::NotFound {
            group: "*".to_string(),
            node: overlay.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockPlatform;
    use crate::platform::NodeOptions;
    use std::time::Duration;

    const LIMIT: Duration = Duration::from_secs(5);

    async fn cluster_with(bee: usize, drone: usize) -> Cluster {
        let mut cluster = Cluster::new("test", Arc::new(MockPlatform::new()));
        for (group, count) in [("bee", bee), ("drone", drone)] {
            let ng = cluster
                .add_node_group(group, NodeGroupOptions::default())
                .expect("group");
            for i in 0..count {
                ng.add_start(&format!("{}-{}", group, i), NodeOptions::default(), LIMIT)
                    .await
                    .expect("add_start");
            }
        }
        cluster
    }

    #[tokio::test]
    async fn groups_are_unique() {
        let mut cluster = cluster_with(0, 0).await;
        assert_eq!(
            cluster
                .add_node_group("bee", NodeGroupOptions::default())
                .unwrap_err(),
            ClusterError::DuplicateGroup("bee".into())
        );
        assert!(matches!(
            cluster.node_group("light"),
            Err(ClusterError::GroupNotFound(_))
        ));
        assert_eq!(cluster.group_names(), vec!["bee", "drone"]);
    }

    #[tokio::test]
    async fn sizes_and_lookups() {
        let cluster = cluster_with(3, 2).await;
        assert_eq!(cluster.size(), 5);
        assert_eq!(cluster.sizes()["bee"], 3);
        assert_eq!(cluster.node("drone-1").expect("node").group(), "drone");
        assert!(cluster.node("drone-7").is_err());

        cluster
            .node_group("bee")
            .expect("group")
            .stop("bee-1", LIMIT)
            .await
            .expect("stop");
        let running: Vec<String> = cluster
            .running_nodes()
            .iter()
            .map(|n| n.name().to_string())
            .collect();
        assert_eq!(running, vec!["bee-0", "bee-2", "drone-0", "drone-1"]);
    }

    #[tokio::test]
    async fn overlays_resolve_back_to_nodes() {
        let cluster = cluster_with(2, 1).await;
        let overlays = cluster.overlays().await.expect("overlays");
        assert_eq!(overlays.len(), 3);
        let target = overlays["drone-0"];
        let node = cluster.node_by_overlay(&target).await.expect("lookup");
        assert_eq!(node.name(), "drone-0");
    }
}
