//! Pinned-content durability probe.
//!
//! Uploads a pinned payload of `(store_size / store_size_divisor)` chunks to
//! one node, floods the same node with `store_size_divisor` unpinned
//! payloads of the same size, waits for garbage collection and then asserts
//! that every chunk of the pinned payload is still stored there.

use async_trait::async_trait;
use hive_cluster::{Cluster, Node, NodeError};
use hive_common::chunk::split_addresses;
use hive_common::retry::retry_with_backoff;
use hive_common::{Address, SeededRng, CHUNK_SIZE};
use tracing::{info, warn};

use crate::check::{Check, CheckError, CheckReport, Options};
use crate::metrics::Observation;

pub const NAME: &str = "pinning";

#[derive(Debug, Default, Clone, Copy)]
pub struct PinningCheck;

impl PinningCheck {
    pub fn new() -> Self {
        Self
    }
}

async fn upload(node: &Node, data: &[u8], pin: bool, options: &Options) -> Result<Address, NodeError> {
    retry_with_backoff(&options.retry, NodeError::is_retryable, || {
        node.upload_content(data, pin)
    })
    .await
    .into_result()
}

async fn flood_and_verify(
    node: &Node,
    addresses: &[Address],
    options: &Options,
    rng: &mut SeededRng,
) -> Result<(), CheckError> {
    for _ in 0..options.store_size_divisor {
        let filler = rng.bytes(payload_len(options));
        upload(node, &filler, false, options).await?;
    }
    info!(node = %node.name(), uploads = options.store_size_divisor, "unpinned payloads uploaded");

    if !options.gc_wait.is_zero() {
        tokio::time::sleep(options.gc_wait).await;
    }

    for address in addresses {
        if !node.has_content_retry(address, &options.retry).await? {
            return Err(CheckError::ContentLost {
                node: node.name().to_string(),
                address: *address,
            });
        }
    }
    Ok(())
}

fn payload_len(options: &Options) -> usize {
    (options.store_size / options.store_size_divisor) * CHUNK_SIZE
}

#[async_trait]
impl Check for PinningCheck {
    fn name(&self) -> &str {
        NAME
    }

    async fn run(
        &self,
        cluster: &Cluster,
        options: &Options,
        rng: &mut SeededRng,
    ) -> Result<CheckReport, CheckError> {
        if options.store_size_divisor == 0 || options.store_size < options.store_size_divisor {
            return Err(CheckError::InvalidInput(format!(
                "store_size {} / divisor {} leaves no payload",
                options.store_size, options.store_size_divisor
            )));
        }

        let nodes = cluster.running_nodes();
        let pivot = rng
            .pick_index(nodes.len())
            .map(|i| nodes[i].clone())
            .ok_or_else(|| CheckError::NoNodes(cluster.name().to_string()))?;

        let size = payload_len(options);
        let payload = rng.bytes(size);
        let addresses = split_addresses(&payload);

        let root = upload(&pivot, &payload, true, options).await?;
        info!(node = %pivot.name(), bytes = size, root = %root, chunks = addresses.len(), "uploaded pinned payload");

        let outcome = flood_and_verify(&pivot, &addresses, options, rng).await;

        // release the pins whatever the outcome
        let mut unpin_failures = 0usize;
        for address in &addresses {
            if let Err(e) = pivot.unpin_content(address).await {
                unpin_failures += 1;
                warn!(node = %pivot.name(), address = %address, error = %e, "unpin failed");
            }
        }

        outcome?;

        let mut report = CheckReport::new(NAME);
        report.record(
            options,
            Observation::gauge("hive_pinning_chunks_checked", addresses.len() as f64)
                .with_label("node", pivot.name()),
        );
        report.record(
            options,
            Observation::counter("hive_pinning_unpin_failures_total", unpin_failures as f64)
                .with_label("node", pivot.name()),
        );
        info!(node = %pivot.name(), chunks = addresses.len(), "pinned content survived");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_cluster::{MockPlatform, NodeGroupOptions, NodeOptions};
    use hive_common::RetryConfig;
    use std::sync::Arc;
    use std::time::Duration;

    async fn cluster(platform: Arc<MockPlatform>, nodes: usize) -> Cluster {
        let mut c = Cluster::new("pin", platform);
        let g = c.add_node_group("bee", NodeGroupOptions::default()).expect("group");
        for i in 0..nodes {
            g.add_start(&format!("bee-{}", i), NodeOptions::default(), Duration::from_secs(5))
                .await
                .expect("add_start");
        }
        c
    }

    fn options() -> Options {
        Options {
            store_size: 48,
            store_size_divisor: 12,
            gc_wait: Duration::ZERO,
            retry: RetryConfig::fixed(2, Duration::ZERO),
            ..Options::default()
        }
    }

    #[tokio::test]
    async fn pinned_chunks_survive_and_are_released() {
        let platform = Arc::new(MockPlatform::with_store_capacity(48));
        let c = cluster(platform.clone(), 3).await;
        let report = PinningCheck::new()
            .run(&c, &options(), &mut SeededRng::new(9))
            .await
            .expect("pinning");
        // 4 leaves + 1 intermediate
        assert_eq!(report.observations[0].value, 5.0);

        for name in ["bee-0", "bee-1", "bee-2"] {
            let node = platform.node(name).expect("node");
            assert!(node.chunk_count() <= 48);
        }
    }

    #[tokio::test]
    async fn lost_chunk_fails_the_check() {
        let platform = Arc::new(MockPlatform::with_store_capacity(48));
        let c = cluster(platform.clone(), 1).await;
        let opts = options();

        // replay the draws the check will make to find the pinned root
        let mut probe = SeededRng::new(9);
        probe.pick_index(1);
        let payload = probe.bytes(payload_len(&opts));
        let root = hive_common::chunk::root_address(&payload);

        // the node loses the root right after the pinned upload
        let node = platform.node("bee-0").expect("node");
        let watcher = tokio::spawn(async move {
            loop {
                if node.is_pinned(&root) {
                    node.lose_chunk(&root);
                    return;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        });

        let opts = Options {
            gc_wait: Duration::from_millis(50),
            ..opts
        };
        let err = PinningCheck::new()
            .run(&c, &opts, &mut SeededRng::new(9))
            .await
            .unwrap_err();
        watcher.await.expect("watcher");
        assert!(matches!(err, CheckError::ContentLost { address, .. } if address == root));
    }

    #[tokio::test]
    async fn no_running_nodes() {
        let c = cluster(Arc::new(MockPlatform::new()), 0).await;
        let err = PinningCheck::new()
            .run(&c, &options(), &mut SeededRng::new(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CheckError::NoNodes(_)));
    }

    #[tokio::test]
    async fn rejects_degenerate_sizes() {
        let c = cluster(Arc::new(MockPlatform::new()), 1).await;
        let opts = Options {
            store_size: 3,
            store_size_divisor: 4,
            ..options()
        };
        assert!(matches!(
            PinningCheck::new().run(&c, &opts, &mut SeededRng::new(1)).await,
            Err(CheckError::InvalidInput(_))
        ));
    }
}
