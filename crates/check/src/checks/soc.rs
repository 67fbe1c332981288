//! Signed-chunk integrity probe.
//!
//! Builds an owner-signed chunk from a generator-derived key and id,
//! uploads it through the first running node of a group, downloads it by
//! its derived address and compares the bytes with the expected wire form
//! `id || signature || span || payload`.

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use hive_cluster::Cluster;
use hive_common::{ContentChunk, SeededRng, SignedChunk};
use tracing::{debug, info};

use crate::check::{Check, CheckError, CheckReport, Options};
use crate::metrics::Observation;

pub const NAME: &str = "soc";

pub const DEFAULT_PAYLOAD: &[u8] = b"Hello Swarm :)";

#[derive(Debug, Clone)]
pub struct SocCheck {
    payload: Vec<u8>,
}

impl Default for SocCheck {
    fn default() -> Self {
        Self {
            payload: DEFAULT_PAYLOAD.to_vec(),
        }
    }
}

impl SocCheck {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_payload(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
        }
    }
}

#[async_trait]
impl Check for SocCheck {
    fn name(&self) -> &str {
        NAME
    }

    async fn run(
        &self,
        cluster: &Cluster,
        options: &Options,
        rng: &mut SeededRng,
    ) -> Result<CheckReport, CheckError> {
        let group = cluster.node_group(&options.node_group)?;
        let node = group
            .running_nodes()
            .into_iter()
            .next()
            .ok_or_else(|| CheckError::NoNodes(options.node_group.clone()))?;

        let key = SigningKey::from_bytes(&rng.random_id());
        let id = rng.random_id();
        let content = ContentChunk::new(self.payload.clone())
            .map_err(|e| CheckError::InvalidInput(e.to_string()))?;
        let chunk = SignedChunk::new(id, content, &key);
        let expected = chunk.to_bytes();

        let owner = hex::encode(chunk.owner());
        let id_hex = hex::encode(chunk.id());
        let signature = hex::encode(chunk.signature_bytes());
        debug!(node = %node.name(), address = %chunk.address(), owner = %owner, id = %id_hex, "submitting signed chunk");

        let reference = node
            .upload_signed_chunk(&owner, &id_hex, &signature, &chunk.content().data())
            .await?;
        if reference != chunk.address() {
            return Err(CheckError::IntegrityMismatch {
                node: node.name().to_string(),
                address: chunk.address(),
                reason: format!("node returned address {}", reference),
            });
        }

        let retrieved = node.download_chunk(&reference).await?;
        if retrieved != expected {
            return Err(CheckError::IntegrityMismatch {
                node: node.name().to_string(),
                address: reference,
                reason: format!(
                    "retrieved {} bytes do not match the {} uploaded",
                    retrieved.len(),
                    expected.len()
                ),
            });
        }

        let mut report = CheckReport::new(NAME);
        report.record(
            options,
            Observation::counter("hive_soc_chunks_verified_total", 1.0).with_label("node", node.name()),
        );
        info!(node = %node.name(), address = %reference, "signed chunk round trip ok");
        Ok(report)
    }
}
