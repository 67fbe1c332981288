//! # Hive Common Crate
//!
//! Building blocks shared by the cluster model, the checks and the agent.
//!
//! ## Modules
//! - `random`: the per-run seeded generator
//! - `chunk`: content addressing (Keccak-256 BMT) and payload splitting
//! - `soc`: owner-signed chunks
//! - `retry`: bounded retry with backoff for data-plane calls
//! - `config`: TOML run configuration

pub mod chunk;
pub mod config;
pub mod random;
pub mod retry;
pub mod soc;

pub use chunk::{Address, ContentChunk, CHUNK_SIZE};
pub use config::{ConfigError, RunConfig};
pub use random::SeededRng;
pub use retry::{RetryConfig, RetryResult};
pub use soc::SignedChunk;
