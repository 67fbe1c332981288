//! # Hive Cluster Crate
//!
//! The cluster model the stage executor mutates and the checks read.
//!
//! ## Modules
//! - `node`: data-plane trait and the member handle
//! - `node_group`: member table and add/start/stop/delete lifecycle
//! - `cluster`: named groups, flat lookups, overlays
//! - `platform`: provisioning trait and its HTTP client
//! - `bee_client`: HTTP client for the node API
//! - `mock`: in-memory platform and nodes
//! - `setup`: start or attach a cluster from run configuration
//! - `error`: error types

pub mod bee_client;
pub mod cluster;
pub mod error;
pub mod mock;
pub mod node;
pub mod node_group;
pub mod platform;
pub mod setup;

pub use bee_client::BeeClient;
pub use cluster::Cluster;
pub use error::{ClusterError, NodeError, PlatformError};
pub use mock::{MockNode, MockPlatform};
pub use node::{Endpoint, MemberState, Node, NodeApi, Overlay};
pub use node_group::NodeGroup;
pub use platform::{HttpPlatform, NodeGroupOptions, NodeOptions, Platform, WorkloadSpec};
pub use setup::{ClusterSetup, SetupMode};
