//! In-memory platform and nodes.
//!
//! [`MockPlatform`] provisions [`MockNode`]s that share one [`MockNetwork`]
//! so that peers can ping each other by overlay. Every node keeps a
//! capacity-bounded chunk store: once full, the oldest unpinned chunks are
//! garbage collected first and pinned chunks are never evicted.
//!
//! Both types carry fault hooks for tests (failing or hanging platform
//! calls, lost or corrupted content) and a call log.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use hive_common::chunk::{keccak256, split_chunks, SPAN_SIZE};
use hive_common::soc::{signed_chunk_address, ID_SIZE, OWNER_SIZE, SIGNATURE_SIZE};
use hive_common::{Address, CHUNK_SIZE};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::error::{NodeError, PlatformError};
use crate::node::{Endpoint, NodeApi, Overlay};
use crate::platform::{Platform, WorkloadSpec};

/// Default chunk capacity of a mock node store.
pub const DEFAULT_STORE_CAPACITY: usize = 100_000;

// ════════════════════════════════════════════════════════════════════════════
// MOCK NETWORK
// ════════════════════════════════════════════════════════════════════════════

/// Overlay registry used to route pings between mock nodes.
#[derive(Default)]
pub struct MockNetwork {
    peers: RwLock<HashMap<Overlay, Weak<MockNode>>>,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn register(&self, node: &Arc<MockNode>) {
        self.peers.write().insert(node.overlay, Arc::downgrade(node));
    }

    fn unregister(&self, overlay: &Overlay) {
        self.peers.write().remove(overlay);
    }

    fn lookup(&self, overlay: &Overlay) -> Option<Arc<MockNode>> {
        self.peers.read().get(overlay).and_then(Weak::upgrade)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// MOCK NODE
// ════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct Store {
    chunks: HashMap<Address, Vec<u8>>,
    pinned: HashMap<Address, u32>,
    /// Unpinned chunks in insertion order; eviction candidates.
    fifo: VecDeque<Address>,
}

impl Store {
    fn insert(&mut self, address: Address, data: Vec<u8>, capacity: usize) {
        if self.chunks.insert(address, data).is_none() {
            self.fifo.push_back(address);
        }
        self.collect_garbage(capacity);
    }

    fn pin(&mut self, address: &Address) -> bool {
        if !self.chunks.contains_key(address) {
            return false;
        }
        *self.pinned.entry(*address).or_insert(0) += 1;
        true
    }

    fn unpin(&mut self, address: &Address) -> bool {
        match self.pinned.get_mut(address) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => {
                self.pinned.remove(address);
                self.fifo.push_back(*address);
                true
            }
            None => false,
        }
    }

    fn collect_garbage(&mut self, capacity: usize) {
        while self.chunks.len() > capacity {
            let Some(victim) = self.fifo.pop_front() else {
                break;
            };
            // fifo may hold addresses pinned after insertion or already gone
            if self.pinned.contains_key(&victim) {
                continue;
            }
            self.chunks.remove(&victim);
        }
    }
}

/// In-memory node.
pub struct MockNode {
    name: String,
    endpoint: Endpoint,
    overlay: Overlay,
    capacity: usize,
    running: AtomicBool,
    corrupt_downloads: AtomicBool,
    store: Mutex<Store>,
    network: Mutex<Option<Arc<MockNetwork>>>,
}

impl MockNode {
    /// Standalone node with a store of `capacity` chunks, initially stopped.
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let name = name.into();
        let overlay = Address::new(keccak256(&[name.as_bytes()]));
        Self {
            endpoint: Endpoint {
                api_url: format!("http://{}:1633", name),
                debug_api_url: format!("http://{}:1635", name),
            },
            name,
            overlay,
            capacity,
            running: AtomicBool::new(false),
            corrupt_downloads: AtomicBool::new(false),
            store: Mutex::new(Store::default()),
            network: Mutex::new(None),
        }
    }

    /// Node registered in `network` so peers can reach it.
    pub fn in_network(name: impl Into<String>, capacity: usize, network: &Arc<MockNetwork>) -> Arc<Self> {
        let node = Arc::new(Self::new(name, capacity));
        *node.network.lock() = Some(Arc::clone(network));
        network.register(&node);
        node
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn overlay_address(&self) -> Overlay {
        self.overlay
    }

    /// Flip one byte of every chunk returned by `download_chunk`.
    pub fn set_corrupt_downloads(&self, corrupt: bool) {
        self.corrupt_downloads.store(corrupt, Ordering::SeqCst);
    }

    /// Drop a chunk regardless of its pin state.
    pub fn lose_chunk(&self, address: &Address) {
        let mut store = self.store.lock();
        store.chunks.remove(address);
        store.pinned.remove(address);
    }

    pub fn chunk_count(&self) -> usize {
        self.store.lock().chunks.len()
    }

    pub fn is_pinned(&self, address: &Address) -> bool {
        self.store.lock().pinned.contains_key(address)
    }

    fn detach(&self) {
        if let Some(network) = self.network.lock().take() {
            network.unregister(&self.overlay);
        }
    }

    fn reachable(&self) -> Result<(), NodeError> {
        if self.running() {
            Ok(())
        } else {
            Err(NodeError::Network {
                node: self.name.clone(),
                message: "connection refused".to_string(),
            })
        }
    }

    fn not_found(&self, address: &Address) -> NodeError {
        NodeError::ContentNotFound {
            node: self.name.clone(),
            address: *address,
        }
    }

    /// Rebuild content from its root by walking intermediate chunks.
    fn join(&self, store: &Store, address: &Address, out: &mut Vec<u8>) -> Result<(), NodeError> {
        let data = store.chunks.get(address).ok_or_else(|| self.not_found(address))?;
        if data.len() < SPAN_SIZE {
            return Err(NodeError::InvalidResponse {
                node: self.name.clone(),
                message: format!("chunk {} is shorter than its span", address),
            });
        }
        let mut span = [0u8; SPAN_SIZE];
        span.copy_from_slice(&data[..SPAN_SIZE]);
        let payload = &data[SPAN_SIZE..];
        if u64::from_le_bytes(span) <= CHUNK_SIZE as u64 {
            out.extend_from_slice(payload);
            return Ok(());
        }
        for reference in payload.chunks(32) {
            let mut child = [0u8; 32];
            child.copy_from_slice(reference);
            self.join(store, &Address::new(child), out)?;
        }
        Ok(())
    }
}

fn decode_hex<const N: usize>(node: &str, field: &str, s: &str) -> Result<[u8; N], NodeError> {
    let bytes = hex::decode(s).map_err(|e| NodeError::Api {
        node: node.to_string(),
        status: 400,
        body: format!("invalid {}: {}", field, e),
    })?;
    bytes.try_into().map_err(|_| NodeError::Api {
        node: node.to_string(),
        status: 400,
        body: format!("invalid {} length", field),
    })
}

#[async_trait]
impl NodeApi for MockNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn overlay(&self) -> Result<Overlay, NodeError> {
        self.reachable()?;
        Ok(self.overlay)
    }

    async fn ping(&self, peer: &Overlay) -> Result<Duration, NodeError> {
        self.reachable()?;
        let network = self.network.lock().clone();
        let target = network.and_then(|n| n.lookup(peer));
        match target {
            Some(p) if p.running() => {
                let a = self.overlay.as_bytes();
                let b = peer.as_bytes();
                Ok(Duration::from_micros(200 + u64::from(a[0] ^ b[0])))
            }
            _ => Err(NodeError::Network {
                node: self.name.clone(),
                message: format!("peer {} unreachable", peer.short()),
            }),
        }
    }

    async fn upload_content(&self, data: &[u8], pin: bool) -> Result<Address, NodeError> {
        self.reachable()?;
        let chunks = split_chunks(data);
        let mut root = None;
        let mut store = self.store.lock();
        for (address, wire) in chunks {
            if pin {
                // pin before insert so a full store cannot evict the new chunk
                store.chunks.entry(address).or_insert_with(|| wire.clone());
                store.pin(&address);
            } else {
                store.insert(address, wire, self.capacity);
            }
            root = Some(address);
        }
        store.collect_garbage(self.capacity);
        root.ok_or_else(|| NodeError::InvalidResponse {
            node: self.name.clone(),
            message: "splitter produced no chunks".to_string(),
        })
    }

    async fn download_content(&self, address: &Address) -> Result<Vec<u8>, NodeError> {
        self.reachable()?;
        let store = self.store.lock();
        let mut out = Vec::new();
        self.join(&store, address, &mut out)?;
        Ok(out)
    }

    async fn download_chunk(&self, address: &Address) -> Result<Vec<u8>, NodeError> {
        self.reachable()?;
        let mut data = self
            .store
            .lock()
            .chunks
            .get(address)
            .cloned()
            .ok_or_else(|| self.not_found(address))?;
        if self.corrupt_downloads.load(Ordering::SeqCst) {
            if let Some(last) = data.last_mut() {
                *last ^= 0xff;
            }
        }
        Ok(data)
    }

    async fn pin_content(&self, address: &Address) -> Result<(), NodeError> {
        self.reachable()?;
        if self.store.lock().pin(address) {
            Ok(())
        } else {
            Err(self.not_found(address))
        }
    }

    async fn unpin_content(&self, address: &Address) -> Result<(), NodeError> {
        self.reachable()?;
        let mut store = self.store.lock();
        if store.unpin(address) {
            store.collect_garbage(self.capacity);
            Ok(())
        } else {
            Err(self.not_found(address))
        }
    }

    async fn has_content(&self, address: &Address) -> Result<bool, NodeError> {
        self.reachable()?;
        Ok(self.store.lock().chunks.contains_key(address))
    }

    async fn upload_signed_chunk(
        &self,
        owner: &str,
        id: &str,
        signature: &str,
        data: &[u8],
    ) -> Result<Address, NodeError> {
        self.reachable()?;
        let owner: [u8; OWNER_SIZE] = decode_hex(&self.name, "owner", owner)?;
        let id: [u8; ID_SIZE] = decode_hex(&self.name, "id", id)?;
        let signature: [u8; SIGNATURE_SIZE] = decode_hex(&self.name, "signature", signature)?;

        let address = signed_chunk_address(&id, &owner);
        let mut wire = Vec::with_capacity(ID_SIZE + SIGNATURE_SIZE + data.len());
        wire.extend_from_slice(&id);
        wire.extend_from_slice(&signature);
        wire.extend_from_slice(data);
        self.store.lock().insert(address, wire, self.capacity);
        Ok(address)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// MOCK PLATFORM
// ════════════════════════════════════════════════════════════════════════════

/// Platform call kinds, for fault injection and the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformAction {
    Create,
    Start,
    Stop,
    Delete,
}

struct Workload {
    group: String,
    node: Arc<MockNode>,
}

#[derive(Default)]
struct Faults {
    fail: HashMap<(PlatformAction, String), PlatformError>,
    hang: HashSet<(PlatformAction, String)>,
    start_delay: Duration,
}

/// In-memory provisioning platform.
pub struct MockPlatform {
    workloads: RwLock<BTreeMap<String, Workload>>,
    network: Arc<MockNetwork>,
    store_capacity: usize,
    faults: Mutex<Faults>,
    calls: Mutex<Vec<(PlatformAction, String)>>,
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::with_store_capacity(DEFAULT_STORE_CAPACITY)
    }

    /// Platform whose nodes hold at most `capacity` chunks each.
    pub fn with_store_capacity(capacity: usize) -> Self {
        Self {
            workloads: RwLock::new(BTreeMap::new()),
            network: MockNetwork::new(),
            store_capacity: capacity,
            faults: Mutex::new(Faults::default()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Pre-existing workload, as found when attaching to a live cluster.
    pub fn seed_workload(&self, group: &str, name: &str, running: bool) -> Arc<MockNode> {
        let node = MockNode::in_network(name, self.store_capacity, &self.network);
        node.set_running(running);
        self.workloads.write().insert(
            name.to_string(),
            Workload {
                group: group.to_string(),
                node: Arc::clone(&node),
            },
        );
        node
    }

    /// Make `action` on `name` fail with `err`.
    pub fn fail_on(&self, action: PlatformAction, name: &str, err: PlatformError) {
        self.faults.lock().fail.insert((action, name.to_string()), err);
    }

    /// Make `action` on `name` never complete.
    pub fn hang_on(&self, action: PlatformAction, name: &str) {
        self.faults.lock().hang.insert((action, name.to_string()));
    }

    /// Delay before a started workload reports running.
    pub fn set_start_delay(&self, delay: Duration) {
        self.faults.lock().start_delay = delay;
    }

    pub fn calls(&self) -> Vec<(PlatformAction, String)> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, action: PlatformAction) -> usize {
        self.calls.lock().iter().filter(|(a, _)| *a == action).count()
    }

    pub fn node(&self, name: &str) -> Option<Arc<MockNode>> {
        self.workloads.read().get(name).map(|w| Arc::clone(&w.node))
    }

    pub fn workload_names(&self) -> Vec<String> {
        self.workloads.read().keys().cloned().collect()
    }

    pub fn group_of(&self, name: &str) -> Option<String> {
        self.workloads.read().get(name).map(|w| w.group.clone())
    }

    async fn enter(&self, action: PlatformAction, name: &str) -> Result<(), PlatformError> {
        self.calls.lock().push((action, name.to_string()));
        let (fail, hang) = {
            let faults = self.faults.lock();
            let key = (action, name.to_string());
            (faults.fail.get(&key).cloned(), faults.hang.contains(&key))
        };
        if hang {
            std::future::pending::<()>().await;
        }
        match fail {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn workload(&self, name: &str) -> Result<Arc<MockNode>, PlatformError> {
        self.node(name)
            .ok_or_else(|| PlatformError::NotFound(name.to_string()))
    }
}

#[async_trait]
impl Platform for MockPlatform {
    async fn create(&self, spec: &WorkloadSpec) -> Result<Arc<dyn NodeApi>, PlatformError> {
        self.enter(PlatformAction::Create, &spec.name).await?;
        let mut workloads = self.workloads.write();
        if workloads.contains_key(&spec.name) {
            return Err(PlatformError::AlreadyExists(spec.name.clone()));
        }
        let node = MockNode::in_network(spec.name.clone(), self.store_capacity, &self.network);
        workloads.insert(
            spec.name.clone(),
            Workload {
                group: spec.group.clone(),
                node: Arc::clone(&node),
            },
        );
        debug!(name = %spec.name, group = %spec.group, "mock workload created");
        Ok(node)
    }

    async fn connect(&self, group: &str, name: &str) -> Result<Arc<dyn NodeApi>, PlatformError> {
        let workloads = self.workloads.read();
        match workloads.get(name) {
            Some(w) if w.group == group => Ok(Arc::clone(&w.node) as Arc<dyn NodeApi>),
            _ => Err(PlatformError::NotFound(name.to_string())),
        }
    }

    async fn start(&self, name: &str) -> Result<(), PlatformError> {
        self.enter(PlatformAction::Start, name).await?;
        let node = self.workload(name)?;
        let delay = self.faults.lock().start_delay;
        if delay.is_zero() {
            node.set_running(true);
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                node.set_running(true);
            });
        }
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<(), PlatformError> {
        self.enter(PlatformAction::Stop, name).await?;
        self.workload(name)?.set_running(false);
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), PlatformError> {
        self.enter(PlatformAction::Delete, name).await?;
        let removed = self.workloads.write().remove(name);
        match removed {
            Some(w) => {
                w.node.set_running(false);
                w.node.detach();
                Ok(())
            }
            None => Err(PlatformError::NotFound(name.to_string())),
        }
    }

    async fn is_running(&self, name: &str) -> Result<bool, PlatformError> {
        Ok(self.workload(name)?.running())
    }
}
