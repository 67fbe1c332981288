//! Content-addressed chunks.
//!
//! The storage network addresses a chunk by its Binary Merkle Tree hash:
//! the payload is zero-padded to [`CHUNK_SIZE`], hashed pairwise in 32-byte
//! segments with Keccak-256 up to a single root, and the root is hashed
//! together with the little-endian span of the data it covers.
//!
//! Payloads larger than one chunk are split into leaf chunks and
//! intermediate chunks that list up to [`BRANCHES`] child addresses.
//! [`split_addresses`] returns every chunk address of such a tree, which is
//! what the durability probe needs to check chunk by chunk.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use thiserror::Error;

/// Maximum payload size of a single chunk in bytes.
pub const CHUNK_SIZE: usize = 4096;

/// Size of the little-endian span prefix in bytes.
pub const SPAN_SIZE: usize = 8;

/// Size of a chunk address in bytes.
pub const HASH_SIZE: usize = 32;

/// Number of child references an intermediate chunk holds.
pub const BRANCHES: usize = CHUNK_SIZE / HASH_SIZE;

// ════════════════════════════════════════════════════════════════════════════
// ADDRESS
// ════════════════════════════════════════════════════════════════════════════

/// Errors produced when parsing or building chunks.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChunkError {
    /// Address string is not 64 hex characters.
    #[error("invalid address {0:?}: expected 64 hex characters")]
    InvalidAddress(String),

    /// Payload does not fit a single chunk.
    #[error("payload of {size} bytes exceeds chunk size {max}")]
    PayloadTooLarge { size: usize, max: usize },
}

/// 32-byte chunk address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Address([u8; HASH_SIZE]);

impl Address {
    pub const fn new(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    /// First 8 hex characters, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

impl FromStr for Address {
    type Err = ChunkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s.trim_start_matches("0x"))
            .map_err(|_| ChunkError::InvalidAddress(s.to_string()))?;
        let bytes: [u8; HASH_SIZE] = raw
            .try_into()
            .map_err(|_| ChunkError::InvalidAddress(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl From<Address> for String {
    fn from(a: Address) -> Self {
        a.to_string()
    }
}

impl TryFrom<String> for Address {
    type Error = ChunkError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

// ════════════════════════════════════════════════════════════════════════════
// HASHING
// ════════════════════════════════════════════════════════════════════════════

/// Keccak-256 over the concatenation of `parts`.
pub fn keccak256(parts: &[&[u8]]) -> [u8; HASH_SIZE] {
    let mut hasher = Keccak256::new();
    for p in parts {
        hasher.update(p);
    }
    hasher.finalize().into()
}

/// Root of the binary Merkle tree over `data` zero-padded to [`CHUNK_SIZE`].
///
/// `data` longer than a chunk is truncated; callers validate sizes first.
pub fn bmt_root(data: &[u8]) -> [u8; HASH_SIZE] {
    let mut padded = vec![0u8; CHUNK_SIZE];
    let n = data.len().min(CHUNK_SIZE);
    padded[..n].copy_from_slice(&data[..n]);

    let mut level: Vec<[u8; HASH_SIZE]> = padded
        .chunks(HASH_SIZE * 2)
        .map(|pair| keccak256(&[pair]))
        .collect();

    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| keccak256(&[&pair[0][..], &pair[1][..]]))
            .collect();
    }

    level[0]
}

/// BMT chunk hash: `keccak256(span_le || bmt_root(data))`.
pub fn bmt_hash(span: u64, data: &[u8]) -> Address {
    let root = bmt_root(data);
    Address(keccak256(&[&span.to_le_bytes()[..], &root[..]]))
}

// ════════════════════════════════════════════════════════════════════════════
// CONTENT CHUNK
// ════════════════════════════════════════════════════════════════════════════

/// A single content-addressed chunk: span followed by payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentChunk {
    span: u64,
    payload: Vec<u8>,
}

impl ContentChunk {
    /// Build a leaf chunk whose span is the payload length.
    pub fn new(payload: impl Into<Vec<u8>>) -> Result<Self, ChunkError> {
        let payload = payload.into();
        if payload.len() > CHUNK_SIZE {
            return Err(ChunkError::PayloadTooLarge {
                size: payload.len(),
                max: CHUNK_SIZE,
            });
        }
        Ok(Self {
            span: payload.len() as u64,
            payload,
        })
    }

    pub fn span(&self) -> u64 {
        self.span
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn address(&self) -> Address {
        bmt_hash(self.span, &self.payload)
    }

    /// Wire form: `span_le || payload`.
    pub fn data(&self) -> Vec<u8> {
        wire(self.span, &self.payload)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// SPLITTER
// ════════════════════════════════════════════════════════════════════════════

/// Every chunk (leaves first, root last) that `data` splits into, as
/// `(address, wire data)` pairs where wire data is `span_le || payload`.
///
/// A lone trailing reference at some level is carried up unchanged instead of
/// being wrapped in a one-child intermediate chunk.
pub fn split_chunks(data: &[u8]) -> Vec<(Address, Vec<u8>)> {
    let mut all = Vec::new();

    let leaves: Vec<&[u8]> = if data.is_empty() {
        vec![&[][..]]
    } else {
        data.chunks(CHUNK_SIZE).collect()
    };

    let mut level: Vec<(Address, u64)> = Vec::with_capacity(leaves.len());
    for leaf in leaves {
        let span = leaf.len() as u64;
        let addr = bmt_hash(span, leaf);
        all.push((addr, wire(span, leaf)));
        level.push((addr, span));
    }

    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len() / BRANCHES + 1);
        for group in level.chunks(BRANCHES) {
            if group.len() == 1 {
                next.push(group[0]);
                continue;
            }
            let span: u64 = group.iter().map(|(_, s)| *s).sum();
            let refs: Vec<u8> = group.iter().flat_map(|(a, _)| a.0).collect();
            let addr = bmt_hash(span, &refs);
            all.push((addr, wire(span, &refs)));
            next.push((addr, span));
        }
        level = next;
    }

    all
}

/// Addresses of every chunk that `data` splits into, root last.
pub fn split_addresses(data: &[u8]) -> Vec<Address> {
    split_chunks(data).into_iter().map(|(a, _)| a).collect()
}

fn wire(span: u64, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(SPAN_SIZE + payload.len());
    out.extend_from_slice(&span.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Root address of `data`, i.e. the last element of [`split_addresses`].
pub fn root_address(data: &[u8]) -> Address {
    // split_addresses always yields at least one address
    split_addresses(data)
        .pop()
        .unwrap_or_else(|| bmt_hash(0, &[]))
}
