//! Owner-signed chunks.
//!
//! A signed chunk wraps a content chunk with an identifier chosen by the
//! owner and the owner's signature. Its address is derived from the
//! identifier and the owner address, not from the content, so the owner can
//! publish under a predictable address.
//!
//! Wire form: `id (32) || signature (64) || span (8) || payload`.
//!
//! The signed digest is `keccak256(id || content_address)`. The owner address
//! is the last 20 bytes of `keccak256(verifying_key)`.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use thiserror::Error;

use crate::chunk::{keccak256, Address, ContentChunk, HASH_SIZE};

/// Identifier size in bytes.
pub const ID_SIZE: usize = 32;

/// Signature size in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// Owner address size in bytes.
pub const OWNER_SIZE: usize = 20;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SocError {
    #[error("signature verification failed")]
    VerifyFailed,
}

/// Owner address of a verifying key.
pub fn owner_address(key: &VerifyingKey) -> [u8; OWNER_SIZE] {
    let digest = keccak256(&[&key.as_bytes()[..]]);
    let mut owner = [0u8; OWNER_SIZE];
    owner.copy_from_slice(&digest[HASH_SIZE - OWNER_SIZE..]);
    owner
}

/// Address of a signed chunk with the given identifier and owner.
pub fn signed_chunk_address(id: &[u8; ID_SIZE], owner: &[u8; OWNER_SIZE]) -> Address {
    Address::new(keccak256(&[&id[..], &owner[..]]))
}

/// A content chunk signed by its owner.
#[derive(Debug, Clone)]
pub struct SignedChunk {
    id: [u8; ID_SIZE],
    owner: [u8; OWNER_SIZE],
    verifying_key: VerifyingKey,
    signature: Signature,
    content: ContentChunk,
}

impl SignedChunk {
    /// Sign `content` under `id` with `key`.
    pub fn new(id: [u8; ID_SIZE], content: ContentChunk, key: &SigningKey) -> Self {
        let digest = keccak256(&[&id[..], &content.address().as_bytes()[..]]);
        let signature = key.sign(&digest);
        let verifying_key = key.verifying_key();
        Self {
            id,
            owner: owner_address(&verifying_key),
            verifying_key,
            signature,
            content,
        }
    }

    pub fn id(&self) -> &[u8; ID_SIZE] {
        &self.id
    }

    pub fn owner(&self) -> &[u8; OWNER_SIZE] {
        &self.owner
    }

    pub fn signature_bytes(&self) -> [u8; SIGNATURE_SIZE] {
        self.signature.to_bytes()
    }

    pub fn content(&self) -> &ContentChunk {
        &self.content
    }

    pub fn address(&self) -> Address {
        signed_chunk_address(&self.id, &self.owner)
    }

    /// Check the signature against the embedded verifying key.
    pub fn verify(&self) -> Result<(), SocError> {
        let digest = keccak256(&[&self.id[..], &self.content.address().as_bytes()[..]]);
        self.verifying_key
            .verify(&digest, &self.signature)
            .map_err(|_| SocError::VerifyFailed)
    }

    /// Wire form: `id || signature || span || payload`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let content = self.content.data();
        let mut out = Vec::with_capacity(ID_SIZE + SIGNATURE_SIZE + content.len());
        out.extend_from_slice(&self.id);
        out.extend_from_slice(&self.signature.to_bytes());
        out.extend_from_slice(&content);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    #[test]
    fn test_sign_and_verify() {
        let content = ContentChunk::new(b"Hello Swarm :)".to_vec()).expect("chunk");
        let sch = SignedChunk::new([1u8; ID_SIZE], content, &key(3));
        assert!(sch.verify().is_ok());
    }

    #[test]
    fn test_address_depends_on_id_and_owner_only() {
        let k = key(3);
        let a = SignedChunk::new([1u8; ID_SIZE], ContentChunk::new(b"a".to_vec()).expect("chunk"), &k);
        let b = SignedChunk::new([1u8; ID_SIZE], ContentChunk::new(b"b".to_vec()).expect("chunk"), &k);
        let c = SignedChunk::new([2u8; ID_SIZE], ContentChunk::new(b"a".to_vec()).expect("chunk"), &k);
        let d = SignedChunk::new([1u8; ID_SIZE], ContentChunk::new(b"a".to_vec()).expect("chunk"), &key(4));
        assert_eq!(a.address(), b.address());
        assert_ne!(a.address(), c.address());
        assert_ne!(a.address(), d.address());
    }

    #[test]
    fn test_wire_layout() {
        let content = ContentChunk::new(b"xyz".to_vec()).expect("chunk");
        let sch = SignedChunk::new([5u8; ID_SIZE], content.clone(), &key(9));
        let bytes = sch.to_bytes();
        assert_eq!(&bytes[..ID_SIZE], &[5u8; ID_SIZE]);
        assert_eq!(&bytes[ID_SIZE..ID_SIZE + SIGNATURE_SIZE], &sch.signature_bytes());
        assert_eq!(&bytes[ID_SIZE + SIGNATURE_SIZE..], content.data().as_slice());
    }
}
