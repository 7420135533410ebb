//! Signed key tombstones
//!
//! A key-block is an authority-signed statement that a key must no longer be
//! stored or served. Nodes holding a valid block answer STORE and
//! FIND_VALUE for that key with the block itself, so callers learn why the
//! key is unavailable and can stop retrying.

use crate::node_id::NodeId;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// How long a key-block stays in force after its creation
pub const KEY_BLOCK_LIFETIME: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const SIGNING_DOMAIN: &[u8] = b"kadmesh-key-block";

/// Key-block validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyBlockError {
    /// No authority key is configured, so no block can be trusted
    #[error("No key-block authority configured")]
    NoAuthority,

    /// Signature is not 64 bytes
    #[error("Malformed signature")]
    Malformed,

    /// Signature does not verify against the authority
    #[error("Invalid signature")]
    BadSignature,

    /// Block is older than its lifetime
    #[error("Key-block expired")]
    Expired,
}

/// An authority-signed block on one key
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBlock {
    /// Blocked key
    pub key: NodeId,
    /// Creation time, seconds since the Unix epoch
    pub created_secs: u64,
    /// ed25519 signature over the domain tag, key and creation time
    pub signature: Vec<u8>,
}

impl KeyBlock {
    /// Sign a new block with the authority's key
    #[must_use]
    pub fn sign(key: NodeId, created_secs: u64, authority: &SigningKey) -> Self {
        let signature = authority.sign(&signed_message(&key, created_secs));
        Self {
            key,
            created_secs,
            signature: signature.to_bytes().to_vec(),
        }
    }

    /// Check the signature against `authority`
    ///
    /// # Errors
    ///
    /// - `KeyBlockError::Malformed` if the signature is not 64 bytes
    /// - `KeyBlockError::BadSignature` if it does not verify
    pub fn verify(&self, authority: &VerifyingKey) -> Result<(), KeyBlockError> {
        let signature =
            Signature::from_slice(&self.signature).map_err(|_| KeyBlockError::Malformed)?;
        authority
            .verify(&signed_message(&self.key, self.created_secs), &signature)
            .map_err(|_| KeyBlockError::BadSignature)
    }

    /// Verify signature and age together
    ///
    /// # Errors
    ///
    /// As [`KeyBlock::verify`], plus `KeyBlockError::Expired`
    pub fn validate(&self, authority: &VerifyingKey, now_secs: u64) -> Result<(), KeyBlockError> {
        self.verify(authority)?;
        if self.is_expired(now_secs) {
            return Err(KeyBlockError::Expired);
        }
        Ok(())
    }

    /// Whether the block has outlived [`KEY_BLOCK_LIFETIME`]
    #[must_use]
    pub fn is_expired(&self, now_secs: u64) -> bool {
        now_secs.saturating_sub(self.created_secs) > KEY_BLOCK_LIFETIME.as_secs()
    }
}

impl fmt::Debug for KeyBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyBlock")
            .field("key", &self.key)
            .field("created_secs", &self.created_secs)
            .finish_non_exhaustive()
    }
}

fn signed_message(key: &NodeId, created_secs: u64) -> Vec<u8> {
    let mut message = Vec::with_capacity(SIGNING_DOMAIN.len() + 32 + 8);
    message.extend_from_slice(SIGNING_DOMAIN);
    message.extend_from_slice(key.as_bytes());
    message.extend_from_slice(&created_secs.to_be_bytes());
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authority() -> SigningKey {
        SigningKey::from_bytes(&[42u8; 32])
    }

    #[test]
    fn test_sign_and_verify() {
        let key = NodeId::hash(b"blocked");
        let block = KeyBlock::sign(key, 1_000, &authority());
        assert!(block.verify(&authority().verifying_key()).is_ok());
    }

    #[test]
    fn test_wrong_authority_rejected() {
        let block = KeyBlock::sign(NodeId::hash(b"k"), 1_000, &authority());
        let other = SigningKey::from_bytes(&[1u8; 32]).verifying_key();
        assert_eq!(block.verify(&other), Err(KeyBlockError::BadSignature));
    }

    #[test]
    fn test_tampered_block_rejected() {
        let mut block = KeyBlock::sign(NodeId::hash(b"k"), 1_000, &authority());
        block.key = NodeId::hash(b"other");
        assert_eq!(
            block.verify(&authority().verifying_key()),
            Err(KeyBlockError::BadSignature)
        );

        block.signature.truncate(10);
        assert_eq!(
            block.verify(&authority().verifying_key()),
            Err(KeyBlockError::Malformed)
        );
    }

    #[test]
    fn test_expiry() {
        let block = KeyBlock::sign(NodeId::hash(b"k"), 1_000, &authority());
        let lifetime = KEY_BLOCK_LIFETIME.as_secs();
        assert!(!block.is_expired(1_000 + lifetime));
        assert!(block.is_expired(1_001 + lifetime));
        assert_eq!(
            block.validate(&authority().verifying_key(), 2_000 + lifetime),
            Err(KeyBlockError::Expired)
        );
    }
}
