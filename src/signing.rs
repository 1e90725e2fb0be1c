//! Vote signing
//!
//! Each node signs its votes with an Ed25519 key; peers verify them against
//! the verifying keys listed in configuration.

use std::collections::HashMap;
use std::path::Path;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use tracing::info;

use crate::error::ConfigError;
use crate::network::NodeId;

pub trait VoteSigner: Send + Sync + 'static {
    fn local_id(&self) -> NodeId;

    fn sign(&self, payload: &[u8]) -> Vec<u8>;

    /// Whether `signature` over `payload` was made by `voter`. Unknown voters
    /// never verify.
    fn verify(&self, voter: NodeId, payload: &[u8], signature: &[u8]) -> bool;
}

pub struct Ed25519Signer {
    local: NodeId,
    key: SigningKey,
    peers: HashMap<NodeId, VerifyingKey>,
}

impl Ed25519Signer {
    /// The local verifying key is always trusted for `local`.
    pub fn new(local: NodeId, key: SigningKey, peers: HashMap<NodeId, VerifyingKey>) -> Self {
        let mut peers = peers;
        peers.insert(local, key.verifying_key());
        Self { local, key, peers }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }
}

impl VoteSigner for Ed25519Signer {
    fn local_id(&self) -> NodeId {
        self.local
    }

    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        self.key.sign(payload).to_bytes().to_vec()
    }

    fn verify(&self, voter: NodeId, payload: &[u8], signature: &[u8]) -> bool {
        let Some(key) = self.peers.get(&voter) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        key.verify(payload, &signature).is_ok()
    }
}

pub fn generate_key() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

/// Load the node key from `data_dir/node_key`, generating and persisting one
/// if missing.
pub fn load_or_generate_key(data_dir: &Path) -> Result<SigningKey, ConfigError> {
    let key_path = data_dir.join("node_key");

    if key_path.exists() {
        let content = std::fs::read_to_string(&key_path)?;
        let key = parse_signing_key(content.trim())?;
        info!(path = %key_path.display(), "Loaded node key");
        return Ok(key);
    }

    std::fs::create_dir_all(data_dir)?;
    let key = generate_key();
    std::fs::write(&key_path, hex::encode(key.to_bytes()))?;
    info!(path = %key_path.display(), "Generated new node key");
    Ok(key)
}

pub fn parse_signing_key(hex_key: &str) -> Result<SigningKey, ConfigError> {
    let bytes = decode_key_bytes(hex_key)?;
    Ok(SigningKey::from_bytes(&bytes))
}

pub fn parse_verifying_key(hex_key: &str) -> Result<VerifyingKey, ConfigError> {
    let bytes = decode_key_bytes(hex_key)?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| ConfigError::InvalidKey(e.to_string()))
}

fn decode_key_bytes(hex_key: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = hex::decode(hex_key).map_err(|e| ConfigError::InvalidKey(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| ConfigError::InvalidKey(format!("expected 32 bytes, got {}", b.len())))
}
