//! Transaction signing for the chain mirror.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH};
use matchproof_core::sha256_hex;
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::{ChainError, ChainOp};

/// Where the mirror's signing key comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    /// Deterministic key derived from an `ed25519://` seed string.
    Seed(String),
    /// Raw, hex or base64 secret bytes in a file.
    File(PathBuf),
    /// Fresh key per process; only useful against a simulated ledger.
    Random,
}

impl KeySource {
    pub fn from_spec(spec: Option<&str>) -> Self {
        match spec.map(str::trim) {
            Some(value) if value.starts_with("ed25519://") => {
                Self::Seed(value.trim_start_matches("ed25519://").to_string())
            }
            Some(value) if !value.is_empty() => Self::File(PathBuf::from(value)),
            _ => Self::Random,
        }
    }
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("key I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("key decode error: {0}")]
    Decode(String),
    #[error("unexpected key length: {0}")]
    InvalidLength(usize),
}

/// Signs chain operations on behalf of the mirror account.
#[derive(Clone)]
pub struct TxSigner {
    signing: SigningKey,
    verifying: VerifyingKey,
}

impl TxSigner {
    pub fn load(source: &KeySource) -> Result<Self, KeyError> {
        let secret = match source {
            KeySource::Seed(seed) => derive_from_seed(seed),
            KeySource::File(path) => load_from_file(path)?,
            KeySource::Random => SigningKey::generate(&mut OsRng).to_bytes(),
        };
        let signing = SigningKey::from_bytes(&secret);
        let verifying = signing.verifying_key();
        Ok(Self { signing, verifying })
    }

    /// Base64 public key; identifies the account for in-flight locking.
    pub fn address(&self) -> String {
        BASE64.encode(self.verifying.to_bytes())
    }

    pub fn sign(&self, op: &ChainOp, nonce: u64) -> Result<SignedTransaction, ChainError> {
        let payload = bincode::serialize(op)?;
        let signer = self.address();
        let message = signing_bytes(&signer, nonce, &payload)?;
        let signature: Signature = self.signing.sign(&message);
        Ok(SignedTransaction {
            signer,
            nonce,
            payload: BASE64.encode(&payload),
            signature: BASE64.encode(signature.to_bytes()),
        })
    }
}

/// Wire envelope for one signed chain operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    /// Base64 ed25519 public key of the signing account.
    pub signer: String,
    pub nonce: u64,
    /// Base64 bincode encoding of the `ChainOp`.
    pub payload: String,
    /// Base64 signature over (signer, nonce, payload).
    pub signature: String,
}

impl SignedTransaction {
    /// Hex SHA-256 over the signed message and signature.
    pub fn digest(&self) -> Result<String, ChainError> {
        let payload = decode(&self.payload)?;
        let mut bytes = signing_bytes(&self.signer, self.nonce, &payload)?;
        bytes.extend(decode(&self.signature)?);
        Ok(sha256_hex(&bytes))
    }

    pub fn operation(&self) -> Result<ChainOp, ChainError> {
        let payload = decode(&self.payload)?;
        Ok(bincode::deserialize(&payload)?)
    }

    pub fn verify(&self) -> Result<(), ChainError> {
        let key_bytes: [u8; 32] = decode(&self.signer)?
            .try_into()
            .map_err(|_| ChainError::Encoding("signer key length".into()))?;
        let verifying = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|err| ChainError::Encoding(err.to_string()))?;
        let signature = Signature::from_slice(&decode(&self.signature)?)
            .map_err(|err| ChainError::Encoding(err.to_string()))?;
        let message = signing_bytes(&self.signer, self.nonce, &decode(&self.payload)?)?;
        verifying
            .verify(&message, &signature)
            .map_err(|err| ChainError::Rejected(format!("bad signature: {err}")))
    }
}

fn signing_bytes(signer: &str, nonce: u64, payload: &[u8]) -> Result<Vec<u8>, ChainError> {
    Ok(bincode::serialize(&(signer, nonce, payload))?)
}

fn decode(input: &str) -> Result<Vec<u8>, ChainError> {
    BASE64
        .decode(input)
        .map_err(|err| ChainError::Encoding(err.to_string()))
}

fn derive_from_seed(seed: &str) -> [u8; SECRET_KEY_LENGTH] {
    let digest = Sha512::digest(seed.as_bytes());
    let mut secret = [0u8; SECRET_KEY_LENGTH];
    secret.copy_from_slice(&digest[..SECRET_KEY_LENGTH]);
    secret
}

fn load_from_file(path: &Path) -> Result<[u8; SECRET_KEY_LENGTH], KeyError> {
    let contents = std::fs::read(path)?;
    if contents.len() == SECRET_KEY_LENGTH {
        return to_secret(&contents);
    }
    let text = String::from_utf8_lossy(&contents);
    let trimmed = text.trim();
    if let Ok(bytes) = hex::decode(trimmed) {
        return to_secret(&bytes);
    }
    let bytes = BASE64
        .decode(trimmed)
        .map_err(|err| KeyError::Decode(err.to_string()))?;
    to_secret(&bytes)
}

fn to_secret(bytes: &[u8]) -> Result<[u8; SECRET_KEY_LENGTH], KeyError> {
    bytes
        .try_into()
        .map_err(|_| KeyError::InvalidLength(bytes.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op() -> ChainOp {
        ChainOp::UpdateReputation {
            identity: "alice".into(),
            delta: 5,
            reason: "verification accepted".into(),
        }
    }

    #[test]
    fn test_seed_keys_are_deterministic() {
        let a = TxSigner::load(&KeySource::from_spec(Some("ed25519://league"))).unwrap();
        let b = TxSigner::load(&KeySource::Seed("league".into())).unwrap();
        assert_eq!(a.address(), b.address());
        let c = TxSigner::load(&KeySource::Seed("other".into())).unwrap();
        assert_ne!(a.address(), c.address());
    }

    #[test]
    fn test_signed_transaction_verifies_and_decodes() {
        let signer = TxSigner::load(&KeySource::Seed("league".into())).unwrap();
        let tx = signer.sign(&op(), 7).unwrap();
        tx.verify().unwrap();
        assert_eq!(tx.operation().unwrap(), op());
        assert_eq!(tx.digest().unwrap().len(), 64);
    }

    #[test]
    fn test_tampered_nonce_fails_verification() {
        let signer = TxSigner::load(&KeySource::Random).unwrap();
        let mut tx = signer.sign(&op(), 7).unwrap();
        tx.nonce = 8;
        assert!(matches!(tx.verify(), Err(ChainError::Rejected(_))));
    }

    #[test]
    fn test_key_source_spec() {
        assert_eq!(KeySource::from_spec(None), KeySource::Random);
        assert_eq!(KeySource::from_spec(Some("  ")), KeySource::Random);
        assert_eq!(
            KeySource::from_spec(Some("/etc/matchproof/key")),
            KeySource::File(PathBuf::from("/etc/matchproof/key"))
        );
    }
}
