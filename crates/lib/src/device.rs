//! Device identity for the gateway handshake: keypair generation, stable id, and signing.
//!
//! The signing string must match the gateway's canonical payload exactly
//! (tag, deviceId, client id/mode, role, scopes, signedAt, token, nonce, pipe-separated).

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

/// Literal tag prefixed to the canonical signing string.
pub const CONNECT_SIGNING_TAG: &str = "webbridge-connect";

/// Errors from identity generation or signing.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("keypair generation failed: {0}")]
    Generate(String),

    #[error("signing failed: {0}")]
    Sign(String),
}

/// Signing capability used by the bridge manager. Injected so tests can
/// substitute a deterministic fake.
pub trait Signer: Send + Sync {
    /// Stable identifier derived from the public key.
    fn device_id(&self) -> &str;

    /// Raw public key bytes as url-safe base64 without padding.
    fn public_key(&self) -> &str;

    /// Detached signature over `payload`, url-safe base64 without padding.
    fn sign(&self, payload: &[u8]) -> Result<String, DeviceError>;
}

/// Process-wide Ed25519 identity. Generated once at startup; the private key
/// never leaves this struct.
pub struct DeviceIdentity {
    device_id: String,
    public_key: String,
    signing_key: ed25519_dalek::SigningKey,
}

impl DeviceIdentity {
    /// Generate a fresh keypair. Failure here is fatal to the bridge manager:
    /// no session can be authenticated without a signing identity.
    pub fn generate() -> Result<Self, DeviceError> {
        let mut seed = [0u8; 32];
        getrandom::getrandom(&mut seed).map_err(|e| DeviceError::Generate(e.to_string()))?;
        Ok(Self::from_seed(seed))
    }

    /// Build the identity from known key material. The device id is a pure
    /// function of the public key, so the same seed always yields the same id.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let signing_key = ed25519_dalek::SigningKey::from_bytes(&seed);
        let raw_public = signing_key.verifying_key().to_bytes();
        let device_id = hex::encode(Sha256::digest(raw_public));
        let public_key = URL_SAFE_NO_PAD.encode(raw_public);
        Self {
            device_id,
            public_key,
            signing_key,
        }
    }
}

impl Signer for DeviceIdentity {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn public_key(&self) -> &str {
        &self.public_key
    }

    fn sign(&self, payload: &[u8]) -> Result<String, DeviceError> {
        use ed25519_dalek::Signer as _;
        let sig = self
            .signing_key
            .try_sign(payload)
            .map_err(|e| DeviceError::Sign(e.to_string()))?;
        Ok(URL_SAFE_NO_PAD.encode(sig.to_bytes()))
    }
}

/// Build the canonical signing string the gateway verifies.
/// Order: tag, deviceId, client id, client mode, role, scopes (comma-joined),
/// signedAt (ms), token (empty when unset), nonce.
#[allow(clippy::too_many_arguments)]
pub fn build_connect_payload(
    device_id: &str,
    client_id: &str,
    client_mode: &str,
    role: &str,
    scopes: &[&str],
    signed_at: u64,
    token: &str,
    nonce: &str,
) -> String {
    let scopes_str = scopes.join(",");
    format!(
        "{}|{}|{}|{}|{}|{}|{}|{}|{}",
        CONNECT_SIGNING_TAG,
        device_id,
        client_id,
        client_mode,
        role,
        scopes_str,
        signed_at,
        token,
        nonce
    )
}
