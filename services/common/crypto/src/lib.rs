use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Length in bytes of a hex-encoded SHA-256 MAC.
const HEX_SIGNATURE_LENGTH: usize = 64;

/// Errors produced while signing or verifying webhook payloads.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("webhook secret is empty")]
    EmptySecret,
    #[error("signature header missing")]
    Missing,
    #[error("signature is not {HEX_SIGNATURE_LENGTH} hex characters")]
    Malformed,
    #[error("signature mismatch")]
    Mismatch,
}

/// Shared secret used to authenticate inbound gateway webhooks.
#[derive(Clone)]
pub struct WebhookSecret(Zeroizing<Vec<u8>>);

impl WebhookSecret {
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self, SignatureError> {
        let bytes = secret.as_ref();
        if bytes.is_empty() {
            return Err(SignatureError::EmptySecret);
        }
        Ok(Self(Zeroizing::new(bytes.to_vec())))
    }

    fn mac(&self) -> HmacSha256 {
        <HmacSha256 as Mac>::new_from_slice(&self.0).expect("HMAC accepts keys of any length")
    }

    /// Hex-encoded HMAC-SHA256 of the raw payload.
    pub fn sign_hex(&self, payload: &[u8]) -> String {
        let mut mac = self.mac();
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Verify a provided hex signature against the raw payload in constant time.
    /// An optional `sha256=` prefix is tolerated.
    pub fn verify_hex(&self, payload: &[u8], provided: &str) -> Result<(), SignatureError> {
        let provided = provided.trim();
        if provided.is_empty() {
            return Err(SignatureError::Missing);
        }
        let provided = provided.strip_prefix("sha256=").unwrap_or(provided);
        if provided.len() != HEX_SIGNATURE_LENGTH {
            return Err(SignatureError::Malformed);
        }
        let provided = provided.to_ascii_lowercase();
        let expected = self.sign_hex(payload);
        if expected.as_bytes().ct_eq(provided.as_bytes()).unwrap_u8() == 1 {
            Ok(())
        } else {
            Err(SignatureError::Mismatch)
        }
    }
}

impl std::fmt::Debug for WebhookSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookSecret")
            .field("bytes", &"***redacted***")
            .finish()
    }
}
