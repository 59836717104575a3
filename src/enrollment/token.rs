//! Bootstrap token generation and validation
//!
//! A single shared secret authorizes first enrollment. The controller holds at
//! most one active value at a time; rotating replaces it atomically and an
//! empty slot disables token-mode enrollment.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use parking_lot::RwLock;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use super::EnrollmentError;

fn sha256(value: &str) -> [u8; 32] {
    use aws_lc_rs::digest::{digest, SHA256};
    let mut out = [0u8; 32];
    out.copy_from_slice(digest(&SHA256, value.as_bytes()).as_ref());
    out
}

/// A bootstrap token for node enrollment
#[derive(Clone)]
pub struct BootstrapToken {
    value: Zeroizing<String>,
    digest: [u8; 32],
}

impl BootstrapToken {
    /// Generate a new random bootstrap token (32 bytes, base64url)
    pub fn generate() -> Result<Self, EnrollmentError> {
        let mut raw = Zeroizing::new(vec![0u8; 32]);
        aws_lc_rs::rand::fill(&mut raw)
            .map_err(|_| EnrollmentError::Internal("random generation failed".to_string()))?;
        Ok(Self::from_string(&URL_SAFE_NO_PAD.encode(&*raw)))
    }

    /// Wrap an operator-supplied token
    pub fn from_string(s: &str) -> Self {
        Self {
            value: Zeroizing::new(s.to_string()),
            digest: sha256(s),
        }
    }

    /// Get the token as a string
    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// Get a SHA-256 hash of the token (safe to log)
    pub fn hash(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.digest)
    }

    /// Constant-time comparison against a presented value
    pub fn matches(&self, presented: &str) -> bool {
        self.digest[..].ct_eq(&sha256(presented)[..]).into()
    }
}

impl std::fmt::Debug for BootstrapToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapToken")
            .field("hash", &self.hash())
            .finish()
    }
}

/// Outcome of checking a presented token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenCheck {
    /// Token equals the active one
    Accepted,
    /// Token does not match
    Rejected,
    /// No token is active, token-mode enrollment is off
    NotConfigured,
}

/// Holder of the single active bootstrap token
#[derive(Debug, Default)]
pub struct TokenSlot {
    current: RwLock<Option<BootstrapToken>>,
}

impl TokenSlot {
    /// Create a slot with the given token; an empty string leaves it disabled
    pub fn new(token: Option<&str>) -> Self {
        let slot = Self::default();
        if let Some(token) = token {
            slot.set(token);
        }
        slot
    }

    /// Replace the active token; an empty value clears the slot
    pub fn set(&self, token: &str) {
        let token = token.trim();
        *self.current.write() = if token.is_empty() {
            None
        } else {
            Some(BootstrapToken::from_string(token))
        };
    }

    /// Disable token-mode enrollment
    pub fn clear(&self) {
        *self.current.write() = None;
    }

    /// Replace the active token with a freshly generated one
    pub fn rotate(&self) -> Result<BootstrapToken, EnrollmentError> {
        let token = BootstrapToken::generate()?;
        *self.current.write() = Some(token.clone());
        Ok(token)
    }

    /// Whether a token is active
    pub fn is_enabled(&self) -> bool {
        self.current.read().is_some()
    }

    /// Check a presented token against the active one
    pub fn verify(&self, presented: &str) -> TokenCheck {
        match &*self.current.read() {
            None => TokenCheck::NotConfigured,
            Some(_) if presented.is_empty() => TokenCheck::Rejected,
            Some(active) if active.matches(presented) => TokenCheck::Accepted,
            Some(_) => TokenCheck::Rejected,
        }
    }
}
