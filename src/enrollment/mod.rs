//! Node enrollment
//!
//! Enrollment is how a node authenticates to the controller, gets recorded in
//! the [`Directory`], and receives a leaf certificate from the [`RootCa`].
//!
//! # Authentication
//!
//! Two mutually exclusive modes, selected by which header the node sends:
//!
//! - **Token mode** (`X-Register-Token`): the shared bootstrap token. Takes
//!   precedence when both headers are present.
//! - **Signature mode** (`X-Client-Cert-Signature`): the fingerprint of the
//!   node's existing leaf. Whether any value or only the recorded one is
//!   accepted depends on [`SignaturePolicy`].
//!
//! A failed check mutates nothing and the response never says which part
//! failed.
//!
//! # Register Flow
//!
//! 1. Validate the request body
//! 2. Authenticate
//! 3. Under the address lock, look up the node and create or update it
//! 4. Issue a bundle when asked, or always on first enrollment
//!
//! # Provision Flow
//!
//! Token-only. Fails with [`EnrollmentError::AlreadyRegistered`] if the address
//! is known, otherwise issues a server identity and records the node.

mod http;
mod token;

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::directory::{
    Directory, DirectoryError, NodeRecord, META_CERT_FINGERPRINT, META_HOSTNAME, META_VERSION,
};
use crate::pki::{LeafIdentity, PkiError, RootCa};
use crate::DEFAULT_NODE_PORT;

pub use http::{
    enrollment_router, ApiResponse, ProvisionData, RegisterData, CERT_SIGNATURE_HEADER,
    REGISTER_TOKEN_HEADER,
};
pub use token::{BootstrapToken, TokenCheck, TokenSlot};

/// Remark stamped on nodes created through provisioning
pub const PROVISIONED_REMARK: &str = "Auto-provisioned";

/// Enrollment errors
#[derive(Debug, Error)]
pub enum EnrollmentError {
    /// Request body failed validation
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Token presented but no token is configured
    #[error("token enrollment is not configured")]
    TokenNotConfigured,

    /// Token does not match the active one
    #[error("invalid bootstrap token")]
    InvalidToken,

    /// Neither credential header present
    #[error("missing credentials")]
    AuthenticationRequired,

    /// Signature credential rejected
    #[error("invalid certificate signature")]
    InvalidSignature,

    /// Address already has a record (provisioning only)
    #[error("node already registered: {0}")]
    AlreadyRegistered(String),

    /// Directory failure
    #[error(transparent)]
    Directory(#[from] DirectoryError),

    /// Certificate issuance failed
    #[error("certificate issuance failed: {0}")]
    Issuance(#[from] PkiError),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl EnrollmentError {
    /// Whether this error is an authentication failure
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            Self::TokenNotConfigured
                | Self::InvalidToken
                | Self::AuthenticationRequired
                | Self::InvalidSignature
        )
    }
}

/// Credential presented with an enrollment request
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Shared bootstrap token
    Token(String),
    /// Fingerprint of the node's current leaf
    Signature(String),
    /// No credential header
    Missing,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Token(_) => f.write_str("Token(..)"),
            Self::Signature(sig) => f.debug_tuple("Signature").field(sig).finish(),
            Self::Missing => f.write_str("Missing"),
        }
    }
}

/// How signature-mode credentials are checked
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SignaturePolicy {
    /// Any non-empty value is accepted
    #[default]
    AcceptAny,
    /// Value must equal the fingerprint recorded at the address's last issuance
    PinnedFingerprint,
}

/// Enrollment service configuration
#[derive(Debug, Clone)]
pub struct EnrollmentServiceConfig {
    /// Signature-mode check
    pub signature_policy: SignaturePolicy,
    /// Port recorded for provisioned nodes
    pub provisioned_port: u16,
}

impl Default for EnrollmentServiceConfig {
    fn default() -> Self {
        Self {
            signature_policy: SignaturePolicy::default(),
            provisioned_port: DEFAULT_NODE_PORT,
        }
    }
}

/// Registration request body
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// Node hostname
    #[serde(default)]
    pub hostname: String,
    /// Node address, also accepted as `ip`
    #[serde(default, alias = "ip")]
    pub address: String,
    /// Port of the node's RPC service
    #[serde(default)]
    pub port: u16,
    /// Display name; defaults to the hostname
    #[serde(default)]
    pub alias: String,
    /// Node software version
    #[serde(default)]
    pub version: String,
    /// Whether the node wants a fresh certificate bundle
    #[serde(default)]
    pub needs_cert: bool,
}

impl RegisterRequest {
    /// Trim fields and check required values
    fn validated(mut self) -> Result<Self, EnrollmentError> {
        self.hostname = self.hostname.trim().to_string();
        self.address = self.address.trim().to_string();
        self.alias = self.alias.trim().to_string();
        self.version = self.version.trim().to_string();

        if self.hostname.is_empty() {
            return Err(EnrollmentError::InvalidRequest("hostname is required".into()));
        }
        if self.address.is_empty() {
            return Err(EnrollmentError::InvalidRequest("address is required".into()));
        }
        if self.port == 0 {
            return Err(EnrollmentError::InvalidRequest(
                "port must be between 1 and 65535".into(),
            ));
        }
        if self.alias.is_empty() {
            self.alias = self.hostname.clone();
        }
        Ok(self)
    }

    fn remark(&self) -> String {
        format!("Auto-registered, version: {}", self.version)
    }
}

/// Provisioning request body
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionRequest {
    /// Node hostname
    #[serde(default)]
    pub hostname: String,
    /// Node address, also accepted as `ip`
    #[serde(default, alias = "ip")]
    pub address: String,
}

impl ProvisionRequest {
    fn validated(mut self) -> Result<Self, EnrollmentError> {
        self.hostname = self.hostname.trim().to_string();
        self.address = self.address.trim().to_string();
        if self.hostname.is_empty() || self.address.is_empty() {
            return Err(EnrollmentError::InvalidRequest(
                "hostname and address are required".into(),
            ));
        }
        Ok(self)
    }
}

/// Bundle returned to a registering node
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateBundle {
    /// CA certificate (PEM)
    pub ca_cert: String,
    /// Node certificate (PEM)
    pub client_cert: String,
    /// Node private key (PEM)
    pub client_key: String,
}

impl std::fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("client_cert_fingerprint", &crate::pki::fingerprint(&self.client_cert))
            .finish_non_exhaustive()
    }
}

/// Bundle returned by provisioning
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerCertificateBundle {
    /// CA certificate (PEM)
    pub ca_cert: String,
    /// Server certificate (PEM)
    pub server_cert: String,
    /// Server private key (PEM)
    pub server_key: String,
}

impl std::fmt::Debug for ServerCertificateBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerCertificateBundle")
            .field("server_cert_fingerprint", &crate::pki::fingerprint(&self.server_cert))
            .finish_non_exhaustive()
    }
}

/// Result of a successful registration
#[derive(Debug, Clone)]
pub struct RegisterOutcome {
    /// Whether this was the node's first enrollment
    pub created: bool,
    /// Issued bundle, if any
    pub bundle: Option<CertificateBundle>,
}

/// Controller-side enrollment
pub struct EnrollmentService {
    ca: Arc<RootCa>,
    directory: Arc<dyn Directory>,
    tokens: Arc<TokenSlot>,
    config: EnrollmentServiceConfig,
    /// Per-address serialization of lookup + write
    address_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl EnrollmentService {
    /// Create a new enrollment service
    pub fn new(
        ca: Arc<RootCa>,
        directory: Arc<dyn Directory>,
        tokens: Arc<TokenSlot>,
        config: EnrollmentServiceConfig,
    ) -> Self {
        Self {
            ca,
            directory,
            tokens,
            config,
            address_locks: DashMap::new(),
        }
    }

    /// The bootstrap token slot (for rotation)
    pub fn tokens(&self) -> &Arc<TokenSlot> {
        &self.tokens
    }

    /// The CA certificate nodes should trust
    pub fn ca_cert_pem(&self) -> &str {
        self.ca.ca_cert_pem()
    }

    fn address_lock(&self, address: &str) -> Arc<Mutex<()>> {
        self.address_locks
            .entry(address.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Check the credential, logging failures with the claimed address
    async fn authenticate(
        &self,
        credential: &Credential,
        address: &str,
    ) -> Result<(), EnrollmentError> {
        let result = self.check_credential(credential, address).await;
        if let Err(e) = &result {
            if e.is_auth_failure() {
                warn!(address = %address, reason = %e, "Enrollment authentication failed");
            }
        }
        result
    }

    async fn check_credential(
        &self,
        credential: &Credential,
        address: &str,
    ) -> Result<(), EnrollmentError> {
        match credential {
            Credential::Token(presented) => match self.tokens.verify(presented.trim()) {
                TokenCheck::Accepted => Ok(()),
                TokenCheck::Rejected => Err(EnrollmentError::InvalidToken),
                TokenCheck::NotConfigured => Err(EnrollmentError::TokenNotConfigured),
            },
            Credential::Signature(presented) => {
                let presented = presented.trim().to_ascii_lowercase();
                if presented.is_empty() {
                    return Err(EnrollmentError::InvalidSignature);
                }
                match self.config.signature_policy {
                    SignaturePolicy::AcceptAny => Ok(()),
                    SignaturePolicy::PinnedFingerprint => {
                        let record = self.directory.find(address).await?;
                        let pinned = record
                            .as_ref()
                            .and_then(|r| r.cert_fingerprint())
                            .map(|fp| bool::from(fp.as_bytes().ct_eq(presented.as_bytes())))
                            .unwrap_or(false);
                        if pinned {
                            Ok(())
                        } else {
                            Err(EnrollmentError::InvalidSignature)
                        }
                    }
                }
            }
            Credential::Missing => Err(EnrollmentError::AuthenticationRequired),
        }
    }

    /// Issue a node identity off the async runtime
    async fn issue_node_identity(
        &self,
        address: &str,
        hostname: &str,
    ) -> Result<LeafIdentity, EnrollmentError> {
        let ca = self.ca.clone();
        let (address, hostname) = (address.to_string(), hostname.to_string());
        let identity =
            tokio::task::spawn_blocking(move || ca.issue_server_identity(&address, &hostname))
                .await
                .map_err(|e| EnrollmentError::Internal(format!("issuance task failed: {}", e)))??;
        Ok(identity)
    }

    fn record_metadata(
        &self,
        hostname: &str,
        version: Option<&str>,
        fingerprint: Option<String>,
    ) -> BTreeMap<String, String> {
        let mut metadata = BTreeMap::new();
        metadata.insert(META_HOSTNAME.to_string(), hostname.to_string());
        if let Some(version) = version {
            metadata.insert(META_VERSION.to_string(), version.to_string());
        }
        if self.config.signature_policy == SignaturePolicy::PinnedFingerprint {
            if let Some(fingerprint) = fingerprint {
                metadata.insert(META_CERT_FINGERPRINT.to_string(), fingerprint);
            }
        }
        metadata
    }

    /// Register or refresh a node
    pub async fn register(
        &self,
        credential: &Credential,
        request: RegisterRequest,
    ) -> Result<RegisterOutcome, EnrollmentError> {
        let request = request.validated()?;
        self.authenticate(credential, &request.address).await?;

        let lock = self.address_lock(&request.address);
        let _guard = lock.lock().await;

        let existing = self.directory.find(&request.address).await?;
        let created = existing.is_none();

        let bundle = if request.needs_cert || created {
            match self
                .issue_node_identity(&request.address, &request.hostname)
                .await
            {
                Ok(identity) => {
                    let (client_cert, client_key) = identity.into_parts();
                    Some(CertificateBundle {
                        ca_cert: self.ca.ca_cert_pem().to_string(),
                        client_cert,
                        client_key: client_key.to_string(),
                    })
                }
                Err(e) => {
                    error!(
                        address = %request.address,
                        error = %e,
                        "Certificate issuance failed, enrolling without certificate"
                    );
                    None
                }
            }
        } else {
            None
        };

        let issued_fingerprint = bundle
            .as_ref()
            .map(|b| crate::pki::fingerprint(&b.client_cert));

        match existing {
            None => {
                let record = NodeRecord {
                    address: request.address.clone(),
                    alias: request.alias.clone(),
                    port: request.port,
                    remark: request.remark(),
                    metadata: self.record_metadata(
                        &request.hostname,
                        Some(&request.version),
                        issued_fingerprint,
                    ),
                };
                self.directory.create(record).await?;
                info!(address = %request.address, port = request.port, "Node registered");
            }
            Some(mut record) => {
                let mut metadata = self.record_metadata(
                    &request.hostname,
                    Some(&request.version),
                    issued_fingerprint,
                );
                if !metadata.contains_key(META_CERT_FINGERPRINT) {
                    if let Some(previous) = record.metadata.remove(META_CERT_FINGERPRINT) {
                        metadata.insert(META_CERT_FINGERPRINT.to_string(), previous);
                    }
                }
                record.alias = request.alias.clone();
                record.port = request.port;
                record.remark = request.remark();
                record.metadata = metadata;
                self.directory.update(record).await?;
                debug!(address = %request.address, port = request.port, "Node refreshed");
            }
        }

        Ok(RegisterOutcome { created, bundle })
    }

    /// Provision a node that has not enrolled yet
    pub async fn provision(
        &self,
        credential: &Credential,
        request: ProvisionRequest,
    ) -> Result<ServerCertificateBundle, EnrollmentError> {
        let request = request.validated()?;

        let credential = match credential {
            Credential::Token(_) => credential,
            _ => {
                warn!(address = %request.address, "Provisioning requires a bootstrap token");
                return Err(EnrollmentError::AuthenticationRequired);
            }
        };
        self.authenticate(credential, &request.address).await?;

        let lock = self.address_lock(&request.address);
        let _guard = lock.lock().await;

        if self.directory.find(&request.address).await?.is_some() {
            return Err(EnrollmentError::AlreadyRegistered(request.address));
        }

        let identity = self
            .issue_node_identity(&request.address, &request.hostname)
            .await?;

        let record = NodeRecord {
            address: request.address.clone(),
            alias: request.hostname.clone(),
            port: self.config.provisioned_port,
            remark: PROVISIONED_REMARK.to_string(),
            metadata: self.record_metadata(&request.hostname, None, Some(identity.fingerprint())),
        };
        self.directory.create(record).await?;
        info!(address = %request.address, "Node provisioned");

        let (server_cert, server_key) = identity.into_parts();
        Ok(ServerCertificateBundle {
            ca_cert: self.ca.ca_cert_pem().to_string(),
            server_cert,
            server_key: server_key.to_string(),
        })
    }
}
