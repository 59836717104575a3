//! Node-side enrollment
//!
//! The [`EnrollmentClient`] registers this host with the controller and keeps
//! it registered through a heartbeat. The first call authenticates with the
//! bootstrap token and receives a certificate bundle; later calls present the
//! bundle's fingerprint instead.
//!
//! # Controller trust
//!
//! The HTTPS client trusts, in order of preference:
//!
//! 1. the CA certificate from a persisted bundle
//! 2. an operator-supplied controller CA file
//! 3. any certificate, if insecure first contact was explicitly requested
//! 4. the system roots
//!
//! # Lost pins
//!
//! A controller that pins fingerprints forgets them when its directory is
//! reset. When a signature-mode call is answered with 401 and a bootstrap token
//! is configured, the next call re-enrolls with the token and asks for a new
//! bundle.

mod bundle;
mod identity;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::enrollment::{
    ApiResponse, RegisterData, RegisterRequest, CERT_SIGNATURE_HEADER, REGISTER_TOKEN_HEADER,
};
use crate::transport::ServerMtlsConfig;
use crate::DEFAULT_NODE_PORT;

pub use bundle::{LocalBundle, DEFAULT_BUNDLE_DIR};
#[cfg(test)]
pub use identity::MockIdentitySource;
pub use identity::{IdentitySource, StaticIdentity, SystemIdentity};

/// Default time between heartbeat enrollments
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Node-side enrollment errors
#[derive(Debug, Error)]
pub enum NodeError {
    /// Hostname or address could not be discovered
    #[error("missing host identity: {0}")]
    MissingIdentity(String),

    /// Client is misconfigured
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Request could not be sent or answered
    #[error("HTTP error: {0}")]
    Http(String),

    /// Controller refused the enrollment
    #[error("enrollment rejected ({status}): {message}")]
    Rejected {
        /// HTTP status
        status: u16,
        /// Envelope message
        message: String,
    },

    /// Response body was not an enrollment envelope
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Enrollment client configuration
#[derive(Debug, Clone)]
pub struct EnrollmentClientConfig {
    /// Controller base URL, e.g. `https://controller:5920`
    pub controller_url: String,
    /// Bootstrap token for first enrollment
    pub register_token: Option<String>,
    /// Where the bundle is persisted
    pub bundle_dir: PathBuf,
    /// Port of this node's RPC service
    pub port: u16,
    /// Display name; the controller defaults it to the hostname
    pub alias: Option<String>,
    /// Reported software version
    pub version: String,
    /// Time between heartbeat enrollments
    pub heartbeat_interval: Duration,
    /// Operator-supplied controller CA certificate
    pub controller_ca_file: Option<PathBuf>,
    /// Accept an unverified controller certificate when no CA is known
    pub insecure_first_contact: bool,
    /// Per-request timeout
    pub request_timeout: Duration,
}

impl Default for EnrollmentClientConfig {
    fn default() -> Self {
        Self {
            controller_url: String::new(),
            register_token: None,
            bundle_dir: PathBuf::from(DEFAULT_BUNDLE_DIR),
            port: DEFAULT_NODE_PORT,
            alias: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            controller_ca_file: None,
            insecure_first_contact: false,
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Where trust in the controller's certificate comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustSource {
    /// CA from the persisted bundle
    PersistedCa(PathBuf),
    /// Operator-supplied CA file
    OperatorCa(PathBuf),
    /// No verification on first contact
    InsecureFirstContact,
    /// Platform trust roots
    SystemRoots,
}

/// Outcome of one enrollment call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollmentReport {
    /// Address the node enrolled under
    pub address: String,
    /// Whether the controller returned a bundle
    pub issued: bool,
    /// Whether the returned bundle was written to disk
    pub persisted: bool,
}

/// Header, value and `needs_cert` for one enrollment call
#[derive(Debug, Clone, PartialEq, Eq)]
struct CallCredential {
    header: &'static str,
    value: String,
    needs_cert: bool,
}

/// Registers this node with the controller
pub struct EnrollmentClient {
    config: EnrollmentClientConfig,
    identity: Arc<dyn IdentitySource>,
    bundle: LocalBundle,
    // Set when the controller refused our signature
    signature_refused: AtomicBool,
}

impl EnrollmentClient {
    /// Create a client; the controller URL and heartbeat interval must be set
    pub fn new(
        config: EnrollmentClientConfig,
        identity: Arc<dyn IdentitySource>,
    ) -> Result<Self, NodeError> {
        if config.controller_url.trim().is_empty() {
            return Err(NodeError::Configuration(
                "controller URL is required".to_string(),
            ));
        }
        if config.heartbeat_interval.is_zero() {
            return Err(NodeError::Configuration(
                "heartbeat interval must be positive".to_string(),
            ));
        }

        let bundle = LocalBundle::new(config.bundle_dir.clone());
        Ok(Self {
            config,
            identity,
            bundle,
            signature_refused: AtomicBool::new(false),
        })
    }

    /// The persisted bundle
    pub fn bundle(&self) -> &LocalBundle {
        &self.bundle
    }

    /// Trust source the next request will use
    pub fn trust_source(&self) -> TrustSource {
        let persisted = self.bundle.ca_cert_path();
        if persisted.exists() {
            return TrustSource::PersistedCa(persisted);
        }
        if let Some(path) = &self.config.controller_ca_file {
            if path.exists() {
                return TrustSource::OperatorCa(path.clone());
            }
        }
        if self.config.insecure_first_contact {
            return TrustSource::InsecureFirstContact;
        }
        TrustSource::SystemRoots
    }

    fn http_client(&self) -> Result<reqwest::Client, NodeError> {
        let builder = reqwest::Client::builder().timeout(self.config.request_timeout);

        let builder = match self.trust_source() {
            TrustSource::PersistedCa(path) | TrustSource::OperatorCa(path) => {
                let pem = std::fs::read(&path)?;
                let ca_cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                    NodeError::Configuration(format!(
                        "invalid CA certificate {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                builder
                    .tls_built_in_root_certs(false)
                    .add_root_certificate(ca_cert)
            }
            TrustSource::InsecureFirstContact => {
                warn!("No controller CA known, accepting unverified certificate for first contact");
                builder.danger_accept_invalid_certs(true)
            }
            TrustSource::SystemRoots => builder,
        };

        builder
            .build()
            .map_err(|e| NodeError::Http(format!("failed to build HTTP client: {}", e)))
    }

    /// Configured bootstrap token, if non-blank
    fn token(&self) -> Option<&str> {
        self.config
            .register_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    /// Pick the credential for the next call
    ///
    /// The bundle's signature is preferred, unless the controller refused it
    /// and a token is available to re-enroll with.
    fn call_credential(&self, signature: Option<String>) -> Result<CallCredential, NodeError> {
        let token = self.token();
        let refused = self.signature_refused.load(Ordering::Acquire);
        match signature {
            Some(signature) if !refused || token.is_none() => Ok(CallCredential {
                header: CERT_SIGNATURE_HEADER,
                value: signature,
                needs_cert: false,
            }),
            _ => match token {
                Some(token) => Ok(CallCredential {
                    header: REGISTER_TOKEN_HEADER,
                    value: token.to_string(),
                    needs_cert: true,
                }),
                None => Err(NodeError::Configuration(
                    "no certificate bundle and no bootstrap token".to_string(),
                )),
            },
        }
    }

    /// Perform one enrollment call
    pub async fn enroll_once(&self) -> Result<EnrollmentReport, NodeError> {
        let hostname = self.identity.hostname()?;
        let address = self.identity.primary_ipv4()?.to_string();

        let credential = self.call_credential(self.bundle.signature()?)?;

        let request = RegisterRequest {
            hostname,
            address: address.clone(),
            port: self.config.port,
            alias: self.config.alias.clone().unwrap_or_default(),
            version: self.config.version.clone(),
            needs_cert: credential.needs_cert,
        };

        let url = format!(
            "{}/api/host/register",
            self.config.controller_url.trim_end_matches('/')
        );
        debug!(url = %url, needs_cert = request.needs_cert, "Sending enrollment request");

        let response = self
            .http_client()?
            .post(&url)
            .header(credential.header, credential.value.as_str())
            .json(&request)
            .send()
            .await
            .map_err(|e| NodeError::Http(e.to_string()))?;

        let status = response.status();
        let envelope: ApiResponse<RegisterData> = response
            .json()
            .await
            .map_err(|e| NodeError::InvalidResponse(format!("{} (status {})", e, status)))?;

        if !status.is_success() || !envelope.is_success() {
            if status == reqwest::StatusCode::UNAUTHORIZED
                && credential.header == CERT_SIGNATURE_HEADER
            {
                self.note_signature_refused();
            }
            return Err(NodeError::Rejected {
                status: status.as_u16(),
                message: envelope.message,
            });
        }

        let issued = envelope.data.and_then(|d| d.cert_bundle);
        let persisted = match &issued {
            Some(bundle) => match self.bundle.save(bundle) {
                Ok(()) => {
                    info!(dir = %self.bundle.dir().display(), "Saved certificate bundle");
                    true
                }
                Err(e) => {
                    warn!(error = %e, "Failed to save certificate bundle, will request again");
                    false
                }
            },
            None => false,
        };

        if persisted {
            self.signature_refused.store(false, Ordering::Release);
        }

        Ok(EnrollmentReport {
            address,
            issued: issued.is_some(),
            persisted,
        })
    }

    fn note_signature_refused(&self) {
        if self.token().is_some() {
            warn!("Controller refused the certificate signature, re-enrolling with the bootstrap token");
        } else {
            warn!("Controller refused the certificate signature and no bootstrap token is configured");
        }
        self.signature_refused.store(true, Ordering::Release);
    }

    /// Enroll now and then every heartbeat interval until cancelled.
    ///
    /// Failures are logged and the next tick proceeds as usual.
    pub async fn run_heartbeat(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?self.config.heartbeat_interval, "Starting enrollment heartbeat");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.enroll_once() => match result {
                    Ok(report) => debug!(
                        address = %report.address,
                        issued = report.issued,
                        "Enrollment heartbeat succeeded"
                    ),
                    Err(e) => warn!(error = %e, "Enrollment heartbeat failed"),
                },
            }
        }

        info!("Enrollment heartbeat stopped");
    }

    /// Run the heartbeat on its own task
    pub fn spawn_heartbeat(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run_heartbeat(cancel).await })
    }
}

/// Load and check the node's server TLS material
///
/// Used at startup when transport security is enabled; any missing or
/// malformed file stops the node before it listens.
pub fn load_server_tls(
    ca_file: &Path,
    cert_file: &Path,
    key_file: &Path,
) -> crate::Result<ServerMtlsConfig> {
    let mtls = ServerMtlsConfig::from_files(ca_file, cert_file, key_file)?;
    mtls.to_tonic_config()?;
    Ok(mtls)
}

/// Controller URL for the heartbeat, required once registration is enabled
pub fn require_controller_url(url: Option<&str>) -> crate::Result<String> {
    url.map(str::trim)
        .filter(|u| !u.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            crate::Error::config("a controller URL is required when registration is enabled")
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(dir: &std::path::Path) -> EnrollmentClientConfig {
        EnrollmentClientConfig {
            controller_url: "https://127.0.0.1:1".to_string(),
            bundle_dir: dir.join("certs"),
            ..Default::default()
        }
    }

    fn static_identity() -> Arc<dyn IdentitySource> {
        Arc::new(StaticIdentity {
            hostname: "node-a".to_string(),
            address: Ipv4Addr::new(10, 0, 0, 5),
        })
    }

    #[test]
    fn controller_url_must_be_non_blank() {
        assert_eq!(
            require_controller_url(Some(" https://ctrl:5920 ")).unwrap(),
            "https://ctrl:5920"
        );
        for missing in [None, Some(""), Some("   ")] {
            let err = require_controller_url(missing).unwrap_err();
            assert!(matches!(err, crate::Error::Config(_)));
        }
    }

    #[test]
    fn config_defaults() {
        let config = EnrollmentClientConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.bundle_dir, PathBuf::from("./certs"));
        assert_eq!(config.port, DEFAULT_NODE_PORT);
        assert!(!config.insecure_first_contact);
    }

    #[test]
    fn controller_url_is_required() {
        let result = EnrollmentClient::new(EnrollmentClientConfig::default(), static_identity());
        assert!(matches!(result, Err(NodeError::Configuration(_))));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.heartbeat_interval = Duration::ZERO;
        let result = EnrollmentClient::new(config, static_identity());
        assert!(matches!(result, Err(NodeError::Configuration(_))));
    }

    #[tokio::test]
    async fn missing_address_fails_hard() {
        let dir = tempfile::tempdir().unwrap();
        let mut identity = MockIdentitySource::new();
        identity
            .expect_hostname()
            .returning(|| Ok("node-a".to_string()));
        identity.expect_primary_ipv4().returning(|| {
            Err(NodeError::MissingIdentity(
                "no non-loopback IPv4 address".to_string(),
            ))
        });

        let client = EnrollmentClient::new(config(dir.path()), Arc::new(identity)).unwrap();
        let result = client.enroll_once().await;
        assert!(matches!(result, Err(NodeError::MissingIdentity(_))));
    }

    #[tokio::test]
    async fn no_token_and_no_bundle_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let client = EnrollmentClient::new(config(dir.path()), static_identity()).unwrap();

        let result = client.enroll_once().await;
        assert!(matches!(result, Err(NodeError::Configuration(msg)) if msg.contains("token")));
    }

    fn write_bundle(client: &EnrollmentClient) {
        std::fs::create_dir_all(client.bundle().dir()).unwrap();
        std::fs::write(client.bundle().ca_cert_path(), "ca").unwrap();
        std::fs::write(client.bundle().cert_path(), "cert").unwrap();
        std::fs::write(client.bundle().key_path(), "key").unwrap();
    }

    #[test]
    fn bundle_signature_is_preferred_over_token() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.register_token = Some("abc123".to_string());
        let client = EnrollmentClient::new(config, static_identity()).unwrap();

        let first = client.call_credential(client.bundle().signature().unwrap()).unwrap();
        assert_eq!(first.header, REGISTER_TOKEN_HEADER);
        assert_eq!(first.value, "abc123");
        assert!(first.needs_cert);

        write_bundle(&client);
        let signature = client.bundle().signature().unwrap();
        let later = client.call_credential(signature.clone()).unwrap();
        assert_eq!(later.header, CERT_SIGNATURE_HEADER);
        assert_eq!(Some(later.value), signature);
        assert!(!later.needs_cert);
    }

    /// Story: A refused signature sends the node back to its bootstrap token
    ///
    /// A controller that lost its pinned fingerprints answers 401 to the
    /// bundle's signature. The next call uses the token and asks for a fresh
    /// bundle; once that bundle is saved the node is back in signature mode.
    #[test]
    fn story_refused_signature_falls_back_to_token() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.register_token = Some(" abc123 ".to_string());
        let client = EnrollmentClient::new(config, static_identity()).unwrap();
        write_bundle(&client);

        client.note_signature_refused();
        let retry = client.call_credential(client.bundle().signature().unwrap()).unwrap();
        assert_eq!(retry.header, REGISTER_TOKEN_HEADER);
        assert_eq!(retry.value, "abc123");
        assert!(retry.needs_cert);

        client.signature_refused.store(false, Ordering::Release);
        let recovered = client.call_credential(client.bundle().signature().unwrap()).unwrap();
        assert_eq!(recovered.header, CERT_SIGNATURE_HEADER);
    }

    #[test]
    fn refused_signature_without_token_keeps_signature() {
        let dir = tempfile::tempdir().unwrap();
        let client = EnrollmentClient::new(config(dir.path()), static_identity()).unwrap();
        write_bundle(&client);

        client.note_signature_refused();
        let credential = client.call_credential(client.bundle().signature().unwrap()).unwrap();
        assert_eq!(credential.header, CERT_SIGNATURE_HEADER);
        assert!(!credential.needs_cert);
    }

    #[test]
    fn trust_source_prefers_persisted_ca() {
        let dir = tempfile::tempdir().unwrap();
        let operator_ca = dir.path().join("controller-ca.crt");
        let mut config = config(dir.path());
        config.controller_ca_file = Some(operator_ca.clone());
        config.insecure_first_contact = true;
        let client = EnrollmentClient::new(config, static_identity()).unwrap();

        assert_eq!(client.trust_source(), TrustSource::InsecureFirstContact);

        std::fs::write(&operator_ca, "ca").unwrap();
        assert_eq!(client.trust_source(), TrustSource::OperatorCa(operator_ca));

        std::fs::create_dir_all(client.bundle().dir()).unwrap();
        std::fs::write(client.bundle().ca_cert_path(), "ca").unwrap();
        assert_eq!(
            client.trust_source(),
            TrustSource::PersistedCa(client.bundle().ca_cert_path())
        );
    }

    #[test]
    fn trust_source_defaults_to_system_roots() {
        let dir = tempfile::tempdir().unwrap();
        let client = EnrollmentClient::new(config(dir.path()), static_identity()).unwrap();
        assert_eq!(client.trust_source(), TrustSource::SystemRoots);
    }

    // ==========================================================================
    // Story Tests: Heartbeat
    // ==========================================================================

    /// Story: The heartbeat keeps going through failures until cancelled
    ///
    /// Every tick is a full enrollment attempt. Identity lookup fails each
    /// time here, and the loop simply tries again on the next tick.
    #[tokio::test(start_paused = true)]
    async fn story_heartbeat_survives_failures_until_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let attempts = Arc::new(AtomicUsize::new(0));

        let mut identity = MockIdentitySource::new();
        let counter = attempts.clone();
        identity.expect_hostname().returning(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(NodeError::MissingIdentity("hostname unavailable".to_string()))
        });

        let mut config = config(dir.path());
        config.heartbeat_interval = Duration::from_secs(30);
        let client = Arc::new(EnrollmentClient::new(config, Arc::new(identity)).unwrap());

        let cancel = CancellationToken::new();
        let handle = client.spawn_heartbeat(cancel.clone());

        // First tick is immediate, then one per interval
        tokio::time::sleep(Duration::from_secs(95)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    /// Story: Cancelling before the first tick completes stops cleanly
    #[tokio::test(start_paused = true)]
    async fn story_heartbeat_stops_when_cancelled_early() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(EnrollmentClient::new(config(dir.path()), static_identity()).unwrap());

        let cancel = CancellationToken::new();
        cancel.cancel();
        client.spawn_heartbeat(cancel).await.unwrap();
    }
}
