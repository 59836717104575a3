//! mTLS configuration for gRPC connections
//!
//! Builds tonic TLS configs for both sides: nodes serve with their issued
//! identity, the controller dials with its client identity. Both trust only
//! the root CA.

use std::path::Path;

use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};
use zeroize::Zeroizing;

use super::TransportError;
use crate::pki::{parse_pem, LeafIdentity};

fn check_pem(label: &str, pem: &str) -> Result<(), TransportError> {
    parse_pem(pem)
        .map(|_| ())
        .map_err(|e| TransportError::Tls(format!("{}: {}", label, e)))
}

fn read_required(path: &Path) -> Result<String, TransportError> {
    if !path.exists() {
        return Err(TransportError::MissingFile(path.to_path_buf()));
    }
    Ok(std::fs::read_to_string(path)?)
}

/// Server-side mTLS configuration
pub struct ServerMtlsConfig {
    /// Server certificate PEM
    pub server_cert_pem: String,
    /// Server private key PEM (zeroized on drop)
    pub server_key_pem: Zeroizing<String>,
    /// CA certificate PEM for verifying clients
    pub ca_cert_pem: String,
}

impl ServerMtlsConfig {
    /// Create a new server mTLS config
    pub fn new(
        server_cert_pem: String,
        server_key_pem: Zeroizing<String>,
        ca_cert_pem: String,
    ) -> Self {
        Self {
            server_cert_pem,
            server_key_pem,
            ca_cert_pem,
        }
    }

    /// Load from the node's CA, certificate, and key files.
    ///
    /// Every file must exist and hold PEM data.
    pub fn from_files(
        ca_file: &Path,
        cert_file: &Path,
        key_file: &Path,
    ) -> Result<Self, TransportError> {
        let ca_cert_pem = read_required(ca_file)?;
        let server_cert_pem = read_required(cert_file)?;
        let server_key_pem = Zeroizing::new(read_required(key_file)?);

        check_pem("CA certificate", &ca_cert_pem)?;
        check_pem("server certificate", &server_cert_pem)?;
        check_pem("server key", &server_key_pem)?;

        Ok(Self::new(server_cert_pem, server_key_pem, ca_cert_pem))
    }

    /// Build a tonic ServerTlsConfig
    pub fn to_tonic_config(&self) -> Result<ServerTlsConfig, TransportError> {
        check_pem("server certificate", &self.server_cert_pem)?;
        check_pem("CA certificate", &self.ca_cert_pem)?;

        let identity = Identity::from_pem(&self.server_cert_pem, &*self.server_key_pem);
        let ca_cert = Certificate::from_pem(&self.ca_cert_pem);

        Ok(ServerTlsConfig::new()
            .identity(identity)
            .client_ca_root(ca_cert))
    }
}

/// Client-side mTLS configuration
#[derive(Clone)]
pub struct ClientMtlsConfig {
    /// Client certificate PEM
    pub client_cert_pem: String,
    /// Client private key PEM (zeroized on drop)
    pub client_key_pem: Zeroizing<String>,
    /// CA certificate PEM for verifying server
    pub ca_cert_pem: String,
}

impl ClientMtlsConfig {
    /// Create a new client mTLS config
    pub fn new(
        client_cert_pem: String,
        client_key_pem: Zeroizing<String>,
        ca_cert_pem: String,
    ) -> Self {
        Self {
            client_cert_pem,
            client_key_pem,
            ca_cert_pem,
        }
    }

    /// Client config presenting `identity` and trusting `ca_cert_pem`
    pub fn from_identity(identity: &LeafIdentity, ca_cert_pem: &str) -> Self {
        Self::new(
            identity.cert_pem().to_string(),
            Zeroizing::new(identity.key_pem().to_string()),
            ca_cert_pem.to_string(),
        )
    }

    /// Build a tonic ClientTlsConfig expecting `server_name` on the peer certificate
    pub fn to_tonic_config(&self, server_name: &str) -> Result<ClientTlsConfig, TransportError> {
        check_pem("client certificate", &self.client_cert_pem)?;
        check_pem("CA certificate", &self.ca_cert_pem)?;

        let identity = Identity::from_pem(&self.client_cert_pem, &*self.client_key_pem);
        let ca_cert = Certificate::from_pem(&self.ca_cert_pem);

        Ok(ClientTlsConfig::new()
            .identity(identity)
            .ca_certificate(ca_cert)
            .domain_name(server_name))
    }
}
