//! PKI operations for the controller's root of trust
//!
//! The controller owns exactly one root CA. It signs two kinds of leaf:
//!
//! - **Server identities** for nodes, bound to the node's address and hostname.
//!   They carry both server-auth and client-auth usage so the node presents the
//!   same certificate whichever side dials.
//! - **The controller identity**, client-auth only, which the controller uses
//!   to dial nodes through the connection pool.
//!
//! # Storage
//!
//! CA material lives in a fixed per-installation directory:
//!
//! ```text
//! <ca-dir>/ca.crt      CA certificate
//! <ca-dir>/ca.key      CA private key
//! <ca-dir>/client.crt  controller identity certificate
//! <ca-dir>/client.key  controller identity key
//! ```
//!
//! All files are written owner-only (0600) inside an owner-only directory (0700).

use std::fs;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, RsaKeySize, SanType,
    SerialNumber, PKCS_RSA_SHA256,
};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};
use zeroize::Zeroizing;

/// Validity period for the CA and every leaf it issues (10 years)
pub const VALIDITY_YEARS: i64 = 10;

/// Common name of the root CA certificate
pub const CA_COMMON_NAME: &str = "Keystone Root CA";

/// Common name of the controller's dialing identity
pub const CONTROLLER_COMMON_NAME: &str = "Keystone Controller";

const ORGANIZATION: &str = "Keystone";
const NODE_ORGANIZATION: &str = "Keystone Node";

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Certificate parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),

    /// Background task running CA work did not complete
    #[error("CA task failed: {0}")]
    TaskFailed(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Parse PEM-encoded data and return the DER bytes
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

/// Fingerprint of a PEM-encoded certificate: lowercase hex SHA-256 of the PEM bytes.
///
/// Nodes send this as their signature-mode credential, so it is computed over
/// the exact bytes persisted on disk rather than the DER contents.
pub fn fingerprint(cert_pem: &str) -> String {
    use aws_lc_rs::digest::{digest, SHA256};
    hex::encode(digest(&SHA256, cert_pem.as_bytes()).as_ref())
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Compute the (not_before, not_after) window starting now
fn compute_validity() -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    let not_after = now + ::time::Duration::days(VALIDITY_YEARS * 365);
    (now, not_after)
}

fn generate_key_pair() -> Result<KeyPair> {
    KeyPair::generate_rsa_for(&PKCS_RSA_SHA256, RsaKeySize::_2048)
        .map_err(|e| PkiError::KeyGenerationFailed(e.to_string()))
}

fn distinguished_name(common_name: &str, organization: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(organization.to_string()),
    );
    dn
}

fn dns_name(name: &str) -> Result<SanType> {
    Ia5String::try_from(name.to_string())
        .map(SanType::DnsName)
        .map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("invalid DNS name '{}': {}", name, e))
        })
}

/// Write a file readable only by its owner
pub(crate) fn write_private_file(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()?;

    // mode() only applies when the file is created
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// Create a directory (and parents) accessible only by its owner
pub(crate) fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir)
}

/// Locations of the CA material on disk
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaPaths {
    dir: PathBuf,
}

impl CaPaths {
    /// Use the given directory for CA material
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `$HOME/.keystone/ca`, or `./.keystone/ca` when no home directory is known
    pub fn default_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".keystone")
            .join("ca")
    }

    /// The CA directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the CA certificate
    pub fn ca_cert(&self) -> PathBuf {
        self.dir.join("ca.crt")
    }

    /// Path of the CA private key
    pub fn ca_key(&self) -> PathBuf {
        self.dir.join("ca.key")
    }

    /// Path of the controller identity certificate
    pub fn client_cert(&self) -> PathBuf {
        self.dir.join("client.crt")
    }

    /// Path of the controller identity key
    pub fn client_key(&self) -> PathBuf {
        self.dir.join("client.key")
    }
}

impl Default for CaPaths {
    fn default() -> Self {
        Self::new(Self::default_dir())
    }
}

/// A signed leaf certificate and its private key
#[derive(Clone)]
pub struct LeafIdentity {
    cert_pem: String,
    key_pem: Zeroizing<String>,
}

impl LeafIdentity {
    /// Wrap an existing certificate and key
    pub fn new(cert_pem: String, key_pem: Zeroizing<String>) -> Self {
        Self { cert_pem, key_pem }
    }

    /// Certificate in PEM format
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Private key in PEM format
    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// Fingerprint of the certificate
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.cert_pem)
    }

    /// Split into certificate and key
    pub fn into_parts(self) -> (String, Zeroizing<String>) {
        (self.cert_pem, self.key_pem)
    }
}

impl std::fmt::Debug for LeafIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafIdentity")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

/// CA key material plus the serial counter for leaves it signs
struct CaSigner {
    /// CA key pair serialized as PEM (KeyPair isn't Clone, so it is reloaded per signature)
    ca_key_pem: Zeroizing<String>,
    /// PEM-encoded CA certificate for distribution
    ca_cert_pem: String,
    /// Last serial handed out, in Unix seconds
    last_serial: AtomicU64,
}

impl CaSigner {
    fn self_signed() -> Result<Self> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(CA_COMMON_NAME, ORGANIZATION);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.serial_number = Some(SerialNumber::from(1u64));

        let (not_before, not_after) = compute_validity();
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair = generate_key_pair()?;
        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
        })?;

        Ok(Self {
            ca_key_pem: Zeroizing::new(key_pair.serialize_pem()),
            ca_cert_pem: cert.pem(),
            last_serial: AtomicU64::new(0),
        })
    }

    fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to parse CA key: {}", e)))?;

        let info = CertificateInfo::from_pem(cert_pem)?;
        if !info.is_ca {
            return Err(PkiError::ParseError(
                "stored CA certificate is not a CA".to_string(),
            ));
        }

        Ok(Self {
            ca_key_pem: Zeroizing::new(key_pem.to_string()),
            ca_cert_pem: cert_pem.to_string(),
            last_serial: AtomicU64::new(0),
        })
    }

    /// Next leaf serial: current Unix seconds, bumped past the previous serial
    fn next_serial(&self) -> u64 {
        let now = unix_now();
        let previous = self
            .last_serial
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        now.max(previous + 1)
    }

    fn sign(&self, mut params: CertificateParams) -> Result<LeafIdentity> {
        params.serial_number = Some(SerialNumber::from(self.next_serial()));
        let (not_before, not_after) = compute_validity();
        params.not_before = not_before;
        params.not_after = not_after;
        params.use_authority_key_identifier_extension = true;

        let key_pair = generate_key_pair()?;

        let ca_key = KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to load CA key: {}", e)))?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;

        let cert = params.signed_by(&key_pair, &issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to sign certificate: {}", e))
        })?;

        Ok(LeafIdentity::new(
            cert.pem(),
            Zeroizing::new(key_pair.serialize_pem()),
        ))
    }
}

fn server_identity_params(address: &str, hostname: &str) -> Result<CertificateParams> {
    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(address, NODE_ORGANIZATION);
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];

    let hostname = hostname.trim();
    let mut sans = Vec::new();
    if !hostname.is_empty() && hostname != "localhost" {
        sans.push(dns_name(hostname)?);
    }
    sans.push(dns_name("localhost")?);

    let loopback_v4 = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let loopback_v6 = IpAddr::V6(Ipv6Addr::LOCALHOST);
    if let Ok(ip) = address.trim().parse::<IpAddr>() {
        if ip != loopback_v4 && ip != loopback_v6 {
            sans.push(SanType::IpAddress(ip));
        }
    }
    sans.push(SanType::IpAddress(loopback_v4));
    sans.push(SanType::IpAddress(loopback_v6));
    params.subject_alt_names = sans;

    Ok(params)
}

fn client_identity_params() -> CertificateParams {
    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(CONTROLLER_COMMON_NAME, ORGANIZATION);
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
    params
}

/// The controller's root certificate authority
///
/// Construct once at startup (see [`RootCaCell`]) and share by `Arc`. All
/// issuance methods take `&self` and may run concurrently.
pub struct RootCa {
    signer: CaSigner,
    client_identity: LeafIdentity,
}

impl RootCa {
    /// Create a fresh in-memory CA with an in-memory controller identity.
    ///
    /// Nothing is persisted; use [`RootCa::load_or_create`] for an installation.
    pub fn generate() -> Result<Self> {
        let signer = CaSigner::self_signed()?;
        let client_identity = signer.sign(client_identity_params())?;
        Ok(Self {
            signer,
            client_identity,
        })
    }

    /// Load the CA from `paths`, or create and persist a new one.
    ///
    /// Missing or unreadable material is replaced by a fresh CA. The controller
    /// identity is checked on every load and reissued when absent or not
    /// signed by this CA. Any write failure is returned: without a persisted
    /// trust root the controller cannot operate.
    pub fn load_or_create(paths: &CaPaths) -> Result<Self> {
        let loaded = match Self::read_signer(paths) {
            Ok(signer) => signer,
            Err(e) => {
                debug!(dir = %paths.dir().display(), error = %e, "No usable CA on disk");
                None
            }
        };

        let (signer, created) = match loaded {
            Some(signer) => {
                info!(dir = %paths.dir().display(), "Loaded existing CA certificate");
                (signer, false)
            }
            None => {
                let signer = CaSigner::self_signed()?;
                create_private_dir(paths.dir())?;
                write_private_file(&paths.ca_cert(), signer.ca_cert_pem.as_bytes())?;
                write_private_file(&paths.ca_key(), signer.ca_key_pem.as_bytes())?;
                info!(dir = %paths.dir().display(), "Created new CA certificate");
                (signer, true)
            }
        };

        let client_identity = Self::ensure_client_identity(&signer, paths, created)?;

        Ok(Self {
            signer,
            client_identity,
        })
    }

    /// Read CA material, returning `None` when either file is absent
    fn read_signer(paths: &CaPaths) -> Result<Option<CaSigner>> {
        let (cert_path, key_path) = (paths.ca_cert(), paths.ca_key());
        if !cert_path.exists() || !key_path.exists() {
            return Ok(None);
        }

        let cert_pem = fs::read_to_string(&cert_path)?;
        let key_pem = Zeroizing::new(fs::read_to_string(&key_path)?);
        match CaSigner::from_pem(&cert_pem, &key_pem) {
            Ok(signer) => Ok(Some(signer)),
            Err(e) => {
                warn!(error = %e, "Failed to load existing CA, creating new one");
                Ok(None)
            }
        }
    }

    fn ensure_client_identity(
        signer: &CaSigner,
        paths: &CaPaths,
        force_reissue: bool,
    ) -> Result<LeafIdentity> {
        let (cert_path, key_path) = (paths.client_cert(), paths.client_key());

        if !force_reissue && cert_path.exists() && key_path.exists() {
            let cert_pem = fs::read_to_string(&cert_path)?;
            let key_pem = Zeroizing::new(fs::read_to_string(&key_path)?);
            let usable = KeyPair::from_pem(&key_pem).is_ok()
                && verify_leaf(&cert_pem, &signer.ca_cert_pem)
                    .map(|v| v.valid)
                    .unwrap_or(false);
            if usable {
                return Ok(LeafIdentity::new(cert_pem, key_pem));
            }
            warn!("Stored controller identity is unusable, reissuing");
        }

        let identity = signer.sign(client_identity_params())?;
        write_private_file(&cert_path, identity.cert_pem().as_bytes())?;
        write_private_file(&key_path, identity.key_pem().as_bytes())?;
        info!(dir = %paths.dir().display(), "Generated controller identity");
        Ok(identity)
    }

    /// CA certificate in PEM format (for distribution to nodes)
    pub fn ca_cert_pem(&self) -> &str {
        &self.signer.ca_cert_pem
    }

    /// The controller's own client-auth identity
    pub fn client_identity(&self) -> &LeafIdentity {
        &self.client_identity
    }

    /// Issue a node identity bound to `address` and `hostname`.
    ///
    /// Subject CN is the address. SANs cover the hostname, `localhost`, the
    /// address when it is an IP, and both loopback addresses. The leaf is valid
    /// for both server and client authentication.
    pub fn issue_server_identity(&self, address: &str, hostname: &str) -> Result<LeafIdentity> {
        let params = server_identity_params(address, hostname)?;
        self.signer.sign(params)
    }

    /// Issue a client-auth-only identity for the controller
    pub fn issue_client_identity(&self) -> Result<LeafIdentity> {
        self.signer.sign(client_identity_params())
    }
}

/// Run-once holder for the controller's [`RootCa`]
///
/// Concurrent first callers wait on a single load-or-create; every caller then
/// shares the same instance. A failed attempt leaves the cell empty so a later
/// call can retry.
pub struct RootCaCell {
    paths: CaPaths,
    cell: OnceCell<Arc<RootCa>>,
}

impl RootCaCell {
    /// Create an empty cell for the CA stored under `paths`
    pub fn new(paths: CaPaths) -> Self {
        Self {
            paths,
            cell: OnceCell::new(),
        }
    }

    /// Storage location of the CA
    pub fn paths(&self) -> &CaPaths {
        &self.paths
    }

    /// Get the CA, loading or creating it on first use
    pub async fn get(&self) -> Result<Arc<RootCa>> {
        self.cell
            .get_or_try_init(|| async {
                let paths = self.paths.clone();
                let ca = tokio::task::spawn_blocking(move || RootCa::load_or_create(&paths))
                    .await
                    .map_err(|e| PkiError::TaskFailed(e.to_string()))??;
                Ok(Arc::new(ca))
            })
            .await
            .cloned()
    }
}

/// Fields of interest from a parsed certificate
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    /// Serial number, lowercase hex
    pub serial: String,
    /// Subject common name
    pub common_name: String,
    /// DNS subject alternative names
    pub dns_names: Vec<String>,
    /// IP subject alternative names
    pub ip_addresses: Vec<IpAddr>,
    /// Whether basic constraints mark this as a CA
    pub is_ca: bool,
    /// keyCertSign key usage
    pub key_cert_sign: bool,
    /// cRLSign key usage
    pub crl_sign: bool,
    /// serverAuth extended key usage
    pub server_auth: bool,
    /// clientAuth extended key usage
    pub client_auth: bool,
    /// When the certificate becomes valid (Unix timestamp)
    pub not_before: i64,
    /// When the certificate expires (Unix timestamp)
    pub not_after: i64,
}

impl CertificateInfo {
    /// Parse certificate info from PEM-encoded certificate
    pub fn from_pem(pem_data: &str) -> Result<Self> {
        let der = parse_pem(pem_data)?;
        Self::from_der(&der)
    }

    /// Parse certificate info from DER-encoded certificate
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or("")
            .to_string();

        let mut dns_names = Vec::new();
        let mut ip_addresses = Vec::new();
        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for name in &san.value.general_names {
                match name {
                    GeneralName::DNSName(dns) => dns_names.push(dns.to_string()),
                    GeneralName::IPAddress(bytes) => {
                        if let Some(ip) = ip_from_bytes(bytes) {
                            ip_addresses.push(ip);
                        }
                    }
                    _ => {}
                }
            }
        }

        let (key_cert_sign, crl_sign) = match cert.key_usage() {
            Ok(Some(ku)) => (ku.value.key_cert_sign(), ku.value.crl_sign()),
            _ => (false, false),
        };
        let (server_auth, client_auth) = match cert.extended_key_usage() {
            Ok(Some(eku)) => (eku.value.server_auth, eku.value.client_auth),
            _ => (false, false),
        };

        Ok(Self {
            serial: hex::encode(cert.raw_serial()),
            common_name,
            dns_names,
            ip_addresses,
            is_ca: cert.is_ca(),
            key_cert_sign,
            crl_sign,
            server_auth,
            client_auth,
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
        })
    }
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(bytes).ok().map(IpAddr::from),
        _ => None,
    }
}

/// Verification result for a leaf certificate
#[derive(Debug, Clone)]
pub struct VerificationResult {
    /// Subject common name of the leaf
    pub common_name: String,
    /// Whether the certificate is valid
    pub valid: bool,
    /// Reason if invalid
    pub reason: Option<String>,
}

impl VerificationResult {
    fn invalid(reason: &str) -> Self {
        Self {
            common_name: String::new(),
            valid: false,
            reason: Some(reason.to_string()),
        }
    }
}

/// Verify a leaf was signed by the given CA and is inside its validity window
pub fn verify_leaf(cert_pem: &str, ca_cert_pem: &str) -> Result<VerificationResult> {
    let cert_der = parse_pem(cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&cert_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse leaf cert: {}", e)))?;

    let ca_der = parse_pem(ca_cert_pem)?;
    let (_, ca_cert) = X509Certificate::from_der(&ca_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse CA cert: {}", e)))?;

    if cert.verify_signature(Some(ca_cert.public_key())).is_err() {
        return Ok(VerificationResult::invalid("signature verification failed"));
    }

    let now = unix_now() as i64;
    if now < cert.validity().not_before.timestamp() {
        return Ok(VerificationResult::invalid("certificate not yet valid"));
    }
    if now > cert.validity().not_after.timestamp() {
        return Ok(VerificationResult::invalid("certificate expired"));
    }

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or("")
        .to_string();

    Ok(VerificationResult {
        common_name,
        valid: true,
        reason: None,
    })
}

/// One CA shared by the whole test binary; RSA generation is slow.
#[cfg(test)]
pub(crate) fn test_ca() -> Arc<RootCa> {
    use std::sync::LazyLock;
    static CA: LazyLock<Arc<RootCa>> =
        LazyLock::new(|| Arc::new(RootCa::generate().expect("test CA generation")));
    CA.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ca_certificate_is_a_signing_ca() {
        let ca = test_ca();
        let info = CertificateInfo::from_pem(ca.ca_cert_pem()).unwrap();

        assert!(info.is_ca);
        assert!(info.key_cert_sign);
        assert!(info.crl_sign);
        assert_eq!(info.common_name, CA_COMMON_NAME);
        assert_eq!(u64::from_str_radix(&info.serial, 16).unwrap(), 1);
    }

    #[test]
    fn ca_validity_spans_ten_years() {
        let ca = test_ca();
        let info = CertificateInfo::from_pem(ca.ca_cert_pem()).unwrap();
        let span_days = (info.not_after - info.not_before) / 86_400;
        assert_eq!(span_days, VALIDITY_YEARS * 365);
    }

    #[test]
    fn controller_identity_is_client_auth_only() {
        let ca = test_ca();
        let identity = ca.issue_client_identity().unwrap();
        let info = CertificateInfo::from_pem(identity.cert_pem()).unwrap();

        assert_eq!(info.common_name, CONTROLLER_COMMON_NAME);
        assert!(info.client_auth);
        assert!(!info.server_auth);
        assert!(!info.is_ca);
        assert!(identity.key_pem().contains("PRIVATE KEY"));
    }

    #[test]
    fn generated_ca_carries_a_controller_identity() {
        let ca = test_ca();
        let result = verify_leaf(ca.client_identity().cert_pem(), ca.ca_cert_pem()).unwrap();
        assert!(result.valid);
        assert_eq!(result.common_name, CONTROLLER_COMMON_NAME);
    }

    #[test]
    fn serials_increase_within_one_ca() {
        let ca = test_ca();
        let first = ca.issue_client_identity().unwrap();
        let second = ca.issue_client_identity().unwrap();

        let a = u64::from_str_radix(&CertificateInfo::from_pem(first.cert_pem()).unwrap().serial, 16)
            .unwrap();
        let b =
            u64::from_str_radix(&CertificateInfo::from_pem(second.cert_pem()).unwrap().serial, 16)
                .unwrap();
        assert!(b > a, "serial {} should follow {}", b, a);
        assert!(a >= unix_now() - 60);
    }

    #[test]
    fn non_ascii_hostname_is_rejected() {
        let ca = test_ca();
        let result = ca.issue_server_identity("10.0.0.9", "nöde");
        assert!(matches!(
            result,
            Err(PkiError::CertificateGenerationFailed(_))
        ));
    }

    #[test]
    fn hostname_address_gets_no_ip_san() {
        let ca = test_ca();
        let identity = ca.issue_server_identity("node-b.internal", "node-b").unwrap();
        let info = CertificateInfo::from_pem(identity.cert_pem()).unwrap();

        assert_eq!(info.common_name, "node-b.internal");
        assert_eq!(
            info.ip_addresses,
            vec![
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(Ipv6Addr::LOCALHOST)
            ]
        );
    }

    #[test]
    fn fingerprint_is_hex_sha256() {
        let ca = test_ca();
        let fp = fingerprint(ca.ca_cert_pem());
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(fp, fingerprint(ca.ca_cert_pem()));
        assert_ne!(fp, fingerprint(ca.client_identity().cert_pem()));
    }

    #[test]
    fn leaf_debug_hides_key() {
        let ca = test_ca();
        let debug = format!("{:?}", ca.client_identity());
        assert!(!debug.contains("PRIVATE KEY"));
        assert!(debug.contains("fingerprint"));
    }

    #[test]
    fn invalid_pem_is_a_parse_error() {
        match parse_pem("this is not valid PEM data at all") {
            Err(PkiError::ParseError(msg)) => assert!(msg.contains("parse PEM")),
            _ => panic!("Expected ParseError"),
        }
    }

    // ==========================================================================
    // Story Tests: Trust Root Lifecycle
    // ==========================================================================

    /// Story: A node identity is bound to its address and verifies against the CA
    ///
    /// The same leaf authenticates the node whether it serves or dials, and
    /// loopback names are present so local tooling can connect.
    #[test]
    fn story_server_identity_for_node_a() {
        let ca = test_ca();
        let identity = ca.issue_server_identity("10.0.0.5", "node-a").unwrap();

        let verification = verify_leaf(identity.cert_pem(), ca.ca_cert_pem()).unwrap();
        assert!(verification.valid);
        assert_eq!(verification.common_name, "10.0.0.5");

        let info = CertificateInfo::from_pem(identity.cert_pem()).unwrap();
        assert!(info.server_auth && info.client_auth);
        assert!(!info.is_ca);
        assert!(info.dns_names.contains(&"node-a".to_string()));
        assert!(info.dns_names.contains(&"localhost".to_string()));
        for ip in ["10.0.0.5", "127.0.0.1", "::1"] {
            let ip: IpAddr = ip.parse().unwrap();
            assert!(info.ip_addresses.contains(&ip), "missing SAN {}", ip);
        }
    }

    /// Story: A certificate from a foreign CA does not verify
    #[test]
    fn story_foreign_ca_leaf_rejected() {
        let legitimate = test_ca();
        let attacker = RootCa::generate().unwrap();

        let evil = attacker.issue_server_identity("10.0.0.66", "trojan").unwrap();
        let verification = verify_leaf(evil.cert_pem(), legitimate.ca_cert_pem()).unwrap();

        assert!(!verification.valid);
        assert!(verification
            .reason
            .unwrap()
            .contains("signature verification failed"));
    }

    /// Story: Restarting the controller reuses the same trust root
    ///
    /// The first start creates and persists the CA and the controller
    /// identity; the second loads them unchanged.
    #[test]
    fn story_load_or_create_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let paths = CaPaths::new(dir.path().join("ca"));

        let first = RootCa::load_or_create(&paths).unwrap();
        for path in [
            paths.ca_cert(),
            paths.ca_key(),
            paths.client_cert(),
            paths.client_key(),
        ] {
            assert!(path.exists(), "{} not written", path.display());
        }

        let second = RootCa::load_or_create(&paths).unwrap();
        let a = CertificateInfo::from_pem(first.ca_cert_pem()).unwrap();
        let b = CertificateInfo::from_pem(second.ca_cert_pem()).unwrap();
        assert_eq!(a.serial, b.serial);
        assert_eq!(a.common_name, b.common_name);
        assert_eq!(first.ca_cert_pem(), second.ca_cert_pem());
        assert_eq!(
            first.client_identity().cert_pem(),
            second.client_identity().cert_pem()
        );
    }

    /// Story: CA material is readable only by the controller's user
    #[cfg(unix)]
    #[test]
    fn story_ca_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let paths = CaPaths::new(dir.path().join("ca"));
        RootCa::load_or_create(&paths).unwrap();

        let dir_mode = fs::metadata(paths.dir()).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);
        for path in [paths.ca_key(), paths.client_key(), paths.ca_cert()] {
            let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600, "{}", path.display());
        }
    }

    /// Story: A deleted controller identity is reissued on the next load
    #[test]
    fn story_missing_controller_identity_is_reissued() {
        let dir = tempfile::tempdir().unwrap();
        let paths = CaPaths::new(dir.path());
        let original = RootCa::load_or_create(&paths).unwrap();

        fs::remove_file(paths.client_cert()).unwrap();
        let reloaded = RootCa::load_or_create(&paths).unwrap();

        assert!(paths.client_cert().exists());
        assert_eq!(original.ca_cert_pem(), reloaded.ca_cert_pem());
        assert_ne!(
            original.client_identity().cert_pem(),
            reloaded.client_identity().cert_pem()
        );
        let verification =
            verify_leaf(reloaded.client_identity().cert_pem(), reloaded.ca_cert_pem()).unwrap();
        assert!(verification.valid);
    }

    /// Story: Corrupted CA files are replaced instead of crashing startup
    #[test]
    fn story_corrupted_ca_is_regenerated() {
        let dir = tempfile::tempdir().unwrap();
        let paths = CaPaths::new(dir.path());
        fs::write(paths.ca_cert(), "garbage").unwrap();
        fs::write(paths.ca_key(), "garbage").unwrap();

        let ca = RootCa::load_or_create(&paths).unwrap();
        assert!(ca.ca_cert_pem().contains("BEGIN CERTIFICATE"));
        assert_eq!(fs::read_to_string(paths.ca_cert()).unwrap(), ca.ca_cert_pem());
    }

    /// Story: Concurrent early callers share one CA instance
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn story_root_ca_cell_initializes_once() {
        let dir = tempfile::tempdir().unwrap();
        let cell = Arc::new(RootCaCell::new(CaPaths::new(dir.path())));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cell = cell.clone();
            handles.push(tokio::spawn(async move { cell.get().await.unwrap() }));
        }

        let mut instances = Vec::new();
        for handle in handles {
            instances.push(handle.await.unwrap());
        }

        let first = &instances[0];
        assert!(instances.iter().all(|ca| Arc::ptr_eq(ca, first)));
        assert_eq!(
            fs::read_to_string(cell.paths().ca_cert()).unwrap(),
            first.ca_cert_pem()
        );
    }

    /// Story: A CA directory that cannot be created fails the first call
    /// without poisoning the cell
    #[tokio::test]
    async fn story_root_ca_cell_retries_after_failure() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("state");
        fs::write(&blocker, "not a directory").unwrap();
        let cell = RootCaCell::new(CaPaths::new(blocker.join("ca")));

        assert!(cell.get().await.is_err());
        assert!(!cell.paths().ca_cert().exists());

        fs::remove_file(&blocker).unwrap();
        let ca = cell.get().await.unwrap();
        assert_eq!(
            fs::read_to_string(cell.paths().ca_cert()).unwrap(),
            ca.ca_cert_pem()
        );
        assert!(Arc::ptr_eq(&ca, &cell.get().await.unwrap()));
    }
}
