//! Controller startup
//!
//! The controller serves enrollment over HTTPS with a leaf issued by its own
//! root CA. Nodes reach it by the advertised address, so that address and the
//! controller's hostname both end up in the certificate's SANs.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{info, warn};

use crate::node::IdentitySource;
use crate::pki::{LeafIdentity, PkiError, RootCa};
use crate::{Error, Result};

/// Address written into the controller's server certificate
///
/// An operator-supplied value wins. Otherwise a concrete listen IP is used,
/// and a wildcard listener falls back to the host's primary IPv4.
pub fn advertise_address(
    listen: SocketAddr,
    configured: Option<&str>,
    identity: &dyn IdentitySource,
) -> Result<String> {
    if let Some(address) = configured {
        let address = address.trim();
        if address.is_empty() || address.contains(char::is_whitespace) {
            return Err(Error::config(format!(
                "invalid advertise address {:?}",
                address
            )));
        }
        return Ok(address.to_string());
    }

    if !listen.ip().is_unspecified() {
        return Ok(listen.ip().to_string());
    }

    match identity.primary_ipv4() {
        Ok(ip) => Ok(ip.to_string()),
        Err(e) => {
            let hostname = identity.hostname()?;
            warn!(
                error = %e,
                hostname = %hostname,
                "No IPv4 address to advertise, nodes must reach the controller by hostname \
                 or set --advertise-address"
            );
            Ok(hostname)
        }
    }
}

/// Issue the controller's HTTPS identity from the root CA
pub async fn server_identity(
    ca: Arc<RootCa>,
    listen: SocketAddr,
    configured: Option<&str>,
    identity: &dyn IdentitySource,
) -> Result<LeafIdentity> {
    let address = advertise_address(listen, configured, identity)?;
    let hostname = identity
        .hostname()
        .unwrap_or_else(|_| "localhost".to_string());

    info!(address = %address, hostname = %hostname, "Issuing controller server certificate");
    let leaf = tokio::task::spawn_blocking(move || ca.issue_server_identity(&address, &hostname))
        .await
        .map_err(|e| PkiError::TaskFailed(e.to_string()))??;
    Ok(leaf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{MockIdentitySource, NodeError, StaticIdentity};
    use crate::pki::{test_ca, CertificateInfo};
    use std::net::{IpAddr, Ipv4Addr};

    fn host() -> StaticIdentity {
        StaticIdentity {
            hostname: "ctrl-1".to_string(),
            address: Ipv4Addr::new(192, 168, 7, 10),
        }
    }

    fn wildcard() -> SocketAddr {
        "0.0.0.0:5920".parse().unwrap()
    }

    #[test]
    fn configured_address_wins() {
        let address = advertise_address(wildcard(), Some(" ctrl.example "), &host()).unwrap();
        assert_eq!(address, "ctrl.example");
    }

    #[test]
    fn blank_configured_address_is_a_config_error() {
        let err = advertise_address(wildcard(), Some("  "), &host()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("configuration error"));
    }

    #[test]
    fn concrete_listen_ip_is_advertised() {
        let listen = "10.1.2.3:5920".parse().unwrap();
        assert_eq!(advertise_address(listen, None, &host()).unwrap(), "10.1.2.3");
    }

    #[test]
    fn wildcard_listener_advertises_primary_ipv4() {
        assert_eq!(
            advertise_address(wildcard(), None, &host()).unwrap(),
            "192.168.7.10"
        );
    }

    #[test]
    fn wildcard_without_ipv4_falls_back_to_hostname() {
        let mut identity = MockIdentitySource::new();
        identity
            .expect_primary_ipv4()
            .returning(|| Err(NodeError::MissingIdentity("no interfaces".to_string())));
        identity
            .expect_hostname()
            .returning(|| Ok("ctrl-1".to_string()));

        assert_eq!(
            advertise_address(wildcard(), None, &identity).unwrap(),
            "ctrl-1"
        );
    }

    /// Story: A controller on the default wildcard listener is reachable by IP
    ///
    /// Nodes pointed at `https://<controller-ip>:5920` verify the controller's
    /// certificate without any extra flags, and the hostname still matches.
    #[tokio::test]
    async fn story_default_controller_cert_covers_ip_and_hostname() {
        let leaf = server_identity(test_ca(), wildcard(), None, &host())
            .await
            .unwrap();

        let info = CertificateInfo::from_pem(leaf.cert_pem()).unwrap();
        assert_eq!(info.common_name, "192.168.7.10");
        assert!(info
            .ip_addresses
            .contains(&IpAddr::V4(Ipv4Addr::new(192, 168, 7, 10))));
        assert!(info.dns_names.iter().any(|n| n == "ctrl-1"));
        assert!(info.server_auth);
    }
}
