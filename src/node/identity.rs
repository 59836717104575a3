//! Host identity discovery

use std::net::{IpAddr, Ipv4Addr};

use super::NodeError;

/// Source of the hostname and address a node enrolls under
#[cfg_attr(test, mockall::automock)]
pub trait IdentitySource: Send + Sync {
    /// Local hostname
    fn hostname(&self) -> Result<String, NodeError>;

    /// First non-loopback IPv4 address
    fn primary_ipv4(&self) -> Result<Ipv4Addr, NodeError>;
}

/// Reads identity from the operating system
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemIdentity;

impl IdentitySource for SystemIdentity {
    fn hostname(&self) -> Result<String, NodeError> {
        hostname::get()?
            .into_string()
            .map_err(|_| NodeError::MissingIdentity("hostname is not valid UTF-8".to_string()))
    }

    fn primary_ipv4(&self) -> Result<Ipv4Addr, NodeError> {
        let interfaces = local_ip_address::list_afinet_netifas()
            .map_err(|e| NodeError::MissingIdentity(format!("cannot list interfaces: {}", e)))?;

        first_non_loopback_v4(interfaces.into_iter().map(|(_, ip)| ip)).ok_or_else(|| {
            NodeError::MissingIdentity("no non-loopback IPv4 address".to_string())
        })
    }
}

fn first_non_loopback_v4(addresses: impl IntoIterator<Item = IpAddr>) -> Option<Ipv4Addr> {
    addresses.into_iter().find_map(|ip| match ip {
        IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_unspecified() => Some(v4),
        _ => None,
    })
}

/// Fixed identity, for operators who advertise an explicit address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticIdentity {
    /// Hostname to report
    pub hostname: String,
    /// Address to report
    pub address: Ipv4Addr,
}

impl IdentitySource for StaticIdentity {
    fn hostname(&self) -> Result<String, NodeError> {
        Ok(self.hostname.clone())
    }

    fn primary_ipv4(&self) -> Result<Ipv4Addr, NodeError> {
        Ok(self.address)
    }
}
