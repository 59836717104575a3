//! Mutually authenticated RPC transport
//!
//! - [`mtls`]: tonic TLS configs built from CA-issued material
//! - [`pool`]: one long-lived channel per node address

pub mod mtls;
pub mod pool;

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::DEFAULT_NODE_PORT;

pub use mtls::{ClientMtlsConfig, ServerMtlsConfig};
pub use pool::{ConnectionPool, DialSettings, Dialer, MtlsDialer, ReconnectBackoff};

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// Address cannot be turned into a host and port
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// A required TLS file is absent
    #[error("missing TLS file: {}", .0.display())]
    MissingFile(PathBuf),

    /// TLS material is unusable
    #[error("TLS configuration error: {0}")]
    Tls(String),

    /// Connecting to the peer failed
    #[error("failed to connect to {address}: {reason}")]
    Dial {
        /// Peer address
        address: String,
        /// Underlying failure
        reason: String,
    },

    /// A recent dial failed and the retry window has not elapsed
    #[error("reconnect to {address} backing off for {retry_in:?}")]
    Backoff {
        /// Peer address
        address: String,
        /// Time until the next dial is allowed
        retry_in: Duration,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Expected TLS server name for an address: its host portion.
///
/// Accepts `host`, `host:port`, `ip`, `ip:port` and `[ipv6]:port`.
pub fn server_name_for(address: &str) -> Result<String, TransportError> {
    let address = address.trim();
    if address.is_empty() {
        return Err(TransportError::InvalidAddress(address.to_string()));
    }
    if let Ok(socket) = address.parse::<SocketAddr>() {
        return Ok(socket.ip().to_string());
    }
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip.to_string());
    }

    let host = match address.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => host,
        Some(_) => return Err(TransportError::InvalidAddress(address.to_string())),
        None => address,
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(TransportError::InvalidAddress(address.to_string()));
    }
    Ok(host.to_string())
}

/// `https://` URI for an address, defaulting the port to the node port
pub fn endpoint_uri(address: &str) -> Result<String, TransportError> {
    let address = address.trim();
    if let Ok(socket) = address.parse::<SocketAddr>() {
        return Ok(format!("https://{}", socket));
    }
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(format!("https://{}", SocketAddr::new(ip, DEFAULT_NODE_PORT)));
    }

    let host = server_name_for(address)?;
    if address.len() > host.len() {
        Ok(format!("https://{}", address))
    } else {
        Ok(format!("https://{}:{}", host, DEFAULT_NODE_PORT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_name_strips_port_and_brackets() {
        assert_eq!(server_name_for("10.0.0.5:5921").unwrap(), "10.0.0.5");
        assert_eq!(server_name_for("[::1]:5921").unwrap(), "::1");
        assert_eq!(server_name_for("::1").unwrap(), "::1");
        assert_eq!(server_name_for("node-a.internal:7000").unwrap(), "node-a.internal");
        assert_eq!(server_name_for("node-a").unwrap(), "node-a");
    }

    #[test]
    fn server_name_rejects_garbage() {
        assert!(matches!(
            server_name_for(""),
            Err(TransportError::InvalidAddress(_))
        ));
        assert!(matches!(
            server_name_for("node-a:http"),
            Err(TransportError::InvalidAddress(_))
        ));
        assert!(matches!(
            server_name_for(":5921"),
            Err(TransportError::InvalidAddress(_))
        ));
    }

    #[test]
    fn endpoint_uri_defaults_node_port() {
        assert_eq!(endpoint_uri("10.0.0.5").unwrap(), "https://10.0.0.5:5921");
        assert_eq!(endpoint_uri("10.0.0.5:7000").unwrap(), "https://10.0.0.5:7000");
        assert_eq!(endpoint_uri("::1").unwrap(), "https://[::1]:5921");
        assert_eq!(endpoint_uri("node-a").unwrap(), "https://node-a:5921");
        assert_eq!(endpoint_uri("node-a:7000").unwrap(), "https://node-a:7000");
    }
}
