//! Keystone - trust bootstrap for a fleet controller and its nodes
//!
//! Keystone turns an unauthenticated node into one that holds a certificate
//! chained to the controller's root CA, and then keeps one long-lived mutually
//! authenticated channel per node.
//!
//! # Architecture
//!
//! - The controller owns a self-signed root CA, created once and persisted
//! - Nodes enroll over HTTPS, first with a shared bootstrap token, later with
//!   the fingerprint of the certificate they were issued
//! - Nodes re-enroll on a fixed heartbeat, which doubles as a liveness signal
//! - The controller dials nodes through a pool that holds one channel per address
//!
//! # Modules
//!
//! - [`pki`] - Root CA, leaf issuance, certificate inspection
//! - [`enrollment`] - Controller-side enrollment service and HTTP routes
//! - [`controller`] - Controller startup: advertised address and HTTPS identity
//! - [`node`] - Node-side enrollment client and heartbeat
//! - [`directory`] - Registry of known nodes
//! - [`transport`] - mTLS configuration and the connection pool
//! - [`error`] - Crate-level error type

#![deny(missing_docs)]

pub mod controller;
pub mod directory;
pub mod enrollment;
pub mod error;
pub mod node;
pub mod pki;
pub mod transport;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Default port for the controller's enrollment HTTPS server
pub const DEFAULT_CONTROLLER_PORT: u16 = 5920;

/// Default port for a node's RPC service
///
/// Provisioned nodes are recorded with this port, and pooled connections use
/// it when an address carries no port.
pub const DEFAULT_NODE_PORT: u16 = 5921;
