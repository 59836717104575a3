//! Node directory
//!
//! The directory is the registry of known nodes, keyed by address. Enrollment
//! consults it to decide between first registration and update, and writes
//! the outcome back. The trait is the seam for a persistent store; the crate
//! ships an in-memory implementation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Metadata key for the hostname a node last reported
pub const META_HOSTNAME: &str = "hostname";
/// Metadata key for the software version a node last reported
pub const META_VERSION: &str = "version";
/// Metadata key for the fingerprint of the last certificate issued to a node
pub const META_CERT_FINGERPRINT: &str = "cert_fingerprint";

/// Directory errors
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// A record already exists for the address
    #[error("node already exists: {0}")]
    AlreadyExists(String),

    /// No record exists for the address
    #[error("node not found: {0}")]
    NotFound(String),

    /// Backing store failure
    #[error("directory backend error: {0}")]
    Backend(String),
}

/// A known node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Unique key
    pub address: String,
    /// Display name
    pub alias: String,
    /// Port the node's RPC service listens on
    pub port: u16,
    /// Free-form operator note
    pub remark: String,
    /// Reported hostname, version, and pinned fingerprint
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl NodeRecord {
    /// Fingerprint recorded at the node's last issuance, if any
    pub fn cert_fingerprint(&self) -> Option<&str> {
        self.metadata.get(META_CERT_FINGERPRINT).map(String::as_str)
    }
}

/// Registry of nodes keyed by address
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Directory: Send + Sync {
    /// Look up a node by address
    async fn find(&self, address: &str) -> Result<Option<NodeRecord>, DirectoryError>;

    /// Insert a new node; fails if the address is taken
    async fn create(&self, record: NodeRecord) -> Result<(), DirectoryError>;

    /// Replace an existing node; fails if the address is unknown
    async fn update(&self, record: NodeRecord) -> Result<(), DirectoryError>;
}

/// Process-local directory backed by a concurrent map
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    nodes: DashMap<String, NodeRecord>,
}

impl InMemoryDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of known nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if the directory is empty
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Snapshot of one record
    pub fn get(&self, address: &str) -> Option<NodeRecord> {
        self.nodes.get(address).map(|r| r.value().clone())
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn find(&self, address: &str) -> Result<Option<NodeRecord>, DirectoryError> {
        Ok(self.get(address))
    }

    async fn create(&self, record: NodeRecord) -> Result<(), DirectoryError> {
        use dashmap::mapref::entry::Entry;

        match self.nodes.entry(record.address.clone()) {
            Entry::Occupied(_) => Err(DirectoryError::AlreadyExists(record.address)),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
        }
    }

    async fn update(&self, record: NodeRecord) -> Result<(), DirectoryError> {
        match self.nodes.get_mut(&record.address) {
            Some(mut existing) => {
                *existing = record;
                Ok(())
            }
            None => Err(DirectoryError::NotFound(record.address)),
        }
    }
}
