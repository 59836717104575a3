//! Connection pool for controller-to-node channels
//!
//! The pool keeps at most one live channel per node address. Lookups take a
//! shared lock; a miss takes the exclusive lock, re-checks, dials, and inserts
//! before releasing it, so racing callers for one address share a single dial.
//!
//! A failed dial starts a per-address reconnect backoff. Until it elapses,
//! `get` fails fast instead of dialing again. The delay doubles with each
//! consecutive failure up to [`ReconnectBackoff::max`] and resets on success.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info, warn};

use super::{endpoint_uri, server_name_for, ClientMtlsConfig, TransportError};
use crate::pki::RootCa;

/// Opens channels to node addresses
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Channel handle; clones share the underlying connection
    type Channel: Clone + Send + Sync + 'static;

    /// Open a channel to `address`
    async fn dial(&self, address: &str) -> Result<Self::Channel, TransportError>;
}

/// Connection parameters for [`MtlsDialer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialSettings {
    /// Upper bound on establishing a connection
    pub connect_timeout: Duration,
    /// Interval between HTTP/2 keep-alive pings
    pub keepalive_interval: Duration,
    /// Time to wait for a ping acknowledgement
    pub keepalive_timeout: Duration,
}

impl Default for DialSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            keepalive_interval: Duration::from_secs(20),
            keepalive_timeout: Duration::from_secs(3),
        }
    }
}

/// Delay before re-dialing an address whose last dial failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectBackoff {
    /// Delay after the first failure
    pub initial: Duration,
    /// Ceiling for the doubled delay
    pub max: Duration,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(3),
        }
    }
}

impl ReconnectBackoff {
    /// Delay after `failures` consecutive failed dials
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.initial
            .saturating_mul(1u32 << exponent)
            .min(self.max)
    }
}

/// Dials nodes over mutually authenticated TLS with the controller identity
pub struct MtlsDialer {
    tls: ClientMtlsConfig,
    settings: DialSettings,
}

impl MtlsDialer {
    /// Dialer presenting the CA's controller identity
    pub fn new(ca: &RootCa, settings: DialSettings) -> Self {
        Self {
            tls: ClientMtlsConfig::from_identity(ca.client_identity(), ca.ca_cert_pem()),
            settings,
        }
    }

    /// Dialer with explicit TLS material
    pub fn with_tls(tls: ClientMtlsConfig, settings: DialSettings) -> Self {
        Self { tls, settings }
    }

    /// Build the endpoint for `address` without connecting
    pub fn endpoint(&self, address: &str) -> Result<Endpoint, TransportError> {
        let server_name = server_name_for(address)?;
        let uri = endpoint_uri(address)?;
        let tls_config = self.tls.to_tonic_config(&server_name)?;

        Endpoint::from_shared(uri)
            .map_err(|e| TransportError::InvalidAddress(format!("{}: {}", address, e)))?
            .connect_timeout(self.settings.connect_timeout)
            .keep_alive_while_idle(true)
            .http2_keep_alive_interval(self.settings.keepalive_interval)
            .keep_alive_timeout(self.settings.keepalive_timeout)
            .tls_config(tls_config)
            .map_err(|e| TransportError::Tls(e.to_string()))
    }
}

#[async_trait]
impl Dialer for MtlsDialer {
    type Channel = Channel;

    async fn dial(&self, address: &str) -> Result<Channel, TransportError> {
        let endpoint = self.endpoint(address)?;
        endpoint.connect().await.map_err(|e| TransportError::Dial {
            address: address.to_string(),
            reason: e.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct DialFailure {
    failures: u32,
    retry_at: Instant,
}

struct PoolState<C> {
    channels: HashMap<String, C>,
    failures: HashMap<String, DialFailure>,
}

/// One channel per node address, created on demand
pub struct ConnectionPool<D: Dialer> {
    dialer: D,
    backoff: ReconnectBackoff,
    state: RwLock<PoolState<D::Channel>>,
}

impl<D: Dialer> ConnectionPool<D> {
    /// Create an empty pool with the default reconnect backoff
    pub fn new(dialer: D) -> Self {
        Self::with_backoff(dialer, ReconnectBackoff::default())
    }

    /// Create an empty pool
    pub fn with_backoff(dialer: D, backoff: ReconnectBackoff) -> Self {
        Self {
            dialer,
            backoff,
            state: RwLock::new(PoolState {
                channels: HashMap::new(),
                failures: HashMap::new(),
            }),
        }
    }

    /// Get the channel for `address`, dialing on first use
    pub async fn get(&self, address: &str) -> Result<D::Channel, TransportError> {
        if let Some(channel) = self.state.read().await.channels.get(address) {
            return Ok(channel.clone());
        }

        let mut state = self.state.write().await;
        if let Some(channel) = state.channels.get(address) {
            return Ok(channel.clone());
        }

        let now = Instant::now();
        if let Some(failure) = state.failures.get(address) {
            if now < failure.retry_at {
                return Err(TransportError::Backoff {
                    address: address.to_string(),
                    retry_in: failure.retry_at - now,
                });
            }
        }

        match self.dialer.dial(address).await {
            Ok(channel) => {
                state.failures.remove(address);
                state
                    .channels
                    .insert(address.to_string(), channel.clone());
                info!(address = %address, "Opened pooled connection");
                Ok(channel)
            }
            Err(e) => {
                let failures = state
                    .failures
                    .get(address)
                    .map(|f| f.failures + 1)
                    .unwrap_or(1);
                let delay = self.backoff.delay(failures);
                state.failures.insert(
                    address.to_string(),
                    DialFailure {
                        failures,
                        retry_at: Instant::now() + delay,
                    },
                );
                warn!(address = %address, error = %e, retry_in = ?delay, "Dial failed");
                Err(e)
            }
        }
    }

    /// Drop the channel for `address`; a no-op if none is pooled
    pub async fn release(&self, address: &str) -> bool {
        let removed = self.state.write().await.channels.remove(address);
        if removed.is_some() {
            debug!(address = %address, "Released pooled connection");
        }
        removed.is_some()
    }

    /// Whether a channel is pooled for `address`
    pub async fn contains(&self, address: &str) -> bool {
        self.state.read().await.channels.contains_key(address)
    }

    /// Number of pooled channels
    pub async fn len(&self) -> usize {
        self.state.read().await.channels.len()
    }

    /// Check if the pool is empty
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Pool of tonic channels for the controller
pub type NodeChannelPool = ConnectionPool<MtlsDialer>;
