//! Transport abstraction consumed by the relay core
//!
//! The relay logic never talks to a concrete tunnel implementation. It only
//! needs a pool of live agent sessions that can be listed and dialed, and a
//! byte stream type for the resulting virtual connections.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     rdproxy-relay                       │
//! │      (selector with retry, proxy listener, relay)       │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Uses traits
//!                           ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │            rdproxy-transport (this crate)               │
//! │        AgentPool  -  AgentId  -  VirtualConn            │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Implemented by
//!                           ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │               rdproxy-transport-quic                    │
//! └─────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Agent {0} is not connected")]
    UnknownAgent(AgentId),

    #[error("Agent refused connection: {0}")]
    DialRejected(String),

    #[error("Registration rejected: {0}")]
    RegistrationRejected(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Failed to bind to {address}: {reason}")]
    BindError { address: String, reason: String },
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Opaque identifier of one live agent session
///
/// Unique among live sessions only. An agent that reconnects gets a new
/// identifier and nothing ties it to its previous session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for AgentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for AgentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// A duplex byte stream: a plain socket or a virtual connection to an agent
///
/// The relay treats every implementor the same way; nothing in the relay
/// path can tell a tunneled stream from a TCP socket.
pub trait VirtualConn: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> VirtualConn for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// The set of currently registered agents, as seen by the gateway
///
/// Membership is owned by the transport: sessions are added when an agent
/// registers and removed when its connection is lost. Consumers only read
/// snapshots and dial.
#[async_trait]
pub trait AgentPool: Send + Sync + 'static {
    /// The virtual connection type produced by `dial`
    type Conn: VirtualConn;

    /// Snapshot of the live agents
    ///
    /// The snapshot may already be stale when it is used: an agent can
    /// disconnect between listing and dialing.
    fn list_agents(&self) -> Vec<AgentId>;

    /// Open a virtual connection through `agent` to `address`
    ///
    /// `protocol` and `address` are interpreted by the agent, which dials
    /// them on its side of the tunnel.
    async fn dial(
        &self,
        agent: &AgentId,
        protocol: &str,
        address: &str,
    ) -> TransportResult<Self::Conn>;
}
