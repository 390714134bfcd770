//! Protocol message types

use serde::{Deserialize, Serialize};

/// Handshake messages exchanged at the head of a tunnel stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum SessionMessage {
    // Registration (first stream of a session, agent -> gateway)
    Register {
        request: RegisterRequest,
    },
    Registered {
        agent_id: String,
    },
    Rejected {
        reason: String,
    },

    // Virtual connections (gateway -> agent)
    Connect {
        protocol: String,
        address: String,
    },
    Connected,
    ConnectFailed {
        reason: String,
    },
}

/// An HTTP-shaped registration request
///
/// Carried over the tunnel session so the gateway can route it and gate it
/// with the same authorizer an HTTP upgrade endpoint would use.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegisterRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub metadata: AgentMetadata,
}

impl RegisterRequest {
    /// Build a `GET` registration request for `path`
    pub fn new(path: impl Into<String>, metadata: AgentMetadata) -> Self {
        Self {
            method: "GET".to_string(),
            path: path.into(),
            headers: Vec::new(),
            metadata,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Descriptive information an agent reports when registering
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentMetadata {
    pub name: String,
    pub hostname: String,
    pub version: String,
}
