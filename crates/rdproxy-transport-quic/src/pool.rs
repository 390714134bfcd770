//! Registry of live agent sessions held by the gateway

use crate::stream::QuicStream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdproxy_proto::{AgentMetadata, SessionMessage};
use rdproxy_transport::{AgentId, AgentPool, TransportError, TransportResult};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{PoisonError, RwLock};
use tracing::{debug, info, warn};

/// One registered agent session
#[derive(Debug, Clone)]
pub struct RegisteredSession {
    pub agent_id: AgentId,
    pub metadata: AgentMetadata,
    pub remote_addr: SocketAddr,
    pub connected_at: DateTime<Utc>,
    connection: quinn::Connection,
}

impl RegisteredSession {
    pub fn new(agent_id: AgentId, metadata: AgentMetadata, connection: quinn::Connection) -> Self {
        Self {
            agent_id,
            metadata,
            remote_addr: connection.remote_address(),
            connected_at: Utc::now(),
            connection,
        }
    }

    /// Close the session from the gateway side
    ///
    /// The session server drops it from the pool once the close completes.
    pub fn disconnect(&self, reason: &str) {
        self.connection
            .close(quinn::VarInt::from_u32(0), reason.as_bytes());
    }
}

/// Agent pool backed by QUIC connections
///
/// Sessions are inserted by the session server once registration is
/// authorized and removed when their connection is lost.
#[derive(Debug, Default)]
pub struct QuicAgentPool {
    sessions: RwLock<HashMap<AgentId, RegisteredSession>>,
}

impl QuicAgentPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, session: RegisteredSession) {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);

        info!(
            agent_id = %session.agent_id,
            name = %session.metadata.name,
            hostname = %session.metadata.hostname,
            remote = %session.remote_addr,
            "Registered agent"
        );

        if let Some(replaced) = sessions.insert(session.agent_id.clone(), session) {
            // Identifiers are generated per session, so this should never fire.
            warn!(agent_id = %replaced.agent_id, "Replaced an existing session");
        }
    }

    pub(crate) fn remove(&self, agent_id: &AgentId) -> Option<RegisteredSession> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let session = sessions.remove(agent_id);

        if session.is_some() {
            info!(agent_id = %agent_id, remaining = sessions.len(), "Unregistered agent");
        }

        session
    }

    /// Look up one session
    pub fn get(&self, agent_id: &AgentId) -> Option<RegisteredSession> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(agent_id)
            .cloned()
    }

    /// All live sessions
    pub fn sessions(&self) -> Vec<RegisteredSession> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AgentPool for QuicAgentPool {
    type Conn = QuicStream;

    fn list_agents(&self) -> Vec<AgentId> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    async fn dial(
        &self,
        agent: &AgentId,
        protocol: &str,
        address: &str,
    ) -> TransportResult<QuicStream> {
        let connection = self
            .get(agent)
            .map(|session| session.connection)
            .ok_or_else(|| TransportError::UnknownAgent(agent.clone()))?;

        let (send, recv) = connection
            .open_bi()
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;
        let mut stream = QuicStream::new(send, recv);

        debug!(
            agent_id = %agent,
            stream_id = stream.stream_id(),
            protocol = %protocol,
            address = %address,
            "Opening virtual connection"
        );

        stream
            .send_message(&SessionMessage::Connect {
                protocol: protocol.to_string(),
                address: address.to_string(),
            })
            .await?;

        match stream.recv_message().await? {
            Some(SessionMessage::Connected) => Ok(stream),
            Some(SessionMessage::ConnectFailed { reason }) => {
                Err(TransportError::DialRejected(reason))
            }
            Some(other) => Err(TransportError::ProtocolError(format!(
                "Unexpected reply to connect: {:?}",
                other
            ))),
            None => Err(TransportError::StreamClosed),
        }
    }
}
