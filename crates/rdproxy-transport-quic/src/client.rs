//! Agent-side session: register with the gateway, then serve its streams

use crate::config::QuicConfig;
use crate::stream::QuicStream;
use quinn::{Connection, Endpoint, VarInt};
use rdproxy_proto::{RegisterRequest, SessionMessage};
use rdproxy_transport::{AgentId, TransportError, TransportResult};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

const CLOSE_NORMAL: u32 = 0;

/// Opens sessions to a gateway
pub struct AgentConnector {
    client_config: quinn::ClientConfig,
}

impl AgentConnector {
    pub fn new(config: &QuicConfig) -> TransportResult<Self> {
        Ok(Self {
            client_config: config.build_client_config()?,
        })
    }

    /// Connect to `addr` and register with `request`
    ///
    /// Returns once the gateway accepted the registration. A rejection is
    /// reported as [`TransportError::RegistrationRejected`] carrying the
    /// gateway's reason.
    pub async fn connect(
        &self,
        addr: SocketAddr,
        server_name: &str,
        request: RegisterRequest,
    ) -> TransportResult<AgentSession> {
        let bind_addr = if addr.is_ipv6() {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        };
        let mut endpoint = Endpoint::client(bind_addr).map_err(TransportError::IoError)?;
        endpoint.set_default_client_config(self.client_config.clone());

        debug!("Connecting to gateway {} ({})", server_name, addr);

        let connection = endpoint
            .connect(addr, server_name)
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        let (send, recv) = connection
            .open_bi()
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;
        let mut control = QuicStream::new(send, recv);

        control
            .send_message(&SessionMessage::Register { request })
            .await?;

        let reply = control.recv_message().await;
        let _ = control.shutdown().await;

        match reply? {
            Some(SessionMessage::Registered { agent_id }) => {
                let agent_id = AgentId::from(agent_id);
                info!(agent_id = %agent_id, gateway = %addr, "Registered with gateway");
                Ok(AgentSession {
                    _endpoint: endpoint,
                    connection,
                    agent_id,
                })
            }
            Some(SessionMessage::Rejected { reason }) => {
                connection.close(VarInt::from_u32(CLOSE_NORMAL), b"registration rejected");
                Err(TransportError::RegistrationRejected(reason))
            }
            Some(other) => {
                connection.close(VarInt::from_u32(CLOSE_NORMAL), b"protocol error");
                Err(TransportError::ProtocolError(format!(
                    "Unexpected reply to registration: {:?}",
                    other
                )))
            }
            None => Err(TransportError::ConnectionError(
                "Gateway closed the session before answering".to_string(),
            )),
        }
    }
}

/// A registered session with the gateway
pub struct AgentSession {
    // Dropping the endpoint would tear the session down.
    _endpoint: Endpoint,
    connection: Connection,
    agent_id: AgentId,
}

impl AgentSession {
    /// Identifier the gateway assigned to this session
    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// Wait for the gateway to open the next virtual connection
    ///
    /// Returns `None` once the session is gone.
    pub async fn accept_stream(&self) -> Option<QuicStream> {
        match self.connection.accept_bi().await {
            Ok((send, recv)) => Some(QuicStream::new(send, recv)),
            Err(e) => {
                debug!(agent_id = %self.agent_id, "Session closed: {}", e);
                None
            }
        }
    }

    /// Resolves when the session is closed, with the reason
    pub async fn closed(&self) -> String {
        self.connection.closed().await.to_string()
    }

    pub fn close(&self) {
        self.connection
            .close(VarInt::from_u32(CLOSE_NORMAL), b"agent shutting down");
    }
}

/// A virtual connection the gateway asked this agent to open
pub struct ConnectRequest {
    stream: QuicStream,
    pub protocol: String,
    pub address: String,
}

impl ConnectRequest {
    /// Read the connect request at the head of a freshly accepted stream
    pub async fn read(mut stream: QuicStream) -> TransportResult<Self> {
        match stream.recv_message().await? {
            Some(SessionMessage::Connect { protocol, address }) => Ok(Self {
                stream,
                protocol,
                address,
            }),
            Some(other) => Err(TransportError::ProtocolError(format!(
                "Expected a connect request, got {:?}",
                other
            ))),
            None => Err(TransportError::StreamClosed),
        }
    }

    /// Confirm the connection; the stream carries raw bytes from here on
    pub async fn accept(mut self) -> TransportResult<QuicStream> {
        self.stream.send_message(&SessionMessage::Connected).await?;
        Ok(self.stream)
    }

    /// Refuse the connection, telling the gateway why
    pub async fn reject(mut self, reason: impl Into<String>) {
        let _ = self
            .stream
            .send_message(&SessionMessage::ConnectFailed {
                reason: reason.into(),
            })
            .await;
        let _ = self.stream.shutdown().await;
    }
}
