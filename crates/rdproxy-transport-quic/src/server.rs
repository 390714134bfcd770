//! Gateway-side session server: accepts agent sessions and gates registration

use crate::config::QuicConfig;
use crate::pool::{QuicAgentPool, RegisteredSession};
use crate::stream::QuicStream;
use quinn::{Connection, Endpoint, VarInt};
use rdproxy_auth::{AuthError, Authorizer, Identity, REGISTRATION_PATH};
use rdproxy_proto::{RegisterRequest, SessionMessage};
use rdproxy_transport::{AgentId, TransportError, TransportResult};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long a new connection may take to send its registration request
pub const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a rejected agent gets to read the reason before the connection closes
const REJECT_LINGER: Duration = Duration::from_secs(2);

const CLOSE_SHUTDOWN: u32 = 0;
const CLOSE_REJECTED: u32 = 1;

/// Why a registration request was turned down
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("malformed registration request: {0}")]
    Malformed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Unauthorized(#[from] AuthError),
}

/// Route a registration request and run it through the authorizer
///
/// Only requests for the registration path reach the authorizer; anything
/// else is answered as not found.
pub fn authorize_registration(
    request: &RegisterRequest,
    authorizer: &dyn Authorizer,
) -> Result<Identity, RegistrationError> {
    let mut builder = http::Request::builder()
        .method(request.method.as_str())
        .uri(request.path.as_str());
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    let http_request = builder
        .body(())
        .map_err(|e| RegistrationError::Malformed(e.to_string()))?;

    if http_request.uri().path() != REGISTRATION_PATH {
        return Err(RegistrationError::NotFound(
            http_request.uri().path().to_string(),
        ));
    }

    Ok(authorizer.authorize(&http_request)?)
}

/// QUIC endpoint where agents open their sessions
pub struct SessionServer {
    endpoint: Endpoint,
    pool: Arc<QuicAgentPool>,
    authorizer: Arc<dyn Authorizer>,
}

impl SessionServer {
    pub fn bind(
        addr: SocketAddr,
        config: &QuicConfig,
        pool: Arc<QuicAgentPool>,
        authorizer: Arc<dyn Authorizer>,
    ) -> TransportResult<Self> {
        let server_config = config.build_server_config()?;

        let endpoint =
            Endpoint::server(server_config, addr).map_err(|e| TransportError::BindError {
                address: addr.to_string(),
                reason: e.to_string(),
            })?;

        let local_addr = endpoint.local_addr().map_err(TransportError::IoError)?;
        info!("Session server listening on {}", local_addr);

        Ok(Self {
            endpoint,
            pool,
            authorizer,
        })
    }

    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.endpoint.local_addr().map_err(TransportError::IoError)
    }

    pub fn pool(&self) -> &Arc<QuicAgentPool> {
        &self.pool
    }

    /// Accept agent sessions until the endpoint is closed
    ///
    /// Once `cancel` fires new connection attempts are refused, while
    /// sessions that are already registered stay open along with their
    /// virtual connections. [`close`](Self::close) drops them and ends the
    /// loop.
    pub async fn run(&self, cancel: CancellationToken) {
        while let Some(incoming) = self.endpoint.accept().await {
            if cancel.is_cancelled() {
                debug!(remote = %incoming.remote_address(), "Refusing session during shutdown");
                incoming.refuse();
                continue;
            }

            let pool = self.pool.clone();
            let authorizer = self.authorizer.clone();

            tokio::spawn(async move {
                let remote = incoming.remote_address();
                let connection = match incoming.await {
                    Ok(connection) => connection,
                    Err(e) => {
                        warn!(remote = %remote, "Failed to establish session: {}", e);
                        return;
                    }
                };

                if let Err(e) = handle_session(connection, pool, authorizer).await {
                    warn!(remote = %remote, "Session ended with error: {}", e);
                }
            });
        }

        debug!("Session endpoint closed");
    }

    /// Close every session, which also empties the pool
    pub fn close(&self) {
        self.endpoint
            .close(VarInt::from_u32(CLOSE_SHUTDOWN), b"gateway shutting down");
        info!("Session server stopped");
    }
}

async fn handle_session(
    connection: Connection,
    pool: Arc<QuicAgentPool>,
    authorizer: Arc<dyn Authorizer>,
) -> TransportResult<()> {
    let remote = connection.remote_address();

    let (send, recv) = timeout(REGISTRATION_TIMEOUT, connection.accept_bi())
        .await
        .map_err(|_| TransportError::ProtocolError("registration timed out".to_string()))?
        .map_err(|e| TransportError::ConnectionError(e.to_string()))?;
    let mut control = QuicStream::new(send, recv);

    let request = match timeout(REGISTRATION_TIMEOUT, control.recv_message())
        .await
        .map_err(|_| TransportError::ProtocolError("registration timed out".to_string()))??
    {
        Some(SessionMessage::Register { request }) => request,
        Some(other) => {
            let reason = format!("expected a registration request, got {:?}", other);
            reject(&connection, control, reason.clone()).await;
            return Err(TransportError::ProtocolError(reason));
        }
        None => return Err(TransportError::StreamClosed),
    };

    if let Err(e) = authorize_registration(&request, authorizer.as_ref()) {
        warn!(
            remote = %remote,
            name = %request.metadata.name,
            path = %request.path,
            "Registration rejected: {}",
            e
        );
        reject(&connection, control, e.to_string()).await;
        return Ok(());
    }

    let agent_id = new_agent_id(&request.metadata.name);

    // Visible in the pool before the agent learns it is registered.
    pool.insert(RegisteredSession::new(
        agent_id.clone(),
        request.metadata,
        connection.clone(),
    ));

    let registered = SessionMessage::Registered {
        agent_id: agent_id.to_string(),
    };
    if let Err(e) = control.send_message(&registered).await {
        pool.remove(&agent_id);
        return Err(e);
    }
    let _ = control.shutdown().await;

    let reason = connection.closed().await;
    pool.remove(&agent_id);
    info!(agent_id = %agent_id, remote = %remote, "Agent session closed: {}", reason);

    Ok(())
}

async fn reject(connection: &Connection, mut control: QuicStream, reason: String) {
    let _ = control
        .send_message(&SessionMessage::Rejected { reason })
        .await;
    let _ = control.shutdown().await;

    // The agent closes the connection once it has read the reason.
    let _ = timeout(REJECT_LINGER, connection.closed()).await;
    connection.close(VarInt::from_u32(CLOSE_REJECTED), b"registration rejected");
}

fn new_agent_id(name: &str) -> AgentId {
    let name = if name.is_empty() { "agent" } else { name };
    AgentId::new(format!("{}-{}", name, uuid::Uuid::new_v4().simple()))
}
