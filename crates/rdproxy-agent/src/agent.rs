//! Agent runtime: keep a session with the gateway and serve its streams

use crate::access_control::AccessControl;
use crate::config::{local_hostname, AgentConfig, TlsTrust};
use rdproxy_auth::SECRET_HEADER;
use rdproxy_proto::{AgentMetadata, RegisterRequest};
use rdproxy_relay::{bind, relay, AcceptError, Forwarder, Listener, RelayStats};
use rdproxy_transport::{TransportError, VirtualConn};
use rdproxy_transport_quic::{AgentConnector, AgentSession, ConnectRequest, QuicConfig, QuicStream};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Agent errors
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Failed to resolve gateway address {address}: {reason}")]
    Resolve { address: String, reason: String },

    #[error("Local listener failed: {0}")]
    Listener(#[from] AcceptError),

    #[error("Local listener task failed: {0}")]
    ListenerTask(#[source] JoinError),

    #[error("Gave up after {attempts} failed connection attempts")]
    GaveUp { attempts: u32 },
}

/// Why serving one virtual connection ended early
#[derive(Debug, Error)]
enum StreamError {
    #[error("{0}")]
    Transport(#[from] TransportError),

    #[error("Access denied: {0}")]
    Denied(String),

    #[error("Failed to connect to {address}: {source}")]
    Dial {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// A configured agent, ready to run
pub struct Agent {
    config: AgentConfig,
    connector: AgentConnector,
    access_control: Arc<AccessControl>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        let quic_config = match &config.trust {
            TlsTrust::WebPki => QuicConfig::client_default(),
            TlsTrust::CaFile(path) => {
                QuicConfig::client_default().with_root_certificates_from_pem(path)?
            }
            TlsTrust::Insecure => {
                warn!("Certificate verification disabled (insecure mode)");
                QuicConfig::client_insecure()
            }
        };

        Ok(Self {
            connector: AgentConnector::new(&quic_config)?,
            access_control: Arc::new(config.access_control.clone()),
            config,
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Run until `cancel` fires, the local listener fails or reconnecting
    /// gives up
    ///
    /// The local listener is bound once and outlives gateway sessions. A
    /// failure to bind it, or to accept on it, stops the whole agent and
    /// cancels `cancel`.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), AgentError> {
        let local = match &self.config.forwarder {
            Some(forwarder_config) => {
                let listener = match bind(&forwarder_config.listen_addr).await {
                    Ok(listener) => listener,
                    Err(e) => {
                        error!("Failed to start local listener: {}", e);
                        return Err(e.into());
                    }
                };
                info!(
                    "Local listener on {} forwarding to {}",
                    forwarder_config.listen_addr, forwarder_config.backend_addr
                );
                Some((listener, Forwarder::new(forwarder_config.backend_addr.clone())))
            }
            None => None,
        };

        self.run_with(local, cancel).await
    }

    async fn run_with<L>(
        self,
        local: Option<(L, Forwarder)>,
        cancel: CancellationToken,
    ) -> Result<(), AgentError>
    where
        L: Listener,
        L::Stream: VirtualConn,
    {
        let shutdown = cancel.child_token();

        let forwarder = local.map(|(listener, forwarder)| {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { forwarder.serve(listener, shutdown).await })
        });

        let local_listener = async {
            let Some(task) = forwarder else {
                return Ok(());
            };
            let result = match task.await {
                Ok(result) => result.map_err(AgentError::from),
                Err(e) => Err(AgentError::ListenerTask(e)),
            };
            if let Err(e) = &result {
                error!("Local listener failed, shutting down: {}", e);
                cancel.cancel();
            }
            result
        };

        let sessions = async {
            let result = self.maintain_session(&shutdown).await;
            shutdown.cancel();
            result
        };

        let (session_result, listener_result) = tokio::join!(sessions, local_listener);

        info!("Agent stopped");
        session_result?;
        listener_result
    }

    /// Connect, serve, and reconnect with exponential backoff
    async fn maintain_session(&self, shutdown: &CancellationToken) -> Result<(), AgentError> {
        let backoff = self.config.backoff;
        let mut delay = backoff.initial;
        let mut failures: u32 = 0;

        loop {
            let attempt = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                attempt = self.connect() => attempt,
            };

            match attempt {
                Ok(session) => {
                    failures = 0;
                    delay = backoff.initial;
                    self.serve_session(session, shutdown).await;
                    if shutdown.is_cancelled() {
                        return Ok(());
                    }
                    warn!("Session with gateway lost, reconnecting in {:?}", delay);
                }
                Err(e) => {
                    failures += 1;
                    error!("Connection attempt {} failed: {}", failures, e);

                    if backoff.max_attempts > 0 && failures >= backoff.max_attempts {
                        error!("Maximum reconnection attempts ({}) reached", backoff.max_attempts);
                        return Err(AgentError::GaveUp { attempts: failures });
                    }

                    warn!("Reconnecting in {:?}", delay);
                }
            }

            if !sleep_or_cancel(delay, shutdown).await {
                return Ok(());
            }
            if failures > 0 {
                delay = backoff.next(delay);
            }
        }
    }

    async fn connect(&self) -> Result<AgentSession, AgentError> {
        let addr = resolve(&self.config.gateway).await?;

        let request = RegisterRequest::new(
            self.config.registration_path.clone(),
            AgentMetadata {
                name: self.config.name.clone(),
                hostname: local_hostname(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        )
        .with_header(SECRET_HEADER, self.config.secret.clone());

        Ok(self
            .connector
            .connect(addr, &self.config.server_name, request)
            .await?)
    }

    /// Serve virtual connections until the session is lost or `shutdown`
    /// fires
    ///
    /// On shutdown the session stays open until the relays already running
    /// over it have finished; streams the gateway opens meanwhile are refused.
    async fn serve_session(&self, session: AgentSession, shutdown: &CancellationToken) {
        let agent_id = session.agent_id().clone();
        info!(agent_id = %agent_id, "Serving virtual connections");

        let connections = TaskTracker::new();
        loop {
            let stream = tokio::select! {
                _ = shutdown.cancelled() => break,
                stream = session.accept_stream() => stream,
            };

            let Some(stream) = stream else {
                return;
            };

            let access_control = self.access_control.clone();
            let agent_id = agent_id.clone();
            connections.spawn(async move {
                match serve_virtual_connection(stream, &access_control).await {
                    Ok(stats) => debug!(
                        agent_id = %agent_id,
                        bytes_in = stats.a_to_b,
                        bytes_out = stats.b_to_a,
                        "Virtual connection closed"
                    ),
                    Err(e) => warn!(agent_id = %agent_id, "Virtual connection failed: {}", e),
                }
            });
        }

        connections.close();
        if !connections.is_empty() {
            info!(
                agent_id = %agent_id,
                connections = connections.len(),
                "Waiting for virtual connections to finish"
            );
        }

        loop {
            tokio::select! {
                _ = connections.wait() => break,
                stream = session.accept_stream() => match stream {
                    Some(stream) => {
                        tokio::spawn(refuse_virtual_connection(stream));
                    }
                    None => return,
                },
            }
        }

        session.close();
    }
}

async fn refuse_virtual_connection(stream: QuicStream) {
    if let Ok(request) = ConnectRequest::read(stream).await {
        request.reject("agent shutting down").await;
    }
}

/// Answer one connect request and relay it to the requested target
async fn serve_virtual_connection(
    stream: QuicStream,
    access_control: &AccessControl,
) -> Result<RelayStats, StreamError> {
    let request = ConnectRequest::read(stream).await?;

    let target = match access_control.check(&request.protocol, &request.address) {
        Ok(target) => target,
        Err(denied) => {
            let reason = denied.to_string();
            request.reject(reason.clone()).await;
            return Err(StreamError::Denied(reason));
        }
    };

    let local = match TcpStream::connect(target).await {
        Ok(local) => local,
        Err(source) => {
            request.reject(source.to_string()).await;
            return Err(StreamError::Dial {
                address: target,
                source,
            });
        }
    };

    debug!(address = %target, "Dialed requested target");
    let tunneled = request.accept().await?;
    Ok(relay(tunneled, local).await)
}

async fn resolve(address: &str) -> Result<SocketAddr, AgentError> {
    let resolve_error = |reason: String| AgentError::Resolve {
        address: address.to_string(),
        reason,
    };

    tokio::net::lookup_host(address)
        .await
        .map_err(|e| resolve_error(e.to_string()))?
        .next()
        .ok_or_else(|| resolve_error("no addresses found".to_string()))
}

/// Returns false if `shutdown` fired first
async fn sleep_or_cancel(delay: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
