//! Gateway bootstrap: session server plus proxy listener

use crate::config::{GatewayConfig, TlsSource};
use rdproxy_auth::SharedSecretAuthorizer;
use rdproxy_relay::{bind, AcceptError, ProxyServer};
use rdproxy_transport::TransportError;
use rdproxy_transport_quic::{QuicAgentPool, QuicConfig, SessionServer};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Gateway errors
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// A bound gateway, ready to run
pub struct Gateway {
    session_server: SessionServer,
    proxy_listener: Result<TcpListener, AcceptError>,
    proxy: ProxyServer<QuicAgentPool>,
    pool: Arc<QuicAgentPool>,
}

impl Gateway {
    /// Bind the session endpoint and the proxy listener
    ///
    /// Failing to set up the session endpoint is fatal. Failing to bind the
    /// proxy listener is not: the gateway still accepts agent sessions and
    /// the failure is logged when it runs.
    pub async fn bind(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let quic_config = match &config.tls {
            TlsSource::Pem { cert, key } => QuicConfig::server_from_pem(cert, key)?,
            TlsSource::SelfSigned { names } => {
                info!(tls_name = %config.tls_name, "No certificate configured, using a self-signed one");
                QuicConfig::server_self_signed(names)?
            }
        };

        let pool = Arc::new(QuicAgentPool::new());
        let authorizer = Arc::new(SharedSecretAuthorizer::new(config.secret.clone()));

        let session_server =
            SessionServer::bind(config.session_addr, &quic_config, pool.clone(), authorizer)?;

        let proxy_listener = bind(&config.proxy_addr.to_string()).await;
        let proxy = ProxyServer::new(pool.clone(), config.peer_target.clone(), config.retry);

        Ok(Self {
            session_server,
            proxy_listener,
            proxy,
            pool,
        })
    }

    /// Address of the QUIC session endpoint
    pub fn session_addr(&self) -> Result<SocketAddr, GatewayError> {
        Ok(self.session_server.local_addr()?)
    }

    /// Address of the proxy listener, if it could be bound
    pub fn proxy_addr(&self) -> Option<SocketAddr> {
        self.proxy_listener
            .as_ref()
            .ok()
            .and_then(|listener| listener.local_addr().ok())
    }

    pub fn pool(&self) -> Arc<QuicAgentPool> {
        self.pool.clone()
    }

    /// Run until `cancel` fires and open connections have drained
    ///
    /// Cancellation stops both listeners at once. Agent sessions stay up
    /// until every relay through them has finished, then they are closed.
    pub async fn run(self, cancel: CancellationToken) {
        let Self {
            session_server,
            proxy_listener,
            proxy,
            ..
        } = self;

        let proxy_task = async {
            match proxy_listener {
                Ok(listener) => {
                    if let Ok(addr) = listener.local_addr() {
                        info!("Proxy listener on {}", addr);
                    }
                    if let Err(e) = proxy.serve(listener, cancel.clone()).await {
                        error!("Proxy listener stopped: {}", e);
                        cancel.cancelled().await;
                    }
                }
                Err(e) => {
                    error!("Proxy listener unavailable: {}", e);
                    cancel.cancelled().await;
                }
            }
            session_server.close();
        };

        tokio::join!(session_server.run(cancel.clone()), proxy_task);

        info!("Gateway stopped");
    }
}
