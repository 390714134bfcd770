//! Agent-side forwarder to one fixed backend

use crate::acceptor::{accept_loop, AcceptError, AcceptErrorPolicy, Listener};
use crate::relay::{close, relay, RelayStats};
use rdproxy_transport::VirtualConn;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Errors that can occur while forwarding one stream
#[derive(Debug, Error)]
pub enum ForwarderError {
    #[error("Failed to connect to backend {address}: {source}")]
    ConnectionFailed {
        address: String,
        #[source]
        source: std::io::Error,
    },
}

/// Relays every accepted stream to the same backend address
#[derive(Debug, Clone)]
pub struct Forwarder {
    backend: Arc<str>,
}

impl Forwarder {
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            backend: Arc::from(backend.into()),
        }
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Dial the backend for `inbound` and relay until both sides are done
    ///
    /// If the backend cannot be reached `inbound` is closed and the error is
    /// returned; nothing is retried.
    pub async fn forward<S>(&self, mut inbound: S) -> Result<RelayStats, ForwarderError>
    where
        S: VirtualConn,
    {
        let backend = match TcpStream::connect(self.backend()).await {
            Ok(stream) => stream,
            Err(source) => {
                close(&mut inbound).await;
                return Err(ForwarderError::ConnectionFailed {
                    address: self.backend.to_string(),
                    source,
                });
            }
        };

        debug!(backend = %self.backend, "Connected to backend");

        Ok(relay(inbound, backend).await)
    }

    /// Forward every connection accepted on `listener` until `cancel` fires
    ///
    /// After cancellation this waits for forwarded connections to finish. An
    /// accept failure ends the loop with an error right away; callers treat
    /// it as fatal for the whole agent.
    pub async fn serve<L>(&self, listener: L, cancel: CancellationToken) -> Result<(), AcceptError>
    where
        L: Listener,
        L::Stream: VirtualConn,
    {
        info!(backend = %self.backend, "Forwarder listening");

        let connections = TaskTracker::new();
        let tracked = connections.clone();
        let forwarder = self.clone();
        accept_loop(listener, AcceptErrorPolicy::Abort, cancel, move |stream, peer| {
            let forwarder = forwarder.clone();
            tracked.track_future(async move {
                match forwarder.forward(stream).await {
                    Ok(stats) => debug!(
                        peer = %peer,
                        bytes_in = stats.a_to_b,
                        bytes_out = stats.b_to_a,
                        "Forwarded connection closed"
                    ),
                    Err(e) => warn!(peer = %peer, "{}", e),
                }
            })
        })
        .await?;

        connections.close();
        connections.wait().await;
        Ok(())
    }
}
