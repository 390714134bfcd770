//! Accept loop shared by the gateway proxy listener and the agent forwarder

use async_trait::async_trait;
use std::future::Future;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What an accept loop does when `accept` fails outside of shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptErrorPolicy {
    /// Log the error and keep accepting
    Continue,
    /// Stop the loop and return the error to the caller
    Abort,
}

/// Accept loop errors
#[derive(Debug, Error)]
pub enum AcceptError {
    #[error("Failed to bind to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to accept connection: {0}")]
    Accept(#[source] std::io::Error),
}

/// Source of inbound connections
#[async_trait]
pub trait Listener: Send + 'static {
    type Stream: Send + 'static;

    async fn accept(&mut self) -> std::io::Result<(Self::Stream, SocketAddr)>;

    fn local_addr(&self) -> std::io::Result<SocketAddr>;
}

#[async_trait]
impl Listener for TcpListener {
    type Stream = TcpStream;

    async fn accept(&mut self) -> std::io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// Bind a TCP listener, mapping the failure to an [`AcceptError::Bind`]
pub async fn bind(address: &str) -> Result<TcpListener, AcceptError> {
    TcpListener::bind(address)
        .await
        .map_err(|source| AcceptError::Bind {
            address: address.to_string(),
            source,
        })
}

/// Accept connections until `cancel` fires, spawning `handler` for each one
///
/// The loop never waits for a handler to finish. Once `cancel` fires the
/// listener is dropped, which closes it, and `Ok(())` is returned; an accept
/// error observed after cancellation is also a clean exit. Other accept
/// errors are handled according to `policy`.
pub async fn accept_loop<L, H, Fut>(
    mut listener: L,
    policy: AcceptErrorPolicy,
    cancel: CancellationToken,
    mut handler: H,
) -> Result<(), AcceptError>
where
    L: Listener,
    H: FnMut(L::Stream, SocketAddr) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let local_addr = listener
        .local_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => {
                info!(listener = %local_addr, "Listener shutting down");
                return Ok(());
            }
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                debug!(listener = %local_addr, peer = %peer, "Accepted connection");
                tokio::spawn(handler(stream, peer));
            }
            Err(_) if cancel.is_cancelled() => {
                info!(listener = %local_addr, "Listener shutting down");
                return Ok(());
            }
            Err(e) => match policy {
                AcceptErrorPolicy::Continue => {
                    warn!(listener = %local_addr, "Failed to accept connection: {}", e);
                }
                AcceptErrorPolicy::Abort => {
                    error!(listener = %local_addr, "Failed to accept connection: {}", e);
                    return Err(AcceptError::Accept(e));
                }
            },
        }
    }
}
