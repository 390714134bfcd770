//! Gateway-side proxy listener: inbound TCP -> random agent -> relay

use crate::acceptor::{accept_loop, AcceptError, AcceptErrorPolicy, Listener};
use crate::relay::{close, relay, RelayStats};
use crate::selector::{dial_any_agent, PeerTarget, RetryPolicy, SelectError};
use rdproxy_transport::{AgentPool, VirtualConn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Relays every inbound connection through one randomly selected agent
pub struct ProxyServer<P: AgentPool> {
    pool: Arc<P>,
    target: PeerTarget,
    policy: RetryPolicy,
}

impl<P: AgentPool> Clone for ProxyServer<P> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            target: self.target.clone(),
            policy: self.policy,
        }
    }
}

impl<P: AgentPool> ProxyServer<P> {
    pub fn new(pool: Arc<P>, target: PeerTarget, policy: RetryPolicy) -> Self {
        Self {
            pool,
            target,
            policy,
        }
    }

    pub fn target(&self) -> &PeerTarget {
        &self.target
    }

    /// Serve `listener` until `cancel` fires and every relay has finished
    ///
    /// Accept errors are logged and accepting continues. Cancellation stops
    /// accepting and interrupts pending agent waits; relays already running
    /// are not interrupted, and this returns once they have drained.
    pub async fn serve<L>(&self, listener: L, cancel: CancellationToken) -> Result<(), AcceptError>
    where
        L: Listener,
        L::Stream: VirtualConn,
    {
        info!(
            target_addr = %self.target,
            max_attempts = self.policy.max_attempts,
            delay_ms = self.policy.delay.as_millis() as u64,
            "Proxy listener started"
        );

        let relays = TaskTracker::new();
        let server = self.clone();
        let conn_cancel = cancel.clone();
        let tracked = relays.clone();
        let result = accept_loop(
            listener,
            AcceptErrorPolicy::Continue,
            cancel,
            move |stream, peer| {
                let server = server.clone();
                let cancel = conn_cancel.clone();
                tracked.track_future(async move {
                    let _ = server.handle_connection(stream, peer, &cancel).await;
                })
            },
        )
        .await;

        relays.close();
        if !relays.is_empty() {
            info!(relays = relays.len(), "Waiting for open connections to finish");
        }
        relays.wait().await;

        result
    }

    /// Run one relay attempt for an accepted connection
    ///
    /// The inbound stream is closed on every path: after the relay finishes,
    /// or immediately when no agent could be dialed.
    pub async fn handle_connection<S>(
        &self,
        mut inbound: S,
        peer: SocketAddr,
        cancel: &CancellationToken,
    ) -> Result<RelayStats, SelectError>
    where
        S: VirtualConn,
    {
        let (agent, conn) =
            match dial_any_agent(self.pool.as_ref(), &self.target, &self.policy, cancel).await {
                Ok(dialed) => dialed,
                Err(e) => {
                    warn!(peer = %peer, "Dropping connection: {}", e);
                    close(&mut inbound).await;
                    return Err(e);
                }
            };

        info!(peer = %peer, agent_id = %agent, "Relaying connection through agent");

        let stats = relay(inbound, conn).await;

        info!(
            peer = %peer,
            agent_id = %agent,
            bytes_in = stats.a_to_b,
            bytes_out = stats.b_to_a,
            "Connection closed"
        );

        Ok(stats)
    }
}
