//! QUIC tunnel transport for rdproxy
//!
//! Agents dial the gateway and keep one QUIC connection open. The first
//! bidirectional stream of that connection carries the registration request;
//! every later stream is one virtual connection opened by the gateway.
//!
//! ```text
//!   agent                                   gateway
//!     │ ── stream 0: Register{/connect} ──▶   │ authorize, add to pool
//!     │ ◀── Registered{agent_id} ──────────   │
//!     │                                       │
//!     │ ◀── stream n: Connect{tcp, addr} ──   │ QuicAgentPool::dial
//!     │ ── Connected ─────────────────────▶   │
//!     │ ◀═══════════ raw bytes ═══════════▶   │ relay
//! ```

// Initialize rustls crypto provider once globally
// This MUST be called before any rustls/QUIC operations
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

pub mod cert;
pub mod client;
pub mod config;
pub mod pool;
pub mod server;
pub mod stream;

pub use cert::{generate_self_signed_cert, SelfSignedCertificate};
pub use client::{AgentConnector, AgentSession, ConnectRequest};
pub use config::{QuicConfig, ServerIdentity};
pub use pool::{QuicAgentPool, RegisteredSession};
pub use server::{authorize_registration, RegistrationError, SessionServer};
pub use stream::QuicStream;
