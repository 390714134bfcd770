//! rdproxy gateway
//!
//! Accepts agent sessions over QUIC, gated by a shared secret, and relays
//! every TCP connection arriving on the proxy port through one randomly
//! chosen agent to a fixed address on the agent's side.

pub mod config;
pub mod server;

pub use config::{ConfigError, GatewayArgs, GatewayConfig, TlsSource};
pub use server::{Gateway, GatewayError};
