//! rdproxy agent
//!
//! Keeps a session open to the gateway, dials whatever target the gateway
//! names for each virtual connection (subject to [`AccessControl`]), and
//! optionally relays a local listener to one fixed backend.

pub mod access_control;
pub mod agent;
pub mod config;

pub use access_control::{AccessControl, AccessDenied, PortRange};
pub use agent::{Agent, AgentError};
pub use config::{AgentArgs, AgentConfig, Backoff, ConfigError, ForwarderConfig, TlsTrust};
