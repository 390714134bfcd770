//! Relay core shared by the gateway and the agent
//!
//! - [`selector`]: pick a live agent at random, retrying while the pool is empty
//! - [`relay`]: copy bytes both ways between two streams and tear them down
//! - [`acceptor`]: accept loop with a per-side accept error policy
//! - [`proxy`]: gateway listener wiring the three together
//! - [`forwarder`]: agent-side relay to one fixed backend

pub mod acceptor;
pub mod forwarder;
pub mod proxy;
pub mod relay;
pub mod selector;

pub use acceptor::{accept_loop, bind, AcceptError, AcceptErrorPolicy, Listener};
pub use forwarder::{Forwarder, ForwarderError};
pub use proxy::ProxyServer;
pub use relay::{close, relay, RelayStats};
pub use selector::{choose_agent, dial_any_agent, PeerTarget, RetryPolicy, SelectError};
