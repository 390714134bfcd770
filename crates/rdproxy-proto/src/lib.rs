//! Session handshake protocol for rdproxy
//!
//! The tunnel transport carries raw bytes on its streams. The only structured
//! traffic is a single request/response exchange at the start of a stream:
//! agent registration on the first stream of a session, and a connect request
//! on every virtual connection the gateway opens.

pub mod codec;
pub mod messages;

pub use codec::{CodecError, SessionCodec};
pub use messages::*;

/// ALPN identifier negotiated on the tunnel session
pub const ALPN: &str = "rdproxy-v1";
