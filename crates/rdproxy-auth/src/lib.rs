//! Authorization for tunnel session registration
//!
//! The authorizer is the single trust boundary deciding which remote peers
//! may become reachable agents. It sees the registration request exactly as
//! an HTTP upgrade endpoint would (method, path, headers) and either yields
//! the caller's identity or rejects the request.

pub mod authorizer;

pub use authorizer::{AuthError, Authorizer, Identity, SharedSecretAuthorizer};

/// Route the registration request must target
pub const REGISTRATION_PATH: &str = "/connect";

/// Header carrying the shared secret on registration requests
pub const SECRET_HEADER: &str = "X-API-Tunnel-Secret";
