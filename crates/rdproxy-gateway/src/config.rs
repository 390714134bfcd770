//! Gateway configuration from command line flags and environment

use clap::Args;
use rdproxy_relay::{PeerTarget, RetryPolicy};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("Invalid bind address {0:?}")]
    InvalidBindAddress(String),

    #[error("TLS_CERT and TLS_KEY must be set together")]
    IncompleteTlsFiles,
}

/// Gateway flags; every flag can also be set through its environment variable
#[derive(Args, Debug, Clone)]
pub struct GatewayArgs {
    /// Shared secret agents must present in the X-API-Tunnel-Secret header
    #[arg(long, env = "SECRET", hide_env_values = true)]
    pub secret: String,

    /// TCP port accepting the connections to relay
    #[arg(long, env = "PROXY_PORT", value_parser = clap::value_parser!(u16).range(1..))]
    pub proxy_port: u16,

    /// Port agents dial on their side for every relayed connection
    #[arg(long, env = "PEER_PORT", value_parser = clap::value_parser!(u16).range(1..))]
    pub peer_port: u16,

    /// Host agents dial on their side for every relayed connection
    #[arg(long, env = "PEER_HOST", default_value = "127.0.0.1")]
    pub peer_host: String,

    /// UDP port of the QUIC endpoint agents register on
    #[arg(long, env = "HTTPS_PORT", value_parser = clap::value_parser!(u16).range(1..))]
    pub https_port: u16,

    /// Address both listeners bind to
    #[arg(long, env = "BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Server name of the gateway certificate
    #[arg(long, env = "TLS_NAME")]
    pub tls_name: String,

    /// PEM certificate chain (a self-signed certificate is generated when absent)
    #[arg(long, env = "TLS_CERT", requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key
    #[arg(long, env = "TLS_KEY", requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,

    /// How many times an empty agent pool is polled before a connection is dropped
    #[arg(long, env = "LIST_CLIENTS_RETRY_COUNT", default_value_t = RetryPolicy::DEFAULT_MAX_ATTEMPTS)]
    pub list_clients_retry_count: u32,

    /// Delay between polls of an empty agent pool, in milliseconds
    #[arg(long, env = "LIST_CLIENTS_RETRY_DELAY_MS", default_value_t = 1000)]
    pub list_clients_retry_delay_ms: u64,

    /// Enable debug logging
    #[arg(long, env = "DEBUG")]
    pub debug: bool,
}

/// Where the session server's certificate comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsSource {
    Pem { cert: PathBuf, key: PathBuf },
    SelfSigned { names: Vec<String> },
}

/// Validated gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub secret: String,
    pub proxy_addr: SocketAddr,
    pub session_addr: SocketAddr,
    pub peer_target: PeerTarget,
    pub tls_name: String,
    pub tls: TlsSource,
    pub retry: RetryPolicy,
    pub debug: bool,
}

impl TryFrom<GatewayArgs> for GatewayConfig {
    type Error = ConfigError;

    fn try_from(args: GatewayArgs) -> Result<Self, Self::Error> {
        if args.secret.is_empty() {
            return Err(ConfigError::Empty("SECRET"));
        }
        if args.tls_name.is_empty() {
            return Err(ConfigError::Empty("TLS_NAME"));
        }
        if args.peer_host.is_empty() {
            return Err(ConfigError::Empty("PEER_HOST"));
        }

        let bind_ip: IpAddr = args
            .bind_address
            .parse()
            .map_err(|_| ConfigError::InvalidBindAddress(args.bind_address.clone()))?;

        let tls = match (args.tls_cert, args.tls_key) {
            (Some(cert), Some(key)) => TlsSource::Pem { cert, key },
            (None, None) => TlsSource::SelfSigned {
                names: vec![args.tls_name.clone()],
            },
            _ => return Err(ConfigError::IncompleteTlsFiles),
        };

        Ok(Self {
            secret: args.secret,
            proxy_addr: SocketAddr::new(bind_ip, args.proxy_port),
            session_addr: SocketAddr::new(bind_ip, args.https_port),
            peer_target: PeerTarget::tcp(join_host_port(&args.peer_host, args.peer_port)),
            tls_name: args.tls_name,
            tls,
            retry: RetryPolicy::new(
                args.list_clients_retry_count,
                Duration::from_millis(args.list_clients_retry_delay_ms),
            ),
            debug: args.debug,
        })
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
