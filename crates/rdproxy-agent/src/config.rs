//! Agent configuration from command line flags and environment

use crate::access_control::{AccessControl, PortRange};
use clap::Args;
use ipnet::IpNet;
use rdproxy_auth::REGISTRATION_PATH;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("Invalid connect URL {0:?}: expected [scheme://]host:port[/path]")]
    InvalidConnectUrl(String),

    #[error("--insecure and CA_CERT are mutually exclusive")]
    ConflictingTls,

    #[error("Reconnect delay bounds are inverted ({initial_ms}ms > {max_ms}ms)")]
    InvertedBackoff { initial_ms: u64, max_ms: u64 },
}

/// Agent flags; every flag can also be set through its environment variable
#[derive(Args, Debug, Clone)]
pub struct AgentArgs {
    /// Gateway session endpoint, `host:port` or `quic://host:port/connect`
    #[arg(long, env = "CONNECT_URL")]
    pub connect_url: String,

    /// Shared secret sent in the X-API-Tunnel-Secret header
    #[arg(long, env = "CONNECT_SECRET", hide_env_values = true)]
    pub connect_secret: String,

    /// Expected server name of the gateway certificate (defaults to the URL host)
    #[arg(long, env = "TLS_NAME")]
    pub tls_name: Option<String>,

    /// PEM file with the CA that signed the gateway certificate
    #[arg(long, env = "CA_CERT")]
    pub ca_cert: Option<PathBuf>,

    /// Skip gateway certificate verification (insecure, for development only)
    #[arg(long, env = "INSECURE")]
    pub insecure: bool,

    /// Name reported to the gateway; defaults to the host name
    #[arg(long, env = "AGENT_NAME")]
    pub agent_name: Option<String>,

    /// Local listener relaying to the backend
    #[arg(long, env = "FAKE_IMPERATIVE_API_ADDR", default_value = "0.0.0.0:6666")]
    pub listen_addr: String,

    /// Backend every local connection is relayed to; no local listener when unset
    #[arg(long, env = "BACKEND_ADDR")]
    pub backend_addr: Option<String>,

    /// Networks virtual connections may target (repeatable, empty allows all)
    #[arg(long = "allow-cidr", env = "ALLOW_CIDRS", value_delimiter = ',')]
    pub allow_cidrs: Vec<IpNet>,

    /// Ports virtual connections may target, e.g. 6666 or 8000-8999 (repeatable)
    #[arg(long = "allow-port", env = "ALLOW_PORTS", value_delimiter = ',')]
    pub allow_ports: Vec<PortRange>,

    /// Initial reconnect delay in milliseconds
    #[arg(long, env = "RECONNECT_DELAY_MS", default_value_t = 1000)]
    pub reconnect_delay_ms: u64,

    /// Upper bound of the reconnect delay in milliseconds
    #[arg(long, env = "MAX_RECONNECT_DELAY_MS", default_value_t = 30_000)]
    pub max_reconnect_delay_ms: u64,

    /// Give up after this many failed connection attempts (0 = never)
    #[arg(long, env = "MAX_RECONNECT_ATTEMPTS", default_value_t = 0)]
    pub max_reconnect_attempts: u32,
}

/// How the gateway certificate is verified
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsTrust {
    WebPki,
    CaFile(PathBuf),
    Insecure,
}

/// Reconnect backoff bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    /// 0 means unlimited
    pub max_attempts: u32,
}

impl Backoff {
    /// Delay to use after `current`
    pub fn next(&self, current: Duration) -> Duration {
        (current * 2).min(self.max)
    }
}

/// Local listener relaying to one backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwarderConfig {
    pub listen_addr: String,
    pub backend_addr: String,
}

/// Validated agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Gateway `host:port`
    pub gateway: String,
    pub registration_path: String,
    pub server_name: String,
    pub secret: String,
    pub trust: TlsTrust,
    pub name: String,
    pub forwarder: Option<ForwarderConfig>,
    pub access_control: AccessControl,
    pub backoff: Backoff,
}

impl TryFrom<AgentArgs> for AgentConfig {
    type Error = ConfigError;

    fn try_from(args: AgentArgs) -> Result<Self, Self::Error> {
        if args.connect_secret.is_empty() {
            return Err(ConfigError::Empty("CONNECT_SECRET"));
        }

        let url = ConnectUrl::parse(&args.connect_url)?;

        let trust = match (args.insecure, args.ca_cert) {
            (true, Some(_)) => return Err(ConfigError::ConflictingTls),
            (true, None) => TlsTrust::Insecure,
            (false, Some(path)) => TlsTrust::CaFile(path),
            (false, None) => TlsTrust::WebPki,
        };

        if args.reconnect_delay_ms > args.max_reconnect_delay_ms {
            return Err(ConfigError::InvertedBackoff {
                initial_ms: args.reconnect_delay_ms,
                max_ms: args.max_reconnect_delay_ms,
            });
        }

        let forwarder = match args.backend_addr {
            Some(backend_addr) if backend_addr.is_empty() => {
                return Err(ConfigError::Empty("BACKEND_ADDR"))
            }
            Some(backend_addr) => Some(ForwarderConfig {
                listen_addr: args.listen_addr,
                backend_addr,
            }),
            None => None,
        };

        let name = args
            .agent_name
            .filter(|name| !name.is_empty())
            .unwrap_or_else(local_hostname);

        Ok(Self {
            server_name: args.tls_name.unwrap_or_else(|| url.host.clone()),
            gateway: url.authority,
            registration_path: url.path,
            secret: args.connect_secret,
            trust,
            name,
            forwarder,
            access_control: AccessControl::new(args.allow_cidrs, args.allow_ports),
            backoff: Backoff {
                initial: Duration::from_millis(args.reconnect_delay_ms),
                max: Duration::from_millis(args.max_reconnect_delay_ms),
                max_attempts: args.max_reconnect_attempts,
            },
        })
    }
}

pub(crate) fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "agent".to_string())
}

#[derive(Debug, PartialEq, Eq)]
struct ConnectUrl {
    authority: String,
    host: String,
    path: String,
}

impl ConnectUrl {
    fn parse(url: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidConnectUrl(url.to_string());

        let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
        let (authority, path) = match rest.find('/') {
            Some(index) => (&rest[..index], &rest[index..]),
            None => (rest, REGISTRATION_PATH),
        };

        let (host, port) = authority.rsplit_once(':').ok_or_else(invalid)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() || port.parse::<u16>().map_or(true, |port| port == 0) {
            return Err(invalid());
        }

        Ok(Self {
            authority: authority.to_string(),
            host: host.to_string(),
            path: path.to_string(),
        })
    }
}
