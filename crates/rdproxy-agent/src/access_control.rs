//! Which virtual connection targets an agent is willing to dial
//!
//! The gateway names the protocol and address of every virtual connection.
//! The agent only dials plain TCP targets whose IP falls in an allowed
//! network and whose port falls in an allowed range. An empty list allows
//! everything for that dimension.

use ipnet::IpNet;
use std::net::{IpAddr, SocketAddr};
use std::ops::RangeInclusive;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AccessDenied {
    #[error("protocol {0:?} is not supported")]
    UnsupportedProtocol(String),

    #[error("address {0:?} is not an ip:port pair")]
    InvalidAddress(String),

    #[error("{0} is outside the allowed networks")]
    NetworkNotAllowed(IpAddr),

    #[error("port {0} is outside the allowed ports")]
    PortNotAllowed(u16),
}

/// Inclusive port range, written `443` or `8000-8999`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRange(RangeInclusive<u16>);

impl PortRange {
    pub fn new(first: u16, last: u16) -> Self {
        Self(first..=last)
    }

    pub fn contains(&self, port: u16) -> bool {
        self.0.contains(&port)
    }
}

impl FromStr for PortRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |part: &str| {
            part.trim()
                .parse::<u16>()
                .map_err(|e| format!("invalid port {:?}: {}", part.trim(), e))
        };

        match s.split_once('-') {
            Some((first, last)) => {
                let (first, last) = (parse(first)?, parse(last)?);
                if first > last {
                    return Err(format!("port range {}-{} is reversed", first, last));
                }
                Ok(Self::new(first, last))
            }
            None => {
                let port = parse(s)?;
                Ok(Self::new(port, port))
            }
        }
    }
}

/// Allow-lists consulted before dialing a requested target
#[derive(Debug, Clone, Default)]
pub struct AccessControl {
    networks: Vec<IpNet>,
    ports: Vec<PortRange>,
}

impl AccessControl {
    pub fn new(networks: Vec<IpNet>, ports: Vec<PortRange>) -> Self {
        Self { networks, ports }
    }

    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Check a virtual connection request, returning the address to dial
    pub fn check(&self, protocol: &str, address: &str) -> Result<SocketAddr, AccessDenied> {
        if protocol != "tcp" {
            return Err(AccessDenied::UnsupportedProtocol(protocol.to_string()));
        }

        let target: SocketAddr = address
            .parse()
            .map_err(|_| AccessDenied::InvalidAddress(address.to_string()))?;

        let ip = target.ip();
        if !self.networks.is_empty() && !self.networks.iter().any(|net| net.contains(&ip)) {
            return Err(AccessDenied::NetworkNotAllowed(ip));
        }

        let port = target.port();
        if !self.ports.is_empty() && !self.ports.iter().any(|range| range.contains(port)) {
            return Err(AccessDenied::PortNotAllowed(port));
        }

        Ok(target)
    }
}
