//! Peer link addresses (`tcp://ip:port` and `tcps://ip:port`).

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AddressError {
    #[error("invalid address URL: {0}")]
    InvalidUrl(String),

    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid address: {0}")]
    InvalidHost(String),

    #[error("invalid port value: {0}")]
    InvalidPort(String),
}

/// A link endpoint, optionally with a distinct publicly advertised IP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    ip: IpAddr,
    public_ip: IpAddr,
    port: u16,
    tls: bool,
}

impl Address {
    pub fn new(ip: IpAddr, port: u16, tls: bool) -> Self {
        Self {
            ip,
            public_ip: ip,
            port,
            tls,
        }
    }

    pub fn parse(url: &str) -> Result<Self, AddressError> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| AddressError::InvalidUrl(url.to_string()))?;
        let tls = match scheme {
            "tcp" => false,
            "tcps" => true,
            other => return Err(AddressError::UnsupportedScheme(other.to_string())),
        };

        let rest = rest.trim_end_matches('/');
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| AddressError::InvalidUrl(url.to_string()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let ip: IpAddr = host
            .parse()
            .map_err(|_| AddressError::InvalidHost(host.to_string()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| AddressError::InvalidPort(port.to_string()))?;

        Ok(Self::new(ip, port, tls))
    }

    /// Advertise a different IP to peers than the one bound locally.
    pub fn with_public(mut self, public_ip: IpAddr) -> Self {
        self.public_ip = public_ip;
        self
    }

    pub fn host(&self) -> IpAddr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn tls(&self) -> bool {
        self.tls
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// URL this node advertises to its peers.
    pub fn public_url(&self) -> String {
        self.url_for(self.public_ip)
    }

    fn scheme(&self) -> &'static str {
        if self.tls { "tcps" } else { "tcp" }
    }

    fn url_for(&self, ip: IpAddr) -> String {
        format!("{}://{}", self.scheme(), SocketAddr::new(ip, self.port))
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::parse(s)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url_for(self.ip))
    }
}
