//! Construction-time settings for servers and clients.

use std::net::{IpAddr, Ipv4Addr};

use crate::{
    error::{Error, Result},
    framing::{DEFAULT_MAX_PAYLOAD_LEN, WIRE_MAX_PAYLOAD_LEN},
};

/// Lowest port a server may listen on.
pub const MIN_PORT: u32 = 1024;
/// Highest port a server may listen on.
pub const MAX_PORT: u32 = 65535;

/// Per-connection knobs shared by both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Frames declaring a longer payload end the connection.
    pub max_payload_len: usize,
    /// Disables Nagle's algorithm on the socket.
    pub nodelay: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
            nodelay: true,
        }
    }
}

impl ConnectionOptions {
    pub fn validate(&self) -> Result<()> {
        if self.max_payload_len > WIRE_MAX_PAYLOAD_LEN {
            return Err(Error::InvalidConfig(format!(
                "max_payload_len {} exceeds the wire limit of {} bytes",
                self.max_payload_len, WIRE_MAX_PAYLOAD_LEN
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub port: u32,
    pub bind_ip: IpAddr,
    pub connection: ConnectionOptions,
}

impl ServerConfig {
    /// Listens on every interface with default connection options.
    pub fn new(port: u32) -> Self {
        Self {
            port,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            connection: ConnectionOptions::default(),
        }
    }

    pub fn bind_ip(mut self, ip: IpAddr) -> Self {
        self.bind_ip = ip;
        self
    }

    pub fn max_payload_len(mut self, max: usize) -> Self {
        self.connection.max_payload_len = max;
        self
    }

    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.connection.nodelay = nodelay;
        self
    }

    /// Checks every field and returns the port narrowed to `u16`.
    pub fn validate(&self) -> Result<u16> {
        let port = validate_port(self.port)?;
        self.connection.validate()?;
        Ok(port)
    }
}

pub fn validate_port(port: u32) -> Result<u16> {
    if !(MIN_PORT..=MAX_PORT).contains(&port) {
        return Err(Error::Configuration { port });
    }
    u16::try_from(port).map_err(|_| Error::Configuration { port })
}
