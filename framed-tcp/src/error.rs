use std::{io, net::SocketAddr};

use thiserror::Error;

use crate::{connection::ConnectionId, framing::FrameError};

/// Errors surfaced synchronously to callers of this crate.
///
/// Failures on the read side of a connection never show up here; they end
/// the connection and are reported through its disconnect notification.
#[derive(Debug, Error)]
pub enum Error {
    #[error("port {port} is outside the allowed range 1024-65535")]
    Configuration { port: u32 },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("connection is closed")]
    Closed,
    #[error("no connection with id {0}")]
    UnknownConnection(ConnectionId),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
