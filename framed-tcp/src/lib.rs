//! Point-to-point and broadcast messaging over plain TCP.
//!
//! Messages travel as length-prefixed frames (`[len:i32-LE][code:i32-LE][payload]`)
//! over an otherwise unframed byte stream. Each module owns one concern:
//!
//! - [`framing`] encodes and decodes frames, including partial-read reassembly.
//! - [`connection`] owns one socket: a reader thread raising events and a
//!   write lock that keeps concurrent frames intact.
//! - [`registry`] tracks a server's live connections and broadcasts to them.
//! - [`server`] accepts clients on a dedicated thread and relays their events.
//! - [`client`] connects to exactly one server.
//! - [`events`] holds the subscriber lists and event payloads.
//! - [`config`] and [`error`] carry construction settings and the error taxonomy.
//!
//! Everything is blocking and thread-per-connection. Event callbacks run on
//! the connection's own reader thread. No timeouts are applied anywhere: a
//! peer that sends a header and then stalls holds its reader thread until
//! the connection is shut down.
//!
//! The [`cli`] module backs the `framed_tcp` demo binary.

pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod framing;
pub mod message;
pub mod registry;
pub mod server;

pub use client::{Client, ClientBuilder};
pub use config::{ConnectionOptions, ServerConfig};
pub use connection::{Connection, ConnectionId, State};
pub use error::{Error, Result};
pub use events::{CloseReason, Connected, Disconnected, MessageReceived, Subscribers};
pub use framing::FrameError;
pub use message::Message;
pub use registry::{BroadcastReport, Registry};
pub use server::{Server, ServerHandle};
