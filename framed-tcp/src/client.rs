use std::net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs};

use crossbeam_channel::Receiver;
use tracing::info;

use crate::{
    config::ConnectionOptions,
    connection::{Connection, ConnectionId, State},
    error::{Error, Result},
    events::{Disconnected, MessageReceived},
    message::Message,
};

type MessageCallback = Box<dyn Fn(&MessageReceived) + Send + Sync>;
type DisconnectCallback = Box<dyn Fn(&Disconnected) + Send + Sync>;

/// A single outbound connection to a server.
///
/// Construction blocks until the TCP handshake completes. Callbacks given
/// to the [`ClientBuilder`] are attached before the reader starts, so they
/// observe every message; callbacks added later only see what follows.
#[derive(Debug)]
pub struct Client {
    connection: Connection,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Connects to a pre-resolved endpoint.
    pub fn connect(endpoint: SocketAddr) -> Result<Self> {
        Self::builder().connect(endpoint)
    }

    pub fn connect_ip(ip: IpAddr, port: u16) -> Result<Self> {
        Self::builder().connect_ip(ip, port)
    }

    /// Resolves `host` through the platform resolver and connects to the
    /// first address that accepts.
    pub fn connect_host(host: &str, port: u16) -> Result<Self> {
        Self::builder().connect_host(host, port)
    }

    pub fn id(&self) -> ConnectionId {
        self.connection.id()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.connection.peer_addr()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.connection.local_addr()
    }

    pub fn state(&self) -> State {
        self.connection.state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_open()
    }

    pub fn send(&self, code: i32, payload: &[u8]) -> Result<()> {
        self.connection.send(code, payload)
    }

    pub fn send_message(&self, message: &Message) -> Result<()> {
        self.connection.send_message(message)
    }

    pub fn send_text(&self, text: &str) -> Result<()> {
        self.connection.send_text(text)
    }

    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    pub fn on_message<F>(&self, callback: F)
    where
        F: Fn(&MessageReceived) + Send + Sync + 'static,
    {
        self.connection.on_message(callback);
    }

    pub fn on_disconnect<F>(&self, callback: F)
    where
        F: Fn(&Disconnected) + Send + Sync + 'static,
    {
        self.connection.on_disconnect(callback);
    }

    pub fn messages(&self) -> Receiver<MessageReceived> {
        self.connection.messages()
    }

    pub fn disconnects(&self) -> Receiver<Disconnected> {
        self.connection.disconnects()
    }
}

#[derive(Default)]
pub struct ClientBuilder {
    options: ConnectionOptions,
    on_message: Vec<MessageCallback>,
    on_disconnect: Vec<DisconnectCallback>,
}

impl ClientBuilder {
    pub fn options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn max_payload_len(mut self, max: usize) -> Self {
        self.options.max_payload_len = max;
        self
    }

    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.options.nodelay = nodelay;
        self
    }

    pub fn on_message<F>(mut self, callback: F) -> Self
    where
        F: Fn(&MessageReceived) + Send + Sync + 'static,
    {
        self.on_message.push(Box::new(callback));
        self
    }

    pub fn on_disconnect<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Disconnected) + Send + Sync + 'static,
    {
        self.on_disconnect.push(Box::new(callback));
        self
    }

    pub fn connect(self, endpoint: SocketAddr) -> Result<Client> {
        self.connect_to(endpoint.to_string(), endpoint)
    }

    pub fn connect_ip(self, ip: IpAddr, port: u16) -> Result<Client> {
        self.connect(SocketAddr::new(ip, port))
    }

    pub fn connect_host(self, host: &str, port: u16) -> Result<Client> {
        self.connect_to(format!("{host}:{port}"), (host, port))
    }

    fn connect_to<A: ToSocketAddrs>(self, target: String, addr: A) -> Result<Client> {
        self.options.validate()?;
        let stream = TcpStream::connect(addr).map_err(|source| Error::Connect {
            target: target.clone(),
            source,
        })?;

        let connection = Connection::new(stream, self.options)?;
        for callback in self.on_message {
            connection.on_message(callback);
        }
        for callback in self.on_disconnect {
            connection.on_disconnect(callback);
        }
        connection.start()?;

        info!(%target, peer = %connection.peer_addr(), "connected");
        Ok(Client { connection })
    }
}
