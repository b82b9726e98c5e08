//! Listener that accepts many clients and relays their events.
//!
//! Threading model:
//!
//! - **Accept thread**: blocks in `accept` for the lifetime of the server.
//!   Setting up an accepted socket only wraps it, registers it and spawns its
//!   reader, so the next `accept` follows immediately.
//! - **Reader threads**: one per connection, see [`crate::connection`].
//!   `on_client_connected` fires on the new connection's reader thread before
//!   its first read, followed by its `on_message` events.
//!
//! A connection is added to the [`Registry`] before its reader thread exists,
//! so its own disconnect can never race its registration.

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc, Mutex, PoisonError, Weak,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::Receiver;
use tracing::{debug, info, warn};

use crate::{
    config::ServerConfig,
    connection::{Connection, ConnectionId},
    error::{Error, Result},
    events::{Connected, Disconnected, MessageReceived, Subscribers},
    message::Message,
    registry::{BroadcastReport, Registry},
};

const WAKE_TIMEOUT: Duration = Duration::from_secs(1);

pub struct Server {
    inner: Arc<Inner>,
    acceptor: Mutex<Option<Acceptor>>,
}

struct Acceptor {
    local_addr: SocketAddr,
    handle: JoinHandle<()>,
}

struct Inner {
    config: ServerConfig,
    port: u16,
    registry: Registry,
    stopping: AtomicBool,
    on_connected: Subscribers<Connected>,
    on_message: Subscribers<MessageReceived>,
    on_disconnected: Subscribers<Disconnected>,
}

impl Server {
    /// Creates a server for `port` listening on all interfaces.
    ///
    /// Fails with [`Error::Configuration`] for ports outside 1024-65535.
    /// No socket is opened until [`serve`](Self::serve).
    pub fn new(port: u32) -> Result<Self> {
        Self::with_config(ServerConfig::new(port))
    }

    pub fn with_config(config: ServerConfig) -> Result<Self> {
        let port = config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                port,
                registry: Registry::new(),
                stopping: AtomicBool::new(false),
                on_connected: Subscribers::new(),
                on_message: Subscribers::new(),
                on_disconnected: Subscribers::new(),
            }),
            acceptor: Mutex::new(None),
        })
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// Address the listener is bound to, once serving.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock_acceptor()
            .as_ref()
            .map(|acceptor| acceptor.local_addr)
    }

    pub fn is_serving(&self) -> bool {
        self.lock_acceptor().is_some()
    }

    /// Weak handle for use inside event callbacks.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn on_client_connected<F>(&self, callback: F)
    where
        F: Fn(&Connected) + Send + Sync + 'static,
    {
        self.inner.on_connected.subscribe(callback);
    }

    pub fn on_message<F>(&self, callback: F)
    where
        F: Fn(&MessageReceived) + Send + Sync + 'static,
    {
        self.inner.on_message.subscribe(callback);
    }

    pub fn on_client_disconnected<F>(&self, callback: F)
    where
        F: Fn(&Disconnected) + Send + Sync + 'static,
    {
        self.inner.on_disconnected.subscribe(callback);
    }

    pub fn client_connections(&self) -> Receiver<Connected> {
        self.inner.on_connected.channel()
    }

    pub fn messages(&self) -> Receiver<MessageReceived> {
        self.inner.on_message.channel()
    }

    pub fn client_disconnects(&self) -> Receiver<Disconnected> {
        self.inner.on_disconnected.channel()
    }

    /// Binds the port and starts the accept thread without blocking.
    ///
    /// Calling `serve` on a server that is already serving returns the
    /// existing address.
    pub fn serve(&self) -> Result<SocketAddr> {
        let mut acceptor = self.lock_acceptor();
        if let Some(existing) = acceptor.as_ref() {
            return Ok(existing.local_addr);
        }

        let addr = SocketAddr::new(self.inner.config.bind_ip, self.inner.port);
        let listener = TcpListener::bind(addr).map_err(|source| Error::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        self.inner.stopping.store(false, Ordering::Release);
        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name(format!("framed-tcp-accept-{}", self.inner.port))
            .spawn(move || accept_loop(&inner, listener))?;

        info!(addr = %local_addr, "server listening");
        *acceptor = Some(Acceptor { local_addr, handle });
        Ok(local_addr)
    }

    /// Encodes `message` once and sends it to every connected client.
    pub fn message_all(&self, message: &Message) -> Result<BroadcastReport> {
        self.inner.registry.broadcast(message)
    }

    /// Sends `message` to a single client.
    pub fn send_to(&self, id: ConnectionId, message: &Message) -> Result<()> {
        self.inner.send_to(id, message)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Stops accepting and disconnects every client.
    ///
    /// The accept thread is woken with a throwaway local connection and
    /// joined, then each connection is shut down and its reader joined.
    /// Further calls are no-ops until the next [`serve`](Self::serve).
    pub fn shutdown(&self) {
        let Some(acceptor) = self.lock_acceptor().take() else {
            return;
        };

        self.inner.stopping.store(true, Ordering::Release);
        let wake_addr = wake_address(acceptor.local_addr);
        if let Err(err) = TcpStream::connect_timeout(&wake_addr, WAKE_TIMEOUT) {
            debug!(addr = %wake_addr, error = ?err, "could not wake accept loop");
        }
        if acceptor.handle.join().is_err() {
            warn!("accept thread panicked");
        }

        let connections = self.inner.registry.drain();
        let count = connections.len();
        for connection in connections {
            connection.disconnect();
        }
        info!(addr = %acceptor.local_addr, clients = count, "server stopped");
    }

    fn lock_acceptor(&self) -> std::sync::MutexGuard<'_, Option<Acceptor>> {
        self.acceptor.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Non-owning reference to a [`Server`], safe to capture in its own callbacks.
#[derive(Clone)]
pub struct ServerHandle {
    inner: Weak<Inner>,
}

impl ServerHandle {
    pub fn message_all(&self, message: &Message) -> Result<BroadcastReport> {
        self.upgrade()?.registry.broadcast(message)
    }

    pub fn send_to(&self, id: ConnectionId, message: &Message) -> Result<()> {
        self.upgrade()?.send_to(id, message)
    }

    pub fn connection_count(&self) -> usize {
        self.inner
            .upgrade()
            .map_or(0, |inner| inner.registry.len())
    }

    fn upgrade(&self) -> Result<Arc<Inner>> {
        self.inner.upgrade().ok_or(Error::Closed)
    }
}

impl Inner {
    fn send_to(&self, id: ConnectionId, message: &Message) -> Result<()> {
        let connection = self
            .registry
            .get(id)
            .ok_or(Error::UnknownConnection(id))?;
        connection.send_message(message)
    }
}

fn accept_loop(inner: &Arc<Inner>, listener: TcpListener) {
    for stream in listener.incoming() {
        if inner.stopping.load(Ordering::Acquire) {
            break;
        }
        match stream {
            Ok(stream) => {
                if let Err(err) = admit(inner, stream) {
                    warn!(error = %err, "failed to set up accepted connection");
                }
            }
            Err(err) => warn!(error = ?err, "failed to accept connection"),
        }
    }
    debug!("accept loop finished");
}

fn admit(inner: &Arc<Inner>, stream: TcpStream) -> Result<()> {
    let connection = Arc::new(Connection::new(stream, inner.config.connection)?);
    let id = connection.id();
    let peer = connection.peer_addr();

    let weak = Arc::downgrade(inner);
    connection.on_message(move |event| {
        if let Some(inner) = weak.upgrade() {
            inner.on_message.emit(event);
        }
    });

    let weak = Arc::downgrade(inner);
    connection.on_disconnect(move |event| {
        if let Some(inner) = weak.upgrade() {
            inner.registry.remove(event.id);
            info!(id = %event.id, peer = %event.peer, reason = %event.reason, "client disconnected");
            inner.on_disconnected.emit(event);
        }
    });

    inner.registry.add(Arc::clone(&connection));
    info!(%id, %peer, "client connected");

    let weak = Arc::downgrade(inner);
    connection.start_with(move || {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        // Skip the announcement if the connection was dropped before its
        // reader got going.
        if inner.registry.get(id).is_some() {
            inner.on_connected.emit(&Connected { id, peer });
        }
    })
}

fn wake_address(local: SocketAddr) -> SocketAddr {
    let ip = match local.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    SocketAddr::new(ip, local.port())
}
