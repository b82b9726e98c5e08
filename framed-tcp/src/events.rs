//! Notifications raised by connections, servers and clients.
//!
//! Every notification source owns a [`Subscribers`] list. Callbacks run
//! synchronously on the thread that raised the event, which for message and
//! disconnect events is the connection's own read thread. A slow callback
//! therefore delays further reads on that one connection only.

use std::{
    fmt, io,
    net::SocketAddr,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, PoisonError, RwLock},
};

use crossbeam_channel::{Receiver, unbounded};
use tracing::warn;

use crate::{connection::ConnectionId, message::Message};

/// A server accepted a new connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connected {
    pub id: ConnectionId,
    pub peer: SocketAddr,
}

/// A complete frame arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageReceived {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub message: Message,
}

/// A connection moved to the closed state. Raised exactly once per connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnected {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub reason: CloseReason,
}

/// What ended a connection.
///
/// Purely informational: every reason goes through the same disconnect path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `disconnect` was called, or the owner was dropped.
    Local,
    /// The peer closed the stream on a frame boundary.
    PeerClosed,
    /// A read or write on the socket failed.
    Io(io::ErrorKind),
    /// The peer sent something that is not a valid frame.
    Frame(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Local => f.write_str("closed locally"),
            CloseReason::PeerClosed => f.write_str("closed by peer"),
            CloseReason::Io(kind) => write!(f, "i/o failure ({kind})"),
            CloseReason::Frame(detail) => write!(f, "protocol error ({detail})"),
        }
    }
}

/// Returns `false` once the subscriber wants no further events.
type Callback<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// An explicit list of callbacks for one kind of event.
pub struct Subscribers<E: 'static> {
    callbacks: RwLock<Vec<Callback<E>>>,
}

impl<E: 'static> Default for Subscribers<E> {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
        }
    }
}

impl<E: 'static> fmt::Debug for Subscribers<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscribers")
            .field("len", &self.len())
            .finish()
    }
}

impl<E: 'static> Subscribers<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.subscribe_until(move |event| {
            callback(event);
            true
        });
    }

    fn subscribe_until<F>(&self, callback: F)
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    pub fn len(&self) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invokes every current subscriber with `event`.
    ///
    /// The list is copied before any callback runs, so callbacks may
    /// subscribe further handlers without deadlocking. A panicking callback
    /// is logged and skipped. Returns how many callbacks panicked.
    pub fn emit(&self, event: &E) -> usize {
        let snapshot: Vec<Callback<E>> = self
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut failures = 0;
        let mut finished = Vec::new();
        for callback in snapshot {
            match panic::catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(true) => {}
                Ok(false) => finished.push(callback),
                Err(_) => {
                    failures += 1;
                    warn!("event subscriber panicked; continuing with remaining subscribers");
                }
            }
        }

        if !finished.is_empty() {
            self.callbacks
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|callback| !finished.iter().any(|done| Arc::ptr_eq(done, callback)));
        }
        failures
    }
}

impl<E: Clone + Send + 'static> Subscribers<E> {
    /// Subscribes a callback that forwards a clone of every event to the
    /// returned receiver. The subscription ends at the first event emitted
    /// after the receiver is dropped.
    pub fn channel(&self) -> Receiver<E> {
        let (tx, rx) = unbounded();
        self.subscribe_until(move |event: &E| tx.send(event.clone()).is_ok());
        rx
    }
}
