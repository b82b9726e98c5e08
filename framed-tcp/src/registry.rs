//! Thread-safe set of live server-side connections.
//!
//! The mutex guards membership only. It is held while inserting, removing or
//! copying the member list and released before any socket I/O happens, so a
//! slow peer can never stall registration or removal of other connections.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use tracing::warn;

use crate::{
    connection::{Connection, ConnectionId},
    error::Result,
    framing,
    message::Message,
};

#[derive(Debug, Default)]
pub struct Registry {
    connections: Mutex<HashMap<ConnectionId, Arc<Connection>>>,
}

/// Outcome of one [`Registry::broadcast`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: Vec<ConnectionId>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an open connection.
    ///
    /// Returns `false` for a duplicate or an already closed connection, so a
    /// connection that went through removal cannot come back.
    pub fn add(&self, connection: Arc<Connection>) -> bool {
        if !connection.is_open() {
            return false;
        }
        let mut connections = self.lock();
        if connections.contains_key(&connection.id()) {
            return false;
        }
        connections.insert(connection.id(), connection);
        true
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.lock().remove(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.lock().get(&id).cloned()
    }

    /// Copies the current members out from under the lock.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encodes `message` once and writes it to every current member.
    ///
    /// A member whose write fails is closed by the failed send and removed
    /// here; delivery to the remaining members continues regardless.
    pub fn broadcast(&self, message: &Message) -> Result<BroadcastReport> {
        let frame = framing::encode(message)?;
        let members = self.snapshot();

        let mut report = BroadcastReport {
            attempted: members.len(),
            ..BroadcastReport::default()
        };

        for connection in members {
            match connection.send_frame(&frame) {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    warn!(
                        id = %connection.id(),
                        peer = %connection.peer_addr(),
                        error = %err,
                        "broadcast delivery failed; dropping connection"
                    );
                    self.remove(connection.id());
                    report.failed.push(connection.id());
                }
            }
        }

        Ok(report)
    }

    /// Empties the registry, returning what it held.
    pub(crate) fn drain(&self) -> Vec<Arc<Connection>> {
        self.lock().drain().map(|(_, connection)| connection).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ConnectionId, Arc<Connection>>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::{TcpListener, TcpStream},
        thread,
        time::Duration,
    };

    use super::*;
    use crate::{config::ConnectionOptions, events::CloseReason, framing::DEFAULT_MAX_PAYLOAD_LEN};

    fn pair(listener: &TcpListener) -> (Arc<Connection>, TcpStream) {
        let addr = listener.local_addr().expect("local addr");
        let stream = TcpStream::connect(addr).expect("connect");
        let (peer, _) = listener.accept().expect("accept");
        let connection = Connection::new(stream, ConnectionOptions::default()).expect("wrap");
        (Arc::new(connection), peer)
    }

    #[test]
    fn add_rejects_duplicates_and_closed_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let registry = Registry::new();
        let (first, _peer_one) = pair(&listener);
        let (second, _peer_two) = pair(&listener);

        assert!(registry.add(Arc::clone(&first)));
        assert!(!registry.add(Arc::clone(&first)));

        second.disconnect();
        assert!(!registry.add(Arc::clone(&second)));
        assert_eq!(registry.len(), 1);

        let removed = registry.remove(first.id()).expect("was registered");
        assert_eq!(removed.id(), first.id());
        assert!(registry.is_empty());
    }

    #[test]
    fn broadcast_reaches_everyone_despite_a_dead_member() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let registry = Registry::new();

        let mut peers = Vec::new();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let (connection, peer) = pair(&listener);
            ids.push(connection.id());
            assert!(registry.add(connection));
            peers.push(peer);
        }

        // The middle member dies between registration and broadcast.
        let dead = registry.get(ids[1]).expect("registered");
        dead.disconnect();

        let report = registry
            .broadcast(&Message::new(1, b"pong".to_vec()))
            .expect("broadcast");
        assert_eq!(report.attempted, 3);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, vec![ids[1]]);
        assert_eq!(registry.len(), 2);
        assert!(registry.get(ids[1]).is_none());

        for index in [0, 2] {
            let peer = &mut peers[index];
            peer.set_read_timeout(Some(Duration::from_secs(3)))
                .expect("timeout");
            let message = framing::read_frame(peer, DEFAULT_MAX_PAYLOAD_LEN)
                .expect("frame")
                .expect("message");
            assert_eq!(message, Message::new(1, b"pong".to_vec()));
        }
    }

    #[test]
    fn broadcast_drops_a_member_whose_peer_vanished() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let registry = Registry::new();
        let (alive, mut alive_peer) = pair(&listener);
        let (gone, gone_peer) = pair(&listener);
        let disconnects = gone.disconnects();
        registry.add(Arc::clone(&alive));
        registry.add(Arc::clone(&gone));

        drop(gone_peer);

        // Writes succeed locally until the peer's reset comes back.
        let mut sent = 0;
        let report = loop {
            assert!(sent < 100, "broadcast never noticed the vanished peer");
            let report = registry.broadcast(&Message::signal(sent)).expect("broadcast");
            sent += 1;
            if !report.failed.is_empty() {
                break report;
            }
            thread::sleep(Duration::from_millis(5));
        };

        assert_eq!(report.failed, vec![gone.id()]);
        assert_eq!(report.delivered, 1);
        assert_eq!(registry.len(), 1);
        assert!(!gone.is_open());
        let event = disconnects.recv_timeout(Duration::from_secs(3)).expect("disconnect");
        assert!(matches!(event.reason, CloseReason::Io(_)));

        alive_peer
            .set_read_timeout(Some(Duration::from_secs(3)))
            .expect("timeout");
        for code in 0..sent {
            let message = framing::read_frame(&mut alive_peer, DEFAULT_MAX_PAYLOAD_LEN)
                .expect("frame")
                .expect("message");
            assert_eq!(message, Message::signal(code));
        }
    }

    #[test]
    fn snapshot_is_detached_from_later_mutation() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let registry = Registry::new();
        let (connection, _peer) = pair(&listener);
        registry.add(Arc::clone(&connection));

        let snapshot = registry.snapshot();
        registry.remove(connection.id());

        assert_eq!(snapshot.len(), 1);
        assert!(registry.is_empty());
    }
}
