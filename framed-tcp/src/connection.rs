//! One endpoint of an established TCP stream.
//!
//! A [`Connection`] owns three handles onto the same socket:
//!
//! - the read half, moved into a dedicated reader thread by [`Connection::start`],
//! - the write half, guarded by a mutex so concurrent senders never interleave frames,
//! - a control handle used only to shut the socket down.
//!
//! Shutting the socket down is the only way a blocked read is interrupted.
//! Threads are never killed; `disconnect` shuts the socket, the pending read
//! returns, and the reader thread is joined.
//!
//! Closing and notifying are separate steps. Whoever closes first records the
//! reason; the reader thread raises `Disconnected` once it leaves its loop, so
//! the notification never overlaps a message callback of the same connection.
//! A connection whose reader never ran is notified on the closing thread.

use std::{
    fmt,
    io::Write,
    mem,
    net::{Shutdown, SocketAddr, TcpStream},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
};

use crossbeam_channel::Receiver;
use tracing::{debug, info, warn};

use crate::{
    config::ConnectionOptions,
    error::{Error, Result},
    events::{CloseReason, Disconnected, MessageReceived, Subscribers},
    framing::{self, FrameError},
    message::Message,
};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique identity of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Open,
    Closed,
}

pub struct Connection {
    shared: Arc<Shared>,
    reader: Mutex<ReaderSlot>,
}

enum ReaderSlot {
    /// Created but `start` not called yet; holds the read half.
    Idle(TcpStream),
    Running(JoinHandle<()>),
    Finished,
}

struct Shared {
    id: ConnectionId,
    peer: SocketAddr,
    local: SocketAddr,
    max_payload_len: usize,
    writer: Mutex<TcpStream>,
    control: TcpStream,
    closed: AtomicBool,
    /// Reason recorded by the first close, taken by the single notification.
    pending: Mutex<Option<CloseReason>>,
    on_message: Subscribers<MessageReceived>,
    on_disconnect: Subscribers<Disconnected>,
}

impl Connection {
    /// Wraps an already connected stream. No data is read until [`start`](Self::start).
    pub fn new(stream: TcpStream, options: ConnectionOptions) -> Result<Self> {
        options.validate()?;
        stream.set_nodelay(options.nodelay)?;
        let peer = stream.peer_addr()?;
        let local = stream.local_addr()?;
        let read_half = stream.try_clone()?;
        let control = stream.try_clone()?;

        let shared = Shared {
            id: ConnectionId::next(),
            peer,
            local,
            max_payload_len: options.max_payload_len,
            writer: Mutex::new(stream),
            control,
            closed: AtomicBool::new(false),
            pending: Mutex::new(None),
            on_message: Subscribers::new(),
            on_disconnect: Subscribers::new(),
        };

        Ok(Self {
            shared: Arc::new(shared),
            reader: Mutex::new(ReaderSlot::Idle(read_half)),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local
    }

    pub fn state(&self) -> State {
        if self.shared.is_closed() {
            State::Closed
        } else {
            State::Open
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == State::Open
    }

    pub fn on_message<F>(&self, callback: F)
    where
        F: Fn(&MessageReceived) + Send + Sync + 'static,
    {
        self.shared.on_message.subscribe(callback);
    }

    pub fn on_disconnect<F>(&self, callback: F)
    where
        F: Fn(&Disconnected) + Send + Sync + 'static,
    {
        self.shared.on_disconnect.subscribe(callback);
    }

    /// Channel fed with every message received from now on.
    pub fn messages(&self) -> Receiver<MessageReceived> {
        self.shared.on_message.channel()
    }

    /// Channel that receives the single disconnect notification.
    pub fn disconnects(&self) -> Receiver<Disconnected> {
        self.shared.on_disconnect.channel()
    }

    /// Spawns the reader thread. Calling it again is a no-op.
    ///
    /// Subscribe before starting: events raised earlier have no audience.
    pub fn start(&self) -> Result<()> {
        self.start_with(|| {})
    }

    /// Like [`start`](Self::start), running `on_start` on the reader thread
    /// before the first read.
    pub(crate) fn start_with<F>(&self, on_start: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut slot = self.reader.lock().unwrap_or_else(PoisonError::into_inner);
        let stream = match mem::replace(&mut *slot, ReaderSlot::Finished) {
            ReaderSlot::Idle(stream) => stream,
            other => {
                *slot = other;
                return Ok(());
            }
        };

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("framed-tcp-conn-{}", self.shared.id.get()))
            .spawn(move || {
                on_start();
                read_loop(&shared, stream);
            });

        match spawned {
            Ok(handle) => {
                *slot = ReaderSlot::Running(handle);
                Ok(())
            }
            Err(err) => {
                drop(slot);
                self.shared.close(CloseReason::Io(err.kind()));
                self.shared.notify_disconnect();
                Err(err.into())
            }
        }
    }

    /// Sends one frame. Concurrent callers are serialized per connection.
    pub fn send(&self, code: i32, payload: &[u8]) -> Result<()> {
        let frame = framing::encode_parts(code, payload)?;
        self.send_frame(&frame)
    }

    pub fn send_message(&self, message: &Message) -> Result<()> {
        self.send(message.code, &message.payload)
    }

    /// Sends `text` as UTF-8 with code 0.
    pub fn send_text(&self, text: &str) -> Result<()> {
        self.send(0, text.as_bytes())
    }

    /// Writes an already encoded frame.
    ///
    /// A failed write closes the connection and is returned, never retried.
    pub(crate) fn send_frame(&self, frame: &[u8]) -> Result<()> {
        if self.shared.is_closed() {
            return Err(Error::Closed);
        }
        let written = {
            let mut writer = self
                .shared
                .writer
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            writer.write_all(frame).and_then(|()| writer.flush())
        };

        if let Err(err) = written {
            warn!(id = %self.shared.id, peer = %self.shared.peer, error = %err, "write failed; closing connection");
            self.close(CloseReason::Io(err.kind()));
            return Err(err.into());
        }
        Ok(())
    }

    /// Closes the connection and waits for the reader thread to finish.
    ///
    /// Idempotent. When called from one of this connection's own callbacks
    /// the reader thread is left to wind down by itself.
    pub fn disconnect(&self) {
        self.close(CloseReason::Local);
        self.join_reader();
    }

    /// Marks the connection closed and shuts the socket down without waiting
    /// for the reader thread. Returns `false` if it was already closed.
    ///
    /// A running reader raises the disconnect notification when it exits;
    /// otherwise it is raised here.
    pub(crate) fn close(&self, reason: CloseReason) -> bool {
        if !self.shared.close(reason) {
            return false;
        }
        let reader_running = matches!(
            *self.reader.lock().unwrap_or_else(PoisonError::into_inner),
            ReaderSlot::Running(_)
        );
        if !reader_running {
            self.shared.notify_disconnect();
        }
        true
    }

    fn join_reader(&self) {
        let handle = {
            let mut slot = self.reader.lock().unwrap_or_else(PoisonError::into_inner);
            match mem::replace(&mut *slot, ReaderSlot::Finished) {
                ReaderSlot::Running(handle) if handle.thread().id() == thread::current().id() => {
                    *slot = ReaderSlot::Running(handle);
                    return;
                }
                ReaderSlot::Running(handle) => handle,
                ReaderSlot::Idle(_) | ReaderSlot::Finished => return,
            }
        };

        if handle.join().is_err() {
            warn!(id = %self.shared.id, "reader thread panicked");
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("peer", &self.shared.peer)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // The reader thread only holds `Shared`, so it exits on its own once
        // the socket is shut down.
        self.close(CloseReason::Local);
    }
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self, reason: CloseReason) -> bool {
        {
            // The reason lands under the same lock that `notify_disconnect`
            // takes, so the reader can never observe the flag without it.
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            if self.closed.swap(true, Ordering::AcqRel) {
                return false;
            }
            *pending = Some(reason);
        }

        if let Err(err) = self.control.shutdown(Shutdown::Both) {
            debug!(id = %self.id, error = ?err, "socket shutdown reported an error");
        }
        true
    }

    /// Raises `Disconnected` with the recorded reason. Only the first call
    /// after a close does anything.
    fn notify_disconnect(&self) {
        let Some(reason) = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        info!(id = %self.id, peer = %self.peer, %reason, "connection closed");
        self.on_disconnect.emit(&Disconnected {
            id: self.id,
            peer: self.peer,
            reason,
        });
    }
}

fn read_loop(shared: &Shared, mut stream: TcpStream) {
    let reason = loop {
        match framing::read_frame(&mut stream, shared.max_payload_len) {
            Ok(Some(message)) => {
                if shared.is_closed() {
                    break CloseReason::Local;
                }
                debug!(
                    id = %shared.id,
                    code = message.code,
                    len = message.payload.len(),
                    "frame received"
                );
                shared.on_message.emit(&MessageReceived {
                    id: shared.id,
                    peer: shared.peer,
                    message,
                });
            }
            Ok(None) => break CloseReason::PeerClosed,
            Err(FrameError::Io(err)) => break CloseReason::Io(err.kind()),
            Err(err) => {
                warn!(id = %shared.id, peer = %shared.peer, error = %err, "dropping connection after invalid frame");
                break CloseReason::Frame(err.to_string());
            }
        }
    };

    shared.close(reason);
    shared.notify_disconnect();
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, io::Write, net::TcpListener, time::Duration};

    use super::*;
    use crate::framing::DEFAULT_MAX_PAYLOAD_LEN;

    const WAIT: Duration = Duration::from_secs(3);

    fn pair() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let stream = TcpStream::connect(addr).expect("connect");
        let (peer, _) = listener.accept().expect("accept");
        let connection = Connection::new(stream, ConnectionOptions::default()).expect("wrap");
        (connection, peer)
    }

    #[test]
    fn double_disconnect_notifies_once() {
        let (connection, _peer) = pair();
        let disconnects = connection.disconnects();
        connection.start().expect("start");

        connection.disconnect();
        connection.disconnect();

        let event = disconnects.recv_timeout(WAIT).expect("disconnect event");
        assert_eq!(event.reason, CloseReason::Local);
        assert_eq!(event.id, connection.id());
        assert!(disconnects.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(connection.state(), State::Closed);
    }

    #[test]
    fn peer_close_is_reported_as_disconnect() {
        let (connection, peer) = pair();
        let disconnects = connection.disconnects();
        connection.start().expect("start");

        drop(peer);

        let event = disconnects.recv_timeout(WAIT).expect("disconnect event");
        assert_eq!(event.reason, CloseReason::PeerClosed);
        assert!(!connection.is_open());
    }

    #[test]
    fn messages_arrive_in_send_order() {
        let (connection, mut peer) = pair();
        let messages = connection.messages();
        connection.start().expect("start");

        for code in 0..20 {
            let frame = framing::encode(&Message::new(code, vec![code as u8; 3])).expect("encode");
            peer.write_all(&frame).expect("write");
        }

        for code in 0..20 {
            let event = messages.recv_timeout(WAIT).expect("message");
            assert_eq!(event.message, Message::new(code, vec![code as u8; 3]));
            assert_eq!(event.peer, connection.peer_addr());
        }
    }

    #[test]
    fn concurrent_sends_never_interleave() {
        const THREADS: i32 = 8;
        const PER_THREAD: i32 = 50;

        let (connection, mut peer) = pair();
        let connection = Arc::new(connection);

        let receiver = thread::spawn(move || {
            let mut next_seq: HashMap<i32, i32> = HashMap::new();
            for _ in 0..THREADS * PER_THREAD {
                let message = framing::read_frame(&mut peer, DEFAULT_MAX_PAYLOAD_LEN)
                    .expect("frame")
                    .expect("message");
                let seq = next_seq.entry(message.code).or_insert(0);
                assert_eq!(message.payload.len(), 512 + *seq as usize);
                assert!(message.payload.iter().all(|byte| *byte == message.code as u8));
                *seq += 1;
            }
            next_seq
        });

        let handles: Vec<_> = (0..THREADS)
            .map(|thread_no| {
                let connection = Arc::clone(&connection);
                thread::spawn(move || {
                    for seq in 0..PER_THREAD {
                        let payload = vec![thread_no as u8; 512 + seq as usize];
                        connection.send(thread_no, &payload).expect("send");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("sender thread");
        }

        let next_seq = receiver.join().expect("receiver thread");
        assert_eq!(next_seq.len(), THREADS as usize);
        assert!(next_seq.values().all(|count| *count == PER_THREAD));
    }

    #[test]
    fn corrupt_length_closes_the_connection() {
        let (connection, mut peer) = pair();
        let disconnects = connection.disconnects();
        let messages = connection.messages();
        connection.start().expect("start");

        let mut bytes = (-5i32).to_le_bytes().to_vec();
        bytes.extend(1i32.to_le_bytes());
        peer.write_all(&bytes).expect("write");

        let event = disconnects.recv_timeout(WAIT).expect("disconnect");
        assert!(matches!(event.reason, CloseReason::Frame(_)));
        assert!(messages.try_recv().is_err());
    }

    #[test]
    fn send_after_disconnect_fails_with_closed() {
        let (connection, _peer) = pair();
        connection.start().expect("start");
        connection.disconnect();

        assert!(matches!(connection.send_text("late"), Err(Error::Closed)));
    }

    #[test]
    fn disconnect_from_own_callback_does_not_deadlock() {
        let (connection, mut peer) = pair();
        let connection = Arc::new(connection);
        let disconnects = connection.disconnects();

        let weak = Arc::downgrade(&connection);
        connection.on_message(move |_| {
            if let Some(connection) = weak.upgrade() {
                connection.disconnect();
            }
        });
        connection.start().expect("start");

        peer.write_all(&framing::encode(&Message::signal(9)).expect("encode"))
            .expect("write");

        let event = disconnects.recv_timeout(WAIT).expect("disconnect");
        assert_eq!(event.reason, CloseReason::Local);
    }

    #[test]
    fn disconnect_is_reported_on_the_reader_after_message_callbacks() {
        let (connection, mut peer) = pair();
        let log = Arc::new(Mutex::new(Vec::<String>::new()));
        let (started_tx, started_rx) = crossbeam_channel::bounded(1);

        let message_log = Arc::clone(&log);
        connection.on_message(move |_| {
            message_log.lock().expect("log").push("message start".to_string());
            let _ = started_tx.send(());
            thread::sleep(Duration::from_millis(300));
            message_log.lock().expect("log").push("message end".to_string());
        });
        let disconnect_log = Arc::clone(&log);
        connection.on_disconnect(move |_| {
            let name = thread::current().name().unwrap_or("unnamed").to_string();
            disconnect_log
                .lock()
                .expect("log")
                .push(format!("disconnect on {name}"));
        });
        connection.start().expect("start");

        peer.write_all(&framing::encode(&Message::signal(1)).expect("encode"))
            .expect("write");
        started_rx
            .recv_timeout(WAIT)
            .expect("message callback started");
        connection.disconnect();

        let reader = format!("framed-tcp-conn-{}", connection.id().get());
        assert_eq!(
            *log.lock().expect("log"),
            vec![
                "message start".to_string(),
                "message end".to_string(),
                format!("disconnect on {reader}"),
            ]
        );
    }

    #[test]
    fn failed_write_closes_the_connection() {
        let (connection, peer) = pair();
        let disconnects = connection.disconnects();
        drop(peer);

        // The first write after the peer left may still be accepted locally.
        let err = (0..100)
            .find_map(|_| {
                let result = connection.send(1, &[0u8; 1024]);
                thread::sleep(Duration::from_millis(5));
                result.err()
            })
            .expect("writes to a vanished peer eventually fail");

        assert!(matches!(err, Error::Io(_)));
        assert_eq!(connection.state(), State::Closed);
        let event = disconnects.recv_timeout(WAIT).expect("disconnect");
        assert!(matches!(event.reason, CloseReason::Io(_)));
        assert!(matches!(connection.send_text("late"), Err(Error::Closed)));
    }
}
