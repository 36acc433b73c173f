//! A single client socket.
//!
//! Every [`Connection`] owns a framing thread that turns inbound bytes into
//! [`Request`]s and appends them to the connection's [`RequestQueue`]. The
//! queue is drained elsewhere, normally by the server's processing thread,
//! through [`Connection::process_requests`].
//!
//! # Lifecycle
//!
//! ```text
//! Unopened --open()--> Open --close() / peer hangs up--> Closed
//! ```
//!
//! `Closed` is terminal; both `open` and `close` are no-ops outside the state
//! they leave.
use std::{
    fmt,
    hash::{Hash, Hasher},
    io::{self, BufReader, BufWriter, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream},
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    thread::{self, JoinHandle},
};

use log::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::{
    FrameReader, FrameWriter, HANDSHAKE, Request, RequestHandler, RequestQueue, SocketReader,
    SocketWriter, TransportError, registry::Registry,
};

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Unopened,
    Open,
    Closed,
}

/// Which side ended the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Client,
    Server,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Client => write!(f, "Client"),
            Origin::Server => write!(f, "Server"),
        }
    }
}

pub struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    socket: TcpStream,
    header_len: usize,
    state: Mutex<State>,
    queue: RequestQueue,
    reader: Mutex<Option<SocketReader>>,
    writer: Mutex<SocketWriter>,
    listener: Mutex<Option<JoinHandle<()>>>,
    registry: Weak<Registry>,
    handler: Arc<dyn RequestHandler>,
}

impl Connection {
    pub(crate) fn new(
        socket: TcpStream,
        header_len: usize,
        registry: Weak<Registry>,
        handler: Arc<dyn RequestHandler>,
    ) -> io::Result<Self> {
        let peer = socket.peer_addr()?;
        let reader = FrameReader::new(
            Box::new(BufReader::new(socket.try_clone()?)) as Box<dyn Read + Send>
        );
        let writer = FrameWriter::new(
            Box::new(BufWriter::new(socket.try_clone()?)) as Box<dyn Write + Send>
        );

        Ok(Self {
            id: ConnectionId::new(),
            peer,
            socket,
            header_len,
            state: Mutex::new(State::Unopened),
            queue: RequestQueue::new(),
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(writer),
            listener: Mutex::new(None),
            registry,
            handler,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> State {
        *self.lock_state()
    }

    /// Number of requests waiting to be processed.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Starts the framing thread. A connection can only be opened once.
    pub fn open(self: &Arc<Self>) {
        // Held from the state change until the handle is stored, so a racing
        // close() always finds the handle to join.
        let mut listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
        {
            let mut state = self.lock_state();
            if *state != State::Unopened {
                return;
            }
            *state = State::Open;
        }

        let Some(reader) = self.reader.lock().unwrap_or_else(PoisonError::into_inner).take()
        else {
            return;
        };

        let connection = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("gml-conn-{}", self.peer))
            .spawn(move || connection.listen(reader));

        match spawned {
            Ok(handle) => *listener = Some(handle),
            Err(e) => {
                drop(listener);
                error!("unable to start listener for {}: {e}", self.peer);
                self.close();
            }
        }
    }

    /// Handles every queued request in order, writing responses to the socket.
    ///
    /// Returns how many requests were handled. Write faults are logged and do
    /// not stop the drain.
    pub fn process_requests(&self) -> usize {
        let mut handled = 0;

        while let Some(request) = self.queue.pop() {
            if self.state() == State::Closed {
                debug!("{}: dropping {request:?} on closed connection", self.peer);
                continue;
            }

            let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
            let written = self
                .handler
                .fulfill(self, request, &mut writer)
                .and_then(|_| writer.flush());
            if let Err(e) = written {
                warn!("{}: unable to write output stream: {e}", self.peer);
            }
            handled += 1;
        }

        handled
    }

    /// Closes the socket, leaves the server's connection set and waits for the
    /// framing thread. Only an open connection can be closed.
    pub fn close(&self) {
        self.close_from(Origin::Server);
    }

    fn close_from(&self, origin: Origin) {
        {
            let mut state = self.lock_state();
            if *state != State::Open {
                return;
            }
            *state = State::Closed;
        }

        info!("Disconnect [{origin}]: {}", self.peer);

        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.id);
        }

        if let Err(e) = self.socket.shutdown(Shutdown::Both) {
            if e.kind() != io::ErrorKind::NotConnected {
                warn!("error closing connection {}: {e}", self.peer);
            }
        }

        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = listener {
            // The framing thread closes itself on hang-up and is already on its way out.
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                error!("listener for {} panicked", self.peer);
            }
        }
    }

    fn listen(&self, mut reader: SocketReader) {
        while self.state() == State::Open {
            match read_frame(&mut reader, self.header_len, self.handler.as_ref()) {
                Ok(Some(request)) => {
                    trace!("{}: queued {request:?}", self.peer);
                    self.queue.push(request);
                }
                Ok(None) => {}
                Err(_) if self.state() == State::Closed => break,
                Err(e) if e.is_disconnect() => {
                    self.close_from(Origin::Client);
                    break;
                }
                Err(e) => warn!("{}: unable to read input stream: {e}", self.peer),
            }
        }

        debug!("listener for {} exited", self.peer);
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Reads one `[marker][header][u16 tag][u8 opcode][payload]` frame.
///
/// Frames with a foreign tag, and opcodes the handler does not know, yield
/// `Ok(None)`. Nothing is done to find the next frame boundary.
pub(crate) fn read_frame(
    reader: &mut SocketReader,
    header_len: usize,
    handler: &dyn RequestHandler,
) -> Result<Option<Request>, TransportError> {
    reader.read_u8()?;
    reader.skip(header_len.saturating_sub(1))?;

    if reader.read_u16()? != HANDSHAKE {
        return Ok(None);
    }

    let code = reader.read_u8()?;
    handler.decode(code, reader)
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Connection {}

impl Hash for Connection {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .field("pending", &self.pending())
            .finish()
    }
}
