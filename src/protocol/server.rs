use std::{
    fmt, io,
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread,
    time::Duration,
};

use log::{debug, info, warn};
use thiserror::Error;

use crate::Config;

use super::{
    Connection, ConnectionId, IdentityHandler, RequestHandler,
    registry::Registry,
    thread::{RunFlag, Worker},
};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("unable to listen at {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("unable to start {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },
}

/// Accepts clients and drains their request queues.
///
/// Accepting and processing run on separate threads and are started and
/// stopped independently. A closed server can be opened again.
pub struct Server {
    config: Config,
    port: u16,
    registry: Arc<Registry>,
    handler: Arc<dyn RequestHandler>,
    listener: Mutex<Option<TcpListener>>,
    acceptor: Mutex<Option<Worker<TcpListener>>>,
    processor: Mutex<Option<Worker<()>>>,
}

impl Server {
    /// Binds a server answering the built-in opcodes.
    pub fn bind(config: Config) -> Result<Self, ServerError> {
        Self::with_handler(config, IdentityHandler)
    }

    pub fn with_handler(
        config: Config,
        handler: impl RequestHandler + 'static,
    ) -> Result<Self, ServerError> {
        let address = config.socket_addr();
        let listener = bind(address)?;
        let port = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { address, source })?
            .port();

        info!("listening at {}", SocketAddr::new(config.address, port));
        Ok(Self {
            config,
            port,
            registry: Arc::new(Registry::default()),
            handler: Arc::new(handler),
            listener: Mutex::new(Some(listener)),
            acceptor: Mutex::new(None),
            processor: Mutex::new(None),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_open(&self) -> bool {
        lock(&self.acceptor).is_some()
    }

    pub fn is_processing(&self) -> bool {
        lock(&self.processor).is_some()
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.registry.snapshot()
    }

    pub fn connection(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.registry.get(id)
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Starts accepting clients; every client gets its own [`Connection`].
    ///
    /// Re-binds the port if a previous [`close`](Self::close) released it.
    pub fn open(&self) -> Result<(), ServerError> {
        let mut acceptor = lock(&self.acceptor);
        if acceptor.is_some() {
            return Ok(());
        }

        let address = SocketAddr::new(self.config.address, self.port);
        let listener = match lock(&self.listener).take() {
            Some(listener) => listener,
            None => bind(address)?,
        };
        listener
            .set_nonblocking(true)
            .map_err(|source| ServerError::Bind { address, source })?;

        let registry = Arc::clone(&self.registry);
        let handler = Arc::clone(&self.handler);
        let header_len = self.config.header_len;
        let poll = self.config.accept_poll;

        let worker = Worker::spawn("gml-acceptor", move |running| {
            accept_loop(&listener, &running, poll, |socket| {
                register(socket, header_len, &registry, &handler)
            });
            listener
        })
        .map_err(|source| ServerError::Spawn {
            name: "acceptor",
            source,
        })?;

        *acceptor = Some(worker);
        info!("accepting connections on port {}", self.port);
        Ok(())
    }

    /// Starts sweeping every connection's queue on a processing thread.
    pub fn start_processing_requests(&self) -> Result<(), ServerError> {
        let mut processor = lock(&self.processor);
        if processor.is_some() {
            return Ok(());
        }

        let registry = Arc::clone(&self.registry);
        let idle = self.config.idle_backoff;
        let worker = Worker::spawn("gml-processor", move |running| {
            process_loop(&registry, &running, idle)
        })
        .map_err(|source| ServerError::Spawn {
            name: "processing",
            source,
        })?;

        *processor = Some(worker);
        info!("processing requests");
        Ok(())
    }

    /// Waits for the current sweep to finish and stops processing. Queued
    /// requests stay queued until processing starts again.
    pub fn stop_processing_requests(&self) {
        let worker = lock(&self.processor).take();
        if let Some(worker) = worker {
            worker.stop();
            info!("stopped processing requests");
        }
    }

    /// Stops accepting and processing, closes every connection and releases the
    /// listening socket. Pending requests are not handled.
    pub fn close(&self) {
        let acceptor = lock(&self.acceptor).take();
        if let Some(worker) = acceptor {
            drop(worker.stop());
        }
        drop(lock(&self.listener).take());

        self.stop_processing_requests();

        for connection in self.registry.snapshot() {
            connection.close();
        }
        info!("closed server on port {}", self.port);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("port", &self.port)
            .field("open", &self.is_open())
            .field("processing", &self.is_processing())
            .field("connections", &self.connection_count())
            .finish()
    }
}

fn bind(address: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(address).map_err(|source| ServerError::Bind { address, source })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn accept_loop<F>(listener: &TcpListener, running: &RunFlag, poll: Duration, mut register: F)
where
    F: FnMut(TcpStream) -> io::Result<()>,
{
    while running.is_set() {
        match listener.accept() {
            Ok((socket, address)) => {
                info!("Connected [CLIENT/SERVER]: {address}");
                if let Err(e) = register(socket) {
                    warn!("failed to accept connection from {address}: {e}");
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(poll),
            Err(e) => {
                warn!("failed to accept connection: {e}");
                thread::sleep(poll);
            }
        }
    }
}

fn register(
    socket: TcpStream,
    header_len: usize,
    registry: &Arc<Registry>,
    handler: &Arc<dyn RequestHandler>,
) -> io::Result<()> {
    // Some platforms hand out sockets inheriting the listener's non-blocking mode.
    socket.set_nonblocking(false)?;

    let connection = Arc::new(Connection::new(
        socket,
        header_len,
        Arc::downgrade(registry),
        Arc::clone(handler),
    )?);
    registry.insert(Arc::clone(&connection));
    connection.open();

    debug!("registered connection {}", connection.id());
    Ok(())
}

/// Drains every connection in turn; one connection's queue is emptied before
/// the next one is touched.
fn process_loop(registry: &Registry, running: &RunFlag, idle: Duration) {
    while running.is_set() {
        let handled: usize = registry
            .snapshot()
            .iter()
            .map(|connection| connection.process_requests())
            .sum();

        if handled == 0 {
            thread::sleep(idle);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::Ipv4Addr,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use crate::protocol::{
        HANDSHAKE, State,
        testing::{frame, read_identity, wait_until},
    };

    use super::*;

    fn config() -> Config {
        Config {
            address: Ipv4Addr::LOCALHOST.into(),
            port: 0,
            accept_poll: Duration::from_millis(5),
            ..Config::default()
        }
    }

    fn client(server: &Server) -> TcpStream {
        TcpStream::connect((Ipv4Addr::LOCALHOST, server.port())).unwrap()
    }

    fn only_connection(server: &Server) -> Arc<Connection> {
        assert!(wait_until(|| server.connection_count() == 1));
        server.connections().remove(0)
    }

    #[test]
    fn bind_fails_on_taken_port() {
        let server = Server::bind(config()).unwrap();
        let taken = Config {
            port: server.port(),
            ..config()
        };

        assert!(matches!(
            Server::bind(taken),
            Err(ServerError::Bind { .. })
        ));
    }

    #[test]
    fn open_twice_is_a_noop() {
        let server = Server::bind(config()).unwrap();
        server.open().unwrap();
        server.open().unwrap();

        assert!(server.is_open());
        let _client = client(&server);
        assert!(wait_until(|| server.connection_count() == 1));
    }

    #[test]
    fn identity_request_is_answered_after_a_sweep() {
        let server = Server::bind(config()).unwrap();
        server.open().unwrap();
        server.start_processing_requests().unwrap();

        let mut client = client(&server);
        let connection = only_connection(&server);
        client.write_all(&frame(HANDSHAKE, 1)).unwrap();

        let (tag, code, len, text) = read_identity(&mut client);
        assert_eq!((tag, code), (HANDSHAKE, 1));
        assert_eq!(text, connection.id().to_string());
        assert_eq!(len as usize, text.len() + 1);
    }

    #[test]
    fn every_client_is_answered_in_one_sweep() {
        let server = Server::bind(config()).unwrap();
        server.open().unwrap();

        let mut a = client(&server);
        assert!(wait_until(|| server.connection_count() == 1));
        let mut b = client(&server);
        assert!(wait_until(|| server.connection_count() == 2));

        for _ in 0..3 {
            a.write_all(&frame(HANDSHAKE, 1)).unwrap();
        }
        b.write_all(&frame(HANDSHAKE, 1)).unwrap();
        assert!(wait_until(|| {
            let mut pending: Vec<_> = server.connections().iter().map(|c| c.pending()).collect();
            pending.sort();
            pending == vec![1, 3]
        }));

        server.start_processing_requests().unwrap();

        let first = read_identity(&mut a).3;
        for _ in 0..2 {
            assert_eq!(read_identity(&mut a).3, first);
        }
        assert_ne!(read_identity(&mut b).3, first);
    }

    #[test]
    fn foreign_tag_never_enqueues() {
        let server = Server::bind(config()).unwrap();
        server.open().unwrap();

        let mut client = client(&server);
        let connection = only_connection(&server);

        let mut bytes = frame(0x0BAD, 1);
        bytes.extend(frame(HANDSHAKE, 1));
        client.write_all(&bytes).unwrap();

        assert!(wait_until(|| connection.pending() == 1));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(connection.pending(), 1);
    }

    #[test]
    fn unknown_opcode_keeps_connection_open() {
        let server = Server::bind(config()).unwrap();
        server.open().unwrap();
        server.start_processing_requests().unwrap();

        let mut client = client(&server);
        let connection = only_connection(&server);

        let mut bytes = frame(HANDSHAKE, 0x7F);
        bytes.extend(frame(HANDSHAKE, 1));
        client.write_all(&bytes).unwrap();

        assert_eq!(read_identity(&mut client).3, connection.id().to_string());
        assert_eq!(connection.state(), State::Open);
    }

    #[test]
    fn client_disconnect_leaves_the_set() {
        let server = Server::bind(config()).unwrap();
        server.open().unwrap();

        let client = client(&server);
        let connection = only_connection(&server);
        drop(client);

        assert!(wait_until(|| connection.state() == State::Closed));
        assert!(wait_until(|| server.connection_count() == 0));
        assert!(server.connection(&connection.id()).is_none());
    }

    #[test]
    fn client_reset_leaves_the_set() {
        let server = Server::bind(config()).unwrap();
        server.open().unwrap();

        let mut client = client(&server);
        let connection = only_connection(&server);
        client.write_all(&frame(HANDSHAKE, 1)).unwrap();
        assert!(wait_until(|| connection.pending() == 1));

        // An unread response in the client's buffer turns its close into a reset.
        server.start_processing_requests().unwrap();
        assert!(wait_until(|| connection.pending() == 0));
        thread::sleep(Duration::from_millis(50));
        client.write_all(&frame(HANDSHAKE, 1)[..5]).unwrap();
        drop(client);

        assert!(wait_until(|| connection.state() == State::Closed));
        assert!(wait_until(|| server.connection_count() == 0));
        assert!(wait_until(|| Arc::strong_count(&connection) == 1));
    }

    #[test]
    fn failed_registration_keeps_accepting() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        listener.set_nonblocking(true).unwrap();
        let address = listener.local_addr().unwrap();

        let attempts = Arc::new(AtomicUsize::new(0));
        let accepted = Arc::new(Mutex::new(Vec::new()));
        let worker = {
            let attempts = Arc::clone(&attempts);
            let accepted = Arc::clone(&accepted);
            Worker::spawn("acceptor", move |running| {
                accept_loop(&listener, &running, Duration::from_millis(5), |socket| {
                    if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                        return Err(io::Error::other("registration refused"));
                    }
                    accepted.lock().unwrap().push(socket);
                    Ok(())
                })
            })
            .unwrap()
        };

        let _first = TcpStream::connect(address).unwrap();
        assert!(wait_until(|| attempts.load(Ordering::SeqCst) == 1));
        let _second = TcpStream::connect(address).unwrap();
        assert!(wait_until(|| accepted.lock().unwrap().len() == 1));

        worker.stop();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn requests_survive_stopped_processing() {
        let server = Server::bind(config()).unwrap();
        server.open().unwrap();
        server.start_processing_requests().unwrap();
        server.stop_processing_requests();
        assert!(!server.is_processing());

        let mut client = client(&server);
        let connection = only_connection(&server);
        for _ in 0..3 {
            client.write_all(&frame(HANDSHAKE, 1)).unwrap();
        }
        assert!(wait_until(|| connection.pending() == 3));

        server.start_processing_requests().unwrap();
        for _ in 0..3 {
            assert_eq!(read_identity(&mut client).3, connection.id().to_string());
        }
    }

    #[test]
    fn stop_processing_without_start_is_a_noop() {
        let server = Server::bind(config()).unwrap();
        server.stop_processing_requests();

        assert!(!server.is_processing());
    }

    #[test]
    fn close_then_reopen() {
        let server = Server::bind(config()).unwrap();
        server.open().unwrap();
        server.start_processing_requests().unwrap();

        let mut first = client(&server);
        let connection = only_connection(&server);

        server.close();
        assert!(!server.is_open());
        assert!(!server.is_processing());
        assert_eq!(server.connection_count(), 0);
        assert_eq!(connection.state(), State::Closed);
        assert_eq!(first.read(&mut [0; 1]).unwrap(), 0);

        server.open().unwrap();
        server.start_processing_requests().unwrap();

        let mut second = client(&server);
        let connection = only_connection(&server);
        second.write_all(&frame(HANDSHAKE, 1)).unwrap();
        assert_eq!(read_identity(&mut second).3, connection.id().to_string());
    }
}
