//! Readiness-driven connection broker
//!
//! One loop thread waits on an epoll set holding the listening socket and a
//! shutdown eventfd. Accepted connections are either registered in the same
//! set and serviced on the loop thread (cooperative mode) or handed to a
//! dedicated service thread that polls the connection alongside its own
//! wakeup eventfd (per-connection mode).
//!
//! ```text
//!  listener ──┐                ┌─ Cooperative ──────► epoll (token per client)
//!  shutdown ──┼─► loop thread ─┤
//!  clients ───┘                └─ PerConnectionThread ► worker: poll(client, wakeup)
//!
//!  dispatch: read_more ─► try_handle_one_request ... until Ok(false)
//!            committed position restored after the final attempt
//! ```
//!
//! Teardown of a connection happens exactly once, in this order: mark it
//! disconnected, run the closing hook, stop and join its service thread
//! (unless called from that thread), deregister and close the socket,
//! forget the client.

use std::fmt;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::client::{Client, ClientId, StreamCapacities};
use super::error::BrokerError;
use super::handler::{ConnectionHandler, RequestHandler};
use super::poll::{self, Epoll, EventFd, Readiness};
use crate::paths::prepare_socket_path;
use crate::stream::{ClientSocket, InputStream};

const LISTENER_TOKEN: u64 = 0;
const SHUTDOWN_TOKEN: u64 = 1;
const FIRST_CLIENT_TOKEN: u64 = 2;
const MAX_EVENTS: usize = 16;

/// How accepted connections are serviced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConcurrencyMode {
    /// All connections share the broker's loop thread
    #[default]
    Cooperative,
    /// Each connection gets its own service thread
    PerConnectionThread,
}

/// Broker construction options
#[derive(Debug, Clone, Default)]
pub struct BrokerConfig {
    /// Connection servicing mode
    pub concurrency: ConcurrencyMode,
    /// Collect descriptors passed as control data on every read
    pub receive_ancillary: bool,
    /// Initial stream buffer sizes
    pub capacities: StreamCapacities,
}

impl BrokerConfig {
    /// Set the servicing mode
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: ConcurrencyMode) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Enable or disable descriptor reception
    #[must_use]
    pub fn with_ancillary(mut self, receive_ancillary: bool) -> Self {
        self.receive_ancillary = receive_ancillary;
        self
    }

    /// Set initial stream buffer sizes
    #[must_use]
    pub fn with_capacities(mut self, capacities: StreamCapacities) -> Self {
        self.capacities = capacities;
        self
    }
}

enum LoopState {
    Idle,
    Running(JoinHandle<()>),
    Stopped,
}

/// Unix-socket connection broker
///
/// Created bound and listening; [`start`](Self::start) launches the loop
/// thread and [`stop`](Self::stop) tears everything down. A stopped broker
/// cannot be restarted.
pub struct Broker<C, R>
where
    C: ConnectionHandler,
    R: RequestHandler<C::Session>,
{
    shared: Arc<Shared<C, R>>,
    state: Mutex<LoopState>,
}

struct Shared<C: ConnectionHandler, R> {
    socket_path: PathBuf,
    listener: Mutex<Option<UnixListener>>,
    epoll: Epoll,
    shutdown: EventFd,
    running: AtomicBool,
    config: BrokerConfig,
    connection_handler: C,
    request_handler: R,
    connections: DashMap<u64, Arc<Connection<C::Session>>>,
    next_token: AtomicU64,
}

struct Connection<S> {
    token: u64,
    fd: RawFd,
    alive: AtomicBool,
    client: Mutex<Client<S>>,
    wakeup: Option<EventFd>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<S> Connection<S> {
    fn new(token: u64, client: Client<S>, wakeup: Option<EventFd>) -> Self {
        Self {
            token,
            fd: client.raw_fd(),
            alive: AtomicBool::new(true),
            client: Mutex::new(client),
            wakeup,
            worker: Mutex::new(None),
        }
    }
}

impl<C, R> Broker<C, R>
where
    C: ConnectionHandler,
    R: RequestHandler<C::Session>,
{
    /// Bind `socket_path` and prepare the readiness set
    ///
    /// A stale socket file at the path is replaced; missing parent
    /// directories are created.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound or the epoll set and
    /// shutdown eventfd cannot be created. Nothing is left open on failure.
    pub fn create(
        socket_path: impl Into<PathBuf>,
        connection_handler: C,
        request_handler: R,
        config: BrokerConfig,
    ) -> Result<Self, BrokerError> {
        let socket_path = socket_path.into();
        let bind_error = |source| BrokerError::Bind {
            path: socket_path.clone(),
            source,
        };

        prepare_socket_path(&socket_path).map_err(bind_error)?;
        let listener = UnixListener::bind(&socket_path).map_err(bind_error)?;
        listener.set_nonblocking(true).map_err(bind_error)?;

        let epoll = Epoll::new().map_err(BrokerError::EventPoll)?;
        let shutdown = EventFd::new().map_err(BrokerError::ShutdownSignal)?;
        epoll
            .add(listener.as_raw_fd(), LISTENER_TOKEN)
            .map_err(BrokerError::Register)?;
        epoll
            .add(shutdown.as_raw_fd(), SHUTDOWN_TOKEN)
            .map_err(BrokerError::Register)?;

        info!(
            path = %socket_path.display(),
            mode = ?config.concurrency,
            ancillary = config.receive_ancillary,
            "Broker listening"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                socket_path,
                listener: Mutex::new(Some(listener)),
                epoll,
                shutdown,
                running: AtomicBool::new(false),
                config,
                connection_handler,
                request_handler,
                connections: DashMap::new(),
                next_token: AtomicU64::new(FIRST_CLIENT_TOKEN),
            }),
            state: Mutex::new(LoopState::Idle),
        })
    }

    /// Launch the loop thread
    ///
    /// Starting a running broker does nothing; a stopped broker stays
    /// stopped.
    ///
    /// # Errors
    ///
    /// Returns an error if the loop thread cannot be spawned.
    pub fn start(&self) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        match *state {
            LoopState::Running(_) => return Ok(()),
            LoopState::Stopped => {
                warn!(path = %self.shared.socket_path.display(), "Broker already stopped; start ignored");
                return Ok(());
            }
            LoopState::Idle => {}
        }

        self.shared.running.store(true, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("hostbridge-broker".to_string())
            .spawn(move || shared.run())
            .map_err(|e| {
                self.shared.running.store(false, Ordering::Release);
                BrokerError::Spawn(e)
            })?;
        *state = LoopState::Running(handle);
        Ok(())
    }

    /// Stop the loop and tear down every connection
    ///
    /// Blocks until the loop thread has exited, unless called from that
    /// thread, in which case the loop exits once the current dispatch
    /// returns. Must not be called from a per-connection service thread.
    /// Calling it again does nothing.
    pub fn stop(&self) {
        let previous = mem::replace(&mut *self.state.lock(), LoopState::Stopped);
        match previous {
            LoopState::Stopped => {}
            LoopState::Idle => self.shared.shutdown(),
            LoopState::Running(handle) => {
                self.shared.running.store(false, Ordering::Release);
                if let Err(e) = self.shared.shutdown.signal() {
                    error!(error = %e, "Failed to signal broker shutdown");
                }
                if handle.thread().id() == thread::current().id() {
                    debug!("Stop requested from the broker loop");
                    return;
                }
                if handle.join().is_err() {
                    error!("Broker loop thread panicked");
                }
            }
        }
    }

    /// Whether the loop thread is accepting and dispatching
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Path the broker is bound to
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.shared.socket_path
    }

    /// Number of live connections
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.shared.connections.len()
    }
}

impl<C, R> Drop for Broker<C, R>
where
    C: ConnectionHandler,
    R: RequestHandler<C::Session>,
{
    fn drop(&mut self) {
        self.stop();
    }
}

impl<C, R> fmt::Debug for Broker<C, R>
where
    C: ConnectionHandler,
    R: RequestHandler<C::Session>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("socket_path", &self.shared.socket_path)
            .field("config", &self.shared.config)
            .field("connections", &self.shared.connections.len())
            .finish_non_exhaustive()
    }
}

impl<C, R> Shared<C, R>
where
    C: ConnectionHandler,
    R: RequestHandler<C::Session>,
{
    fn run(self: Arc<Self>) {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        while self.running.load(Ordering::Acquire) {
            let ready = match self.epoll.wait(&mut events) {
                Ok(ready) => ready,
                Err(e) => {
                    error!(error = %e, "Event poll failed; stopping broker");
                    self.running.store(false, Ordering::Release);
                    break;
                }
            };

            for event in &events[..ready] {
                let token = event.u64;
                match token {
                    LISTENER_TOKEN => self.accept(),
                    SHUTDOWN_TOKEN => {}
                    token => self.service(token),
                }
            }
        }

        self.shutdown();
    }

    fn accept(self: &Arc<Self>) {
        let accepted = match self.listener.lock().as_ref() {
            Some(listener) => listener.accept(),
            None => return,
        };
        let stream = match accepted {
            Ok((stream, _)) => stream,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                warn!(error = %e, "Failed to accept connection");
                return;
            }
        };

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let client = Client::new(
            ClientId(token),
            Arc::new(ClientSocket::new(stream)),
            self.config.capacities,
        );

        match self.config.concurrency {
            ConcurrencyMode::Cooperative => {
                if let Err(e) = self.epoll.add(client.raw_fd(), token) {
                    warn!(client_id = %client.id(), error = %e, "Failed to register connection");
                    return;
                }
                let connection = Arc::new(Connection::new(token, client, None));
                self.connections.insert(token, Arc::clone(&connection));
                self.connection_handler
                    .on_connection_established(&mut connection.client.lock());
            }
            ConcurrencyMode::PerConnectionThread => {
                let wakeup = match EventFd::new() {
                    Ok(wakeup) => wakeup,
                    Err(e) => {
                        warn!(client_id = %client.id(), error = %e, "Failed to create connection wakeup");
                        return;
                    }
                };
                let connection = Arc::new(Connection::new(token, client, Some(wakeup)));
                self.connections.insert(token, Arc::clone(&connection));

                let shared = Arc::clone(self);
                let served = Arc::clone(&connection);
                let spawned = thread::Builder::new()
                    .name(format!("hostbridge-conn-{token}"))
                    .spawn(move || shared.serve(&served));
                match spawned {
                    Ok(handle) => *connection.worker.lock() = Some(handle),
                    Err(e) => {
                        warn!(client_id = %ClientId(token), error = %e, "Failed to spawn connection thread");
                        self.connections.remove(&token);
                        connection.client.lock().close();
                        return;
                    }
                }
            }
        }

        debug!(client_id = %ClientId(token), "Connection accepted");
    }

    /// Per-connection service thread body
    fn serve(&self, connection: &Connection<C::Session>) {
        {
            let mut client = connection.client.lock();
            if !connection.alive.load(Ordering::Acquire) {
                return;
            }
            self.connection_handler.on_connection_established(&mut client);
        }

        let Some(wakeup) = connection.wakeup.as_ref() else {
            return;
        };

        while connection.alive.load(Ordering::Acquire) {
            match poll::wait_readable(connection.fd, wakeup.as_raw_fd()) {
                Ok(Readiness::Readable) => {
                    if !self.dispatch(connection) {
                        self.kill(connection);
                        break;
                    }
                }
                Ok(Readiness::Shutdown) => break,
                Err(e) => {
                    warn!(client_id = %ClientId(connection.token), error = %e, "Connection poll failed");
                    self.kill(connection);
                    break;
                }
            }
        }
    }

    /// Cooperative readiness on a client token
    fn service(&self, token: u64) {
        let Some(connection) = self
            .connections
            .get(&token)
            .map(|entry| Arc::clone(entry.value()))
        else {
            return;
        };
        if !self.dispatch(&connection) {
            self.kill(&connection);
        }
    }

    /// Read what is available and run the request handler until it reports
    /// an incomplete request. Returns false when the connection should close.
    fn dispatch(&self, connection: &Connection<C::Session>) -> bool {
        let mut client = connection.client.lock();
        if !client.is_connected() {
            return true;
        }
        match self.read_and_handle(&mut client) {
            Ok(keep) => keep,
            Err(e) => {
                debug!(client_id = %client.id(), error = %e, "Connection I/O failed");
                false
            }
        }
    }

    fn read_and_handle(&self, client: &mut Client<C::Session>) -> io::Result<bool> {
        if client.input().is_none() {
            // Unbuffered handlers read the socket themselves and must make
            // progress on every readable event
            let progressed = self.request_handler.try_handle_one_request(client)?;
            if !progressed {
                debug!(client_id = %client.id(), "Unbuffered handler consumed nothing; closing");
            }
            return Ok(progressed);
        }

        let mut committed = match client.input_mut() {
            Some(input) => {
                if input.read_more(self.config.receive_ancillary)? == 0 {
                    return Ok(false);
                }
                input.position()
            }
            None => return Ok(true),
        };

        while self.running.load(Ordering::Acquire)
            && self.request_handler.try_handle_one_request(client)?
        {
            committed = client.input().map_or(committed, InputStream::position);
        }

        if let Some(input) = client.input_mut() {
            input.set_position(committed);
        }
        Ok(true)
    }

    fn kill(&self, connection: &Connection<C::Session>) {
        if !connection.alive.swap(false, Ordering::AcqRel) {
            self.join_worker(connection);
            return;
        }

        {
            let mut client = connection.client.lock();
            client.mark_disconnected();
            self.connection_handler.on_connection_closing(&mut client);
        }

        self.join_worker(connection);

        if self.config.concurrency == ConcurrencyMode::Cooperative {
            if let Err(e) = self.epoll.delete(connection.fd) {
                debug!(client_id = %ClientId(connection.token), error = %e, "Failed to deregister connection");
            }
        }
        connection.client.lock().close();
        self.connections.remove(&connection.token);

        debug!(client_id = %ClientId(connection.token), "Connection closed");
    }

    fn join_worker(&self, connection: &Connection<C::Session>) {
        if let Some(wakeup) = &connection.wakeup {
            if let Err(e) = wakeup.signal() {
                debug!(client_id = %ClientId(connection.token), error = %e, "Failed to wake connection thread");
            }
        }

        let handle = {
            let mut worker = connection.worker.lock();
            let on_worker = worker
                .as_ref()
                .is_some_and(|handle| handle.thread().id() == thread::current().id());
            if on_worker {
                return;
            }
            worker.take()
        };

        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(client_id = %ClientId(connection.token), "Connection thread panicked");
            }
        }
    }

    fn shutdown(&self) {
        let connections: Vec<_> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for connection in &connections {
            self.kill(connection);
        }
        self.connections.clear();

        if let Some(listener) = self.listener.lock().take() {
            if let Err(e) = self.epoll.delete(listener.as_raw_fd()) {
                debug!(error = %e, "Failed to deregister listener");
            }
        }
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.socket_path.display(), error = %e, "Failed to remove socket file");
            }
        }

        info!(
            path = %self.socket_path.display(),
            closed = connections.len(),
            "Broker stopped"
        );
    }
}
