//! Per-connection client record

use std::fmt;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use crate::stream::{ByteOrder, ClientSocket, InputStream, OutputStream};

/// Broker-unique connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub(crate) u64);

impl ClientId {
    /// Raw numeric value
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Initial buffer capacities for a client's streams
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamCapacities {
    /// Starting input buffer size in bytes
    pub input: usize,
    /// Starting output buffer size in bytes
    pub output: usize,
}

impl Default for StreamCapacities {
    fn default() -> Self {
        Self {
            input: 4096,
            output: 4096,
        }
    }
}

/// A connected client as seen by handlers
///
/// Streams are absent until a connection handler calls
/// [`create_io_streams`](Self::create_io_streams). The session tag is
/// whatever per-connection state the handler chooses to attach.
#[derive(Debug)]
pub struct Client<S> {
    id: ClientId,
    socket: Arc<ClientSocket>,
    input: Option<InputStream>,
    output: Option<Arc<OutputStream>>,
    session: Option<S>,
    connected: bool,
    capacities: StreamCapacities,
}

/// Disjoint mutable views of a client, for handlers that need the session
/// and the streams at once
pub struct ClientParts<'a, S> {
    /// Per-connection session, if attached
    pub session: Option<&'a mut S>,
    /// Input stream, if created
    pub input: Option<&'a mut InputStream>,
    /// Output stream, if created
    pub output: Option<&'a Arc<OutputStream>>,
}

impl<S> Client<S> {
    pub(crate) fn new(id: ClientId, socket: Arc<ClientSocket>, capacities: StreamCapacities) -> Self {
        Self {
            id,
            socket,
            input: None,
            output: None,
            session: None,
            connected: true,
            capacities,
        }
    }

    /// Connection identifier
    #[must_use]
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// The connection's socket
    #[must_use]
    pub fn socket(&self) -> &Arc<ClientSocket> {
        &self.socket
    }

    /// Create the input/output stream pair, little-endian on both sides
    ///
    /// Calling this again on a client that already has streams does nothing.
    pub fn create_io_streams(&mut self) {
        if self.input.is_some() || self.output.is_some() {
            return;
        }
        let mut input = InputStream::new(Arc::clone(&self.socket), self.capacities.input);
        input.set_byte_order(ByteOrder::Little);
        let output = OutputStream::new(Arc::clone(&self.socket), self.capacities.output);
        output.set_byte_order(ByteOrder::Little);
        self.input = Some(input);
        self.output = Some(Arc::new(output));
    }

    /// Input stream, once created
    #[must_use]
    pub fn input(&self) -> Option<&InputStream> {
        self.input.as_ref()
    }

    /// Mutable input stream, once created
    pub fn input_mut(&mut self) -> Option<&mut InputStream> {
        self.input.as_mut()
    }

    /// Output stream, once created
    #[must_use]
    pub fn output(&self) -> Option<&Arc<OutputStream>> {
        self.output.as_ref()
    }

    /// Attached session
    #[must_use]
    pub fn session(&self) -> Option<&S> {
        self.session.as_ref()
    }

    /// Mutable attached session
    pub fn session_mut(&mut self) -> Option<&mut S> {
        self.session.as_mut()
    }

    /// Attach a session, replacing any previous one
    pub fn set_session(&mut self, session: S) {
        self.session = Some(session);
    }

    /// Detach and return the session
    pub fn take_session(&mut self) -> Option<S> {
        self.session.take()
    }

    /// Borrow session and streams simultaneously
    pub fn parts(&mut self) -> ClientParts<'_, S> {
        ClientParts {
            session: self.session.as_mut(),
            input: self.input.as_mut(),
            output: self.output.as_ref(),
        }
    }

    /// Whether the connection is still live
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    pub(crate) fn mark_disconnected(&mut self) {
        self.connected = false;
    }

    pub(crate) fn close(&mut self) {
        self.connected = false;
        self.input = None;
        self.output = None;
        self.socket.shutdown();
    }
}
