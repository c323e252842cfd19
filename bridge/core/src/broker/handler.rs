//! Handler seams plugged into a [`Broker`](super::Broker)

use std::io;

use super::client::Client;

/// Connection lifecycle hooks
///
/// `on_connection_established` runs once per accepted connection before
/// any request dispatch; `on_connection_closing` runs exactly once when the
/// connection is torn down, whether or not the established hook ran.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Per-connection state attached to the client
    type Session: Send + 'static;

    /// Prepare a freshly accepted client, usually creating its streams and
    /// attaching a session
    fn on_connection_established(&self, client: &mut Client<Self::Session>);

    /// Release whatever the session holds
    fn on_connection_closing(&self, client: &mut Client<Self::Session>);
}

/// Request decoding and dispatch
pub trait RequestHandler<S>: Send + Sync + 'static {
    /// Try to decode and act on one request from the client's input frame
    ///
    /// Returns `Ok(true)` after consuming a complete request and `Ok(false)`
    /// when the frame does not yet hold one. Bytes consumed during an
    /// attempt that returns `Ok(false)` are restored by the broker. An error
    /// tears the connection down.
    ///
    /// A client without I/O streams gets one call per readable event and the
    /// handler must read from [`Client::socket`] itself. Returning `Ok(false)`
    /// there closes the connection.
    ///
    /// # Errors
    ///
    /// Returns the I/O error from writing a response.
    fn try_handle_one_request(&self, client: &mut Client<S>) -> io::Result<bool>;
}
