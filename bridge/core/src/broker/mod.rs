//! Unix-socket connection broker
//!
//! A [`Broker`] owns one listening socket and multiplexes every accepted
//! connection onto a pair of handler seams:
//!
//! - [`ConnectionHandler`] sets a connection up and releases it
//! - [`RequestHandler`] decodes one request at a time from the buffered
//!   input, leaving partial requests in place until more bytes arrive
//!
//! Protocol services (shared memory, audio) are nothing more than
//! implementations of these two traits.

mod client;
mod error;
mod handler;
mod poll;
mod server;

pub use client::{Client, ClientId, ClientParts, StreamCapacities};
pub use error::BrokerError;
pub use handler::{ConnectionHandler, RequestHandler};
pub use server::{Broker, BrokerConfig, ConcurrencyMode};
