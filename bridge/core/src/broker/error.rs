//! Broker errors

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while creating or starting a broker
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The listening socket could not be prepared or bound
    #[error("Failed to bind socket at {path}: {source}")]
    Bind {
        /// Requested socket path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// The readiness set could not be created
    #[error("Failed to create event poll: {0}")]
    EventPoll(#[source] io::Error),

    /// The shutdown wakeup descriptor could not be created
    #[error("Failed to create shutdown signal: {0}")]
    ShutdownSignal(#[source] io::Error),

    /// A descriptor could not be registered for readiness
    #[error("Failed to register descriptor for readiness: {0}")]
    Register(#[source] io::Error),

    /// The acceptor loop thread could not be spawned
    #[error("Failed to spawn broker thread: {0}")]
    Spawn(#[source] io::Error),
}
