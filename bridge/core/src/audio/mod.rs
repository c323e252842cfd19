//! PCM playback service
//!
//! Clients configure a stream with PREPARE and receive a shared ring
//! buffer descriptor sized to the stream's buffer. From then on WRITE only
//! names how many bytes of that buffer to play; without a shared buffer
//! the samples travel in-band after the WRITE header.
//!
//! Playback itself goes through an [`AudioBackend`]. The buffer segment is
//! allocated from the same [`SharedMemory`](crate::shm::SharedMemory) table
//! the shared-memory service uses and is returned to it on CLOSE, on the
//! next PREPARE and when the connection closes.

mod backend;
mod format;
mod service;
mod session;

use thiserror::Error;

pub use backend::{AudioBackend, BackendKind, FileBackend, NullBackend, PcmStream};
pub use format::{SampleFormat, StreamParams};
pub use service::{
    parse_request, request_codes, AudioRequest, AudioService, PrepareRequest, HEADER_SIZE,
};
pub use session::{AudioSession, SharedBuffer};

/// Audio backend errors
#[derive(Debug, Error)]
pub enum AudioError {
    /// The device refused to open a stream
    #[error("Failed to open {format} stream ({channels} ch @ {sample_rate} Hz): {reason}")]
    Open {
        /// Requested channel count
        channels: u8,
        /// Requested format
        format: SampleFormat,
        /// Requested rate
        sample_rate: u32,
        /// Backend-specific reason
        reason: String,
    },

    /// A backend name that is not recognised
    #[error("Unknown audio backend: {0}")]
    UnknownBackend(String),

    /// The backend needs an output path and none was configured
    #[error("Audio backend {0} needs an output path")]
    MissingOutput(BackendKind),
}
