//! Guest agent command channel
//!
//! Unlike the socket services this is an outbound client: one TCP
//! connection to an agent running inside the guest, fed by a FIFO queue of
//! encoded commands that survive reconnects.

mod channel;
mod process;
mod protocol;

use std::io;

use thiserror::Error;

pub use channel::{GuestChannel, GuestChannelConfig, DEFAULT_GUEST_PORT};
pub use process::{
    parse_process_records, ProcessInfo, MAX_PROCESS_RECORDS, PROCESS_NAME_SIZE,
    PROCESS_RECORD_SIZE,
};
pub use protocol::{
    encode_exec, encode_get_processes, encode_kill_process, encode_mouse_event,
    encode_set_process_affinity, opcodes, split_command, GuestLink, PROCESS_RESPONSE_HEADER,
};

/// Guest channel errors
#[derive(Debug, Error)]
pub enum GuestError {
    /// The agent address could not be resolved
    #[error("Failed to resolve guest address {address}: {source}")]
    Resolve {
        /// `host:port` as configured
        address: String,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// The agent address resolved to nothing
    #[error("Guest address {0} resolved to no socket addresses")]
    NoAddress(String),

    /// The loop thread could not be spawned
    #[error("Failed to spawn guest channel thread: {0}")]
    Spawn(#[source] io::Error),
}
