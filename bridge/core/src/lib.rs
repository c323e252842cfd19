//! Hostbridge Core - Native IPC Protocols for Sandboxed Programs
//!
//! This crate serves the Unix IPC protocols that desktop programs expect
//! from their host (audio playback, System V shared memory) to programs
//! running in a sandbox that has none, and drives a command channel to an
//! agent inside the guest.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      Sandboxed programs                          │
//! │   ┌─────────────────┐     ┌─────────────────┐                    │
//! │   │  audio plugin   │     │   shm shim      │                    │
//! │   └────────┬────────┘     └────────┬────────┘                    │
//! └────────────┼───────────────────────┼─────────────────────────────┘
//!              │ .sound/AS0            │ .sysvshm/SM0
//! ┌────────────┼───────────────────────┼─────────────────────────────┐
//! │            ▼      HOSTBRIDGE CORE  ▼                             │
//! │   ┌──────────────────────────────────────────────┐               │
//! │   │ Broker (epoll) ── Client ── Input/OutputStream│              │
//! │   └───────┬──────────────────────────┬───────────┘               │
//! │   ┌───────▼───────┐          ┌───────▼───────┐                   │
//! │   │ AudioService  │──────────│  ShmService   │                   │
//! │   └───────┬───────┘  shared  └───────────────┘                   │
//! │           │         segments                                     │
//! │   ┌───────▼───────┐                  ┌──────────────┐  TCP       │
//! │   │ AudioBackend  │                  │ GuestChannel │──────► agent
//! │   └───────────────┘                  └──────────────┘            │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Overview
//!
//! - [`stream`]: Buffered socket streams with descriptor passing
//! - [`broker`]: Connection broker and its handler traits
//! - [`shm`]: Shared-memory segment table and service
//! - [`audio`]: PCM playback service and backend seam
//! - [`guest`]: Guest agent command channel
//! - [`environment`]: Component lifecycle
//! - [`config`]: TOML / environment / CLI configuration
//! - [`paths`]: Well-known socket locations

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod audio;
pub mod broker;
pub mod config;
pub mod environment;
pub mod guest;
pub mod paths;
pub mod shm;
pub mod stream;

// Broker exports
pub use broker::{
    Broker, BrokerConfig, BrokerError, Client, ClientId, ConcurrencyMode, ConnectionHandler,
    RequestHandler, StreamCapacities,
};

// Stream exports
pub use stream::{ByteOrder, ClientSocket, InputStream, OutputStream, Parse};

// Service exports
pub use audio::{
    AudioBackend, AudioError, AudioService, AudioSession, BackendKind, FileBackend, NullBackend,
    PcmStream,
};
pub use guest::{GuestChannel, GuestChannelConfig, GuestError, ProcessInfo};
pub use shm::{SharedMemory, ShmError, ShmService};

// Lifecycle exports
pub use environment::{Environment, EnvironmentComponent, EnvironmentError};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, BridgeConfig, BridgeToml,
    ConfigError, ConfigOverrides, ConfigSource,
};
