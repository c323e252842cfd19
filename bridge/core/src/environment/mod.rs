//! Environment Lifecycle
//!
//! An [`Environment`] owns the services of one sandbox and starts and stops
//! them as a unit:
//!
//! ```text
//!   start_all:  shm ──► audio ──► guest
//!   stop_all:   guest ──► audio ──► shm
//! ```
//!
//! If a component fails to start, the ones already started are stopped in
//! reverse order before the error is returned.

mod components;

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::audio::AudioBackend;
use crate::broker::{BrokerError, ConcurrencyMode};
use crate::config::BridgeConfig;
use crate::guest::{GuestChannel, GuestError};
use crate::shm::SharedMemory;

pub use components::{AudioServerComponent, GuestChannelComponent, ShmServerComponent};

// =============================================================================
// Error Types
// =============================================================================

/// Component start failures
#[derive(Debug, Error)]
pub enum EnvironmentError {
    /// A socket service could not be brought up
    #[error("Failed to start {component}: {source}")]
    Broker {
        /// Component name
        component: &'static str,
        /// Underlying broker error
        #[source]
        source: BrokerError,
    },

    /// The guest channel could not be started
    #[error("Failed to start guest channel: {0}")]
    Guest(#[from] GuestError),
}

// =============================================================================
// Component Trait
// =============================================================================

/// One service with a start/stop lifecycle
pub trait EnvironmentComponent: Send {
    /// Short name used in logs and errors
    fn name(&self) -> &'static str;

    /// Bring the service up
    ///
    /// # Errors
    ///
    /// Returns an error if the service cannot start; nothing is left
    /// running in that case.
    fn start(&mut self) -> Result<(), EnvironmentError>;

    /// Take the service down; stopping a stopped component does nothing
    fn stop(&mut self);
}

// =============================================================================
// Environment
// =============================================================================

/// Ordered set of components
#[derive(Default)]
pub struct Environment {
    components: Vec<Box<dyn EnvironmentComponent>>,
    started: usize,
    running: bool,
}

impl Environment {
    /// Create an empty environment
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the components `config` enables
    ///
    /// Shared-memory and audio share one segment table. The guest channel
    /// is only added when one is supplied and the config enables it.
    #[must_use]
    pub fn from_config(
        config: &BridgeConfig,
        backend: Arc<dyn AudioBackend>,
        guest: Option<Arc<GuestChannel>>,
    ) -> Self {
        let memory = Arc::new(SharedMemory::new());
        let mut environment = Self::new();

        if config.shm_enabled {
            environment.add_component(Box::new(ShmServerComponent::new(
                config.shm_socket_path(),
                Arc::clone(&memory),
                config.capacities,
            )));
        }

        if config.audio_enabled {
            let concurrency = if config.audio_per_connection_threads {
                ConcurrencyMode::PerConnectionThread
            } else {
                ConcurrencyMode::Cooperative
            };
            environment.add_component(Box::new(AudioServerComponent::new(
                config.audio_socket_path(),
                backend,
                memory,
                config.capacities,
                concurrency,
            )));
        }

        if config.guest_enabled {
            if let Some(channel) = guest {
                environment.add_component(Box::new(GuestChannelComponent::new(channel)));
            }
        }

        environment
    }

    /// Append a component; it starts after every component already added
    pub fn add_component(&mut self, component: Box<dyn EnvironmentComponent>) {
        self.components.push(component);
    }

    /// Names in start order
    #[must_use]
    pub fn component_names(&self) -> Vec<&'static str> {
        self.components.iter().map(|c| c.name()).collect()
    }

    /// Whether `start_all` has succeeded and `stop_all` has not run since
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Start every component in order
    ///
    /// # Errors
    ///
    /// Returns the first component's start error after stopping the
    /// components started before it.
    pub fn start_all(&mut self) -> Result<(), EnvironmentError> {
        if self.is_running() {
            return Ok(());
        }

        for index in 0..self.components.len() {
            let component = &mut self.components[index];
            let name = component.name();
            if let Err(e) = component.start() {
                warn!(component = name, error = %e, "Component failed to start; rolling back");
                self.started = index;
                self.stop_all();
                return Err(e);
            }
            debug!(component = name, "Component started");
        }

        self.started = self.components.len();
        self.running = true;
        info!(components = ?self.component_names(), "Environment started");
        Ok(())
    }

    /// Stop started components in reverse order
    pub fn stop_all(&mut self) {
        let started = std::mem::take(&mut self.started);
        let was_running = std::mem::replace(&mut self.running, false);
        for component in self.components[..started].iter_mut().rev() {
            debug!(component = component.name(), "Stopping component");
            component.stop();
        }
        if was_running {
            info!("Environment stopped");
        }
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        self.stop_all();
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("components", &self.component_names())
            .field("running", &self.running)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::io;
    use std::path::PathBuf;

    type Journal = Arc<Mutex<Vec<String>>>;

    struct Recording {
        name: &'static str,
        fail: bool,
        journal: Journal,
    }

    impl Recording {
        fn boxed(name: &'static str, fail: bool, journal: &Journal) -> Box<Self> {
            Box::new(Self {
                name,
                fail,
                journal: Arc::clone(journal),
            })
        }
    }

    impl EnvironmentComponent for Recording {
        fn name(&self) -> &'static str {
            self.name
        }

        fn start(&mut self) -> Result<(), EnvironmentError> {
            if self.fail {
                return Err(EnvironmentError::Broker {
                    component: self.name,
                    source: BrokerError::Bind {
                        path: PathBuf::from("/nonexistent"),
                        source: io::Error::from(io::ErrorKind::PermissionDenied),
                    },
                });
            }
            self.journal.lock().push(format!("start {}", self.name));
            Ok(())
        }

        fn stop(&mut self) {
            self.journal.lock().push(format!("stop {}", self.name));
        }
    }

    #[test]
    fn test_start_in_order_stop_in_reverse() {
        let journal = Journal::default();
        let mut env = Environment::new();
        env.add_component(Recording::boxed("a", false, &journal));
        env.add_component(Recording::boxed("b", false, &journal));
        env.add_component(Recording::boxed("c", false, &journal));

        env.start_all().unwrap();
        assert!(env.is_running());
        env.stop_all();
        assert!(!env.is_running());

        assert_eq!(
            *journal.lock(),
            vec!["start a", "start b", "start c", "stop c", "stop b", "stop a"]
        );
    }

    #[test]
    fn test_failed_start_rolls_back() {
        let journal = Journal::default();
        let mut env = Environment::new();
        env.add_component(Recording::boxed("a", false, &journal));
        env.add_component(Recording::boxed("b", false, &journal));
        env.add_component(Recording::boxed("c", true, &journal));

        let err = env.start_all().unwrap_err();
        assert!(matches!(err, EnvironmentError::Broker { component: "c", .. }));
        assert!(!env.is_running());
        assert_eq!(*journal.lock(), vec!["start a", "start b", "stop b", "stop a"]);
    }

    #[test]
    fn test_stop_twice_is_noop() {
        let journal = Journal::default();
        let mut env = Environment::new();
        env.add_component(Recording::boxed("a", false, &journal));
        env.start_all().unwrap();
        env.stop_all();
        env.stop_all();
        assert_eq!(*journal.lock(), vec!["start a", "stop a"]);
    }

    #[test]
    fn test_drop_stops_running_components() {
        let journal = Journal::default();
        {
            let mut env = Environment::new();
            env.add_component(Recording::boxed("a", false, &journal));
            env.start_all().unwrap();
        }
        assert_eq!(*journal.lock(), vec!["start a", "stop a"]);
    }

    #[test]
    fn test_from_config_respects_enabled_flags() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = BridgeConfig::default();
        config.root_dir = dir.path().to_path_buf();

        let backend: Arc<dyn AudioBackend> = Arc::new(crate::audio::NullBackend);
        let guest = Arc::new(GuestChannel::new(config.guest.clone()));

        let env = Environment::from_config(&config, Arc::clone(&backend), Some(guest));
        assert_eq!(env.component_names(), vec!["shm", "audio", "guest"]);

        config.audio_enabled = false;
        config.guest_enabled = false;
        let env = Environment::from_config(&config, backend, None);
        assert_eq!(env.component_names(), vec!["shm"]);
    }
}
