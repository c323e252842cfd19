//! Built-in components: the two socket services and the guest channel

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use super::{EnvironmentComponent, EnvironmentError};
use crate::audio::{AudioBackend, AudioService};
use crate::broker::{
    Broker, BrokerConfig, ConcurrencyMode, ConnectionHandler, RequestHandler, StreamCapacities,
};
use crate::guest::GuestChannel;
use crate::shm::{SharedMemory, ShmService};

/// Bind and start a broker whose connection and request handlers are the
/// same service value
fn launch<S>(
    component: &'static str,
    path: &Path,
    service: &S,
    config: BrokerConfig,
) -> Result<Broker<S, S>, EnvironmentError>
where
    S: ConnectionHandler + RequestHandler<S::Session> + Clone,
{
    let broker = Broker::create(path, service.clone(), service.clone(), config)
        .map_err(|source| EnvironmentError::Broker { component, source })?;
    broker
        .start()
        .map_err(|source| EnvironmentError::Broker { component, source })?;
    info!(component, path = %path.display(), "Socket service started");
    Ok(broker)
}

// =============================================================================
// Shared Memory
// =============================================================================

/// Shared-memory socket service
pub struct ShmServerComponent {
    path: PathBuf,
    service: ShmService,
    capacities: StreamCapacities,
    broker: Option<Broker<ShmService, ShmService>>,
}

impl ShmServerComponent {
    /// Serve `memory` at `path`
    #[must_use]
    pub fn new(path: PathBuf, memory: Arc<SharedMemory>, capacities: StreamCapacities) -> Self {
        Self {
            path,
            service: ShmService::new(memory),
            capacities,
            broker: None,
        }
    }

    /// The running broker, if started
    #[must_use]
    pub fn broker(&self) -> Option<&Broker<ShmService, ShmService>> {
        self.broker.as_ref()
    }
}

impl EnvironmentComponent for ShmServerComponent {
    fn name(&self) -> &'static str {
        "shm"
    }

    fn start(&mut self) -> Result<(), EnvironmentError> {
        if self.broker.is_some() {
            return Ok(());
        }
        let config = BrokerConfig::default().with_capacities(self.capacities);
        self.broker = Some(launch(self.name(), &self.path, &self.service, config)?);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(broker) = self.broker.take() {
            broker.stop();
            self.service.memory().delete_all();
        }
    }
}

// =============================================================================
// Audio
// =============================================================================

/// Audio playback socket service
pub struct AudioServerComponent {
    path: PathBuf,
    service: AudioService,
    capacities: StreamCapacities,
    concurrency: ConcurrencyMode,
    broker: Option<Broker<AudioService, AudioService>>,
}

impl AudioServerComponent {
    /// Serve playback through `backend` at `path`, taking ring buffers from
    /// `memory`
    #[must_use]
    pub fn new(
        path: PathBuf,
        backend: Arc<dyn AudioBackend>,
        memory: Arc<SharedMemory>,
        capacities: StreamCapacities,
        concurrency: ConcurrencyMode,
    ) -> Self {
        Self {
            path,
            service: AudioService::new(backend, memory),
            capacities,
            concurrency,
            broker: None,
        }
    }

    /// The running broker, if started
    #[must_use]
    pub fn broker(&self) -> Option<&Broker<AudioService, AudioService>> {
        self.broker.as_ref()
    }
}

impl EnvironmentComponent for AudioServerComponent {
    fn name(&self) -> &'static str {
        "audio"
    }

    fn start(&mut self) -> Result<(), EnvironmentError> {
        if self.broker.is_some() {
            return Ok(());
        }
        let config = BrokerConfig::default()
            .with_capacities(self.capacities)
            .with_concurrency(self.concurrency);
        self.broker = Some(launch(self.name(), &self.path, &self.service, config)?);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(broker) = self.broker.take() {
            broker.stop();
        }
    }
}

// =============================================================================
// Guest Channel
// =============================================================================

/// Guest agent command channel
///
/// The channel is shared so callers can keep queueing commands while the
/// environment owns its lifecycle.
pub struct GuestChannelComponent {
    channel: Arc<GuestChannel>,
}

impl GuestChannelComponent {
    /// Manage `channel`
    #[must_use]
    pub fn new(channel: Arc<GuestChannel>) -> Self {
        Self { channel }
    }

    /// The managed channel
    #[must_use]
    pub fn channel(&self) -> &Arc<GuestChannel> {
        &self.channel
    }
}

impl EnvironmentComponent for GuestChannelComponent {
    fn name(&self) -> &'static str {
        "guest"
    }

    fn start(&mut self) -> Result<(), EnvironmentError> {
        self.channel.start()?;
        Ok(())
    }

    fn stop(&mut self) {
        self.channel.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::NullBackend;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_shm_component_binds_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".sysvshm").join("SM0");
        let memory = Arc::new(SharedMemory::new());
        memory.allocate(4096).unwrap();

        let mut component =
            ShmServerComponent::new(path.clone(), Arc::clone(&memory), StreamCapacities::default());
        component.start().unwrap();
        assert!(component.broker().is_some_and(|broker| broker.is_running()));
        UnixStream::connect(&path).unwrap();

        component.stop();
        assert!(component.broker().is_none());
        assert!(!path.exists());
        assert!(memory.is_empty());
    }

    #[test]
    fn test_audio_component_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".sound").join("AS0");
        let mut component = AudioServerComponent::new(
            path.clone(),
            Arc::new(NullBackend),
            Arc::new(SharedMemory::new()),
            StreamCapacities::default(),
            ConcurrencyMode::PerConnectionThread,
        );

        component.start().unwrap();
        component.stop();
        assert!(!path.exists());

        component.start().unwrap();
        assert!(path.exists());
        component.stop();
    }

    #[test]
    fn test_bind_failure_names_component() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();

        let mut component = ShmServerComponent::new(
            blocker.join("SM0"),
            Arc::new(SharedMemory::new()),
            StreamCapacities::default(),
        );
        let err = component.start().unwrap_err();
        assert!(matches!(err, EnvironmentError::Broker { component: "shm", .. }));
    }
}
