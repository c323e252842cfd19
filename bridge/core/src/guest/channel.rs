//! Persistent outbound command channel to the guest agent
//!
//! ```text
//!  callers ──► queue (FIFO) ──► loop thread ──► TCP ──► guest agent
//!                                   │
//!                 disconnected: connect, else wait the backoff
//!                 connected:    run every queued command in order
//! ```
//!
//! Commands are closures that write their own request and, for
//! request/response opcodes, read the reply. They may run more than once:
//! when one fails the link is dropped and that command, with every command
//! queued behind it, goes back to the front of the queue for the next
//! connection. A link the agent has closed is noticed before a batch is
//! written to it.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::mem;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace, warn};

use super::process::{
    parse_process_records, ProcessInfo, MAX_PROCESS_RECORDS, PROCESS_RECORD_SIZE,
};
use super::protocol::{
    encode_exec, encode_get_processes, encode_kill_process, encode_mouse_event,
    encode_set_process_affinity, split_command, GuestLink, PROCESS_RESPONSE_HEADER,
};
use super::GuestError;
use crate::stream::{ByteOrder, ByteReader};

/// Port the guest agent listens on
pub const DEFAULT_GUEST_PORT: u16 = 7946;

/// Connection settings for a [`GuestChannel`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestChannelConfig {
    /// Agent host name or address
    pub host: String,
    /// Agent TCP port
    pub port: u16,
    /// Wait between connection attempts
    pub reconnect_backoff: Duration,
    /// Limit on a single connection attempt
    pub connect_timeout: Duration,
    /// Limit on a blocking read or write once connected
    pub io_timeout: Duration,
}

impl Default for GuestChannelConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_GUEST_PORT,
            reconnect_backoff: Duration::from_millis(100),
            connect_timeout: Duration::from_millis(1000),
            io_timeout: Duration::from_millis(5000),
        }
    }
}

type Command = Box<dyn FnMut(&mut GuestLink) -> io::Result<()> + Send>;

struct ChannelShared {
    config: GuestChannelConfig,
    queue: Mutex<VecDeque<Command>>,
    wake: Condvar,
    connected: AtomicBool,
    running: AtomicBool,
}

/// Queue-backed command channel
///
/// Every command except mouse input is queued regardless of connection
/// state and sent once a connection exists. Mouse input is dropped while
/// disconnected.
pub struct GuestChannel {
    shared: Arc<ChannelShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl GuestChannel {
    /// Create a stopped channel
    #[must_use]
    pub fn new(config: GuestChannelConfig) -> Self {
        Self {
            shared: Arc::new(ChannelShared {
                config,
                queue: Mutex::new(VecDeque::new()),
                wake: Condvar::new(),
                connected: AtomicBool::new(false),
                running: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Channel settings
    #[must_use]
    pub fn config(&self) -> &GuestChannelConfig {
        &self.shared.config
    }

    /// Resolve the agent address and launch the loop thread
    ///
    /// Starting a running channel does nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the address does not resolve or the thread
    /// cannot be spawned.
    pub fn start(&self) -> Result<(), GuestError> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        let config = &self.shared.config;
        let target = format!("{}:{}", config.host, config.port);
        let addresses: Vec<SocketAddr> = (config.host.as_str(), config.port)
            .to_socket_addrs()
            .map_err(|source| GuestError::Resolve {
                address: target.clone(),
                source,
            })?
            .collect();
        if addresses.is_empty() {
            return Err(GuestError::NoAddress(target));
        }

        self.shared.running.store(true, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("hostbridge-guest".to_string())
            .spawn(move || shared.run(&addresses))
            .map_err(|e| {
                self.shared.running.store(false, Ordering::Release);
                GuestError::Spawn(e)
            })?;
        *worker = Some(handle);
        info!(target = %target, "Guest channel started");
        Ok(())
    }

    /// Stop the loop thread and close the connection
    ///
    /// Commands still queued are discarded. Calling it on a stopped channel
    /// does nothing.
    pub fn stop(&self) {
        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        {
            let _queue = self.shared.queue.lock();
            self.shared.running.store(false, Ordering::Release);
        }
        self.shared.wake.notify_all();

        if handle.thread().id() != thread::current().id() && handle.join().is_err() {
            warn!("Guest channel thread panicked");
        }
        let discarded = mem::take(&mut *self.shared.queue.lock()).len();
        debug!(discarded, "Guest channel stopped");
    }

    /// Whether a connection to the agent is currently open
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Commands waiting to be sent
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Queue an arbitrary command
    ///
    /// The command runs again on the next connection if it returns an
    /// error, so it must be safe to repeat.
    pub fn enqueue<F>(&self, command: F)
    where
        F: FnMut(&mut GuestLink) -> io::Result<()> + Send + 'static,
    {
        self.shared.queue.lock().push_back(Box::new(command));
        self.shared.wake.notify_one();
    }

    /// Launch `command` in the guest; the program is everything up to the
    /// first space, the rest is passed as its arguments
    pub fn exec(&self, command: &str) {
        let Some((program, arguments)) = split_command(command) else {
            return;
        };
        let frame = encode_exec(program, arguments);
        self.enqueue(move |link| link.send(&frame));
    }

    /// Terminate guest processes with image name `name`
    pub fn kill_process(&self, name: &str) {
        let frame = encode_kill_process(name);
        self.enqueue(move |link| link.send(&frame));
    }

    /// Request the guest process list
    ///
    /// `callback` runs once on the channel thread with the list, or with
    /// an empty list when the agent reports failure. A broken exchange is
    /// retried on the next connection.
    pub fn get_processes<F>(&self, callback: F)
    where
        F: FnOnce(Vec<ProcessInfo>) + Send + 'static,
    {
        let mut callback = Some(callback);
        self.enqueue(move |link| {
            let processes = query_processes(link)?;
            if let Some(callback) = callback.take() {
                callback(processes);
            }
            Ok(())
        });
    }

    /// Pin guest process `pid` to the CPUs in `mask`
    pub fn set_process_affinity(&self, pid: i32, mask: u32) {
        let frame = encode_set_process_affinity(pid, mask);
        self.enqueue(move |link| link.send(&frame));
    }

    /// Inject pointer input; dropped while disconnected
    pub fn mouse_event(&self, flags: u32, dx: i16, dy: i16, wheel_delta: i16) {
        if !self.is_connected() {
            trace!("Guest disconnected; dropping mouse event");
            return;
        }
        let frame = encode_mouse_event(flags, dx, dy, wheel_delta);
        self.enqueue(move |link| link.send(&frame));
    }
}

impl Drop for GuestChannel {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for GuestChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestChannel")
            .field("config", &self.shared.config)
            .field("connected", &self.is_connected())
            .field("pending", &self.pending())
            .finish()
    }
}

impl ChannelShared {
    fn run(&self, addresses: &[SocketAddr]) {
        let mut link: Option<GuestLink> = None;

        while self.running.load(Ordering::Acquire) {
            if link.is_none() {
                link = self.connect(addresses);
                self.connected.store(link.is_some(), Ordering::Release);
            }
            let Some(active) = link.as_mut() else {
                self.backoff();
                continue;
            };

            let mut batch = self.take_batch();
            if active.peer_closed() {
                info!("Guest agent closed the connection; reconnecting");
                self.requeue(batch);
                link = None;
                self.connected.store(false, Ordering::Release);
                continue;
            }

            while let Some(mut command) = batch.pop_front() {
                if let Err(e) = command(&mut *active) {
                    warn!(error = %e, "Guest connection lost; reconnecting");
                    batch.push_front(command);
                    self.requeue(batch);
                    link = None;
                    self.connected.store(false, Ordering::Release);
                    break;
                }
            }
        }

        self.connected.store(false, Ordering::Release);
    }

    fn connect(&self, addresses: &[SocketAddr]) -> Option<GuestLink> {
        let timeout = |d: Duration| Some(d).filter(|d| !d.is_zero());

        for address in addresses {
            let stream = match TcpStream::connect_timeout(address, self.config.connect_timeout) {
                Ok(stream) => stream,
                Err(e) => {
                    trace!(%address, error = %e, "Guest agent not reachable");
                    continue;
                }
            };
            let configured = stream
                .set_nodelay(true)
                .and_then(|()| stream.set_read_timeout(timeout(self.config.io_timeout)))
                .and_then(|()| stream.set_write_timeout(timeout(self.config.io_timeout)));
            if let Err(e) = configured {
                warn!(%address, error = %e, "Failed to configure guest connection");
                continue;
            }
            info!(%address, "Connected to guest agent");
            return Some(GuestLink::new(stream));
        }
        None
    }

    /// Sleep for the reconnect backoff, waking early on stop or new work
    fn backoff(&self) {
        let mut queue = self.queue.lock();
        if self.running.load(Ordering::Acquire) {
            self.wake.wait_for(&mut queue, self.config.reconnect_backoff);
        }
    }

    /// Take every queued command, waiting up to the backoff for one
    fn take_batch(&self) -> VecDeque<Command> {
        let mut queue = self.queue.lock();
        if queue.is_empty() && self.running.load(Ordering::Acquire) {
            self.wake.wait_for(&mut queue, self.config.reconnect_backoff);
        }
        mem::take(&mut *queue)
    }

    /// Put unsent commands back ahead of anything queued meanwhile
    fn requeue(&self, batch: VecDeque<Command>) {
        if batch.is_empty() {
            return;
        }
        let mut queue = self.queue.lock();
        for command in batch.into_iter().rev() {
            queue.push_front(command);
        }
    }
}

fn query_processes(link: &mut GuestLink) -> io::Result<Vec<ProcessInfo>> {
    link.send(&encode_get_processes())?;

    let header = link.receive(PROCESS_RESPONSE_HEADER)?;
    let mut reader = ByteReader::new(header, ByteOrder::Little);
    let success = reader.read_u8() == Some(1);
    let length = usize::try_from(reader.read_i32().unwrap_or(0)).unwrap_or(0);

    if !success {
        debug!(length, "Guest reported process listing failure");
        link.discard(length)?;
        return Ok(Vec::new());
    }
    if length > MAX_PROCESS_RECORDS * PROCESS_RECORD_SIZE {
        warn!(length, "Guest process listing too large; skipping it");
        link.discard(length)?;
        return Ok(Vec::new());
    }

    let body = link.receive(length)?;
    Ok(parse_process_records(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commands_queue_while_stopped() {
        let channel = GuestChannel::new(GuestChannelConfig::default());
        channel.exec("notepad.exe file.txt");
        channel.kill_process("notepad.exe");
        channel.set_process_affinity(1, 1);
        assert_eq!(channel.pending(), 3);
    }

    #[test]
    fn test_blank_exec_is_ignored() {
        let channel = GuestChannel::new(GuestChannelConfig::default());
        channel.exec("   ");
        assert_eq!(channel.pending(), 0);
    }

    #[test]
    fn test_mouse_event_dropped_when_disconnected() {
        let channel = GuestChannel::new(GuestChannelConfig::default());
        channel.mouse_event(1, 2, 3, 0);
        assert_eq!(channel.pending(), 0);
        assert!(!channel.is_connected());
    }

    #[test]
    fn test_stop_without_start_is_noop() {
        let channel = GuestChannel::new(GuestChannelConfig::default());
        channel.stop();
        channel.stop();
    }
}
