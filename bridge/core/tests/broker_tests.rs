//! Broker behaviour over real Unix sockets
//!
//! A small length-prefixed echo protocol stands in for a real service:
//!
//! ```text
//! request:  code:1 length:4 payload:length
//! ECHO (1)  → payload echoed back
//! SIZE (2)  → i32 size of the file descriptor sent with the request
//! ```

mod common;

use std::fs::File;
use std::io::{self, Write};
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use hostbridge_core::stream::ByteReader;
use hostbridge_core::{
    Broker, BrokerConfig, ByteOrder, Client, ConcurrencyMode, ConnectionHandler, Parse,
    RequestHandler,
};

use common::{connect, header, receive, send_byte_by_byte, wait_until};

const ECHO: u8 = 1;
const SIZE: u8 = 2;

// =============================================================================
// Test Service
// =============================================================================

#[derive(Default)]
struct Counters {
    established: AtomicUsize,
    closing: AtomicUsize,
    requests: AtomicUsize,
    closed_ids: Mutex<Vec<u64>>,
}

#[derive(Clone, Default)]
struct EchoService {
    counters: Arc<Counters>,
}

impl ConnectionHandler for EchoService {
    type Session = ();

    fn on_connection_established(&self, client: &mut Client<()>) {
        client.create_io_streams();
        client.set_session(());
        self.counters.established.fetch_add(1, Ordering::SeqCst);
    }

    fn on_connection_closing(&self, client: &mut Client<()>) {
        self.counters.closing.fetch_add(1, Ordering::SeqCst);
        self.counters.closed_ids.lock().push(client.id().as_u64());
    }
}

fn parse(frame: &[u8]) -> Parse<(u8, usize)> {
    let mut reader = ByteReader::new(frame, ByteOrder::Little);
    let (Some(code), Some(length)) = (reader.read_u8(), reader.read_i32()) else {
        return Parse::NeedMoreBytes(5 - frame.len());
    };
    let length = usize::try_from(length).unwrap_or(0);
    if reader.remaining() < length {
        return Parse::NeedMoreBytes(length - reader.remaining());
    }
    Parse::Complete {
        value: (code, length),
        consumed: 5 + length,
    }
}

impl RequestHandler<()> for EchoService {
    fn try_handle_one_request(&self, client: &mut Client<()>) -> io::Result<bool> {
        let Some(input) = client.input_mut() else {
            return Ok(false);
        };
        let Parse::Complete {
            value: (code, length),
            consumed,
        } = parse(input.frame())
        else {
            return Ok(false);
        };
        let payload = input.frame()[5..5 + length].to_vec();
        let descriptor = input.take_ancillary_fd();
        input.consume(consumed);

        let Some(output) = client.output() else {
            return Ok(true);
        };
        let mut lock = output.lock();
        match code {
            ECHO => lock.write_bytes(&payload),
            SIZE => {
                let size = descriptor
                    .map(File::from)
                    .and_then(|file| file.metadata().ok())
                    .map_or(-1, |meta| i32::try_from(meta.len()).unwrap_or(-1));
                lock.write_i32(size);
            }
            _ => {}
        }
        lock.flush()?;
        self.counters.requests.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}

fn start_broker(
    dir: &TempDir,
    config: BrokerConfig,
) -> (Broker<EchoService, EchoService>, Arc<Counters>) {
    let service = EchoService::default();
    let counters = Arc::clone(&service.counters);
    let broker = Broker::create(
        dir.path().join("echo").join("S0"),
        service.clone(),
        service,
        config,
    )
    .unwrap();
    broker.start().unwrap();
    (broker, counters)
}

fn echo_request(payload: &[u8]) -> Vec<u8> {
    let mut bytes = header(ECHO, i32::try_from(payload.len()).unwrap());
    bytes.extend_from_slice(payload);
    bytes
}

// =============================================================================
// Tests
// =============================================================================

#[test]
fn test_request_split_across_single_bytes() {
    for mode in [ConcurrencyMode::Cooperative, ConcurrencyMode::PerConnectionThread] {
        let dir = TempDir::new().unwrap();
        let (broker, _counters) =
            start_broker(&dir, BrokerConfig::default().with_concurrency(mode));
        let client = connect(broker.socket_path());

        send_byte_by_byte(&client, &echo_request(b"resumable"));
        assert_eq!(receive(&client, 9), b"resumable".to_vec());

        broker.stop();
    }
}

#[test]
fn test_pipelined_requests_answered_in_order() {
    let dir = TempDir::new().unwrap();
    let (broker, counters) = start_broker(&dir, BrokerConfig::default());
    let client = connect(broker.socket_path());

    let mut batch = echo_request(b"one");
    batch.extend(echo_request(b"two"));
    batch.extend(echo_request(b"three"));
    client.write_all(&batch).unwrap();

    assert_eq!(receive(&client, 11), b"onetwothree".to_vec());
    assert!(wait_until(|| counters.requests.load(Ordering::SeqCst) == 3));
}

#[test]
fn test_input_buffer_grows_past_initial_capacity() {
    let dir = TempDir::new().unwrap();
    let capacities = hostbridge_core::StreamCapacities {
        input: 16,
        output: 16,
    };
    let (broker, _counters) =
        start_broker(&dir, BrokerConfig::default().with_capacities(capacities));
    let client = connect(broker.socket_path());

    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    client.write_all(&echo_request(&payload)).unwrap();
    assert_eq!(receive(&client, payload.len()), payload);
}

#[test]
fn test_descriptors_consumed_in_arrival_order() {
    for mode in [ConcurrencyMode::Cooperative, ConcurrencyMode::PerConnectionThread] {
        let dir = TempDir::new().unwrap();
        let config = BrokerConfig::default()
            .with_concurrency(mode)
            .with_ancillary(true);
        let (broker, _counters) = start_broker(&dir, config);
        let client = connect(broker.socket_path());

        for size in [100u64, 2000, 30] {
            let mut file = tempfile::tempfile().unwrap();
            file.write_all(&vec![7u8; usize::try_from(size).unwrap()]).unwrap();
            client.send_with_fd(&header(SIZE, 0), file.as_fd()).unwrap();
        }

        let mut sizes = Vec::new();
        for _ in 0..3 {
            let bytes = receive(&client, 4);
            sizes.push(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]));
        }
        assert_eq!(sizes, vec![100, 2000, 30]);
    }
}

#[test]
fn test_peer_close_runs_closing_hook_once() {
    let dir = TempDir::new().unwrap();
    let (broker, counters) = start_broker(&dir, BrokerConfig::default());

    let client = connect(broker.socket_path());
    assert!(wait_until(|| broker.connection_count() == 1));
    drop(client);

    assert!(wait_until(|| broker.connection_count() == 0));
    assert_eq!(counters.closing.load(Ordering::SeqCst), 1);

    broker.stop();
    assert_eq!(counters.closing.load(Ordering::SeqCst), 1);
}

#[test]
fn test_stop_closes_every_connection() {
    for mode in [ConcurrencyMode::Cooperative, ConcurrencyMode::PerConnectionThread] {
        let dir = TempDir::new().unwrap();
        let (broker, counters) =
            start_broker(&dir, BrokerConfig::default().with_concurrency(mode));
        let path = broker.socket_path().to_path_buf();

        let clients: Vec<_> = (0..3).map(|_| connect(&path)).collect();
        assert!(wait_until(|| counters.established.load(Ordering::SeqCst) == 3));

        broker.stop();
        assert_eq!(counters.closing.load(Ordering::SeqCst), 3);
        assert_eq!(broker.connection_count(), 0);
        assert!(!broker.is_running());
        assert!(!path.exists());

        let mut ids = counters.closed_ids.lock().clone();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 3);

        for client in &clients {
            let mut buf = [0u8; 1];
            assert_eq!(client.read(&mut buf).unwrap(), 0);
        }

        broker.stop();
        assert_eq!(counters.closing.load(Ordering::SeqCst), 3);
    }
}

#[test]
fn test_stop_before_start_removes_socket() {
    let dir = TempDir::new().unwrap();
    let service = EchoService::default();
    let broker = Broker::create(
        dir.path().join("S1"),
        service.clone(),
        service,
        BrokerConfig::default(),
    )
    .unwrap();
    let path = broker.socket_path().to_path_buf();
    assert!(path.exists());

    broker.stop();
    assert!(!path.exists());
    broker.start().unwrap();
    assert!(!broker.is_running());
}

#[test]
fn test_stale_socket_file_replaced() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("S2");
    std::fs::write(&path, b"stale").unwrap();

    let service = EchoService::default();
    let broker =
        Broker::create(&path, service.clone(), service, BrokerConfig::default()).unwrap();
    broker.start().unwrap();

    let client = connect(&path);
    client.write_all(&echo_request(b"ok")).unwrap();
    assert_eq!(receive(&client, 2), b"ok".to_vec());
}

// =============================================================================
// Unbuffered Handlers
// =============================================================================

/// Reads the socket directly; `stall` makes it ignore readable data
#[derive(Clone, Default)]
struct RawService {
    stall: bool,
    closing: Arc<AtomicUsize>,
}

impl ConnectionHandler for RawService {
    type Session = ();

    fn on_connection_established(&self, _client: &mut Client<()>) {}

    fn on_connection_closing(&self, _client: &mut Client<()>) {
        self.closing.fetch_add(1, Ordering::SeqCst);
    }
}

impl RequestHandler<()> for RawService {
    fn try_handle_one_request(&self, client: &mut Client<()>) -> io::Result<bool> {
        if self.stall {
            return Ok(false);
        }
        let mut buf = [0u8; 64];
        let n = client.socket().read(&mut buf)?;
        if n == 0 {
            return Ok(false);
        }
        client.socket().write_all(&buf[..n])?;
        Ok(true)
    }
}

fn start_raw_broker(
    dir: &TempDir,
    stall: bool,
    mode: ConcurrencyMode,
) -> (Broker<RawService, RawService>, Arc<AtomicUsize>) {
    let service = RawService {
        stall,
        ..RawService::default()
    };
    let closing = Arc::clone(&service.closing);
    let broker = Broker::create(
        dir.path().join("raw").join("S0"),
        service.clone(),
        service,
        BrokerConfig::default().with_concurrency(mode),
    )
    .unwrap();
    broker.start().unwrap();
    (broker, closing)
}

#[test]
fn test_unbuffered_handler_reads_socket_directly() {
    for mode in [ConcurrencyMode::Cooperative, ConcurrencyMode::PerConnectionThread] {
        let dir = TempDir::new().unwrap();
        let (broker, closing) = start_raw_broker(&dir, false, mode);
        let client = connect(broker.socket_path());

        client.write_all(b"ping").unwrap();
        assert_eq!(receive(&client, 4), b"ping".to_vec());

        drop(client);
        assert!(wait_until(|| closing.load(Ordering::SeqCst) == 1));
        broker.stop();
    }
}

#[test]
fn test_unbuffered_handler_without_progress_is_closed() {
    for mode in [ConcurrencyMode::Cooperative, ConcurrencyMode::PerConnectionThread] {
        let dir = TempDir::new().unwrap();
        let (broker, closing) = start_raw_broker(&dir, true, mode);
        let client = connect(broker.socket_path());

        assert!(wait_until(|| broker.connection_count() == 1));
        client.write_all(b"x").unwrap();
        assert!(wait_until(|| broker.connection_count() == 0));
        assert_eq!(closing.load(Ordering::SeqCst), 1);

        broker.stop();
        assert_eq!(closing.load(Ordering::SeqCst), 1);
    }
}
