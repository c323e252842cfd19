//! Audio request protocol
//!
//! Every request starts with a five-byte little-endian header:
//!
//! ```text
//! ┌────────┬───────────┬──────────────────────┐
//! │ code:1 │ length:4  │ payload:length       │
//! └────────┴───────────┴──────────────────────┘
//!
//! CLOSE            (0)  release stream and shared buffer
//! START            (1)  resume playback
//! STOP             (2)  pause and flush
//! PAUSE            (3)  pause
//! PREPARE          (4)  channels:1 format:1 rate:4 buffer_size:4
//!                       → u8 0, shared-buffer descriptor attached on success
//! WRITE            (5)  in-band: `length` sample bytes follow the header
//!                       shared:  play the first `length` bytes of the buffer
//! DRAIN            (6)  finish queued data
//! POINTER          (7)  → i32 play position in frames
//! MIN_BUFFER_SIZE  (8)  channels:1 format:1 rate:4 → i32 bytes
//! ```
//!
//! Payloads shorter than a request's fixed fields are padded out to them;
//! any declared payload beyond the fixed fields is skipped.

use std::io;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use tracing::{debug, warn};

use super::backend::AudioBackend;
use super::format::{SampleFormat, StreamParams};
use super::session::{AudioSession, SharedBuffer};
use crate::broker::{Client, ClientParts, ConnectionHandler, RequestHandler};
use crate::shm::SharedMemory;
use crate::stream::{ByteOrder, ByteReader, OutputStream, Parse};

/// Request codes
pub mod request_codes {
    /// Release the stream
    pub const CLOSE: u8 = 0;
    /// Resume playback
    pub const START: u8 = 1;
    /// Pause and flush
    pub const STOP: u8 = 2;
    /// Pause
    pub const PAUSE: u8 = 3;
    /// Configure and open a stream
    pub const PREPARE: u8 = 4;
    /// Queue samples
    pub const WRITE: u8 = 5;
    /// Finish queued samples
    pub const DRAIN: u8 = 6;
    /// Query play position
    pub const POINTER: u8 = 7;
    /// Query minimum device buffer
    pub const MIN_BUFFER_SIZE: u8 = 8;
}

/// Size of the request header
pub const HEADER_SIZE: usize = 5;

const PREPARE_FIELDS: usize = 10;
const MIN_BUFFER_FIELDS: usize = 6;

/// Fields of a PREPARE request as sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrepareRequest {
    /// Channel count
    pub channels: u8,
    /// Wire index of the sample format
    pub format_index: u8,
    /// Frames per second
    pub sample_rate: i32,
    /// Ring buffer length in frames
    pub buffer_size: i32,
}

impl PrepareRequest {
    /// Stream parameters, or `None` if the format index is unknown
    ///
    /// Negative rates and buffer sizes become zero, which makes the
    /// parameters invalid.
    #[must_use]
    pub fn params(&self) -> Option<StreamParams> {
        Some(StreamParams {
            channels: self.channels,
            format: SampleFormat::from_index(self.format_index)?,
            sample_rate: u32::try_from(self.sample_rate).unwrap_or(0),
            buffer_size: u32::try_from(self.buffer_size).unwrap_or(0),
        })
    }
}

/// A decoded audio request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioRequest {
    /// CLOSE
    Close,
    /// START
    Start,
    /// STOP
    Stop,
    /// PAUSE
    Pause,
    /// PREPARE
    Prepare(PrepareRequest),
    /// WRITE of `length` bytes; in-band data sits between the header and
    /// the end of the consumed range
    Write {
        /// Declared byte count
        length: usize,
    },
    /// DRAIN
    Drain,
    /// POINTER
    Pointer,
    /// MIN_BUFFER_SIZE
    MinBufferSize {
        /// Channel count
        channels: u8,
        /// Wire index of the sample format
        format_index: u8,
        /// Frames per second
        sample_rate: i32,
    },
    /// Unrecognised code
    Unknown(u8),
}

/// Decode one request from the front of `frame`
///
/// `in_band_writes` decides whether WRITE carries its samples after the
/// header (no shared buffer) or only names a byte count.
#[must_use]
pub fn parse_request(frame: &[u8], in_band_writes: bool) -> Parse<AudioRequest> {
    let mut reader = ByteReader::new(frame, ByteOrder::Little);
    let (Some(code), Some(length)) = (reader.read_u8(), reader.read_i32()) else {
        return Parse::NeedMoreBytes(HEADER_SIZE - frame.len());
    };
    let length = usize::try_from(length).unwrap_or(0);

    let payload = match code {
        request_codes::PREPARE => length.max(PREPARE_FIELDS),
        request_codes::MIN_BUFFER_SIZE => length.max(MIN_BUFFER_FIELDS),
        request_codes::WRITE if in_band_writes => length,
        _ => 0,
    };
    if reader.remaining() < payload {
        return Parse::NeedMoreBytes(payload - reader.remaining());
    }

    let request = match code {
        request_codes::CLOSE => AudioRequest::Close,
        request_codes::START => AudioRequest::Start,
        request_codes::STOP => AudioRequest::Stop,
        request_codes::PAUSE => AudioRequest::Pause,
        request_codes::PREPARE => {
            let (Some(channels), Some(format_index), Some(sample_rate), Some(buffer_size)) = (
                reader.read_u8(),
                reader.read_u8(),
                reader.read_i32(),
                reader.read_i32(),
            ) else {
                return Parse::NeedMoreBytes(PREPARE_FIELDS);
            };
            AudioRequest::Prepare(PrepareRequest {
                channels,
                format_index,
                sample_rate,
                buffer_size,
            })
        }
        request_codes::WRITE => AudioRequest::Write { length },
        request_codes::DRAIN => AudioRequest::Drain,
        request_codes::POINTER => AudioRequest::Pointer,
        request_codes::MIN_BUFFER_SIZE => {
            let (Some(channels), Some(format_index), Some(sample_rate)) =
                (reader.read_u8(), reader.read_u8(), reader.read_i32())
            else {
                return Parse::NeedMoreBytes(MIN_BUFFER_FIELDS);
            };
            AudioRequest::MinBufferSize {
                channels,
                format_index,
                sample_rate,
            }
        }
        other => AudioRequest::Unknown(other),
    };

    Parse::Complete {
        value: request,
        consumed: HEADER_SIZE + payload,
    }
}

/// Audio playback service plugged into a broker
#[derive(Clone)]
pub struct AudioService {
    backend: Arc<dyn AudioBackend>,
    memory: Arc<SharedMemory>,
}

impl AudioService {
    /// Serve playback through `backend`, allocating shared buffers from
    /// `memory`
    #[must_use]
    pub fn new(backend: Arc<dyn AudioBackend>, memory: Arc<SharedMemory>) -> Self {
        Self { backend, memory }
    }

    /// Close the session's stream and give its shared buffer back to the
    /// segment table
    pub fn release_session(&self, session: &mut AudioSession) {
        session.reset();
        if let Some(shared) = session.take_shared_buffer() {
            self.memory.detach(&shared.mapping);
            self.memory.delete(shared.segment_id);
        }
    }

    fn prepare(
        &self,
        session: &mut AudioSession,
        request: PrepareRequest,
        output: &OutputStream,
    ) -> io::Result<()> {
        self.release_session(session);

        let prepared = match request.params() {
            Some(params) => {
                session.configure(params);
                session.prepare(self.backend.as_ref())
            }
            None => {
                debug!(format_index = request.format_index, "Prepare with unknown sample format");
                false
            }
        };
        let descriptor = if prepared {
            self.allocate_shared_buffer(session)
        } else {
            None
        };

        let mut lock = output.lock();
        lock.write_u8(0);
        if let Some(fd) = descriptor {
            lock.attach_fd(fd);
        }
        lock.flush()
    }

    fn allocate_shared_buffer(&self, session: &mut AudioSession) -> Option<OwnedFd> {
        let size = session.params().buffer_size_in_bytes() as u64;
        let segment_id = match self.memory.allocate(size) {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "Shared buffer unavailable; writes stay in-band");
                return None;
            }
        };

        let Some(mapping) = self.memory.attach(segment_id) else {
            self.memory.delete(segment_id);
            return None;
        };
        let Some(fd) = self.memory.descriptor(segment_id) else {
            self.memory.detach(&mapping);
            self.memory.delete(segment_id);
            return None;
        };

        debug!(segment_id, size, "Shared buffer allocated");
        session.set_shared_buffer(SharedBuffer {
            segment_id,
            mapping,
        });
        Some(fd)
    }

    fn min_buffer_size(&self, channels: u8, format_index: u8, sample_rate: i32) -> i32 {
        let (Some(format), Ok(rate)) = (
            SampleFormat::from_index(format_index),
            u32::try_from(sample_rate),
        ) else {
            return 0;
        };
        let bytes = self.backend.min_buffer_size(channels, format, rate);
        i32::try_from(bytes).unwrap_or(i32::MAX)
    }
}

impl ConnectionHandler for AudioService {
    type Session = AudioSession;

    fn on_connection_established(&self, client: &mut Client<AudioSession>) {
        client.create_io_streams();
        client.set_session(AudioSession::new());
    }

    fn on_connection_closing(&self, client: &mut Client<AudioSession>) {
        if let Some(mut session) = client.take_session() {
            self.release_session(&mut session);
        }
    }
}

impl RequestHandler<AudioSession> for AudioService {
    fn try_handle_one_request(&self, client: &mut Client<AudioSession>) -> io::Result<bool> {
        let ClientParts {
            session: Some(session),
            input: Some(input),
            output: Some(output),
        } = client.parts()
        else {
            return Ok(false);
        };

        let in_band = !session.has_shared_buffer();
        let (request, consumed) = match parse_request(input.frame(), in_band) {
            Parse::Complete { value, consumed } => (value, consumed),
            Parse::NeedMoreBytes(_) => return Ok(false),
        };

        match request {
            AudioRequest::Write { .. } if in_band => {
                session.write(&input.frame()[HEADER_SIZE..consumed]);
            }
            AudioRequest::Write { length } => {
                session.write_from_shared(length);
            }
            AudioRequest::Prepare(prepare) => self.prepare(session, prepare, output)?,
            AudioRequest::Pointer => {
                let mut lock = output.lock();
                lock.write_u32(session.pointer());
                lock.flush()?;
            }
            AudioRequest::MinBufferSize {
                channels,
                format_index,
                sample_rate,
            } => {
                let mut lock = output.lock();
                lock.write_i32(self.min_buffer_size(channels, format_index, sample_rate));
                lock.flush()?;
            }
            AudioRequest::Close => self.release_session(session),
            AudioRequest::Start => session.start(),
            AudioRequest::Stop => session.stop(),
            AudioRequest::Pause => session.pause(),
            AudioRequest::Drain => session.drain(),
            AudioRequest::Unknown(code) => debug!(code, "Ignoring unknown audio request"),
        }

        input.consume(consumed);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn header(code: u8, length: i32) -> Vec<u8> {
        let mut bytes = vec![code];
        bytes.extend_from_slice(&length.to_le_bytes());
        bytes
    }

    fn prepare_bytes(channels: u8, format: u8, rate: i32, buffer: i32) -> Vec<u8> {
        let mut bytes = header(request_codes::PREPARE, 10);
        bytes.push(channels);
        bytes.push(format);
        bytes.extend_from_slice(&rate.to_le_bytes());
        bytes.extend_from_slice(&buffer.to_le_bytes());
        bytes
    }

    #[test]
    fn test_short_header_needs_more() {
        assert_eq!(parse_request(&[7, 0], true), Parse::NeedMoreBytes(3));
    }

    #[test]
    fn test_parse_prepare() {
        let bytes = prepare_bytes(2, 1, 44_100, 1024);
        assert_eq!(
            parse_request(&bytes, true),
            Parse::Complete {
                value: AudioRequest::Prepare(PrepareRequest {
                    channels: 2,
                    format_index: 1,
                    sample_rate: 44_100,
                    buffer_size: 1024,
                }),
                consumed: 15,
            }
        );
        assert_eq!(
            parse_request(&bytes[..12], true),
            Parse::NeedMoreBytes(3)
        );
    }

    #[test]
    fn test_in_band_write_waits_for_payload() {
        let mut bytes = header(request_codes::WRITE, 4);
        bytes.extend_from_slice(&[1, 2]);
        assert_eq!(parse_request(&bytes, true), Parse::NeedMoreBytes(2));

        bytes.extend_from_slice(&[3, 4]);
        assert_eq!(
            parse_request(&bytes, true),
            Parse::Complete {
                value: AudioRequest::Write { length: 4 },
                consumed: 9
            }
        );
    }

    #[test]
    fn test_shared_write_is_header_only() {
        let bytes = header(request_codes::WRITE, 4096);
        assert_eq!(
            parse_request(&bytes, false),
            Parse::Complete {
                value: AudioRequest::Write { length: 4096 },
                consumed: 5
            }
        );
    }

    #[test]
    fn test_pointer_ignores_declared_length() {
        assert_eq!(
            parse_request(&header(request_codes::POINTER, 0), true),
            Parse::Complete {
                value: AudioRequest::Pointer,
                consumed: 5
            }
        );
    }

    #[test]
    fn test_prepare_params_reject_unknown_format() {
        let request = PrepareRequest {
            channels: 2,
            format_index: 9,
            sample_rate: 44_100,
            buffer_size: 16,
        };
        assert_eq!(request.params(), None);
    }

    #[test]
    fn test_negative_buffer_size_is_invalid() {
        let request = PrepareRequest {
            channels: 2,
            format_index: 1,
            sample_rate: 44_100,
            buffer_size: -1,
        };
        assert!(!request.params().unwrap().is_valid());
    }

    #[test]
    fn test_min_buffer_size_for_unknown_format_is_zero() {
        let service = AudioService::new(
            Arc::new(super::super::NullBackend),
            Arc::new(SharedMemory::new()),
        );
        assert_eq!(service.min_buffer_size(2, 7, 44_100), 0);
        assert_eq!(service.min_buffer_size(1, 0, 8_000), 80);
    }

    #[test]
    fn test_release_returns_segment_to_table() {
        let memory = Arc::new(SharedMemory::new());
        let service = AudioService::new(Arc::new(super::super::NullBackend), Arc::clone(&memory));
        let mut session = AudioSession::new();
        session.configure(StreamParams {
            channels: 2,
            format: SampleFormat::S16Le,
            sample_rate: 44_100,
            buffer_size: 64,
        });
        assert!(session.prepare(&super::super::NullBackend));
        assert!(service.allocate_shared_buffer(&mut session).is_some());
        assert_eq!(memory.len(), 1);

        service.release_session(&mut session);
        assert!(memory.is_empty());
        assert!(!session.has_shared_buffer());
        assert_eq!(session.pointer(), 0);
    }
}
