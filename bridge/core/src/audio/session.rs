//! Per-connection playback state

use std::fmt;

use tracing::{debug, warn};

use super::backend::{AudioBackend, PcmStream};
use super::format::StreamParams;
use crate::shm::{SegmentId, SharedMapping};

/// Shared ring buffer handed to the client at prepare time
#[derive(Debug)]
pub struct SharedBuffer {
    /// Segment in the shared-memory table
    pub segment_id: SegmentId,
    /// The service's view of the segment
    pub mapping: SharedMapping,
}

/// Playback state of one audio connection
///
/// Position counts bytes accepted by the stream since the last prepare;
/// the pointer reported to clients is that count in frames.
pub struct AudioSession {
    params: StreamParams,
    frame_bytes: usize,
    position: u64,
    stream: Option<Box<dyn PcmStream>>,
    shared: Option<SharedBuffer>,
}

impl Default for AudioSession {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSession {
    /// An unprepared session with default parameters
    #[must_use]
    pub fn new() -> Self {
        let params = StreamParams::default();
        Self {
            frame_bytes: params.frame_bytes(),
            params,
            position: 0,
            stream: None,
            shared: None,
        }
    }

    /// Current parameters
    #[must_use]
    pub fn params(&self) -> &StreamParams {
        &self.params
    }

    /// Replace the parameters used by the next [`prepare`](Self::prepare)
    pub fn configure(&mut self, params: StreamParams) {
        self.params = params;
    }

    /// Reset position, close any open stream and open a new one if the
    /// parameters are valid; the new stream starts playing
    ///
    /// Returns whether a stream is open afterwards.
    pub fn prepare(&mut self, backend: &dyn AudioBackend) -> bool {
        self.position = 0;
        self.frame_bytes = self.params.frame_bytes();
        self.release_stream();

        if !self.params.is_valid() {
            debug!(params = ?self.params, "Prepare with invalid parameters; session stays idle");
            return false;
        }

        match backend.open(&self.params) {
            Ok(mut stream) => {
                stream.play();
                self.stream = Some(stream);
                true
            }
            Err(e) => {
                warn!(error = %e, "Failed to open playback stream");
                false
            }
        }
    }

    /// Drop back to the unprepared state
    pub fn reset(&mut self) {
        self.position = 0;
        self.release_stream();
    }

    /// Resume playback
    pub fn start(&mut self) {
        if let Some(stream) = self.stream.as_mut() {
            stream.play();
        }
    }

    /// Pause and discard queued data
    pub fn stop(&mut self) {
        if let Some(stream) = self.stream.as_mut() {
            stream.pause();
            stream.flush();
        }
    }

    /// Pause playback
    pub fn pause(&mut self) {
        if let Some(stream) = self.stream.as_mut() {
            stream.pause();
        }
    }

    /// Let queued data finish playing without stopping the stream
    pub fn drain(&mut self) {
        if let Some(stream) = self.stream.as_mut() {
            stream.drain();
        }
    }

    /// Queue `data` on the stream; returns bytes accepted (0 when idle)
    pub fn write(&mut self, data: &[u8]) -> usize {
        let Some(stream) = self.stream.as_mut() else {
            return 0;
        };
        let accepted = stream.write(data, self.params.format.byte_order());
        self.position += accepted as u64;
        accepted
    }

    /// Queue the first `length` bytes of the shared buffer
    pub fn write_from_shared(&mut self, length: usize) -> usize {
        let (Some(stream), Some(shared)) = (self.stream.as_mut(), self.shared.as_ref()) else {
            return 0;
        };
        let end = length.min(shared.mapping.len());
        let accepted = stream.write(&shared.mapping[..end], self.params.format.byte_order());
        self.position += accepted as u64;
        accepted
    }

    /// Play position in frames, truncated to 32 bits; 0 when no stream is
    /// open
    #[must_use]
    pub fn pointer(&self) -> u32 {
        if self.stream.is_none() || self.frame_bytes == 0 {
            return 0;
        }
        #[allow(clippy::cast_possible_truncation)]
        let frames = (self.position / self.frame_bytes as u64) as u32;
        frames
    }

    /// Whether a stream is open
    #[must_use]
    pub fn is_prepared(&self) -> bool {
        self.stream.is_some()
    }

    /// Whether writes come from the shared buffer
    #[must_use]
    pub fn has_shared_buffer(&self) -> bool {
        self.shared.is_some()
    }

    /// Install the shared buffer
    pub fn set_shared_buffer(&mut self, shared: SharedBuffer) {
        self.shared = Some(shared);
    }

    /// Remove and return the shared buffer
    pub fn take_shared_buffer(&mut self) -> Option<SharedBuffer> {
        self.shared.take()
    }

    fn release_stream(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.pause();
            stream.flush();
        }
    }
}

impl fmt::Debug for AudioSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioSession")
            .field("params", &self.params)
            .field("position", &self.position)
            .field("prepared", &self.stream.is_some())
            .field("shared", &self.shared.as_ref().map(|s| s.segment_id))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::audio::{AudioError, NullBackend, SampleFormat};
    use crate::stream::ByteOrder;

    /// Stream that records every call made on it
    struct RecordingStream {
        calls: Arc<Mutex<Vec<&'static str>>>,
        playing: bool,
    }

    impl PcmStream for RecordingStream {
        fn play(&mut self) {
            self.playing = true;
            self.calls.lock().push("play");
        }

        fn pause(&mut self) {
            self.playing = false;
            self.calls.lock().push("pause");
        }

        fn stop(&mut self) {
            self.playing = false;
            self.calls.lock().push("stop");
        }

        fn flush(&mut self) {
            self.calls.lock().push("flush");
        }

        fn drain(&mut self) {
            self.calls.lock().push("drain");
        }

        fn is_playing(&self) -> bool {
            self.playing
        }

        fn write(&mut self, data: &[u8], _order: ByteOrder) -> usize {
            data.len()
        }
    }

    #[derive(Default)]
    struct RecordingBackend {
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    impl AudioBackend for RecordingBackend {
        fn open(&self, _params: &StreamParams) -> Result<Box<dyn PcmStream>, AudioError> {
            Ok(Box::new(RecordingStream {
                calls: Arc::clone(&self.calls),
                playing: false,
            }))
        }

        fn min_buffer_size(&self, _channels: u8, _format: SampleFormat, _rate: u32) -> u32 {
            0
        }
    }

    fn stereo_s16(buffer_size: u32) -> StreamParams {
        StreamParams {
            channels: 2,
            format: SampleFormat::S16Le,
            sample_rate: 44_100,
            buffer_size,
        }
    }

    #[test]
    fn test_pointer_counts_frames() {
        let mut session = AudioSession::new();
        session.configure(stereo_s16(1024));
        assert!(session.prepare(&NullBackend));

        assert_eq!(session.write(&[0; 4096]), 4096);
        assert_eq!(session.pointer(), 1024);
        assert_eq!(session.write(&[0; 6]), 6);
        assert_eq!(session.pointer(), 1025);
    }

    #[test]
    fn test_prepare_resets_position() {
        let mut session = AudioSession::new();
        session.configure(stereo_s16(16));
        session.prepare(&NullBackend);
        session.write(&[0; 64]);

        session.prepare(&NullBackend);
        assert_eq!(session.pointer(), 0);
    }

    #[test]
    fn test_unprepared_session_is_inert() {
        let mut session = AudioSession::new();
        session.configure(stereo_s16(0));
        assert!(!session.prepare(&NullBackend));

        assert_eq!(session.write(&[0; 32]), 0);
        session.start();
        session.drain();
        assert_eq!(session.pointer(), 0);
        assert!(!session.is_prepared());
    }

    #[test]
    fn test_drain_keeps_stream_playing() {
        let backend = RecordingBackend::default();
        let mut session = AudioSession::new();
        session.configure(stereo_s16(64));
        assert!(session.prepare(&backend));
        session.write(&[0; 256]);

        session.drain();
        assert_eq!(*backend.calls.lock(), vec!["play", "drain"]);
        assert_eq!(session.pointer(), 64);
        assert!(session.is_prepared());

        session.stop();
        assert_eq!(*backend.calls.lock(), vec!["play", "drain", "pause", "flush"]);
    }
}
