//! Native playback seam
//!
//! The service never talks to an audio device directly; it opens
//! [`PcmStream`]s through an [`AudioBackend`]. [`NullBackend`] accepts and
//! discards everything, which is enough for headless hosts and tests.
//! [`FileBackend`] appends the raw interleaved samples to a file or named
//! pipe, for a player such as `aplay` or `pw-cat` reading the other end.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::format::{SampleFormat, StreamParams};
use super::AudioError;
use crate::stream::ByteOrder;

/// An open playback stream
pub trait PcmStream: Send {
    /// Begin or resume playback
    fn play(&mut self);

    /// Pause playback, keeping queued data
    fn pause(&mut self);

    /// Stop playback
    fn stop(&mut self);

    /// Discard queued data
    fn flush(&mut self);

    /// Let queued data play out; playback state is unchanged
    fn drain(&mut self);

    /// Whether the stream is currently playing
    fn is_playing(&self) -> bool;

    /// Queue interleaved samples in `order`; returns how many bytes were
    /// accepted
    fn write(&mut self, data: &[u8], order: ByteOrder) -> usize;
}

/// Factory for playback streams
pub trait AudioBackend: Send + Sync + 'static {
    /// Open a stream for `params`
    ///
    /// # Errors
    ///
    /// Returns an error if the device rejects the parameters.
    fn open(&self, params: &StreamParams) -> Result<Box<dyn PcmStream>, AudioError>;

    /// Smallest buffer, in bytes, the device accepts for this format
    fn min_buffer_size(&self, channels: u8, format: SampleFormat, sample_rate: u32) -> u32;
}

/// Selectable playback backends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// [`NullBackend`]
    #[default]
    Null,
    /// [`FileBackend`]
    File,
}

impl BackendKind {
    /// Build the backend; `output` is required for [`BackendKind::File`]
    ///
    /// # Errors
    ///
    /// Returns [`AudioError::MissingOutput`] for a file backend without a
    /// path.
    pub fn create(self, output: Option<&Path>) -> Result<Arc<dyn AudioBackend>, AudioError> {
        match self {
            Self::Null => Ok(Arc::new(NullBackend)),
            Self::File => output
                .map(|path| Arc::new(FileBackend::new(path)) as Arc<dyn AudioBackend>)
                .ok_or(AudioError::MissingOutput(self)),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::File => write!(f, "file"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = AudioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "null" | "none" => Ok(Self::Null),
            "file" | "pipe" => Ok(Self::File),
            _ => Err(AudioError::UnknownBackend(s.to_string())),
        }
    }
}

/// Ten milliseconds of frames, in bytes
fn ten_milliseconds(channels: u8, format: SampleFormat, sample_rate: u32) -> u32 {
    let frame_bytes = u32::from(channels) * format.byte_width() as u32;
    (sample_rate / 100).saturating_mul(frame_bytes)
}

/// Backend that plays nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NullBackend;

impl AudioBackend for NullBackend {
    fn open(&self, params: &StreamParams) -> Result<Box<dyn PcmStream>, AudioError> {
        trace!(
            channels = params.channels,
            format = %params.format,
            rate = params.sample_rate,
            "Opening null stream"
        );
        Ok(Box::new(NullStream::default()))
    }

    /// One 10 ms period
    fn min_buffer_size(&self, channels: u8, format: SampleFormat, sample_rate: u32) -> u32 {
        ten_milliseconds(channels, format, sample_rate)
    }
}

/// Backend that appends samples to a file or named pipe
///
/// Every stream opens the path in append mode. Samples are written as the
/// client sent them, without conversion. Opening a pipe blocks until a
/// reader is attached.
#[derive(Debug, Clone)]
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    /// Write streams to `path`
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Output path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AudioBackend for FileBackend {
    fn open(&self, params: &StreamParams) -> Result<Box<dyn PcmStream>, AudioError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| AudioError::Open {
                channels: params.channels,
                format: params.format,
                sample_rate: params.sample_rate,
                reason: format!("{}: {e}", self.path.display()),
            })?;
        debug!(
            path = %self.path.display(),
            channels = params.channels,
            format = %params.format,
            rate = params.sample_rate,
            "Opened file stream"
        );
        Ok(Box::new(FileStream {
            file,
            playing: false,
        }))
    }

    fn min_buffer_size(&self, channels: u8, format: SampleFormat, sample_rate: u32) -> u32 {
        ten_milliseconds(channels, format, sample_rate)
    }
}

#[derive(Debug)]
struct FileStream {
    file: File,
    playing: bool,
}

impl PcmStream for FileStream {
    fn play(&mut self) {
        self.playing = true;
    }

    fn pause(&mut self) {
        self.playing = false;
    }

    fn stop(&mut self) {
        self.playing = false;
    }

    // Samples leave the process on write; nothing is held back to discard
    fn flush(&mut self) {}

    fn drain(&mut self) {
        if let Err(e) = self.file.flush() {
            warn!(error = %e, "Failed to flush audio output");
        }
    }

    fn is_playing(&self) -> bool {
        self.playing
    }

    fn write(&mut self, data: &[u8], _order: ByteOrder) -> usize {
        match self.file.write_all(data) {
            Ok(()) => data.len(),
            Err(e) => {
                warn!(error = %e, "Failed to write audio output");
                0
            }
        }
    }
}

#[derive(Debug, Default)]
struct NullStream {
    playing: bool,
}

impl PcmStream for NullStream {
    fn play(&mut self) {
        self.playing = true;
    }

    fn pause(&mut self) {
        self.playing = false;
    }

    fn stop(&mut self) {
        self.playing = false;
    }

    fn flush(&mut self) {}

    fn drain(&mut self) {}

    fn is_playing(&self) -> bool {
        self.playing
    }

    fn write(&mut self, data: &[u8], _order: ByteOrder) -> usize {
        data.len()
    }
}
