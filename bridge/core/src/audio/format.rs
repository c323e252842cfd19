//! PCM sample formats and stream parameters

use std::fmt;

use crate::stream::ByteOrder;

/// Sample encoding, indexed on the wire as 0..=4
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleFormat {
    /// Unsigned 8-bit
    #[default]
    U8,
    /// Signed 16-bit little-endian
    S16Le,
    /// Signed 16-bit big-endian
    S16Be,
    /// 32-bit float little-endian
    FloatLe,
    /// 32-bit float big-endian
    FloatBe,
}

impl SampleFormat {
    /// Decode a wire index
    #[must_use]
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(Self::U8),
            1 => Some(Self::S16Le),
            2 => Some(Self::S16Be),
            3 => Some(Self::FloatLe),
            4 => Some(Self::FloatBe),
            _ => None,
        }
    }

    /// Wire index
    #[must_use]
    pub fn index(self) -> u8 {
        match self {
            Self::U8 => 0,
            Self::S16Le => 1,
            Self::S16Be => 2,
            Self::FloatLe => 3,
            Self::FloatBe => 4,
        }
    }

    /// Bytes per sample
    #[must_use]
    pub fn byte_width(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::S16Le | Self::S16Be => 2,
            Self::FloatLe | Self::FloatBe => 4,
        }
    }

    /// Byte order of multi-byte samples
    #[must_use]
    pub fn byte_order(self) -> ByteOrder {
        match self {
            Self::S16Be | Self::FloatBe => ByteOrder::Big,
            Self::U8 | Self::S16Le | Self::FloatLe => ByteOrder::Little,
        }
    }

    /// Whether samples are floating point
    #[must_use]
    pub fn is_float(self) -> bool {
        matches!(self, Self::FloatLe | Self::FloatBe)
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::U8 => "U8",
            Self::S16Le => "S16_LE",
            Self::S16Be => "S16_BE",
            Self::FloatLe => "FLOAT_LE",
            Self::FloatBe => "FLOAT_BE",
        };
        f.write_str(name)
    }
}

/// Parameters of a PCM playback stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamParams {
    /// Interleaved channel count
    pub channels: u8,
    /// Sample encoding
    pub format: SampleFormat,
    /// Frames per second
    pub sample_rate: u32,
    /// Ring buffer length in frames
    pub buffer_size: u32,
}

impl Default for StreamParams {
    fn default() -> Self {
        Self {
            channels: 2,
            format: SampleFormat::U8,
            sample_rate: 0,
            buffer_size: 0,
        }
    }
}

impl StreamParams {
    /// Bytes per frame
    #[must_use]
    pub fn frame_bytes(&self) -> usize {
        usize::from(self.channels) * self.format.byte_width()
    }

    /// Ring buffer length in bytes
    #[must_use]
    pub fn buffer_size_in_bytes(&self) -> usize {
        self.buffer_size as usize * self.frame_bytes()
    }

    /// Whether a stream can be opened with these parameters
    #[must_use]
    pub fn is_valid(&self) -> bool {
        let frame_bytes = self.frame_bytes();
        frame_bytes > 0
            && self.buffer_size > 0
            && self.buffer_size_in_bytes() % frame_bytes == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_indices_round_trip() {
        for index in 0..5 {
            assert_eq!(SampleFormat::from_index(index).unwrap().index(), index);
        }
        assert_eq!(SampleFormat::from_index(5), None);
    }

    #[test]
    fn test_frame_bytes() {
        let params = StreamParams {
            channels: 2,
            format: SampleFormat::S16Le,
            sample_rate: 44_100,
            buffer_size: 1024,
        };
        assert_eq!(params.frame_bytes(), 4);
        assert_eq!(params.buffer_size_in_bytes(), 4096);
        assert!(params.is_valid());
    }

    #[test]
    fn test_zero_buffer_or_channels_is_invalid() {
        let base = StreamParams {
            channels: 2,
            format: SampleFormat::FloatBe,
            sample_rate: 48_000,
            buffer_size: 0,
        };
        assert!(!base.is_valid());
        assert!(!StreamParams {
            channels: 0,
            buffer_size: 64,
            ..base
        }
        .is_valid());
    }

    #[test]
    fn test_big_endian_formats() {
        assert_eq!(SampleFormat::S16Be.byte_order(), ByteOrder::Big);
        assert_eq!(SampleFormat::FloatLe.byte_order(), ByteOrder::Little);
        assert!(SampleFormat::FloatBe.is_float());
    }
}
