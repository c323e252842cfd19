//! Typed little/big-endian decoding over an unconsumed frame
//!
//! Request parsers never touch the stream directly: they are handed the
//! bytes currently buffered and report either a complete request together
//! with how many bytes it occupies, or how many more bytes they need. The
//! broker only commits consumption for complete requests, so a request
//! split across any number of reads parses identically to one delivered
//! in a single read.

/// Byte order applied to multi-byte integers on a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    /// Least significant byte first (the wire default)
    #[default]
    Little,
    /// Most significant byte first
    Big,
}

impl ByteOrder {
    /// Byte order of the host CPU
    #[must_use]
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            Self::Big
        } else {
            Self::Little
        }
    }
}

/// Result of a resumable parse attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parse<T> {
    /// A whole request was decoded from the first `consumed` bytes
    Complete {
        /// The decoded request
        value: T,
        /// Bytes the request occupies, header included
        consumed: usize,
    },
    /// The frame ends before the request does; at least this many more
    /// bytes are required
    NeedMoreBytes(usize),
}

impl<T> Parse<T> {
    /// Whether a complete request was decoded
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete { .. })
    }
}

/// Cursor over a borrowed frame
///
/// Every read returns `None` instead of panicking when the frame is too
/// short, leaving the cursor where it was.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
    order: ByteOrder,
}

impl<'a> ByteReader<'a> {
    /// Create a reader at the start of `bytes`
    #[must_use]
    pub fn new(bytes: &'a [u8], order: ByteOrder) -> Self {
        Self {
            bytes,
            pos: 0,
            order,
        }
    }

    /// Bytes read so far
    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left after the cursor
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    /// Read an unsigned byte
    pub fn read_u8(&mut self) -> Option<u8> {
        self.take::<1>().map(|[b]| b)
    }

    /// Read a signed 16-bit integer
    pub fn read_i16(&mut self) -> Option<i16> {
        let raw = self.take::<2>()?;
        Some(match self.order {
            ByteOrder::Little => i16::from_le_bytes(raw),
            ByteOrder::Big => i16::from_be_bytes(raw),
        })
    }

    /// Read a signed 32-bit integer
    pub fn read_i32(&mut self) -> Option<i32> {
        let raw = self.take::<4>()?;
        Some(match self.order {
            ByteOrder::Little => i32::from_le_bytes(raw),
            ByteOrder::Big => i32::from_be_bytes(raw),
        })
    }

    /// Read an unsigned 32-bit integer
    pub fn read_u32(&mut self) -> Option<u32> {
        let raw = self.take::<4>()?;
        Some(match self.order {
            ByteOrder::Little => u32::from_le_bytes(raw),
            ByteOrder::Big => u32::from_be_bytes(raw),
        })
    }

    /// Read an unsigned 64-bit integer
    pub fn read_u64(&mut self) -> Option<u64> {
        let raw = self.take::<8>()?;
        Some(match self.order {
            ByteOrder::Little => u64::from_le_bytes(raw),
            ByteOrder::Big => u64::from_be_bytes(raw),
        })
    }

    /// Borrow the next `len` bytes
    pub fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let chunk = self.bytes.get(self.pos..end)?;
        self.pos = end;
        Some(chunk)
    }

    /// Advance past `len` bytes
    pub fn skip(&mut self, len: usize) -> Option<()> {
        self.read_bytes(len).map(|_| ())
    }

    fn take<const N: usize>(&mut self) -> Option<[u8; N]> {
        self.read_bytes(N)?.try_into().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_little_endian_fields() {
        let bytes = [7, 0x10, 0, 0, 0, 0xFE, 0xFF];
        let mut reader = ByteReader::new(&bytes, ByteOrder::Little);

        assert_eq!(reader.read_u8(), Some(7));
        assert_eq!(reader.read_i32(), Some(16));
        assert_eq!(reader.read_i16(), Some(-2));
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_big_endian_order() {
        let bytes = [0, 0, 1, 0];
        let mut reader = ByteReader::new(&bytes, ByteOrder::Big);
        assert_eq!(reader.read_u32(), Some(256));
    }

    #[test]
    fn test_short_read_leaves_cursor_in_place() {
        let bytes = [1, 2, 3];
        let mut reader = ByteReader::new(&bytes, ByteOrder::Little);

        assert_eq!(reader.read_u8(), Some(1));
        assert_eq!(reader.read_i32(), None);
        assert_eq!(reader.position(), 1);
        assert_eq!(reader.read_bytes(2), Some(&[2, 3][..]));
    }
}
