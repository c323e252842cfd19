//! Buffered byte streams over connected Unix sockets
//!
//! Every broker connection owns one [`InputStream`] and one
//! [`OutputStream`] sharing a [`ClientSocket`]. Both default to
//! little-endian integers.

mod input;
mod output;
mod reader;
mod socket;

pub use input::InputStream;
pub use output::{OutputLock, OutputStream};
pub use reader::{ByteOrder, ByteReader, Parse};
pub use socket::{ClientSocket, MAX_ANCILLARY_FDS};
