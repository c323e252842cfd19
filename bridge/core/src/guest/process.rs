//! Guest process listing records
//!
//! A GET_PROCESSES response body is a run of fixed 64-byte records:
//!
//! ```text
//! ┌───────┬─────────────┬──────────┬──────────────┬─────────┐
//! │ pid:4 │ memory:8    │ mask:4   │ name:32      │ pad:16  │
//! └───────┴─────────────┴──────────┴──────────────┴─────────┘
//! ```
//!
//! The final record may omit its padding. Names are single-byte encoded
//! and NUL-terminated within their 32 bytes.

use crate::stream::{ByteOrder, ByteReader};

/// Stride between records
pub const PROCESS_RECORD_SIZE: usize = 64;

/// Width of the name field
pub const PROCESS_NAME_SIZE: usize = 32;

/// Largest record count accepted in one listing; longer bodies are skipped
pub const MAX_PROCESS_RECORDS: usize = 16_384;

/// A process running in the guest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    /// Guest process id
    pub pid: i32,
    /// Image name
    pub name: String,
    /// Working set in bytes
    pub memory_usage: u64,
    /// CPU affinity bitmask
    pub affinity_mask: u32,
}

impl ProcessInfo {
    /// Whether the process may run on `cpu`
    #[must_use]
    pub fn runs_on(&self, cpu: u32) -> bool {
        cpu < 32 && self.affinity_mask & (1 << cpu) != 0
    }
}

/// Decode every complete record in `body`; a trailing fragment too short
/// to hold the record fields is ignored
#[must_use]
pub fn parse_process_records(body: &[u8]) -> Vec<ProcessInfo> {
    body.chunks(PROCESS_RECORD_SIZE).filter_map(parse_record).collect()
}

fn parse_record(record: &[u8]) -> Option<ProcessInfo> {
    let mut reader = ByteReader::new(record, ByteOrder::Little);
    let pid = reader.read_i32()?;
    let memory_usage = reader.read_u64()?;
    let affinity_mask = reader.read_u32()?;
    let name = decode_name(reader.read_bytes(PROCESS_NAME_SIZE)?);
    Some(ProcessInfo {
        pid,
        name,
        memory_usage,
        affinity_mask,
    })
}

fn decode_name(raw: &[u8]) -> String {
    raw.iter()
        .take_while(|&&b| b != 0)
        .map(|&b| char::from(b))
        .collect()
}
