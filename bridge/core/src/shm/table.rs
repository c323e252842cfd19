//! Process-wide table of shared-memory segments
//!
//! Segment ids start at 1 and are never reused. A segment owns its memory
//! descriptor and, once attached, a single read-write shared mapping that
//! every attach of the same id returns.

use std::collections::BTreeMap;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;

use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::memfd::create_memory_fd;
use super::ShmError;

/// Segment identifier handed to clients
pub type SegmentId = i32;

/// Shared read-write view of a segment
pub type SharedMapping = Arc<MmapMut>;

#[derive(Debug)]
struct Segment {
    fd: OwnedFd,
    size: u64,
    mapping: Option<SharedMapping>,
}

#[derive(Debug, Default)]
struct SegmentTable {
    segments: BTreeMap<SegmentId, Segment>,
    last_id: SegmentId,
}

/// Shared-memory segment registry
///
/// All operations are mutually exclusive; the table can be shared between
/// services and threads behind an `Arc`.
#[derive(Debug, Default)]
pub struct SharedMemory {
    table: Mutex<SegmentTable>,
}

impl SharedMemory {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a zero-filled segment of `size` bytes
    ///
    /// # Errors
    ///
    /// Returns an error if no descriptor can be created or ids ran out.
    pub fn allocate(&self, size: u64) -> Result<SegmentId, ShmError> {
        let mut table = self.table.lock();
        let id = table.last_id.checked_add(1).ok_or(ShmError::IdsExhausted)?;
        let fd = create_memory_fd(&format!("sysvshm-{id}"), size)?;

        table.last_id = id;
        table.segments.insert(
            id,
            Segment {
                fd,
                size,
                mapping: None,
            },
        );
        debug!(segment_id = id, size, "Segment allocated");
        Ok(id)
    }

    /// Duplicate the segment's descriptor for handing to a client
    ///
    /// Returns `None` for unknown ids or if duplication fails.
    #[must_use]
    pub fn descriptor(&self, id: SegmentId) -> Option<OwnedFd> {
        let table = self.table.lock();
        let segment = table.segments.get(&id)?;
        match segment.fd.try_clone() {
            Ok(fd) => Some(fd),
            Err(e) => {
                warn!(segment_id = id, error = %e, "Failed to duplicate segment descriptor");
                None
            }
        }
    }

    /// Size in bytes of a live segment
    #[must_use]
    pub fn size(&self, id: SegmentId) -> Option<u64> {
        self.table.lock().segments.get(&id).map(|segment| segment.size)
    }

    /// Whether `id` names a live segment
    #[must_use]
    pub fn contains(&self, id: SegmentId) -> bool {
        self.table.lock().segments.contains_key(&id)
    }

    /// Close and forget a segment; unknown ids are ignored
    ///
    /// Outstanding mappings and descriptors already handed out stay valid
    /// until their holders release them.
    pub fn delete(&self, id: SegmentId) -> bool {
        let removed = self.table.lock().segments.remove(&id).is_some();
        if removed {
            debug!(segment_id = id, "Segment deleted");
        }
        removed
    }

    /// Delete every segment
    pub fn delete_all(&self) {
        let mut table = self.table.lock();
        let count = table.segments.len();
        table.segments.clear();
        if count > 0 {
            debug!(count, "All segments deleted");
        }
    }

    /// Map a segment read-write and shared, reusing an existing mapping
    ///
    /// Returns `None` for unknown ids or if mapping fails.
    #[must_use]
    pub fn attach(&self, id: SegmentId) -> Option<SharedMapping> {
        let mut table = self.table.lock();
        let segment = table.segments.get_mut(&id)?;
        if let Some(mapping) = &segment.mapping {
            return Some(Arc::clone(mapping));
        }

        let len = usize::try_from(segment.size).ok()?;
        // SAFETY: the descriptor is an anonymous memory object owned by this
        // table; nothing truncates it while mapped.
        let mapped = unsafe { MmapOptions::new().len(len).map_mut(segment.fd.as_raw_fd()) };
        match mapped {
            Ok(mmap) => {
                let mapping = Arc::new(mmap);
                segment.mapping = Some(Arc::clone(&mapping));
                Some(mapping)
            }
            Err(e) => {
                warn!(segment_id = id, error = %e, "Failed to map segment");
                None
            }
        }
    }

    /// Drop the table's reference to `mapping`; a mapping the table does
    /// not know is ignored
    ///
    /// The memory is unmapped once the last clone of the mapping drops.
    pub fn detach(&self, mapping: &SharedMapping) {
        let mut table = self.table.lock();
        let attached = table.segments.iter_mut().find(|(_, segment)| {
            segment
                .mapping
                .as_ref()
                .is_some_and(|existing| Arc::ptr_eq(existing, mapping))
        });
        if let Some((id, segment)) = attached {
            segment.mapping = None;
            debug!(segment_id = *id, "Segment detached");
        }
    }

    /// Number of live segments
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.lock().segments.len()
    }

    /// Whether no segments are live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let memory = SharedMemory::new();
        assert_eq!(memory.allocate(4096).unwrap(), 1);
        assert_eq!(memory.allocate(4096).unwrap(), 2);
        assert!(memory.delete(1));
        assert_eq!(memory.allocate(16).unwrap(), 3);
    }

    #[test]
    fn test_descriptor_is_independent_dup() {
        let memory = SharedMemory::new();
        let id = memory.allocate(1024).unwrap();

        let fd = memory.descriptor(id).unwrap();
        memory.delete(id);
        assert_eq!(File::from(fd).metadata().unwrap().len(), 1024);
        assert!(memory.descriptor(id).is_none());
    }

    #[test]
    fn test_delete_unknown_is_noop() {
        let memory = SharedMemory::new();
        assert!(!memory.delete(99));
        memory.allocate(8).unwrap();
        assert!(memory.delete(1));
        assert!(!memory.delete(1));
    }

    #[test]
    fn test_attach_returns_same_mapping() {
        let memory = SharedMemory::new();
        let id = memory.allocate(4096).unwrap();

        let first = memory.attach(id).unwrap();
        let second = memory.attach(id).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.len(), 4096);
        assert!(first.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_mapping_is_shared_with_descriptor() {
        use std::io::Read;

        let memory = SharedMemory::new();
        let id = memory.allocate(8).unwrap();
        let mut mapping = memory.attach(id).unwrap();
        memory.detach(&mapping);
        Arc::get_mut(&mut mapping).unwrap()[..4].copy_from_slice(b"ping");

        let mut file = File::from(memory.descriptor(id).unwrap());
        let mut contents = [0u8; 4];
        file.read_exact(&mut contents).unwrap();
        assert_eq!(&contents, b"ping");
    }

    #[test]
    fn test_detach_then_attach_maps_again() {
        let memory = SharedMemory::new();
        let id = memory.allocate(64).unwrap();
        let first = memory.attach(id).unwrap();
        memory.detach(&first);

        let second = memory.attach(id).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_delete_all_empties_table() {
        let memory = SharedMemory::new();
        memory.allocate(8).unwrap();
        memory.allocate(8).unwrap();
        memory.delete_all();
        assert!(memory.is_empty());
        assert!(memory.attach(1).is_none());
    }
}
