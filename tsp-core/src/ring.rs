//! Resident packet buffer.
//!
//! [`PacketRing`] reserves one contiguous anonymous mapping holding a
//! metadata array followed by a packet array, and attempts to lock the
//! region against paging. The ring provides raw indexed access only;
//! window accounting and synchronization are the pipeline's job.

use std::mem::size_of;

use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, warn};

use crate::error::{CoreError, Result};
use crate::metadata::PacketMetadata;
use crate::packet::{TsPacket, TS_PACKET_SIZE};

/// The resident circular packet buffer.
///
/// The slot count is derived from the requested byte size divided by the
/// packet size; the metadata array is allocated on top of that in the same
/// mapping. Page locking is best-effort: when the host refuses (usually an
/// `RLIMIT_MEMLOCK` cap), the buffer stays pageable and a warning is
/// logged.
pub struct PacketRing {
    map: MmapMut,
    count: usize,
    locked: bool,
}

impl PacketRing {
    /// Allocate a ring sized for `bytes` worth of packets.
    pub fn allocate(bytes: usize) -> Result<Self> {
        let count = bytes / TS_PACKET_SIZE;
        if count == 0 {
            return Err(CoreError::BufferTooSmall {
                requested: bytes,
                minimum: TS_PACKET_SIZE,
            });
        }

        // Metadata first (8-byte aligned at the page base), packets after.
        let total = count * (size_of::<PacketMetadata>() + TS_PACKET_SIZE);
        let mut map = MmapOptions::new().len(total).map_anon().map_err(|e| {
            CoreError::Allocation {
                requested: total,
                message: e.to_string(),
            }
        })?;

        let locked = match map.lock() {
            Ok(()) => true,
            Err(e) => {
                warn!(bytes = total, error = %e, "cannot lock packet buffer in memory, using pageable memory");
                false
            }
        };

        // The anonymous mapping is zero-filled, which is not the metadata
        // default state (no timestamp is all-ones).
        let meta_base = map.as_mut_ptr() as *mut PacketMetadata;
        for i in 0..count {
            // SAFETY: i < count and the mapping holds `count` metadata
            // records starting at its base.
            unsafe { meta_base.add(i).write(PacketMetadata::default()) };
        }

        debug!(slots = count, bytes = total, locked, "packet buffer allocated");
        Ok(Self { map, count, locked })
    }

    /// Number of packet slots in the ring.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Whether the mapping is locked against paging.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// A raw view over the packet and metadata arrays.
    ///
    /// The view stays valid for as long as this ring is alive; the caller
    /// must keep the ring alive for the lifetime of all views.
    pub fn view(&self) -> RingView {
        let meta = self.map.as_ptr() as *mut PacketMetadata;
        // SAFETY: the packet array starts right after `count` metadata
        // records, inside the same allocation.
        let packets = unsafe { meta.add(self.count) as *mut TsPacket };
        RingView {
            packets,
            metadata: meta,
            count: self.count,
        }
    }
}

/// Raw indexed access to the ring's packet and metadata arrays.
///
/// A `RingView` can be freely copied across the executor threads. Safety
/// rests on the window ledger's ownership discipline: at any instant every
/// slot index belongs to exactly one stage, and only that stage may touch
/// the slot. The `window` accessor encodes that contract.
#[derive(Clone, Copy)]
pub struct RingView {
    packets: *mut TsPacket,
    metadata: *mut PacketMetadata,
    count: usize,
}

// SAFETY: the pointers reference a single allocation whose slots are
// partitioned between threads by the window ledger; no two threads hold
// overlapping windows.
unsafe impl Send for RingView {}
unsafe impl Sync for RingView {}

impl RingView {
    /// Number of packet slots in the ring.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Mutable slices over a contiguous window of slots.
    ///
    /// The window never wraps: `first + len` must not exceed the slot
    /// count (the ledger clamps windows at the wrap point).
    ///
    /// # Safety
    ///
    /// The caller must own `[first, first + len)` according to the window
    /// ledger, and must not hold any other slice overlapping that range.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn window(&self, first: usize, len: usize) -> (&mut [TsPacket], &mut [PacketMetadata]) {
        assert!(first + len <= self.count, "window outside ring bounds");
        (
            std::slice::from_raw_parts_mut(self.packets.add(first), len),
            std::slice::from_raw_parts_mut(self.metadata.add(first), len),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_slot_count() {
        let ring = PacketRing::allocate(1024 * 1024).unwrap();
        assert_eq!(ring.count(), 1024 * 1024 / TS_PACKET_SIZE);
    }

    #[test]
    fn test_allocate_too_small() {
        assert!(matches!(
            PacketRing::allocate(100),
            Err(CoreError::BufferTooSmall { .. })
        ));
    }

    #[test]
    fn test_metadata_initialized() {
        let ring = PacketRing::allocate(64 * 1024).unwrap();
        let view = ring.view();
        let (_, meta) = unsafe { view.window(0, ring.count()) };
        assert!(meta.iter().all(|m| !m.has_input_time()));
        assert!(meta.iter().all(|m| m.labels().is_empty()));
    }

    #[test]
    fn test_window_read_write() {
        let ring = PacketRing::allocate(64 * 1024).unwrap();
        let view = ring.view();
        {
            let (packets, meta) = unsafe { view.window(3, 2) };
            packets[0] = TsPacket::null();
            packets[1].mark_dropped();
            meta[1].labels_mut().insert(4);
        }
        let (packets, meta) = unsafe { view.window(0, ring.count()) };
        assert!(packets[3].is_null());
        assert!(packets[4].is_dropped());
        assert!(meta[4].labels().contains(4));
    }

    #[test]
    #[should_panic(expected = "window outside ring bounds")]
    fn test_window_bounds_checked() {
        let ring = PacketRing::allocate(64 * 1024).unwrap();
        let view = ring.view();
        let count = ring.count();
        let _ = unsafe { view.window(count - 1, 2) };
    }
}
