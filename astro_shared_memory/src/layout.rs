//! Bit-exact layout of a shared data region and a bounds-checked view of it.
//!
//! ```text
//! ┌──────────────────┬──────────────────────────────┬──────────────────────┐
//! │ SharedDataHeader │ SharedDataSegment × nseg      │ data buffer × nseg   │
//! │ nseg, shared_sem │ client_ids, size, bytes, off  │ segsize bytes each   │
//! └──────────────────┴──────────────────────────────┴──────────────────────┘
//! ```
//!
//! All offsets are derived from the field layout alone, so a reader that
//! only knows the shared memory id can find every segment.

use crate::error::{ShmError, ShmResult};
use astro::consts::MAX_SHARED_CLIENTS;
use static_assertions::const_assert_eq;
use std::mem::size_of;
use std::ptr::NonNull;

/// Region header.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SharedDataHeader {
    /// Number of data segments.
    pub nseg: i32,
    /// Semaphore set id, one semaphore per segment.
    pub shared_sem: i32,
}

/// Per-segment bookkeeping record.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SharedDataSegment {
    /// Reader ids; a segment with any positive slot cannot be reused.
    pub client_ids: [i32; MAX_SHARED_CLIENTS],
    /// Bytes announced for the transfer.
    pub size: usize,
    /// Bytes the writer has produced so far.
    pub bytes_so_far: usize,
    /// Offset of the data buffer from the region base.
    pub offset: usize,
}

impl SharedDataSegment {
    pub fn is_free(&self) -> bool {
        self.client_ids.iter().all(|&id| id <= 0)
    }

    pub fn has_client(&self, client: i32) -> bool {
        self.client_ids.contains(&client)
    }

    pub fn rest_size(&self) -> usize {
        self.size.saturating_sub(self.bytes_so_far)
    }
}

const_assert_eq!(size_of::<SharedDataHeader>(), 8);
#[cfg(target_pointer_width = "64")]
const_assert_eq!(size_of::<SharedDataSegment>(), 64);

pub const HEADER_SIZE: usize = size_of::<SharedDataHeader>();
pub const SEGMENT_RECORD_SIZE: usize = size_of::<SharedDataSegment>();

/// Total bytes needed for `nseg` segments of `segsize` bytes.
pub fn region_size(nseg: usize, segsize: usize) -> Option<usize> {
    SEGMENT_RECORD_SIZE
        .checked_add(segsize)?
        .checked_mul(nseg)?
        .checked_add(HEADER_SIZE)
}

/// Offset of the data buffer of segment `index`.
pub fn data_offset(nseg: usize, segsize: usize, index: usize) -> usize {
    HEADER_SIZE + nseg * SEGMENT_RECORD_SIZE + index * segsize
}

/// View over an attached region. Every access is checked against the
/// mapping length and the header's segment count.
#[derive(Debug)]
pub struct SharedArena {
    base: NonNull<u8>,
    len: usize,
}

impl SharedArena {
    /// # Safety
    ///
    /// `base` must point to a live mapping of at least `len` bytes that
    /// stays mapped for the lifetime of the arena.
    pub unsafe fn new(base: NonNull<u8>, len: usize) -> ShmResult<Self> {
        if len < HEADER_SIZE {
            return Err(ShmError::CorruptedLayout {
                reason: format!("mapping of {len} bytes cannot hold a header"),
            });
        }
        Ok(Self { base, len })
    }

    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn header(&self) -> SharedDataHeader {
        unsafe { self.base.as_ptr().cast::<SharedDataHeader>().read_volatile() }
    }

    pub fn write_header(&self, header: SharedDataHeader) {
        unsafe {
            self.base
                .as_ptr()
                .cast::<SharedDataHeader>()
                .write_volatile(header)
        }
    }

    /// Segment count from the header, validated against the mapping.
    pub fn nseg(&self) -> ShmResult<usize> {
        let nseg = self.header().nseg;
        if nseg < 0 {
            return Err(ShmError::CorruptedLayout {
                reason: format!("negative segment count {nseg}"),
            });
        }
        let nseg = nseg as usize;
        let records_end = nseg
            .checked_mul(SEGMENT_RECORD_SIZE)
            .and_then(|n| n.checked_add(HEADER_SIZE));
        match records_end {
            Some(end) if end <= self.len => Ok(nseg),
            _ => Err(ShmError::CorruptedLayout {
                reason: format!("{nseg} segment records exceed mapping of {} bytes", self.len),
            }),
        }
    }

    fn record_ptr(&self, index: usize) -> ShmResult<*mut SharedDataSegment> {
        let nseg = self.nseg()?;
        if index >= nseg {
            return Err(ShmError::SegmentOutOfRange {
                segment: index,
                nseg,
            });
        }
        let offset = HEADER_SIZE + index * SEGMENT_RECORD_SIZE;
        Ok(unsafe { self.base.as_ptr().add(offset).cast::<SharedDataSegment>() })
    }

    pub fn segment(&self, index: usize) -> ShmResult<SharedDataSegment> {
        let ptr = self.record_ptr(index)?;
        Ok(unsafe { ptr.read_volatile() })
    }

    pub(crate) fn write_segment(&self, index: usize, segment: &SharedDataSegment) -> ShmResult<()> {
        let ptr = self.record_ptr(index)?;
        unsafe { ptr.write_volatile(*segment) };
        Ok(())
    }

    /// Read-modify-write of one segment record. Callers hold the segment
    /// lock across the call; outside this crate use
    /// `SharedRegion::update_segment`, which takes it.
    pub(crate) fn update_segment<R>(
        &self,
        index: usize,
        f: impl FnOnce(&mut SharedDataSegment) -> R,
    ) -> ShmResult<R> {
        let mut record = self.segment(index)?;
        let result = f(&mut record);
        self.write_segment(index, &record)?;
        Ok(result)
    }

    fn check_range(&self, offset: usize, len: usize) -> ShmResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(ShmError::CorruptedLayout {
                reason: format!(
                    "range {offset}+{len} outside mapping of {} bytes",
                    self.len
                ),
            }),
        }
    }

    pub fn copy_out(&self, offset: usize, len: usize) -> ShmResult<Vec<u8>> {
        self.check_range(offset, len)?;
        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(self.base.as_ptr().add(offset), out.as_mut_ptr(), len);
        }
        Ok(out)
    }

    pub fn copy_in(&self, offset: usize, data: &[u8]) -> ShmResult<()> {
        self.check_range(offset, data.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.base.as_ptr().add(offset),
                data.len(),
            );
        }
        Ok(())
    }
}
