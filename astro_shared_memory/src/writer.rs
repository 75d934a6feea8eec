//! Writer side of a shared data transfer.

use crate::error::{ShmError, ShmResult};
use crate::region::SharedRegion;
use std::collections::BTreeMap;
use std::rc::Rc;
use tracing::{debug, error, warn};

/// Creates the region, hands segments to readers and records how many
/// bytes of each channel were produced.
///
/// Clones share the region; the semaphores and mapping are released when
/// the last clone is dropped.
#[derive(Debug, Clone)]
pub struct DataSharedWrite {
    region: Rc<SharedRegion>,
    segment_size: usize,
    chan2seg: BTreeMap<usize, usize>,
}

impl DataSharedWrite {
    /// Allocate `numseg` segments of `segsize` bytes, each guarded by a
    /// semaphore initialised to 1.
    pub fn create(numseg: usize, segsize: usize) -> ShmResult<Self> {
        let region = SharedRegion::create(numseg, segsize)?;
        Ok(Self {
            region: Rc::new(region),
            segment_size: segsize,
            chan2seg: BTreeMap::new(),
        })
    }

    pub fn shm_id(&self) -> i32 {
        self.region.shm_id()
    }

    pub fn nseg(&self) -> usize {
        self.region.nseg()
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    /// Claim the first segment without readers for `client`, reset its
    /// counters and bind it to `chan`.
    pub fn add_client(&mut self, segsize: usize, chan: usize, client: i32) -> ShmResult<usize> {
        if client <= 0 {
            return Err(ShmError::InvalidClient { client });
        }
        if segsize > self.segment_size {
            return Err(ShmError::SegmentOverflow {
                segment: 0,
                len: segsize,
                remaining: self.segment_size,
            });
        }
        let arena = self.region.arena();
        for index in 0..self.region.nseg() {
            let _lock = self.region.lock(index)?;
            let mut record = arena.segment(index)?;
            if !record.is_free() {
                continue;
            }
            record.bytes_so_far = 0;
            record.size = segsize;
            record.client_ids[0] = client;
            arena.write_segment(index, &record)?;
            self.chan2seg.insert(chan, index);
            debug!("Segment {index} assigned to client {client} for channel {chan}");
            return Ok(index);
        }
        error!("No free shared segment for channel {chan} (client {client})");
        Err(ShmError::NoFreeSegment { chan })
    }

    pub fn remove_client(&self, segment: usize, client: i32) -> ShmResult<()> {
        self.region.remove_client(segment, client)
    }

    pub fn segment_for(&self, chan: usize) -> Option<usize> {
        self.chan2seg.get(&chan).copied()
    }

    fn channel_segment(&self, chan: usize) -> ShmResult<usize> {
        self.segment_for(chan)
            .ok_or(ShmError::UnknownChannel { chan })
    }

    /// Bytes of `chan` not yet produced.
    pub fn channel_size(&self, chan: usize) -> ShmResult<usize> {
        let segment = self.channel_segment(chan)?;
        Ok(self.region.arena().segment(segment)?.rest_size())
    }

    /// Bytes not yet produced over all channels.
    pub fn data_size(&self) -> ShmResult<usize> {
        self.chan2seg
            .keys()
            .try_fold(0usize, |acc, &chan| Ok(acc + self.channel_size(chan)?))
    }

    /// Record `size` freshly produced bytes of `chan`.
    pub fn data_written(&mut self, chan: usize, size: usize) -> ShmResult<()> {
        let segment = self.channel_segment(chan)?;
        self.region.update_segment(segment, |record| {
            let rest = record.rest_size();
            if size > rest {
                warn!("Channel {chan} written {size} bytes, only {rest} announced");
            }
            record.bytes_so_far = record.bytes_so_far.saturating_add(size).min(record.size);
        })
    }

    /// Copy `data` behind the bytes already produced on `chan`.
    pub fn write_channel(&mut self, chan: usize, data: &[u8]) -> ShmResult<usize> {
        let segment = self.channel_segment(chan)?;
        let record = self.region.arena().segment(segment)?;
        let remaining = record.rest_size();
        if data.len() > remaining {
            return Err(ShmError::SegmentOverflow {
                segment,
                len: data.len(),
                remaining,
            });
        }
        self.region
            .arena()
            .copy_in(record.offset + record.bytes_so_far, data)?;
        self.data_written(chan, data.len())?;
        Ok(data.len())
    }

    /// Mark every channel complete; used when a transfer is aborted so
    /// readers stop waiting.
    pub fn end_channels(&mut self) -> ShmResult<()> {
        for &segment in self.chan2seg.values() {
            self.region.update_segment(segment, |record| {
                record.bytes_so_far = record.size;
            })?;
        }
        Ok(())
    }

    pub fn clear_chan2seg(&mut self) {
        self.chan2seg.clear();
    }

    pub fn channels(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.chan2seg.iter().map(|(&chan, &seg)| (chan, seg))
    }
}
