//! Reader side of a shared data transfer.

use crate::error::{ShmError, ShmResult};
use crate::region::SharedRegion;
use std::rc::Rc;

/// Attachment to a region announced by a peer.
///
/// The region is mapped read-write: readers clear their own client slot
/// once a transfer completes.
#[derive(Debug, Clone)]
pub struct DataSharedRead {
    region: Rc<SharedRegion>,
}

impl DataSharedRead {
    pub fn attach(shm_id: i32) -> ShmResult<Self> {
        Ok(Self {
            region: Rc::new(SharedRegion::attach(shm_id)?),
        })
    }

    pub fn shm_id(&self) -> i32 {
        self.region.shm_id()
    }

    pub fn nseg(&self) -> usize {
        self.region.nseg()
    }

    /// View of one segment, used as a read channel.
    pub fn channel(&self, segment: usize) -> ShmResult<SharedChannelRead> {
        if segment >= self.region.nseg() {
            return Err(ShmError::SegmentOutOfRange {
                segment,
                nseg: self.region.nseg(),
            });
        }
        Ok(SharedChannelRead {
            region: Rc::clone(&self.region),
            segment,
        })
    }

    pub fn confirm_client(&self, segment: usize, client: i32) -> ShmResult<()> {
        self.region.confirm_client(segment, client)
    }

    pub fn remove_client(&self, segment: usize, client: i32) -> ShmResult<()> {
        self.region.remove_client(segment, client)
    }
}

/// One segment of an attached region. Progress comes from the writer's
/// `bytes_so_far`, so no data flows through the socket.
#[derive(Debug, Clone)]
pub struct SharedChannelRead {
    region: Rc<SharedRegion>,
    segment: usize,
}

impl SharedChannelRead {
    pub fn segment(&self) -> usize {
        self.segment
    }

    pub fn size(&self) -> ShmResult<usize> {
        Ok(self.region.arena().segment(self.segment)?.size)
    }

    pub fn bytes_so_far(&self) -> ShmResult<usize> {
        Ok(self.region.arena().segment(self.segment)?.bytes_so_far)
    }

    pub fn rest_size(&self) -> ShmResult<usize> {
        Ok(self.region.arena().segment(self.segment)?.rest_size())
    }

    /// Copy of the bytes produced so far.
    pub fn data(&self) -> ShmResult<Vec<u8>> {
        let record = self.region.arena().segment(self.segment)?;
        let len = record.bytes_so_far.min(record.size);
        self.region.arena().copy_out(record.offset, len)
    }

    pub fn remove_active_client(&self, client: i32) -> ShmResult<()> {
        self.region.remove_client(self.segment, client)
    }
}
