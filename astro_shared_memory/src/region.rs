//! Attached shared data region and its per-segment semaphore locks.

use crate::error::{ShmError, ShmResult};
use crate::layout::{
    SharedArena, SharedDataHeader, SharedDataSegment, data_offset, region_size,
};
use crate::platform::sysv;
use astro::consts::MAX_SHARED_CLIENTS;
use tracing::{debug, error, warn};

/// One SysV shared memory attachment plus the semaphore set guarding its
/// segments. The creating process owns the semaphores and removes them
/// when the region is dropped; every process detaches on drop.
#[derive(Debug)]
pub struct SharedRegion {
    shm_id: i32,
    arena: SharedArena,
    nseg: usize,
    owner: bool,
}

impl SharedRegion {
    /// Allocate a private region of `nseg` segments of `segsize` bytes.
    ///
    /// The id is marked for removal right after attaching, so the kernel
    /// reclaims it once the last process detaches.
    pub fn create(nseg: usize, segsize: usize) -> ShmResult<Self> {
        let geometry = ShmError::InvalidGeometry {
            segments: nseg,
            segment_size: segsize,
        };
        if nseg == 0 || segsize == 0 || nseg > i32::MAX as usize {
            return Err(geometry);
        }
        let size = region_size(nseg, segsize).ok_or(geometry)?;

        let shm_id = sysv::shm_create(size)?;
        let base = match sysv::shm_attach(shm_id, false) {
            Ok(base) => base,
            Err(e) => {
                let _ = sysv::shm_mark_removed(shm_id);
                return Err(e);
            }
        };
        let prepared = sysv::shm_size(shm_id)
            .and_then(|len| sysv::shm_mark_removed(shm_id).map(|_| len))
            .and_then(|len| sysv::sem_create(nseg).map(|sem| (len, sem)));
        let (len, sem_id) = match prepared {
            Ok(v) => v,
            Err(e) => {
                error!("Cannot prepare shared region {shm_id}: {e}");
                let _ = sysv::shm_detach(base);
                return Err(e);
            }
        };

        let arena = match unsafe { SharedArena::new(base, len) } {
            Ok(arena) => arena,
            Err(e) => {
                let _ = sysv::sem_remove(sem_id);
                let _ = sysv::shm_detach(base);
                return Err(e);
            }
        };
        let region = Self {
            shm_id,
            arena,
            nseg,
            owner: true,
        };
        // From here on Drop releases the semaphores and the mapping.
        region.arena.write_header(SharedDataHeader {
            nseg: nseg as i32,
            shared_sem: sem_id,
        });
        for i in 0..nseg {
            sysv::sem_set(sem_id, i, 1)?;
            region.arena.write_segment(
                i,
                &SharedDataSegment {
                    client_ids: [0; MAX_SHARED_CLIENTS],
                    size: segsize,
                    bytes_so_far: 0,
                    offset: data_offset(nseg, segsize, i),
                },
            )?;
        }
        debug!("Created shared region {shm_id}: {nseg} x {segsize} bytes, semaphores {sem_id}");
        Ok(region)
    }

    /// Map a region announced by a peer.
    pub fn attach(shm_id: i32) -> ShmResult<Self> {
        let base = sysv::shm_attach(shm_id, false)?;
        let arena = sysv::shm_size(shm_id).and_then(|len| unsafe { SharedArena::new(base, len) });
        let arena = match arena {
            Ok(arena) => arena,
            Err(e) => {
                error!("Cannot attach to shared memory {shm_id}: {e}");
                let _ = sysv::shm_detach(base);
                return Err(e);
            }
        };
        let nseg = match arena.nseg() {
            Ok(nseg) => nseg,
            Err(e) => {
                let _ = sysv::shm_detach(base);
                return Err(e);
            }
        };
        debug!("Attached shared region {shm_id} with {nseg} segments");
        Ok(Self {
            shm_id,
            arena,
            nseg,
            owner: false,
        })
    }

    pub fn shm_id(&self) -> i32 {
        self.shm_id
    }

    pub fn nseg(&self) -> usize {
        self.nseg
    }

    pub fn arena(&self) -> &SharedArena {
        &self.arena
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Take the semaphore of `segment`; released when the guard drops.
    pub fn lock(&self, segment: usize) -> ShmResult<SegmentLock<'_>> {
        if segment >= self.nseg {
            return Err(ShmError::SegmentOutOfRange {
                segment,
                nseg: self.nseg,
            });
        }
        let sem_id = self.arena.header().shared_sem;
        sysv::sem_op(sem_id, segment, -1)?;
        Ok(SegmentLock {
            sem_id,
            segment,
            _region: self,
        })
    }

    /// Locked read-modify-write of one segment record. The whole record,
    /// client slots included, is written back, so every writer of a record
    /// goes through the segment lock.
    pub fn update_segment<R>(
        &self,
        segment: usize,
        f: impl FnOnce(&mut SharedDataSegment) -> R,
    ) -> ShmResult<R> {
        let _lock = self.lock(segment)?;
        self.arena.update_segment(segment, f)
    }

    /// Clear `client` from the reader slots of `segment`.
    pub fn remove_client(&self, segment: usize, client: i32) -> ShmResult<()> {
        if client <= 0 {
            return Err(ShmError::InvalidClient { client });
        }
        let _lock = self.lock(segment)?;
        let mut record = self.arena.segment(segment)?;
        match record.client_ids.iter_mut().find(|id| **id == client) {
            Some(slot) => {
                *slot = 0;
                self.arena.write_segment(segment, &record)
            }
            None => {
                error!("Cannot find client {client} to remove from segment {segment}");
                Err(ShmError::ClientNotFound { segment, client })
            }
        }
    }

    /// Check that `client` holds a slot on `segment`.
    pub fn confirm_client(&self, segment: usize, client: i32) -> ShmResult<()> {
        let _lock = self.lock(segment)?;
        if self.arena.segment(segment)?.has_client(client) {
            return Ok(());
        }
        error!("Client {client} holds no slot on segment {segment}");
        Err(ShmError::ClientNotFound { segment, client })
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if self.owner {
            let sem_id = self.arena.header().shared_sem;
            if let Err(e) = sysv::sem_remove(sem_id) {
                warn!("Cannot remove semaphores of region {}: {e}", self.shm_id);
            }
        }
        if let Err(e) = sysv::shm_detach(self.arena.base()) {
            warn!("Cannot detach region {}: {e}", self.shm_id);
        }
    }
}

/// Held semaphore of one segment.
#[derive(Debug)]
pub struct SegmentLock<'a> {
    sem_id: i32,
    segment: usize,
    _region: &'a SharedRegion,
}

impl SegmentLock<'_> {
    pub fn segment(&self) -> usize {
        self.segment
    }
}

impl Drop for SegmentLock<'_> {
    fn drop(&mut self) {
        if let Err(e) = sysv::sem_op(self.sem_id, self.segment, 1) {
            error!("Cannot unlock segment {}: {e}", self.segment);
        }
    }
}
