//! Error types for shared memory operations

use thiserror::Error;

/// Errors that can occur during shared memory operations
#[derive(Error, Debug)]
pub enum ShmError {
    /// A shmget/shmat/shmctl/shmdt call failed
    #[error("Shared memory call {op} failed: {source}")]
    SharedMemory {
        /// Failing system call
        op: &'static str,
        /// OS error reported by the call
        source: std::io::Error,
    },

    /// A semget/semop/semctl call failed
    #[error("Semaphore call {op} on segment {segment} failed: {source}")]
    Semaphore {
        /// Failing system call
        op: &'static str,
        /// Segment (semaphore index) involved
        segment: usize,
        /// OS error reported by the call
        source: std::io::Error,
    },

    /// Requested region geometry is unusable
    #[error("Invalid region geometry: {segments} segments of {segment_size} bytes")]
    InvalidGeometry {
        /// Number of segments requested
        segments: usize,
        /// Size of one segment
        segment_size: usize,
    },

    /// Attached region does not hold a consistent header
    #[error("Corrupted region layout: {reason}")]
    CorruptedLayout {
        /// What failed validation
        reason: String,
    },

    /// Segment index outside the region
    #[error("Segment {segment} out of range (region has {nseg} segments)")]
    SegmentOutOfRange {
        /// Requested segment
        segment: usize,
        /// Number of segments in the region
        nseg: usize,
    },

    /// Every segment is held by at least one reader
    #[error("No free shared segment for channel {chan}")]
    NoFreeSegment {
        /// Channel the segment was requested for
        chan: usize,
    },

    /// Client id is not registered on the segment
    #[error("Client {client} not registered on segment {segment}")]
    ClientNotFound {
        /// Segment searched
        segment: usize,
        /// Client id looked for
        client: i32,
    },

    /// Client ids must be positive; zero marks an empty slot
    #[error("Invalid client id {client}")]
    InvalidClient {
        /// Offending id
        client: i32,
    },

    /// Channel has no segment assigned
    #[error("Channel {chan} has no shared segment")]
    UnknownChannel {
        /// Channel number
        chan: usize,
    },

    /// Write would pass the end of the segment
    #[error("Write of {len} bytes exceeds segment {segment} capacity ({remaining} bytes left)")]
    SegmentOverflow {
        /// Segment written
        segment: usize,
        /// Bytes requested
        len: usize,
        /// Bytes still free
        remaining: usize,
    },
}

impl ShmError {
    pub(crate) fn shm(op: &'static str) -> Self {
        ShmError::SharedMemory {
            op,
            source: std::io::Error::last_os_error(),
        }
    }

    pub(crate) fn sem(op: &'static str, segment: usize) -> Self {
        ShmError::Semaphore {
            op,
            segment,
            source: std::io::Error::last_os_error(),
        }
    }
}

/// Result type for shared memory operations
pub type ShmResult<T> = Result<T, ShmError>;
