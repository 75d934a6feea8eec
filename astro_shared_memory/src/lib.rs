//! # Astro Shared Memory Data Transfer
//!
//! Moves large payloads (CCD readouts) between processes without copying
//! them through a socket. The writer allocates one SysV shared memory
//! region holding `nseg` equally sized data segments; each segment is
//! guarded by its own semaphore. The shared memory id and segment numbers
//! travel in-band over the normal control connection, readers attach and
//! follow the writer's progress through the segment records.
//!
//! ## Region Layout
//!
//! ```text
//! SharedDataHeader     { i32 nseg; i32 shared_sem }
//! SharedDataSegment[n] { i32 client_ids[10]; usize size; usize bytes_so_far; usize offset }
//! data buffers         n contiguous ranges at the recorded offsets
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use astro_shared_memory::{DataSharedRead, DataSharedWrite, ShmResult};
//!
//! fn transfer() -> ShmResult<()> {
//!     let mut writer = DataSharedWrite::create(2, 4096)?;
//!     let segment = writer.add_client(4096, 0, 17)?;
//!     writer.write_channel(0, b"pixels")?;
//!
//!     // normally done in the reader process after receiving the id
//!     let reader = DataSharedRead::attach(writer.shm_id())?;
//!     let channel = reader.channel(segment)?;
//!     assert_eq!(channel.data()?, b"pixels");
//!     channel.remove_active_client(17)?;
//!     Ok(())
//! }
//! ```
//!
//! Segment locks are short critical sections around the client slot
//! array; they are never held across network I/O.

pub mod error;
pub mod layout;
pub mod platform;
#[cfg(target_os = "linux")]
pub mod reader;
#[cfg(target_os = "linux")]
pub mod region;
#[cfg(target_os = "linux")]
pub mod writer;

pub use error::{ShmError, ShmResult};
pub use layout::{SharedDataHeader, SharedDataSegment};
#[cfg(target_os = "linux")]
pub use reader::{DataSharedRead, SharedChannelRead};
#[cfg(target_os = "linux")]
pub use region::{SegmentLock, SharedRegion};
#[cfg(target_os = "linux")]
pub use writer::DataSharedWrite;
