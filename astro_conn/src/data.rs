//! Bulk data channels.
//!
//! A transfer announces a number of channels (one per CCD readout channel,
//! for instance). Socket channels receive their bytes inline after `D`
//! chunk headers; shared channels only follow the writer's progress in a
//! shared memory segment.

use crate::error::DataError;
use astro_shared_memory::{DataSharedRead, DataSharedWrite, SharedChannelRead};
use std::io::{self, Read};

/// Largest single read taken straight from the socket into a channel.
const READ_SCRATCH: usize = 16 * 1024;

/// Sum of channel sizes, `None` on overflow.
pub fn total_size(sizes: &[usize]) -> Option<usize> {
    sizes.iter().try_fold(0usize, |acc, &size| acc.checked_add(size))
}

// ─── Socket read ────────────────────────────────────────────────────

/// Receiving side of one socket channel.
///
/// `remaining` counts bytes still owed for the whole channel, `chunk` the
/// bytes owed for the current `D` chunk. Both shrink together with every
/// copy. The buffer grows with the bytes that actually arrive, never
/// with the announced size.
#[derive(Debug, Clone)]
pub struct DataRead {
    data_type: i32,
    remaining: usize,
    chunk: usize,
    buf: Vec<u8>,
}

impl DataRead {
    pub fn new(size: usize, data_type: i32) -> Self {
        Self {
            data_type,
            remaining: size,
            chunk: 0,
            buf: Vec::new(),
        }
    }

    pub fn data_type(&self) -> i32 {
        self.data_type
    }

    /// Start a chunk of `chunk` bytes.
    pub fn read_data_size(&mut self, chunk: usize) -> Result<(), DataError> {
        if chunk > self.remaining {
            return Err(DataError::ChunkTooLarge {
                chunk,
                remaining: self.remaining,
            });
        }
        self.chunk = chunk;
        Ok(())
    }

    fn accept(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        self.chunk -= data.len();
        self.remaining -= data.len();
    }

    /// Copy at most the current chunk from `data`; returns bytes taken.
    pub fn add_data(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.chunk);
        self.accept(&data[..n]);
        n
    }

    /// Read at most the current chunk straight from `src`, in steps of at
    /// most [`READ_SCRATCH`] bytes.
    pub fn get_data(&mut self, src: &mut impl Read) -> io::Result<usize> {
        if self.chunk == 0 {
            return Ok(0);
        }
        let mut tmp = [0u8; READ_SCRATCH];
        let want = self.chunk.min(READ_SCRATCH);
        let n = src.read(&mut tmp[..want])?;
        self.accept(&tmp[..n]);
        Ok(n)
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk
    }

    pub fn rest_size(&self) -> usize {
        self.remaining
    }

    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }
}

// ─── Read channels ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum ReadChannel {
    Socket(DataRead),
    Shared(SharedChannelRead),
}

impl ReadChannel {
    pub fn rest_size(&self) -> Result<usize, DataError> {
        match self {
            ReadChannel::Socket(read) => Ok(read.rest_size()),
            ReadChannel::Shared(shared) => Ok(shared.rest_size()?),
        }
    }

    /// Bytes received so far.
    pub fn data(&self) -> Result<Vec<u8>, DataError> {
        match self {
            ReadChannel::Socket(read) => Ok(read.data().to_vec()),
            ReadChannel::Shared(shared) => Ok(shared.data()?),
        }
    }
}

/// Channels of one incoming transfer.
#[derive(Debug, Clone, Default)]
pub struct DataChannels {
    data_type: i32,
    channels: Vec<ReadChannel>,
}

impl DataChannels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Socket channels from a `C` header.
    pub fn init_from_connection(&mut self, data_type: i32, sizes: &[usize]) {
        self.data_type = data_type;
        self.channels = sizes
            .iter()
            .map(|&size| ReadChannel::Socket(DataRead::new(size, data_type)))
            .collect();
    }

    /// Shared channels from an `I` header.
    pub fn init_shared_from_connection(
        &mut self,
        reader: &DataSharedRead,
        segments: &[usize],
    ) -> Result<(), DataError> {
        let channels = segments
            .iter()
            .map(|&seg| reader.channel(seg).map(ReadChannel::Shared))
            .collect::<Result<Vec<_>, _>>()?;
        self.data_type = 0;
        self.channels = channels;
        Ok(())
    }

    pub fn data_type(&self) -> i32 {
        self.data_type
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn get(&self, chan: usize) -> Option<&ReadChannel> {
        self.channels.get(chan)
    }

    fn socket(&mut self, chan: usize) -> Result<&mut DataRead, DataError> {
        match self.channels.get_mut(chan) {
            Some(ReadChannel::Socket(read)) => Ok(read),
            Some(ReadChannel::Shared(_)) => Err(DataError::NotSocket { chan }),
            None => Err(DataError::NoChannel { chan }),
        }
    }

    pub fn read_data_size(&mut self, chan: usize, chunk: usize) -> Result<(), DataError> {
        self.socket(chan)?.read_data_size(chunk)
    }

    pub fn add_data(&mut self, chan: usize, data: &[u8]) -> Result<usize, DataError> {
        Ok(self.socket(chan)?.add_data(data))
    }

    pub fn get_data(&mut self, chan: usize, src: &mut impl Read) -> Result<usize, DataError> {
        Ok(self.socket(chan)?.get_data(src)?)
    }

    pub fn chunk_size(&self, chan: usize) -> Result<usize, DataError> {
        match self.channels.get(chan) {
            Some(ReadChannel::Socket(read)) => Ok(read.chunk_size()),
            Some(ReadChannel::Shared(_)) => Ok(0),
            None => Err(DataError::NoChannel { chan }),
        }
    }

    /// Bytes still owed over all channels.
    pub fn rest_size(&self) -> Result<usize, DataError> {
        self.channels
            .iter()
            .try_fold(0usize, |acc, ch| {
                acc.checked_add(ch.rest_size()?).ok_or(DataError::SizeOverflow)
            })
    }
}

// ─── Write channels ─────────────────────────────────────────────────

/// Sending side of socket channels: bytes still to send per channel.
/// The total is checked once at creation and only shrinks afterwards.
#[derive(Debug, Clone, Default)]
pub struct DataWrite {
    sizes: Vec<usize>,
}

impl DataWrite {
    pub fn new(sizes: &[usize]) -> Result<Self, DataError> {
        total_size(sizes).ok_or(DataError::SizeOverflow)?;
        Ok(Self {
            sizes: sizes.to_vec(),
        })
    }

    pub fn channel_size(&self, chan: usize) -> Result<usize, DataError> {
        self.sizes
            .get(chan)
            .copied()
            .ok_or(DataError::NoChannel { chan })
    }

    pub fn data_written(&mut self, chan: usize, size: usize) -> Result<(), DataError> {
        let rest = self
            .sizes
            .get_mut(chan)
            .ok_or(DataError::NoChannel { chan })?;
        if size > *rest {
            return Err(DataError::ChunkTooLarge {
                chunk: size,
                remaining: *rest,
            });
        }
        *rest -= size;
        Ok(())
    }

    pub fn data_size(&self) -> usize {
        self.sizes.iter().fold(0, |acc, &size| acc.saturating_add(size))
    }
}

#[derive(Debug, Clone)]
pub enum WriteChannel {
    Socket(DataWrite),
    Shared(DataSharedWrite),
}

impl WriteChannel {
    pub fn data_size(&self) -> Result<usize, DataError> {
        match self {
            WriteChannel::Socket(write) => Ok(write.data_size()),
            WriteChannel::Shared(shared) => Ok(shared.data_size()?),
        }
    }
}
