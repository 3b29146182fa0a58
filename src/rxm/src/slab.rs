//! Fixed-capacity pool of equally sized chunks backed by one anonymous
//! mapping.
//!
//! Chunks never move, so a chunk's index recovers it from any pointer into
//! it. When the transport needs local registration the whole mapping is
//! registered once at construction and every chunk shares the descriptor.
use std::io;

use memmap2::MmapMut;
use thiserror::Error;
use tracing::debug;

use rxm_api::MemDesc;

use crate::freestack::FreeStack;
use crate::transport::{MemoryRegion, MsgTransport, RawBuf};

/// Chunks are aligned to this boundary.
pub const CHUNK_ALIGN: usize = 64;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Slab pool exhausted")]
    Exhausted,
    #[error("Invalid slab layout: {count} chunks of {size} bytes")]
    InvalidLayout { count: usize, size: usize },
    #[error("Failed to map slab memory: {0}")]
    Mmap(io::Error),
    #[error("Failed to register slab memory: {0}")]
    Register(io::Error),
}

/// Stable index of a chunk within its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId(pub u32);

pub struct SlabPool {
    // Dropped before `mmap` so the region is deregistered while still mapped.
    mr: Option<Box<dyn MemoryRegion>>,
    mmap: MmapMut,
    base: *mut u8,
    chunk_size: usize,
    count: usize,
    chunks: FreeStack<()>,
}

// `base` points into `mmap`, which the pool owns.
unsafe impl Send for SlabPool {}
unsafe impl Sync for SlabPool {}

impl SlabPool {
    /// Maps `count` chunks of at least `size` bytes. If `transport` is given
    /// the mapping is registered with it.
    pub fn new(count: usize, size: usize, transport: Option<&dyn MsgTransport>) -> Result<Self, Error> {
        if count == 0 || size == 0 || count > u32::MAX as usize {
            return Err(Error::InvalidLayout { count, size });
        }
        let chunk_size = (size + CHUNK_ALIGN - 1) / CHUNK_ALIGN * CHUNK_ALIGN;
        let total = chunk_size
            .checked_mul(count)
            .ok_or(Error::InvalidLayout { count, size })?;
        let mut mmap = MmapMut::map_anon(total).map_err(Error::Mmap)?;
        let base = mmap.as_mut_ptr();

        let mr = match transport {
            Some(t) => {
                let region = RawBuf { ptr: base, len: total };
                // SAFETY: the region lives as long as the pool and `mr` is
                // dropped first.
                Some(unsafe { t.register(region) }.map_err(Error::Register)?)
            }
            None => None,
        };

        debug!(count, chunk_size, registered = mr.is_some(), "slab pool created");

        Ok(SlabPool {
            mr,
            mmap,
            base,
            chunk_size,
            count,
            chunks: FreeStack::new(count),
        })
    }

    /// Takes a free chunk. Never blocks.
    #[inline]
    pub fn acquire(&mut self) -> Result<ChunkId, Error> {
        self.chunks.pop(()).map(ChunkId).ok_or(Error::Exhausted)
    }

    /// # Panics
    ///
    /// Panics if the chunk is not currently acquired.
    #[inline]
    pub fn release(&mut self, id: ChunkId) {
        assert!(
            self.chunks.is_used(id.0),
            "releasing chunk {} that was not acquired",
            id.0
        );
        self.chunks.push(id.0);
    }

    #[inline]
    pub fn is_acquired(&self, id: ChunkId) -> bool {
        self.chunks.is_used(id.0)
    }

    #[inline]
    fn offset(&self, id: ChunkId) -> usize {
        assert!((id.0 as usize) < self.count, "chunk {} out of range", id.0);
        id.0 as usize * self.chunk_size
    }

    #[inline]
    pub fn chunk(&self, id: ChunkId) -> &[u8] {
        let off = self.offset(id);
        &self.mmap[off..off + self.chunk_size]
    }

    #[inline]
    pub fn chunk_mut(&mut self, id: ChunkId) -> &mut [u8] {
        let off = self.offset(id);
        let size = self.chunk_size;
        &mut self.mmap[off..off + size]
    }

    /// A raw view of the first `len` bytes of a chunk, for handing to the
    /// transport.
    #[inline]
    pub fn raw_chunk(&self, id: ChunkId, len: usize) -> RawBuf {
        let off = self.offset(id);
        assert!(len <= self.chunk_size);
        RawBuf {
            // SAFETY: `off` is within the mapping.
            ptr: unsafe { self.base.add(off) },
            len,
        }
    }

    /// Recovers the chunk a pointer falls into.
    pub fn id_of(&self, ptr: *const u8) -> Option<ChunkId> {
        let start = self.base as usize;
        let addr = ptr as usize;
        if addr < start || addr >= start + self.count * self.chunk_size {
            return None;
        }
        Some(ChunkId(((addr - start) / self.chunk_size) as u32))
    }

    /// The registration descriptor shared by every chunk, if registered.
    #[inline]
    pub fn desc(&self) -> Option<MemDesc> {
        self.mr.as_ref().map(|mr| mr.desc())
    }

    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.chunks.available()
    }
}
