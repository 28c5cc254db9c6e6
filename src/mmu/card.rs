#![allow(clippy::cast_possible_truncation)]

use crate::config::CardLayout;
use crate::error::{MmuError, MmuResult};
use crate::mmu::geometry::TlbGeometries;
use std::sync::{Arc, Mutex};

/// The card allocator is a shell-wide resource, shared by every region worker.
pub type SharedCardAllocator = Arc<Mutex<CardAllocator>>;

/// One allocation unit of card memory. Chunks are created once and recycled.
#[derive(Debug, Default, Clone, Copy)]
pub struct CardChunk {
    pub id: u32,
    pub used: bool,
}

/// Fixed-capacity pool of equally sized chunks with a LIFO free stack.
#[derive(Debug)]
struct ChunkPool {
    chunks: Vec<CardChunk>,
    free: Vec<u32>,
    offset: u64,
    shift: u32,
}

impl ChunkPool {
    fn new(count: usize, offset: u64, shift: u32) -> Self {
        let chunks = (0..count as u32).map(|id| CardChunk { id, used: false }).collect();
        // Lowest ids are handed out first.
        let free = (0..count as u32).rev().collect();
        Self { chunks, free, offset, shift }
    }

    fn alloc(&mut self, n: usize) -> MmuResult<Vec<u64>> {
        if self.free.len() < n {
            return Err(MmuError::OutOfMemory {
                requested: n,
                available: self.free.len(),
            });
        }

        let ids = self.free.split_off(self.free.len() - n);
        let mut addrs = Vec::with_capacity(n);
        for id in ids.into_iter().rev() {
            let chunk = &mut self.chunks[id as usize];
            chunk.used = true;
            addrs.push((u64::from(chunk.id) << self.shift) + self.offset);
        }
        Ok(addrs)
    }

    fn chunk_id(&self, addr: u64) -> Option<usize> {
        let rel = addr.checked_sub(self.offset)?;
        if rel & ((1u64 << self.shift) - 1) != 0 {
            return None;
        }
        let id = usize::try_from(rel >> self.shift).ok()?;
        (id < self.chunks.len()).then_some(id)
    }

    /// Returns every chunk of `addrs` to the pool. Bad entries are skipped and the
    /// first one is reported once the rest of the batch has been released.
    fn free(&mut self, addrs: &[u64]) -> MmuResult<()> {
        let mut first_err = None;
        for &addr in addrs.iter().rev() {
            let Some(id) = self.chunk_id(addr) else {
                log::warn!("card free: 0x{addr:x} is outside the pool");
                first_err = first_err.or(Some(MmuError::InvalidCardAddress(addr)));
                continue;
            };
            let chunk = &mut self.chunks[id];
            if !chunk.used {
                log::warn!("card free: chunk {id} at 0x{addr:x} is already free");
                first_err = first_err.or(Some(MmuError::DoubleFree(addr)));
                continue;
            }
            chunk.used = false;
            self.free.push(chunk.id);
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Hands out card physical pages at regular and huge granularity.
#[derive(Debug)]
pub struct CardAllocator {
    regular: ChunkPool,
    huge: ChunkPool,
}

impl CardAllocator {
    #[must_use]
    pub fn new(layout: &CardLayout, geos: &TlbGeometries) -> Self {
        log::info!(
            "card memory: {} regular chunks @ 0x{:x}, {} huge chunks @ 0x{:x}",
            layout.regular_chunks,
            layout.regular_offset,
            layout.huge_chunks,
            layout.huge_offset
        );
        Self {
            regular: ChunkPool::new(
                layout.regular_chunks,
                layout.regular_offset,
                geos.small.page_shift,
            ),
            huge: ChunkPool::new(layout.huge_chunks, layout.huge_offset, geos.large.page_shift),
        }
    }

    #[must_use]
    pub fn shared(self) -> SharedCardAllocator {
        Arc::new(Mutex::new(self))
    }

    fn pool(&mut self, huge: bool) -> &mut ChunkPool {
        if huge { &mut self.huge } else { &mut self.regular }
    }

    /// Allocates `n` chunks of the requested granularity, or none at all.
    ///
    /// # Errors
    /// Returns [`MmuError::OutOfMemory`] if fewer than `n` chunks are free.
    pub fn alloc(&mut self, n: usize, huge: bool) -> MmuResult<Vec<u64>> {
        let addrs = self.pool(huge).alloc(n).inspect_err(|e| log::warn!("card alloc: {e}"))?;
        log::debug!(
            "card alloc: {n} {} chunks starting @ 0x{:x}",
            if huge { "huge" } else { "regular" },
            addrs.first().copied().unwrap_or_default()
        );
        Ok(addrs)
    }

    /// Releases chunks previously returned by [`alloc`](Self::alloc).
    ///
    /// # Errors
    /// Returns [`MmuError::DoubleFree`] or [`MmuError::InvalidCardAddress`] for the first
    /// bad address; all valid addresses in the batch are still released.
    pub fn free(&mut self, addrs: &[u64], huge: bool) -> MmuResult<()> {
        self.pool(huge).free(addrs)
    }

    #[must_use]
    pub fn free_count(&self, huge: bool) -> usize {
        if huge { self.huge.free.len() } else { self.regular.free.len() }
    }
}
