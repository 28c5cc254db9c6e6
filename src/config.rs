use crate::error::{MmuError, MmuResult};
use crate::utils::{PAGE_SHIFT, is_aligned};
use std::time::Duration;

// ===============================================================================================
// Card Memory Layout
// ===============================================================================================

/// Where the two card chunk pools live in the card's physical address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardLayout {
    /// Physical offset of the first regular chunk.
    pub regular_offset: u64,
    /// Number of regular (4 KiB) chunks.
    pub regular_chunks: usize,
    /// Physical offset of the first huge chunk.
    pub huge_offset: u64,
    /// Number of huge chunks.
    pub huge_chunks: usize,
}

impl CardLayout {
    pub const MEM_START: u64 = 256 * 1024 * 1024;
    pub const N_SMALL_CHUNKS: usize = 256 * 1024 - (Self::MEM_START as usize >> 12);
    pub const MEM_SEP: u64 = ((Self::MEM_START >> 12) + Self::N_SMALL_CHUNKS as u64) << 12;
    pub const N_HUGE_CHUNKS: usize = 1024;

    #[must_use]
    pub const fn new() -> Self {
        Self {
            regular_offset: Self::MEM_START,
            regular_chunks: Self::N_SMALL_CHUNKS,
            huge_offset: Self::MEM_SEP,
            huge_chunks: Self::N_HUGE_CHUNKS,
        }
    }

    #[must_use]
    pub const fn regular(mut self, offset: u64, chunks: usize) -> Self {
        self.regular_offset = offset;
        self.regular_chunks = chunks;
        self
    }

    #[must_use]
    pub const fn huge(mut self, offset: u64, chunks: usize) -> Self {
        self.huge_offset = offset;
        self.huge_chunks = chunks;
        self
    }

    /// Checks that each pool starts on a page of its own size. `huge_shift` is the
    /// page shift of the large TLB.
    ///
    /// # Errors
    /// Returns [`MmuError::InvalidConfig`] for a misaligned pool offset.
    pub fn validate(&self, huge_shift: u32) -> MmuResult<()> {
        if !is_aligned(self.regular_offset, PAGE_SHIFT) {
            return Err(MmuError::InvalidConfig(format!(
                "regular card pool at 0x{:x} is not {}-bit aligned",
                self.regular_offset, PAGE_SHIFT
            )));
        }
        if !is_aligned(self.huge_offset, huge_shift) {
            return Err(MmuError::InvalidConfig(format!(
                "huge card pool at 0x{:x} is not {huge_shift}-bit aligned",
                self.huge_offset
            )));
        }
        Ok(())
    }
}

impl Default for CardLayout {
    fn default() -> Self {
        Self::new()
    }
}

// ===============================================================================================
// MMU Tunables
// ===============================================================================================

/// Runtime tunables for the fault path. Built with chained setters:
///
/// ```
/// use std::time::Duration;
/// use vfpga_mmu::config::MmuConfig;
///
/// let cfg = MmuConfig::new()
///     .dma_threshold(8)
///     .completion_timeout(Duration::from_millis(100));
/// assert!(cfg.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmuConfig {
    /// Maximum DMA commands in flight before the engine starts polling.
    pub dma_threshold: u32,
    pub dma_sleep_min: Duration,
    pub dma_sleep_max: Duration,
    /// Regular pages moved by one DMA command of a huge buffer.
    pub dma_group_pages: usize,
    /// Cap on TLB entries written by a single map call.
    pub max_map_entries: usize,
    /// Upper bound on any wait for a hardware completion.
    pub completion_timeout: Duration,
    pub card: CardLayout,
}

impl MmuConfig {
    pub const DMA_THRSH: u32 = 32;
    pub const DMA_MIN_SLEEP_CMD: Duration = Duration::from_micros(10);
    pub const DMA_MAX_SLEEP_CMD: Duration = Duration::from_micros(50);
    pub const MAX_SINGLE_DMA_SYNC: usize = 4;
    pub const MAX_N_MAP_PAGES: usize = 256;
    pub const COMPLETION_TIMEOUT: Duration = Duration::from_secs(2);

    #[must_use]
    pub const fn new() -> Self {
        Self {
            dma_threshold: Self::DMA_THRSH,
            dma_sleep_min: Self::DMA_MIN_SLEEP_CMD,
            dma_sleep_max: Self::DMA_MAX_SLEEP_CMD,
            dma_group_pages: Self::MAX_SINGLE_DMA_SYNC,
            max_map_entries: Self::MAX_N_MAP_PAGES,
            completion_timeout: Self::COMPLETION_TIMEOUT,
            card: CardLayout::new(),
        }
    }

    #[must_use]
    pub const fn dma_threshold(mut self, threshold: u32) -> Self {
        self.dma_threshold = threshold;
        self
    }

    #[must_use]
    pub const fn dma_sleep(mut self, min: Duration, max: Duration) -> Self {
        self.dma_sleep_min = min;
        self.dma_sleep_max = max;
        self
    }

    #[must_use]
    pub const fn dma_group_pages(mut self, pages: usize) -> Self {
        self.dma_group_pages = pages;
        self
    }

    #[must_use]
    pub const fn max_map_entries(mut self, entries: usize) -> Self {
        self.max_map_entries = entries;
        self
    }

    #[must_use]
    pub const fn completion_timeout(mut self, timeout: Duration) -> Self {
        self.completion_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn card(mut self, layout: CardLayout) -> Self {
        self.card = layout;
        self
    }

    /// Rejects settings the fault path cannot make progress with.
    ///
    /// # Errors
    /// Returns [`MmuError::InvalidConfig`] naming the offending field.
    pub fn validate(&self) -> MmuResult<()> {
        if self.dma_threshold == 0 {
            return Err(MmuError::InvalidConfig("dma_threshold must be non-zero".into()));
        }
        if self.dma_group_pages == 0 {
            return Err(MmuError::InvalidConfig("dma_group_pages must be non-zero".into()));
        }
        if self.max_map_entries == 0 {
            return Err(MmuError::InvalidConfig("max_map_entries must be non-zero".into()));
        }
        if self.dma_sleep_min > self.dma_sleep_max {
            return Err(MmuError::InvalidConfig(format!(
                "dma sleep range is inverted: {:?} > {:?}",
                self.dma_sleep_min, self.dma_sleep_max
            )));
        }
        Ok(())
    }
}

impl Default for MmuConfig {
    fn default() -> Self {
        Self::new()
    }
}
