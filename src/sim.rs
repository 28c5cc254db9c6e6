//! Software models of the shell registers and of host pinning.
//!
//! [`SimShell`] records every register operation and, when a batch is flagged last,
//! raises the matching completion the way the interrupt path would. [`SimPinner`]
//! hands out deterministic physical addresses.

use crate::error::MmuResult;
use crate::hw::{
    DmaCommand, DmaDirection, Invalidation, IrqStatus, ShellRegisters, TlbOrder,
};
use crate::mmu::pin::{HostPinner, PinnedPages};
use crate::signal::{Completion, RegionSignals};
use crate::utils::PAGE_SHIFT;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

/// One recorded register operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimOp {
    Tlb(TlbOrder, [u64; 2]),
    Invalidate(Invalidation),
    Dma(DmaDirection, DmaCommand),
    Restart { write: bool, ctid: u32 },
    Drop { write: bool, ctid: u32 },
    TlbLock,
    ClearIrq,
}

#[derive(Debug, Default)]
struct ShellState {
    ops: Vec<SimOp>,
    outstanding: [u32; 2],
    drain: u32,
    stalled: bool,
    /// Thread issuing the open batch of each direction.
    batch: [Option<ThreadId>; 2],
    interleaved: u32,
    irq: IrqStatus,
}

#[derive(Debug)]
pub struct SimShell {
    state: Mutex<ShellState>,
    signals: Mutex<Option<Arc<RegionSignals>>>,
    auto_complete: AtomicBool,
    polls: AtomicU64,
}

impl Default for SimShell {
    fn default() -> Self {
        Self::new()
    }
}

const fn dir_index(dir: DmaDirection) -> usize {
    match dir {
        DmaDirection::Offload => 0,
        DmaDirection::Sync => 1,
    }
}

impl SimShell {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ShellState::default()),
            signals: Mutex::new(None),
            auto_complete: AtomicBool::new(true),
            polls: AtomicU64::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, ShellState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Completions are raised on these signals.
    pub fn attach(&self, signals: &Arc<RegionSignals>) {
        *self.signals.lock().unwrap_or_else(PoisonError::into_inner) = Some(signals.clone());
    }

    /// With auto-completion off the model never acknowledges a batch.
    pub fn set_auto_complete(&self, on: bool) {
        self.auto_complete.store(on, Ordering::Relaxed);
    }

    /// With a non-zero drain, issued DMA commands stay outstanding and each poll of
    /// the outstanding count retires `drain` of them.
    pub fn set_dma_drain(&self, drain: u32) {
        self.state().drain = drain;
    }

    /// A stalled engine keeps every issued command outstanding.
    pub fn stall_dma(&self, on: bool) {
        self.state().stalled = on;
    }

    /// DMA commands issued while another thread's batch of the same direction
    /// was still open.
    #[must_use]
    pub fn interleaved_batches(&self) -> u32 {
        self.state().interleaved
    }

    #[must_use]
    pub fn dma_polls(&self) -> u64 {
        self.polls.load(Ordering::Relaxed)
    }

    /// Latches the status a subsequent [`read_irq`](ShellRegisters::read_irq) returns.
    pub fn set_irq(&self, status: IrqStatus) {
        self.state().irq = status;
    }

    #[must_use]
    pub fn ops(&self) -> Vec<SimOp> {
        self.state().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.state().ops.clear();
    }

    #[must_use]
    pub fn count(&self, pred: impl Fn(&SimOp) -> bool) -> usize {
        self.state().ops.iter().filter(|op| pred(op)).count()
    }

    fn record(&self, op: SimOp) {
        self.state().ops.push(op);
    }

    fn complete(&self, kind: Completion) {
        if !self.auto_complete.load(Ordering::Relaxed) {
            return;
        }
        if let Some(signals) = &*self.signals.lock().unwrap_or_else(PoisonError::into_inner) {
            signals.get(kind).raise();
        }
    }
}

impl ShellRegisters for SimShell {
    fn write_tlb(&self, order: TlbOrder, entry: [u64; 2]) {
        self.record(SimOp::Tlb(order, entry));
    }

    fn invalidate(&self, inv: &Invalidation) {
        self.record(SimOp::Invalidate(*inv));
        if inv.last {
            self.complete(Completion::Invalidate);
        }
    }

    fn dma_issue(&self, dir: DmaDirection, cmd: &DmaCommand) {
        {
            let mut st = self.state();
            let d = dir_index(dir);
            let me = thread::current().id();
            match st.batch[d] {
                Some(owner) if owner != me => st.interleaved += 1,
                _ => st.batch[d] = Some(me),
            }
            if cmd.last {
                st.batch[d] = None;
            }
            st.ops.push(SimOp::Dma(dir, *cmd));
            if st.drain > 0 {
                st.outstanding[d] += 1;
            }
        }
        if cmd.last {
            self.complete(match dir {
                DmaDirection::Offload => Completion::Offload,
                DmaDirection::Sync => Completion::Sync,
            });
        }
    }

    fn dma_outstanding(&self, dir: DmaDirection) -> u32 {
        self.polls.fetch_add(1, Ordering::Relaxed);
        let mut st = self.state();
        let drain = if st.stalled { 0 } else { st.drain };
        let n = &mut st.outstanding[dir_index(dir)];
        *n = n.saturating_sub(drain);
        *n
    }

    fn restart_mmu(&self, write: bool, ctid: u32) {
        self.record(SimOp::Restart { write, ctid });
    }

    fn drop_fault(&self, write: bool, ctid: u32) {
        self.record(SimOp::Drop { write, ctid });
    }

    fn change_tlb_lock(&self) {
        self.record(SimOp::TlbLock);
    }

    fn read_irq(&self) -> IrqStatus {
        self.state().irq
    }

    fn clear_irq(&self) {
        let mut st = self.state();
        st.irq = IrqStatus::default();
        st.ops.push(SimOp::ClearIrq);
    }
}

// ===============================================================================================
// Host Pinning Model
// ===============================================================================================

#[derive(Debug, Default)]
struct PinState {
    pinned: u64,
    dirty: u64,
    limit: Option<u64>,
    huge: Vec<Range<u64>>,
}

/// Host pinning with a synthetic physical layout.
///
/// Page `vpn` lives at `BASE + (vpn << 12)` in the contiguous layout. The default
/// layout swaps every pair of neighbouring pages, so no two consecutive pages are
/// physically adjacent.
#[derive(Debug)]
pub struct SimPinner {
    state: Mutex<PinState>,
    contiguous: bool,
    needs_explicit_sync: AtomicBool,
}

impl Default for SimPinner {
    fn default() -> Self {
        Self::new()
    }
}

impl SimPinner {
    pub const BASE: u64 = 0x1_0000_0000;

    #[must_use]
    pub fn new() -> Self {
        Self::with_layout(false)
    }

    #[must_use]
    pub fn contiguous() -> Self {
        Self::with_layout(true)
    }

    fn with_layout(contiguous: bool) -> Self {
        Self {
            state: Mutex::new(PinState::default()),
            contiguous,
            needs_explicit_sync: AtomicBool::new(false),
        }
    }

    fn state(&self) -> MutexGuard<'_, PinState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub const fn phys_of(&self, vpn: u64) -> u64 {
        let page = if self.contiguous { vpn } else { vpn ^ 1 };
        Self::BASE + (page << PAGE_SHIFT)
    }

    /// Marks a virtual address range as huge-page backed.
    pub fn add_huge_range(&self, range: Range<u64>) {
        self.state().huge.push(range);
    }

    /// Every later pin obtains at most `n` pages.
    pub fn limit_pins(&self, n: u64) {
        self.state().limit = Some(n);
    }

    pub fn set_needs_explicit_sync(&self, on: bool) {
        self.needs_explicit_sync.store(on, Ordering::Relaxed);
    }

    #[must_use]
    pub fn pinned_pages(&self) -> u64 {
        self.state().pinned
    }

    /// Pages released with the dirty flag set.
    #[must_use]
    pub fn dirty_pages(&self) -> u64 {
        self.state().dirty
    }
}

impl HostPinner for SimPinner {
    fn is_huge_backed(&self, _pid: u32, vaddr: u64) -> bool {
        self.state().huge.iter().any(|r| r.contains(&vaddr))
    }

    fn pin(&self, _pid: u32, vpn: u64, n_pages: u64) -> MmuResult<PinnedPages> {
        let mut st = self.state();
        let n = st.limit.map_or(n_pages, |l| l.min(n_pages));
        st.pinned += n;
        Ok(PinnedPages {
            phys: (vpn..vpn + n).map(|p| self.phys_of(p)).collect(),
            needs_explicit_sync: self.needs_explicit_sync.load(Ordering::Relaxed),
        })
    }

    fn unpin(&self, _pid: u32, _vpn: u64, phys: &[u64], dirty: bool) {
        let mut st = self.state();
        let n = phys.len() as u64;
        st.pinned = st.pinned.saturating_sub(n);
        if dirty {
            st.dirty += n;
        }
    }
}
