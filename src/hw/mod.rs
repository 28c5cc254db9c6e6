pub mod irq;
pub mod mmio;
pub mod regs;

pub use irq::{FaultRequest, IrqKind, IrqStatus, Notification};
pub use mmio::MmioShell;
pub use regs::ShellConfig;

use regs::{DMA_CTRL_START_LAST, DMA_CTRL_START_MIDDLE};

/// Which of the two TLBs an entry goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TlbOrder {
    Regular,
    Huge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DmaDirection {
    /// Host to card.
    Offload,
    /// Card to host.
    Sync,
}

/// One DMA transfer between a host page and a card page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaCommand {
    pub host_addr: u64,
    pub card_addr: u64,
    pub len: u64,
    /// The hardware starts the batch on the command flagged last.
    pub last: bool,
}

impl DmaCommand {
    #[must_use]
    pub const fn ctrl_word(&self) -> u64 {
        (self.len << 32)
            | if self.last {
                DMA_CTRL_START_LAST
            } else {
                DMA_CTRL_START_MIDDLE
            }
    }
}

/// One TLB invalidation request. `vpn` and `n_pages` are in regular-page units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Invalidation {
    pub vpn: u64,
    pub n_pages: u64,
    pub hpid: u32,
    pub last: bool,
}

/// The register interface of one vFPGA region.
///
/// Implementations must tolerate being called from the interrupt path
/// ([`read_irq`](Self::read_irq), [`clear_irq`](Self::clear_irq)) concurrently with the
/// region worker.
pub trait ShellRegisters: Send + Sync {
    /// Writes a two-word entry into the TLB write port of `order`.
    fn write_tlb(&self, order: TlbOrder, entry: [u64; 2]);

    fn invalidate(&self, inv: &Invalidation);

    fn dma_issue(&self, dir: DmaDirection, cmd: &DmaCommand);

    /// Commands of `dir` issued but not yet processed by the engine.
    fn dma_outstanding(&self, dir: DmaDirection) -> u32;

    /// Acknowledges a served page fault so the vFPGA MMU retries the access.
    fn restart_mmu(&self, write: bool, ctid: u32);

    /// Tells the vFPGA MMU the page fault could not be served.
    fn drop_fault(&self, write: bool, ctid: u32);

    /// Toggles the TLB lock held around explicit user mappings.
    fn change_tlb_lock(&self);

    fn read_irq(&self) -> IrqStatus;

    fn clear_irq(&self);
}
