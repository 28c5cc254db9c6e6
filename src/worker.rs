use crate::error::{MmuError, MmuResult};
use crate::hw::{FaultRequest, IrqKind};
use crate::mmu::{AccessKind, FaultStatus, RegionMmu};
use std::sync::Arc;
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};

/// Serves one page fault and answers the vFPGA MMU: restart on success, drop on error.
///
/// # Errors
/// Returns the error the fault was dropped with.
pub fn serve_fault(mmu: &RegionMmu, req: &FaultRequest) -> MmuResult<FaultStatus> {
    let result = AccessKind::try_from(req.stream)
        .and_then(|access| mmu.handle_ctid_fault(req.vaddr, req.len, req.ctid, access));

    match &result {
        Ok(status) => {
            if *status == FaultStatus::NeedsExplicitSync {
                log::warn!(
                    "vFPGA {}: buffer @ 0x{:x} needs explicit sync",
                    mmu.id(),
                    req.vaddr
                );
            }
            mmu.regs().restart_mmu(req.write, req.ctid);
        }
        Err(e) => {
            log::error!(
                "vFPGA {}: dropping fault @ 0x{:x} len {} ctid {}: {e}",
                mmu.id(),
                req.vaddr,
                req.len,
                req.ctid
            );
            mmu.regs().drop_fault(req.write, req.ctid);
        }
    }
    result
}

/// A thread serving the page faults of one region in arrival order.
#[derive(Debug)]
pub struct FaultWorker {
    region: u32,
    tx: Option<Sender<FaultRequest>>,
    handle: Option<JoinHandle<()>>,
}

impl FaultWorker {
    /// # Errors
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn(mmu: Arc<RegionMmu>) -> MmuResult<Self> {
        let region = mmu.id();
        let (tx, rx) = mpsc::channel::<FaultRequest>();
        let handle = thread::Builder::new()
            .name(format!("vfpga{region}-pf"))
            .spawn(move || {
                for req in rx {
                    // The outcome has already been reported to the hardware.
                    let _ = serve_fault(&mmu, &req);
                }
                log::debug!("vFPGA {region}: fault worker exiting");
            })
            .map_err(MmuError::Io)?;

        Ok(Self {
            region,
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    #[must_use]
    pub const fn region(&self) -> u32 {
        self.region
    }

    /// Queues a fault. Returns `false` if the worker is gone.
    pub fn submit(&self, req: FaultRequest) -> bool {
        self.tx.as_ref().is_some_and(|tx| tx.send(req).is_ok())
    }
}

impl Drop for FaultWorker {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            log::error!("vFPGA {}: fault worker panicked", self.region);
        }
    }
}

/// Handles one interrupt of a region. Never blocks on the fault path: completions
/// wake their waiter and page faults are handed to `worker`.
pub fn handle_interrupt(mmu: &RegionMmu, worker: &FaultWorker) -> IrqKind {
    let regs = mmu.regs();
    let status = regs.read_irq();
    let kind = status.kind();

    match kind {
        IrqKind::OffloadDone => mmu.signals().offload.raise(),
        IrqKind::SyncDone => mmu.signals().sync.raise(),
        IrqKind::InvalidateDone => mmu.signals().invalidate.raise(),
        IrqKind::PageFault => {
            let req = status.fault();
            log::debug!(
                "vFPGA {}: page fault @ 0x{:x} len {} ctid {} stream {} wr {}",
                mmu.id(),
                req.vaddr,
                req.len,
                req.ctid,
                req.stream,
                req.write
            );
            if !worker.submit(req) {
                log::error!("vFPGA {}: could not queue page fault", mmu.id());
                regs.drop_fault(req.write, req.ctid);
            }
        }
        IrqKind::Notify => {
            let n = status.notification();
            log::info!(
                "vFPGA {}: notification {} for ctid {}",
                mmu.id(),
                n.value,
                n.ctid
            );
        }
        IrqKind::Reconfig => log::debug!("vFPGA {}: reconfiguration interrupt", mmu.id()),
        IrqKind::Unknown(t) => {
            log::warn!("vFPGA {}: unknown interrupt type {t}, dropping", mmu.id());
        }
    }

    regs.clear_irq();
    kind
}
