use super::card::SharedCardAllocator;
use super::ctid::CtidTable;
use super::geometry::{PageFaultDescriptor, TlbGeometries};
use super::migrate::MigrationEngine;
use super::pin::{HostPinner, PinningManager};
use super::registry::{BufferDescriptor, BufferRegistry};
use super::tlb::TlbShadow;
use super::{AccessKind, Residency};
use crate::config::MmuConfig;
use crate::error::{MmuError, MmuResult};
use crate::hw::ShellRegisters;
use crate::signal::RegionSignals;
use crate::utils::{PAGE_SHIFT, align_up};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Outcome of a successfully served fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultStatus {
    Mapped,
    /// Mapped, but the new buffer is not coherent with the device and user space has
    /// to sync it explicitly.
    NeedsExplicitSync,
}

impl FaultStatus {
    const fn merge(self, other: Self) -> Self {
        match (self, other) {
            (Self::Mapped, Self::Mapped) => Self::Mapped,
            _ => Self::NeedsExplicitSync,
        }
    }
}

// ===============================================================================================
// Region MMU
// ===============================================================================================

/// Address translation state of one vFPGA region.
///
/// All registry and TLB mutations happen under one lock, so faults and explicit
/// requests of the same region never interleave. Different regions share only the
/// card allocator.
pub struct RegionMmu {
    id: u32,
    regs: Arc<dyn ShellRegisters>,
    signals: Arc<RegionSignals>,
    tlb: TlbShadow,
    pinning: PinningManager,
    migration: MigrationEngine,
    registry: Mutex<BufferRegistry>,
    ctids: Mutex<CtidTable>,
    timeout: Duration,
}

impl std::fmt::Debug for RegionMmu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionMmu")
            .field("id", &self.id)
            .field("tlb", &self.tlb)
            .field("pinning", &self.pinning)
            .field("migration", &self.migration)
            .finish_non_exhaustive()
    }
}

impl RegionMmu {
    #[must_use]
    pub fn new(
        id: u32,
        regs: Arc<dyn ShellRegisters>,
        geos: TlbGeometries,
        pinner: Arc<dyn HostPinner>,
        card: Option<SharedCardAllocator>,
        cfg: &MmuConfig,
    ) -> Self {
        let signals = Arc::new(RegionSignals::new());
        Self {
            id,
            tlb: TlbShadow::new(regs.clone(), geos, cfg.max_map_entries),
            pinning: PinningManager::new(pinner, card, geos.pages_per_huge),
            migration: MigrationEngine::new(regs.clone(), signals.clone(), cfg),
            regs,
            signals,
            registry: Mutex::new(BufferRegistry::new()),
            ctids: Mutex::new(CtidTable::new()),
            timeout: cfg.completion_timeout,
        }
    }

    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn regs(&self) -> &Arc<dyn ShellRegisters> {
        &self.regs
    }

    #[must_use]
    pub fn signals(&self) -> &Arc<RegionSignals> {
        &self.signals
    }

    fn registry(&self) -> MutexGuard<'_, BufferRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ctids(&self) -> MutexGuard<'_, CtidTable> {
        self.ctids.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ===========================================================================================
    // Ctid Management
    // ===========================================================================================

    /// # Errors
    /// Returns [`MmuError::NoFreeCtid`] when the region has no ctid left.
    pub fn register_ctid(&self, hpid: u32) -> MmuResult<u32> {
        let ctid = self.ctids().register(hpid)?;
        log::info!("vFPGA {}: ctid {ctid} registered to hpid {hpid}", self.id);
        Ok(ctid)
    }

    /// Releases every buffer of `ctid` and frees the ctid.
    ///
    /// # Errors
    /// Returns [`MmuError::InvalidCtid`] for an unknown ctid, or the first error hit
    /// while releasing its buffers (the ctid then stays registered).
    pub fn unregister_ctid(&self, ctid: u32) -> MmuResult<()> {
        // Held until the ctid is gone, so no fault can slip a buffer in between.
        let mut reg = self.registry();
        self.owner(ctid)?;
        let released = self.release_all_locked(&mut reg, ctid, true)?;
        let hpid = self.ctids().unregister(ctid)?;
        log::info!(
            "vFPGA {}: ctid {ctid} (hpid {hpid}) unregistered, {released} buffers released",
            self.id
        );
        Ok(())
    }

    /// # Errors
    /// Returns [`MmuError::InvalidCtid`] if `ctid` is not registered.
    pub fn owner(&self, ctid: u32) -> MmuResult<u32> {
        self.ctids().owner(ctid)
    }

    // ===========================================================================================
    // Page Faults
    // ===========================================================================================

    /// Serves a page fault of `[vaddr, vaddr + len)` raised by `ctid` of process `hpid`.
    ///
    /// A buffer not seen before is pinned (and offloaded first for card access). A known
    /// buffer whose residency matches `access` is only remapped. Otherwise its entries are
    /// invalidated, the data is migrated and the buffer remapped.
    ///
    /// Only the part of the fault up to the next known buffer is served; the vFPGA
    /// faults again for the rest.
    ///
    /// # Errors
    /// - [`MmuError::InvalidRange`] for an empty or overflowing range.
    /// - [`MmuError::PinningFailed`] or [`MmuError::OutOfMemory`] if a new buffer cannot
    ///   be backed. Nothing stays pinned or allocated in that case.
    /// - [`MmuError::CardMemoryDisabled`] for card access without card memory.
    /// - [`MmuError::HardwareTimeout`] if an invalidation or DMA does not complete.
    pub fn handle_fault(
        &self,
        vaddr: u64,
        len: u64,
        ctid: u32,
        access: AccessKind,
        hpid: u32,
    ) -> MmuResult<FaultStatus> {
        let mut reg = self.registry();
        let (status, _) = self.fault_locked(&mut reg, vaddr, len, ctid, access, hpid)?;
        Ok(status)
    }

    /// [`handle_fault`](Self::handle_fault) on behalf of a registered ctid, with the
    /// owner looked up under the same lock the fault is served with.
    ///
    /// # Errors
    /// As [`handle_fault`](Self::handle_fault), plus [`MmuError::InvalidCtid`].
    pub fn handle_ctid_fault(
        &self,
        vaddr: u64,
        len: u64,
        ctid: u32,
        access: AccessKind,
    ) -> MmuResult<FaultStatus> {
        let mut reg = self.registry();
        let hpid = self.owner(ctid)?;
        let (status, _) = self.fault_locked(&mut reg, vaddr, len, ctid, access, hpid)?;
        Ok(status)
    }

    /// Returns the status and the page one past the served range.
    fn fault_locked(
        &self,
        reg: &mut BufferRegistry,
        vaddr: u64,
        len: u64,
        ctid: u32,
        access: AccessKind,
        hpid: u32,
    ) -> MmuResult<(FaultStatus, u64)> {
        let geos = *self.tlb.geometries();
        let huge = self.pinning.is_huge_backed(hpid, vaddr);
        let fault_vpn = vaddr >> PAGE_SHIFT;

        let mut pf = PageFaultDescriptor::align(vaddr, len, ctid, geos.get(huge))?;
        let mut present = reg.map_present(&mut pf).map(|d| d.vpn);
        if pf.end() <= fault_vpn {
            // The huge page around the fault is partly covered by regular buffers.
            pf = PageFaultDescriptor::align(vaddr, len, ctid, &geos.small)?;
            present = reg.map_present(&mut pf).map(|d| d.vpn);
        }

        log::debug!(
            "vFPGA {}: fault 0x{vaddr:x}+{len} ctid {ctid} {access:?} [0x{:x}, +{}) huge {} hit {}",
            self.id,
            pf.vpn,
            pf.n_pages,
            pf.huge,
            present.is_some()
        );

        if let Some(key) = present {
            let desc = reg.get_mut(ctid, key).ok_or(MmuError::NotMapped { vaddr, ctid })?;
            self.ensure_residency(desc, access)?;
            self.tlb.map_buffer(desc, pf.vpn, pf.n_pages);
            return Ok((FaultStatus::Mapped, pf.end()));
        }

        if pf.huge && pf.n_pages % geos.pages_per_huge != 0 {
            pf.huge = false;
        }
        if access == Residency::Card && !self.pinning.card_enabled() {
            return Err(MmuError::CardMemoryDisabled);
        }

        let key = self.pinning.pin(reg, &pf, hpid)?;
        if let Err(e) = self.populate(reg, &pf, key, access) {
            log::error!("vFPGA {}: new buffer @ 0x{:x} rolled back: {e}", self.id, pf.vaddr());
            if let Some(desc) = reg.remove(ctid, key)
                && let Err(re) = self.pinning.release(desc, false)
            {
                log::warn!("vFPGA {}: rollback incomplete: {re}", self.id);
            }
            return Err(e);
        }

        let status = match reg.get(ctid, key) {
            Some(d) if d.needs_explicit_sync => FaultStatus::NeedsExplicitSync,
            _ => FaultStatus::Mapped,
        };
        Ok((status, pf.end()))
    }

    fn populate(
        &self,
        reg: &mut BufferRegistry,
        pf: &PageFaultDescriptor,
        key: u64,
        access: AccessKind,
    ) -> MmuResult<()> {
        let desc = reg.get_mut(pf.ctid, key).ok_or(MmuError::NotMapped {
            vaddr: pf.vaddr(),
            ctid: pf.ctid,
        })?;
        if access == Residency::Card {
            self.migration.offload(desc)?;
            desc.residency = Residency::Card;
        }
        self.tlb.map_buffer(desc, pf.vpn, pf.n_pages);
        Ok(())
    }

    /// Moves `desc` to `target`, leaving it unmapped. Returns whether anything moved.
    fn ensure_residency(&self, desc: &mut BufferDescriptor, target: Residency) -> MmuResult<bool> {
        if desc.residency == target {
            return Ok(false);
        }
        if desc.card_phys.is_empty() {
            return Err(MmuError::CardMemoryDisabled);
        }

        self.tlb.unmap_buffer(desc, &self.signals.invalidate, self.timeout)?;
        match target {
            Residency::Card => self.migration.offload(desc)?,
            Residency::Host => self.migration.sync(desc)?,
        };
        desc.residency = target;
        log::debug!(
            "vFPGA {}: [0x{:x}, +{}) now resident on {target:?}",
            self.id,
            desc.vpn,
            desc.n_pages
        );
        Ok(true)
    }

    // ===========================================================================================
    // Explicit User Requests
    // ===========================================================================================

    fn page_range(vaddr: u64, len: u64) -> MmuResult<(u64, u64)> {
        let invalid = || MmuError::InvalidRange { vaddr, len };
        if len == 0 {
            return Err(invalid());
        }
        let end = vaddr
            .checked_add(len)
            .and_then(|e| align_up(e, PAGE_SHIFT))
            .ok_or_else(invalid)?;
        let first = vaddr >> PAGE_SHIFT;
        Ok((first, (end >> PAGE_SHIFT) - first))
    }

    /// Pins and maps `[vaddr, vaddr + len)` for host access with the TLB locked.
    ///
    /// # Errors
    /// As [`handle_fault`](Self::handle_fault), plus [`MmuError::InvalidCtid`].
    pub fn map_user(&self, vaddr: u64, len: u64, ctid: u32) -> MmuResult<FaultStatus> {
        let (first, n_pages) = Self::page_range(vaddr, len)?;
        let end = (first + n_pages) << PAGE_SHIFT;

        let mut reg = self.registry();
        let hpid = self.owner(ctid)?;
        self.regs.change_tlb_lock();
        let mut status = FaultStatus::Mapped;
        let mut cur = vaddr;
        let result = loop {
            if cur >= end {
                break Ok(status);
            }
            match self.fault_locked(&mut reg, cur, end - cur, ctid, Residency::Host, hpid) {
                Ok((s, next)) => {
                    status = status.merge(s);
                    cur = next << PAGE_SHIFT;
                }
                Err(e) => break Err(e),
            }
        };
        self.regs.change_tlb_lock();
        result
    }

    /// Unmaps and releases the buffer containing `vaddr`.
    ///
    /// # Errors
    /// Returns [`MmuError::NotMapped`] if no buffer of `ctid` contains `vaddr`, or the
    /// error of the invalidation (the buffer then stays registered).
    pub fn unmap_user(&self, vaddr: u64, ctid: u32, dirty: bool) -> MmuResult<()> {
        let mut reg = self.registry();
        let key = reg
            .find(ctid, vaddr >> PAGE_SHIFT)
            .ok_or(MmuError::NotMapped { vaddr, ctid })?;
        self.release_locked(&mut reg, ctid, key, dirty)
    }

    /// Migrates every buffer touching the range to card memory.
    /// Returns the number of buffers that moved.
    ///
    /// # Errors
    /// Returns [`MmuError::NotMapped`] if no buffer touches the range,
    /// [`MmuError::CardMemoryDisabled`] without card memory, or a migration error.
    pub fn offload_user(&self, vaddr: u64, len: u64, ctid: u32) -> MmuResult<usize> {
        self.migrate_user(vaddr, len, ctid, Residency::Card)
    }

    /// Migrates every buffer touching the range back to host memory.
    /// Buffers already on the host are left alone.
    ///
    /// # Errors
    /// Same as [`offload_user`](Self::offload_user).
    pub fn sync_user(&self, vaddr: u64, len: u64, ctid: u32) -> MmuResult<usize> {
        self.migrate_user(vaddr, len, ctid, Residency::Host)
    }

    fn migrate_user(&self, vaddr: u64, len: u64, ctid: u32, target: Residency) -> MmuResult<usize> {
        if !self.pinning.card_enabled() {
            return Err(MmuError::CardMemoryDisabled);
        }
        let (first, n_pages) = Self::page_range(vaddr, len)?;

        let mut reg = self.registry();
        let keys = reg.covering(ctid, first, n_pages);
        if keys.is_empty() {
            return Err(MmuError::NotMapped { vaddr, ctid });
        }

        let mut moved = 0;
        for key in keys {
            let Some(desc) = reg.get_mut(ctid, key) else {
                continue;
            };
            if self.ensure_residency(desc, target)? {
                self.tlb.map_buffer(desc, desc.vpn, desc.n_pages);
                moved += 1;
            }
        }
        Ok(moved)
    }

    /// Unmaps and releases every buffer of `ctid`. Returns how many were released.
    ///
    /// # Errors
    /// Returns the first error hit. Buffers that failed to unmap stay registered.
    pub fn release_ctid(&self, ctid: u32, dirty: bool) -> MmuResult<usize> {
        let mut reg = self.registry();
        self.release_all_locked(&mut reg, ctid, dirty)
    }

    fn release_all_locked(
        &self,
        reg: &mut BufferRegistry,
        ctid: u32,
        dirty: bool,
    ) -> MmuResult<usize> {
        let mut released = 0;
        let mut first_err = None;
        for key in reg.keys(ctid) {
            match self.release_locked(reg, ctid, key, dirty) {
                Ok(()) => released += 1,
                Err(e) => first_err = first_err.or(Some(e)),
            }
        }
        first_err.map_or(Ok(released), Err)
    }

    fn release_locked(
        &self,
        reg: &mut BufferRegistry,
        ctid: u32,
        key: u64,
        dirty: bool,
    ) -> MmuResult<()> {
        let Some(desc) = reg.get(ctid, key) else {
            return Err(MmuError::NotMapped { vaddr: key << PAGE_SHIFT, ctid });
        };
        self.tlb.unmap_buffer(desc, &self.signals.invalidate, self.timeout)?;
        match reg.remove(ctid, key) {
            Some(desc) => self.pinning.release(desc, dirty),
            None => Ok(()),
        }
    }

    // ===========================================================================================
    // Introspection
    // ===========================================================================================

    /// A copy of the buffer of `ctid` containing `vaddr`.
    #[must_use]
    pub fn buffer(&self, ctid: u32, vaddr: u64) -> Option<BufferDescriptor> {
        let reg = self.registry();
        let key = reg.find(ctid, vaddr >> PAGE_SHIFT)?;
        reg.get(ctid, key).cloned()
    }

    #[must_use]
    pub fn buffer_count(&self) -> usize {
        self.registry().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CardLayout;
    use crate::hw::{DmaDirection, TlbOrder};
    use crate::mmu::card::CardAllocator;
    use crate::mmu::geometry::tests::shell_cfg;
    use crate::signal::Completion;
    use crate::sim::{SimOp, SimPinner, SimShell};

    struct Fixture {
        shell: Arc<SimShell>,
        pinner: Arc<SimPinner>,
        card: Option<SharedCardAllocator>,
        mmu: RegionMmu,
    }

    fn fixture_with(pinner: SimPinner, with_card: bool, cfg: MmuConfig) -> Fixture {
        let geos = TlbGeometries::from_shell(&shell_cfg());
        let shell = Arc::new(SimShell::new());
        let pinner = Arc::new(pinner);
        let card = with_card.then(|| {
            let layout = CardLayout::new().regular(0x1000_0000, 64).huge(0x4000_0000, 2);
            CardAllocator::new(&layout, &geos).shared()
        });
        let regs: Arc<dyn ShellRegisters> = shell.clone();
        let host: Arc<dyn HostPinner> = pinner.clone();
        let mmu = RegionMmu::new(0, regs, geos, host, card.clone(), &cfg);
        shell.attach(mmu.signals());
        Fixture { shell, pinner, card, mmu }
    }

    fn fixture() -> Fixture {
        fixture_with(SimPinner::new(), true, MmuConfig::new())
    }

    fn regular_maps(shell: &SimShell) -> usize {
        shell.count(|op| {
            matches!(op, SimOp::Tlb(TlbOrder::Regular, [_, w1]) if (w1 >> 44) & 1 == 1)
        })
    }

    #[test]
    fn card_fault_pins_offloads_and_maps() {
        let f = fixture();
        let status = f.mmu.handle_fault(0x10000, 8192, 3, Residency::Card, 42).unwrap();
        assert_eq!(status, FaultStatus::Mapped);

        let d = f.mmu.buffer(3, 0x10000).unwrap();
        assert_eq!((d.vpn, d.n_pages), (0x10, 2));
        assert_eq!(d.residency, Residency::Card);
        assert_eq!(f.pinner.pinned_pages(), 2);
        assert_eq!(f.card.as_ref().unwrap().lock().unwrap().free_count(false), 62);

        let ops = f.shell.ops();
        let dma: Vec<_> = ops
            .iter()
            .filter_map(|op| match op {
                SimOp::Dma(DmaDirection::Offload, c) => Some(*c),
                _ => None,
            })
            .collect();
        assert_eq!(dma.len(), 2);
        assert!(dma[1].last);
        let first_dma = ops.iter().position(|op| matches!(op, SimOp::Dma(..))).unwrap();
        let first_map = ops.iter().position(|op| matches!(op, SimOp::Tlb(..))).unwrap();
        assert!(first_dma < first_map);
        assert_eq!(regular_maps(&f.shell), 2);
    }

    #[test]
    fn host_fault_on_card_buffer_migrates_back() {
        let f = fixture();
        f.mmu.handle_fault(0x10000, 8192, 3, Residency::Card, 42).unwrap();
        f.shell.clear_ops();

        f.mmu.handle_fault(0x10000, 8192, 3, Residency::Host, 42).unwrap();
        let ops = f.shell.ops();
        let invs: Vec<_> = ops
            .iter()
            .filter_map(|op| match op {
                SimOp::Invalidate(i) => Some(*i),
                _ => None,
            })
            .collect();
        assert_eq!(invs.len(), 2);
        assert!(invs[1].last && !invs[0].last);
        assert_eq!(f.shell.count(|op| matches!(op, SimOp::Dma(DmaDirection::Sync, _))), 2);
        assert_eq!(regular_maps(&f.shell), 2);
        assert_eq!(f.mmu.buffer(3, 0x10000).unwrap().residency, Residency::Host);
    }

    #[test]
    fn matching_residency_only_remaps() {
        let f = fixture();
        f.mmu.handle_fault(0x10000, 8192, 3, Residency::Host, 42).unwrap();
        f.shell.clear_ops();
        f.mmu.handle_fault(0x11000, 16, 3, Residency::Host, 42).unwrap();
        assert_eq!(f.shell.ops().len(), 1);
        assert_eq!(f.mmu.buffer_count(), 1);
    }

    #[test]
    fn overlapping_fault_pins_only_prefix() {
        let f = fixture();
        f.mmu.handle_fault(0x12000, 4096, 1, Residency::Host, 42).unwrap();
        f.mmu.handle_fault(0x10000, 0x4000, 1, Residency::Host, 42).unwrap();
        let d = f.mmu.buffer(1, 0x10000).unwrap();
        assert_eq!((d.vpn, d.n_pages), (0x10, 2));
        assert_eq!(f.pinner.pinned_pages(), 3);
    }

    #[test]
    fn failed_offload_rolls_back() {
        let f = fixture_with(
            SimPinner::new(),
            true,
            MmuConfig::new().completion_timeout(Duration::from_millis(5)),
        );
        f.shell.set_auto_complete(false);
        let err = f.mmu.handle_fault(0x10000, 8192, 3, Residency::Card, 42).unwrap_err();
        assert!(matches!(err, MmuError::HardwareTimeout(Completion::Offload)));
        assert_eq!(f.mmu.buffer_count(), 0);
        assert_eq!(f.pinner.pinned_pages(), 0);
        assert_eq!(f.card.as_ref().unwrap().lock().unwrap().free_count(false), 64);
    }

    #[test]
    fn card_access_without_card_memory() {
        let f = fixture_with(SimPinner::new(), false, MmuConfig::new());
        assert!(matches!(
            f.mmu.handle_fault(0x10000, 8192, 3, Residency::Card, 42),
            Err(MmuError::CardMemoryDisabled)
        ));
        assert_eq!(f.pinner.pinned_pages(), 0);
        assert_eq!(
            f.mmu.handle_fault(0x10000, 8192, 3, Residency::Host, 42).unwrap(),
            FaultStatus::Mapped
        );
        assert!(f.mmu.buffer(3, 0x10000).unwrap().card_phys.is_empty());
    }

    #[test]
    fn reports_incoherent_buffers() {
        let pinner = SimPinner::new();
        pinner.set_needs_explicit_sync(true);
        let f = fixture_with(pinner, true, MmuConfig::new());
        assert_eq!(
            f.mmu.handle_fault(0x10000, 8192, 3, Residency::Host, 42).unwrap(),
            FaultStatus::NeedsExplicitSync
        );
        assert_eq!(
            f.mmu.handle_fault(0x10000, 8192, 3, Residency::Host, 42).unwrap(),
            FaultStatus::Mapped
        );
    }

    #[test]
    fn huge_backed_fault_uses_huge_entries() {
        let pinner = SimPinner::contiguous();
        pinner.add_huge_range(0x4000_0000..0x4080_0000);
        let f = fixture_with(pinner, true, MmuConfig::new());

        f.mmu.handle_fault(0x4020_1000, 64, 0, Residency::Card, 7).unwrap();
        let d = f.mmu.buffer(0, 0x4020_0000).unwrap();
        assert!(d.huge);
        assert_eq!(d.n_pages, 512);
        assert_eq!(f.shell.count(|op| matches!(op, SimOp::Dma(..))), 128);
        assert_eq!(f.shell.count(|op| matches!(op, SimOp::Tlb(TlbOrder::Huge, _))), 1);
        assert_eq!(f.card.as_ref().unwrap().lock().unwrap().free_count(true), 1);
    }

    #[test]
    fn contiguous_regular_buffer_is_coalesced() {
        let f = fixture_with(SimPinner::contiguous(), false, MmuConfig::new());
        f.mmu.handle_fault(0x20_0000, 0x20_1000, 0, Residency::Host, 7).unwrap();
        assert_eq!(f.shell.count(|op| matches!(op, SimOp::Tlb(TlbOrder::Huge, _))), 1);
        assert_eq!(f.shell.count(|op| matches!(op, SimOp::Tlb(TlbOrder::Regular, _))), 1);

        f.shell.clear_ops();
        f.mmu.unmap_user(0x20_0000, 0, false).unwrap();
        let invs: Vec<_> = f
            .shell
            .ops()
            .into_iter()
            .filter_map(|op| match op {
                SimOp::Invalidate(i) => Some(i.n_pages),
                _ => None,
            })
            .collect();
        assert_eq!(invs, vec![512, 1]);
    }

    #[test]
    fn map_cap_splits_into_several_calls() {
        let f = fixture_with(SimPinner::new(), false, MmuConfig::new().max_map_entries(3));
        f.mmu.handle_fault(0x10000, 10 * 4096, 0, Residency::Host, 7).unwrap();
        assert_eq!(regular_maps(&f.shell), 10);
    }

    #[test]
    fn explicit_requests() {
        let f = fixture();
        let ctid = f.mmu.register_ctid(42).unwrap();

        assert_eq!(f.mmu.map_user(0x10000, 0x3000, ctid).unwrap(), FaultStatus::Mapped);
        assert_eq!(f.shell.count(|op| matches!(op, SimOp::TlbLock)), 2);
        assert_eq!(f.mmu.buffer_count(), 1);

        assert_eq!(f.mmu.sync_user(0x10000, 0x3000, ctid).unwrap(), 0);
        assert_eq!(f.shell.count(|op| matches!(op, SimOp::Dma(..))), 0);

        assert_eq!(f.mmu.offload_user(0x10000, 0x3000, ctid).unwrap(), 1);
        assert_eq!(f.mmu.buffer(ctid, 0x10000).unwrap().residency, Residency::Card);
        assert_eq!(f.mmu.offload_user(0x10000, 1, ctid).unwrap(), 0);

        assert!(matches!(
            f.mmu.sync_user(0x90000, 1, ctid),
            Err(MmuError::NotMapped { .. })
        ));

        f.mmu.unmap_user(0x11000, ctid, true).unwrap();
        assert_eq!(f.mmu.buffer_count(), 0);
        assert_eq!(f.pinner.pinned_pages(), 0);
        assert_eq!(f.pinner.dirty_pages(), 3);
        assert!(matches!(
            f.mmu.unmap_user(0x11000, ctid, true),
            Err(MmuError::NotMapped { .. })
        ));
    }

    #[test]
    fn map_user_spans_existing_buffers() {
        let f = fixture();
        let ctid = f.mmu.register_ctid(42).unwrap();
        f.mmu.handle_fault(0x12000, 4096, ctid, Residency::Host, 42).unwrap();
        f.mmu.map_user(0x10000, 0x5000, ctid).unwrap();
        assert_eq!(f.mmu.buffer_count(), 3);
        assert_eq!(f.pinner.pinned_pages(), 5);
    }

    #[test]
    fn unregister_releases_buffers() {
        let f = fixture();
        let ctid = f.mmu.register_ctid(42).unwrap();
        f.mmu.handle_fault(0x10000, 4096, ctid, Residency::Card, 42).unwrap();
        f.mmu.handle_fault(0x20000, 4096, ctid, Residency::Host, 42).unwrap();
        f.mmu.unregister_ctid(ctid).unwrap();
        assert_eq!(f.mmu.buffer_count(), 0);
        assert_eq!(f.pinner.pinned_pages(), 0);
        assert!(matches!(f.mmu.owner(ctid), Err(MmuError::InvalidCtid(_))));
    }

    #[test]
    fn stuck_invalidation_keeps_buffer() {
        let f = fixture_with(
            SimPinner::new(),
            true,
            MmuConfig::new().completion_timeout(Duration::from_millis(5)),
        );
        f.mmu.handle_fault(0x10000, 4096, 0, Residency::Host, 42).unwrap();
        f.shell.set_auto_complete(false);
        assert!(matches!(
            f.mmu.unmap_user(0x10000, 0, false),
            Err(MmuError::HardwareTimeout(Completion::Invalidate))
        ));
        assert_eq!(f.mmu.buffer_count(), 1);
        assert_eq!(f.pinner.pinned_pages(), 1);
    }

    #[test]
    fn faults_of_one_region_are_serialized() {
        let cfg = MmuConfig::new()
            .dma_threshold(1)
            .dma_sleep(Duration::from_micros(50), Duration::from_micros(100));
        let f = fixture_with(SimPinner::new(), true, cfg);
        f.shell.set_dma_drain(1);
        let ctids: Vec<u32> = (0..4).map(|i| f.mmu.register_ctid(100 + i).unwrap()).collect();

        std::thread::scope(|s| {
            for &ctid in &ctids {
                let mmu = &f.mmu;
                s.spawn(move || {
                    let vaddr = 0x10_0000 * u64::from(ctid + 1);
                    mmu.handle_ctid_fault(vaddr, 4 * 4096, ctid, Residency::Card).unwrap();
                    assert_eq!(mmu.sync_user(vaddr, 4 * 4096, ctid).unwrap(), 1);
                });
            }
        });

        assert_eq!(f.shell.interleaved_batches(), 0);
        assert_eq!(f.mmu.buffer_count(), 4);
        assert_eq!(f.shell.count(|op| matches!(op, SimOp::Dma(DmaDirection::Offload, _))), 16);
        assert_eq!(f.shell.count(|op| matches!(op, SimOp::Dma(DmaDirection::Sync, _))), 16);
        assert_eq!(f.card.as_ref().unwrap().lock().unwrap().free_count(false), 48);
    }

    #[test]
    fn unregistered_ctid_keeps_no_buffers() {
        let f = fixture();
        for _ in 0..32 {
            let ctid = f.mmu.register_ctid(42).unwrap();
            std::thread::scope(|s| {
                s.spawn(|| {
                    for i in 0..8 {
                        let vaddr = 0x10000 + i * 0x1000;
                        let _ = f.mmu.handle_ctid_fault(vaddr, 16, ctid, Residency::Host);
                    }
                });
                f.mmu.unregister_ctid(ctid).unwrap();
            });
            assert!(matches!(f.mmu.owner(ctid), Err(MmuError::InvalidCtid(_))));
            assert_eq!(f.mmu.buffer_count(), 0);
            assert_eq!(f.pinner.pinned_pages(), 0);
        }
    }
}
