#![allow(clippy::cast_possible_truncation)]

use super::Residency;
use super::card::SharedCardAllocator;
use super::geometry::PageFaultDescriptor;
use super::registry::{BufferDescriptor, BufferRegistry};
use crate::error::{MmuError, MmuResult};
use crate::utils::{PAGE_SHIFT, PAGE_SIZE};
use std::sync::{Arc, PoisonError};

/// Result of pinning a range of host pages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PinnedPages {
    /// One physical address per pinned page, in order. May be shorter than requested.
    pub phys: Vec<u64>,
    /// The pages are not cache-coherent with the device.
    pub needs_explicit_sync: bool,
}

/// The platform service that pins user pages of a process.
pub trait HostPinner: Send + Sync {
    /// Whether `vaddr` of `pid` is backed by huge pages.
    fn is_huge_backed(&self, pid: u32, vaddr: u64) -> bool;

    /// Pins up to `n_pages` regular pages starting at page `vpn`.
    ///
    /// # Errors
    /// Returns an error if the process or range cannot be accessed at all.
    fn pin(&self, pid: u32, vpn: u64, n_pages: u64) -> MmuResult<PinnedPages>;

    /// Releases pages returned by [`pin`](Self::pin).
    fn unpin(&self, pid: u32, vpn: u64, phys: &[u64], dirty: bool);
}

/// Creates and releases [`BufferDescriptor`]s.
pub struct PinningManager {
    pinner: Arc<dyn HostPinner>,
    card: Option<SharedCardAllocator>,
    pages_per_huge: u64,
}

impl std::fmt::Debug for PinningManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinningManager")
            .field("card", &self.card.is_some())
            .field("pages_per_huge", &self.pages_per_huge)
            .finish_non_exhaustive()
    }
}

impl PinningManager {
    #[must_use]
    pub fn new(
        pinner: Arc<dyn HostPinner>,
        card: Option<SharedCardAllocator>,
        pages_per_huge: u64,
    ) -> Self {
        Self { pinner, card, pages_per_huge }
    }

    #[must_use]
    pub const fn card_enabled(&self) -> bool {
        self.card.is_some()
    }

    #[must_use]
    pub fn is_huge_backed(&self, pid: u32, vaddr: u64) -> bool {
        self.pinner.is_huge_backed(pid, vaddr)
    }

    /// Pins the pages of `pf`, backs them with card chunks if card memory is present,
    /// and registers the result. Returns the start page of the new descriptor.
    ///
    /// Nothing is left pinned or allocated on failure.
    ///
    /// # Errors
    /// - [`MmuError::InvalidRange`] for an empty or overflowing range.
    /// - [`MmuError::PinningFailed`] if not every page could be pinned.
    /// - [`MmuError::OutOfMemory`] if the card allocator is exhausted.
    pub fn pin(
        &self,
        registry: &mut BufferRegistry,
        pf: &PageFaultDescriptor,
        hpid: u32,
    ) -> MmuResult<u64> {
        let invalid = || MmuError::InvalidRange {
            vaddr: pf.vaddr(),
            len: pf.n_pages << PAGE_SHIFT,
        };
        let end = pf.vpn.checked_add(pf.n_pages);
        if pf.n_pages == 0 || end.is_none_or(|e| e > u64::MAX >> PAGE_SHIFT) {
            return Err(invalid());
        }
        if pf.huge && pf.n_pages % self.pages_per_huge != 0 {
            return Err(invalid());
        }
        let requested = pf.n_pages as usize;

        let mut pinned = self.pinner.pin(hpid, pf.vpn, pf.n_pages)?;
        if pinned.phys.len() < requested {
            log::warn!(
                "pin: obtained {} of {requested} pages @ 0x{:x}, hpid {hpid}",
                pinned.phys.len(),
                pf.vaddr()
            );
            self.pinner.unpin(hpid, pf.vpn, &pinned.phys, false);
            return Err(MmuError::PinningFailed {
                requested,
                obtained: pinned.phys.len(),
            });
        }
        if pinned.phys.len() > requested {
            let extra = pinned.phys.split_off(requested);
            self.pinner.unpin(hpid, pf.vpn + pf.n_pages, &extra, false);
        }

        let card_phys = match self.alloc_card(pf) {
            Ok(c) => c,
            Err(e) => {
                self.pinner.unpin(hpid, pf.vpn, &pinned.phys, false);
                return Err(e);
            }
        };

        let desc = BufferDescriptor {
            vpn: pf.vpn,
            n_pages: pf.n_pages,
            ctid: pf.ctid,
            hpid,
            huge: pf.huge,
            residency: Residency::Host,
            host_phys: pinned.phys,
            card_phys,
            needs_explicit_sync: pinned.needs_explicit_sync,
        };
        log::debug!(
            "pin: [0x{:x}, +{} pages) ctid {} hpid {hpid}, huge {}, card {}",
            desc.vpn,
            desc.n_pages,
            desc.ctid,
            desc.huge,
            !desc.card_phys.is_empty()
        );
        registry.insert(desc);
        Ok(pf.vpn)
    }

    fn alloc_card(&self, pf: &PageFaultDescriptor) -> MmuResult<Vec<u64>> {
        let Some(card) = &self.card else {
            return Ok(Vec::new());
        };
        let mut card = card.lock().unwrap_or_else(PoisonError::into_inner);
        if !pf.huge {
            return card.alloc(pf.n_pages as usize, false);
        }

        let chunks = card.alloc((pf.n_pages / self.pages_per_huge) as usize, true)?;
        Ok(chunks
            .iter()
            .flat_map(|&base| (0..self.pages_per_huge).map(move |j| base + j * PAGE_SIZE))
            .collect())
    }

    /// Frees the card chunks and unpins the host pages of a descriptor that has
    /// already been removed from the registry and unmapped.
    ///
    /// # Errors
    /// Returns the allocator's error if a card chunk was not in use. Host pages are
    /// released regardless.
    pub fn release(&self, desc: BufferDescriptor, dirty: bool) -> MmuResult<()> {
        let mut result = Ok(());
        if let Some(card) = &self.card
            && !desc.card_phys.is_empty()
        {
            let mut card = card.lock().unwrap_or_else(PoisonError::into_inner);
            result = if desc.huge {
                let bases: Vec<u64> = desc
                    .card_phys
                    .iter()
                    .step_by(self.pages_per_huge as usize)
                    .copied()
                    .collect();
                card.free(&bases, true)
            } else {
                card.free(&desc.card_phys, false)
            };
        }

        self.pinner.unpin(desc.hpid, desc.vpn, &desc.host_phys, dirty);
        log::debug!(
            "release: [0x{:x}, +{} pages) ctid {}, dirty {dirty}",
            desc.vpn,
            desc.n_pages,
            desc.ctid
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CardLayout;
    use crate::mmu::card::CardAllocator;
    use crate::mmu::geometry::TlbGeometries;
    use crate::mmu::geometry::tests::shell_cfg;
    use crate::sim::SimPinner;

    fn manager(
        pinner: &Arc<SimPinner>,
        regular: usize,
        huge: usize,
    ) -> (PinningManager, SharedCardAllocator) {
        let geos = TlbGeometries::from_shell(&shell_cfg());
        let layout = CardLayout::new().regular(0x1000_0000, regular).huge(0x4000_0000, huge);
        let card = CardAllocator::new(&layout, &geos).shared();
        let pinner: Arc<dyn HostPinner> = pinner.clone();
        (PinningManager::new(pinner, Some(card.clone()), geos.pages_per_huge), card)
    }

    fn pf(vpn: u64, n_pages: u64, huge: bool) -> PageFaultDescriptor {
        PageFaultDescriptor { vpn, n_pages, ctid: 3, huge }
    }

    #[test]
    fn pins_and_registers() {
        let pinner = Arc::new(SimPinner::new());
        let (m, card) = manager(&pinner, 8, 1);
        let mut reg = BufferRegistry::new();

        let key = m.pin(&mut reg, &pf(0x10, 2, false), 42).unwrap();
        let d = reg.get(3, key).unwrap();
        assert_eq!(d.host_phys.len(), 2);
        assert_eq!(d.card_phys, vec![0x1000_0000, 0x1000_1000]);
        assert_eq!(d.residency, Residency::Host);
        assert_eq!(pinner.pinned_pages(), 2);
        assert_eq!(card.lock().unwrap().free_count(false), 6);
    }

    #[test]
    fn short_pin_rolls_back() {
        let pinner = Arc::new(SimPinner::new());
        pinner.limit_pins(1);
        let (m, _) = manager(&pinner, 8, 1);
        let mut reg = BufferRegistry::new();

        let err = m.pin(&mut reg, &pf(0x10, 2, false), 42).unwrap_err();
        assert!(matches!(err, MmuError::PinningFailed { requested: 2, obtained: 1 }));
        assert_eq!(pinner.pinned_pages(), 0);
        assert!(reg.is_empty());
    }

    #[test]
    fn card_exhaustion_unpins() {
        let pinner = Arc::new(SimPinner::new());
        let (m, card) = manager(&pinner, 1, 1);
        let mut reg = BufferRegistry::new();

        let err = m.pin(&mut reg, &pf(0x10, 2, false), 42).unwrap_err();
        assert!(matches!(err, MmuError::OutOfMemory { requested: 2, available: 1 }));
        assert_eq!(pinner.pinned_pages(), 0);
        assert_eq!(card.lock().unwrap().free_count(false), 1);
        assert!(reg.is_empty());
    }

    #[test]
    fn huge_buffers_expand_card_chunks() {
        let pinner = Arc::new(SimPinner::new());
        let (m, card) = manager(&pinner, 1, 2);
        let mut reg = BufferRegistry::new();

        let key = m.pin(&mut reg, &pf(0x200, 512, true), 42).unwrap();
        let d = reg.remove(3, key).unwrap();
        assert_eq!(d.card_phys.len(), 512);
        assert_eq!(d.card_phys[1], 0x4000_1000);
        assert_eq!(card.lock().unwrap().free_count(true), 1);

        m.release(d, true).unwrap();
        assert_eq!(card.lock().unwrap().free_count(true), 2);
        assert_eq!(pinner.pinned_pages(), 0);
        assert_eq!(pinner.dirty_pages(), 512);
    }

    #[test]
    fn rejects_empty_and_ragged_huge() {
        let pinner = Arc::new(SimPinner::new());
        let (m, _) = manager(&pinner, 8, 1);
        let mut reg = BufferRegistry::new();
        assert!(matches!(
            m.pin(&mut reg, &pf(0x10, 0, false), 1),
            Err(MmuError::InvalidRange { .. })
        ));
        assert!(matches!(
            m.pin(&mut reg, &pf(0x200, 100, true), 1),
            Err(MmuError::InvalidRange { .. })
        ));
    }
}
