use crate::error::{MmuError, MmuResult};
use crate::hw::TlbOrder;
use crate::hw::regs::{ShellConfig, TLB_PADDR_RANGE, TLB_VADDR_RANGE, TlbParams};
use crate::utils::{PAGE_SHIFT, align_up};

/// Immutable description of one TLB order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbGeometry {
    pub huge: bool,
    pub page_shift: u32,
    pub page_size: u64,
    pub page_mask: u64,
    pub assoc: u32,
    pub key_size: u32,
    pub key_mask: u64,
    pub tag_size: u32,
    pub tag_mask: u64,
    pub phys_size: u32,
    pub phys_mask: u64,
}

impl TlbGeometry {
    /// Derives the entry masks. Callers must have checked that
    /// `key_size + page_shift < 48` (see [`ShellConfig::validate`]).
    #[must_use]
    pub const fn new(huge: bool, key_size: u32, assoc: u32, page_shift: u32) -> Self {
        let page_size = 1u64 << page_shift;
        let tag_size = TLB_VADDR_RANGE - page_shift - key_size;
        let phys_size = TLB_PADDR_RANGE - page_shift;
        Self {
            huge,
            page_shift,
            page_size,
            page_mask: !(page_size - 1),
            assoc,
            key_size,
            key_mask: (1u64 << key_size) - 1,
            tag_size,
            tag_mask: (1u64 << tag_size) - 1,
            phys_size,
            phys_mask: (1u64 << phys_size) - 1,
        }
    }

    const fn from_params(huge: bool, p: TlbParams) -> Self {
        Self::new(huge, p.order, p.assoc, p.page_shift)
    }

    #[must_use]
    pub const fn order(&self) -> TlbOrder {
        if self.huge { TlbOrder::Huge } else { TlbOrder::Regular }
    }

    /// Shift from regular page numbers to page numbers of this order.
    #[must_use]
    pub const fn order_shift(&self) -> u32 {
        self.page_shift - PAGE_SHIFT
    }
}

/// Both TLB orders of a shell plus the derived ratio between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbGeometries {
    pub small: TlbGeometry,
    pub large: TlbGeometry,
    /// Regular pages per huge page.
    pub pages_per_huge: u64,
    pub dif_order_shift: u32,
}

impl TlbGeometries {
    #[must_use]
    pub const fn from_shell(cfg: &ShellConfig) -> Self {
        let small = TlbGeometry::from_params(false, cfg.small);
        let large = TlbGeometry::from_params(true, cfg.large);
        let dif_order_shift = large.page_shift - small.page_shift;
        Self {
            small,
            large,
            pages_per_huge: 1 << dif_order_shift,
            dif_order_shift,
        }
    }

    #[must_use]
    pub const fn get(&self, huge: bool) -> &TlbGeometry {
        if huge { &self.large } else { &self.small }
    }

    /// A regular page number is the first page of a huge page.
    #[must_use]
    pub const fn is_huge_aligned(&self, vpn: u64) -> bool {
        vpn & (self.pages_per_huge - 1) == 0
    }
}

/// A page fault aligned to the granularity of the geometry backing it.
///
/// `vpn` and `n_pages` are always in regular-page units, also for huge faults;
/// the TLB entries for a huge fault still use the large order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFaultDescriptor {
    pub vpn: u64,
    pub n_pages: u64,
    pub ctid: u32,
    pub huge: bool,
}

impl PageFaultDescriptor {
    /// Aligns `[vaddr, vaddr + len)` outwards to `geo` pages.
    ///
    /// # Errors
    /// Returns [`MmuError::InvalidRange`] for an empty range, one that overflows,
    /// or one reaching beyond the TLB's virtual range.
    pub fn align(vaddr: u64, len: u64, ctid: u32, geo: &TlbGeometry) -> MmuResult<Self> {
        let invalid = || MmuError::InvalidRange { vaddr, len };
        if len == 0 {
            return Err(invalid());
        }
        let end = vaddr.checked_add(len).ok_or_else(invalid)?;
        if end > 1u64 << TLB_VADDR_RANGE {
            return Err(invalid());
        }
        let end = align_up(end, geo.page_shift).ok_or_else(invalid)?;

        let first = vaddr >> geo.page_shift;
        let last = end >> geo.page_shift;
        let shift = geo.order_shift();

        Ok(Self {
            vpn: first << shift,
            n_pages: (last - first) << shift,
            ctid,
            huge: geo.huge,
        })
    }

    /// One past the last regular page.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.vpn + self.n_pages
    }

    #[must_use]
    pub const fn vaddr(&self) -> u64 {
        self.vpn << PAGE_SHIFT
    }
}
