use super::Residency;
use super::geometry::{TlbGeometries, TlbGeometry};
use super::registry::BufferDescriptor;
use crate::error::MmuResult;
use crate::hw::regs::{PID_SIZE, STRM_SIZE};
use crate::hw::{Invalidation, ShellRegisters, TlbOrder};
use crate::signal::CompletionSignal;
use crate::utils::{PAGE_SIZE, is_aligned};
use std::sync::Arc;
use std::time::Duration;

// ===============================================================================================
// Entry Encoding
// ===============================================================================================

const fn key_tag(geo: &TlbGeometry, vpn: u64) -> (u64, u64) {
    let page = vpn >> geo.order_shift();
    (page & geo.key_mask, (page >> geo.key_size) & geo.tag_mask)
}

/// Packs a valid entry translating regular page `vpn` to `phys`.
#[must_use]
pub const fn encode_map(
    geo: &TlbGeometry,
    vpn: u64,
    phys: u64,
    residency: Residency,
    ctid: u32,
    hpid: u32,
) -> [u64; 2] {
    let (key, tag) = key_tag(geo, vpn);
    let phys_masked = (phys >> geo.page_shift) & geo.phys_mask;
    let ks = geo.key_size;
    let kt = ks + geo.tag_size;

    [
        phys_masked | ((hpid as u64) << 32),
        key | (tag << ks)
            | ((ctid as u64) << kt)
            | (residency.stream_bit() << (kt + PID_SIZE))
            | (1 << (kt + PID_SIZE + STRM_SIZE))
            | (phys_masked << (kt + PID_SIZE + STRM_SIZE + 1)),
    ]
}

/// Packs an entry for `vpn` with the valid bit cleared.
#[must_use]
pub const fn encode_unmap(geo: &TlbGeometry, vpn: u64, hpid: u32) -> [u64; 2] {
    let (key, tag) = key_tag(geo, vpn);
    [(hpid as u64) << 32, key | (tag << geo.key_size)]
}

// ===============================================================================================
// Coalescing
// ===============================================================================================

/// One TLB entry of a buffer mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapSpan {
    /// Index of the first page within the buffer.
    pub index: usize,
    pub vpn: u64,
    pub phys: u64,
    pub n_pages: u64,
    pub order: TlbOrder,
}

impl MapSpan {
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.vpn + self.n_pages
    }
}

/// Checks whether the `pages_per_huge` pages starting at `i` can share one huge entry.
fn can_coalesce(geos: &TlbGeometries, vpn: u64, phys: &[u64], i: usize) -> bool {
    let pph = geos.pages_per_huge as usize;
    let Some(group) = phys.get(i..i + pph) else {
        return false;
    };
    let base = group[0];
    geos.is_huge_aligned(vpn)
        && is_aligned(base, geos.large.page_shift)
        && (base >> geos.large.page_shift) <= geos.large.phys_mask
        && group
            .iter()
            .zip(0u64..)
            .all(|(&p, j)| p == base + j * PAGE_SIZE)
}

/// Splits a buffer into TLB entries.
///
/// Huge buffers get one huge entry per huge page. Regular buffers are walked page by
/// page and a run of `pages_per_huge` pages that is virtually aligned and physically
/// contiguous and aligned is folded into one huge entry.
#[must_use]
pub fn plan(geos: &TlbGeometries, start_vpn: u64, phys: &[u64], huge: bool) -> Vec<MapSpan> {
    let pph = geos.pages_per_huge as usize;
    let mut spans = Vec::new();
    let mut i = 0;

    while i < phys.len() {
        let vpn = start_vpn + i as u64;
        let coalesce = huge || can_coalesce(geos, vpn, phys, i);
        let step = if coalesce { pph } else { 1 };
        spans.push(MapSpan {
            index: i,
            vpn,
            phys: phys[i],
            n_pages: step.min(phys.len() - i) as u64,
            order: if coalesce { TlbOrder::Huge } else { TlbOrder::Regular },
        });
        i += step;
    }
    spans
}

// ===============================================================================================
// Shadow Writer
// ===============================================================================================

/// Writes and invalidates TLB entries of one region.
pub struct TlbShadow {
    regs: Arc<dyn ShellRegisters>,
    geos: TlbGeometries,
    max_entries: usize,
}

impl std::fmt::Debug for TlbShadow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlbShadow")
            .field("geos", &self.geos)
            .field("max_entries", &self.max_entries)
            .finish_non_exhaustive()
    }
}

impl TlbShadow {
    #[must_use]
    pub fn new(regs: Arc<dyn ShellRegisters>, geos: TlbGeometries, max_entries: usize) -> Self {
        Self { regs, geos, max_entries }
    }

    #[must_use]
    pub const fn geometries(&self) -> &TlbGeometries {
        &self.geos
    }

    pub fn map(
        &self,
        geo: &TlbGeometry,
        vpn: u64,
        phys: u64,
        residency: Residency,
        ctid: u32,
        hpid: u32,
    ) {
        log::debug!(
            "tlb map: vpn 0x{vpn:x} -> 0x{phys:x} {residency:?} ctid {ctid} hpid {hpid} huge {}",
            geo.huge
        );
        self.regs.write_tlb(geo.order(), encode_map(geo, vpn, phys, residency, ctid, hpid));
    }

    pub fn unmap(&self, geo: &TlbGeometry, vpn: u64, hpid: u32) {
        log::debug!("tlb unmap: vpn 0x{vpn:x}, hpid {hpid}, huge {}", geo.huge);
        self.regs.write_tlb(geo.order(), encode_unmap(geo, vpn, hpid));
    }

    #[must_use]
    pub fn plan(&self, desc: &BufferDescriptor) -> Vec<MapSpan> {
        plan(&self.geos, desc.vpn, desc.phys(), desc.huge)
    }

    /// Writes at most `max_entries` of `spans` and returns how many were written.
    pub fn map_spans(&self, desc: &BufferDescriptor, spans: &[MapSpan]) -> usize {
        let n = spans.len().min(self.max_entries);
        for s in &spans[..n] {
            let geo = self.geos.get(s.order == TlbOrder::Huge);
            self.map(geo, s.vpn, s.phys, desc.residency, desc.ctid, desc.hpid);
        }
        n
    }

    /// Maps every entry of `desc` that touches `[vpn, vpn + n_pages)`.
    ///
    /// Entries come from the plan of the whole buffer, so a later
    /// [`unmap_buffer`](Self::unmap_buffer) always finds the same entries.
    pub fn map_buffer(&self, desc: &BufferDescriptor, vpn: u64, n_pages: u64) -> usize {
        let end = vpn + n_pages;
        let spans: Vec<MapSpan> = self
            .plan(desc)
            .into_iter()
            .filter(|s| s.vpn < end && s.end() > vpn)
            .collect();

        let mut done = 0;
        while done < spans.len() {
            done += self.map_spans(desc, &spans[done..]);
        }
        done
    }

    /// Clears every entry of `desc`, invalidates them and waits for the hardware.
    ///
    /// # Errors
    /// Returns [`MmuError::HardwareTimeout`](crate::error::MmuError::HardwareTimeout) if
    /// the invalidation is not acknowledged within `timeout`. The physical pages must
    /// not be reused in that case.
    pub fn unmap_buffer(
        &self,
        desc: &BufferDescriptor,
        signal: &CompletionSignal,
        timeout: Duration,
    ) -> MmuResult<()> {
        let spans = self.plan(desc);
        for s in &spans {
            self.unmap(self.geos.get(s.order == TlbOrder::Huge), s.vpn, desc.hpid);
        }

        let Some(last) = spans.len().checked_sub(1) else {
            return Ok(());
        };
        signal.clear();
        for (i, s) in spans.iter().enumerate() {
            self.regs.invalidate(&Invalidation {
                vpn: s.vpn,
                n_pages: s.n_pages,
                hpid: desc.hpid,
                last: i == last,
            });
        }
        signal.wait(timeout)
    }
}
