use super::Residency;
use super::geometry::PageFaultDescriptor;
use std::collections::{BTreeMap, HashMap};

/// A pinned user buffer and where its pages live.
///
/// `vpn` and `n_pages` are in regular-page units and never change once the
/// descriptor exists. `host_phys` holds one address per regular page; `card_phys`
/// does too when card memory is enabled (huge chunks are expanded per page) and
/// is empty otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub vpn: u64,
    pub n_pages: u64,
    pub ctid: u32,
    /// Owning host process.
    pub hpid: u32,
    pub huge: bool,
    pub residency: Residency,
    pub host_phys: Vec<u64>,
    pub card_phys: Vec<u64>,
    /// The pinned pages are not coherent with the device.
    pub needs_explicit_sync: bool,
}

impl BufferDescriptor {
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.vpn + self.n_pages
    }

    #[must_use]
    pub const fn contains(&self, vpn: u64) -> bool {
        vpn >= self.vpn && vpn < self.end()
    }

    /// Physical addresses for the current residency.
    #[must_use]
    pub fn phys(&self) -> &[u64] {
        match self.residency {
            Residency::Host => &self.host_phys,
            Residency::Card => &self.card_phys,
        }
    }
}

/// Buffers of one region, bucketed by ctid and ordered by start page.
///
/// Descriptors within a bucket never overlap: a fault reaching into an existing
/// buffer is narrowed to the uncovered prefix before anything is pinned.
#[derive(Debug, Default)]
pub struct BufferRegistry {
    buckets: HashMap<u32, BTreeMap<u64, BufferDescriptor>>,
}

impl BufferRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up the buffer serving `pf`, narrowing `pf.n_pages` as a side effect.
    ///
    /// - If a buffer contains `pf.vpn`, it is returned and `pf` is clamped to its end.
    /// - Otherwise, if the nearest buffer starting after `pf.vpn` begins inside the
    ///   fault, `pf` is narrowed to the pages before it and `None` is returned.
    /// - Otherwise `pf` is left as is.
    pub fn map_present(&self, pf: &mut PageFaultDescriptor) -> Option<&BufferDescriptor> {
        let bucket = self.buckets.get(&pf.ctid)?;

        if let Some((_, d)) = bucket.range(..=pf.vpn).next_back()
            && d.contains(pf.vpn)
        {
            pf.n_pages = pf.n_pages.min(d.end() - pf.vpn);
            return Some(d);
        }

        if let Some((&start, _)) = bucket.range(pf.vpn..).next()
            && start < pf.end()
        {
            pf.n_pages = start - pf.vpn;
        }
        None
    }

    pub fn insert(&mut self, desc: BufferDescriptor) {
        log::debug!(
            "registry: ctid {} += [0x{:x}, 0x{:x}) huge {}",
            desc.ctid,
            desc.vpn,
            desc.end(),
            desc.huge
        );
        self.buckets.entry(desc.ctid).or_default().insert(desc.vpn, desc);
    }

    #[must_use]
    pub fn get(&self, ctid: u32, vpn: u64) -> Option<&BufferDescriptor> {
        self.buckets.get(&ctid)?.get(&vpn)
    }

    pub fn get_mut(&mut self, ctid: u32, vpn: u64) -> Option<&mut BufferDescriptor> {
        self.buckets.get_mut(&ctid)?.get_mut(&vpn)
    }

    pub fn remove(&mut self, ctid: u32, vpn: u64) -> Option<BufferDescriptor> {
        let bucket = self.buckets.get_mut(&ctid)?;
        let desc = bucket.remove(&vpn);
        if bucket.is_empty() {
            self.buckets.remove(&ctid);
        }
        desc
    }

    /// Start page of the buffer containing `vpn`.
    #[must_use]
    pub fn find(&self, ctid: u32, vpn: u64) -> Option<u64> {
        let (&start, d) = self.buckets.get(&ctid)?.range(..=vpn).next_back()?;
        d.contains(vpn).then_some(start)
    }

    /// Start pages of every buffer intersecting `[vpn, vpn + n_pages)`, in order.
    #[must_use]
    pub fn covering(&self, ctid: u32, vpn: u64, n_pages: u64) -> Vec<u64> {
        let Some(bucket) = self.buckets.get(&ctid) else {
            return Vec::new();
        };
        let end = vpn.saturating_add(n_pages);
        let first = self.find(ctid, vpn).unwrap_or(vpn);
        bucket.range(first..end).map(|(&start, _)| start).collect()
    }

    /// Start pages of every buffer owned by `ctid`.
    #[must_use]
    pub fn keys(&self, ctid: u32) -> Vec<u64> {
        self.buckets
            .get(&ctid)
            .map(|b| b.keys().copied().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.values().map(BTreeMap::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
