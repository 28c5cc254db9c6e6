use crate::config::MmuConfig;
use crate::error::{MmuError, MmuResult};
use crate::hw::{IrqKind, ShellConfig, ShellRegisters};
use crate::mmu::card::{CardAllocator, SharedCardAllocator};
use crate::mmu::geometry::TlbGeometries;
use crate::mmu::pin::HostPinner;
use crate::mmu::RegionMmu;
use crate::worker::{self, FaultWorker};
use std::sync::{Arc, PoisonError};

// ===============================================================================================
// Context Structures
// ===============================================================================================

/// One vFPGA region: its MMU state and the worker serving its faults.
#[derive(Debug)]
pub struct Region {
    pub mmu: Arc<RegionMmu>,
    pub worker: FaultWorker,
}

impl Region {
    /// Entry point for the region's interrupt line.
    pub fn handle_interrupt(&self) -> IrqKind {
        worker::handle_interrupt(&self.mmu, &self.worker)
    }
}

/// The memory virtualization state of a whole shell.
#[derive(Debug)]
pub struct Shell {
    config: ShellConfig,
    geos: TlbGeometries,
    card: Option<SharedCardAllocator>,
    regions: Vec<Region>,
}

impl Shell {
    /// Builds every region of the shell, one register interface per region.
    ///
    /// # Errors
    /// Returns [`MmuError::InvalidConfig`] if either configuration is invalid, the card
    /// pools are not aligned to their page sizes, or the register count does not match
    /// the region count. Returns an I/O error if a worker thread cannot be started.
    pub fn new(
        config: ShellConfig,
        regs: Vec<Arc<dyn ShellRegisters>>,
        pinner: Arc<dyn HostPinner>,
        mmu_config: MmuConfig,
    ) -> MmuResult<Self> {
        config.validate()?;
        mmu_config.validate()?;
        if regs.len() != config.n_regions as usize {
            return Err(MmuError::InvalidConfig(format!(
                "{} register interfaces for {} regions",
                regs.len(),
                config.n_regions
            )));
        }

        let geos = TlbGeometries::from_shell(&config);
        if config.en_mem {
            mmu_config.card.validate(geos.large.page_shift)?;
        }
        let card = config
            .en_mem
            .then(|| CardAllocator::new(&mmu_config.card, &geos).shared());

        let regions = regs
            .into_iter()
            .zip(0u32..)
            .map(|(r, id)| {
                let mmu = Arc::new(RegionMmu::new(
                    id,
                    r,
                    geos,
                    pinner.clone(),
                    card.clone(),
                    &mmu_config,
                ));
                let worker = FaultWorker::spawn(mmu.clone())?;
                Ok(Region { mmu, worker })
            })
            .collect::<MmuResult<Vec<_>>>()?;

        log::info!(
            "shell up: {} regions, {} regular pages per huge page, card memory {}",
            regions.len(),
            geos.pages_per_huge,
            card.is_some()
        );
        Ok(Self { config, geos, card, regions })
    }

    /// # Errors
    /// Returns [`MmuError::InvalidRegion`] for an out-of-range id.
    pub fn region(&self, id: u32) -> MmuResult<&Region> {
        self.regions.get(id as usize).ok_or(MmuError::InvalidRegion(id))
    }

    #[must_use]
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    #[must_use]
    pub const fn config(&self) -> &ShellConfig {
        &self.config
    }

    #[must_use]
    pub const fn geometries(&self) -> &TlbGeometries {
        &self.geos
    }

    /// Free card chunks of one granularity, or `None` without card memory.
    #[must_use]
    pub fn card_free(&self, huge: bool) -> Option<usize> {
        self.card.as_ref().map(|c| {
            c.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .free_count(huge)
        })
    }
}
