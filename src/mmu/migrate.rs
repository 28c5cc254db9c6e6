use super::registry::BufferDescriptor;
use crate::config::MmuConfig;
use crate::error::{MmuError, MmuResult};
use crate::hw::{DmaCommand, DmaDirection, ShellRegisters};
use crate::signal::{Completion, RegionSignals};
use crate::utils::PAGE_SIZE;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Builds the DMA commands moving `desc` in one direction.
///
/// Regular buffers move one page per command; huge buffers move `group_pages` pages
/// per command. Pages without a resolved host or card address are skipped. The final
/// command of the list is flagged last.
#[must_use]
pub fn commands(desc: &BufferDescriptor, group_pages: usize) -> Vec<DmaCommand> {
    let step = if desc.huge { group_pages.max(1) } else { 1 };
    let len = step as u64 * PAGE_SIZE;

    let mut cmds: Vec<DmaCommand> = desc
        .host_phys
        .iter()
        .zip(&desc.card_phys)
        .step_by(step)
        .filter(|&(&h, &c)| h != 0 && c != 0)
        .map(|(&host_addr, &card_addr)| DmaCommand {
            host_addr,
            card_addr,
            len,
            last: false,
        })
        .collect();
    if let Some(last) = cmds.last_mut() {
        last.last = true;
    }
    cmds
}

/// Moves buffers between host and card memory for one region.
///
/// At most one offload and one sync run at a time.
pub struct MigrationEngine {
    regs: Arc<dyn ShellRegisters>,
    signals: Arc<RegionSignals>,
    offload_lock: Mutex<()>,
    sync_lock: Mutex<()>,
    threshold: u32,
    sleep_min: Duration,
    sleep_max: Duration,
    group_pages: usize,
    timeout: Duration,
}

impl std::fmt::Debug for MigrationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationEngine")
            .field("threshold", &self.threshold)
            .field("group_pages", &self.group_pages)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl MigrationEngine {
    #[must_use]
    pub fn new(
        regs: Arc<dyn ShellRegisters>,
        signals: Arc<RegionSignals>,
        cfg: &MmuConfig,
    ) -> Self {
        Self {
            regs,
            signals,
            offload_lock: Mutex::new(()),
            sync_lock: Mutex::new(()),
            threshold: cfg.dma_threshold,
            sleep_min: cfg.dma_sleep_min,
            sleep_max: cfg.dma_sleep_max,
            group_pages: cfg.dma_group_pages,
            timeout: cfg.completion_timeout,
        }
    }

    /// Copies `desc` from host to card memory and waits for completion.
    /// Returns the number of DMA commands issued.
    ///
    /// # Errors
    /// - [`MmuError::CardMemoryDisabled`] if the buffer has no card pages.
    /// - [`MmuError::HardwareTimeout`] if the engine does not finish in time.
    pub fn offload(&self, desc: &BufferDescriptor) -> MmuResult<usize> {
        self.transfer(DmaDirection::Offload, desc)
    }

    /// Copies `desc` from card to host memory and waits for completion.
    ///
    /// # Errors
    /// Same as [`offload`](Self::offload).
    pub fn sync(&self, desc: &BufferDescriptor) -> MmuResult<usize> {
        self.transfer(DmaDirection::Sync, desc)
    }

    fn transfer(&self, dir: DmaDirection, desc: &BufferDescriptor) -> MmuResult<usize> {
        if desc.card_phys.is_empty() {
            return Err(MmuError::CardMemoryDisabled);
        }
        let (lock, completion) = match dir {
            DmaDirection::Offload => (&self.offload_lock, Completion::Offload),
            DmaDirection::Sync => (&self.sync_lock, Completion::Sync),
        };
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let cmds = commands(desc, self.group_pages);
        if cmds.is_empty() {
            return Ok(0);
        }

        let signal = self.signals.get(completion);
        signal.clear();

        // Bounds the time without progress, not the whole batch.
        let mut deadline = Instant::now() + self.timeout;
        let mut sent = 0;
        for cmd in &cmds {
            while sent >= self.threshold {
                if Instant::now() >= deadline {
                    log::error!("{dir:?}: DMA engine stuck with {sent} commands outstanding");
                    return Err(MmuError::HardwareTimeout(completion));
                }
                thread::sleep(self.poll_interval());
                let outstanding = self.regs.dma_outstanding(dir);
                if outstanding < sent {
                    deadline = Instant::now() + self.timeout;
                }
                sent = outstanding;
            }

            log::debug!(
                "{dir:?}: host 0x{:x} <-> card 0x{:x}, len {}, last {}",
                cmd.host_addr,
                cmd.card_addr,
                cmd.len,
                cmd.last
            );
            self.regs.dma_issue(dir, cmd);
            sent += 1;
        }

        signal.wait(self.timeout)?;
        log::debug!(
            "{dir:?}: [0x{:x}, +{} pages) done in {} commands",
            desc.vpn,
            desc.n_pages,
            cmds.len()
        );
        Ok(cmds.len())
    }

    /// A random sleep in `[sleep_min, sleep_max]`.
    fn poll_interval(&self) -> Duration {
        let span = self.sleep_max.saturating_sub(self.sleep_min).as_micros();
        let mut buf = [0u8; 4];
        if span == 0 || getrandom::fill(&mut buf).is_err() {
            return self.sleep_min;
        }
        let r = u128::from(u32::from_ne_bytes(buf)) % (span + 1);
        self.sleep_min + Duration::from_micros(u64::try_from(r).unwrap_or_default())
    }
}
