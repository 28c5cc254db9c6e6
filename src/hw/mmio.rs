use super::regs::{
    IRQ_CLR_PENDING, IRQ_CTRL_KEEP_MASK, IRQ_INVLDT, IRQ_INVLDT_LAST, IRQ_LOCK, IRQ_PF_RD_DROP,
    IRQ_PF_RD_SUCCESS, IRQ_PF_WR_DROP, IRQ_PF_WR_SUCCESS, VFPGA_CTRL_CNFG_OFFS,
    VFPGA_CTRL_LTLB_OFFS, VFPGA_CTRL_SIZE, VFPGA_CTRL_STLB_OFFS, VfpgaCnfgRegs,
};
use super::{DmaCommand, DmaDirection, Invalidation, IrqStatus, ShellRegisters, TlbOrder};
use crate::error::MmuResult;
use crate::utils::PAGE_SHIFT;
use std::fs::OpenOptions;
use std::io;
use std::mem::offset_of;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr;
use std::sync::{Mutex, PoisonError};

macro_rules! cnfg {
    ($field:ident) => {
        VFPGA_CTRL_CNFG_OFFS + offset_of!(VfpgaCnfgRegs, $field)
    };
}

/// Register access through a memory-mapped control window of one region.
///
/// The window is mapped from a PCI resource file (e.g.
/// `/sys/bus/pci/devices/<bdf>/resource2`), one [`VFPGA_CTRL_SIZE`] slice per region.
#[derive(Debug)]
pub struct MmioShell {
    base: *mut u8,
    region: u32,
    /// Serializes multi-register sequences and `isr` read-modify-writes.
    ctrl_lock: Mutex<()>,
}

// The mapping is device memory; all access goes through volatile ops under `ctrl_lock`.
unsafe impl Send for MmioShell {}
unsafe impl Sync for MmioShell {}

impl MmioShell {
    /// Maps the control window of `region` from `path`.
    ///
    /// # Errors
    /// Returns an error if the resource file cannot be opened or mapped.
    pub fn open(path: impl AsRef<Path>, region: u32) -> MmuResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
        let offset = region as usize * VFPGA_CTRL_SIZE;

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                VFPGA_CTRL_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                offset as libc::off_t,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }

        log::info!(
            "vFPGA {region}: control window mapped from {} at offset 0x{offset:x}",
            path.as_ref().display()
        );

        Ok(Self {
            base: base.cast(),
            region,
            ctrl_lock: Mutex::new(()),
        })
    }

    #[must_use]
    pub const fn region(&self) -> u32 {
        self.region
    }

    fn read(&self, offset: usize) -> u64 {
        debug_assert!(offset + 8 <= VFPGA_CTRL_SIZE);
        unsafe { ptr::read_volatile(self.base.add(offset).cast::<u64>()) }
    }

    fn write(&self, offset: usize, value: u64) {
        debug_assert!(offset + 8 <= VFPGA_CTRL_SIZE);
        unsafe { ptr::write_volatile(self.base.add(offset).cast::<u64>(), value) }
    }

    fn isr_ctrl(&self, code: u64) {
        let isr = self.read(cnfg!(isr));
        self.write(cnfg!(isr), (isr & IRQ_CTRL_KEEP_MASK) | code);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.ctrl_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pf_reply(&self, ctid: u32, code: u64) {
        let _g = self.lock();
        self.write(cnfg!(isr_pid), u64::from(ctid));
        self.isr_ctrl(code);
    }
}

impl ShellRegisters for MmioShell {
    fn write_tlb(&self, order: TlbOrder, entry: [u64; 2]) {
        let port = match order {
            TlbOrder::Huge => VFPGA_CTRL_LTLB_OFFS,
            TlbOrder::Regular => VFPGA_CTRL_STLB_OFFS,
        };
        let _g = self.lock();
        self.write(port, entry[0]);
        self.write(port + 8, entry[1]);
    }

    fn invalidate(&self, inv: &Invalidation) {
        let _g = self.lock();
        self.write(cnfg!(isr_pid), u64::from(inv.hpid) << 32);
        self.write(cnfg!(isr_vaddr), inv.vpn << PAGE_SHIFT);
        self.write(cnfg!(isr_len), inv.n_pages << PAGE_SHIFT);
        self.isr_ctrl(if inv.last { IRQ_INVLDT_LAST } else { IRQ_INVLDT });
    }

    fn dma_issue(&self, dir: DmaDirection, cmd: &DmaCommand) {
        let (host, card, ctrl) = match dir {
            DmaDirection::Offload => {
                (cnfg!(offl_host_offs), cnfg!(offl_card_offs), cnfg!(offl_ctrl))
            }
            DmaDirection::Sync => (cnfg!(sync_host_offs), cnfg!(sync_card_offs), cnfg!(sync_ctrl)),
        };
        let _g = self.lock();
        self.write(host, cmd.host_addr);
        self.write(card, cmd.card_addr);
        self.write(ctrl, cmd.ctrl_word());
    }

    #[allow(clippy::cast_possible_truncation)]
    fn dma_outstanding(&self, dir: DmaDirection) -> u32 {
        let ctrl = match dir {
            DmaDirection::Offload => cnfg!(offl_ctrl),
            DmaDirection::Sync => cnfg!(sync_ctrl),
        };
        self.read(ctrl) as u32
    }

    fn restart_mmu(&self, write: bool, ctid: u32) {
        self.pf_reply(ctid, if write { IRQ_PF_WR_SUCCESS } else { IRQ_PF_RD_SUCCESS });
    }

    fn drop_fault(&self, write: bool, ctid: u32) {
        self.pf_reply(ctid, if write { IRQ_PF_WR_DROP } else { IRQ_PF_RD_DROP });
    }

    fn change_tlb_lock(&self) {
        let _g = self.lock();
        self.isr_ctrl(IRQ_LOCK);
    }

    fn read_irq(&self) -> IrqStatus {
        let _g = self.lock();
        IrqStatus {
            isr: self.read(cnfg!(isr)),
            isr_pid: self.read(cnfg!(isr_pid)),
            isr_vaddr: self.read(cnfg!(isr_vaddr)),
            isr_len: self.read(cnfg!(isr_len)),
        }
    }

    fn clear_irq(&self) {
        let _g = self.lock();
        self.isr_ctrl(IRQ_CLR_PENDING);
    }
}

impl Drop for MmioShell {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.cast(), VFPGA_CTRL_SIZE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn backing_file(tag: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!(
            "vfpga-mmio-{tag}-{}",
            std::process::id()
        ));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&vec![0u8; 2 * VFPGA_CTRL_SIZE]).unwrap();
        path
    }

    #[test]
    fn writes_land_at_register_offsets() {
        let path = backing_file("offsets");
        let shell = MmioShell::open(&path, 1).unwrap();

        shell.write_tlb(TlbOrder::Regular, [0x11, 0x22]);
        shell.write_tlb(TlbOrder::Huge, [0x33, 0x44]);
        shell.dma_issue(
            DmaDirection::Sync,
            &DmaCommand { host_addr: 0x1000, card_addr: 0x2000, len: 4096, last: true },
        );
        shell.invalidate(&Invalidation { vpn: 0x10, n_pages: 2, hpid: 9, last: false });

        assert_eq!(shell.read(VFPGA_CTRL_STLB_OFFS), 0x11);
        assert_eq!(shell.read(VFPGA_CTRL_STLB_OFFS + 8), 0x22);
        assert_eq!(shell.read(VFPGA_CTRL_LTLB_OFFS + 8), 0x44);
        assert_eq!(shell.read(cnfg!(sync_card_offs)), 0x2000);
        assert_eq!(shell.read(cnfg!(sync_ctrl)), (4096_u64 << 32) | 0x7);
        assert_eq!(shell.read(cnfg!(isr_pid)), 9_u64 << 32);
        assert_eq!(shell.read(cnfg!(isr_vaddr)), 0x10000);
        assert_eq!(shell.read(cnfg!(isr_len)), 0x2000);
        assert_eq!(shell.read(cnfg!(isr)), IRQ_INVLDT);

        drop(shell);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn control_writes_keep_upper_isr_bits() {
        let path = backing_file("isr");
        let shell = MmioShell::open(&path, 0).unwrap();

        shell.write(cnfg!(isr), 0xabcd_0000_0003_00ff);
        shell.restart_mmu(true, 5);
        assert_eq!(shell.read(cnfg!(isr)), 0xabcd_0000_0003_0000 | IRQ_PF_WR_SUCCESS);
        assert_eq!(shell.read(cnfg!(isr_pid)), 5);

        shell.clear_irq();
        assert_eq!(shell.read(cnfg!(isr)), 0xabcd_0000_0003_0000 | IRQ_CLR_PENDING);

        drop(shell);
        std::fs::remove_file(path).unwrap();
    }
}
