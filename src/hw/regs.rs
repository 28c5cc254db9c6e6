#![allow(clippy::cast_possible_truncation)]

use crate::error::{MmuError, MmuResult};
use crate::utils::PAGE_SHIFT;
use std::mem::{offset_of, size_of};

// ===============================================================================================
// TLB Entry Layout
// ===============================================================================================

/// Width of the ctid field in a TLB entry.
pub const PID_SIZE: u32 = 6;
/// Width of the stream (residency) field in a TLB entry.
pub const STRM_SIZE: u32 = 2;
/// Virtual address bits translated by the TLB.
pub const TLB_VADDR_RANGE: u32 = 48;
/// Physical address bits a TLB entry can hold.
pub const TLB_PADDR_RANGE: u32 = 44;

pub const N_CTID_MAX: usize = 1 << PID_SIZE;
pub const MAX_N_REGIONS: u32 = 16;

// ===============================================================================================
// Control Window
// ===============================================================================================

pub const VFPGA_CTRL_SIZE: usize = 256 * 1024;
pub const VFPGA_CTRL_LTLB_OFFS: usize = 0x0;
pub const VFPGA_CTRL_STLB_OFFS: usize = 0x1_0000;
pub const VFPGA_CTRL_CNFG_OFFS: usize = 0x3_0000;

// Codes written into the low half of `isr`.
pub const IRQ_CLR_PENDING: u64 = 0x1;
pub const IRQ_PF_RD_DROP: u64 = 0x2;
pub const IRQ_PF_WR_DROP: u64 = 0x4;
pub const IRQ_PF_RD_SUCCESS: u64 = 0xa;
pub const IRQ_PF_WR_SUCCESS: u64 = 0xc;
pub const IRQ_INVLDT: u64 = 0x10;
pub const IRQ_INVLDT_LAST: u64 = 0x30;
pub const IRQ_LOCK: u64 = 0x50;

/// Bits of `isr` left untouched by a control write.
pub const IRQ_CTRL_KEEP_MASK: u64 = !0xffff;

pub const DMA_CTRL_START_MIDDLE: u64 = 0x1;
pub const DMA_CTRL_START_LAST: u64 = 0x7;

/// Per-region configuration block at [`VFPGA_CTRL_CNFG_OFFS`].
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct VfpgaCnfgRegs {
    pub ctrl: u64,
    pub vaddr_rd: u64,
    pub ctrl_2: u64,
    pub vaddr_wr: u64,
    pub isr: u64,
    pub isr_pid: u64,
    pub isr_vaddr: u64,
    pub isr_len: u64,
    pub stat_sent: [u64; 4],
    pub stat_irq: [u64; 4],
    pub wback: [u64; 4],
    pub offl_ctrl: u64,
    pub offl_host_offs: u64,
    pub offl_card_offs: u64,
    pub offl_len: u64,
    pub offl_stat: u64,
    pub rsrvd_0: [u64; 3],
    pub sync_ctrl: u64,
    pub sync_host_offs: u64,
    pub sync_card_offs: u64,
    pub sync_len: u64,
    pub sync_stat: u64,
}

const _: () = assert!(offset_of!(VfpgaCnfgRegs, isr) == 0x20);
const _: () = assert!(offset_of!(VfpgaCnfgRegs, isr_len) == 0x38);
const _: () = assert!(offset_of!(VfpgaCnfgRegs, offl_ctrl) == 0xa0);
const _: () = assert!(offset_of!(VfpgaCnfgRegs, sync_ctrl) == 0xe0);
const _: () = assert!(size_of::<VfpgaCnfgRegs>() == 0x108);

// ===============================================================================================
// Shell Configuration
// ===============================================================================================

/// Raw parameters of one TLB order as reported by the shell.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct TlbParams {
    /// log2 of the number of sets (the key width).
    pub order: u32,
    pub assoc: u32,
    pub page_shift: u32,
}

/// Static shell configuration, read once when the shell comes up.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ShellConfig {
    pub n_regions: u32,
    pub small: TlbParams,
    pub large: TlbParams,
    /// Host streams are wired.
    pub en_strm: bool,
    /// On-card memory is present.
    pub en_mem: bool,
}

const fn field(word: u64, mask: u64, shift: u32) -> u32 {
    ((word & mask) >> shift) as u32
}

impl ShellConfig {
    /// Decodes the `ctrl_cnfg` and `mem_cnfg` words of the static configuration block.
    ///
    /// # Errors
    /// Returns [`MmuError::InvalidConfig`] if the decoded geometry cannot be served.
    pub fn from_raw(n_regions: u32, ctrl_cnfg: u64, mem_cnfg: u64) -> MmuResult<Self> {
        let cfg = Self {
            n_regions,
            small: TlbParams {
                order: field(ctrl_cnfg, 0xf0, 4),
                assoc: field(ctrl_cnfg, 0xf00, 8),
                page_shift: field(ctrl_cnfg, 0x3f0_0000, 20),
            },
            large: TlbParams {
                order: field(ctrl_cnfg, 0xf000, 12),
                assoc: field(ctrl_cnfg, 0xf_0000, 16),
                page_shift: field(ctrl_cnfg, 0xfc00_0000, 26),
            },
            en_strm: mem_cnfg & 0x1 != 0,
            en_mem: mem_cnfg & 0x2 != 0,
        };
        cfg.validate()?;
        log::info!(
            "shell: {} regions, stlb order {} shift {}, ltlb order {} shift {}, strm {}, mem {}",
            cfg.n_regions,
            cfg.small.order,
            cfg.small.page_shift,
            cfg.large.order,
            cfg.large.page_shift,
            cfg.en_strm,
            cfg.en_mem
        );
        Ok(cfg)
    }

    /// Checks that both TLB orders fit the translation ranges.
    ///
    /// # Errors
    /// Returns [`MmuError::InvalidConfig`] describing the first violated constraint.
    pub fn validate(&self) -> MmuResult<()> {
        if self.n_regions == 0 || self.n_regions > MAX_N_REGIONS {
            return Err(MmuError::InvalidConfig(format!(
                "region count {} outside 1..={MAX_N_REGIONS}",
                self.n_regions
            )));
        }
        if self.small.page_shift != PAGE_SHIFT {
            return Err(MmuError::InvalidConfig(format!(
                "small TLB page shift {} does not match host page shift {PAGE_SHIFT}",
                self.small.page_shift
            )));
        }
        if self.large.page_shift <= self.small.page_shift
            || self.large.page_shift >= TLB_PADDR_RANGE
        {
            return Err(MmuError::InvalidConfig(format!(
                "large TLB page shift {} not in {}..{TLB_PADDR_RANGE}",
                self.large.page_shift,
                self.small.page_shift + 1
            )));
        }
        for p in [self.small, self.large] {
            if p.order + p.page_shift >= TLB_VADDR_RANGE {
                return Err(MmuError::InvalidConfig(format!(
                    "TLB order {} leaves no tag bits at page shift {}",
                    p.order, p.page_shift
                )));
            }
        }
        Ok(())
    }
}
