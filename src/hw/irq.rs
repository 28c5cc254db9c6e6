#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]

use crate::utils::{high_16, high_32, low_32};

/// Snapshot of the interrupt status registers of one region.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct IrqStatus {
    pub isr: u64,
    pub isr_pid: u64,
    pub isr_vaddr: u64,
    pub isr_len: u64,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IrqKind {
    OffloadDone,
    SyncDone,
    InvalidateDone,
    PageFault,
    Notify,
    Reconfig,
    Unknown(u16),
}

/// A page fault raised by the vFPGA MMU, as decoded from the status registers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FaultRequest {
    pub vaddr: u64,
    pub len: u64,
    pub ctid: u32,
    /// Raw stream field: 0 for card access, 1 for host access.
    pub stream: u32,
    pub write: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Notification {
    pub ctid: u32,
    pub value: i32,
}

impl IrqStatus {
    #[must_use]
    pub const fn kind(&self) -> IrqKind {
        match high_16(low_32(self.isr)) {
            0 => IrqKind::OffloadDone,
            1 => IrqKind::SyncDone,
            2 => IrqKind::InvalidateDone,
            3 => IrqKind::PageFault,
            4 => IrqKind::Notify,
            5 => IrqKind::Reconfig,
            other => IrqKind::Unknown(other),
        }
    }

    #[must_use]
    pub const fn fault(&self) -> FaultRequest {
        let hi = high_16(high_32(self.isr));
        FaultRequest {
            vaddr: self.isr_vaddr,
            len: low_32(self.isr_len) as u64,
            ctid: low_32(self.isr_pid),
            stream: (hi & 0x3) as u32,
            write: (hi >> 8) != 0,
        }
    }

    #[must_use]
    pub const fn notification(&self) -> Notification {
        Notification {
            ctid: low_32(self.isr_pid),
            value: high_32(self.isr_len) as i32,
        }
    }
}
