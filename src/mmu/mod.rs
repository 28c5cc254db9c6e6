//! Address translation and buffer residency for vFPGA regions.
//!
//! Leaves first: [`geometry`] and [`card`] have no dependencies on the rest of the
//! module, [`tlb`] writes entries for descriptors held by [`registry`], [`pin`] fills
//! descriptors, [`migrate`] moves their data and [`fault`] composes all of it.

pub mod card;
pub mod ctid;
pub mod fault;
pub mod geometry;
pub mod migrate;
pub mod pagemap;
pub mod pin;
pub mod registry;
pub mod tlb;

pub use card::{CardAllocator, SharedCardAllocator};
pub use ctid::CtidTable;
pub use fault::{FaultStatus, RegionMmu};
pub use geometry::{PageFaultDescriptor, TlbGeometries, TlbGeometry};
pub use migrate::MigrationEngine;
pub use pagemap::MlockPinner;
pub use pin::{HostPinner, PinnedPages, PinningManager};
pub use registry::{BufferDescriptor, BufferRegistry};
pub use tlb::{MapSpan, TlbShadow};

use crate::error::MmuError;

/// Where a buffer's authoritative copy lives. The same encoding is used for the
/// access kind of a page fault (the stream the vFPGA wants to reach it through).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Residency {
    Card = 0,
    Host = 1,
}

pub type AccessKind = Residency;

impl TryFrom<u32> for Residency {
    type Error = MmuError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Card),
            1 => Ok(Self::Host),
            other => Err(MmuError::InvalidAccessKind(other)),
        }
    }
}

impl Residency {
    /// The TLB stream bit.
    #[must_use]
    pub const fn stream_bit(self) -> u64 {
        self as u64
    }
}
