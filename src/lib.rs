//! Memory virtualization for vFPGA regions: a software-managed TLB, a card memory
//! allocator, host page pinning and host/card migration driven by page faults.

pub mod config;
pub mod context;
pub mod error;
pub mod hw;
pub mod mmu;
pub mod signal;
pub mod sim;
pub mod utils;
pub mod worker;

pub use config::{CardLayout, MmuConfig};
pub use context::{Region, Shell};
pub use error::{MmuError, MmuResult};
pub use mmu::{AccessKind, FaultStatus, RegionMmu, Residency};
