use crate::signal::Completion;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MmuError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid range: vaddr 0x{vaddr:x}, len {len}")]
    InvalidRange { vaddr: u64, len: u64 },

    #[error("Pinning failed: requested {requested} pages, obtained {obtained}")]
    PinningFailed { requested: usize, obtained: usize },

    #[error("Out of card memory: requested {requested} chunks, {available} available")]
    OutOfMemory { requested: usize, available: usize },

    #[error("Invalid access kind: {0}")]
    InvalidAccessKind(u32),

    #[error("Hardware did not signal {0:?} completion in time")]
    HardwareTimeout(Completion),

    #[error("Card chunk at 0x{0:x} is already free")]
    DoubleFree(u64),

    #[error("Address 0x{0:x} is not inside the card memory pool")]
    InvalidCardAddress(u64),

    #[error("Card memory is not enabled on this shell")]
    CardMemoryDisabled,

    #[error("No buffer mapped at 0x{vaddr:x} for ctid {ctid}")]
    NotMapped { vaddr: u64, ctid: u32 },

    #[error("Invalid ctid: {0}")]
    InvalidCtid(u32),

    #[error("No free ctid left in the region")]
    NoFreeCtid,

    #[error("Invalid region ID: {0}")]
    InvalidRegion(u32),

    #[error("Invalid shell configuration: {0}")]
    InvalidConfig(String),
}

// A convenient alias
pub type MmuResult<T> = Result<T, MmuError>;
