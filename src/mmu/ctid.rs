#![allow(clippy::cast_possible_truncation)]

use crate::error::{MmuError, MmuResult};
use crate::hw::regs::N_CTID_MAX;

/// Maps the ctids of one region to the host processes that own them.
#[derive(Debug)]
pub struct CtidTable {
    owners: [Option<u32>; N_CTID_MAX],
    free: Vec<u32>,
}

impl Default for CtidTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CtidTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            owners: [None; N_CTID_MAX],
            free: (0..N_CTID_MAX as u32).rev().collect(),
        }
    }

    /// Binds the lowest free ctid to `hpid`.
    ///
    /// # Errors
    /// Returns [`MmuError::NoFreeCtid`] when every ctid is taken.
    pub fn register(&mut self, hpid: u32) -> MmuResult<u32> {
        let ctid = self.free.pop().ok_or(MmuError::NoFreeCtid)?;
        self.owners[ctid as usize] = Some(hpid);
        Ok(ctid)
    }

    /// Releases `ctid` and returns its former owner.
    ///
    /// # Errors
    /// Returns [`MmuError::InvalidCtid`] if `ctid` is not registered.
    pub fn unregister(&mut self, ctid: u32) -> MmuResult<u32> {
        let slot = self
            .owners
            .get_mut(ctid as usize)
            .ok_or(MmuError::InvalidCtid(ctid))?;
        let hpid = slot.take().ok_or(MmuError::InvalidCtid(ctid))?;
        self.free.push(ctid);
        Ok(hpid)
    }

    /// # Errors
    /// Returns [`MmuError::InvalidCtid`] if `ctid` is not registered.
    pub fn owner(&self, ctid: u32) -> MmuResult<u32> {
        self.owners
            .get(ctid as usize)
            .copied()
            .flatten()
            .ok_or(MmuError::InvalidCtid(ctid))
    }

    #[must_use]
    pub fn registered(&self) -> usize {
        N_CTID_MAX - self.free.len()
    }
}
