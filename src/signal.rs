use crate::error::{MmuError, MmuResult};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// The hardware events a region worker may block on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Completion {
    /// All TLB invalidations up to the one flagged "last" have retired.
    Invalidate,
    /// A host to card DMA batch finished.
    Offload,
    /// A card to host DMA batch finished.
    Sync,
}

struct WaitGuard<'a>(&'a CompletionSignal);
impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.waiting.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A one-shot flag raised from interrupt context and consumed by a blocking waiter.
///
/// `raise` never blocks for longer than it takes to notify. `wait` first polls the
/// flag for a short while (completions are usually quick) and then sleeps on a
/// condition variable until the flag is raised or the timeout elapses.
#[derive(Debug)]
pub struct CompletionSignal {
    kind: Completion,
    raised: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
    waiting: AtomicU32,
}

impl CompletionSignal {
    const SPIN_ITERATIONS: u32 = 256;

    #[must_use]
    pub const fn new(kind: Completion) -> Self {
        Self {
            kind,
            raised: AtomicBool::new(false),
            lock: Mutex::new(()),
            cond: Condvar::new(),
            waiting: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> Completion {
        self.kind
    }

    /// Sets the flag and wakes any waiter.
    pub fn raise(&self) {
        self.raised.store(true, Ordering::Release);
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.cond.notify_all();
    }

    /// Drops a stale completion left over from an earlier batch.
    pub fn clear(&self) {
        self.raised.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }

    /// Number of threads currently blocked in [`wait`](Self::wait).
    #[must_use]
    pub fn waiters(&self) -> u32 {
        self.waiting.load(Ordering::Relaxed)
    }

    fn consume(&self) -> bool {
        self.raised
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Blocks until the flag is raised, then resets it.
    ///
    /// # Errors
    /// Returns [`MmuError::HardwareTimeout`] if the flag is not raised within `timeout`.
    pub fn wait(&self, timeout: Duration) -> MmuResult<()> {
        self.waiting.fetch_add(1, Ordering::Relaxed);
        let _wait_guard = WaitGuard(self);

        for _ in 0..Self::SPIN_ITERATIONS {
            if self.consume() {
                return Ok(());
            }
            std::hint::spin_loop();
        }

        let deadline = Instant::now() + timeout;
        let mut guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if self.consume() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                log::error!("timed out waiting for {:?} completion", self.kind);
                return Err(MmuError::HardwareTimeout(self.kind));
            }
            let (g, _) = self
                .cond
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            guard = g;
        }
    }
}

/// The completion flags owned by one region.
#[derive(Debug)]
pub struct RegionSignals {
    pub invalidate: CompletionSignal,
    pub offload: CompletionSignal,
    pub sync: CompletionSignal,
}

impl Default for RegionSignals {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionSignals {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            invalidate: CompletionSignal::new(Completion::Invalidate),
            offload: CompletionSignal::new(Completion::Offload),
            sync: CompletionSignal::new(Completion::Sync),
        }
    }

    #[must_use]
    pub const fn get(&self, kind: Completion) -> &CompletionSignal {
        match kind {
            Completion::Invalidate => &self.invalidate,
            Completion::Offload => &self.offload,
            Completion::Sync => &self.sync,
        }
    }
}
