//! Threads, as seen by the semaphore subsystem
use core::fmt;

use crate::{
    inherit::BoostPolicy,
    klock::{CpuLockCell, CpuLockToken},
    utils::Init,
    KernelCfg1, PortScheduling,
};

/// *Thread control block* - the per-thread state this subsystem reads and
/// updates.
///
/// Holder entries store `&'static ThreadCb` references, but use them strictly
/// as look-up keys: a thread may exit while still holding semaphore counts,
/// after which its control block is logically stale even though the `static`
/// it lives in remains accessible. [`PortScheduling::verify_thread`] is
/// consulted before any priority or ledger access.
///
/// [`PortScheduling::verify_thread`]: crate::PortScheduling::verify_thread
#[repr(C)]
pub struct ThreadCb<
    Traits: PortScheduling,
    BoostData: 'static = <<Traits as KernelCfg1>::BoostPolicy as BoostPolicy<Traits>>::PerThreadData,
> {
    /// Port-owned state.
    ///
    /// This is guaranteed to be placed at the beginning of the struct so that
    /// port code can refer to this easily.
    pub port_thread_state: Traits::PortThreadState,

    /// The thread's base priority: its nominal, unboosted priority.
    pub(crate) base_priority: CpuLockCell<Traits, Traits::Priority>,

    /// The thread's effective priority. Never below `base_priority`;
    /// temporarily raised above it while the thread holds a semaphore count
    /// that a more urgent thread is waiting for.
    pub(crate) effective_priority: CpuLockCell<Traits, Traits::Priority>,

    /// Boost bookkeeping owned by the configured
    /// [`BoostPolicy`](crate::inherit::BoostPolicy).
    pub(crate) boosts: BoostData,
}

impl<Traits: PortScheduling, BoostData: Init + 'static> Init for ThreadCb<Traits, BoostData> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        port_thread_state: Init::INIT,
        base_priority: Init::INIT,
        effective_priority: Init::INIT,
        boosts: Init::INIT,
    };
}

impl<Traits: PortScheduling, BoostData: fmt::Debug + 'static> fmt::Debug
    for ThreadCb<Traits, BoostData>
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ThreadCb")
            .field("self", &(self as *const _))
            .field("port_thread_state", &self.port_thread_state)
            .field("base_priority", &self.base_priority)
            .field("effective_priority", &self.effective_priority)
            .field("boosts", &self.boosts)
            .finish()
    }
}

impl<Traits: PortScheduling> ThreadCb<Traits> {
    /// Get the thread's base priority.
    pub fn base_priority(&self, lock: &CpuLockToken<Traits>) -> Traits::Priority {
        self.base_priority.get(lock)
    }

    /// Get the thread's effective priority.
    pub fn effective_priority(&self, lock: &CpuLockToken<Traits>) -> Traits::Priority {
        self.effective_priority.get(lock)
    }

    /// Set the thread's base priority. Called by the port when a thread is
    /// created or reprioritized by the application.
    pub fn set_base_priority(&self, lock: &mut CpuLockToken<Traits>, priority: Traits::Priority) {
        self.base_priority.replace(lock, priority);
    }

    /// Set the thread's effective priority. Called by the port's
    /// `set_priority`/`reprioritize` implementations after it has updated its
    /// ready queue.
    pub fn set_effective_priority(
        &self,
        lock: &mut CpuLockToken<Traits>,
        priority: Traits::Priority,
    ) {
        self.effective_priority.replace(lock, priority);
    }
}
