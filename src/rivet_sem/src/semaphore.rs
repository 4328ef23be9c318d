//! Semaphores, as seen by the holder-tracking subsystem
use core::fmt;

use crate::{
    holder::{self, Store},
    klock::{CpuLockCell, CpuLockTokenRefMut},
    utils::Init,
    KernelCfg1, KernelTraits, PortScheduling,
};

/// Signed semaphore count. A negative value is the number of threads waiting
/// for a count.
///
/// The count is owned and maintained by the semaphore layer; this subsystem
/// only inspects it in debug assertions.
pub type SemaphoreCount = i16;

bitflags::bitflags! {
    /// Per-semaphore flags.
    pub struct SemaphoreFlags: u8 {
        /// Disables priority inheritance for this semaphore. While set,
        /// holders are not tracked, so waiting on the semaphore never boosts
        /// anyone.
        const PRIOINHERIT_DISABLE = 1 << 0;
    }
}

impl Init for SemaphoreFlags {
    const INIT: Self = Self::empty();
}

/// *Semaphore control block* - the per-semaphore state used by the holder
/// tracking and priority inheritance machinery.
///
/// The holder storage embedded here (two inline slots or a list head,
/// depending on [`KernelCfg1::HolderStore`]) is touched only by this
/// subsystem and survives unrelated semaphore operations unchanged.
pub struct SemaphoreCb<
    Traits: PortScheduling,
    HolderData: 'static = <<Traits as KernelCfg1>::HolderStore as Store<Traits>>::PerSemData,
> {
    /// The semaphore's current count, maintained by the semaphore layer.
    pub value: CpuLockCell<Traits, SemaphoreCount>,

    /// Flags, settable through [`Self::set_priority_inheritance`].
    pub flags: CpuLockCell<Traits, SemaphoreFlags>,

    /// The set of threads currently holding counts on this semaphore.
    pub(crate) holders: HolderData,
}

impl<Traits: PortScheduling, HolderData: Init + 'static> Init for SemaphoreCb<Traits, HolderData> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        value: Init::INIT,
        flags: Init::INIT,
        holders: Init::INIT,
    };
}

impl<Traits: PortScheduling, HolderData: fmt::Debug + 'static> fmt::Debug
    for SemaphoreCb<Traits, HolderData>
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SemaphoreCb")
            .field("self", &(self as *const _))
            .field("value", &self.value)
            .field("flags", &self.flags)
            .field("holders", &self.holders)
            .finish()
    }
}

impl<Traits: KernelTraits> SemaphoreCb<Traits> {
    /// Enable or disable priority inheritance for this semaphore.
    ///
    /// Must not be called while the semaphore has live holders; flipping the
    /// flag at that point would strand their entries.
    pub fn set_priority_inheritance(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        enable: bool,
    ) {
        debug_assert!(!holder::has_holders(lock.borrow_mut(), self));

        let mut flags = self.flags.get(&*lock);
        flags.set(SemaphoreFlags::PRIOINHERIT_DISABLE, !enable);
        self.flags.replace(&mut *lock, flags);
    }
}
