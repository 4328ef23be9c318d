//! Semaphore holder tracking and priority inheritance for the Rivet RTOS
//! kernel.
//!
//! When a high-priority thread blocks on a counting semaphore whose counts
//! are held by lower-priority threads, the holders can be preempted by
//! unrelated middle-priority threads, leaving the high-priority waiter
//! blocked for an unbounded amount of time. This crate bounds that blocking
//! time by tracking, for every semaphore, the set of threads currently
//! holding counts on it ([`holder`]) and temporarily raising the holders'
//! scheduling priorities to that of the highest-priority waiter
//! ([`inherit`]).
//!
//! The counting semaphore operation itself (wait, post, poll) lives in the
//! semaphore layer, which drives this subsystem:
//!
//!  - The wait path calls [`holder::add_holder`] when a count is obtained
//!    immediately, [`holder::add_holder_tcb`] when a post hands a count to a
//!    woken waiter, and [`inherit::boost_priority`] right before the caller
//!    blocks.
//!  - The post path calls [`holder::release_holder`] followed by
//!    [`inherit::restore_baseprio`].
//!  - A waiter aborted by a signal is unwound with [`inherit::canceled`].
//!
//! # Priorities
//!
//! A numerically **greater** priority value denotes a **more urgent** thread.
//! Each thread carries a base priority (its nominal, unboosted priority) and
//! an effective priority which priority inheritance may raise above the base,
//! never below it.
//!
//! # Static configuration
//!
//! The kernel is instantiated over a "system" type implementing [`KernelCfg1`]
//! (priority type and storage/policy selection), [`PortScheduling`] (the
//! scheduler and CPU Lock primitives), and [`KernelCfg2`] (access to the
//! global [`State`]). Holder storage and boost bookkeeping are chosen at
//! compile time through associated types:
//!
//!  - [`holder::InlineHolders`] embeds two holder slots in every semaphore,
//!    which covers mutex-style usage; [`holder::PooledHolders`]`<N>` draws
//!    entries from a global pool of `N` preallocated nodes.
//!  - [`inherit::SingleBoost`] raises holders directly to the waiter's
//!    priority and relies on the scheduler to reconcile overlapping boosts;
//!    [`inherit::NestedBoost`]`<MAX_NEST>` keeps a per-thread ledger of up to
//!    `MAX_NEST` active boosts so that overlapping boosts from multiple
//!    semaphores unwind precisely.
//!
//! A kernel configured without priority inheritance simply does not link this
//! crate; per-semaphore opt-out is available through
//! [`SemaphoreFlags::PRIOINHERIT_DISABLE`].
//!
//! # Context requirements
//!
//! No function in this crate blocks, allocates, or performs I/O. Every entry
//! point that touches shared state requires interrupts to be disabled or the
//! scheduler to be locked; this is expressed by the
//! [`klock::CpuLockTokenRefMut`] parameter they take, which can only be
//! produced while CPU Lock is active. Raising or lowering a priority from
//! within these functions never causes an immediate context switch; the port
//! defers the switch until the caller releases the lock.
#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
use core::fmt;

pub mod error;
#[cfg(test)]
#[macro_use]
mod test_stub;
pub mod holder;
pub mod inherit;
pub mod klock;
pub mod semaphore;
pub mod thread;
pub mod utils;

pub use self::{
    semaphore::{SemaphoreCb, SemaphoreCount, SemaphoreFlags},
    thread::ThreadCb,
};
use self::utils::Init;

/// Associates "system" types with the static configuration of the kernel.
///
/// # Safety
///
/// The associated items configure storage shared by all semaphores and
/// threads of the system; they must be consistent with the control blocks the
/// port hands out (e.g. every [`ThreadCb`] and [`SemaphoreCb`] must be
/// instantiated for the same system type).
pub unsafe trait KernelCfg1: Sized + Send + Sync + 'static {
    /// Scheduling priority. A numerically greater value denotes a more urgent
    /// thread.
    type Priority: Copy + Ord + Send + Sync + fmt::Debug + Init + 'static;

    /// The storage regime for semaphore holder entries.
    type HolderStore: holder::Store<Self>;

    /// The bookkeeping policy used when boosting and restoring holder
    /// priorities.
    type BoostPolicy: inherit::BoostPolicy<Self>;
}

/// Implemented by a port. This trait contains the scheduler operations this
/// subsystem consumes, along with low-level control of the CPU Lock state.
///
/// # Safety
///
/// Implementing a port is inherently unsafe: the CPU Lock methods underpin
/// the token on which all of this subsystem's interior mutability relies, so
/// e.g. `try_enter_cpu_lock` returning `true` twice in a row without an
/// intervening `leave_cpu_lock` would forge aliasing [`klock::CpuLockToken`]s.
///
/// These methods are only meant to be called by the kernel.
#[allow(clippy::missing_safety_doc)]
pub unsafe trait PortScheduling: KernelCfg1 {
    /// Port-specific state embedded in every [`ThreadCb`].
    type PortThreadState: Send + Sync + Init + fmt::Debug + 'static;

    /// Disable all kernel-managed interrupts (this state is called *CPU
    /// Lock*) and return `true`, or return `false` if CPU Lock was already
    /// active.
    unsafe fn try_enter_cpu_lock() -> bool;

    /// Disable all kernel-managed interrupts.
    ///
    /// Precondition: CPU Lock inactive
    unsafe fn enter_cpu_lock();

    /// Re-enable kernel-managed interrupts previously disabled by
    /// `enter_cpu_lock`, thus deactivating the CPU Lock state.
    ///
    /// Precondition: CPU Lock active
    unsafe fn leave_cpu_lock();

    /// Return a flag indicating whether a CPU Lock state is active.
    fn is_cpu_lock_active() -> bool;

    /// Return a flag indicating whether the current context is an interrupt
    /// context.
    fn is_interrupt_context() -> bool;

    /// Get the currently running (or, in an interrupt context, interrupted)
    /// thread.
    fn running_thread() -> &'static ThreadCb<Self>;

    /// Return `true` iff `htcb` still refers to a live thread.
    ///
    /// Holder entries use thread control blocks strictly as look-up keys; a
    /// thread may exit while still holding counts, leaving stale handles
    /// behind. Every operation that is about to read or update a holder's
    /// priority checks the handle through this method first.
    fn verify_thread(htcb: &'static ThreadCb<Self>) -> bool;

    /// Raise or lower `htcb`'s effective priority to `priority`.
    ///
    /// If `htcb` is currently running, the scheduler marks it pending rather
    /// than preempting it; the context switch happens once the caller
    /// releases the scheduler lock.
    fn set_priority(
        lock: klock::CpuLockTokenRefMut<'_, Self>,
        htcb: &'static ThreadCb<Self>,
        priority: Self::Priority,
    );

    /// Drop `htcb`'s effective priority to `priority`, consulting any
    /// reprioritizations still pending from boosts on other semaphores.
    ///
    /// Only used by [`inherit::SingleBoost`]; [`inherit::NestedBoost`]
    /// reconciles overlapping boosts itself and calls [`Self::set_priority`]
    /// with the exact target value.
    fn reprioritize(
        lock: klock::CpuLockTokenRefMut<'_, Self>,
        htcb: &'static ThreadCb<Self>,
        priority: Self::Priority,
    );
}

/// Associates "system" types with the global kernel state.
///
/// # Safety
///
/// `state` must return the same instance every time.
pub unsafe trait KernelCfg2: PortScheduling + Sized {
    /// Access the kernel's global state.
    fn state() -> &'static State<Self>;
}

/// A combination of all the traits a fully configured system type implements.
pub trait KernelTraits: KernelCfg1 + PortScheduling + KernelCfg2 + 'static {}

impl<T: KernelCfg1 + PortScheduling + KernelCfg2 + 'static> KernelTraits for T {}

/// Global kernel state.
pub struct State<Traits: KernelCfg1> {
    /// Process-wide holder storage (the preallocated node pool in the pooled
    /// regime).
    pub(crate) holders: <<Traits as KernelCfg1>::HolderStore as holder::Store<Traits>>::GlobalData,
}

impl<Traits: KernelCfg1> Init for State<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        holders: Init::INIT,
    };
}

impl<Traits: KernelCfg1> fmt::Debug for State<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("State")
            .field("holders", &self.holders)
            .finish()
    }
}
