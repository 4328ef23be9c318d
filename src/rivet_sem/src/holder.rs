//! Semaphore holder tracking
//!
//! Every semaphore tracks the set of threads currently holding one or more of
//! its counts, so that the boost and restore engines in [`crate::inherit`]
//! know whose priority to adjust. Entries are maintained by the wait path
//! ([`add_holder`], [`add_holder_tcb`]) and the post path
//! ([`release_holder`]); a spent entry is freed by the restore engine rather
//! than by `release_holder` itself, because the restore still needs to
//! observe the zero count on the running thread.
//!
//! Two storage regimes implement the same contract behind the [`Store`]
//! trait:
//!
//!  - [`InlineHolders`]: two slots embedded in every [`SemaphoreCb`].
//!    Sufficient for the common case where semaphores implement mutexes or
//!    simple producer/consumer hand-offs.
//!  - [`PooledHolders`]`<N>`: a singly linked list rooted in the semaphore,
//!    with nodes drawn from a process-wide free list of `N` preallocated
//!    nodes built by [`initialize_holders`].
//!
//! All functions in this module require interrupts to be disabled or the
//! scheduler to be locked, witnessed by the `CpuLockTokenRefMut` parameter.
use core::{fmt, ops::ControlFlow, ptr};

use crate::{
    klock::{CpuLockCell, CpuLockTokenRefMut},
    semaphore::{SemaphoreCb, SemaphoreFlags},
    thread::ThreadCb,
    utils::Init,
    KernelCfg1, KernelCfg2, KernelTraits, PortScheduling,
};

/// The number of counts a holder entry tracks.
pub type HolderCount = u16;

/// A holder entry: the holding thread and the number of counts it holds.
///
/// A slot whose `htcb` is `None` is free. `counts` may transiently be zero on
/// a live slot between `release_holder` and the restore that frees it.
pub struct HolderSlot<Traits: PortScheduling> {
    pub(crate) htcb: CpuLockCell<Traits, Option<&'static ThreadCb<Traits>>>,
    pub(crate) counts: CpuLockCell<Traits, HolderCount>,
}

impl<Traits: PortScheduling> Init for HolderSlot<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        htcb: Init::INIT,
        counts: Init::INIT,
    };
}

impl<Traits: PortScheduling> fmt::Debug for HolderSlot<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HolderSlot")
            .field("htcb", &self.htcb.debug_as_ptr())
            .field("counts", &self.counts)
            .finish()
    }
}

/// Storage regime for holder entries.
///
/// This trait is not intended to be implemented on custom types.
pub trait Store<Traits>: Send + Sync + 'static + private::Sealed {
    /// Per-semaphore holder storage, embedded in [`SemaphoreCb`].
    type PerSemData: Send + Sync + fmt::Debug + Init + 'static;

    /// Process-wide holder storage, held in [`State`](crate::State).
    type GlobalData: Send + Sync + fmt::Debug + Init + 'static;

    /// Whether the running thread's spent entry must be released before the
    /// thread's own reprioritization during a task-context restore. Required
    /// when the per-semaphore capacity is so small that an `add_holder`
    /// triggered by a context switch inside `set_priority` could otherwise
    /// find the store full.
    const RECLAIM_BEFORE_SELF_RESTORE: bool;

    /// Set up the process-wide storage. Called once at boot, before any other
    /// operation in this module.
    fn initialize(lock: CpuLockTokenRefMut<'_, Traits>)
    where
        Traits: KernelTraits;

    /// Find the live entry for `htcb` on `sem`, if any.
    ///
    /// `htcb` is used only as a look-up key and is not dereferenced.
    fn find(
        lock: CpuLockTokenRefMut<'_, Traits>,
        sem: &'static SemaphoreCb<Traits>,
        htcb: &'static ThreadCb<Traits>,
    ) -> Option<&'static HolderSlot<Traits>>
    where
        Traits: KernelTraits;

    /// Allocate a fresh entry for `sem` with `counts` zeroed, or log an error
    /// and return `None` when the storage is exhausted. Callers treat failure
    /// as "priority inheritance silently skipped for this holder".
    fn alloc(
        lock: CpuLockTokenRefMut<'_, Traits>,
        sem: &'static SemaphoreCb<Traits>,
    ) -> Option<&'static HolderSlot<Traits>>
    where
        Traits: KernelTraits;

    /// Release `slot` back to the store, clearing its contents.
    fn free(
        lock: CpuLockTokenRefMut<'_, Traits>,
        sem: &'static SemaphoreCb<Traits>,
        slot: &'static HolderSlot<Traits>,
    ) where
        Traits: KernelTraits;

    /// Call `f` for every live entry of `sem`, stopping at the first
    /// `Break` and returning it.
    ///
    /// The handler is allowed to [`free`](Self::free) the entry it was given.
    fn for_each<'a, F>(
        lock: CpuLockTokenRefMut<'a, Traits>,
        sem: &'static SemaphoreCb<Traits>,
        f: F,
    ) -> ControlFlow<()>
    where
        Traits: KernelTraits,
        F: FnMut(
            &mut CpuLockTokenRefMut<'a, Traits>,
            &'static HolderSlot<Traits>,
        ) -> ControlFlow<()>;

    /// The number of unallocated entries in the process-wide storage.
    fn free_count(lock: CpuLockTokenRefMut<'_, Traits>) -> usize
    where
        Traits: KernelTraits;
}

/// Implements [the sealed trait pattern], which prevents [`Store`] against
/// downstream implementations.
///
/// [the sealed trait pattern]: https://rust-lang.github.io/api-guidelines/future-proofing.html
mod private {
    pub trait Sealed {}
}

// Inline storage regime
// ---------------------------------------------------------------------------

/// The inline storage regime: a fixed array of two holder slots embedded in
/// every semaphore.
pub struct InlineHolders;

impl private::Sealed for InlineHolders {}

impl<Traits> Store<Traits> for InlineHolders
where
    Traits: KernelCfg1<HolderStore = Self> + PortScheduling,
{
    type PerSemData = [HolderSlot<Traits>; 2];
    type GlobalData = ();

    const RECLAIM_BEFORE_SELF_RESTORE: bool = true;

    fn initialize(_lock: CpuLockTokenRefMut<'_, Traits>)
    where
        Traits: KernelTraits,
    {
    }

    fn find(
        lock: CpuLockTokenRefMut<'_, Traits>,
        sem: &'static SemaphoreCb<Traits>,
        htcb: &'static ThreadCb<Traits>,
    ) -> Option<&'static HolderSlot<Traits>>
    where
        Traits: KernelTraits,
    {
        sem.holders
            .iter()
            .find(|slot| ptr_from_option_ref(slot.htcb.get(&*lock)) == htcb as *const _)
    }

    fn alloc(
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        sem: &'static SemaphoreCb<Traits>,
    ) -> Option<&'static HolderSlot<Traits>>
    where
        Traits: KernelTraits,
    {
        let slot = sem.holders.iter().find(|slot| slot.htcb.get(&*lock).is_none());
        if let Some(slot) = slot {
            slot.counts.replace(&mut *lock, 0);
        } else {
            log::error!("insufficient preallocated holders");
        }
        slot
    }

    fn free(
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        _sem: &'static SemaphoreCb<Traits>,
        slot: &'static HolderSlot<Traits>,
    ) where
        Traits: KernelTraits,
    {
        slot.htcb.replace(&mut *lock, None);
        slot.counts.replace(&mut *lock, 0);
    }

    fn for_each<'a, F>(
        mut lock: CpuLockTokenRefMut<'a, Traits>,
        sem: &'static SemaphoreCb<Traits>,
        mut f: F,
    ) -> ControlFlow<()>
    where
        Traits: KernelTraits,
        F: FnMut(
            &mut CpuLockTokenRefMut<'a, Traits>,
            &'static HolderSlot<Traits>,
        ) -> ControlFlow<()>,
    {
        for slot in sem.holders.iter() {
            if slot.htcb.get(&*lock).is_some() {
                f(&mut lock, slot)?;
            }
        }
        ControlFlow::Continue(())
    }

    fn free_count(_lock: CpuLockTokenRefMut<'_, Traits>) -> usize
    where
        Traits: KernelTraits,
    {
        0
    }
}

// Pooled storage regime
// ---------------------------------------------------------------------------

/// A holder entry node in the pooled storage regime.
pub struct HolderNode<Traits: PortScheduling> {
    pub(crate) slot: HolderSlot<Traits>,

    /// The next node in the owning semaphore's holder list, or in the global
    /// free list while the node is unallocated.
    pub(crate) link: CpuLockCell<Traits, Option<&'static HolderNode<Traits>>>,
}

impl<Traits: PortScheduling> Init for HolderNode<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        slot: Init::INIT,
        link: Init::INIT,
    };
}

impl<Traits: PortScheduling> fmt::Debug for HolderNode<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HolderNode")
            .field("slot", &self.slot)
            .field("link", &self.link.debug_as_ptr())
            .finish()
    }
}

/// Per-semaphore holder list head used by [`PooledHolders`].
pub struct HolderList<Traits: PortScheduling> {
    pub(crate) head: CpuLockCell<Traits, Option<&'static HolderNode<Traits>>>,
}

impl<Traits: PortScheduling> Init for HolderList<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self { head: Init::INIT };
}

impl<Traits: PortScheduling> fmt::Debug for HolderList<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HolderList")
            .field("head", &self.head.debug_as_ptr())
            .finish()
    }
}

/// The preallocated node pool and its free list, used by [`PooledHolders`].
pub struct HolderPool<Traits: PortScheduling, const N: usize> {
    pub(crate) nodes: [HolderNode<Traits>; N],
    pub(crate) free: CpuLockCell<Traits, Option<&'static HolderNode<Traits>>>,
}

impl<Traits: PortScheduling, const N: usize> Init for HolderPool<Traits, N> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        nodes: Init::INIT,
        free: Init::INIT,
    };
}

impl<Traits: PortScheduling, const N: usize> fmt::Debug for HolderPool<Traits, N> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HolderPool")
            .field("nodes", &self.nodes)
            .field("free", &self.free.debug_as_ptr())
            .finish()
    }
}

/// The pooled storage regime: a singly linked list per semaphore, with nodes
/// drawn from a process-wide free list of `N` preallocated nodes.
pub struct PooledHolders<const N: usize>;

impl<const N: usize> private::Sealed for PooledHolders<N> {}

impl<Traits, const N: usize> Store<Traits> for PooledHolders<N>
where
    Traits: KernelCfg1<HolderStore = Self> + PortScheduling,
{
    type PerSemData = HolderList<Traits>;
    type GlobalData = HolderPool<Traits, N>;

    const RECLAIM_BEFORE_SELF_RESTORE: bool = false;

    fn initialize(mut lock: CpuLockTokenRefMut<'_, Traits>)
    where
        Traits: KernelTraits,
    {
        // Thread all of the preallocated nodes onto the free list
        let pool = &Traits::state().holders;
        let mut head = None;
        for node in pool.nodes.iter().rev() {
            node.link.replace(&mut *lock, head);
            head = Some(node);
        }
        pool.free.replace(&mut *lock, head);
    }

    fn find(
        lock: CpuLockTokenRefMut<'_, Traits>,
        sem: &'static SemaphoreCb<Traits>,
        htcb: &'static ThreadCb<Traits>,
    ) -> Option<&'static HolderSlot<Traits>>
    where
        Traits: KernelTraits,
    {
        let mut maybe_node = sem.holders.head.get(&*lock);
        while let Some(node) = maybe_node {
            if ptr_from_option_ref(node.slot.htcb.get(&*lock)) == htcb as *const _ {
                return Some(&node.slot);
            }
            maybe_node = node.link.get(&*lock);
        }
        None
    }

    fn alloc(
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        sem: &'static SemaphoreCb<Traits>,
    ) -> Option<&'static HolderSlot<Traits>>
    where
        Traits: KernelTraits,
    {
        let pool = &Traits::state().holders;
        if let Some(node) = pool.free.get(&*lock) {
            // Move the node from the free list to the semaphore's holder list
            let next_free = node.link.get(&*lock);
            pool.free.replace(&mut *lock, next_free);
            let prev_head = sem.holders.head.replace(&mut *lock, Some(node));
            node.link.replace(&mut *lock, prev_head);

            node.slot.counts.replace(&mut *lock, 0);
            Some(&node.slot)
        } else {
            log::error!("insufficient preallocated holders");
            None
        }
    }

    fn free(
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        sem: &'static SemaphoreCb<Traits>,
        slot: &'static HolderSlot<Traits>,
    ) where
        Traits: KernelTraits,
    {
        slot.htcb.replace(&mut *lock, None);
        slot.counts.replace(&mut *lock, 0);

        // Unlink the containing node from the semaphore's holder list and
        // push it onto the free list
        let mut prev: Option<&'static HolderNode<Traits>> = None;
        let mut maybe_node = sem.holders.head.get(&*lock);
        while let Some(node) = maybe_node {
            if ptr::eq(&node.slot, slot) {
                let next = node.link.get(&*lock);
                match prev {
                    Some(prev) => prev.link.replace(&mut *lock, next),
                    None => sem.holders.head.replace(&mut *lock, next),
                };

                let pool = &Traits::state().holders;
                let prev_free = pool.free.get(&*lock);
                node.link.replace(&mut *lock, prev_free);
                pool.free.replace(&mut *lock, Some(node));
                return;
            }
            prev = maybe_node;
            maybe_node = node.link.get(&*lock);
        }
    }

    fn for_each<'a, F>(
        mut lock: CpuLockTokenRefMut<'a, Traits>,
        sem: &'static SemaphoreCb<Traits>,
        mut f: F,
    ) -> ControlFlow<()>
    where
        Traits: KernelTraits,
        F: FnMut(
            &mut CpuLockTokenRefMut<'a, Traits>,
            &'static HolderSlot<Traits>,
        ) -> ControlFlow<()>,
    {
        let mut maybe_node = sem.holders.head.get(&*lock);
        while let Some(node) = maybe_node {
            // The handler may free `node`; fetch the successor first
            maybe_node = node.link.get(&*lock);

            if node.slot.htcb.get(&*lock).is_some() {
                f(&mut lock, &node.slot)?;
            }
        }
        ControlFlow::Continue(())
    }

    fn free_count(lock: CpuLockTokenRefMut<'_, Traits>) -> usize
    where
        Traits: KernelTraits,
    {
        let pool = &Traits::state().holders;
        let mut n = 0;
        let mut maybe_node = pool.free.get(&*lock);
        while let Some(node) = maybe_node {
            n += 1;
            maybe_node = node.link.get(&*lock);
        }
        n
    }
}

// Holder maintenance API
// ---------------------------------------------------------------------------

/// Set up the process-wide holder storage. Called once at boot.
pub fn initialize_holders<Traits: KernelTraits>(lock: CpuLockTokenRefMut<'_, Traits>) {
    <Traits::HolderStore as Store<Traits>>::initialize(lock);
}

/// Recover any holder entries still attached to `sem`, which is about to be
/// destroyed.
///
/// A semaphore is ordinarily destroyed with at most one holder left, e.g. a
/// driver tearing down a semaphore it itself holds. More holders than that
/// usually mean a holder thread was killed; we cannot tell what the
/// application intended, so the entries are recovered regardless. No priority
/// restoration is attempted.
pub fn destroy_holder<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    sem: &'static SemaphoreCb<Traits>,
) {
    if cfg!(debug_assertions) {
        let mut live = 0usize;
        <Traits::HolderStore as Store<Traits>>::for_each(lock.borrow_mut(), sem, |_, _| {
            live += 1;
            ControlFlow::Continue(())
        });
        if live > 1 {
            log::warn!("semaphore {:p} destroyed with {} holders", sem, live);
        }
    }

    <Traits::HolderStore as Store<Traits>>::for_each(lock.borrow_mut(), sem, |lock, slot| {
        <Traits::HolderStore as Store<Traits>>::free(lock.borrow_mut(), sem, slot);
        ControlFlow::Continue(())
    });
}

/// Register the currently running thread as holding one more count on `sem`.
///
/// Called from the wait path when the caller obtains a count immediately.
pub fn add_holder<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    sem: &'static SemaphoreCb<Traits>,
) {
    add_holder_tcb(lock, Traits::running_thread(), sem);
}

/// Register `htcb` as holding one more count on `sem`.
///
/// Called from the post path when the count is handed directly to a woken
/// waiter.
pub fn add_holder_tcb<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    htcb: &'static ThreadCb<Traits>,
    sem: &'static SemaphoreCb<Traits>,
) {
    // With the holder set never populated, priority inheritance is
    // effectively disabled for this semaphore.
    if sem
        .flags
        .get(&*lock)
        .contains(SemaphoreFlags::PRIOINHERIT_DISABLE)
    {
        return;
    }

    if let Some(slot) = find_or_allocate(lock.borrow_mut(), sem, htcb) {
        slot.htcb.replace(&mut *lock, Some(htcb));
        let counts = slot.counts.get(&*lock);
        slot.counts.replace(&mut *lock, counts + 1);
    }
}

/// The running thread gave up one count on `sem`.
///
/// The entry is not freed here even if no counts remain; the restore engine
/// frees it after it has observed the zero count
/// ([`crate::inherit::restore_baseprio`]).
pub fn release_holder<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    sem: &'static SemaphoreCb<Traits>,
) {
    let rtcb = Traits::running_thread();
    if let Some(slot) = <Traits::HolderStore as Store<Traits>>::find(lock.borrow_mut(), sem, rtcb) {
        let counts = slot.counts.get(&*lock);
        if counts > 0 {
            slot.counts.replace(&mut *lock, counts - 1);
        }
    }
}

fn find_or_allocate<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    sem: &'static SemaphoreCb<Traits>,
    htcb: &'static ThreadCb<Traits>,
) -> Option<&'static HolderSlot<Traits>> {
    if let Some(slot) = <Traits::HolderStore as Store<Traits>>::find(lock.borrow_mut(), sem, htcb) {
        Some(slot)
    } else {
        <Traits::HolderStore as Store<Traits>>::alloc(lock, sem)
    }
}

/// Free `htcb`'s entry on `sem` once it holds no more counts.
pub(crate) fn find_and_free<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    sem: &'static SemaphoreCb<Traits>,
    htcb: &'static ThreadCb<Traits>,
) {
    if let Some(slot) = <Traits::HolderStore as Store<Traits>>::find(lock.borrow_mut(), sem, htcb) {
        if slot.counts.get(&*lock) == 0 {
            <Traits::HolderStore as Store<Traits>>::free(lock, sem, slot);
        }
    }
}

pub(crate) fn has_holders<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    sem: &'static SemaphoreCb<Traits>,
) -> bool {
    <Traits::HolderStore as Store<Traits>>::for_each(lock, sem, |_, _| ControlFlow::Break(()))
        .is_break()
}

/// Dump every holder of `sem` to the log.
#[cfg(feature = "holder_debug")]
pub fn enum_holders<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    sem: &'static SemaphoreCb<Traits>,
) {
    <Traits::HolderStore as Store<Traits>>::for_each(lock, sem, |lock, slot| {
        log::info!(
            "{:p}: htcb={:?} counts={}",
            slot,
            slot.htcb.get(&**lock).map(|htcb| htcb as *const _),
            slot.counts.get(&**lock),
        );
        ControlFlow::Continue(())
    });
}

/// The number of unused entries in the process-wide holder storage. A
/// dwindling value is a good way to find threads that never destroy their
/// semaphores.
#[cfg(feature = "holder_debug")]
pub fn n_free_holders<Traits: KernelTraits>(lock: CpuLockTokenRefMut<'_, Traits>) -> usize {
    <Traits::HolderStore as Store<Traits>>::free_count(lock)
}

#[inline]
fn ptr_from_option_ref<T>(x: Option<&T>) -> *const T {
    if let Some(x) = x {
        x
    } else {
        ptr::null()
    }
}

/// Collect `(thread, counts)` for every live entry of `sem`.
#[cfg(test)]
pub(crate) fn live_holders<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    sem: &'static SemaphoreCb<Traits>,
) -> std::vec::Vec<(*const ThreadCb<Traits>, HolderCount)> {
    let mut out = std::vec::Vec::new();
    <Traits::HolderStore as Store<Traits>>::for_each(lock, sem, |lock, slot| {
        out.push((
            ptr_from_option_ref(slot.htcb.get(&**lock)),
            slot.counts.get(&**lock),
        ));
        ControlFlow::Continue(())
    });
    out
}

#[cfg(test)]
mod tests;
