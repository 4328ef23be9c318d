//! Priority inheritance: boosting and restoring holder priorities
//!
//! [`boost_priority`] is invoked from the wait path immediately before the
//! caller blocks, and raises the priority of every thread holding counts on
//! the semaphore that is less urgent than the caller. [`restore_baseprio`]
//! is invoked after a post released a count, and lowers holder priorities
//! back; [`canceled`] does the same when a waiter is aborted by a signal.
//!
//! How boosts are accounted for is decided by the configured [`BoostPolicy`]:
//!
//!  - [`SingleBoost`] raises a holder directly to the waiter's priority and
//!    restores by dropping to the base priority, leaving the reconciliation
//!    of boosts from other semaphores to the scheduler's pending-reprio
//!    handling ([`PortScheduling::reprioritize`]).
//!  - [`NestedBoost`] records every granted boost as a `(semaphore,
//!    priority)` entry in a fixed-capacity per-thread ledger, and restores by
//!    removing entries and recomputing the maximum, so overlapping boosts
//!    from multiple semaphores unwind precisely.
//!
//! All functions in this module require interrupts to be disabled or the
//! scheduler to be locked, witnessed by the `CpuLockTokenRefMut` parameter.
//!
//! [`PortScheduling::reprioritize`]: crate::PortScheduling::reprioritize
use arrayvec::ArrayVec;
use core::{fmt, ops::ControlFlow, ptr};

use crate::{
    holder::{self, HolderSlot, Store},
    klock::{CpuLockCell, CpuLockTokenRefMut},
    semaphore::SemaphoreCb,
    thread::ThreadCb,
    utils::Init,
    KernelCfg1, KernelTraits, PortScheduling,
};

/// Boost bookkeeping policy.
///
/// This trait is not intended to be implemented on custom types.
pub trait BoostPolicy<Traits>: Send + Sync + 'static + private::Sealed {
    /// Per-thread bookkeeping, embedded in [`ThreadCb`].
    type PerThreadData: Send + Sync + fmt::Debug + Init + 'static;

    /// Raise `htcb`'s priority as needed on behalf of a waiter of priority
    /// `waiter_priority` about to block on `sem`.
    ///
    /// `htcb` has already been verified to be live. The raise cannot cause an
    /// immediate context switch (see
    /// [`PortScheduling::set_priority`](crate::PortScheduling::set_priority)).
    fn boost_holder(
        lock: CpuLockTokenRefMut<'_, Traits>,
        htcb: &'static ThreadCb<Traits>,
        sem: &'static SemaphoreCb<Traits>,
        waiter_priority: Traits::Priority,
    ) where
        Traits: KernelTraits;

    /// Lower `htcb`'s priority as needed after a waiter on `sem` has been
    /// satisfied or canceled.
    ///
    /// `pholder` is `htcb`'s holder entry on `sem` if it still has one.
    /// `htcb` has already been verified to be live, and is known to be
    /// boosted (`effective_priority != base_priority`).
    fn restore_holder(
        lock: CpuLockTokenRefMut<'_, Traits>,
        htcb: &'static ThreadCb<Traits>,
        sem: &'static SemaphoreCb<Traits>,
        pholder: Option<&'static HolderSlot<Traits>>,
    ) where
        Traits: KernelTraits;

    /// Discard all of `htcb`'s boost bookkeeping. Called by the thread
    /// lifecycle when a control block is recycled for a new thread.
    fn reset_thread(lock: CpuLockTokenRefMut<'_, Traits>, htcb: &'static ThreadCb<Traits>)
    where
        Traits: KernelTraits;
}

mod private {
    pub trait Sealed {}
}

// Single-boost policy
// ---------------------------------------------------------------------------

/// The single-boost policy: no per-boost records are kept.
///
/// A holder is raised directly to the waiter's priority, and a restore drops
/// it straight back to its base priority through
/// [`PortScheduling::reprioritize`](crate::PortScheduling::reprioritize),
/// which is responsible for consulting reprioritizations pending from other
/// semaphores.
pub struct SingleBoost;

impl private::Sealed for SingleBoost {}

impl<Traits> BoostPolicy<Traits> for SingleBoost {
    type PerThreadData = ();

    fn boost_holder(
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        htcb: &'static ThreadCb<Traits>,
        _sem: &'static SemaphoreCb<Traits>,
        waiter_priority: Traits::Priority,
    ) where
        Traits: KernelTraits,
    {
        // A holder already running at or above the waiter's priority needs no
        // help
        if waiter_priority > htcb.effective_priority.get(&*lock) {
            Traits::set_priority(lock.borrow_mut(), htcb, waiter_priority);
        }
    }

    fn restore_holder(
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        htcb: &'static ThreadCb<Traits>,
        _sem: &'static SemaphoreCb<Traits>,
        _pholder: Option<&'static HolderSlot<Traits>>,
    ) where
        Traits: KernelTraits,
    {
        let base_priority = htcb.base_priority.get(&*lock);
        Traits::reprioritize(lock.borrow_mut(), htcb, base_priority);
    }

    fn reset_thread(_lock: CpuLockTokenRefMut<'_, Traits>, _htcb: &'static ThreadCb<Traits>)
    where
        Traits: KernelTraits,
    {
    }
}

// Nested-boost policy
// ---------------------------------------------------------------------------

/// A single recorded boost: the thread is held at least at `priority` on
/// behalf of a waiter on `sem`.
pub struct BoostRecord<Traits: PortScheduling> {
    sem: &'static SemaphoreCb<Traits>,
    priority: Traits::Priority,
}

impl<Traits: PortScheduling> Clone for BoostRecord<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: PortScheduling> Copy for BoostRecord<Traits> {}

impl<Traits: PortScheduling> fmt::Debug for BoostRecord<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BoostRecord")
            .field("sem", &(self.sem as *const _))
            .field("priority", &self.priority)
            .finish()
    }
}

/// Per-thread ledger of active boosts, of fixed capacity `MAX_NEST`.
///
/// Invariant: the thread's effective priority equals the maximum of its base
/// priority and every recorded priority.
pub struct BoostLedger<Traits: PortScheduling, const MAX_NEST: usize> {
    records: CpuLockCell<Traits, ArrayVec<BoostRecord<Traits>, MAX_NEST>>,
}

impl<Traits: PortScheduling, const MAX_NEST: usize> Init for BoostLedger<Traits, MAX_NEST> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        records: Init::INIT,
    };
}

impl<Traits: PortScheduling, const MAX_NEST: usize> fmt::Debug for BoostLedger<Traits, MAX_NEST> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BoostLedger")
            .field("records", &self.records)
            .finish()
    }
}

/// The nested-boost policy: every granted boost is recorded in the holder's
/// [`BoostLedger`] and attributed to the semaphore it came from.
///
/// `MAX_NEST` must be nonzero; a configuration without nesting uses
/// [`SingleBoost`] instead.
pub struct NestedBoost<const MAX_NEST: usize>;

impl<const MAX_NEST: usize> private::Sealed for NestedBoost<MAX_NEST> {}

impl<Traits, const MAX_NEST: usize> BoostPolicy<Traits> for NestedBoost<MAX_NEST>
where
    Traits: KernelCfg1<BoostPolicy = Self> + PortScheduling,
{
    type PerThreadData = BoostLedger<Traits, MAX_NEST>;

    fn boost_holder(
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        htcb: &'static ThreadCb<Traits>,
        sem: &'static SemaphoreCb<Traits>,
        waiter_priority: Traits::Priority,
    ) where
        Traits: KernelTraits,
    {
        // The waiter obliges the holder to run at least at `waiter_priority`
        // only if that exceeds the holder's own base priority
        if waiter_priority <= htcb.base_priority.get(&*lock) {
            return;
        }

        {
            let records = htcb.boosts.records.write(&mut *lock);
            if records.is_full() {
                // The boost goes unrecorded; the holder keeps whatever
                // priority it already has
                log::error!("thread {:p} is out of priority boost slots", htcb);
                return;
            }
            records.push(BoostRecord {
                sem,
                priority: waiter_priority,
            });
        }

        if waiter_priority > htcb.effective_priority.get(&*lock) {
            Traits::set_priority(lock.borrow_mut(), htcb, waiter_priority);
        }
    }

    fn restore_holder(
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        htcb: &'static ThreadCb<Traits>,
        sem: &'static SemaphoreCb<Traits>,
        pholder: Option<&'static HolderSlot<Traits>>,
    ) where
        Traits: KernelTraits,
    {
        let still_holding = pholder.map_or(false, |slot| slot.counts.get(&*lock) > 0);

        {
            let records = htcb.boosts.records.write(&mut *lock);
            if !still_holding {
                // The thread holds no more counts on `sem`; lingering at an
                // elevated priority would not release anything any faster.
                // Discard every boost attributed to `sem`.
                records.retain(|record| !ptr::eq(record.sem, sem));
            } else {
                // The highest-priority waiter on `sem` has been satisfied.
                // Remove the strongest boost recorded for `sem`, if any.
                let max = records
                    .iter()
                    .enumerate()
                    .filter(|(_, record)| ptr::eq(record.sem, sem))
                    .max_by_key(|(_, record)| record.priority)
                    .map(|(i, _)| i);
                if let Some(i) = max {
                    records.swap_remove(i);
                }
            }
        }

        // Re-evaluate what the thread's priority should now be
        let mut new_priority = htcb.base_priority.get(&*lock);
        for record in htcb.boosts.records.read(&*lock).iter() {
            new_priority = new_priority.max(record.priority);
        }

        if new_priority != htcb.effective_priority.get(&*lock) {
            Traits::set_priority(lock.borrow_mut(), htcb, new_priority);
        }
    }

    fn reset_thread(mut lock: CpuLockTokenRefMut<'_, Traits>, htcb: &'static ThreadCb<Traits>)
    where
        Traits: KernelTraits,
    {
        htcb.boosts.records.write(&mut *lock).clear();
    }
}

// Boost engine
// ---------------------------------------------------------------------------

/// Boost the priority of every thread holding counts on `sem` that is less
/// urgent than the currently running thread.
///
/// Invoked from the wait path immediately before the caller blocks.
pub fn boost_priority<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    sem: &'static SemaphoreCb<Traits>,
) {
    let rtcb = Traits::running_thread();
    let waiter_priority = rtcb.effective_priority.get(&*lock);

    <Traits::HolderStore as Store<Traits>>::for_each(lock.borrow_mut(), sem, |lock, slot| {
        let htcb = match slot.htcb.get(&**lock) {
            Some(htcb) => htcb,
            None => return ControlFlow::Continue(()),
        };

        // A holder that exited without releasing its counts leaves a stale
        // handle behind. Nothing can be recovered beyond the entry itself;
        // the lost counts are the application's problem.
        if !Traits::verify_thread(htcb) {
            log::warn!("thread handle {:p} is stale, counts lost", htcb);
            <Traits::HolderStore as Store<Traits>>::free(lock.borrow_mut(), sem, slot);
            return ControlFlow::Continue(());
        }

        <Traits::BoostPolicy as BoostPolicy<Traits>>::boost_holder(
            lock.borrow_mut(),
            htcb,
            sem,
            waiter_priority,
        );
        ControlFlow::Continue(())
    });
}

// Restore engine
// ---------------------------------------------------------------------------

/// Restore holder priorities after a count was released on `sem`.
///
/// `stcb` is the thread the released count was handed to, or `None` if no
/// thread was waiting. The count having gone to `stcb` means the
/// highest-priority waiter has been satisfied, so every holder can drop back
/// to the priority demanded by the remaining waiters.
///
/// A post from an interrupt handler injects the count without being a
/// priority inheritance participant itself; a post from a thread is a holder
/// whose count was just released, which needs the more careful task-context
/// treatment. The two cases are told apart here.
pub fn restore_baseprio<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    stcb: Option<&'static ThreadCb<Traits>>,
    sem: &'static SemaphoreCb<Traits>,
) {
    if Traits::is_interrupt_context() {
        restore_baseprio_irq(lock, stcb, sem);
    } else {
        restore_baseprio_task(lock, stcb, sem);
    }
}

fn restore_baseprio_irq<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    stcb: Option<&'static ThreadCb<Traits>>,
    sem: &'static SemaphoreCb<Traits>,
) {
    if stcb.is_some() {
        // The interrupted thread plays no role here; every holder is
        // restored in a single pass
        <Traits::HolderStore as Store<Traits>>::for_each(lock, sem, |lock, slot| {
            if let Some(htcb) = slot.htcb.get(&**lock) {
                restore_holder_prio(lock.borrow_mut(), htcb, sem);
            }
            ControlFlow::Continue(())
        });
    } else {
        verify_holders(lock, sem);
    }
}

fn restore_baseprio_task<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    stcb: Option<&'static ThreadCb<Traits>>,
    sem: &'static SemaphoreCb<Traits>,
) {
    let rtcb = Traits::running_thread();

    if stcb.is_some() {
        // Restoring the running thread could mark it pending and suspend it
        // in the middle of the holder walk, so this is done in two passes:
        // every other holder first, the running thread last.
        <Traits::HolderStore as Store<Traits>>::for_each(lock.borrow_mut(), sem, |lock, slot| {
            match slot.htcb.get(&**lock) {
                Some(htcb) if !ptr::eq(htcb, rtcb) => {
                    restore_holder_prio(lock.borrow_mut(), htcb, sem);
                }
                _ => {}
            }
            ControlFlow::Continue(())
        });

        <Traits::HolderStore as Store<Traits>>::for_each(lock.borrow_mut(), sem, |lock, slot| {
            if slot
                .htcb
                .get(&**lock)
                .map_or(false, |htcb| ptr::eq(htcb, rtcb))
            {
                if <Traits::HolderStore as Store<Traits>>::RECLAIM_BEFORE_SELF_RESTORE {
                    // The reprioritization below may context switch; release
                    // the spent entry first so that an `add_holder` occurring
                    // in that window still finds a slot.
                    holder::find_and_free(lock.borrow_mut(), sem, rtcb);
                }
                restore_holder_prio(lock.borrow_mut(), rtcb, sem);
                return ControlFlow::Break(());
            }
            ControlFlow::Continue(())
        });
    } else {
        verify_holders(lock.borrow_mut(), sem);
    }

    // The running thread's count was released before this call; drop its
    // entry once nothing remains
    holder::find_and_free(lock.borrow_mut(), sem, rtcb);
}

/// Restore holder priorities after a waiter on `sem` was aborted, e.g. by a
/// signal.
///
/// The semaphore count stays non-positive: the aborted waiter never obtained
/// a count, and other waiters may still be queued.
pub fn canceled<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    _stcb: Option<&'static ThreadCb<Traits>>,
    sem: &'static SemaphoreCb<Traits>,
) {
    debug_assert!(sem.value.get(&*lock) <= 0);

    <Traits::HolderStore as Store<Traits>>::for_each(lock.borrow_mut(), sem, |lock, slot| {
        if let Some(htcb) = slot.htcb.get(&**lock) {
            restore_holder_prio(lock.borrow_mut(), htcb, sem);
        }
        ControlFlow::Continue(())
    });
}

/// Drop a single holder's priority back to the level still demanded of it.
fn restore_holder_prio<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    htcb: &'static ThreadCb<Traits>,
    sem: &'static SemaphoreCb<Traits>,
) {
    let pholder = <Traits::HolderStore as Store<Traits>>::find(lock.borrow_mut(), sem, htcb);

    if !Traits::verify_thread(htcb) {
        log::warn!("thread handle {:p} is stale, counts lost", htcb);
        if let Some(pholder) = pholder {
            <Traits::HolderStore as Store<Traits>>::free(lock, sem, pholder);
        }
        return;
    }

    // No boost in effect
    if htcb.effective_priority.get(&*lock) == htcb.base_priority.get(&*lock) {
        return;
    }

    <Traits::BoostPolicy as BoostPolicy<Traits>>::restore_holder(lock, htcb, sem, pholder);
}

/// Debug hook run when a post found no waiters.
///
/// With no thread left waiting, every holder would be expected to sit at its
/// base priority again, but a holder may legitimately still be boosted
/// through another semaphore, so no assertion is made here.
fn verify_holders<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    sem: &'static SemaphoreCb<Traits>,
) {
    let _ = (lock, sem);
}

/// Discard a thread's boost bookkeeping. Called by the thread lifecycle when
/// a control block is recycled for a new thread.
pub fn reset_thread_boosts<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    htcb: &'static ThreadCb<Traits>,
) {
    <Traits::BoostPolicy as BoostPolicy<Traits>>::reset_thread(lock, htcb);
}

#[cfg(test)]
impl<Traits: PortScheduling, const MAX_NEST: usize> BoostLedger<Traits, MAX_NEST> {
    /// Collect the recorded `(semaphore, priority)` pairs of this ledger.
    pub(crate) fn entries(
        &self,
        lock: &crate::klock::CpuLockToken<Traits>,
    ) -> std::vec::Vec<(*const SemaphoreCb<Traits>, Traits::Priority)> {
        self.records
            .read(lock)
            .iter()
            .map(|record| (record.sem as *const _, record.priority))
            .collect()
    }
}
