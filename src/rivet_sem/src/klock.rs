//! Kernel state locking mechanism
//!
//! All mutable state owned by this subsystem sits in [`CpuLockCell`]s, whose
//! contents are reachable only through a [`CpuLockToken`]. One token exists
//! per system type, and it exists exactly while CPU Lock (all kernel-managed
//! interrupts disabled) is active, so holding the token proves the critical
//! section. Entry points whose callers must have interrupts disabled or the
//! scheduler locked take a [`CpuLockTokenRefMut`] parameter; the precondition
//! is demonstrated by the argument rather than checked at runtime.
use core::{fmt, ops};
use tokenlock::UnsyncTokenLock;

use crate::{error::BadContextError, utils::Init, PortScheduling};

pub struct CpuLockTag<Traits>(Traits);

/// The singleton token tied to the CPU Lock state. Reading or writing a
/// [`CpuLockCell`] requires this token.
pub type CpuLockToken<Traits> = tokenlock::UnsyncSingletonToken<CpuLockTag<Traits>>;

/// Names the token a [`CpuLockCell`] is keyed to, without granting access.
pub type CpuLockKeyhole<Traits> = tokenlock::SingletonTokenId<CpuLockTag<Traits>>;

/// A temporary mutable borrow of the [`CpuLockToken`], obtained from
/// [`CpuLockGuard::borrow_mut`].
///
/// Unlike a plain `&mut` parameter, passing one of these to a callee moves
/// it; callers that need the token again afterwards reborrow explicitly with
/// [`borrow_mut`](tokenlock::UnsyncSingletonTokenRefMut::borrow_mut).
pub type CpuLockTokenRefMut<'a, Traits> =
    tokenlock::UnsyncSingletonTokenRefMut<'a, CpuLockTag<Traits>>;

/// Interior-mutable cell tied to the CPU Lock state.
pub struct CpuLockCell<Traits, T: ?Sized>(UnsyncTokenLock<T, CpuLockKeyhole<Traits>>);

impl<Traits, T> CpuLockCell<Traits, T> {
    pub const fn new(x: T) -> Self {
        Self(UnsyncTokenLock::new(CpuLockKeyhole::INIT, x))
    }
}

impl<Traits, T: Init> Init for CpuLockCell<Traits, T> {
    const INIT: Self = Self::new(T::INIT);
}

impl<Traits, T> ops::Deref for CpuLockCell<Traits, T> {
    type Target = UnsyncTokenLock<T, CpuLockKeyhole<Traits>>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<Traits, T> ops::DerefMut for CpuLockCell<Traits, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<Traits: PortScheduling, T: Clone + fmt::Debug> fmt::Debug for CpuLockCell<Traits, T> {
    /// Claims CPU Lock for the duration of the formatting. Prints a
    /// placeholder when the lock is already taken, since the contents are
    /// unreachable then.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match lock_cpu::<Traits>() {
            Ok(lock) => {
                let inner = self.0.get(&*lock);
                drop(lock);
                write!(f, "CpuLockCell({inner:?})")
            }
            Err(_) => f.write_str("CpuLockCell(< locked >)"),
        }
    }
}

impl<Traits: PortScheduling, P> CpuLockCell<Traits, Option<&'static P>> {
    /// Debug formatting proxy that prints the pointer identity of the
    /// referenced control block.
    ///
    /// Control blocks refer to each other; following the references while
    /// formatting would recurse (and re-lock) indefinitely, so cells that
    /// store cross-references are printed through this instead.
    pub fn debug_as_ptr(&self) -> impl fmt::Debug + '_ {
        struct AsPtr<'a, Traits, P: 'static> {
            cell: &'a CpuLockCell<Traits, Option<&'static P>>,
        }

        impl<Traits: PortScheduling, P: 'static> fmt::Debug for AsPtr<'_, Traits, P> {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                match lock_cpu::<Traits>() {
                    Ok(lock) => {
                        let ptr = self.cell.get(&*lock).map(|p| p as *const P);
                        write!(f, "{ptr:?}")
                    }
                    Err(_) => f.write_str("< locked >"),
                }
            }
        }

        AsPtr { cell: self }
    }
}

/// Claim CPU Lock and return an RAII guard for it.
///
/// Fails with [`BadContextError`] when CPU Lock is already active, i.e. when
/// called from inside a critical section that already owns the token.
pub fn lock_cpu<Traits: PortScheduling>() -> Result<CpuLockGuard<Traits>, BadContextError> {
    // Safety: claiming CPU Lock is reserved to the kernel, which this module
    // is part of
    if !unsafe { Traits::try_enter_cpu_lock() } {
        return Err(BadContextError::BadContext);
    }

    // Safety: the claim succeeded just now, so no other guard or token is
    // alive
    Ok(unsafe { assume_cpu_lock() })
}

/// Produce the guard for a CPU Lock state that is already active.
///
/// # Safety
///
/// CPU Lock must actually be active, and no other [`CpuLockGuard`] (and thus
/// no other [`CpuLockToken`]) may exist.
pub unsafe fn assume_cpu_lock<Traits: PortScheduling>() -> CpuLockGuard<Traits> {
    debug_assert!(Traits::is_cpu_lock_active());

    CpuLockGuard {
        // Safety: token uniqueness is the caller's obligation
        token: unsafe { CpuLockToken::new_unchecked() },
    }
}

/// Owns the CPU Lock state along with the [`CpuLockToken`] that comes with
/// it. Dropping the guard leaves CPU Lock.
pub struct CpuLockGuard<Traits: PortScheduling> {
    token: CpuLockToken<Traits>,
}

impl<Traits: PortScheduling> CpuLockGuard<Traits> {
    /// Borrow the token as a [`CpuLockTokenRefMut`].
    pub fn borrow_mut(&mut self) -> CpuLockTokenRefMut<'_, Traits> {
        self.token.borrow_mut()
    }
}

impl<Traits: PortScheduling> Drop for CpuLockGuard<Traits> {
    fn drop(&mut self) {
        // Safety: the guard's existence means CPU Lock is active and owned
        // by the kernel
        unsafe { Traits::leave_cpu_lock() };
    }
}

impl<Traits: PortScheduling> ops::Deref for CpuLockGuard<Traits> {
    type Target = CpuLockToken<Traits>;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl<Traits: PortScheduling> ops::DerefMut for CpuLockGuard<Traits> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}
