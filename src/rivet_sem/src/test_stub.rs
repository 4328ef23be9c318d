//! A stub scheduler port for tests.
//!
//! [`stub_system!`] instantiates a fresh "system": a set of static control
//! blocks plus a `SystemTraits` type implementing the kernel traits over
//! them. Because CPU Lock is global per system type, every test that mutates
//! state gets its own instantiation, letting the test harness run tests in
//! parallel.
//!
//! The stub records every `set_priority`/`reprioritize` call so tests can
//! observe ordering, keeps a per-thread `alive` flag consulted by
//! `verify_thread`, and lets a test masquerade as an interrupt handler
//! through `set_interrupt_context`.
macro_rules! stub_system {
    (
        mod $name:ident {
            store: $store:ty,
            policy: $policy:ty,
            threads: $threads:expr,
            sems: $sems:expr $(,)?
        }
    ) => {
        mod $name {
            #![allow(dead_code)]
            use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
            use std::sync::Mutex;

            use crate::{
                holder, inherit,
                klock::{self, CpuLockGuard, CpuLockTokenRefMut},
                semaphore::{SemaphoreCb, SemaphoreFlags},
                thread::ThreadCb,
                utils::Init,
                KernelCfg1, KernelCfg2, PortScheduling, State,
            };

            pub struct SystemTraits;

            unsafe impl KernelCfg1 for SystemTraits {
                type Priority = u8;
                type HolderStore = $store;
                type BoostPolicy = $policy;
            }

            /// Port-side thread state: whether the thread is still alive.
            pub struct ThreadState {
                pub alive: AtomicBool,
            }

            impl Init for ThreadState {
                const INIT: Self = Self {
                    alive: AtomicBool::new(true),
                };
            }

            impl std::fmt::Debug for ThreadState {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    f.debug_struct("ThreadState")
                        .field("alive", &self.alive.load(Ordering::Relaxed))
                        .finish()
                }
            }

            /// A recorded `set_priority`/`reprioritize` call.
            #[derive(Debug, Clone, Copy, PartialEq, Eq)]
            pub struct PriorityCall {
                pub thread: usize,
                pub priority: u8,
                pub reprioritize: bool,
            }

            static CPU_LOCK: AtomicBool = AtomicBool::new(false);
            static RUNNING: AtomicUsize = AtomicUsize::new(0);
            static IN_INTERRUPT: AtomicBool = AtomicBool::new(false);
            static PRIORITY_CALLS: Mutex<Vec<PriorityCall>> = Mutex::new(Vec::new());

            static STATE: State<SystemTraits> = Init::INIT;
            static THREADS: [ThreadCb<SystemTraits>; $threads] = Init::INIT;
            static SEMS: [SemaphoreCb<SystemTraits>; $sems] = Init::INIT;

            unsafe impl PortScheduling for SystemTraits {
                type PortThreadState = ThreadState;

                unsafe fn try_enter_cpu_lock() -> bool {
                    !CPU_LOCK.swap(true, Ordering::Acquire)
                }

                unsafe fn enter_cpu_lock() {
                    assert!(!CPU_LOCK.swap(true, Ordering::Acquire));
                }

                unsafe fn leave_cpu_lock() {
                    CPU_LOCK.store(false, Ordering::Release);
                }

                fn is_cpu_lock_active() -> bool {
                    CPU_LOCK.load(Ordering::Relaxed)
                }

                fn is_interrupt_context() -> bool {
                    IN_INTERRUPT.load(Ordering::Relaxed)
                }

                fn running_thread() -> &'static ThreadCb<Self> {
                    &THREADS[RUNNING.load(Ordering::Relaxed)]
                }

                fn verify_thread(htcb: &'static ThreadCb<Self>) -> bool {
                    htcb.port_thread_state.alive.load(Ordering::Relaxed)
                }

                fn set_priority(
                    mut lock: CpuLockTokenRefMut<'_, Self>,
                    htcb: &'static ThreadCb<Self>,
                    priority: u8,
                ) {
                    htcb.set_effective_priority(&mut *lock, priority);
                    PRIORITY_CALLS.lock().unwrap().push(PriorityCall {
                        thread: thread_index(htcb),
                        priority,
                        reprioritize: false,
                    });
                }

                fn reprioritize(
                    mut lock: CpuLockTokenRefMut<'_, Self>,
                    htcb: &'static ThreadCb<Self>,
                    priority: u8,
                ) {
                    // The stub has no pending-reprio queue; the explicit value
                    // is applied as-is
                    htcb.set_effective_priority(&mut *lock, priority);
                    PRIORITY_CALLS.lock().unwrap().push(PriorityCall {
                        thread: thread_index(htcb),
                        priority,
                        reprioritize: true,
                    });
                }
            }

            unsafe impl KernelCfg2 for SystemTraits {
                fn state() -> &'static State<Self> {
                    &STATE
                }
            }

            pub fn thread(i: usize) -> &'static ThreadCb<SystemTraits> {
                &THREADS[i]
            }

            pub fn sem(i: usize) -> &'static SemaphoreCb<SystemTraits> {
                &SEMS[i]
            }

            pub fn thread_index(htcb: &'static ThreadCb<SystemTraits>) -> usize {
                THREADS
                    .iter()
                    .position(|t| core::ptr::eq(t, htcb))
                    .unwrap()
            }

            /// Make thread `i` the running thread.
            pub fn run_as(i: usize) {
                RUNNING.store(i, Ordering::Relaxed);
            }

            pub fn set_interrupt_context(active: bool) {
                IN_INTERRUPT.store(active, Ordering::Relaxed);
            }

            pub fn kill_thread(i: usize) {
                THREADS[i]
                    .port_thread_state
                    .alive
                    .store(false, Ordering::Relaxed);
            }

            pub fn priority_calls() -> Vec<PriorityCall> {
                PRIORITY_CALLS.lock().unwrap().clone()
            }

            pub fn lock() -> CpuLockGuard<SystemTraits> {
                klock::lock_cpu().unwrap()
            }

            /// Reset the whole system: thread priorities and liveness, holder
            /// storage, semaphores, and the recorded priority-call log.
            pub fn reset(base_priorities: &[u8]) {
                let _ = env_logger::builder().is_test(true).try_init();
                assert!(base_priorities.len() <= $threads);

                let mut lock = lock();
                for (i, &priority) in base_priorities.iter().enumerate() {
                    let htcb = thread(i);
                    htcb.port_thread_state.alive.store(true, Ordering::Relaxed);
                    htcb.set_base_priority(&mut *lock, priority);
                    htcb.set_effective_priority(&mut *lock, priority);
                    inherit::reset_thread_boosts(lock.borrow_mut(), htcb);
                }
                for i in 0..$sems {
                    holder::destroy_holder(lock.borrow_mut(), sem(i));
                    sem(i).value.replace(&mut *lock, 0);
                    sem(i).flags.replace(&mut *lock, SemaphoreFlags::empty());
                }
                holder::initialize_holders(lock.borrow_mut());
                drop(lock);

                run_as(0);
                set_interrupt_context(false);
                PRIORITY_CALLS.lock().unwrap().clear();
            }
        }
    };
}
