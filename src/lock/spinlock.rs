//! Spin locks
use core::hint::spin_loop;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use super::{Guard, Lock, RawLock};
use crate::{
    cpu::Cpu,
    kernel::kernel,
    riscv::{intr_get, intr_off},
};

/// Mutual exclusion lock that busy waits (spins).
pub struct RawSpinlock {
    /// Name of lock.
    name: &'static str,

    /// If the lock is held, contains the pointer of `Cpu`.
    /// Otherwise, contains null.
    ///
    /// Records info about lock acquisition for holding() and debugging.
    locked: AtomicPtr<Cpu>,
}

/// Locks that busy wait (spin).
pub type Spinlock<T> = Lock<RawSpinlock, T>;
/// Guards of `Spinlock<T>`.
pub type SpinlockGuard<'s, T> = Guard<'s, RawSpinlock, T>;

impl RawSpinlock {
    /// Mutual exclusion spin locks.
    pub const fn new(name: &'static str) -> Self {
        Self {
            locked: AtomicPtr::new(ptr::null_mut()),
            name,
        }
    }
}

impl RawLock for RawSpinlock {
    /// Acquires the lock.
    /// Loops (spins) until the lock is acquired.
    ///
    /// To ensure that all stores done in one critical section are visible in
    /// the next critical section's loads, we use an atomic exchange with
    /// `Acquire` ordering here, paired with an atomic store with `Release`
    /// ordering in `RawSpinlock::release()`.
    fn acquire(&self) {
        // Disable interrupts to avoid deadlock.
        unsafe { push_off() };
        assert!(!self.holding(), "acquire {}", self.name);

        while self
            .locked
            .compare_exchange(
                ptr::null_mut(),
                kernel().current_cpu_raw(),
                Ordering::Acquire,
                // Okay to use `Relaxed` ordering since we don't enter the
                // critical section anyway if the exchange fails.
                Ordering::Relaxed,
            )
            .is_err()
        {
            spin_loop();
        }
    }

    /// Releases the lock.
    fn release(&self) {
        assert!(self.holding(), "release {}", self.name);
        self.locked.store(ptr::null_mut(), Ordering::Release);
        unsafe { pop_off() };
    }

    /// Check whether this cpu is holding the lock.
    /// Interrupts must be off.
    fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed) == kernel().current_cpu_raw()
    }
}

/// push_off/pop_off are like intr_off()/intr_on() except that they are
/// matched: it takes two pop_off()s to undo two push_off()s. Also, if
/// interrupts are initially off, then push_off, pop_off leaves them off.
///
/// # Safety
///
/// Must be paired with a later `pop_off()` on the same CPU.
pub unsafe fn push_off() {
    let old = intr_get();
    unsafe { intr_off() };

    let cpu = kernel().current_cpu_raw();
    if unsafe { (*cpu).noff } == 0 {
        unsafe { (*cpu).interrupt_enabled = old };
    }
    unsafe { (*cpu).noff += 1 };
}

/// pop_off() should be paired with push_off().
/// See push_off() for more details.
///
/// # Safety
///
/// It may turn interrupts on, so the caller must not rely on them staying
/// disabled afterwards.
pub unsafe fn pop_off() {
    let cpu = kernel().current_cpu_raw();
    assert!(!intr_get(), "pop_off - interruptible");
    assert!(unsafe { (*cpu).noff } >= 1, "pop_off");

    unsafe { (*cpu).noff -= 1 };

    if unsafe { (*cpu).noff } == 0 && unsafe { (*cpu).interrupt_enabled } {
        unsafe { crate::riscv::intr_on() };
    }
}

impl<T> Spinlock<T> {
    /// Returns a new `Spinlock` with name `name` and data `data`.
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            lock: RawSpinlock::new(name),
            data: core::cell::UnsafeCell::new(data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::testing::serial;

    #[test]
    fn lock_round_trip() {
        let _guard = serial();
        let lock = Spinlock::new("test", 0usize);
        {
            let mut guard = lock.lock();
            assert!(lock.holding());
            *guard += 1;
        }
        assert!(!lock.holding());
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn push_off_nests() {
        let _guard = serial();
        unsafe { push_off() };
        unsafe { push_off() };
        let cpu = kernel().current_cpu_raw();
        assert!(unsafe { (*cpu).noff } >= 2);
        unsafe { pop_off() };
        unsafe { pop_off() };
    }
}
