use super::{myproc, mythread, Threadstate};
use crate::kernel::kernel;
use crate::lock::Waitable;

/// A channel processes sleep on; any kernel object address serves as an
/// identifier, and wakeup matches by equality.
pub struct WaitChannel {
    /// Required to make this type non-zero-sized. If it were zero-sized,
    /// multiple wait channels may have the same address, spuriously waking up
    /// more threads.
    _padding: u8,
}

impl WaitChannel {
    pub const fn new() -> Self {
        Self { _padding: 0 }
    }

    /// Atomically release the given lock and sleep on this channel.
    /// Reacquires the lock when awakened.
    pub fn sleep<T: Waitable>(&self, lk: &mut T) {
        let p = unsafe { myproc() };
        let t = unsafe { mythread() };

        // Must acquire p->lock in order to change the thread's state and then
        // call sched. Once we hold p->lock, we can be guaranteed that we
        // won't miss any wakeup (wakeup locks p->lock), so it's okay to
        // release lk.

        //DOC: sleeplock1
        let mut guard = unsafe { (*p).lock() };
        unsafe {
            // Temporarily release the inner lock. We don't access `lk` again
            // until `raw_acquire`.
            lk.raw_release();
        }

        // Go to sleep.
        unsafe {
            (*t).chan = self as *const WaitChannel as usize;
            (*t).state = Threadstate::SLEEPING;
        }
        // SAFETY: we hold p->lock, changed the thread's state, and device
        // interrupts are disabled by push_off() in p->lock.
        unsafe { guard.sched() };

        // Tidy up.
        unsafe { (*t).chan = 0 };

        // Reacquire original lock.
        drop(guard);
        unsafe {
            // SAFETY: paired with the previous raw_release().
            lk.raw_acquire();
        }
    }

    /// Wake up all threads sleeping on this channel.
    /// Must be called without any p->lock.
    pub fn wakeup(&self) {
        kernel().procs.wakeup_pool(self)
    }
}
