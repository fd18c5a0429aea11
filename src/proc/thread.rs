use core::ptr;

use super::procs::forkret;
use super::*;
use crate::{
    kernel::kernel,
    param::MAX_STACK_SIZE,
    riscv::PGSIZE,
    vm::{Addr, UVAddr},
};

impl ProcessSystem {
    /// Create a new thread in the current process, entering `start_func`
    /// with its stack pointer near the top of the given user stack. Returns
    /// the new thread's tid, or Err on slot or memory exhaustion.
    pub fn thread_create(&self, start_func: UVAddr, stack: UVAddr) -> Result<Tid, ()> {
        let p = unsafe { myproc() };
        let my_t = unsafe { mythread() };
        let mut guard = unsafe { (*p).lock() };
        let info = guard.deref_mut_info();

        // Recycle zombie slots, then take the first free one.
        let mut new_tix = None;
        for (i, t) in info.threads.iter_mut().enumerate() {
            if t.state == Threadstate::ZOMBIET {
                t.chan = 0;
                t.killed = false;
                t.state = Threadstate::UNUSEDT;
            }
            if t.state == Threadstate::UNUSEDT && new_tix.is_none() {
                new_tix = Some(i);
            }
        }
        let tix = new_tix.ok_or(())?;
        let tid = self.alloctid();

        let t = &mut info.threads[tix];
        // A recycled slot reuses its old kernel stack.
        if t.kstack == 0 {
            t.kstack = kernel().alloc().ok_or(())?.into_usize();
        }
        t.tid = tid;
        t.context = Context::new();
        t.context.ra = forkret as usize;
        t.context.sp = t.kstack + PGSIZE;
        unsafe {
            *t.trap_frame = *(*my_t).trap_frame;
            (*t.trap_frame).epc = start_func.into_usize();
            (*t.trap_frame).sp = stack.into_usize().wrapping_add(MAX_STACK_SIZE - 16);
        }
        t.killed = false;
        t.xstate = 0;
        t.state = Threadstate::RUNNABLE;
        Ok(tid)
    }

    /// The calling thread's id.
    pub fn thread_id(&self) -> Tid {
        let t = unsafe { mythread() };
        unsafe { (*t).tid }
    }

    /// Terminate the calling thread. If every other thread of the process is
    /// already terminal, the whole process exits with this status instead.
    pub fn thread_exit(&self, status: i32) -> ! {
        let p = unsafe { myproc() };
        let my_t = unsafe { mythread() };

        // Hold the join lock across the state change so a racing joiner
        // cannot miss the wakeup, and hold the process lock so a racing
        // sibling exit cannot make both of us pick the non-last path.
        let join_guard = self.join_lock.lock();
        let guard = unsafe { (*p).lock() };
        unsafe { (*my_t).xstate = status };
        let last = guard
            .deref_info()
            .threads
            .iter()
            .all(|t| ptr::eq(t, my_t) || t.is_terminal());
        if last {
            drop(guard);
            drop(join_guard);
            self.exit_current(status);
        }
        unsafe { (*my_t).state = Threadstate::ZOMBIET };
        drop(guard);

        // Joiners recheck the state under the join lock, which is still
        // held, so this wakeup cannot be lost.
        unsafe { (*my_t).join_channel.wakeup() };

        let mut guard = unsafe { (*p).lock() };
        drop(join_guard);
        unsafe { guard.sched() };
        unreachable!("thread exit")
    }

    /// Become a zombie thread without the last-thread check: the racing
    /// sibling that killed this thread finishes the process teardown.
    pub(super) fn retire_current_thread(&self, status: i32) -> ! {
        let p = unsafe { myproc() };
        let my_t = unsafe { mythread() };

        let join_guard = self.join_lock.lock();
        {
            let _guard = unsafe { (*p).lock() };
            unsafe {
                (*my_t).xstate = status;
                (*my_t).state = Threadstate::ZOMBIET;
            }
        }
        unsafe { (*my_t).join_channel.wakeup() };

        let mut guard = unsafe { (*p).lock() };
        drop(join_guard);
        unsafe { guard.sched() };
        unreachable!("thread exit")
    }

    /// Wait for the sibling thread `tid` to terminate, free its slot, and
    /// copy its exit status to `addr` if one was given. Fails when joining
    /// self, or when no live sibling carries that tid (including one that
    /// was already joined).
    pub fn thread_join(&self, tid: Tid, addr: UVAddr) -> Result<(), ()> {
        let p = unsafe { myproc() };
        let my_t = unsafe { mythread() };
        if unsafe { (*my_t).tid } == tid {
            return Err(());
        }

        let mut join_guard = self.join_lock.lock();
        let xstate = loop {
            let mut guard = unsafe { (*p).lock() };
            let info = guard.deref_mut_info();
            let tix = info
                .threads
                .iter()
                .position(|t| t.tid == tid && t.state != Threadstate::UNUSEDT)
                .ok_or(())?;
            if info.threads[tix].state == Threadstate::ZOMBIET {
                let xstate = info.threads[tix].xstate;
                info.free_thread(tix);
                break xstate;
            }
            // Sleep until the thread publishes its exit under the join lock.
            let chan = &info.threads[tix].join_channel as *const WaitChannel;
            drop(guard);
            unsafe { (*chan).sleep(&mut join_guard) };
        };
        drop(join_guard);

        if !addr.is_null() {
            // SAFETY: data is private to the process and this is its thread.
            let data = unsafe { &mut *(*p).data.get() };
            unsafe { data.memory.assume_init_mut() }.copy_out(addr, &xstate)?;
        }
        Ok(())
    }
}
