//! Process, signal, thread, and semaphore system call bodies.

use crate::{
    kernel::Kernel,
    proc::{myproc, mythread},
    syscall::{argaddr, argint},
    vm::Addr,
};

impl Kernel {
    /// Terminate the current process; status reported to wait(). No return.
    pub fn sys_exit(&self) -> Result<usize, ()> {
        let n = argint(0)?;
        self.procs.exit_current(n)
    }

    /// Return the current process's PID.
    pub fn sys_getpid(&self) -> Result<usize, ()> {
        let p = unsafe { myproc() };
        Ok(unsafe { (*p).pid() } as usize)
    }

    /// Create a process.
    pub fn sys_fork(&self) -> Result<usize, ()> {
        Ok(self.procs.fork()? as usize)
    }

    /// Wait for a child to exit, returning its PID.
    pub fn sys_wait(&self) -> Result<usize, ()> {
        let addr = argaddr(0)?;
        Ok(self.procs.wait(addr)? as usize)
    }

    /// Grow process memory by n bytes. Returns the old break.
    pub fn sys_sbrk(&self) -> Result<usize, ()> {
        let n = argint(0)?;
        self.procs.resize_current(n)
    }

    /// Pause for n clock ticks.
    pub fn sys_sleep(&self) -> Result<usize, ()> {
        let n = argint(0)?;
        let p = unsafe { myproc() };
        let t = unsafe { mythread() };
        let mut ticks = self.ticks.lock();
        let ticks0 = *ticks;
        while ticks.wrapping_sub(ticks0) < n as u32 {
            if unsafe { (*p).killed() } || unsafe { (*t).killed } {
                return Err(());
            }
            ticks.sleep();
        }
        Ok(0)
    }

    /// Send a signal to process PID.
    pub fn sys_kill(&self) -> Result<usize, ()> {
        let pid = argint(0)?;
        let signum = argint(1)?;
        if signum < 0 {
            return Err(());
        }
        self.procs.kill(pid, signum as usize)?;
        Ok(0)
    }

    /// Return how many clock tick interrupts have occurred since start.
    pub fn sys_uptime(&self) -> Result<usize, ()> {
        Ok(*self.ticks.lock() as usize)
    }

    /// Replace the signal mask, returning the old one.
    pub fn sys_sigprocmask(&self) -> Result<usize, ()> {
        let mask = argint(0)? as u32;
        Ok(self.procs.sigprocmask(mask)? as usize)
    }

    /// Examine and change a signal action.
    pub fn sys_sigaction(&self) -> Result<usize, ()> {
        let signum = argint(0)?;
        let act = argaddr(1)?;
        let old_act = argaddr(2)?;
        if signum < 0 {
            return Err(());
        }
        self.procs.sigaction(signum as usize, act, old_act)
    }

    /// Return from a user signal handler. Called from the injected stub
    /// only; the returned value is the restored a0.
    pub fn sys_sigret(&self) -> Result<usize, ()> {
        Ok(self.procs.sigret())
    }

    /// Create a thread running `start_func` on the given user stack.
    pub fn sys_kthread_create(&self) -> Result<usize, ()> {
        let start_func = argaddr(0)?;
        let stack = argaddr(1)?;
        if start_func.is_null() || stack.is_null() {
            return Err(());
        }
        Ok(self.procs.thread_create(start_func, stack)? as usize)
    }

    /// Return the calling thread's TID.
    pub fn sys_kthread_id(&self) -> Result<usize, ()> {
        Ok(self.procs.thread_id() as usize)
    }

    /// Terminate the calling thread. No return.
    pub fn sys_kthread_exit(&self) -> Result<usize, ()> {
        let status = argint(0)?;
        self.procs.thread_exit(status)
    }

    /// Wait for a sibling thread to terminate.
    pub fn sys_kthread_join(&self) -> Result<usize, ()> {
        let tid = argint(0)?;
        let status = argaddr(1)?;
        self.procs.thread_join(tid, status)?;
        Ok(0)
    }

    /// Allocate a binary semaphore descriptor.
    pub fn sys_bsem_alloc(&self) -> Result<usize, ()> {
        self.bsems.alloc().ok_or(())
    }

    /// Free a binary semaphore descriptor.
    pub fn sys_bsem_free(&self) -> Result<usize, ()> {
        let descriptor = argint(0)?;
        if descriptor >= 0 {
            self.bsems.free(descriptor as usize);
        }
        Ok(0)
    }

    /// Block until the semaphore is available, then take it.
    pub fn sys_bsem_down(&self) -> Result<usize, ()> {
        let descriptor = argint(0)?;
        if descriptor >= 0 {
            self.bsems.down(descriptor as usize);
        }
        Ok(0)
    }

    /// Release the semaphore.
    pub fn sys_bsem_up(&self) -> Result<usize, ()> {
        let descriptor = argint(0)?;
        if descriptor >= 0 {
            self.bsems.up(descriptor as usize);
        }
        Ok(0)
    }
}
