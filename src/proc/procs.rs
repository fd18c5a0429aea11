use core::marker::PhantomPinned;
use core::pin::Pin;
use core::ptr;
use core::str;
use core::sync::atomic::{AtomicI32, Ordering};

use array_macro::array;
use itertools::izip;

use super::*;
use crate::{
    asm::swtch,
    fs,
    kernel::kernel,
    lock::{Spinlock, SpinlockGuard, Waitable},
    memlayout::kstack,
    page::Page,
    param::{NPROC, NTHREAD, ROOTDEV},
    println,
    riscv::{intr_on, PGSIZE},
    signal::{SigAction, SigSet, NSIG, SIGKILL},
    trap::usertrapret,
    vm::{Addr, UVAddr, UserMemory},
};

/// A user program that repeatedly sleeps.
/// od -t xC initcode
const INITCODE: [u8; 16] = [
    0x13, 0x05, 0x40, 0x06, // li a0, 100
    0x93, 0x08, 0xd0, 0, // li a7, 13 (sleep)
    0x73, 0, 0, 0, // ecall
    0x6f, 0xf0, 0x5f, 0xff, // jal x0, -12
];

/// Process system type containing & managing whole processes.
///
/// # Safety
///
/// `initial_proc` is null or valid. `initial_proc` is not modified after its
/// initialization in `user_proc_init`.
pub struct ProcessSystem {
    nextpid: AtomicI32,
    nexttid: AtomicI32,
    pub(super) process_pool: [Proc; NPROC],
    pub(super) initial_proc: *const Proc,

    // Helps ensure that wakeups of wait()ing
    // parents are not lost. Helps obey the
    // memory model when using p->parent.
    // Must be acquired before any p->lock.
    wait_lock: Spinlock<()>,

    // Serializes a terminating thread's state change against joiners, so the
    // join wakeup cannot be lost. Acquired before any p->lock.
    pub(super) join_lock: Spinlock<()>,

    // Sleep channels live at fixed addresses inside the pool.
    _marker: PhantomPinned,
}

// SAFETY: the shared mutable state inside the pool is protected by the
// per-process spinlocks and the wait lock.
unsafe impl Sync for ProcessSystem {}

/// A guard that holds the wait lock of the process system. Access to any
/// process's parent field goes through this.
pub struct WaitGuard<'s>(SpinlockGuard<'s, ()>);

impl Waitable for WaitGuard<'_> {
    unsafe fn raw_release(&mut self) {
        unsafe { self.0.raw_release() };
    }

    unsafe fn raw_acquire(&mut self) {
        unsafe { self.0.raw_acquire() };
    }
}

impl ProcessSystem {
    pub const fn new() -> Self {
        Self {
            nextpid: AtomicI32::new(1),
            nexttid: AtomicI32::new(1),
            process_pool: array![_ => Proc::new(); NPROC],
            initial_proc: ptr::null(),
            wait_lock: Spinlock::new("wait_lock", ()),
            join_lock: Spinlock::new("join_lock", ()),
            _marker: PhantomPinned,
        }
    }

    /// Initialize the process table at boot time: wire each slot's main
    /// thread to its preallocated kernel stack.
    pub fn init(self: Pin<&mut Self>) {
        // SAFETY: we don't move the ProcessSystem.
        let this = unsafe { self.get_unchecked_mut() };
        for (i, p) in this.process_pool.iter_mut().enumerate() {
            p.info.get_mut().threads[0].kstack = kstack(i);
        }
    }

    fn allocpid(&self) -> Pid {
        self.nextpid.fetch_add(1, Ordering::Relaxed)
    }

    pub(super) fn alloctid(&self) -> Tid {
        self.nexttid.fetch_add(1, Ordering::Relaxed)
    }

    /// Acquires the wait lock. Any process's parent field may be accessed
    /// through the returned guard.
    pub fn wait_guard(&self) -> WaitGuard<'_> {
        WaitGuard(self.wait_lock.lock())
    }

    /// Look in the process table for an UNUSED slot. If found, take ownership
    /// of the given pages, initialize state required to run in the kernel,
    /// and return with the slot's lock held. If there is no free slot, free
    /// the pages and return Err.
    fn alloc(&self, trap_frames: Page, backup: Page, memory: UserMemory) -> Result<ProcGuard, ()> {
        for p in &self.process_pool {
            let mut guard = p.lock();
            if guard.deref_info().state == Procstate::UNUSED {
                let trap_frames = trap_frames.into_usize();
                let info = guard.deref_mut_info();
                info.pid = self.allocpid();
                info.state = Procstate::USED;
                info.trapframe_backup = backup.into_usize() as *mut TrapFrame;

                // Partition the trapframe page across the thread slots and
                // give every slot a fresh tid.
                for (i, t) in info.threads.iter_mut().enumerate() {
                    t.trap_frame =
                        (trap_frames + i * core::mem::size_of::<TrapFrame>()) as *mut TrapFrame;
                    t.tid = self.alloctid();
                    t.state = Threadstate::UNUSEDT;
                    t.chan = 0;
                    t.killed = false;
                    t.xstate = 0;
                }

                // Set up the main thread's context to start executing at
                // forkret, which returns to user space.
                let t0 = &mut info.threads[0];
                t0.context = Context::new();
                t0.context.ra = forkret as usize;
                t0.context.sp = t0.kstack + PGSIZE;

                info.sig.reset();

                // SAFETY: the slot is not running yet.
                let data = unsafe { guard.deref_mut_data() };
                let _ = data.memory.write(memory);

                return Ok(guard);
            }
        }

        kernel().free(trap_frames);
        kernel().free(backup);
        Err(())
    }

    /// Set up first user process.
    pub fn user_proc_init(self: Pin<&mut Self>) {
        // SAFETY: we don't move the ProcessSystem.
        let this = unsafe { self.get_unchecked_mut() };

        let trap_frames = scopeguard::guard(kernel().alloc().expect("user_proc_init: alloc"), |p| {
            kernel().free(p)
        });
        let backup = scopeguard::guard(kernel().alloc().expect("user_proc_init: alloc"), |p| {
            kernel().free(p)
        });

        // Allocate one user page and copy init's instructions
        // and data into it.
        let memory = UserMemory::new(trap_frames.addr().into(), Some(&INITCODE))
            .expect("user_proc_init: UserMemory::new");

        let mut guard = this
            .alloc(
                scopeguard::ScopeGuard::into_inner(trap_frames),
                scopeguard::ScopeGuard::into_inner(backup),
                memory,
            )
            .expect("user_proc_init: ProcessSystem::alloc");

        this.initial_proc = guard.raw();

        // SAFETY: the process is not running yet.
        let data = unsafe { guard.deref_mut_data() };
        let name = b"initcode\x00";
        data.name[..name.len()].copy_from_slice(name);
        data.cwd = Some(kernel().itable.root());

        // Prepare for the very first "return" from kernel to user.
        let info = guard.deref_mut_info();
        unsafe {
            // User program counter.
            (*info.threads[0].trap_frame).epc = 0;
            // User stack pointer.
            (*info.threads[0].trap_frame).sp = PGSIZE;
        }
        info.threads[0].state = Threadstate::RUNNABLE;
    }

    /// Create a new process, copying the parent.
    /// Sets up child kernel stack to return as if from fork() system call.
    /// Returns Ok(new process id) on success, Err(()) on error.
    pub fn fork(&self) -> Result<Pid, ()> {
        let p = unsafe { myproc() };
        let t = unsafe { mythread() };

        let trap_frames =
            scopeguard::guard(kernel().alloc().ok_or(())?, |page| kernel().free(page));
        let backup = scopeguard::guard(kernel().alloc().ok_or(())?, |page| kernel().free(page));

        // Copy user memory from parent to child.
        // SAFETY: data is private to the process and this is its thread.
        let pdata = unsafe { &mut *(*p).data.get() };
        let memory = unsafe { pdata.memory.assume_init_mut() }
            .clone(trap_frames.addr().into())
            .ok_or(())?;

        // Allocate process.
        let mut np = self.alloc(
            scopeguard::ScopeGuard::into_inner(trap_frames),
            scopeguard::ScopeGuard::into_inner(backup),
            memory,
        )?;

        {
            let info = np.deref_mut_info();
            unsafe {
                // Copy saved user registers.
                *info.threads[0].trap_frame = *(*t).trap_frame;

                // Cause fork to return 0 in the child.
                (*info.threads[0].trap_frame).a0 = 0;
            }

            // The child inherits the signal mask and handler table, but not
            // the pending set or the stopped/handling state.
            // SAFETY: only the parent's own threads change its handler
            // table, and this is one of them.
            let psig = unsafe { &(*(*p).info.get_mut_raw()).sig };
            info.sig.inherit_from(psig);
        }

        // SAFETY: the child is not running yet.
        let npdata = unsafe { np.deref_mut_data() };

        // Increment reference counts on open file descriptors.
        for (nf, f) in izip!(npdata.open_files.iter_mut(), pdata.open_files.iter()) {
            if let Some(file) = f {
                *nf = Some(file.clone());
            }
        }
        npdata.cwd = pdata.cwd.clone();
        npdata.name.copy_from_slice(&pdata.name);

        let pid = np.deref_info().pid;

        // Now drop the child's guard before we acquire the wait lock.
        // This is because the lock order must be wait_lock -> proc lock.
        let child = np.raw();
        drop(np);

        // Record the parent link.
        let mut parent_guard = self.wait_guard();
        *unsafe { &*child }.parent_mut(&mut parent_guard) = p;
        drop(parent_guard);

        // Ready the child's main thread.
        let mut np = unsafe { (*child).lock() };
        np.deref_mut_info().threads[0].state = Threadstate::RUNNABLE;

        Ok(pid)
    }

    /// Pass p's abandoned children to init.
    /// The caller must hold the wait lock.
    fn reparent(&self, proc: *const Proc, parent_guard: &mut WaitGuard<'_>) {
        for pp in &self.process_pool {
            let parent = pp.parent_mut(parent_guard);
            if *parent == proc {
                *parent = self.initial_proc;
                // SAFETY: initial_proc is valid after boot.
                unsafe { (*self.initial_proc).child_waitchannel.wakeup() };
            }
        }
    }

    /// Wait for a child process to exit and return its pid.
    /// Return Err(()) if this process has no children.
    pub fn wait(&self, addr: UVAddr) -> Result<Pid, ()> {
        let p = unsafe { myproc() };
        let mut parent_guard = self.wait_guard();

        loop {
            // Scan through the pool looking for exited children.
            let mut havekids = false;
            for np in &self.process_pool {
                if *np.parent_mut(&mut parent_guard) != p as *const Proc {
                    continue;
                }
                // Make sure the child isn't still in exit() or swtch().
                let mut child = np.lock();

                havekids = true;
                if child.deref_info().state == Procstate::ZOMBIE {
                    // Found one.
                    let pid = child.deref_info().pid;
                    let xstate = child.deref_info().xstate;
                    if !addr.is_null() {
                        // SAFETY: data is private to the process and this is
                        // its thread.
                        let data = unsafe { &mut *(*p).data.get() };
                        if unsafe { data.memory.assume_init_mut() }
                            .copy_out(addr, &xstate)
                            .is_err()
                        {
                            return Err(());
                        }
                    }
                    // Reap the zombie child process.
                    // SAFETY: the child's state is ZOMBIE.
                    unsafe { child.clear(parent_guard) };
                    return Ok(pid);
                }
            }

            // No point waiting if we don't have any children.
            if !havekids || unsafe { (*p).killed() } || unsafe { (*mythread()).killed } {
                return Err(());
            }

            // Wait for a child to exit.
            //DOC: wait-sleep
            unsafe { &*p }.child_waitchannel.sleep(&mut parent_guard);
        }
    }

    /// Exit the current process. Does not return. An exited process remains
    /// in the zombie state until its parent calls wait().
    ///
    /// Every sibling thread is asked to die and this thread yields until all
    /// of them have; one thread's exit takes the whole process with it.
    pub fn exit_current(&self, status: i32) -> ! {
        let p = unsafe { myproc() };
        let my_t = unsafe { mythread() };
        assert!(p as *const Proc != self.initial_proc, "init exiting");

        // Wake anyone joining on the exiting thread.
        unsafe { (*my_t).join_channel.wakeup() };

        {
            let mut guard = unsafe { (*p).lock() };
            if unsafe { (*my_t).killed } {
                // A sibling's exit already claimed the teardown; just become
                // a zombie thread and let it finish.
                drop(guard);
                self.retire_current_thread(status);
            }
            // Ask every live sibling to die, waking sleepers so they observe
            // the request at their next trap boundary.
            for t in &mut guard.deref_mut_info().threads {
                if ptr::eq(t, my_t) {
                    continue;
                }
                if !t.is_terminal() {
                    t.killed = true;
                    if t.state == Threadstate::SLEEPING {
                        t.state = Threadstate::RUNNABLE;
                    }
                }
            }
        }

        // Yield until every sibling has reached a terminal state.
        loop {
            let done = {
                let guard = unsafe { (*p).lock() };
                guard
                    .deref_info()
                    .threads
                    .iter()
                    .all(|t| ptr::eq(t, my_t) || t.is_terminal())
            };
            if done {
                break;
            }
            unsafe { proc_yield() };
        }

        // Close all open files and release the cwd.
        // SAFETY: every sibling is terminal, so data belongs to this thread.
        let data = unsafe { &mut *(*p).data.get() };
        for file in &mut data.open_files {
            *file = None;
        }
        data.cwd = None;

        // Give any children to init.
        let mut parent_guard = self.wait_guard();
        self.reparent(p, &mut parent_guard);

        // Parent might be sleeping in wait().
        let parent = *unsafe { &*p }.parent_mut(&mut parent_guard);
        debug_assert!(!parent.is_null(), "exit_current: no parent");
        unsafe { (*parent).child_waitchannel.wakeup() };

        let mut guard = unsafe { (*p).lock() };
        unsafe { (*my_t).state = Threadstate::UNUSEDT };
        let info = guard.deref_mut_info();
        info.xstate = status;
        info.state = Procstate::ZOMBIE;

        // Should manually drop since this function never returns.
        drop(parent_guard);

        // Jump into the scheduler, never to return.
        unsafe { guard.sched() };

        unreachable!("zombie exit")
    }

    /// Send `signum` to the process with the given pid: set the bit in its
    /// pending set. Delivery happens when that process next returns to user
    /// space. A SIGKILL additionally marks the process killed and wakes one
    /// sleeping thread, so a fully blocked process still dies.
    pub fn kill(&self, pid: Pid, signum: usize) -> Result<(), ()> {
        if signum >= NSIG {
            return Err(());
        }
        for p in &self.process_pool {
            let mut guard = p.lock();
            if guard.deref_info().pid == pid {
                guard.deref_mut_info().sig.send(signum);
                if signum == SIGKILL {
                    p.kill();
                    for t in &mut guard.deref_mut_info().threads {
                        if t.state == Threadstate::SLEEPING {
                            t.state = Threadstate::RUNNABLE;
                            break;
                        }
                    }
                }
                return Ok(());
            }
        }
        Err(())
    }

    /// Atomically replace the current process's signal mask, returning the
    /// previous mask. Masks that would block SIGKILL or SIGSTOP are rejected.
    pub fn sigprocmask(&self, mask: u32) -> Result<u32, ()> {
        let p = unsafe { myproc() };
        let mut guard = unsafe { (*p).lock() };
        let old = guard
            .deref_mut_info()
            .sig
            .swap_mask(SigSet::from_bits(mask))?;
        Ok(old.bits())
    }

    /// Examine and change the action for `signum`. The old action is copied
    /// to `old_act` if it is non-null; the new action is read from `act`,
    /// which must be non-null.
    pub fn sigaction(&self, signum: usize, act: UVAddr, old_act: UVAddr) -> Result<usize, ()> {
        if signum >= NSIG {
            return Err(());
        }
        let p = unsafe { myproc() };
        let mut guard = unsafe { (*p).lock() };

        let old = guard.deref_info().sig.action(signum);
        if !old_act.is_null() {
            // SAFETY: this is the current process.
            let data = unsafe { guard.deref_mut_data() };
            unsafe { data.memory.assume_init_mut() }.copy_out(old_act, &old)?;
        }

        if act.is_null() {
            return Err(());
        }
        let mut new = SigAction::new(0, 0);
        {
            // SAFETY: this is the current process.
            let data = unsafe { guard.deref_mut_data() };
            unsafe { data.memory.assume_init_mut() }.copy_in(&mut new, act)?;
        }
        guard.deref_mut_info().sig.register(signum, new)?;
        Ok(0)
    }

    /// Return from a user signal handler: restore the trapframe saved at
    /// delivery and the signal mask saved by the handler dispatch. Returns
    /// the restored a0, so that the system-call return does not clobber it.
    pub fn sigret(&self) -> usize {
        let p = unsafe { myproc() };
        let t = unsafe { mythread() };
        let mut guard = unsafe { (*p).lock() };
        let info = guard.deref_mut_info();
        let tf = unsafe { &mut *(*t).trap_frame };
        unsafe { *tf = *info.trapframe_backup };
        info.sig.finish_handler();
        tf.a0
    }

    /// Grow or shrink the current process's memory by n bytes.
    /// Returns Ok(old size) on success. The lock serializes racing sbrks
    /// from sibling threads.
    pub fn resize_current(&self, n: i32) -> Result<usize, ()> {
        let p = unsafe { myproc() };
        let mut guard = unsafe { (*p).lock() };
        // SAFETY: this is the current process.
        let data = unsafe { guard.deref_mut_data() };
        unsafe { data.memory.assume_init_mut() }.resize(n)
    }

    /// Wake up all threads in the pool sleeping on the given channel.
    /// Must be called without any p->lock.
    pub fn wakeup_pool(&self, target: &WaitChannel) {
        let chan = target as *const WaitChannel as usize;
        let my_t = unsafe { mythread() } as *const Thread;
        for p in &self.process_pool {
            let mut guard = p.lock();
            guard.wakeup_threads(chan, my_t);
        }
    }

    /// Print a process listing to the console for debugging.
    /// Runs when user types ^P on console.
    /// Doesn't acquire locks in order to avoid wedging a stuck machine
    /// further.
    pub fn dump(&self) {
        println!();
        for p in &self.process_pool {
            let info = p.info.get_mut_raw();
            let state = unsafe { (*info).state };
            if state == Procstate::UNUSED {
                continue;
            }
            // SAFETY: best effort; the name may be torn but is NUL-bounded.
            let name = unsafe { &(*p.data.get()).name };
            let length = name.iter().position(|&c| c == 0).unwrap_or(name.len());
            println!(
                "{} {} {}",
                unsafe { (*info).pid },
                state.as_str(),
                str::from_utf8(&name[0..length]).unwrap_or("???")
            );
        }
    }
}

/// Per-CPU process scheduler.
/// Each CPU calls scheduler() after setting itself up.
/// Scheduler never returns. It loops, doing:
///  - choose a runnable thread of a used process slot to run.
///  - swtch to start running that thread.
///  - eventually that thread transfers control
///    via swtch back to the scheduler.
///
/// # Safety
///
/// Must be called once per CPU, after kernel initialization.
pub unsafe fn scheduler() -> ! {
    let c = kernel().current_cpu_raw();
    unsafe {
        (*c).proc = ptr::null();
        (*c).thread = ptr::null_mut();
    }
    loop {
        // Avoid deadlock by ensuring that devices can interrupt.
        unsafe { intr_on() };

        for p in &kernel().procs.process_pool {
            let mut guard = p.lock();
            if guard.deref_info().state != Procstate::USED {
                continue;
            }
            for tix in 0..NTHREAD {
                if guard.deref_info().threads[tix].state != Threadstate::RUNNABLE {
                    continue;
                }
                // A stopped process is dispatched only to take an unmasked
                // SIGCONT; otherwise move on to the next slot.
                if !guard.deref_info().sig.can_dispatch() {
                    break;
                }

                // Switch to the chosen thread. It is the thread's job to
                // release the process lock and then reacquire it before
                // jumping back to us.
                let info = guard.deref_mut_info();
                info.threads[tix].state = Threadstate::RUNNING;
                let t: *mut Thread = &mut info.threads[tix];
                unsafe {
                    (*c).proc = p as *const Proc;
                    (*c).thread = t;
                    (*c).tix = tix;
                }
                unsafe { swtch(&mut (*c).context, &mut (*t).context) };

                // The thread is done running for now. It should have changed
                // its state before coming back.
                unsafe {
                    (*c).proc = ptr::null();
                    (*c).thread = ptr::null_mut();
                }
            }
        }
    }
}

/// Give up the CPU for one scheduling round.
///
/// # Safety
///
/// Must be called from a running thread's context.
pub unsafe fn proc_yield() {
    let p = unsafe { myproc() };
    let t = unsafe { mythread() };
    let mut guard = unsafe { (*p).lock() };
    unsafe { (*t).state = Threadstate::RUNNABLE };
    unsafe { guard.sched() };
}

/// A fork child's very first scheduling by scheduler() will swtch to forkret.
pub(super) unsafe fn forkret() -> ! {
    // Still holding p->lock from scheduler.
    unsafe { (*myproc()).info.unlock() };

    // File system initialization must be run in the context of a regular
    // process (e.g., because it sleeps), and thus cannot be run from boot.
    fs::init(ROOTDEV);

    unsafe { usertrapret() }
}
