use core::cell::UnsafeCell;
use core::mem::{self, MaybeUninit};
use core::ops::Deref;
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

use array_macro::array;
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::{
    asm::swtch,
    file::RcFile,
    fs::RcInode,
    kernel::kernel,
    lock::{pop_off, push_off, Spinlock},
    page::Page,
    param::{MAXPROCNAME, NOFILE, NTHREAD},
    riscv::{intr_get, PGSIZE},
    signal::{KernelHandler, SigHandler, SignalState},
    vm::UserMemory,
};

mod procs;
mod thread;
mod wait_channel;

pub use procs::*;
pub use wait_channel::*;

pub type Pid = i32;
pub type Tid = i32;

/// Saved registers for kernel context switches.
#[derive(Copy, Clone)]
#[repr(C)]
pub struct Context {
    pub ra: usize,
    pub sp: usize,

    /// Callee-saved
    pub s0: usize,
    pub s1: usize,
    pub s2: usize,
    pub s3: usize,
    pub s4: usize,
    pub s5: usize,
    pub s6: usize,
    pub s7: usize,
    pub s8: usize,
    pub s9: usize,
    pub s10: usize,
    pub s11: usize,
}

impl Context {
    pub const fn new() -> Self {
        Self {
            ra: 0,
            sp: 0,
            s0: 0,
            s1: 0,
            s2: 0,
            s3: 0,
            s4: 0,
            s5: 0,
            s6: 0,
            s7: 0,
            s8: 0,
            s9: 0,
            s10: 0,
            s11: 0,
        }
    }
}

/// Per-thread data for the trap handling code in trampoline.S.
/// All of a process's trapframes sit together in one page just under the
/// trampoline page in the user page table; thread `i` owns the `i`th slot.
/// Not specially mapped in the kernel page table.
/// uservec in trampoline.S saves user registers in the trapframe,
/// then initializes registers from the trapframe's
/// kernel_sp, kernel_hartid, kernel_satp, and jumps to kernel_trap.
/// usertrapret() and userret in trampoline.S set up
/// the trapframe's kernel_*, restore user registers from the
/// trapframe, switch to the user page table, and enter user space.
/// The trapframe includes callee-saved user registers like s0-s11 because the
/// return-to-user path via usertrapret() doesn't return through
/// the entire kernel call stack.
#[derive(Copy, Clone, AsBytes, FromBytes)]
#[repr(C)]
pub struct TrapFrame {
    /// 0 - kernel page table (satp: Supervisor Address Translation and Protection)
    pub kernel_satp: usize,

    /// 8 - top of this thread's kernel stack
    pub kernel_sp: usize,

    /// 16 - usertrap()
    pub kernel_trap: usize,

    /// 24 - saved user program counter (epc: Exception Program Counter)
    pub epc: usize,

    /// 32 - saved kernel tp
    pub kernel_hartid: usize,

    /// 40
    pub ra: usize,

    /// 48
    pub sp: usize,

    /// 56
    pub gp: usize,

    /// 64
    pub tp: usize,

    /// 72
    pub t0: usize,

    /// 80
    pub t1: usize,

    /// 88
    pub t2: usize,

    /// 96
    pub s0: usize,

    /// 104
    pub s1: usize,

    /// 112
    pub a0: usize,

    /// 120
    pub a1: usize,

    /// 128
    pub a2: usize,

    /// 136
    pub a3: usize,

    /// 144
    pub a4: usize,

    /// 152
    pub a5: usize,

    /// 160
    pub a6: usize,

    /// 168
    pub a7: usize,

    /// 176
    pub s2: usize,

    /// 184
    pub s3: usize,

    /// 192
    pub s4: usize,

    /// 200
    pub s5: usize,

    /// 208
    pub s6: usize,

    /// 216
    pub s7: usize,

    /// 224
    pub s8: usize,

    /// 232
    pub s9: usize,

    /// 240
    pub s10: usize,

    /// 248
    pub s11: usize,

    /// 256
    pub t3: usize,

    /// 264
    pub t4: usize,

    /// 272
    pub t5: usize,

    /// 280
    pub t6: usize,
}

// One page must fit every thread's trapframe.
const_assert!(NTHREAD * mem::size_of::<TrapFrame>() <= PGSIZE);

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Procstate {
    UNUSED,
    USED,
    ZOMBIE,
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Threadstate {
    UNUSEDT,
    SLEEPING,
    RUNNABLE,
    RUNNING,
    ZOMBIET,
}

impl Procstate {
    pub fn as_str(&self) -> &'static str {
        match self {
            Procstate::UNUSED => "unused",
            Procstate::USED => "used  ",
            Procstate::ZOMBIE => "zombie",
        }
    }
}

/// A kernel execution context bound to a process. The owning process's lock
/// must be held when using the fields, except that the running thread may
/// read its own `trap_frame`, `kstack`, and `context` without it.
pub struct Thread {
    pub state: Threadstate,

    /// Thread ID.
    pub tid: Tid,

    /// If non-zero, sleeping on this channel.
    pub chan: usize,

    /// Set when a sibling's exit asks this thread to die.
    pub killed: bool,

    /// Exit status to be returned to a joiner.
    pub xstate: i32,

    /// Virtual address of kernel stack. Retained by the slot across thread
    /// exit so a recycled slot reuses it; freed with the process.
    pub kstack: usize,

    /// This thread's slot in the process's trapframe page.
    pub trap_frame: *mut TrapFrame,

    /// swtch() here to run the thread.
    pub context: Context,

    /// Joiners sleep here until this thread terminates.
    pub join_channel: WaitChannel,
}

impl Thread {
    const fn new() -> Self {
        Self {
            state: Threadstate::UNUSEDT,
            tid: 0,
            chan: 0,
            killed: false,
            xstate: 0,
            kstack: 0,
            trap_frame: ptr::null_mut(),
            context: Context::new(),
            join_channel: WaitChannel::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, Threadstate::UNUSEDT | Threadstate::ZOMBIET)
    }
}

/// Proc::info's spinlock must be held when using these.
pub struct ProcInfo {
    /// Process state.
    pub state: Procstate,

    /// Process ID.
    pub pid: Pid,

    /// Exit status to be returned to parent's wait.
    pub xstate: i32,

    /// This process's threads. Thread 0 exists for the process lifetime.
    pub threads: [Thread; NTHREAD],

    /// Signal configuration and delivery state.
    pub sig: SignalState,

    /// Page backing up the interrupted trapframe while a user signal handler
    /// runs.
    pub trapframe_backup: *mut TrapFrame,
}

impl ProcInfo {
    const fn new() -> Self {
        Self {
            state: Procstate::UNUSED,
            pid: 0,
            xstate: 0,
            threads: array![_ => Thread::new(); NTHREAD],
            sig: SignalState::new(),
            trapframe_backup: ptr::null_mut(),
        }
    }

    /// Return a slot to UNUSEDT after the thread has terminated. The kernel
    /// stack stays with the slot.
    pub fn free_thread(&mut self, tix: usize) {
        let t = &mut self.threads[tix];
        t.chan = 0;
        t.killed = false;
        t.state = Threadstate::UNUSEDT;
    }
}

/// Proc::data are private to the process, so the lock need not be held.
pub struct ProcData {
    /// User memory manager.
    pub memory: MaybeUninit<UserMemory>,

    /// Open files.
    pub open_files: [Option<RcFile>; NOFILE],

    /// Current directory.
    pub cwd: Option<RcInode>,

    /// Process name (debugging).
    pub name: [u8; MAXPROCNAME],
}

impl ProcData {
    const fn new() -> Self {
        Self {
            memory: MaybeUninit::uninit(),
            open_files: array![_ => None; NOFILE],
            cwd: None,
            name: [0; MAXPROCNAME],
        }
    }
}

/// Per-process state.
///
/// # Safety
///
/// * If `info.state` ≠ `UNUSED`, then `data.memory` has been initialized,
///   every thread's `trap_frame` points into one valid page, and
///   `info.trapframe_backup` is a valid page.
/// * `parent` contains null or a valid pointer into the process pool.
///   `parent` can be null only for the initial process.
pub struct Proc {
    /// Parent process. The process system's wait lock must be held when
    /// using this.
    parent: UnsafeCell<*const Proc>,

    pub info: Spinlock<ProcInfo>,

    data: UnsafeCell<ProcData>,

    /// WaitChannel saying a child proc is dead.
    child_waitchannel: WaitChannel,

    /// If true, the process has been killed.
    killed: AtomicBool,
}

impl Proc {
    const fn new() -> Self {
        Self {
            parent: UnsafeCell::new(ptr::null()),
            info: Spinlock::new("proc", ProcInfo::new()),
            data: UnsafeCell::new(ProcData::new()),
            child_waitchannel: WaitChannel::new(),
            killed: AtomicBool::new(false),
        }
    }

    pub fn lock(&self) -> ProcGuard {
        mem::forget(self.info.lock());
        ProcGuard { ptr: self }
    }

    /// # Safety
    ///
    /// The returned value may be stale unless the caller holds the lock or
    /// is the process itself.
    pub unsafe fn pid(&self) -> Pid {
        unsafe { (*self.info.get_mut_raw()).pid }
    }

    /// Mark the process killed; it will exit on its next return to user
    /// space.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::Release);
    }

    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    /// Returns a raw pointer to this process's private data. The caller must
    /// be one of the process's own threads, or must otherwise know the
    /// process cannot be running.
    pub fn data_raw(&self) -> *mut ProcData {
        self.data.get()
    }

    /// Returns a mutable reference to this process's parent pointer.
    ///
    /// All parent fields are protected by the single wait lock of the
    /// process system, which the given guard witnesses.
    pub fn parent_mut<'b>(&'b self, _guard: &'b mut WaitGuard<'_>) -> &'b mut *const Proc {
        // SAFETY: the wait lock is held.
        unsafe { &mut *self.parent.get() }
    }
}

/// Assumption: `ptr`'s info spinlock is held.
pub struct ProcGuard {
    ptr: *const Proc,
}

impl ProcGuard {
    pub fn deref_info(&self) -> &ProcInfo {
        // SAFETY: the lock is held.
        unsafe { &*(*self.ptr).info.get_mut_raw() }
    }

    pub fn deref_mut_info(&mut self) -> &mut ProcInfo {
        // SAFETY: the lock is held and &mut self is exclusive.
        unsafe { &mut *(*self.ptr).info.get_mut_raw() }
    }

    /// This method returns a mutable reference to the process's `ProcData`.
    ///
    /// # Safety
    ///
    /// `ProcData` is normally private to the process's own threads; this must
    /// be called only when the process cannot be running elsewhere (it is
    /// being created or reaped, or it is the current process).
    pub unsafe fn deref_mut_data(&mut self) -> &mut ProcData {
        unsafe { &mut *(*self.ptr).data.get() }
    }

    pub fn raw(&self) -> *const Proc {
        self.ptr
    }

    /// Switch to scheduler. Must hold only this process's lock and have
    /// changed the current thread's state. Saves and restores
    /// interrupt_enabled because interrupt_enabled is a property of this
    /// kernel thread, not this CPU. It should be proc->interrupt_enabled and
    /// proc->noff, but that would break in the few places where a lock is
    /// held but there's no process.
    ///
    /// # Safety
    ///
    /// This guard must belong to the current process, and the current
    /// thread's state must not be RUNNING.
    pub unsafe fn sched(&mut self) {
        let c = kernel().current_cpu_raw();
        assert_eq!(unsafe { (*c).noff }, 1, "sched locks");
        assert!(!intr_get(), "sched interruptible");
        let t = unsafe { (*c).thread };
        assert_ne!(unsafe { (*t).state }, Threadstate::RUNNING, "sched running");

        let interrupt_enabled = unsafe { (*c).interrupt_enabled };
        unsafe { swtch(&mut (*t).context, &mut (*c).context) };

        // We cannot reuse `c`: swtch may have moved this thread to another
        // cpu.
        let c = kernel().current_cpu_raw();
        unsafe { (*c).interrupt_enabled = interrupt_enabled };
    }

    /// Wake the process's sleeping threads that wait on `chan`, except the
    /// calling thread.
    pub fn wakeup_threads(&mut self, chan: usize, exclude: *const Thread) {
        for t in &mut self.deref_mut_info().threads {
            if t as *const Thread != exclude && t.state == Threadstate::SLEEPING && t.chan == chan {
                t.state = Threadstate::RUNNABLE;
            }
        }
    }

    /// Frees a `Proc` structure and the data hanging from it, including user
    /// pages. Also clears the process's parent field.
    ///
    /// # Safety
    ///
    /// The process's state must be ZOMBIE, so no thread of it can run again.
    pub unsafe fn clear(&mut self, mut parent_guard: WaitGuard<'_>) {
        // SAFETY: this process cannot be running any longer.
        let data = unsafe { self.deref_mut_data() };
        // Dropping the memory returns the user pages and page-table pages.
        let _ = unsafe { data.memory.assume_init_read() };
        data.cwd = None;
        for file in &mut data.open_files {
            *file = None;
        }
        data.name[0] = 0;

        *(unsafe { &*self.ptr }).parent_mut(&mut parent_guard) = ptr::null();
        drop(parent_guard);

        let info = self.deref_mut_info();
        let trap_frames = mem::replace(&mut info.threads[0].trap_frame, ptr::null_mut());
        // SAFETY: trap_frames is the page allocated for this slot's
        // trapframes, according to the invariant of Proc.
        kernel().free(unsafe { Page::from_usize(trap_frames as usize) });
        let backup = mem::replace(&mut info.trapframe_backup, ptr::null_mut());
        // SAFETY: same as above.
        kernel().free(unsafe { Page::from_usize(backup as usize) });

        for (i, t) in info.threads.iter_mut().enumerate() {
            if i != 0 && t.kstack != 0 {
                // SAFETY: secondary kernel stacks come from the page
                // allocator and are owned by the slot.
                kernel().free(unsafe { Page::from_usize(t.kstack) });
                t.kstack = 0;
            }
            t.trap_frame = ptr::null_mut();
            t.chan = 0;
            t.killed = false;
            t.xstate = 0;
            t.state = Threadstate::UNUSEDT;
        }

        info.sig.reset();
        info.pid = 0;
        info.xstate = 0;
        info.state = Procstate::UNUSED;

        unsafe { &*self.ptr }.killed.store(false, Ordering::Release);
    }

    /// Deliver pending, unmasked signals to the current process. Called with
    /// the lock held on every return to user space. Kernel handlers run
    /// inline; a user handler rewrites the current thread's trapframe and
    /// suppresses further delivery until sigreturn.
    pub fn deliver_pending_signals(&mut self) {
        loop {
            let info = self.deref_mut_info();
            let signum = match info.sig.next_deliverable() {
                Some(n) => n,
                None => return,
            };
            let handler = info.sig.handler(signum);
            info.sig.begin_handler(signum);
            match handler {
                SigHandler::Kernel(kind) => {
                    self.run_kernel_handler(kind);
                    self.deref_mut_info().sig.finish_handler();
                }
                SigHandler::User(handler_va) => {
                    self.run_user_handler(signum, handler_va);
                    return;
                }
            }
        }
    }

    fn run_kernel_handler(&mut self, kind: KernelHandler) {
        match kind {
            KernelHandler::Kill => {
                unsafe { &*self.ptr }.kill();
                // Wake one sleeping thread so the kill is observed.
                for t in &mut self.deref_mut_info().threads {
                    if t.state == Threadstate::SLEEPING {
                        t.state = Threadstate::RUNNABLE;
                        break;
                    }
                }
            }
            KernelHandler::Stop => self.deref_mut_info().sig.stopped = true,
            KernelHandler::Cont => self.deref_mut_info().sig.stopped = false,
            KernelHandler::Ignore => {}
        }
    }

    /// Arrange for the current thread to run a user signal handler: save the
    /// interrupted trapframe in the backup page, push a copy of it and the
    /// sigreturn stub onto the user stack, and point the trapframe at the
    /// handler so that it returns into the stub.
    fn run_user_handler(&mut self, signum: usize, handler_va: usize) {
        let t = unsafe { mythread() };
        let tf = unsafe { &mut *(*t).trap_frame };
        let saved = *tf;

        let frame_sp = tf.sp.wrapping_sub(mem::size_of::<TrapFrame>());
        let stub_sp = frame_sp.wrapping_sub(SIGRET_CODE.len()) & !0xf;

        // SAFETY: this is the current process.
        let data = unsafe { self.deref_mut_data() };
        let memory = unsafe { data.memory.assume_init_mut() };
        if memory.copy_out(frame_sp.into(), &saved).is_err()
            || memory.copy_out_bytes(stub_sp.into(), &SIGRET_CODE).is_err()
        {
            // The user stack is unusable; give up on the handler.
            self.deref_mut_info().sig.finish_handler();
            return;
        }

        let info = self.deref_mut_info();
        unsafe { *info.trapframe_backup = saved };

        tf.epc = handler_va;
        tf.ra = stub_sp;
        tf.sp = stub_sp;
        tf.a0 = signum;
    }
}

impl Deref for ProcGuard {
    type Target = Proc;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.ptr }
    }
}

impl Drop for ProcGuard {
    fn drop(&mut self) {
        // SAFETY: the guard was created with the lock held.
        unsafe { (*self.ptr).info.unlock() };
    }
}

/// The machine code of the sigreturn stub copied onto the user stack:
/// `li a7, 24; ecall` (24 is the sigret system call).
/// od -t xC sigret stub
pub const SIGRET_CODE: [u8; 8] = [0x93, 0x08, 0x80, 0x01, 0x73, 0, 0, 0];

/// Return this CPU's ID.
///
/// Must be called with interrupts disabled, to prevent a race with the
/// thread being moved to a different CPU.
pub fn cpuid() -> usize {
    crate::riscv::r_tp()
}

/// Return the current struct Proc *, or null if none.
pub unsafe fn myproc() -> *mut Proc {
    unsafe { push_off() };
    let c = kernel().current_cpu_raw();
    let p = unsafe { (*c).proc };
    unsafe { pop_off() };
    p as *mut Proc
}

/// Return the current struct Thread *, or null if none.
pub unsafe fn mythread() -> *mut Thread {
    unsafe { push_off() };
    let c = kernel().current_cpu_raw();
    let t = unsafe { (*c).thread };
    unsafe { pop_off() };
    t
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_trapframe_fits_in_the_page() {
        let last = (NTHREAD - 1) * mem::size_of::<TrapFrame>();
        assert!(last + mem::size_of::<TrapFrame>() <= PGSIZE);
    }

    #[test]
    fn thread_slots_recycle_to_unused() {
        let mut info = ProcInfo::new();
        info.threads[3].state = Threadstate::ZOMBIET;
        info.threads[3].killed = true;
        info.threads[3].chan = 0xdead;
        info.free_thread(3);
        assert_eq!(info.threads[3].state, Threadstate::UNUSEDT);
        assert!(!info.threads[3].killed);
        assert_eq!(info.threads[3].chan, 0);
    }

    #[test]
    fn sigret_stub_is_li_a7_ecall() {
        // li a7, 24  =>  0x01800893
        let li = u32::from_le_bytes(SIGRET_CODE[0..4].try_into().unwrap());
        assert_eq!(li, (24 << 20) | (17 << 7) | 0x13);
        // ecall  =>  0x00000073
        let ecall = u32::from_le_bytes(SIGRET_CODE[4..8].try_into().unwrap());
        assert_eq!(ecall, 0x73);
    }
}
