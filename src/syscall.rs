//! System call numbers, argument marshalling, and dispatch.

use crate::{
    kernel::Kernel,
    println,
    proc::{myproc, mythread},
    vm::UVAddr,
};

pub const SYS_FORK: i32 = 1;
pub const SYS_EXIT: i32 = 2;
pub const SYS_WAIT: i32 = 3;
pub const SYS_KILL: i32 = 6;
pub const SYS_GETPID: i32 = 11;
pub const SYS_SBRK: i32 = 12;
pub const SYS_SLEEP: i32 = 13;
pub const SYS_UPTIME: i32 = 14;
pub const SYS_SIGPROCMASK: i32 = 22;
pub const SYS_SIGACTION: i32 = 23;
pub const SYS_SIGRET: i32 = 24;
pub const SYS_KTHREAD_CREATE: i32 = 25;
pub const SYS_KTHREAD_ID: i32 = 26;
pub const SYS_KTHREAD_EXIT: i32 = 27;
pub const SYS_KTHREAD_JOIN: i32 = 28;
pub const SYS_BSEM_ALLOC: i32 = 29;
pub const SYS_BSEM_FREE: i32 = 30;
pub const SYS_BSEM_DOWN: i32 = 31;
pub const SYS_BSEM_UP: i32 = 32;

/// Fetch the raw n-th system call argument from the current thread's
/// trapframe.
fn argraw(n: usize) -> usize {
    let t = unsafe { mythread() };
    let tf = unsafe { &*(*t).trap_frame };
    match n {
        0 => tf.a0,
        1 => tf.a1,
        2 => tf.a2,
        3 => tf.a3,
        4 => tf.a4,
        5 => tf.a5,
        _ => panic!("argraw"),
    }
}

/// Fetch the nth 32-bit system call argument.
pub fn argint(n: usize) -> Result<i32, ()> {
    Ok(argraw(n) as i32)
}

/// Retrieve an argument as a pointer.
/// Doesn't check for legality, since
/// copyin/copyout will do that.
pub fn argaddr(n: usize) -> Result<UVAddr, ()> {
    Ok(argraw(n).into())
}

impl Kernel {
    /// Dispatch the system call `num` for the current thread.
    ///
    /// # Safety
    ///
    /// Must be called from a running thread's kernel context.
    pub unsafe fn syscall(&'static self, num: i32) -> Result<usize, ()> {
        match num {
            SYS_FORK => self.sys_fork(),
            SYS_EXIT => self.sys_exit(),
            SYS_WAIT => self.sys_wait(),
            SYS_KILL => self.sys_kill(),
            SYS_GETPID => self.sys_getpid(),
            SYS_SBRK => self.sys_sbrk(),
            SYS_SLEEP => self.sys_sleep(),
            SYS_UPTIME => self.sys_uptime(),
            SYS_SIGPROCMASK => self.sys_sigprocmask(),
            SYS_SIGACTION => self.sys_sigaction(),
            SYS_SIGRET => self.sys_sigret(),
            SYS_KTHREAD_CREATE => self.sys_kthread_create(),
            SYS_KTHREAD_ID => self.sys_kthread_id(),
            SYS_KTHREAD_EXIT => self.sys_kthread_exit(),
            SYS_KTHREAD_JOIN => self.sys_kthread_join(),
            SYS_BSEM_ALLOC => self.sys_bsem_alloc(),
            SYS_BSEM_FREE => self.sys_bsem_free(),
            SYS_BSEM_DOWN => self.sys_bsem_down(),
            SYS_BSEM_UP => self.sys_bsem_up(),
            _ => {
                let p = unsafe { myproc() };
                println!("{}: unknown sys call {}", unsafe { (*p).pid() }, num);
                Err(())
            }
        }
    }
}
