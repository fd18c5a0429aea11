use core::ptr;

use crate::proc::{Context, Proc, Thread};

/// Per-CPU state.
pub struct Cpu {
    /// The process running on this cpu, or null.
    pub proc: *const Proc,

    /// The thread running on this cpu, or null. Points into the thread array
    /// of `proc`; valid only while `proc` is set.
    pub thread: *mut Thread,

    /// Index of `thread` within its process's thread array.
    pub tix: usize,

    /// swtch() here to enter scheduler().
    pub context: Context,

    /// Depth of push_off() nesting.
    pub noff: u32,

    /// Were interrupts enabled before push_off()?
    pub interrupt_enabled: bool,
}

impl Cpu {
    pub const fn new() -> Self {
        Self {
            proc: ptr::null(),
            thread: ptr::null_mut(),
            tix: 0,
            context: Context::new(),
            noff: 0,
            interrupt_enabled: false,
        }
    }
}
