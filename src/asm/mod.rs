//! The kernel's assembly shims: the boot entry, the trap vectors, the
//! context switch, and the user/kernel trampoline, plus the linker symbols
//! the rest of the kernel needs.
//!
//! On non-RISC-V targets (host-side unit tests) the symbols are stand-ins so
//! that test binaries link; none of them may actually run there.

// Dead code is allowed in this file because not every symbol is used on
// every target.
#![allow(dead_code)]

use crate::proc::Context;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "riscv64")] {
        use core::arch::global_asm;
        use core::ptr;

        global_asm!(include_str!("entry.S"));
        global_asm!(include_str!("kernelvec.S"));
        global_asm!(include_str!("swtch.S"));
        global_asm!(include_str!("trampoline.S"));

        extern "C" {
            // trampoline.S
            static mut trampoline: [u8; 0];
            static mut uservec: [u8; 0];
            static mut userret: [u8; 0];

            // kernel.ld
            static mut etext: [u8; 0];
            static mut end: [u8; 0];

            /// swtch.S: save the callee-saved registers in `old`, load them
            /// from `new`.
            pub fn swtch(old: *mut Context, new: *mut Context);

            /// kernelvec.S
            pub fn kernelvec();
            pub fn timervec();
        }

        pub fn trampoline_addr() -> usize {
            unsafe { ptr::addr_of!(trampoline) as usize }
        }

        pub fn uservec_addr() -> usize {
            unsafe { ptr::addr_of!(uservec) as usize }
        }

        pub fn userret_addr() -> usize {
            unsafe { ptr::addr_of!(userret) as usize }
        }

        /// End of kernel code.
        pub fn etext_addr() -> usize {
            unsafe { ptr::addr_of!(etext) as usize }
        }

        /// First address after the kernel image.
        pub fn end_addr() -> usize {
            unsafe { ptr::addr_of!(end) as usize }
        }
    } else {
        /// # Safety
        ///
        /// Never callable; context switching exists only on RISC-V.
        pub unsafe fn swtch(_old: *mut Context, _new: *mut Context) {
            unimplemented!("swtch is only available on RISC-V")
        }

        /// # Safety
        ///
        /// Never callable; the trap vector exists only on RISC-V.
        pub unsafe extern "C" fn kernelvec() {
            unimplemented!("kernelvec is only available on RISC-V")
        }

        /// # Safety
        ///
        /// Never callable; the timer vector exists only on RISC-V.
        pub unsafe extern "C" fn timervec() {
            unimplemented!("timervec is only available on RISC-V")
        }

        pub fn trampoline_addr() -> usize {
            0
        }

        pub fn uservec_addr() -> usize {
            0
        }

        pub fn userret_addr() -> usize {
            0
        }

        pub fn etext_addr() -> usize {
            0
        }

        pub fn end_addr() -> usize {
            0
        }
    }
}
