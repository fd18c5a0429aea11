//! Machine-mode boot. Each hart arrives here from entry.S and drops to
//! supervisor mode in kernel_main().

use crate::param::NCPU;

/// entry.S needs one stack per CPU.
#[repr(C, align(16))]
pub struct Stack(#[allow(dead_code)] [u8; 4096 * NCPU]);

#[no_mangle]
pub static mut stack0: Stack = Stack([0; 4096 * NCPU]);

cfg_if::cfg_if! {
    if #[cfg(target_arch = "riscv64")] {
        use core::arch::asm;
        use core::ptr;

        use crate::asm::timervec;
        use crate::kernel::kernel_main;
        use crate::memlayout::{clint_mtimecmp, CLINT_MTIME};
        use crate::riscv::{
            r_mhartid, w_medeleg, w_mepc, w_mideleg, w_mscratch, w_mtvec, w_pmpaddr0, w_pmpcfg0,
            w_satp, w_tp, Mie, Mstatus, Sie,
        };

        /// A scratch area per CPU for machine-mode timer interrupts.
        static mut TIMER_SCRATCH: [[usize; 5]; NCPU] = [[0; 5]; NCPU];

        /// entry.S jumps here in machine mode on stack0.
        #[no_mangle]
        pub unsafe extern "C" fn start() -> ! {
            // Set M Previous Privilege mode to Supervisor, for mret.
            let mut x = Mstatus::read();
            x.remove(Mstatus::MPP_MASK);
            x.insert(Mstatus::MPP_S);
            unsafe { x.write() };

            // Set M Exception Program Counter to kernel_main, for mret.
            unsafe { w_mepc(kernel_main as usize) };

            // Disable paging for now.
            unsafe { w_satp(0) };

            // Delegate all interrupts and exceptions to supervisor mode.
            unsafe { w_medeleg(0xffff) };
            unsafe { w_mideleg(0xffff) };
            unsafe { (Sie::read() | Sie::SEIE | Sie::STIE | Sie::SSIE).write() };

            // Configure Physical Memory Protection to give supervisor mode
            // access to all of physical memory.
            unsafe { w_pmpaddr0(0x3fffffffffffff) };
            unsafe { w_pmpcfg0(0xf) };

            // Ask for clock interrupts.
            unsafe { timer_init() };

            // Keep each CPU's hartid in its tp register, for cpuid().
            let id = r_mhartid();
            unsafe { w_tp(id) };

            // Switch to supervisor mode and jump to kernel_main().
            unsafe { asm!("mret", options(noreturn)) }
        }

        /// Arrange to receive timer interrupts in machine mode, which arrive
        /// at timervec in kernelvec.S, which turns them into software
        /// interrupts for devintr() in trap.rs.
        unsafe fn timer_init() {
            // Each CPU has a separate source of timer interrupts.
            let id = r_mhartid();

            // Ask the CLINT for a timer interrupt.
            // About 1/10th second in qemu.
            let interval: u64 = 1000000;
            unsafe {
                *(clint_mtimecmp(id) as *mut u64) = *(CLINT_MTIME as *const u64) + interval;
            }

            // Prepare information in scratch[] for timervec:
            // scratch[0..2] : space for timervec to save registers.
            // scratch[3] : address of the CLINT MTIMECMP register.
            // scratch[4] : desired interval (in cycles) between interrupts.
            let scratch = unsafe { &mut TIMER_SCRATCH[id] };
            scratch[3] = clint_mtimecmp(id);
            scratch[4] = interval as usize;
            unsafe { w_mscratch(ptr::addr_of!(scratch[0]) as usize) };

            // Set the machine-mode trap handler.
            unsafe { w_mtvec(timervec as usize) };

            // Enable machine-mode interrupts.
            unsafe { (Mstatus::read() | Mstatus::MIE).write() };

            // Enable machine-mode timer interrupts.
            unsafe { (Mie::read() | Mie::MTIE).write() };
        }
    }
}
