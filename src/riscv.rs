//! RISC-V instructions and constants.
//!
//! On targets other than riscv64 (i.e., when the crate is built for host-side
//! unit tests) the CSR accessors are replaced by stubs so that the kernel's
//! data structures can still be exercised.

// Dead code is allowed in this file because not all components are used in the kernel.
#![allow(dead_code)]

use bitflags::bitflags;

/// Bytes per page.
pub const PGSIZE: usize = 4096;

/// Bits of offset within a page.
pub const PGSHIFT: usize = 12;

/// Bit position of the page number in PTE.
pub const PTESHIFT: usize = 10;

pub const PXMASK: usize = 0x1ff;

/// One beyond the highest possible virtual address.
/// MAXVA is actually one bit less than the max allowed by
/// Sv39, to avoid having to sign-extend virtual addresses
/// that have the high bit set.
pub const MAXVA: usize = 1 << (9 + 9 + 9 + 12 - 1);

pub const fn pgroundup(sz: usize) -> usize {
    (sz + PGSIZE - 1) & !(PGSIZE - 1)
}

pub const fn pgrounddown(a: usize) -> usize {
    a & !(PGSIZE - 1)
}

/// Shift a physical address to the right place for a PTE.
#[inline]
pub const fn pa2pte(pa: usize) -> usize {
    (pa >> PGSHIFT) << PTESHIFT
}

#[inline]
pub const fn pte2pa(pte: usize) -> usize {
    (pte >> PTESHIFT) << PGSHIFT
}

/// The index bits of virtual address `va` for page-table level `level`.
#[inline]
pub const fn pxshift(level: usize) -> usize {
    PGSHIFT + 9 * level
}

/// Use riscv's sv39 page table scheme.
pub const SATP_SV39: usize = 8 << 60;

#[inline]
pub const fn make_satp(pagetable: usize) -> usize {
    SATP_SV39 | (pagetable >> PGSHIFT)
}

bitflags! {
    /// Machine Status Register, mstatus.
    pub struct Mstatus: usize {
        /// Previous mode.
        const MPP_MASK = (3) << 11;
        const MPP_M = (3) << 11;
        const MPP_S = (1) << 11;
        const MPP_U = (0) << 11;
        /// Machine-mode interrupt enable.
        const MIE = (1) << 3;
    }
}

bitflags! {
    /// Supervisor Status Register, sstatus.
    pub struct Sstatus: usize {
        /// Previous mode, 1=Supervisor, 0=User
        const SPP = (1) << 8;
        /// Supervisor Previous Interrupt Enable
        const SPIE = (1) << 5;
        /// User Previous Interrupt Enable
        const UPIE = (1) << 4;
        /// Supervisor Interrupt Enable
        const SIE = (1) << 1;
        /// User Interrupt Enable
        const UIE = (1) << 0;
    }
}

bitflags! {
    /// Supervisor Interrupt Enable, sie.
    pub struct Sie: usize {
        /// external
        const SEIE = (1) << 9;
        /// timer
        const STIE = (1) << 5;
        /// software
        const SSIE = (1) << 1;
    }
}

bitflags! {
    /// Machine-mode Interrupt Enable, mie.
    pub struct Mie: usize {
        /// external
        const MEIE = (1) << 11;
        /// timer
        const MTIE = (1) << 7;
        /// software
        const MSIE = (1) << 3;
    }
}

bitflags! {
    /// Page-table entry flags.
    pub struct PteFlags: usize {
        /// valid
        const V = (1) << 0;
        const R = (1) << 1;
        const W = (1) << 2;
        const X = (1) << 3;
        /// user can access
        const U = (1) << 4;
    }
}

impl Mstatus {
    #[inline]
    pub fn read() -> Self {
        Self::from_bits_truncate(r_mstatus())
    }

    #[inline]
    pub unsafe fn write(self) {
        unsafe { w_mstatus(self.bits()) };
    }
}

impl Sstatus {
    #[inline]
    pub fn read() -> Self {
        Self::from_bits_truncate(r_sstatus())
    }

    #[inline]
    pub unsafe fn write(self) {
        unsafe { w_sstatus(self.bits()) };
    }
}

impl Sie {
    #[inline]
    pub fn read() -> Self {
        Self::from_bits_truncate(r_sie())
    }

    #[inline]
    pub unsafe fn write(self) {
        unsafe { w_sie(self.bits()) };
    }
}

impl Mie {
    #[inline]
    pub fn read() -> Self {
        Self::from_bits_truncate(r_mie())
    }

    #[inline]
    pub unsafe fn write(self) {
        unsafe { w_mie(self.bits()) };
    }
}

/// Enable device interrupts.
#[inline]
pub unsafe fn intr_on() {
    unsafe { (Sstatus::read() | Sstatus::SIE).write() };
}

/// Disable device interrupts.
#[inline]
pub unsafe fn intr_off() {
    unsafe { (Sstatus::read() - Sstatus::SIE).write() };
}

/// Are device interrupts enabled?
#[inline]
pub fn intr_get() -> bool {
    Sstatus::read().contains(Sstatus::SIE)
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "riscv64")] {
        use core::arch::asm;

        /// Which hart (core) is this?
        #[inline]
        pub fn r_mhartid() -> usize {
            let mut x;
            unsafe { asm!("csrr {x}, mhartid", x = out(reg) x) };
            x
        }

        #[inline]
        fn r_mstatus() -> usize {
            let mut x;
            unsafe { asm!("csrr {x}, mstatus", x = out(reg) x) };
            x
        }

        #[inline]
        unsafe fn w_mstatus(x: usize) {
            unsafe { asm!("csrw mstatus, {x}", x = in(reg) x) };
        }

        /// Machine exception program counter, holds the instruction address
        /// to which a return from exception will go.
        #[inline]
        pub unsafe fn w_mepc(x: usize) {
            unsafe { asm!("csrw mepc, {x}", x = in(reg) x) };
        }

        #[inline]
        fn r_sstatus() -> usize {
            let mut x;
            unsafe { asm!("csrr {x}, sstatus", x = out(reg) x) };
            x
        }

        #[inline]
        unsafe fn w_sstatus(x: usize) {
            unsafe { asm!("csrw sstatus, {x}", x = in(reg) x) };
        }

        /// Supervisor Interrupt Pending.
        #[inline]
        pub fn r_sip() -> usize {
            let mut x;
            unsafe { asm!("csrr {x}, sip", x = out(reg) x) };
            x
        }

        #[inline]
        pub unsafe fn w_sip(x: usize) {
            unsafe { asm!("csrw sip, {x}", x = in(reg) x) };
        }

        #[inline]
        fn r_sie() -> usize {
            let mut x;
            unsafe { asm!("csrr {x}, sie", x = out(reg) x) };
            x
        }

        #[inline]
        unsafe fn w_sie(x: usize) {
            unsafe { asm!("csrw sie, {x}", x = in(reg) x) };
        }

        #[inline]
        fn r_mie() -> usize {
            let mut x;
            unsafe { asm!("csrr {x}, mie", x = out(reg) x) };
            x
        }

        #[inline]
        unsafe fn w_mie(x: usize) {
            unsafe { asm!("csrw mie, {x}", x = in(reg) x) };
        }

        /// Supervisor exception program counter, holds the instruction
        /// address to which a return from exception will go.
        #[inline]
        pub unsafe fn w_sepc(x: usize) {
            unsafe { asm!("csrw sepc, {x}", x = in(reg) x) };
        }

        #[inline]
        pub fn r_sepc() -> usize {
            let mut x;
            unsafe { asm!("csrr {x}, sepc", x = out(reg) x) };
            x
        }

        /// Machine Exception Delegation.
        #[inline]
        pub unsafe fn w_medeleg(x: usize) {
            unsafe { asm!("csrw medeleg, {x}", x = in(reg) x) };
        }

        /// Machine Interrupt Delegation.
        #[inline]
        pub unsafe fn w_mideleg(x: usize) {
            unsafe { asm!("csrw mideleg, {x}", x = in(reg) x) };
        }

        /// Supervisor Trap-Vector Base Address, low two bits are mode.
        #[inline]
        pub unsafe fn w_stvec(x: usize) {
            unsafe { asm!("csrw stvec, {x}", x = in(reg) x) };
        }

        /// Machine-mode interrupt vector.
        #[inline]
        pub unsafe fn w_mtvec(x: usize) {
            unsafe { asm!("csrw mtvec, {x}", x = in(reg) x) };
        }

        /// Physical Memory Protection, to give supervisor mode
        /// access to all of physical memory.
        #[inline]
        pub unsafe fn w_pmpcfg0(x: usize) {
            unsafe { asm!("csrw pmpcfg0, {x}", x = in(reg) x) };
        }

        #[inline]
        pub unsafe fn w_pmpaddr0(x: usize) {
            unsafe { asm!("csrw pmpaddr0, {x}", x = in(reg) x) };
        }

        /// Supervisor address translation and protection;
        /// holds the address of the page table.
        #[inline]
        pub unsafe fn w_satp(x: usize) {
            unsafe { asm!("csrw satp, {x}", x = in(reg) x) };
        }

        #[inline]
        pub fn r_satp() -> usize {
            let mut x;
            unsafe { asm!("csrr {x}, satp", x = out(reg) x) };
            x
        }

        /// Machine-mode scratch register, for early trap handlers.
        #[inline]
        pub unsafe fn w_mscratch(x: usize) {
            unsafe { asm!("csrw mscratch, {x}", x = in(reg) x) };
        }

        /// Supervisor Trap Cause.
        #[inline]
        pub fn r_scause() -> usize {
            let mut x;
            unsafe { asm!("csrr {x}, scause", x = out(reg) x) };
            x
        }

        /// Supervisor Trap Value.
        #[inline]
        pub fn r_stval() -> usize {
            let mut x;
            unsafe { asm!("csrr {x}, stval", x = out(reg) x) };
            x
        }

        /// Read the thread pointer, which holds this core's hartid.
        #[inline]
        pub fn r_tp() -> usize {
            let mut x;
            unsafe { asm!("mv {x}, tp", x = out(reg) x) };
            x
        }

        #[inline]
        pub unsafe fn w_tp(x: usize) {
            unsafe { asm!("mv tp, {x}", x = in(reg) x) };
        }

        /// Flush the TLB.
        #[inline]
        pub unsafe fn sfence_vma() {
            // The zero, zero means flush all TLB entries.
            unsafe { asm!("sfence.vma zero, zero") };
        }
    } else {
        // Host-side stubs. Interrupts read as disabled and this is always
        // "cpu 0", which is what the lock primitives need; everything that
        // would actually touch hardware state panics.

        use core::sync::atomic::{AtomicUsize, Ordering};

        static SSTATUS: AtomicUsize = AtomicUsize::new(0);

        pub fn r_mhartid() -> usize {
            0
        }

        fn r_mstatus() -> usize {
            0
        }

        unsafe fn w_mstatus(_x: usize) {}

        pub unsafe fn w_mepc(_x: usize) {
            unimplemented!("mepc is only available on RISC-V")
        }

        fn r_sstatus() -> usize {
            SSTATUS.load(Ordering::Relaxed)
        }

        unsafe fn w_sstatus(x: usize) {
            SSTATUS.store(x, Ordering::Relaxed);
        }

        pub fn r_sip() -> usize {
            0
        }

        pub unsafe fn w_sip(_x: usize) {}

        fn r_sie() -> usize {
            0
        }

        unsafe fn w_sie(_x: usize) {}

        fn r_mie() -> usize {
            0
        }

        unsafe fn w_mie(_x: usize) {}

        pub unsafe fn w_sepc(_x: usize) {
            unimplemented!("sepc is only available on RISC-V")
        }

        pub fn r_sepc() -> usize {
            0
        }

        pub unsafe fn w_medeleg(_x: usize) {}

        pub unsafe fn w_mideleg(_x: usize) {}

        pub unsafe fn w_stvec(_x: usize) {}

        pub unsafe fn w_mtvec(_x: usize) {}

        pub unsafe fn w_pmpcfg0(_x: usize) {}

        pub unsafe fn w_pmpaddr0(_x: usize) {}

        pub unsafe fn w_satp(_x: usize) {
            unimplemented!("satp is only available on RISC-V")
        }

        pub fn r_satp() -> usize {
            0
        }

        pub unsafe fn w_mscratch(_x: usize) {}

        pub fn r_scause() -> usize {
            0
        }

        pub fn r_stval() -> usize {
            0
        }

        pub fn r_tp() -> usize {
            0
        }

        pub unsafe fn w_tp(_x: usize) {}

        pub unsafe fn sfence_vma() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_rounding() {
        assert_eq!(pgroundup(0), 0);
        assert_eq!(pgroundup(1), PGSIZE);
        assert_eq!(pgroundup(PGSIZE), PGSIZE);
        assert_eq!(pgroundup(PGSIZE + 1), 2 * PGSIZE);
        assert_eq!(pgrounddown(PGSIZE - 1), 0);
        assert_eq!(pgrounddown(2 * PGSIZE + 7), 2 * PGSIZE);
    }

    #[test]
    fn pte_address_round_trip() {
        let pa = 0x8020_3000;
        assert_eq!(pte2pa(pa2pte(pa)), pa);
    }
}
