//! The riscv Platform Level Interrupt Controller (PLIC).

use crate::{
    memlayout::{plic_sclaim, plic_senable, plic_spriority, PLIC, UART0_IRQ},
    proc::cpuid,
};

pub unsafe fn init() {
    // Set desired IRQ priorities non-zero (otherwise disabled).
    unsafe { *((PLIC + UART0_IRQ * 4) as *mut u32) = 1 };
}

pub unsafe fn init_hart() {
    let hart = cpuid();

    // Set the uart's enable bit for this hart's S-mode.
    unsafe { *(plic_senable(hart) as *mut u32) = 1 << UART0_IRQ };

    // Set this hart's S-mode priority threshold to 0.
    unsafe { *(plic_spriority(hart) as *mut u32) = 0 };
}

/// Ask the PLIC what interrupt we should serve.
pub unsafe fn claim() -> u32 {
    let hart = cpuid();
    unsafe { *(plic_sclaim(hart) as *mut u32) }
}

/// Tell the PLIC we've served this IRQ.
pub unsafe fn complete(irq: u32) {
    let hart = cpuid();
    unsafe { *(plic_sclaim(hart) as *mut u32) = irq };
}
