//! Low-level driver routines for the 16550a UART.

use core::ptr;

use crate::{
    console,
    kernel::kernel,
    lock::{pop_off, push_off},
    memlayout::UART0,
    utils::spin_loop,
};

/// Receive holding register (for input bytes).
const RHR: usize = 0;
/// Transmit holding register (for output bytes).
const THR: usize = 0;
/// Interrupt enable register.
const IER: usize = 1;
/// FIFO control register.
const FCR: usize = 2;
/// Line control register.
const LCR: usize = 3;
/// Line status register.
const LSR: usize = 5;

const IER_RX_ENABLE: u8 = 1 << 0;
const FCR_FIFO_ENABLE: u8 = 1 << 0;
/// Clear the content of the two FIFOs.
const FCR_FIFO_CLEAR: u8 = 3 << 1;
const LCR_EIGHT_BITS: u8 = 3 << 0;
/// Special mode to set baud rate.
const LCR_BAUD_LATCH: u8 = 1 << 7;
/// Input is waiting to be read from RHR.
const LSR_RX_READY: u8 = 1 << 0;
/// THR can accept another character to send.
const LSR_TX_IDLE: u8 = 1 << 5;

/// The UART control registers are memory-mapped at address UART0.
fn reg(r: usize) -> *mut u8 {
    (UART0 + r) as *mut u8
}

fn read_reg(r: usize) -> u8 {
    unsafe { ptr::read_volatile(reg(r)) }
}

fn write_reg(r: usize, v: u8) {
    unsafe { ptr::write_volatile(reg(r), v) }
}

pub unsafe fn init() {
    // Disable interrupts.
    write_reg(IER, 0x00);

    // Special mode to set baud rate.
    write_reg(LCR, LCR_BAUD_LATCH);

    // LSB for baud rate of 38.4K.
    write_reg(0, 0x03);

    // MSB for baud rate of 38.4K.
    write_reg(1, 0x00);

    // Leave set-baud mode, and set word length to 8 bits, no parity.
    write_reg(LCR, LCR_EIGHT_BITS);

    // Reset and enable FIFOs.
    write_reg(FCR, FCR_FIFO_ENABLE | FCR_FIFO_CLEAR);

    // Enable receive interrupts.
    write_reg(IER, IER_RX_ENABLE);
}

/// Write one output byte to the UART, polling until it is ready. Used by the
/// kernel printer; interrupts stay masked via push_off so a console dump
/// cannot interleave with itself.
pub fn putc_sync(c: u8) {
    unsafe { push_off() };

    if kernel().is_panicked() {
        spin_loop();
    }

    // Wait for Transmit Holding Empty to be set in LSR.
    while read_reg(LSR) & LSR_TX_IDLE == 0 {}
    write_reg(THR, c);

    unsafe { pop_off() };
}

/// Read one input byte from the UART, if one is waiting.
fn getc() -> Option<u8> {
    if read_reg(LSR) & LSR_RX_READY != 0 {
        Some(read_reg(RHR))
    } else {
        None
    }
}

/// Handle a UART interrupt: drain the receive FIFO into the console.
/// Called from devintr().
pub unsafe fn intr() {
    while let Some(c) = getc() {
        console::intr(c);
    }
}
