//! Console input and output. The only input the kernel consumes is the ^P
//! escape, which dumps the process table.

use crate::{kernel::kernel, uart};

const fn ctrl(x: u8) -> u8 {
    x - b'@'
}

/// Handle a console input byte, arriving via the UART interrupt.
pub fn intr(c: u8) {
    if c == ctrl(b'P') {
        // Print the process table.
        kernel().procs.dump();
    }
}

/// Send one byte to the console.
pub fn putc(c: u8) {
    uart::putc_sync(c);
}
