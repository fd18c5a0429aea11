use core::fmt::{self, Write};

use crate::console;

pub struct Printer {}

impl Printer {
    pub const fn new() -> Self {
        Self {}
    }
}

impl Write for Printer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for c in s.bytes() {
            console::putc(c);
        }
        Ok(())
    }
}
