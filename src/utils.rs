// HACK(@efenniht): Block inlining to avoid an infinite loop miscompilation of LLVM:
// https://github.com/rust-lang/rust/issues/28728.
#[inline(never)]
pub fn spin_loop() -> ! {
    loop {
        ::core::hint::spin_loop();
    }
}

/// Unwraps a `Result<T, E>`, or evaluates the given expression (e.g., `return`
/// or `break`) when it is an `Err`.
#[macro_export]
macro_rules! ok_or {
    ($e:expr, $err:expr) => {
        match $e {
            Ok(r) => r,
            Err(_) => $err,
        }
    };
}

#[cfg(test)]
pub mod testing {
    use std::sync::{Mutex, MutexGuard};

    static SERIAL: Mutex<()> = Mutex::new(());

    /// On the host, every test thread is "cpu 0", so tests that go through
    /// the spinlock path must not run concurrently. Take this first.
    pub fn serial() -> MutexGuard<'static, ()> {
        SERIAL.lock().unwrap_or_else(|e| e.into_inner())
    }
}
