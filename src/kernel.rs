use core::cell::UnsafeCell;
use core::fmt::{self, Write};
use core::mem::MaybeUninit;
use core::pin::Pin;
use core::sync::atomic::{AtomicBool, Ordering};

use array_macro::array;
use pin_project::pin_project;

use crate::{
    bsem::SemaphoreTable,
    cpu::Cpu,
    file::FileTable,
    fs::Itable,
    kalloc::Kmem,
    lock::{Sleepablelock, Spinlock},
    page::Page,
    param::NCPU,
    plic,
    printer::Printer,
    proc::{cpuid, myproc, scheduler, Pid, ProcessSystem},
    trap, uart,
    vm::KernelMemory,
};

/// The kernel.
static KERNEL: KernelCell = KernelCell(UnsafeCell::new(Kernel::zero()));

struct KernelCell(UnsafeCell<Kernel>);

// SAFETY: the kernel's shared mutable state is protected by its own locks,
// and the mutable accesses during boot happen before any other CPU runs.
unsafe impl Sync for KernelCell {}

/// After initialization, the kernel is safe to access immutably from any CPU.
#[inline]
pub fn kernel() -> &'static Kernel {
    unsafe { &*KERNEL.0.get() }
}

/// Returns a pinned mutable reference to the kernel.
///
/// # Safety
///
/// Only the boot CPU may use this, before the other CPUs are released.
#[inline]
unsafe fn kernel_pin() -> Pin<&'static mut Kernel> {
    unsafe { Pin::new_unchecked(&mut *KERNEL.0.get()) }
}

#[pin_project]
pub struct Kernel {
    panicked: AtomicBool,

    pub printer: Spinlock<Printer>,

    pub kmem: Spinlock<Kmem>,

    /// The kernel's page table.
    memory: MaybeUninit<KernelMemory>,

    pub ticks: Sleepablelock<u32>,

    /// The process system. Pinned: sleep channels live at fixed addresses
    /// inside it.
    #[pin]
    pub procs: ProcessSystem,

    // The `Cpu` struct of the current cpu can be mutated. To do so, we need
    // to obtain mutable pointers to the elements of `cpus` from a shared
    // reference of a `Kernel`. It requires interior mutability, so we use
    // `UnsafeCell`.
    cpus: [UnsafeCell<Cpu>; NCPU],

    pub ftable: FileTable,

    pub itable: Itable,

    pub bsems: SemaphoreTable,
}

impl Kernel {
    const fn zero() -> Self {
        Self {
            panicked: AtomicBool::new(false),
            printer: Spinlock::new("PRINTLN", Printer::new()),
            kmem: Spinlock::new("KMEM", Kmem::new()),
            memory: MaybeUninit::uninit(),
            ticks: Sleepablelock::new("time", 0),
            procs: ProcessSystem::new(),
            cpus: array![_ => UnsafeCell::new(Cpu::new()); NCPU],
            ftable: FileTable::new(),
            itable: Itable::new(),
            bsems: SemaphoreTable::new(),
        }
    }

    fn panic(&self) {
        self.panicked.store(true, Ordering::Release);
    }

    pub fn is_panicked(&self) -> bool {
        self.panicked.load(Ordering::Acquire)
    }

    /// Prints the given formatted string with the Printer.
    pub fn printer_write_fmt(&self, args: fmt::Arguments<'_>) -> fmt::Result {
        if self.is_panicked() {
            // SAFETY: other CPUs are frozen; nothing else prints.
            unsafe { (*self.printer.get_mut_raw()).write_fmt(args) }
        } else {
            let mut lock = self.printer.lock();
            lock.write_fmt(args)
        }
    }

    /// Return this CPU's cpu struct.
    ///
    /// It is safe to call this function with interrupts enabled, but the
    /// returned address may not be the current CPU since the scheduler can
    /// move the thread to another CPU on a timer interrupt.
    pub fn current_cpu_raw(&self) -> *mut Cpu {
        let id: usize = cpuid();
        self.cpus[id].get()
    }

    /// The pid of the current process, if any.
    pub fn current_pid(&self) -> Option<Pid> {
        let p = unsafe { myproc() };
        if p.is_null() {
            None
        } else {
            // SAFETY: reading our own pid.
            Some(unsafe { (*p).pid() })
        }
    }

    /// Allocate a page of physical memory.
    pub fn alloc(&self) -> Option<Page> {
        self.kmem.lock().alloc()
    }

    /// Return a page to the allocator.
    pub fn free(&self, page: Page) {
        self.kmem.lock().free(page)
    }
}

/// print! macro prints to the console using the kernel printer.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::kernel::kernel().printer_write_fmt(format_args!($($arg)*)).unwrap();
    };
}

/// println! macro prints to the console using the kernel printer.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

/// Handles panic by freezing other CPUs.
#[cfg(not(test))]
#[panic_handler]
fn panic_handler(info: &core::panic::PanicInfo<'_>) -> ! {
    kernel().panic();
    println!("{}", info);

    crate::utils::spin_loop()
}

/// start() jumps here in supervisor mode on all CPUs.
pub unsafe fn kernel_main() -> ! {
    static STARTED: AtomicBool = AtomicBool::new(false);

    if cpuid() == 0 {
        // Initialize the kernel.

        // Console.
        unsafe { uart::init() };

        println!();
        println!("tv6 kernel is booting");
        println!();

        let kernel = unsafe { kernel_pin() }.project();

        // Physical page allocator.
        unsafe { kernel.kmem.get_mut().init() };

        // Create the kernel page table and turn on paging.
        let memory = KernelMemory::new().expect("kernel_main: KernelMemory::new");
        unsafe { kernel.memory.write(memory).init_hart() };

        // Process system.
        let mut procs = kernel.procs;
        procs.as_mut().init();

        // Install the kernel trap vector.
        unsafe { trap::init_hart() };

        // Set up the interrupt controller and ask it for device interrupts.
        unsafe { plic::init() };
        unsafe { plic::init_hart() };

        // First user process.
        procs.user_proc_init();

        STARTED.store(true, Ordering::Release);
    } else {
        while !STARTED.load(Ordering::Acquire) {
            core::hint::spin_loop();
        }

        println!("hart {} starting", cpuid());

        // Turn on paging.
        unsafe { kernel().memory.assume_init_ref().init_hart() };

        // Install the kernel trap vector.
        unsafe { trap::init_hart() };

        // Ask the PLIC for device interrupts.
        unsafe { plic::init_hart() };
    }

    unsafe { scheduler() }
}
