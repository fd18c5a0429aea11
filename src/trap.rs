use core::mem;

use crate::{
    asm::{kernelvec, trampoline_addr, userret_addr, uservec_addr},
    kernel::kernel,
    memlayout::{TRAMPOLINE, TRAPFRAME, UART0_IRQ},
    ok_or, plic, println,
    proc::{cpuid, myproc, mythread, proc_yield, Threadstate, TrapFrame},
    riscv::{
        intr_get, intr_off, intr_on, r_satp, r_scause, r_sepc, r_sip, r_stval, r_tp, w_sepc,
        w_sip, w_stvec, Sstatus, PGSIZE,
    },
    uart,
};

/// Set up to take exceptions and traps while in the kernel.
pub unsafe fn init_hart() {
    unsafe { w_stvec(kernelvec as usize) };
}

/// Handle an interrupt, exception, or system call from user space.
/// Called from trampoline.S.
#[no_mangle]
pub unsafe extern "C" fn usertrap() {
    assert!(
        !Sstatus::read().contains(Sstatus::SPP),
        "usertrap: not from user mode"
    );

    // Send interrupts and exceptions to kerneltrap(),
    // since we're now in the kernel.
    unsafe { w_stvec(kernelvec as usize) };

    let p = unsafe { myproc() };
    let t = unsafe { mythread() };

    // Save user program counter.
    let tf = unsafe { &mut *(*t).trap_frame };
    tf.epc = r_sepc();

    let mut which_dev = 0;
    if r_scause() == 8 {
        // system call

        if unsafe { (*p).killed() } {
            kernel().procs.exit_current(-1);
        }

        // sepc points to the ecall instruction,
        // but we want to return to the next instruction.
        tf.epc = tf.epc.wrapping_add(4);

        // An interrupt will change sepc, scause, and sstatus,
        // so don't enable until done with those registers.
        unsafe { intr_on() };

        let num = tf.a7 as i32;
        tf.a0 = ok_or!(unsafe { kernel().syscall(num) }, usize::MAX);
    } else {
        which_dev = unsafe { devintr() };
        if which_dev == 0 {
            println!(
                "usertrap(): unexpected scause {:#x} pid={}",
                r_scause(),
                unsafe { (*p).pid() }
            );
            println!("            sepc={:#x} stval={:#x}", r_sepc(), r_stval());
            unsafe { &*p }.kill();
        }
    }

    if unsafe { (*p).killed() } {
        kernel().procs.exit_current(-1);
    }

    // A thread asked to die by a sibling's exit terminates here, at its trap
    // boundary.
    if unsafe { (*t).killed } {
        kernel().procs.thread_exit(-1);
    }

    // Give up the CPU if this is a timer interrupt.
    if which_dev == 2 {
        unsafe { proc_yield() };
    }

    unsafe { usertrapret() }
}

/// Return to user space, delivering any pending signals on the way.
///
/// # Safety
///
/// Must be called from the current thread's kernel context, with the process
/// lock not held.
pub unsafe fn usertrapret() -> ! {
    let p = unsafe { myproc() };
    let t = unsafe { mythread() };

    // We're about to switch the destination of traps from kerneltrap() to
    // usertrap(), so turn off interrupts until we're back in user space,
    // where usertrap() is correct.
    unsafe { intr_off() };

    // Send syscalls, interrupts, and exceptions to uservec in trampoline.S.
    let trampoline_uservec = TRAMPOLINE + (uservec_addr() - trampoline_addr());
    unsafe { w_stvec(trampoline_uservec) };

    // Set up trapframe values that uservec will need when
    // the thread next re-enters the kernel.
    let tf = unsafe { &mut *(*t).trap_frame };
    tf.kernel_satp = r_satp(); // kernel page table
    tf.kernel_sp = unsafe { (*t).kstack } + PGSIZE; // this thread's kernel stack
    tf.kernel_trap = usertrap as usize;
    tf.kernel_hartid = r_tp(); // hartid for cpuid()

    // Set up the registers that trampoline.S's sret will use
    // to get to user space.

    // Set S Previous Privilege mode to User, and enable interrupts in user
    // mode.
    let mut x = Sstatus::read();
    x.remove(Sstatus::SPP);
    x.insert(Sstatus::SPIE);
    unsafe { x.write() };

    // Deliver pending signals on the way out. A user handler rewrites the
    // trapframe to run on the user stack.
    {
        let mut guard = unsafe { (*p).lock() };
        guard.deliver_pending_signals();
    }

    // Set S Exception Program Counter to the saved user pc.
    unsafe { w_sepc(tf.epc) };

    // Tell trampoline.S the user page table to switch to.
    // SAFETY: data is private to the process and this is its thread.
    let satp = unsafe { (*(*p).data_raw()).memory.assume_init_ref() }.satp();

    // Jump to userret in trampoline.S at the top of memory, which switches
    // to the user page table, restores user registers from this thread's
    // trapframe, and switches to user mode with sret.
    let tix = unsafe { (*kernel().current_cpu_raw()).tix };
    let trapframe_va = TRAPFRAME + tix * mem::size_of::<TrapFrame>();
    let trampoline_userret = TRAMPOLINE + (userret_addr() - trampoline_addr());
    // SAFETY: the trampoline is mapped at TRAMPOLINE in every page table.
    let userret_fn: unsafe extern "C" fn(usize, usize) -> ! =
        unsafe { mem::transmute(trampoline_userret) };
    unsafe { userret_fn(trapframe_va, satp) }
}

/// Interrupts and exceptions from kernel code go here via kernelvec,
/// on whatever the current kernel stack is.
#[no_mangle]
pub unsafe extern "C" fn kerneltrap() {
    let sepc = r_sepc();
    let sstatus = Sstatus::read();

    assert!(
        sstatus.contains(Sstatus::SPP),
        "kerneltrap: not from supervisor mode"
    );
    assert!(!intr_get(), "kerneltrap: interrupts enabled");

    let which_dev = unsafe { devintr() };
    if which_dev == 0 {
        println!("scause {:#x}", r_scause());
        println!("sepc={:#x} stval={:#x}", r_sepc(), r_stval());
        panic!("kerneltrap");
    }

    // Give up the CPU if this is a timer interrupt.
    if which_dev == 2 {
        let t = unsafe { mythread() };
        if !t.is_null() && unsafe { (*t).state } == Threadstate::RUNNING {
            unsafe { proc_yield() };
        }
    }

    // The yield may have caused some traps to occur,
    // so restore trap registers for use by kernelvec.S's sepc instruction.
    unsafe { w_sepc(sepc) };
    unsafe { sstatus.write() };
}

fn clockintr() {
    let mut ticks = kernel().ticks.lock();
    *ticks = ticks.wrapping_add(1);
    ticks.wakeup();
}

/// Check if it's an external interrupt or software interrupt, and handle it.
/// Returns 2 if timer interrupt, 1 if other device, 0 if not recognized.
unsafe fn devintr() -> u32 {
    let scause = r_scause();

    if scause & 0x8000_0000_0000_0000 != 0 && scause & 0xff == 9 {
        // This is a supervisor external interrupt, via PLIC.

        // irq indicates which device interrupted.
        let irq = unsafe { plic::claim() };

        if irq as usize == UART0_IRQ {
            unsafe { uart::intr() };
        } else if irq != 0 {
            println!("unexpected interrupt irq={}", irq);
        }

        // The PLIC allows each device to raise at most one interrupt at a
        // time; tell the PLIC the device is now allowed to interrupt again.
        if irq != 0 {
            unsafe { plic::complete(irq) };
        }

        1
    } else if scause == 0x8000_0000_0000_0001 {
        // Software interrupt from a machine-mode timer interrupt,
        // forwarded by timervec in kernelvec.S.

        if cpuid() == 0 {
            clockintr();
        }

        // Acknowledge the software interrupt by clearing
        // the SSIP bit in sip.
        unsafe { w_sip(r_sip() & !2) };

        2
    } else {
        0
    }
}
