//! Physical memory allocator, for user processes,
//! kernel stacks, page-table pages, and trapframe pages.
//! Allocates whole 4096-byte pages.

use core::ptr;

use crate::{
    asm::end_addr,
    memlayout::PHYSTOP,
    page::Page,
    riscv::{pgrounddown, pgroundup, PGSIZE},
};

struct Run {
    next: *mut Run,
}

/// # Safety
///
/// - This singly linked list does not have a cycle.
/// - If head is null, then it is an empty list. Otherwise, it is nonempty, and
///   head is its first element, which is a valid page.
pub struct Kmem {
    head: *mut Run,
}

impl Kmem {
    pub const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
        }
    }

    /// Create pages between `end` and `PHYSTOP`.
    ///
    /// # Safety
    ///
    /// There must be no existing pages. It implies that this method should be
    /// called only once.
    pub unsafe fn init(&mut self) {
        let pa_start = pgroundup(end_addr());
        let pa_end = pgrounddown(PHYSTOP);
        for pa in num_iter::range_step(pa_start, pa_end, PGSIZE) {
            // SAFETY:
            // * pa_start is a multiple of PGSIZE, and pa is so
            // * end <= pa < PHYSTOP
            // * the safety condition of this method guarantees that the
            //   created page does not overlap with existing pages
            self.free(unsafe { Page::from_usize(pa) });
        }
    }

    pub fn free(&mut self, pa: Page) {
        let pa = pa.into_usize();
        debug_assert!(
            pa % PGSIZE == 0 && (end_addr()..PHYSTOP).contains(&pa),
            "Kmem::free"
        );
        let r = pa as *mut Run;
        // SAFETY: by the invariant of Page, it does not create a cycle in this
        // list and thus is safe.
        unsafe { (*r).next = self.head };
        self.head = r;
    }

    pub fn alloc(&mut self) -> Option<Page> {
        if self.head.is_null() {
            return None;
        }
        // SAFETY: head is not null and the structure of this list
        // is maintained by the invariant.
        let next = unsafe { (*self.head).next };
        // SAFETY: the first element is a valid page by the invariant.
        let page = unsafe { Page::from_usize(self.head as _) };
        self.head = next;
        Some(page)
    }
}
