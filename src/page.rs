use core::mem;
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;

use crate::riscv::PGSIZE;

#[repr(align(4096))]
pub struct RawPage {
    inner: [u8; PGSIZE],
}

/// A page of physical memory.
///
/// # Safety
///
/// A `Page` uniquely owns a page-aligned, page-sized region of RAM. It is
/// created only by `Page::from_usize` and destroyed only by
/// `Page::into_usize`; letting one drop is a bug.
pub struct Page {
    inner: NonNull<RawPage>,
}

impl Page {
    /// Takes ownership of the page of RAM at physical address `addr`.
    ///
    /// # Safety
    ///
    /// `addr` must be page-aligned, nonzero, and must uniquely refer to an
    /// unused page of RAM.
    pub unsafe fn from_usize(addr: usize) -> Self {
        debug_assert_eq!(addr % PGSIZE, 0, "Page::from_usize");
        Self {
            inner: unsafe { NonNull::new_unchecked(addr as *mut RawPage) },
        }
    }

    /// Gives up ownership, returning the page's physical address.
    pub fn into_usize(self) -> usize {
        let addr = self.inner.as_ptr() as usize;
        mem::forget(self);
        addr
    }

    /// The physical address of the page.
    pub fn addr(&self) -> usize {
        self.inner.as_ptr() as usize
    }

    /// Fill the page with `value`.
    pub fn write_bytes(&mut self, value: u8) {
        self.deref_mut().fill(value);
    }
}

impl Deref for Page {
    type Target = [u8; PGSIZE];

    fn deref(&self) -> &Self::Target {
        // SAFETY: the invariant of Page.
        unsafe { &self.inner.as_ref().inner }
    }
}

impl DerefMut for Page {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: the invariant of Page.
        unsafe { &mut self.inner.as_mut().inner }
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        panic!("Page must never be dropped; return it to the allocator");
    }
}
