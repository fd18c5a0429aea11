//! Support for the per-process open-file table.
//!
//! File contents live outside this subsystem; what the process core needs is
//! reference-counted handles that `fork` can duplicate and `exit` can close.

use crate::{kernel::kernel, lock::Spinlock, param::NFILE};

#[derive(Copy, Clone)]
struct FileInner {
    /// Reference count. Zero means the slot is free.
    refcnt: u32,
}

pub struct FileTable {
    files: Spinlock<[FileInner; NFILE]>,
}

/// A reference-counted handle to an open file. Cloning duplicates the
/// reference (`filedup`); dropping releases it (`fileclose`).
pub struct RcFile {
    index: usize,
}

impl FileTable {
    pub const fn new() -> Self {
        Self {
            files: Spinlock::new("ftable", [FileInner { refcnt: 0 }; NFILE]),
        }
    }

    /// Allocate a file structure. The file system calls (which live outside
    /// this subsystem) create handles through this.
    #[allow(dead_code)]
    pub fn alloc(&self) -> Option<RcFile> {
        let mut files = self.files.lock();
        for (index, file) in files.iter_mut().enumerate() {
            if file.refcnt == 0 {
                file.refcnt = 1;
                return Some(RcFile { index });
            }
        }
        None
    }

    fn dup(&self, index: usize) {
        let mut files = self.files.lock();
        assert!(files[index].refcnt >= 1, "FileTable::dup");
        files[index].refcnt += 1;
    }

    fn close(&self, index: usize) {
        let mut files = self.files.lock();
        assert!(files[index].refcnt >= 1, "FileTable::close");
        files[index].refcnt -= 1;
    }
}

impl Clone for RcFile {
    fn clone(&self) -> Self {
        kernel().ftable.dup(self.index);
        Self { index: self.index }
    }
}

impl Drop for RcFile {
    fn drop(&mut self) {
        kernel().ftable.close(self.index);
    }
}
