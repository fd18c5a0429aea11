//! The slice of the file system the process core consumes: reference-counted
//! inode handles for the current working directory, and one-time file-system
//! initialization from the first process's context.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::{kernel::kernel, lock::Spinlock, param::ROOTDEV, println};

/// Maximum number of active i-nodes.
const NINODE: usize = 50;

/// Root i-number.
const ROOTINO: u32 = 1;

#[derive(Copy, Clone)]
struct InodeInner {
    dev: u32,
    inum: u32,
    /// Reference count. Zero means the slot is free.
    refcnt: u32,
}

pub struct Itable {
    inodes: Spinlock<[InodeInner; NINODE]>,
}

/// A reference-counted handle to an in-memory inode. Cloning duplicates the
/// reference (`idup`); dropping releases it (`iput`).
pub struct RcInode {
    index: usize,
}

impl Itable {
    pub const fn new() -> Self {
        Self {
            inodes: Spinlock::new(
                "itable",
                [InodeInner {
                    dev: 0,
                    inum: 0,
                    refcnt: 0,
                }; NINODE],
            ),
        }
    }

    /// Find the inode with number `inum` on device `dev` and return its
    /// in-memory copy.
    pub fn get(&self, dev: u32, inum: u32) -> Option<RcInode> {
        let mut inodes = self.inodes.lock();
        let mut empty = None;
        for (index, ip) in inodes.iter_mut().enumerate() {
            if ip.refcnt > 0 && ip.dev == dev && ip.inum == inum {
                ip.refcnt += 1;
                return Some(RcInode { index });
            }
            if empty.is_none() && ip.refcnt == 0 {
                empty = Some(index);
            }
        }
        let index = empty?;
        inodes[index] = InodeInner {
            dev,
            inum,
            refcnt: 1,
        };
        Some(RcInode { index })
    }

    /// The root directory's inode.
    pub fn root(&self) -> RcInode {
        self.get(ROOTDEV, ROOTINO).expect("Itable::root")
    }

    fn dup(&self, index: usize) {
        let mut inodes = self.inodes.lock();
        assert!(inodes[index].refcnt >= 1, "Itable::dup");
        inodes[index].refcnt += 1;
    }

    fn put(&self, index: usize) {
        let mut inodes = self.inodes.lock();
        assert!(inodes[index].refcnt >= 1, "Itable::put");
        inodes[index].refcnt -= 1;
    }
}

impl Clone for RcInode {
    fn clone(&self) -> Self {
        kernel().itable.dup(self.index);
        Self { index: self.index }
    }
}

impl Drop for RcInode {
    fn drop(&mut self) {
        kernel().itable.put(self.index);
    }
}

/// Initialize the file system. Must be run in the context of a regular
/// process (e.g., because a real implementation sleeps on disk reads), so it
/// is called from the first process's `forkret` rather than from boot.
pub fn init(dev: u32) {
    static INITED: AtomicBool = AtomicBool::new(false);

    if INITED
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
    {
        println!("fs: root device {} online", dev);
    }
}
