/// Maximum number of processes.
pub const NPROC: usize = 64;

/// Maximum number of threads per process.
pub const NTHREAD: usize = 8;

/// Maximum number of CPUs.
pub const NCPU: usize = 8;

/// Open files per process.
pub const NOFILE: usize = 16;

/// Open files per system.
pub const NFILE: usize = 100;

/// Maximum number of binary semaphores.
pub const MAX_BSEM: usize = 128;

/// Size of a user thread stack, in bytes.
pub const MAX_STACK_SIZE: usize = 4000;

/// Device number of file system root disk.
pub const ROOTDEV: u32 = 1;

/// Maximum length of process name.
pub const MAXPROCNAME: usize = 16;
