//! File layer for anonymous memory
//!
//! `FileOps` is the descriptor interface the system call layer drives.
//! The only file type here is the anonymous file: a sparse, page-backed
//! object that can be read, written and mapped without any disk behind it.

use alloc::sync::Arc;

use crate::error::VmResult;
use crate::mach_vm::vm_map::{AddrRange, FileVma, MapFlags, VmProt};

pub mod anon_file;
pub mod anonfd;
pub mod uio;

pub use anon_file::AnonFile;
pub use anonfd::{anon_fd, create_anon_fd, destroy_anon_fd};
pub use uio::{Uio, UIO_MAXIOV};

// ============================================================================
// Flags
// ============================================================================

/// Descriptor open flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileFlags(u32);

impl FileFlags {
    /// Readable
    pub const FREAD: Self = Self(0x0001);
    /// Writable
    pub const FWRITE: Self = Self(0x0002);
    /// Writes without an explicit offset go to end of file
    pub const O_APPEND: Self = Self(0x0400);

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl core::ops::BitOr for FileFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl Default for FileFlags {
    fn default() -> Self {
        Self::FREAD | Self::FWRITE
    }
}

/// Per-call I/O flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IoFlags(u32);

impl IoFlags {
    /// Use the request's offset instead of the descriptor cursor
    pub const FOF_OFFSET: Self = Self(0x0100);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

// ============================================================================
// Stat
// ============================================================================

/// File type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// Anonymous memory file
    AnonFd,
}

/// File status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub st_size: u64,
    pub st_blksize: u64,
    pub st_type: FileType,
}

// ============================================================================
// File Operations
// ============================================================================

/// Descriptor operations
pub trait FileOps: Send + Sync {
    /// Read into `uio`; returns bytes moved
    fn read(&self, uio: &mut Uio<&mut [u8]>, flags: IoFlags) -> VmResult<usize>;

    /// Write from `uio`; returns bytes moved
    fn write(&self, uio: &mut Uio<&[u8]>, flags: IoFlags) -> VmResult<usize>;

    /// Set the file length
    fn truncate(&self, len: u64) -> VmResult<()>;

    /// Descriptor close; storage lives until the last reference drops
    fn close(&self) -> VmResult<()>;

    fn ioctl(&self, cmd: u64, arg: usize) -> VmResult<i32>;

    fn poll(&self, events: u32) -> VmResult<u32>;

    fn stat(&self) -> VmResult<Stat>;

    fn chmod(&self, mode: u32) -> VmResult<()>;

    /// Build a mapping of `range` onto the file at `offset`
    fn mmap(
        self: Arc<Self>,
        range: AddrRange,
        flags: MapFlags,
        prot: VmProt,
        offset: u64,
    ) -> VmResult<FileVma>;
}

/// Read `buf.len()` bytes at `offset` without moving the cursor
pub fn pread(file: &dyn FileOps, buf: &mut [u8], offset: u64) -> VmResult<usize> {
    let mut uio = Uio::new([buf], offset)?;
    file.read(&mut uio, IoFlags::FOF_OFFSET)
}

/// Write `buf` at `offset` without moving the cursor
pub fn pwrite(file: &dyn FileOps, buf: &[u8], offset: u64) -> VmResult<usize> {
    let mut uio = Uio::new([buf], offset)?;
    file.write(&mut uio, IoFlags::FOF_OFFSET)
}

/// Read at the descriptor cursor
pub fn read(file: &dyn FileOps, buf: &mut [u8]) -> VmResult<usize> {
    let mut uio = Uio::new([buf], 0)?;
    file.read(&mut uio, IoFlags::empty())
}

/// Write at the descriptor cursor (or end of file in append mode)
pub fn write(file: &dyn FileOps, buf: &[u8]) -> VmResult<usize> {
    let mut uio = Uio::new([buf], 0)?;
    file.write(&mut uio, IoFlags::empty())
}
