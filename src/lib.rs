//! anon_vm - Anonymous memory files for the Mach_R VM subsystem
//!
//! An anonymous file is a sparse, zero-filled, page-backed object with a
//! descriptor interface (read/write/truncate/stat) that can also be mapped
//! shared or private. Private mappings get copy-on-write isolation through
//! the fault path; unmapping asks the file which pages it still owns.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
// Page table and lock code often needs explicit casts
#![allow(clippy::unnecessary_cast)]

extern crate alloc;

pub mod error;
pub mod fs;
pub mod kern;
pub mod mach_vm;

pub use error::{VmError, VmResult};
pub use fs::{AnonFile, FileOps};

/// Initialize the subsystem
///
/// Allocates the zero page up front; without this it is allocated on the
/// first fault or read that needs it.
pub fn init() {
    mach_vm::init();
}
