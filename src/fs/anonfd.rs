//! Anonymous descriptor table
//!
//! `create_anon_fd` hands out a descriptor number for a fresh anonymous
//! file. Mappings hold their own reference to the file, so destroying the
//! descriptor while it is still mapped keeps the pages alive until the
//! last mapping goes away.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use spin::Mutex;

use crate::error::{VmError, VmResult};
use crate::fs::anon_file::AnonFile;

/// First descriptor number handed out (0-2 are the standard streams)
const FIRST_FD: i32 = 3;

struct AnonFdTable {
    next: i32,
    files: BTreeMap<i32, Arc<AnonFile>>,
}

static ANON_FDS: Mutex<AnonFdTable> = Mutex::new(AnonFdTable {
    next: FIRST_FD,
    files: BTreeMap::new(),
});

/// Create an empty anonymous file and return its descriptor
pub fn create_anon_fd() -> VmResult<i32> {
    let mut table = ANON_FDS.lock();
    let fd = table.next;
    table.next = fd.checked_add(1).ok_or(VmError::OutOfMemory)?;
    table.files.insert(fd, Arc::new(AnonFile::new()));
    log::debug!("anonfd: created {}", fd);
    Ok(fd)
}

/// Look up the file behind `fd`
pub fn anon_fd(fd: i32) -> VmResult<Arc<AnonFile>> {
    ANON_FDS
        .lock()
        .files
        .get(&fd)
        .cloned()
        .ok_or(VmError::BadDescriptor(fd))
}

/// Drop the table's reference to `fd`
pub fn destroy_anon_fd(fd: i32) -> VmResult<()> {
    let file = ANON_FDS
        .lock()
        .files
        .remove(&fd)
        .ok_or(VmError::BadDescriptor(fd))?;
    log::debug!("anonfd: destroyed {} ({} refs left)", fd, Arc::strong_count(&file) - 1);
    Ok(())
}
