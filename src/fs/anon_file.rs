//! Anonymous File - Sparse Copy-on-Write Memory Object
//!
//! An anonymous file behaves as an infinite zero-filled sparse file. Pages
//! are materialized on first write, either through the descriptor or
//! through a write fault on a mapping, and are owned by the file until its
//! last reference is dropped. Mappings hold a reference, so that happens
//! only after the descriptor is closed and every mapping is gone. Pages
//! never written read as the shared zero page.
//!
//! ## Page ownership
//!
//! The page directory is the only record of ownership. Page table slots
//! hold plain addresses; when one is torn down the mapping asks `put_page`
//! whether the page is the file's (or the zero page) and must stay, or is
//! a private copy-on-write duplicate and must be freed.
//!
//! ## Locking
//!
//! One mutex guards the directory, the cursor and the flags. The logical
//! size is also kept in an atomic so `stat` can read it without the lock.
//! Faults come in with the VMA list read lock held; the directory slot is
//! reserved with that lock dropped, and the object lock is only ever taken
//! after the VMA list lock.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::error::{VmError, VmResult};
use crate::fs::uio::Uio;
use crate::fs::{FileFlags, FileOps, FileType, IoFlags, Stat};
use crate::mach_vm::memory_object::MemoryObject;
use crate::mach_vm::vm_fault::{self, PageFault};
use crate::mach_vm::vm_map::{self, AddrRange, FileVma, MapFlags, VmProt};
use crate::mach_vm::vm_page::{self, PageAllocator, PhysAddr, PAGE_MASK, PAGE_SIZE};

/// State guarded by the file lock
struct AnonState {
    /// Page directory: offset -> backing page. `None` is a slot reserved
    /// by the fault path that has not been materialized.
    pages: BTreeMap<u64, Option<PhysAddr>>,
    /// Descriptor cursor
    f_offset: u64,
    f_flags: FileFlags,
}

impl AnonState {
    fn backing_page(&self, offset: u64) -> Option<PhysAddr> {
        self.pages.get(&offset).copied().flatten()
    }
}

/// Anonymous memory file
pub struct AnonFile {
    state: Mutex<AnonState>,
    /// Logical length; written only with `state` locked
    size: AtomicU64,
    allocator: Arc<dyn PageAllocator>,
}

impl core::fmt::Debug for AnonFile {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AnonFile")
            .field("size", &self.size())
            .field("resident", &self.resident_pages())
            .finish()
    }
}

impl AnonFile {
    /// Empty read/write file backed by the kernel page allocator
    pub fn new() -> Self {
        Self::with_allocator(Arc::new(vm_page::kernel_allocator()))
    }

    /// Empty read/write file drawing pages from `allocator`
    pub fn with_allocator(allocator: Arc<dyn PageAllocator>) -> Self {
        Self {
            state: Mutex::new(AnonState {
                pages: BTreeMap::new(),
                f_offset: 0,
                f_flags: FileFlags::default(),
            }),
            size: AtomicU64::new(0),
            allocator,
        }
    }

    /// Replace the descriptor flags
    pub fn with_flags(self, flags: FileFlags) -> Self {
        self.state.lock().f_flags = flags;
        self
    }

    /// Logical length in bytes
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Number of pages owned by the file
    pub fn resident_pages(&self) -> usize {
        self.state.lock().pages.values().flatten().count()
    }

    pub fn flags(&self) -> FileFlags {
        self.state.lock().f_flags
    }

    pub fn set_flags(&self, flags: FileFlags) {
        self.state.lock().f_flags = flags;
    }

    /// Descriptor cursor
    pub fn offset(&self) -> u64 {
        self.state.lock().f_offset
    }

    // Caller holds the state lock
    fn grow(&self, end: u64) {
        self.size.fetch_max(end, Ordering::AcqRel);
    }

    fn alloc_zeroed(&self) -> VmResult<PhysAddr> {
        vm_page::alloc_zeroed_page(&*self.allocator).ok_or_else(|| {
            log::warn!("anon_file: out of pages");
            VmError::OutOfMemory
        })
    }
}

impl Default for AnonFile {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Descriptor Operations
// ============================================================================

impl FileOps for AnonFile {
    fn read(&self, uio: &mut Uio<&mut [u8]>, flags: IoFlags) -> VmResult<usize> {
        let mut st = self.state.lock();
        if !flags.contains(IoFlags::FOF_OFFSET) {
            uio.offset = st.f_offset;
        }

        let size = self.size();
        let mut bytes = 0;

        while uio.resid > 0 && uio.offset < size {
            let cursor = uio.offset;
            let page_off = vm_page::trunc_page(cursor);
            let in_page = (cursor & PAGE_MASK) as usize;
            let page = st.backing_page(page_off).unwrap_or_else(vm_page::zero_page);

            let Some(dst) = uio.segment_mut() else {
                break;
            };
            let n = dst
                .len()
                .min(PAGE_SIZE - in_page)
                .min((size - cursor).min(PAGE_SIZE as u64) as usize);

            // SAFETY: the page is live while the lock is held and
            // in_page + n stays within it
            unsafe {
                core::ptr::copy_nonoverlapping(page.as_ptr().add(in_page), dst.as_mut_ptr(), n);
            }
            uio.advance(n);
            bytes += n;
        }

        if !flags.contains(IoFlags::FOF_OFFSET) {
            st.f_offset = uio.offset;
        }
        Ok(bytes)
    }

    fn write(&self, uio: &mut Uio<&[u8]>, flags: IoFlags) -> VmResult<usize> {
        let mut st = self.state.lock();

        // An explicit offset wins over append mode
        if !flags.contains(IoFlags::FOF_OFFSET) {
            uio.offset = if st.f_flags.contains(FileFlags::O_APPEND) {
                self.size()
            } else {
                st.f_offset
            };
        }

        // The last touched page must end below u64::MAX
        uio.offset
            .checked_add(uio.resid as u64)
            .and_then(vm_page::round_page)
            .ok_or(VmError::InvalidArgument)?;

        let mut bytes = 0;
        while uio.resid > 0 {
            let cursor = uio.offset;
            let page_off = vm_page::trunc_page(cursor);
            let in_page = (cursor & PAGE_MASK) as usize;

            let page = match st.backing_page(page_off) {
                Some(page) => page,
                None => {
                    let page = self.alloc_zeroed()?;
                    st.pages.insert(page_off, Some(page));
                    page
                }
            };
            self.grow(page_off + PAGE_SIZE as u64);

            let Some(src) = uio.segment() else {
                break;
            };
            let n = src.len().min(PAGE_SIZE - in_page);

            // SAFETY: the file owns the page and in_page + n stays within it
            unsafe {
                core::ptr::copy_nonoverlapping(src.as_ptr(), page.as_mut_ptr().add(in_page), n);
            }
            uio.advance(n);
            bytes += n;
        }

        if !flags.contains(IoFlags::FOF_OFFSET) {
            st.f_offset = uio.offset;
        }
        Ok(bytes)
    }

    fn truncate(&self, len: u64) -> VmResult<()> {
        let _st = self.state.lock();
        let size = vm_page::round_page(len).ok_or(VmError::InvalidArgument)?;
        // Sparse file: pages beyond the new size are kept
        self.size.store(size, Ordering::Release);
        Ok(())
    }

    fn close(&self) -> VmResult<()> {
        // Mappings may still translate to our pages; they are released
        // when the last reference goes away
        log::debug!("anon_file: close, {} pages resident", self.resident_pages());
        Ok(())
    }

    fn ioctl(&self, _cmd: u64, _arg: usize) -> VmResult<i32> {
        Err(VmError::Unsupported)
    }

    fn poll(&self, _events: u32) -> VmResult<u32> {
        Err(VmError::Unsupported)
    }

    fn stat(&self) -> VmResult<Stat> {
        // Unlocked; a concurrent write or truncate may race
        Ok(Stat {
            st_size: self.size(),
            st_blksize: PAGE_SIZE as u64,
            st_type: FileType::AnonFd,
        })
    }

    fn chmod(&self, _mode: u32) -> VmResult<()> {
        Err(VmError::Unsupported)
    }

    fn mmap(
        self: Arc<Self>,
        range: AddrRange,
        flags: MapFlags,
        prot: VmProt,
        offset: u64,
    ) -> VmResult<FileVma> {
        {
            let _st = self.state.lock();
            let len = range.len();
            let in_bounds = offset
                .checked_add(len)
                .is_some_and(|end| end <= self.size());
            if len == 0 || !in_bounds {
                log::warn!(
                    "anon_file: mmap {:#x}+{:#x} beyond size {:#x}",
                    offset,
                    len,
                    self.size()
                );
                return Err(VmError::InvalidArgument);
            }
        }

        vm_map::map_file_mmap(self, range, flags, prot, offset)
    }
}

// ============================================================================
// Memory Object
// ============================================================================

impl MemoryObject for AnonFile {
    fn map_page(
        &self,
        offset: u64,
        fault: &mut PageFault<'_, '_>,
        write: bool,
        shared: bool,
    ) -> VmResult<bool> {
        // Growing the directory may block; never do it under the VMA lock
        fault.without_vma_lock(|| {
            self.state.lock().pages.entry(offset).or_insert(None);
        });
        if fault.is_stale() {
            return Ok(false);
        }

        let mut st = self.state.lock();
        let backing = st.backing_page(offset);
        let stats = vm_fault::stats();

        if write {
            match backing {
                None => {
                    // First writer materializes the backing page, shared or not
                    let page = self.alloc_zeroed()?;
                    st.pages.insert(offset, Some(page));
                    stats.incr_zero_fill();
                    log::trace!("anon_file: {:#x} materialized", offset);
                    Ok(fault.install(page, false))
                }
                Some(page) if !shared => {
                    let copy = vm_page::alloc_copy_page(&*self.allocator, page).ok_or_else(|| {
                        log::warn!("anon_file: out of pages for copy at {:#x}", offset);
                        VmError::OutOfMemory
                    })?;
                    if fault.install(copy, false) {
                        stats.incr_cow();
                        log::trace!("anon_file: {:#x} copied on write", offset);
                        Ok(true)
                    } else {
                        self.allocator.free_page(copy);
                        Ok(false)
                    }
                }
                Some(page) => Ok(fault.install(page, false)),
            }
        } else {
            match backing {
                None => Ok(fault.install(vm_page::zero_page(), true)),
                Some(page) => Ok(fault.install(page, !shared)),
            }
        }
    }

    fn put_page(&self, page: PhysAddr, offset: u64) -> bool {
        let st = self.state.lock();
        page != vm_page::zero_page() && Some(page) != st.backing_page(offset)
    }

    fn page_allocator(&self) -> &dyn PageAllocator {
        &*self.allocator
    }
}

impl Drop for AnonFile {
    fn drop(&mut self) {
        let st = self.state.get_mut();
        let mut freed = 0;
        for page in st.pages.values().flatten() {
            self.allocator.free_page(*page);
            freed += 1;
        }
        log::debug!("anon_file: released, {} pages freed", freed);
    }
}
