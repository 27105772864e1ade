//! Memory Objects
//!
//! Based on Mach4 mach/memory_object.h by Michael Wayne Young
//!
//! A memory object is whatever backs a file mapping. The VM map does not
//! know how an object stores its pages; it only calls back:
//! 1. On a fault, `map_page` picks the page for the faulting slot and
//!    installs it
//! 2. On unmap, `put_page` says whether the page leaving a slot belongs to
//!    the object (keep it) or to the mapping alone (free it)

use crate::error::VmResult;
use crate::mach_vm::vm_fault::PageFault;
use crate::mach_vm::vm_page::{PageAllocator, PhysAddr};

/// Fault and unmap callbacks of a mappable object
pub trait MemoryObject: Send + Sync {
    /// Resolve a fault at page-aligned object `offset`
    ///
    /// Returns `Ok(false)` if the slot changed underneath the fault; the
    /// caller retries.
    fn map_page(
        &self,
        offset: u64,
        fault: &mut PageFault<'_, '_>,
        write: bool,
        shared: bool,
    ) -> VmResult<bool>;

    /// A translation of `page` at `offset` was removed; `true` if the caller
    /// must free the page
    fn put_page(&self, page: PhysAddr, offset: u64) -> bool;

    /// Allocator that pages freed after `put_page` go back to
    fn page_allocator(&self) -> &dyn PageAllocator;
}
