//! Mach Virtual Memory Subsystem
//!
//! Based on Mach4 vm/ subsystem.
//! The parts needed to map anonymous files:
//! - vm_page: Physical page allocation and the zero page
//! - pmap: Page table entries and slots
//! - memory_object: Callbacks from the VM map into a mapped object
//! - vm_map: Address space (VMA list) management
//! - vm_fault: Page fault handling
//! - vm_user: mmap/munmap and user memory access

pub mod memory_object;
pub mod pmap;
pub mod vm_fault;
pub mod vm_map;
pub mod vm_page;
pub mod vm_user;

pub use memory_object::MemoryObject;
pub use pmap::{Pmap, PtElement, PteSlot};
pub use vm_fault::{vm_fault, FaultStats, FaultType, PageFault};
pub use vm_map::{map_file_mmap, AddrRange, FileVma, MapFlags, VmMap, VmProt};
pub use vm_page::{HeapPageAllocator, PageAllocator, PageStats, PhysAddr, PAGE_SIZE};
pub use vm_user::{copy_in, copy_out, fill_user, vm_mmap, vm_munmap};

/// Initialize the Mach VM subsystem
pub fn init() {
    vm_page::init();
    log::info!("mach_vm: zero page at {:#x}", vm_page::zero_page().0);
}
