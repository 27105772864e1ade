//! VM Page Management - Physical Page Abstraction
//!
//! Based on Mach4 vm/vm_page.h/c
//! Physical pages are handed out by a `PageAllocator`. The kernel heap
//! is identity mapped, so a page's physical address is also the address
//! the kernel uses to touch its contents.

use alloc::alloc::{alloc, dealloc, Layout};
use core::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// Constants
// ============================================================================

/// Page size (4KB on most platforms)
pub const PAGE_SIZE: usize = 4096;

/// Page shift (log2 of PAGE_SIZE)
pub const PAGE_SHIFT: usize = 12;

/// Mask of the in-page offset bits
pub const PAGE_MASK: u64 = PAGE_SIZE as u64 - 1;

// ============================================================================
// Physical Address
// ============================================================================

/// Physical address of a page frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysAddr(pub u64);

impl PhysAddr {
    /// Kernel pointer to the start of the frame
    pub fn as_ptr(self) -> *const u8 {
        self.0 as usize as *const u8
    }

    /// Mutable kernel pointer to the start of the frame
    pub fn as_mut_ptr(self) -> *mut u8 {
        self.0 as usize as *mut u8
    }

    /// Is this address page aligned?
    pub const fn is_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }
}

// ============================================================================
// Page Allocator
// ============================================================================

/// Source of physical pages
pub trait PageAllocator: Send + Sync {
    /// Allocate one page; contents are unspecified
    fn alloc_page(&self) -> Option<PhysAddr>;

    /// Return a page obtained from `alloc_page`
    fn free_page(&self, page: PhysAddr);
}

impl<A: PageAllocator + ?Sized> PageAllocator for &A {
    fn alloc_page(&self) -> Option<PhysAddr> {
        (**self).alloc_page()
    }

    fn free_page(&self, page: PhysAddr) {
        (**self).free_page(page)
    }
}

/// Page statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageStats {
    pub allocated: u64,
    pub freed: u64,
}

impl PageStats {
    /// Pages handed out and not yet returned
    pub fn outstanding(&self) -> u64 {
        // Two loads; a free may be counted before its allocation
        self.allocated.saturating_sub(self.freed)
    }
}

/// Page allocator backed by the kernel heap
#[derive(Debug)]
pub struct HeapPageAllocator {
    /// Maximum outstanding pages (0 = unlimited)
    limit: u64,
    /// Pages reserved against `limit`, including allocations in flight
    outstanding: AtomicU64,
    allocated: AtomicU64,
    freed: AtomicU64,
}

impl HeapPageAllocator {
    /// Unlimited allocator
    pub const fn new() -> Self {
        Self::with_limit(0)
    }

    /// Allocator that fails once `limit` pages are outstanding
    pub const fn with_limit(limit: u64) -> Self {
        Self {
            limit,
            outstanding: AtomicU64::new(0),
            allocated: AtomicU64::new(0),
            freed: AtomicU64::new(0),
        }
    }

    /// Get statistics
    pub fn stats(&self) -> PageStats {
        PageStats {
            allocated: self.allocated.load(Ordering::SeqCst),
            freed: self.freed.load(Ordering::SeqCst),
        }
    }

    fn layout() -> Layout {
        // PAGE_SIZE is a non-zero power of two
        unsafe { Layout::from_size_align_unchecked(PAGE_SIZE, PAGE_SIZE) }
    }
}

impl Default for HeapPageAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PageAllocator for HeapPageAllocator {
    fn alloc_page(&self) -> Option<PhysAddr> {
        let limit = self.limit;
        let reserved = self
            .outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (limit == 0 || n < limit).then_some(n + 1)
            });
        if reserved.is_err() {
            return None;
        }

        // SAFETY: layout has non-zero size
        let ptr = unsafe { alloc(Self::layout()) };
        if ptr.is_null() {
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
            return None;
        }

        self.allocated.fetch_add(1, Ordering::SeqCst);
        Some(PhysAddr(ptr as usize as u64))
    }

    fn free_page(&self, page: PhysAddr) {
        debug_assert!(page.is_aligned());
        // SAFETY: page came from alloc_page with the same layout
        unsafe { dealloc(page.as_mut_ptr(), Self::layout()) };
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.freed.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Global State
// ============================================================================

static KERNEL_PAGES: HeapPageAllocator = HeapPageAllocator::new();

static ZERO_PAGE: spin::Once<PhysAddr> = spin::Once::new();

/// Initialize page subsystem
pub fn init() {
    let _ = zero_page();
}

/// The kernel's page allocator
pub fn kernel_allocator() -> &'static HeapPageAllocator {
    &KERNEL_PAGES
}

/// The shared all-zero page
///
/// Allocated on first use and never freed. Nothing may write to it: every
/// translation that points at it is copy-on-write.
pub fn zero_page() -> PhysAddr {
    *ZERO_PAGE.call_once(|| {
        let page = KERNEL_PAGES
            .alloc_page()
            .expect("cannot allocate the zero page");
        zero_phys_page(page);
        page
    })
}

/// Allocate a page and fill it with zeroes
pub fn alloc_zeroed_page(allocator: &dyn PageAllocator) -> Option<PhysAddr> {
    let page = allocator.alloc_page()?;
    zero_phys_page(page);
    Some(page)
}

/// Allocate a page holding a copy of `src`
pub fn alloc_copy_page(allocator: &dyn PageAllocator, src: PhysAddr) -> Option<PhysAddr> {
    let page = allocator.alloc_page()?;
    copy_phys_page(src, page);
    Some(page)
}

/// Zero a physical page
pub fn zero_phys_page(page: PhysAddr) {
    // SAFETY: the caller owns this page and it is page sized
    unsafe {
        core::ptr::write_bytes(page.as_mut_ptr(), 0, PAGE_SIZE);
    }
}

/// Copy physical page contents
pub fn copy_phys_page(src: PhysAddr, dst: PhysAddr) {
    // SAFETY: both frames are live, page sized and distinct
    unsafe {
        core::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_mut_ptr(), PAGE_SIZE);
    }
}

/// Round address down to page boundary
pub const fn trunc_page(addr: u64) -> u64 {
    addr & !PAGE_MASK
}

/// Round address up to page boundary, `None` on overflow
pub const fn round_page(addr: u64) -> Option<u64> {
    match addr.checked_add(PAGE_MASK) {
        Some(v) => Some(v & !PAGE_MASK),
        None => None,
    }
}
