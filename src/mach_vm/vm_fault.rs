//! VM Fault - Page Fault Handling
//!
//! Based on Mach4 vm/vm_fault.h/c
//! Handles page faults on file mappings by asking the mapping's memory
//! object which page to install.
//!
//! ## Fault Flow
//!
//! 1. Take the VMA list read lock and find the mapping
//! 2. Check the access against the mapping's protection
//! 3. Snapshot the page table slot and call `MemoryObject::map_page`
//! 4. If the object reports a race, drop everything and start over
//!
//! The object may release the VMA list lock while it prepares (see
//! `PageFault::without_vma_lock`); installs after that are refused if the
//! list changed in the meantime.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::{VmError, VmResult};
use crate::kern::lock::ReadGuard;
use crate::mach_vm::pmap::{self, PtElement, PteSlot};
use crate::mach_vm::vm_map::{VmMap, VmProt, VmaList};
use crate::mach_vm::vm_page::{self, PhysAddr};

// ============================================================================
// Fault Type
// ============================================================================

/// Fault type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultType {
    /// Read fault
    Read,
    /// Write fault
    Write,
    /// Execute fault
    Execute,
}

impl FaultType {
    /// Convert to required protection
    pub fn to_protection(&self) -> VmProt {
        match self {
            FaultType::Read => VmProt::READ,
            FaultType::Write => VmProt::WRITE,
            FaultType::Execute => VmProt::EXECUTE,
        }
    }

    /// Would an access of this type go through `pte` without faulting?
    pub fn satisfied_by(&self, pte: PtElement) -> bool {
        match self {
            FaultType::Read => pte.is_present(),
            FaultType::Write => pte.is_present() && pte.is_writable(),
            FaultType::Execute => pte.is_present() && pte.is_executable(),
        }
    }
}

// ============================================================================
// Fault Statistics
// ============================================================================

/// Global fault statistics
static FAULT_STATS: FaultStats = FaultStats::new();

/// Fault statistics counters
pub struct FaultStats {
    /// Total faults
    pub total: AtomicU64,
    /// Copy-on-write duplicates made
    pub cow: AtomicU64,
    /// Pages materialized zero-filled
    pub zero_fill: AtomicU64,
    /// Faults retried after losing a race
    pub retries: AtomicU64,
    /// Failed faults
    pub failures: AtomicU64,
}

impl FaultStats {
    pub const fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            cow: AtomicU64::new(0),
            zero_fill: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn incr_total(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_cow(&self) {
        self.cow.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_zero_fill(&self) {
        self.zero_fill.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_retries(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_failures(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for FaultStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Get fault statistics
pub fn stats() -> &'static FaultStats {
    &FAULT_STATS
}

// ============================================================================
// Fault Context
// ============================================================================

/// One in-flight fault, handed to `MemoryObject::map_page`
pub struct PageFault<'a, 'g> {
    guard: &'a mut ReadGuard<'g, VmaList>,
    generation: u64,
    slot: &'a PteSlot,
    observed: PtElement,
    template: PtElement,
}

impl<'a, 'g> PageFault<'a, 'g> {
    fn new(
        guard: &'a mut ReadGuard<'g, VmaList>,
        slot: &'a PteSlot,
        template: PtElement,
    ) -> Self {
        let generation = guard.generation();
        let observed = slot.read();
        Self {
            guard,
            generation,
            slot,
            observed,
            template,
        }
    }

    /// Run `f` with the VMA list read lock dropped
    ///
    /// `f` must not touch the mapping; the caller checks `is_stale`
    /// before using the fault again.
    pub fn without_vma_lock<R>(&mut self, f: impl FnOnce() -> R) -> R {
        self.guard.unlocked(f)
    }

    /// Did the VMA list change since the fault started?
    pub fn is_stale(&self) -> bool {
        self.guard.generation() != self.generation
    }

    /// Entry the slot held when the fault was taken
    pub fn observed(&self) -> PtElement {
        self.observed
    }

    /// Install `page`, copy-on-write if `cow`
    ///
    /// `false` if the slot or the VMA list changed; nothing is installed.
    pub fn install(&self, page: PhysAddr, cow: bool) -> bool {
        if self.is_stale() {
            return false;
        }
        pmap::write_pte(page, self.slot, self.observed, self.template.mark_cow(cow))
    }
}

// ============================================================================
// Page Fault Handling
// ============================================================================

/// Handle a page fault at `vaddr`
///
/// Returns once the slot for `vaddr` allows the access. Fails with
/// `BadAddress` if nothing is mapped there or the mapping forbids the
/// access, and with `OutOfMemory` if the object could not get a page.
pub fn vm_fault(map: &VmMap, vaddr: u64, fault_type: FaultType) -> VmResult<()> {
    FAULT_STATS.incr_total();

    let page_addr = vm_page::trunc_page(vaddr);

    loop {
        let mut guard = map.vmas().read();

        let vma = match guard.find(page_addr) {
            Some(vma) => Arc::clone(vma),
            None => {
                FAULT_STATS.incr_failures();
                return Err(VmError::BadAddress(vaddr));
            }
        };

        if !vma.prot().contains(fault_type.to_protection()) {
            FAULT_STATS.incr_failures();
            return Err(VmError::BadAddress(vaddr));
        }

        let Some(slot) = vma.slot(page_addr) else {
            FAULT_STATS.incr_failures();
            return Err(VmError::BadAddress(vaddr));
        };

        if fault_type.satisfied_by(slot.read()) {
            // Someone else resolved it
            return Ok(());
        }

        let offset = vma.object_offset(page_addr);
        let write = fault_type == FaultType::Write;
        let mut fault = PageFault::new(&mut guard, slot, PtElement::from_prot(vma.prot()));

        match vma.object().map_page(offset, &mut fault, write, vma.is_shared()) {
            Ok(true) => return Ok(()),
            Ok(false) => {
                log::trace!("vm_fault: retry {:#x}", page_addr);
                FAULT_STATS.incr_retries();
            }
            Err(e) => {
                log::warn!("vm_fault: {:#x} failed: {}", vaddr, e);
                FAULT_STATS.incr_failures();
                return Err(e);
            }
        }
    }
}
