//! Physical Map (pmap) - Hardware Page Table Entries
//!
//! Based on Mach4 vm/pmap.h/c
//!
//! Each mapping owns a flat array of last-level entries, one per page.
//! An entry holds a physical address plus permission bits and a software
//! copy-on-write bit. Entries never own the page they point to; the memory
//! object that installed it decides who frees it.
//!
//! ## Key Operations
//!
//! - `write_pte`: Install a page, failing if the slot changed since the
//!   fault observed it
//! - `clear_pte`: Tear an entry down and return what it held

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::{VmError, VmResult};
use crate::mach_vm::vm_map::VmProt;
use crate::mach_vm::vm_page::{PhysAddr, PAGE_MASK};

// ============================================================================
// Page Table Entry
// ============================================================================

/// Value of a last-level page table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtElement(u64);

impl PtElement {
    /// Translation is valid
    pub const PRESENT: u64 = 1 << 0;
    /// Writes allowed
    pub const WRITABLE: u64 = 1 << 1;
    /// User mode access allowed
    pub const USER: u64 = 1 << 2;
    /// Software bit: write must fault and copy
    pub const COW: u64 = 1 << 9;
    /// Instruction fetch forbidden
    pub const NO_EXECUTE: u64 = 1 << 63;

    const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    /// Empty (not present) entry
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Entry template for a mapping with the given protection
    ///
    /// The address is filled in by `write_pte`.
    pub fn from_prot(prot: VmProt) -> Self {
        let mut bits = Self::PRESENT | Self::USER;
        if prot.can_write() {
            bits |= Self::WRITABLE;
        }
        if !prot.can_execute() {
            bits |= Self::NO_EXECUTE;
        }
        Self(bits)
    }

    pub const fn bits(&self) -> u64 {
        self.0
    }

    pub const fn addr(&self) -> PhysAddr {
        PhysAddr(self.0 & Self::ADDR_MASK)
    }

    pub const fn is_present(&self) -> bool {
        self.0 & Self::PRESENT != 0
    }

    pub const fn is_writable(&self) -> bool {
        self.0 & Self::WRITABLE != 0
    }

    pub const fn is_cow(&self) -> bool {
        self.0 & Self::COW != 0
    }

    pub const fn is_executable(&self) -> bool {
        self.0 & Self::NO_EXECUTE == 0
    }

    /// Same entry pointing at `page`
    pub const fn with_addr(self, page: PhysAddr) -> Self {
        Self((self.0 & !Self::ADDR_MASK) | (page.0 & Self::ADDR_MASK))
    }

    /// Set or clear copy-on-write; a COW entry is never writable
    pub const fn mark_cow(self, cow: bool) -> Self {
        if cow {
            Self((self.0 | Self::COW) & !Self::WRITABLE)
        } else {
            Self(self.0 & !Self::COW)
        }
    }
}

// ============================================================================
// Page Table Slot
// ============================================================================

/// One hardware page table slot
#[derive(Debug, Default)]
pub struct PteSlot(AtomicU64);

impl PteSlot {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Current entry
    pub fn read(&self) -> PtElement {
        PtElement(self.0.load(Ordering::Acquire))
    }

    fn compare_exchange(&self, old: PtElement, new: PtElement) -> bool {
        self.0
            .compare_exchange(old.0, new.0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn swap(&self, new: PtElement) -> PtElement {
        PtElement(self.0.swap(new.0, Ordering::AcqRel))
    }
}

/// Install `page` into `slot` using `pte` for the permission bits
///
/// Succeeds only if the slot still holds `observed`. A `false` return means
/// another thread resolved the same fault first.
pub fn write_pte(page: PhysAddr, slot: &PteSlot, observed: PtElement, pte: PtElement) -> bool {
    debug_assert!(page.0 & PAGE_MASK == 0);
    slot.compare_exchange(observed, pte.with_addr(page))
}

/// Clear `slot`, returning the entry it held
pub fn clear_pte(slot: &PteSlot) -> PtElement {
    slot.swap(PtElement::empty())
}

// ============================================================================
// Pmap Structure
// ============================================================================

/// Page table for one mapping, indexed by page number within the mapping
#[derive(Debug)]
pub struct Pmap {
    slots: Vec<PteSlot>,
}

impl Pmap {
    /// Create a page table covering `pages` pages, all empty
    pub fn new(pages: usize) -> VmResult<Self> {
        let mut slots = Vec::new();
        slots.try_reserve_exact(pages).map_err(|_| {
            log::warn!("pmap: no memory for {} slots", pages);
            VmError::OutOfMemory
        })?;
        slots.resize_with(pages, PteSlot::new);
        Ok(Self { slots })
    }

    /// Number of slots
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot for page index `idx`
    pub fn slot(&self, idx: usize) -> Option<&PteSlot> {
        self.slots.get(idx)
    }

    /// Number of present entries
    pub fn resident_count(&self) -> usize {
        self.slots.iter().filter(|s| s.read().is_present()).count()
    }

    /// New table holding copies of the entries in `start..end`
    ///
    /// Used when a mapping is split; the caller excludes faults on the
    /// original table while copying.
    pub fn copy_range(&self, start: usize, end: usize) -> Pmap {
        let slots = self.slots[start..end]
            .iter()
            .map(|s| PteSlot(AtomicU64::new(s.read().0)))
            .collect();
        Pmap { slots }
    }
}
