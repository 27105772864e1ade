//! VM Map - Address Space Management
//!
//! Based on Mach4 vm/vm_map.h/c
//! A VM map is the list of file-backed mappings (VMAs) of one address
//! space. Each VMA names a memory object, the object offset of its first
//! page and its own page table. The list is guarded by a read/write lock:
//! faults and user copies hold the read side, map/unmap hold the write side.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{VmError, VmResult};
use crate::kern::lock::RwLock;
use crate::mach_vm::memory_object::MemoryObject;
use crate::mach_vm::pmap::{self, Pmap, PteSlot};
use crate::mach_vm::vm_page::{PAGE_MASK, PAGE_SHIFT, PAGE_SIZE};

// ============================================================================
// VM Map Types
// ============================================================================

/// Memory protection flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmProt(u32);

impl VmProt {
    /// No access
    pub const NONE: Self = Self(0);
    /// Read access
    pub const READ: Self = Self(1);
    /// Write access
    pub const WRITE: Self = Self(2);
    /// Execute access
    pub const EXECUTE: Self = Self(4);
    /// Default (read/write)
    pub const DEFAULT: Self = Self(3); // READ | WRITE
    /// All permissions
    pub const ALL: Self = Self(7); // READ | WRITE | EXECUTE

    pub fn new(bits: u32) -> Self {
        Self(bits & 0x7)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn can_read(&self) -> bool {
        self.contains(Self::READ)
    }

    pub fn can_write(&self) -> bool {
        self.contains(Self::WRITE)
    }

    pub fn can_execute(&self) -> bool {
        self.contains(Self::EXECUTE)
    }
}

impl core::ops::BitOr for VmProt {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl Default for VmProt {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// mmap flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapFlags(u32);

impl MapFlags {
    /// Writes are visible to every mapper and to descriptor I/O
    pub const SHARED: Self = Self(0x01);
    /// Writes are private to this mapping (copy-on-write)
    pub const PRIVATE: Self = Self(0x02);

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & 0x03)
    }

    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

/// Half-open virtual address range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrRange {
    start: u64,
    end: u64,
}

impl AddrRange {
    /// Range of `len` bytes at `start`, `None` if it wraps
    pub fn new(start: u64, len: u64) -> Option<Self> {
        let end = start.checked_add(len)?;
        Some(Self { start, end })
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }

    pub fn is_page_aligned(&self) -> bool {
        self.start & PAGE_MASK == 0 && self.end & PAGE_MASK == 0
    }
}

// ============================================================================
// File VMA
// ============================================================================

/// A mapping of a memory object into an address range
pub struct FileVma {
    range: AddrRange,
    prot: VmProt,
    flags: MapFlags,
    /// Object offset of the first page
    offset: u64,
    object: Arc<dyn MemoryObject>,
    pmap: Pmap,
}

impl core::fmt::Debug for FileVma {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FileVma")
            .field("range", &self.range)
            .field("prot", &self.prot)
            .field("flags", &self.flags)
            .field("offset", &self.offset)
            .field("resident", &self.pmap.resident_count())
            .finish()
    }
}

impl FileVma {
    pub fn range(&self) -> AddrRange {
        self.range
    }

    pub fn prot(&self) -> VmProt {
        self.prot
    }

    pub fn flags(&self) -> MapFlags {
        self.flags
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn object(&self) -> &Arc<dyn MemoryObject> {
        &self.object
    }

    pub fn is_shared(&self) -> bool {
        self.flags.contains(MapFlags::SHARED)
    }

    /// Object offset backing `addr`
    pub fn object_offset(&self, addr: u64) -> u64 {
        self.offset + (addr - self.range.start)
    }

    /// Page table slot for `addr`
    pub fn slot(&self, addr: u64) -> Option<&PteSlot> {
        if !self.range.contains(addr) {
            return None;
        }
        let idx = ((addr - self.range.start) >> PAGE_SHIFT) as usize;
        self.pmap.slot(idx)
    }

    /// Number of pages currently translated
    pub fn resident_count(&self) -> usize {
        self.pmap.resident_count()
    }

    /// Tear down the translations in `start..end`
    ///
    /// Each removed page is offered back to the object; pages the object
    /// does not own are freed here.
    fn release_range(&self, start: u64, end: u64) {
        let mut addr = start;
        while addr < end {
            if let Some(slot) = self.slot(addr) {
                let old = pmap::clear_pte(slot);
                if old.is_present() {
                    let offset = self.object_offset(addr);
                    if self.object.put_page(old.addr(), offset) {
                        self.object.page_allocator().free_page(old.addr());
                    }
                }
            }
            addr += PAGE_SIZE as u64;
        }
    }

    /// Copy of the part of this mapping covering `start..end`
    fn sub_vma(&self, start: u64, end: u64) -> FileVma {
        let first = ((start - self.range.start) >> PAGE_SHIFT) as usize;
        let last = ((end - self.range.start) >> PAGE_SHIFT) as usize;
        FileVma {
            range: AddrRange { start, end },
            prot: self.prot,
            flags: self.flags,
            offset: self.object_offset(start),
            object: Arc::clone(&self.object),
            pmap: self.pmap.copy_range(first, last),
        }
    }
}

/// Build the mapping handle for a file mmap
///
/// The object has already checked `offset` and the length against its
/// size. Exactly one of SHARED/PRIVATE must be given and the range must be
/// page aligned.
pub fn map_file_mmap(
    object: Arc<dyn MemoryObject>,
    range: AddrRange,
    flags: MapFlags,
    prot: VmProt,
    offset: u64,
) -> VmResult<FileVma> {
    let shared = flags.contains(MapFlags::SHARED);
    let private = flags.contains(MapFlags::PRIVATE);
    if shared == private || range.is_empty() || !range.is_page_aligned() {
        return Err(VmError::InvalidArgument);
    }
    if offset & PAGE_MASK != 0 {
        return Err(VmError::InvalidArgument);
    }

    let pages = usize::try_from(range.len() >> PAGE_SHIFT).map_err(|_| VmError::OutOfMemory)?;
    let pmap = Pmap::new(pages)?;
    Ok(FileVma {
        range,
        prot,
        flags,
        offset,
        object,
        pmap,
    })
}

// ============================================================================
// VMA List
// ============================================================================

/// The mappings of an address space, keyed by start address
#[derive(Debug, Default)]
pub struct VmaList {
    vmas: BTreeMap<u64, Arc<FileVma>>,
    /// Bumped by every change to the list
    generation: u64,
}

impl VmaList {
    /// Mapping containing `addr`
    pub fn find(&self, addr: u64) -> Option<&Arc<FileVma>> {
        let (_, vma) = self.vmas.range(..=addr).next_back()?;
        vma.range.contains(addr).then_some(vma)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.vmas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vmas.is_empty()
    }

    fn overlaps(&self, range: AddrRange) -> bool {
        self.vmas
            .range(..range.end)
            .next_back()
            .is_some_and(|(_, vma)| vma.range.end > range.start)
    }
}

// ============================================================================
// VM Map
// ============================================================================

/// Address space: the VMA list and its lock
#[derive(Default)]
pub struct VmMap {
    vmas: RwLock<VmaList>,
}

impl VmMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// The VMA list lock
    pub fn vmas(&self) -> &RwLock<VmaList> {
        &self.vmas
    }

    /// Insert a mapping; its range must be free
    pub fn insert(&self, vma: FileVma) -> VmResult<Arc<FileVma>> {
        let mut list = self.vmas.write();
        if list.overlaps(vma.range) {
            log::warn!("vm_map: {:#x}..{:#x} overlaps", vma.range.start, vma.range.end);
            return Err(VmError::InvalidArgument);
        }

        log::debug!(
            "vm_map: map {:#x}..{:#x} offset {:#x} {}",
            vma.range.start,
            vma.range.end,
            vma.offset,
            if vma.is_shared() { "shared" } else { "private" }
        );

        let vma = Arc::new(vma);
        list.vmas.insert(vma.range.start, Arc::clone(&vma));
        list.generation += 1;
        Ok(vma)
    }

    /// Remove all translations and mappings in `start..start + len`
    ///
    /// Mappings that straddle the range are split; unmapped holes are ignored.
    pub fn unmap(&self, start: u64, len: u64) -> VmResult<()> {
        let range = AddrRange::new(start, len).ok_or(VmError::InvalidArgument)?;
        if range.is_empty() || !range.is_page_aligned() {
            return Err(VmError::InvalidArgument);
        }

        let mut list = self.vmas.write();
        let hit: Vec<u64> = list
            .vmas
            .range(..range.end)
            .filter(|(_, vma)| vma.range.end > range.start)
            .map(|(&key, _)| key)
            .collect();

        for key in hit {
            let Some(vma) = list.vmas.remove(&key) else {
                continue;
            };
            let lo = vma.range.start.max(range.start);
            let hi = vma.range.end.min(range.end);

            log::debug!("vm_map: unmap {:#x}..{:#x}", lo, hi);
            vma.release_range(lo, hi);

            if vma.range.start < lo {
                let head = vma.sub_vma(vma.range.start, lo);
                list.vmas.insert(head.range.start, Arc::new(head));
            }
            if hi < vma.range.end {
                let tail = vma.sub_vma(hi, vma.range.end);
                list.vmas.insert(tail.range.start, Arc::new(tail));
            }
        }

        list.generation += 1;
        Ok(())
    }

    /// Number of mappings
    pub fn vma_count(&self) -> usize {
        self.vmas.read().len()
    }
}

impl Drop for VmMap {
    fn drop(&mut self) {
        let mut list = self.vmas.write();
        let vmas = core::mem::take(&mut list.vmas);
        for vma in vmas.values() {
            vma.release_range(vma.range.start, vma.range.end);
        }
        list.generation += 1;
    }
}
