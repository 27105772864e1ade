//! VM User Interface - mmap/munmap and user memory access
//!
//! Based on Mach4 vm/vm_user.c
//!
//! ## Key Operations
//!
//! - `vm_mmap`: Map a file into an address space
//! - `vm_munmap`: Remove mappings from an address space
//! - `copy_in`: Read user memory through the page tables
//! - `copy_out`: Write user memory through the page tables
//!
//! `copy_in`/`copy_out` walk the mapping's page table the way the MMU
//! would. A missing or insufficient entry raises a fault and the access is
//! retried once the fault is resolved. The copy itself runs with the VMA
//! list read lock held, so an unmap cannot free the page underneath it.

use alloc::sync::Arc;

use crate::error::{VmError, VmResult};
use crate::fs::FileOps;
use crate::mach_vm::vm_fault::{vm_fault, FaultType};
use crate::mach_vm::vm_map::{AddrRange, FileVma, MapFlags, VmMap, VmProt, VmaList};
use crate::mach_vm::vm_page::{self, PhysAddr, PAGE_MASK, PAGE_SIZE};

// ============================================================================
// Map / Unmap
// ============================================================================

/// Map `len` bytes of `file` at `offset` into `map` at `addr`
///
/// `len` is rounded up to whole pages.
pub fn vm_mmap(
    map: &VmMap,
    file: Arc<dyn FileOps>,
    addr: u64,
    len: u64,
    prot: VmProt,
    flags: MapFlags,
    offset: u64,
) -> VmResult<Arc<FileVma>> {
    let len = vm_page::round_page(len).ok_or(VmError::InvalidArgument)?;
    let range = AddrRange::new(addr, len).ok_or(VmError::InvalidArgument)?;
    let vma = file.mmap(range, flags, prot, offset)?;
    map.insert(vma)
}

/// Unmap `addr..addr + len`, rounded up to whole pages
pub fn vm_munmap(map: &VmMap, addr: u64, len: u64) -> VmResult<()> {
    let len = vm_page::round_page(len).ok_or(VmError::InvalidArgument)?;
    map.unmap(addr, len)
}

// ============================================================================
// User Memory Access
// ============================================================================

/// Page currently translated for an access of `fault_type` at `addr`
fn translate(list: &VmaList, addr: u64, fault_type: FaultType) -> Option<PhysAddr> {
    let vma = list.find(addr)?;
    if !vma.prot().contains(fault_type.to_protection()) {
        return None;
    }
    let pte = vma.slot(vm_page::trunc_page(addr))?.read();
    fault_type.satisfied_by(pte).then(|| pte.addr())
}

/// Run `copy(page, in_page, done, n)` for each page of `addr..addr + len`
fn for_each_page(
    map: &VmMap,
    addr: u64,
    len: usize,
    fault_type: FaultType,
    mut copy: impl FnMut(PhysAddr, usize, usize, usize),
) -> VmResult<()> {
    let mut done = 0;
    while done < len {
        let va = addr
            .checked_add(done as u64)
            .ok_or(VmError::BadAddress(addr))?;
        let in_page = (va & PAGE_MASK) as usize;
        let n = (PAGE_SIZE - in_page).min(len - done);

        {
            let list = map.vmas().read();
            if let Some(page) = translate(&list, va, fault_type) {
                copy(page, in_page, done, n);
                done += n;
                continue;
            }
        }

        vm_fault(map, va, fault_type)?;
    }
    Ok(())
}

/// Copy user memory at `addr` into `dst`
pub fn copy_in(map: &VmMap, addr: u64, dst: &mut [u8]) -> VmResult<()> {
    let len = dst.len();
    for_each_page(map, addr, len, FaultType::Read, |page, in_page, done, n| {
        // SAFETY: the translation is live while the VMA list is locked
        unsafe {
            core::ptr::copy_nonoverlapping(
                page.as_ptr().add(in_page),
                dst[done..done + n].as_mut_ptr(),
                n,
            );
        }
    })
}

/// Copy `src` into user memory at `addr`
pub fn copy_out(map: &VmMap, addr: u64, src: &[u8]) -> VmResult<()> {
    for_each_page(map, addr, src.len(), FaultType::Write, |page, in_page, done, n| {
        // SAFETY: the translation is live and writable while the VMA list
        // is locked
        unsafe {
            core::ptr::copy_nonoverlapping(
                src[done..done + n].as_ptr(),
                page.as_mut_ptr().add(in_page),
                n,
            );
        }
    })
}

/// Fill `len` bytes of user memory at `addr` with `byte`
pub fn fill_user(map: &VmMap, addr: u64, byte: u8, len: usize) -> VmResult<()> {
    for_each_page(map, addr, len, FaultType::Write, |page, in_page, _, n| {
        // SAFETY: as for copy_out
        unsafe {
            core::ptr::write_bytes(page.as_mut_ptr().add(in_page), byte, n);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::anon_file::AnonFile;
    use crate::fs::{pread, pwrite};

    const BASE: u64 = 0x1000_0000;
    const PAGE: u64 = PAGE_SIZE as u64;

    fn anon(len: u64) -> Arc<AnonFile> {
        let file = Arc::new(AnonFile::new());
        file.truncate(len).unwrap();
        file
    }

    #[test]
    fn test_mmap_rounds_length() {
        let map = VmMap::new();
        let vma = vm_mmap(&map, anon(PAGE), BASE, 10, VmProt::DEFAULT, MapFlags::SHARED, 0)
            .unwrap();
        assert_eq!(vma.range().len(), PAGE);
        assert_eq!(map.vma_count(), 1);

        vm_munmap(&map, BASE, 1).unwrap();
        assert_eq!(map.vma_count(), 0);
    }

    #[test]
    fn test_mmap_beyond_size() {
        let map = VmMap::new();
        let err = vm_mmap(&map, anon(PAGE), BASE, 2 * PAGE, VmProt::DEFAULT, MapFlags::SHARED, 0);
        assert_eq!(err.unwrap_err(), VmError::InvalidArgument);
        assert_eq!(map.vma_count(), 0);
    }

    #[test]
    fn test_copy_round_trip_across_pages() {
        let map = VmMap::new();
        let file = anon(2 * PAGE);
        vm_mmap(&map, file.clone(), BASE, 2 * PAGE, VmProt::DEFAULT, MapFlags::SHARED, 0).unwrap();

        let data: [u8; 64] = core::array::from_fn(|i| i as u8);
        copy_out(&map, BASE + PAGE - 32, &data).unwrap();

        let mut back = [0u8; 64];
        copy_in(&map, BASE + PAGE - 32, &mut back).unwrap();
        assert_eq!(back, data);

        // Shared: the descriptor sees the same bytes
        let mut via_fd = [0u8; 64];
        pread(&*file, &mut via_fd, PAGE - 32).unwrap();
        assert_eq!(via_fd, data);
    }

    #[test]
    fn test_descriptor_write_visible_in_mapping() {
        let map = VmMap::new();
        let file = anon(PAGE);
        pwrite(&*file, b"mapped", 100).unwrap();
        vm_mmap(&map, file, BASE, PAGE, VmProt::DEFAULT, MapFlags::PRIVATE, 0).unwrap();

        let mut buf = [0u8; 6];
        copy_in(&map, BASE + 100, &mut buf).unwrap();
        assert_eq!(&buf, b"mapped");
    }

    #[test]
    fn test_unmapped_access_faults() {
        let map = VmMap::new();
        let mut buf = [0u8; 1];
        assert_eq!(copy_in(&map, BASE, &mut buf), Err(VmError::BadAddress(BASE)));
    }

    #[test]
    fn test_read_only_mapping_rejects_write() {
        let map = VmMap::new();
        vm_mmap(&map, anon(PAGE), BASE, PAGE, VmProt::READ, MapFlags::SHARED, 0).unwrap();

        let mut buf = [1u8; 4];
        copy_in(&map, BASE, &mut buf).unwrap();
        assert_eq!(buf, [0; 4]);
        assert_eq!(copy_out(&map, BASE, &[1]), Err(VmError::BadAddress(BASE)));
    }

    #[test]
    fn test_fill_user() {
        let map = VmMap::new();
        let file = anon(2 * PAGE);
        vm_mmap(&map, file.clone(), BASE, 2 * PAGE, VmProt::DEFAULT, MapFlags::SHARED, 0).unwrap();
        fill_user(&map, BASE, 0xee, 2 * PAGE_SIZE).unwrap();
        assert_eq!(file.resident_pages(), 2);

        let mut buf = [0u8; 8];
        pread(&*file, &mut buf, PAGE + 7).unwrap();
        assert_eq!(buf, [0xee; 8]);
    }
}
