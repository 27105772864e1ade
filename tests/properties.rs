//! Property-based tests for anonymous files
//!
//! Random operation sequences are checked against a flat byte model of a
//! sparse file whose pages are never reclaimed.

use std::sync::Arc;

use anon_vm::fs::{pread, pwrite, AnonFile, FileOps};
use anon_vm::mach_vm::vm_page::{HeapPageAllocator, PAGE_SIZE};
use anon_vm::mach_vm::{copy_in, copy_out, vm_mmap, MapFlags, VmMap, VmProt};
use proptest::prelude::*;

const PAGE: u64 = PAGE_SIZE as u64;
const SPAN: u64 = 6 * PAGE;
const BASE: u64 = 0x70_0000_0000;

fn round_page(v: u64) -> u64 {
    v.div_ceil(PAGE) * PAGE
}

#[derive(Debug, Clone)]
enum Op {
    Write { offset: u64, data: Vec<u8> },
    Truncate(u64),
    Read { offset: u64, len: usize },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..SPAN, prop::collection::vec(any::<u8>(), 1..300))
            .prop_map(|(offset, data)| Op::Write { offset, data }),
        (0..SPAN).prop_map(Op::Truncate),
        (0..SPAN, 0..2 * PAGE_SIZE).prop_map(|(offset, len)| Op::Read { offset, len }),
    ]
}

/// A short run of bytes inside the mapped span
fn chunk() -> impl Strategy<Value = (u64, Vec<u8>)> {
    (0..SPAN - 64, prop::collection::vec(any::<u8>(), 1..64))
}

/// Reference model: every byte ever written, plus the logical size
struct Model {
    bytes: Vec<u8>,
    size: u64,
}

impl Model {
    fn new() -> Self {
        Self {
            bytes: vec![0; (SPAN + 2 * PAGE) as usize],
            size: 0,
        }
    }

    fn write(&mut self, offset: u64, data: &[u8]) {
        let start = offset as usize;
        self.bytes[start..start + data.len()].copy_from_slice(data);
        self.size = self.size.max(round_page(offset + data.len() as u64));
    }

    fn read(&self, offset: u64, len: usize) -> &[u8] {
        if offset >= self.size {
            return &[];
        }
        let end = (offset + len as u64).min(self.size);
        &self.bytes[offset as usize..end as usize]
    }
}

// ════════════════════════════════════════════════════════════
// Descriptor Property Tests
// ════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Reads, writes and truncates match the sparse model
    #[test]
    fn descriptor_ops_match_model(ops in prop::collection::vec(op(), 1..40)) {
        let file = AnonFile::new();
        let mut model = Model::new();

        for op in ops {
            match op {
                Op::Write { offset, data } => {
                    prop_assert_eq!(pwrite(&file, &data, offset).unwrap(), data.len());
                    model.write(offset, &data);
                }
                Op::Truncate(len) => {
                    file.truncate(len).unwrap();
                    model.size = round_page(len);
                }
                Op::Read { offset, len } => {
                    let mut buf = vec![0xffu8; len];
                    let n = pread(&file, &mut buf, offset).unwrap();
                    prop_assert_eq!(&buf[..n], model.read(offset, len));
                }
            }
            let st_size = file.stat().unwrap().st_size;
            prop_assert_eq!(st_size, model.size);
            prop_assert_eq!(st_size % PAGE, 0);
        }
    }

    /// A write always leaves the size covering it
    #[test]
    fn write_grows_size(offset in 0..SPAN, len in 1usize..3 * PAGE_SIZE) {
        let file = AnonFile::new();
        pwrite(&file, &vec![1u8; len], offset).unwrap();
        prop_assert!(file.stat().unwrap().st_size >= round_page(offset + len as u64));
    }

    /// Pages are only ever released at drop, never by truncate
    #[test]
    fn pages_released_only_at_drop(
        writes in prop::collection::vec((0..SPAN, 1usize..200), 1..20),
        truncate_to in 0..SPAN,
    ) {
        let allocator = Arc::new(HeapPageAllocator::new());
        let file = AnonFile::with_allocator(allocator.clone());
        for (offset, len) in writes {
            pwrite(&file, &vec![7u8; len], offset).unwrap();
        }
        let resident = file.resident_pages() as u64;
        file.truncate(truncate_to).unwrap();

        prop_assert_eq!(allocator.stats().outstanding(), resident);
        drop(file);
        prop_assert_eq!(allocator.stats().outstanding(), 0);
    }
}

// ════════════════════════════════════════════════════════════
// Mapping Property Tests
// ════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Bytes written through a shared mapping are what the descriptor reads
    #[test]
    fn shared_mapping_matches_descriptor(
        writes in prop::collection::vec(chunk(), 1..20)
    ) {
        let map = VmMap::new();
        let file = Arc::new(AnonFile::new());
        file.truncate(SPAN).unwrap();
        vm_mmap(&map, file.clone(), BASE, SPAN, VmProt::DEFAULT, MapFlags::SHARED, 0).unwrap();

        let mut model = vec![0u8; SPAN as usize];
        for (offset, data) in &writes {
            copy_out(&map, BASE + offset, data).unwrap();
            model[*offset as usize..*offset as usize + data.len()].copy_from_slice(data);
        }

        let mut via_fd = vec![0u8; SPAN as usize];
        prop_assert_eq!(pread(&*file, &mut via_fd, 0).unwrap(), SPAN as usize);
        prop_assert_eq!(&via_fd, &model);
    }

    /// Writes through a private mapping over written pages never reach the file
    #[test]
    fn private_mapping_is_isolated(
        fill in any::<u8>(),
        writes in prop::collection::vec(chunk(), 1..20)
    ) {
        let map = VmMap::new();
        let file = Arc::new(AnonFile::new());
        pwrite(&*file, &vec![fill; SPAN as usize], 0).unwrap();
        vm_mmap(&map, file.clone(), BASE, SPAN, VmProt::DEFAULT, MapFlags::PRIVATE, 0).unwrap();

        let mut private = vec![fill; SPAN as usize];
        for (offset, data) in &writes {
            copy_out(&map, BASE + offset, data).unwrap();
            private[*offset as usize..*offset as usize + data.len()].copy_from_slice(data);
        }

        let mut via_map = vec![0u8; SPAN as usize];
        copy_in(&map, BASE, &mut via_map).unwrap();
        prop_assert_eq!(&via_map, &private);

        let mut via_fd = vec![0u8; SPAN as usize];
        pread(&*file, &mut via_fd, 0).unwrap();
        prop_assert!(via_fd.iter().all(|&b| b == fill));
    }
}
