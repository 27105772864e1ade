//! Multi-threaded mapping, fault and unmap behaviour

use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use anon_vm::fs::{pread, AnonFile, FileOps};
use anon_vm::mach_vm::vm_page::{HeapPageAllocator, PAGE_SIZE};
use anon_vm::mach_vm::{copy_in, copy_out, fill_user, vm_mmap, vm_munmap, MapFlags, VmMap, VmProt};

const PAGE: u64 = PAGE_SIZE as u64;

/// Step counter the threads wait on
struct Steps {
    state: Mutex<u32>,
    cv: Condvar,
}

impl Steps {
    fn new() -> Self {
        Self {
            state: Mutex::new(1),
            cv: Condvar::new(),
        }
    }

    fn wait_for(&self, step: u32) {
        let mut state = self.state.lock().unwrap();
        while *state != step {
            state = self.cv.wait(state).unwrap();
        }
    }

    fn set(&self, step: u32) {
        *self.state.lock().unwrap() = step;
        self.cv.notify_all();
    }
}

/// T1 maps shared and fills with 0xaa, T2 maps and fills with 0xbb, T3
/// maps private and reads every page
fn three_thread_mmap(pages: u64, t2_shared: bool) {
    let map = Arc::new(VmMap::new());
    let allocator = Arc::new(HeapPageAllocator::new());
    let file = Arc::new(AnonFile::with_allocator(allocator.clone()));
    let size = pages * PAGE;
    file.truncate(size).unwrap();
    let steps = Arc::new(Steps::new());

    let t1 = {
        let (map, file, steps) = (map.clone(), file.clone(), steps.clone());
        thread::spawn(move || {
            let base = 0x10_0000_0000;
            vm_mmap(&map, file, base, size, VmProt::DEFAULT, MapFlags::SHARED, 0).unwrap();
            fill_user(&map, base, 0xaa, size as usize).unwrap();
            steps.set(2);
            steps.wait_for(4);
            vm_munmap(&map, base, size).unwrap();
        })
    };

    let t2 = {
        let (map, file, steps) = (map.clone(), file.clone(), steps.clone());
        thread::spawn(move || {
            steps.wait_for(2);
            let base = 0x20_0000_0000;
            let flags = if t2_shared { MapFlags::SHARED } else { MapFlags::PRIVATE };
            vm_mmap(&map, file, base, size, VmProt::DEFAULT, flags, 0).unwrap();
            fill_user(&map, base, 0xbb, size as usize).unwrap();
            steps.set(3);
            steps.wait_for(4);
            vm_munmap(&map, base, size).unwrap();
        })
    };

    let t3 = {
        let (map, file, steps) = (map.clone(), file.clone(), steps.clone());
        thread::spawn(move || {
            steps.wait_for(3);
            let base = 0x30_0000_0000;
            vm_mmap(&map, file, base, size, VmProt::DEFAULT, MapFlags::PRIVATE, 0).unwrap();

            let expect = if t2_shared { 0xbb } else { 0xaa };
            let mut wrong = 0;
            for i in 0..pages {
                let mut b = [0u8; 1];
                copy_in(&map, base + i * PAGE, &mut b).unwrap();
                if b[0] != expect {
                    wrong += 1;
                }
            }
            steps.set(4);
            vm_munmap(&map, base, size).unwrap();
            wrong
        })
    };

    t1.join().unwrap();
    t2.join().unwrap();
    assert_eq!(t3.join().unwrap(), 0);

    // Private copies were freed at unmap, backing pages stay with the file
    assert_eq!(file.resident_pages() as u64, pages);
    assert_eq!(allocator.stats().outstanding(), pages);
    drop(map);
    drop(file);
    assert_eq!(allocator.stats().outstanding(), 0);
}

#[test]
fn three_threads_shared_writer() {
    three_thread_mmap(64, true);
}

#[test]
fn three_threads_private_writer() {
    three_thread_mmap(64, false);
}

#[test]
fn racing_first_writes_share_one_backing_page() {
    const THREADS: u64 = 8;
    const PAGES: u64 = 16;

    let map = Arc::new(VmMap::new());
    let allocator = Arc::new(HeapPageAllocator::new());
    let file = Arc::new(AnonFile::with_allocator(allocator.clone()));
    file.truncate(PAGES * PAGE).unwrap();
    let base = 0x40_0000_0000;
    vm_mmap(&map, file.clone(), base, PAGES * PAGE, VmProt::DEFAULT, MapFlags::SHARED, 0).unwrap();

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let map = map.clone();
            thread::spawn(move || {
                for p in 0..PAGES {
                    let addr = base + p * PAGE + t * 8;
                    copy_out(&map, addr, &[t as u8 + 1; 8]).unwrap();
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }

    // Every thread's slice landed in the same page
    assert_eq!(file.resident_pages() as u64, PAGES);
    for p in 0..PAGES {
        let mut buf = [0u8; (THREADS * 8) as usize];
        pread(&*file, &mut buf, p * PAGE).unwrap();
        for t in 0..THREADS as usize {
            assert_eq!(buf[t * 8..t * 8 + 8], [t as u8 + 1; 8]);
        }
    }

    drop(map);
    drop(file);
    assert_eq!(allocator.stats().outstanding(), 0);
}

#[test]
fn faults_survive_concurrent_map_changes() {
    const PAGES: u64 = 32;

    let map = Arc::new(VmMap::new());
    let allocator = Arc::new(HeapPageAllocator::new());
    let file = Arc::new(AnonFile::with_allocator(allocator.clone()));
    file.truncate(PAGES * PAGE).unwrap();
    let base = 0x50_0000_0000;
    vm_mmap(&map, file.clone(), base, PAGES * PAGE, VmProt::DEFAULT, MapFlags::PRIVATE, 0).unwrap();

    // Churn an unrelated range so faults see the VMA list change
    let churn = {
        let (map, file) = (map.clone(), file.clone());
        thread::spawn(move || {
            let other = 0x60_0000_0000;
            for _ in 0..200 {
                vm_mmap(&map, file.clone(), other, PAGE, VmProt::DEFAULT, MapFlags::PRIVATE, 0)
                    .unwrap();
                vm_munmap(&map, other, PAGE).unwrap();
            }
        })
    };

    let faulters: Vec<_> = (0..4u8)
        .map(|t| {
            let map = map.clone();
            thread::spawn(move || {
                for p in 0..PAGES {
                    let addr = base + p * PAGE + t as u64;
                    copy_out(&map, addr, &[t + 1]).unwrap();
                    let mut b = [0u8; 1];
                    copy_in(&map, addr, &mut b).unwrap();
                    assert_eq!(b[0], t + 1);
                }
            })
        })
        .collect();

    churn.join().unwrap();
    for f in faulters {
        f.join().unwrap();
    }

    let mut bytes = [0u8; 4];
    copy_in(&map, base + 3 * PAGE, &mut bytes).unwrap();
    assert_eq!(bytes, [1, 2, 3, 4]);

    drop(map);
    drop(file);
    assert_eq!(allocator.stats().outstanding(), 0);
}

#[test]
fn concurrent_descriptor_writers_serialize_per_page() {
    let file = Arc::new(AnonFile::new());
    let writers: Vec<_> = (0..4u8)
        .map(|t| {
            let file = file.clone();
            thread::spawn(move || {
                for _ in 0..50 {
                    anon_vm::fs::pwrite(&*file, &[t; PAGE_SIZE], 0).unwrap();
                }
            })
        })
        .collect();
    for w in writers {
        w.join().unwrap();
    }

    let mut buf = [0u8; PAGE_SIZE];
    pread(&*file, &mut buf, 0).unwrap();
    assert!(buf.iter().all(|&b| b == buf[0]));
    assert_eq!(file.resident_pages(), 1);
    assert_eq!(file.stat().unwrap().st_size, PAGE);
}
