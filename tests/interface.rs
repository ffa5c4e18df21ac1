//! Injects a counting memory interface and observes the allocator's OS
//! traffic: span reuse, the one-warm-page decommit policy, and huge
//! mappings. A single test in its own process so the counters are exact.
#![cfg(unix)]

use std::sync::atomic::{AtomicUsize, Ordering};

static MAP_CALLS: AtomicUsize = AtomicUsize::new(0);
static COMMIT_CALLS: AtomicUsize = AtomicUsize::new(0);
static DECOMMIT_CALLS: AtomicUsize = AtomicUsize::new(0);
static UNMAP_CALLS: AtomicUsize = AtomicUsize::new(0);

unsafe fn counting_map(
    size: usize,
    alignment: usize,
    offset: &mut usize,
    mapped_size: &mut usize,
) -> *mut u8 {
    MAP_CALLS.fetch_add(1, Ordering::Relaxed);
    let map_size = size + alignment;
    let ptr = libc::mmap(
        std::ptr::null_mut(),
        map_size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
    );
    if ptr == libc::MAP_FAILED {
        return std::ptr::null_mut();
    }
    let mut ptr = ptr as *mut u8;
    if alignment != 0 {
        let mut padding = (ptr as usize) & (alignment - 1);
        if padding != 0 {
            padding = alignment - padding;
        }
        ptr = ptr.add(padding);
        *offset = padding;
    }
    *mapped_size = map_size;
    ptr
}

unsafe fn counting_commit(address: *mut u8, size: usize) {
    COMMIT_CALLS.fetch_add(1, Ordering::Relaxed);
    assert_eq!(
        libc::mprotect(
            address as *mut _,
            size,
            libc::PROT_READ | libc::PROT_WRITE
        ),
        0
    );
}

unsafe fn counting_decommit(address: *mut u8, size: usize) {
    DECOMMIT_CALLS.fetch_add(1, Ordering::Relaxed);
    assert_eq!(libc::mprotect(address as *mut _, size, libc::PROT_NONE), 0);
}

unsafe fn counting_unmap(address: *mut u8, offset: usize, mapped_size: usize) {
    UNMAP_CALLS.fetch_add(1, Ordering::Relaxed);
    assert_eq!(libc::munmap(address.sub(offset) as *mut _, mapped_size), 0);
}

fn maps() -> usize {
    MAP_CALLS.load(Ordering::Relaxed)
}

fn commits() -> usize {
    COMMIT_CALLS.load(Ordering::Relaxed)
}

fn decommits() -> usize {
    DECOMMIT_CALLS.load(Ordering::Relaxed)
}

fn unmaps() -> usize {
    UNMAP_CALLS.load(Ordering::Relaxed)
}

#[test]
fn os_traffic_follows_page_recycling_policy() {
    let interface = spanalloc::MemoryInterface {
        memory_map: Some(counting_map as spanalloc::MapFn),
        memory_commit: Some(counting_commit as spanalloc::CommitFn),
        memory_decommit: Some(counting_decommit as spanalloc::CommitFn),
        memory_unmap: Some(counting_unmap as spanalloc::UnmapFn),
        map_fail_callback: None,
    };
    assert_eq!(spanalloc::initialize(Some(&interface)), 0);

    // Phase 1: 48 byte blocks filling 98 pages of the 64 byte class to the
    // brim, then freed in reverse order. A whole number of pages matters:
    // a trailing partial page would keep its last initialization batch
    // parked on the heap free list, so that page would never empty and
    // never reach the page free stack.
    let block_size = 64;
    let blocks_per_page = (64 * 1024 - 128) / block_size; // 1022
    let count = 98 * blocks_per_page;
    let total_pages = (count + blocks_per_page - 1) / blocks_per_page;

    let ptrs: Vec<usize> = (0..count)
        .map(|_| {
            let p = spanalloc::alloc(48) as usize;
            assert!(p != 0);
            p
        })
        .collect();
    // One map for the heap structure, one for the small span
    assert_eq!(maps(), 2);
    assert_eq!(unmaps(), 0);

    for &p in ptrs.iter().rev() {
        unsafe { spanalloc::free(p as *mut u8) };
    }
    // All 98 pages emptied onto the free list; every push after the first
    // decommitted the previous head, keeping exactly one warm page, and no
    // span went back to the OS
    assert_eq!(decommits(), total_pages - 1);
    assert_eq!(unmaps(), 0);
    assert_eq!(maps(), 2);

    // Phase 2: the warm head page covers the first 1022 allocations for
    // free; the 978 after that pull a decommitted page, costing exactly
    // one commit and still no map
    let reused: Vec<usize> = (0..2000)
        .map(|_| spanalloc::alloc(48) as usize)
        .collect();
    assert!(reused.iter().all(|&p| p != 0));
    assert_eq!(maps(), 2);
    assert_eq!(commits(), 1);

    // Phase 3: the second page has 44 blocks of spare capacity left, so
    // digging 1000 deeper reaches a third decommitted page and a second
    // commit
    let deeper: Vec<usize> = (0..1000)
        .map(|_| spanalloc::alloc(48) as usize)
        .collect();
    assert!(deeper.iter().all(|&p| p != 0));
    assert_eq!(maps(), 2);
    assert_eq!(commits(), 2);

    for p in reused.into_iter().chain(deeper) {
        unsafe { spanalloc::free(p as *mut u8) };
    }

    // Phase 4: a huge allocation maps a dedicated region and frees it back
    // to the OS immediately
    let maps_before = maps();
    let huge = spanalloc::alloc(64 * 1024 * 1024);
    assert!(!huge.is_null());
    assert_eq!(maps(), maps_before + 1);
    unsafe {
        assert!(spanalloc::usable_size(huge) >= 64 * 1024 * 1024);
        spanalloc::free(huge);
    }
    assert_eq!(unmaps(), 1);
}
