//! Single-threaded behavior of the raw entry points: round trips, usable
//! size, zeroing, reallocation and aligned allocation.

use spanalloc::{GROW_OR_FAIL, NO_PRESERVE};

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

#[test]
fn alloc_free_round_trip() {
    let ptr = spanalloc::alloc(100);
    assert!(!ptr.is_null());
    unsafe {
        for i in 0..100 {
            *ptr.add(i) = i as u8;
        }
        assert!(spanalloc::usable_size(ptr) >= 100);
        spanalloc::free(ptr);
    }
}

#[test]
fn free_null_is_noop() {
    unsafe { spanalloc::free(std::ptr::null_mut()) };
}

#[test]
fn zero_size_allocation_is_served() {
    let ptr = spanalloc::alloc(0);
    assert!(!ptr.is_null());
    unsafe { spanalloc::free(ptr) };
}

#[test]
fn usable_size_covers_request() {
    for &size in &[1, 16, 32, 48, 100, 511, 513, 4000, 70_000, 3_000_000] {
        let ptr = spanalloc::alloc(size);
        assert!(!ptr.is_null());
        unsafe {
            assert!(spanalloc::usable_size(ptr) >= size, "size {}", size);
            spanalloc::free(ptr);
        }
    }
}

// For classes without batched block initialization the page local free list
// is popped directly, so an alloc/free cycle returns the same block from
// the second cycle on.
#[test]
fn alloc_free_cycle_reuses_block() {
    let first = spanalloc::alloc(2000);
    assert!(!first.is_null());
    unsafe { spanalloc::free(first) };
    let mut previous = std::ptr::null_mut();
    for cycle in 0..50 {
        let ptr = spanalloc::alloc(2000);
        assert!(!ptr.is_null());
        if cycle > 0 {
            assert_eq!(ptr, previous, "cycle {}", cycle);
        }
        previous = ptr;
        unsafe { spanalloc::free(ptr) };
    }
}

// Small classes rotate through the batch linked into the heap free list,
// but the working set stays inside a single OS page of a single 64KiB page.
#[test]
fn small_class_working_set_stays_compact() {
    let mut pages = std::collections::HashSet::new();
    for _ in 0..500 {
        let ptr = spanalloc::alloc(48);
        assert!(!ptr.is_null());
        pages.insert(ptr as usize & !(64 * 1024 - 1));
        unsafe { spanalloc::free(ptr) };
    }
    assert_eq!(pages.len(), 1);
}

#[test]
fn calloc_returns_zeroed_memory() {
    let ptr = spanalloc::calloc(1000, 8);
    assert!(!ptr.is_null());
    unsafe {
        assert!((0..8000).all(|i| *ptr.add(i) == 0));
        // Dirty the block, free it, and make sure a reused block is scrubbed
        std::ptr::write_bytes(ptr, 0xAB, 8000);
        spanalloc::free(ptr);
    }
    let again = spanalloc::calloc(1000, 8);
    assert!(!again.is_null());
    unsafe {
        assert!((0..8000).all(|i| *again.add(i) == 0));
        spanalloc::free(again);
    }
}

#[test]
fn calloc_overflow_is_rejected() {
    let ptr = spanalloc::calloc(usize::max_value() / 2, 3);
    assert!(ptr.is_null());
    assert_eq!(last_errno(), libc::EINVAL);
}

#[test]
fn realloc_preserves_contents_across_classes() {
    unsafe {
        let p = spanalloc::alloc(1000);
        assert!(!p.is_null());
        for i in 0..1000 {
            *p.add(i) = (i % 251) as u8;
        }
        // Grow into a different size class
        let q = spanalloc::realloc(p, 100_000);
        assert!(!q.is_null());
        assert!((0..1000).all(|i| *q.add(i) == (i % 251) as u8));
        // Shrink far back down; may stay in place
        let r = spanalloc::realloc(q, 200);
        assert!(!r.is_null());
        assert!((0..200).all(|i| *r.add(i) == (i % 251) as u8));
        spanalloc::free(r);
    }
}

#[test]
fn realloc_null_behaves_like_alloc() {
    unsafe {
        let ptr = spanalloc::realloc(std::ptr::null_mut(), 300);
        assert!(!ptr.is_null());
        spanalloc::free(ptr);
    }
}

#[test]
fn grow_or_fail_leaves_block_alone() {
    unsafe {
        let ptr = spanalloc::alloc(100);
        assert!(!ptr.is_null());
        *ptr = 0x5A;
        let grown = spanalloc::aligned_realloc(ptr, 8, 1_000_000, 0, GROW_OR_FAIL);
        assert!(grown.is_null());
        // The original block is still live
        assert_eq!(*ptr, 0x5A);
        spanalloc::free(ptr);
    }
}

#[test]
fn no_preserve_skips_the_copy() {
    unsafe {
        let ptr = spanalloc::alloc(100);
        assert!(!ptr.is_null());
        let grown = spanalloc::aligned_realloc(ptr, 8, 200_000, 0, NO_PRESERVE);
        assert!(!grown.is_null());
        spanalloc::free(grown);
    }
}

#[test]
fn aligned_allocations_are_aligned() {
    for &alignment in &[64usize, 128, 1024, 4096, 65_536, 131_072] {
        let ptr = spanalloc::aligned_alloc(alignment, 100);
        assert!(!ptr.is_null(), "alignment {}", alignment);
        assert_eq!(ptr as usize % alignment, 0, "alignment {}", alignment);
        unsafe {
            assert!(spanalloc::usable_size(ptr) >= 100);
            std::ptr::write_bytes(ptr, 0x77, 100);
            spanalloc::free(ptr);
        }
    }
}

#[test]
fn invalid_alignment_is_rejected() {
    let ptr = spanalloc::aligned_alloc(256 * 1024, 100);
    assert!(ptr.is_null());
    assert_eq!(last_errno(), libc::EINVAL);

    let ptr = spanalloc::aligned_alloc(48, 100);
    assert!(ptr.is_null());
    assert_eq!(last_errno(), libc::EINVAL);
}

#[test]
fn aligned_calloc_zeroes() {
    let ptr = spanalloc::aligned_calloc(256, 100, 10);
    assert!(!ptr.is_null());
    assert_eq!(ptr as usize % 256, 0);
    unsafe {
        assert!((0..1000).all(|i| *ptr.add(i) == 0));
        spanalloc::free(ptr);
    }
}

#[test]
fn posix_memalign_contract() {
    unsafe {
        let mut out: *mut u8 = std::ptr::null_mut();
        assert_eq!(spanalloc::posix_memalign(&mut out, 64, 100), 0);
        assert!(!out.is_null());
        assert_eq!(out as usize % 64, 0);
        spanalloc::free(out);

        assert_eq!(
            spanalloc::posix_memalign(std::ptr::null_mut(), 64, 100),
            libc::EINVAL
        );
    }
}

#[test]
fn memalign_matches_aligned_alloc() {
    let ptr = spanalloc::memalign(512, 700);
    assert!(!ptr.is_null());
    assert_eq!(ptr as usize % 512, 0);
    unsafe { spanalloc::free(ptr) };
}

#[test]
fn huge_allocation_round_trip() {
    let size = 64 * 1024 * 1024;
    let ptr = spanalloc::alloc(size);
    assert!(!ptr.is_null());
    unsafe {
        assert!(spanalloc::usable_size(ptr) >= size);
        *ptr = 1;
        *ptr.add(size - 1) = 2;
        assert_eq!(*ptr, 1);
        assert_eq!(*ptr.add(size - 1), 2);
        spanalloc::free(ptr);
    }
}

#[test]
fn huge_reallocation_stays_in_place() {
    unsafe {
        let ptr = spanalloc::alloc(10 * 1024 * 1024);
        assert!(!ptr.is_null());
        *ptr = 0x42;
        let grown = spanalloc::realloc(ptr, 20 * 1024 * 1024);
        assert_eq!(grown, ptr);
        assert_eq!(*grown, 0x42);
        spanalloc::free(grown);
    }
}

#[test]
fn huge_calloc_is_zeroed() {
    let size = 16 * 1024 * 1024;
    let ptr = spanalloc::calloc(size, 1);
    assert!(!ptr.is_null());
    unsafe {
        for offset in (0..size).step_by(1024 * 1024) {
            assert_eq!(*ptr.add(offset), 0);
        }
        spanalloc::free(ptr);
    }
}

#[test]
fn aligned_block_frees_cleanly() {
    // A 4096-aligned block of 100 bytes lands in a shifted position inside
    // its block; freeing must recover the block origin
    let ptr = spanalloc::aligned_alloc(4096, 100);
    assert!(!ptr.is_null());
    assert_eq!(ptr as usize & 0xFFF, 0);
    unsafe {
        std::ptr::write_bytes(ptr, 0x11, 100);
        spanalloc::free(ptr);
    }
    // The class keeps serving correctly after the realigned free
    let next = spanalloc::aligned_alloc(4096, 100);
    assert!(!next.is_null());
    assert_eq!(next as usize & 0xFFF, 0);
    unsafe { spanalloc::free(next) };
}
