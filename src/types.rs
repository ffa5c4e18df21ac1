use core::mem::size_of;
use core::ptr::null_mut;
use core::sync::atomic::{AtomicU64, AtomicUsize};

// ------------------------------------------------------
// Built in size configuration
// ------------------------------------------------------

// Sizes below are fixed for both 32- and 64-bit targets; only the pointer
// fields of the headers shrink on 32-bit.

pub const PAGE_HEADER_SIZE: usize = 128;
pub const SPAN_HEADER_SIZE: usize = PAGE_HEADER_SIZE;

// Minimum block granularity, also the largest alignment served without the
// aligned allocation path
pub const SMALL_GRANULARITY: usize = 32;

pub const SMALL_PAGE_SIZE_SHIFT: usize = 16;
pub const SMALL_PAGE_SIZE: usize = 1 << SMALL_PAGE_SIZE_SHIFT; // 64KiB
pub const MEDIUM_PAGE_SIZE_SHIFT: usize = 22;
pub const MEDIUM_PAGE_SIZE: usize = 1 << MEDIUM_PAGE_SIZE_SHIFT; // 4MiB
pub const LARGE_PAGE_SIZE_SHIFT: usize = 26;
pub const LARGE_PAGE_SIZE: usize = 1 << LARGE_PAGE_SIZE_SHIFT; // 64MiB

// Spans are aligned on their own size so any interior address recovers the
// span header with a single mask
pub const SPAN_SIZE: usize = 256 * 1024 * 1024;
pub const SPAN_MASK: usize = !(SPAN_SIZE - 1);

pub const SMALL_SIZE_CLASS_COUNT: usize = 29;
pub const MEDIUM_SIZE_CLASS_COUNT: usize = 24;
pub const LARGE_SIZE_CLASS_COUNT: usize = 20;
pub const SIZE_CLASS_COUNT: usize =
    SMALL_SIZE_CLASS_COUNT + MEDIUM_SIZE_CLASS_COUNT + LARGE_SIZE_CLASS_COUNT;

pub const MAX_ALIGNMENT: usize = 256 * 1024;
pub const MAX_ALLOC_SIZE: usize = usize::max_value() / 2;

// ------------------------------------------------------
// Reallocation flags
// ------------------------------------------------------

// Skip preserving the old contents across a reallocation
pub const NO_PRESERVE: u32 = 1;
// Fail a reallocation that cannot be done in place instead of allocating
pub const GROW_OR_FAIL: u32 = 2;

// ------------------------------------------------------
// Main internal data structures
// ------------------------------------------------------

// Memory page type. A span is homogeneous in page type, assigned when the
// span is mapped.
#[repr(u32)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum PageType {
    Small = 0,  // 64KiB pages
    Medium = 1, // 4MiB pages
    Large = 2,  // 64MiB pages
    Huge = 3,   // span is a single page of the mapped size
}

pub const PAGE_TYPE_COUNT: usize = 3; // non-huge page types

// Block size class
#[derive(Clone, Copy, Debug)]
pub struct SizeClass {
    // Size of blocks in this class
    pub block_size: u32,
    // Number of blocks fitting in a page of the backing page type
    pub block_count: u32,
}

// A memory block. When free it holds the link to the next free block of the
// same page in its own bytes.
#[repr(C)]
pub struct Block {
    pub next: *mut Block,
}

// Page flags, packed in a single word so the header stays within
// PAGE_HEADER_SIZE
pub const PAGE_FLAG_FULL: u32 = 1 << 0;
pub const PAGE_FLAG_FREE: u32 = 1 << 1;
pub const PAGE_FLAG_ZERO: u32 = 1 << 2;
pub const PAGE_FLAG_DECOMMITTED: u32 = 1 << 3;
pub const PAGE_FLAG_ALIGNED_BLOCK: u32 = 1 << 4;

// A page contains blocks of a single size class. The header occupies the
// first PAGE_HEADER_SIZE bytes of the page; blocks follow.
#[repr(C)]
pub struct Page {
    // Size class of blocks
    pub size_class: u32,
    // Block size
    pub block_size: u32,
    // Block count
    pub block_count: u32,
    // Blocks initialized so far, a monotonically rising watermark
    pub block_initialized: u32,
    // Blocks currently in use (blocks parked on the owning heap's local
    // free list count as used from the page's point of view)
    pub block_used: u32,
    // Page type
    pub page_type: PageType,
    // Flag bits, PAGE_FLAG_*
    pub flags: u32,
    // Local free list count
    pub local_free_count: u32,
    // Local free list
    pub local_free: *mut Block,
    // Owning thread
    pub owner_thread: usize,
    // Owning heap
    pub heap: *mut Heap,
    // Next page in list
    pub next: *mut Page,
    // Previous page in list
    pub prev: *mut Page,
    // Multithreaded free list, block index in the low 32 bits, list count
    // in the high 32 bits
    pub thread_free: AtomicU64,
}

// A span contains pages of a single type. The span header shares the first
// PAGE_HEADER_SIZE bytes with the header of its first page.
#[repr(C)]
pub struct Span {
    // Header of the first page
    pub page: Page,
    // Pages initialized so far, a monotonically rising watermark
    pub page_initialized: u32,
    // Total pages in the span
    pub page_count: u32,
    // Bytes per page (for huge spans, the logical block size)
    pub page_size: u32,
    // Page size bit shift
    pub page_size_shift: u32,
    // Page type
    pub page_type: PageType,
    // Offset from start of mapped region, needed to unmap
    pub offset: u32,
    // Mapped size, needed to unmap
    pub mapped_size: u64,
    // Next span in list
    pub next: *mut Span,
    // Previous span in list
    pub prev: *mut Span,
}

// Control structure for a heap, conceptually per thread
#[repr(C)]
pub struct Heap {
    // Owning thread ID
    pub owner_thread: usize,
    // Heap local free list for each size class
    pub local_free: [*mut Block; SIZE_CLASS_COUNT],
    // Available non-full pages for each size class
    pub page_available: [*mut Page; SIZE_CLASS_COUNT],
    // Free pages for each page type
    pub page_free: [*mut Page; PAGE_TYPE_COUNT],
    // Intake stacks of pages emptied by other threads, for each page type
    pub page_free_thread: [AtomicUsize; PAGE_TYPE_COUNT],
    // Partially initialized span for each page type
    pub span_partial: [*mut Span; PAGE_TYPE_COUNT],
    // Fully initialized spans for each page type
    pub span_used: [*mut Span; PAGE_TYPE_COUNT],
    // Next heap in the global queue of released heaps
    pub next: *mut Heap,
    // Heap ID
    pub id: u32,
    // Offset from start of mapped region holding this heap
    pub offset: u32,
    // Mapped size of the region holding this heap
    pub mapped_size: usize,
}

impl Heap {
    pub const fn new() -> Heap {
        Heap {
            owner_thread: 0,
            local_free: [null_mut(); SIZE_CLASS_COUNT],
            page_available: [null_mut(); SIZE_CLASS_COUNT],
            page_free: [null_mut(); PAGE_TYPE_COUNT],
            page_free_thread: [AtomicUsize::new(0), AtomicUsize::new(0), AtomicUsize::new(0)],
            span_partial: [null_mut(); PAGE_TYPE_COUNT],
            span_used: [null_mut(); PAGE_TYPE_COUNT],
            next: null_mut(),
            id: 0,
            offset: 0,
            mapped_size: 0,
        }
    }
}

const _: () = assert!(size_of::<Page>() <= PAGE_HEADER_SIZE);
const _: () = assert!(size_of::<Span>() <= SPAN_HEADER_SIZE);

// ------------------------------------------------------
// Size classes
// ------------------------------------------------------

const fn class(n: u32, page_size: usize) -> SizeClass {
    SizeClass {
        block_size: n * SMALL_GRANULARITY as u32,
        block_count: ((page_size - PAGE_HEADER_SIZE) as u32) / (n * SMALL_GRANULARITY as u32),
    }
}

const fn scls(n: u32) -> SizeClass {
    class(n, SMALL_PAGE_SIZE)
}

const fn mcls(n: u32) -> SizeClass {
    class(n, MEDIUM_PAGE_SIZE)
}

const fn lcls(n: u32) -> SizeClass {
    class(n, LARGE_PAGE_SIZE)
}

// Classes 0..16 are linear in the granularity, then three subclasses per
// power of two up to 8MiB
#[rustfmt::skip]
pub static SIZE_CLASSES: [SizeClass; SIZE_CLASS_COUNT] = [
    scls(1),      scls(1),      scls(2),     scls(3),     scls(4),      scls(5),      scls(6),
    scls(7),      scls(8),      scls(9),     scls(10),    scls(11),     scls(12),     scls(13),
    scls(14),     scls(15),     scls(16),    scls(20),    scls(24),     scls(28),     scls(32),
    scls(40),     scls(48),     scls(56),    scls(64),    scls(80),     scls(96),     scls(112),
    scls(128),    mcls(160),    mcls(192),   mcls(224),   mcls(256),    mcls(320),    mcls(384),
    mcls(448),    mcls(512),    mcls(640),   mcls(768),   mcls(896),    mcls(1024),   mcls(1280),
    mcls(1536),   mcls(1792),   mcls(2048),  mcls(2560),  mcls(3072),   mcls(3584),   mcls(4096),
    mcls(5120),   mcls(6144),   mcls(7168),  mcls(8192),  lcls(10240),  lcls(12288),  lcls(14336),
    lcls(16384),  lcls(20480),  lcls(24576), lcls(28672), lcls(32768),  lcls(40960),  lcls(49152),
    lcls(57344),  lcls(65536),  lcls(81920), lcls(98304), lcls(114688), lcls(131072), lcls(163840),
    lcls(196608), lcls(229376), lcls(262144),
];

// ------------------------------------------------------
// Memory interface
// ------------------------------------------------------

// Map a region of at least `size` bytes, aligned to `alignment` when it is
// non-zero. The implementation reports the forward shift applied to reach
// the aligned address and the total mapped size; both are handed back
// verbatim to `memory_unmap`.
pub type MapFn =
    unsafe fn(size: usize, alignment: usize, offset: &mut usize, mapped_size: &mut usize) -> *mut u8;
// Make a sub-range of a mapped region resident / non-resident
pub type CommitFn = unsafe fn(address: *mut u8, size: usize);
// Release a region previously returned by the map operation
pub type UnmapFn = unsafe fn(address: *mut u8, offset: usize, mapped_size: usize);
// Invoked when a map fails; a truthy return requests a retry
pub type MapFailFn = fn(size: usize) -> bool;

/// Injectable OS memory primitives. Any operation left as `None` falls back
/// to the built-in OS implementation; supplying neither `memory_map` nor
/// `memory_unmap` selects the built-in implementation for all four.
#[derive(Clone, Copy, Default)]
pub struct MemoryInterface {
    pub memory_map: Option<MapFn>,
    pub memory_commit: Option<CommitFn>,
    pub memory_decommit: Option<CommitFn>,
    pub memory_unmap: Option<UnmapFn>,
    pub map_fail_callback: Option<MapFailFn>,
}

/// Process-wide configuration, consumed once by `initialize_config`.
#[derive(Clone, Copy)]
pub struct Config {
    /// Back mappings with huge pages where the OS grants them
    pub enable_huge_pages: bool,
    /// Name tagged onto anonymous mappings where the OS supports it
    pub page_name: &'static str,
    /// Name tagged onto huge page mappings where the OS supports it
    pub huge_page_name: &'static str,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            enable_huge_pages: false,
            page_name: "spanalloc",
            huge_page_name: "spanalloc-huge",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_sizes_are_nondecreasing() {
        for window in SIZE_CLASSES.windows(2) {
            assert!(window[0].block_size <= window[1].block_size);
        }
    }

    #[test]
    fn block_counts_match_page_capacity() {
        for (idx, sc) in SIZE_CLASSES.iter().enumerate() {
            let page_size = if idx < SMALL_SIZE_CLASS_COUNT {
                SMALL_PAGE_SIZE
            } else if idx < SMALL_SIZE_CLASS_COUNT + MEDIUM_SIZE_CLASS_COUNT {
                MEDIUM_PAGE_SIZE
            } else {
                LARGE_PAGE_SIZE
            };
            assert_eq!(
                sc.block_count,
                ((page_size - PAGE_HEADER_SIZE) / sc.block_size as usize) as u32
            );
            assert!(sc.block_count >= 1);
            assert_eq!(sc.block_size as usize % SMALL_GRANULARITY, 0);
        }
    }

    #[test]
    fn largest_class_covers_eight_mebibytes() {
        assert_eq!(SIZE_CLASSES[SIZE_CLASS_COUNT - 1].block_size, 8 * 1024 * 1024);
    }
}
