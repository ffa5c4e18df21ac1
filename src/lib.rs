//! spanalloc: a span-based thread-caching memory allocator.
//!
//! Large aligned virtual memory spans are carved into fixed-size pages, and
//! pages into uniform blocks of one of 73 size classes. Each thread owns a
//! heap with per-class free lists for low-contention fast paths; blocks
//! freed by a non-owning thread travel through a lock-free per-page list.
//!
//! The crate exposes a malloc-style entry layer over raw pointers plus a
//! [`SpanAlloc`] type implementing `GlobalAlloc`:
//!
//! ```ignore
//! #[global_allocator]
//! static GLOBAL: spanalloc::SpanAlloc = spanalloc::SpanAlloc;
//! ```

mod heap;
mod init;
mod internal;
mod os;
mod page;
mod span;
mod types;

pub use crate::init::{
    finalize, initialize, initialize_config, is_thread_initialized, thread_collect,
    thread_finalize, thread_initialize,
};
pub use crate::types::{
    CommitFn, Config, MapFailFn, MapFn, MemoryInterface, UnmapFn, GROW_OR_FAIL, NO_PRESERVE,
};

use crate::heap::*;
use crate::internal::mul_overflow;
use crate::types::{MAX_ALLOC_SIZE, SMALL_GRANULARITY};

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

use errno::{set_errno, Errno};

// ------------------------------------------------------
// Extern interface
// ------------------------------------------------------

/// Allocate a block of at least `size` bytes. Returns null with `errno` set
/// to `ENOMEM` when the OS refuses to map more memory.
pub fn alloc(size: usize) -> *mut u8 {
    if size >= MAX_ALLOC_SIZE {
        set_errno(Errno(libc::EINVAL));
        return ptr::null_mut();
    }
    unsafe { heap_allocate_block(init::get_thread_heap(), size, false) }
}

/// Free a block. Null is a no-op.
///
/// # Safety
/// `ptr` must be null or a live block returned by this allocator.
pub unsafe fn free(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    block_deallocate(ptr);
}

/// Allocate a zero-filled block for `num` elements of `size` bytes. The
/// multiplication is overflow-checked and fails with `EINVAL`.
pub fn calloc(num: usize, size: usize) -> *mut u8 {
    let mut total = 0;
    if mul_overflow(num, size, &mut total) || total >= MAX_ALLOC_SIZE {
        set_errno(Errno(libc::EINVAL));
        return ptr::null_mut();
    }
    unsafe { heap_allocate_block(init::get_thread_heap(), total, true) }
}

/// Resize a block, preserving contents up to the smaller of the old and new
/// sizes. Shrinking happens in place; growing is damped against
/// reallocation chains by overallocating small increases.
///
/// # Safety
/// `ptr` must be null or a live block returned by this allocator.
pub unsafe fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    if size >= MAX_ALLOC_SIZE {
        set_errno(Errno(libc::EINVAL));
        return ptr;
    }
    heap_reallocate_block(init::get_thread_heap(), ptr, size, 0, 0)
}

/// Allocate a block aligned to `alignment`, which must be a power of two
/// below 256KiB. Alignments up to the block granularity are free; larger
/// ones overallocate and shift.
pub fn aligned_alloc(alignment: usize, size: usize) -> *mut u8 {
    unsafe { heap_allocate_block_aligned(init::get_thread_heap(), alignment, size, false) }
}

/// Combination of [`aligned_alloc`] and [`calloc`].
pub fn aligned_calloc(alignment: usize, num: usize, size: usize) -> *mut u8 {
    let mut total = 0;
    if mul_overflow(num, size, &mut total) || total >= MAX_ALLOC_SIZE {
        set_errno(Errno(libc::EINVAL));
        return ptr::null_mut();
    }
    unsafe { heap_allocate_block_aligned(init::get_thread_heap(), alignment, total, true) }
}

/// Resize a block while maintaining `alignment`. `old_size` may be zero if
/// unknown. `flags` accepts [`NO_PRESERVE`] and [`GROW_OR_FAIL`].
///
/// # Safety
/// `ptr` must be null or a live block returned by this allocator.
pub unsafe fn aligned_realloc(
    ptr: *mut u8,
    alignment: usize,
    size: usize,
    old_size: usize,
    flags: u32,
) -> *mut u8 {
    heap_reallocate_block_aligned(init::get_thread_heap(), ptr, alignment, size, old_size, flags)
}

/// Alias of [`aligned_alloc`].
pub fn memalign(alignment: usize, size: usize) -> *mut u8 {
    aligned_alloc(alignment, size)
}

/// POSIX style aligned allocation. Returns 0 on success, `EINVAL` for a
/// null output pointer, `ENOMEM` when allocation fails.
///
/// # Safety
/// `memptr` must be null or valid for writing a pointer.
pub unsafe fn posix_memalign(memptr: *mut *mut u8, alignment: usize, size: usize) -> i32 {
    if memptr.is_null() {
        return libc::EINVAL;
    }
    *memptr = heap_allocate_block_aligned(init::get_thread_heap(), alignment, size, false);
    if (*memptr).is_null() {
        libc::ENOMEM
    } else {
        0
    }
}

/// Number of bytes usable through `ptr`, at least the requested size.
///
/// # Safety
/// `ptr` must be null or a live block returned by this allocator.
pub unsafe fn usable_size(ptr: *mut u8) -> usize {
    if ptr.is_null() {
        return 0;
    }
    block_usable_size(ptr)
}

// ------------------------------------------------------
// GlobalAlloc integration
// ------------------------------------------------------

/// Zero-sized handle for use with `#[global_allocator]`.
pub struct SpanAlloc;

unsafe impl GlobalAlloc for SpanAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = layout.size();
        let align = layout.align();
        if size == 0 {
            // Aligned dangling pointer for zero sized layouts
            return align as *mut u8;
        }
        let heap = init::get_thread_heap();
        if align <= SMALL_GRANULARITY {
            heap_allocate_block(heap, size, false)
        } else {
            heap_allocate_block_aligned(heap, align, size, false)
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if ptr.is_null() || layout.size() == 0 {
            return;
        }
        block_deallocate(ptr);
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let size = layout.size();
        let align = layout.align();
        if size == 0 {
            return align as *mut u8;
        }
        let heap = init::get_thread_heap();
        if align <= SMALL_GRANULARITY {
            heap_allocate_block(heap, size, true)
        } else {
            heap_allocate_block_aligned(heap, align, size, true)
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if ptr.is_null() || layout.size() == 0 {
            return self.alloc(Layout::from_size_align_unchecked(new_size, layout.align()));
        }
        if new_size == 0 {
            self.dealloc(ptr, layout);
            return layout.align() as *mut u8;
        }
        let heap = init::get_thread_heap();
        if layout.align() <= SMALL_GRANULARITY {
            heap_reallocate_block(heap, ptr, new_size, layout.size(), 0)
        } else {
            heap_reallocate_block_aligned(heap, ptr, layout.align(), new_size, layout.size(), 0)
        }
    }
}
