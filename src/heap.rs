use crate::init;
use crate::internal::*;
use crate::page::*;
use crate::span::*;
use crate::types::*;

use core::ptr;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use errno::{set_errno, Errno};

// ------------------------------------------------------
// Global heap bookkeeping
// ------------------------------------------------------

// Queue of heaps released by exited threads, guarded by the heap lock
static GLOBAL_HEAP_QUEUE: GlobalCell<*mut Heap> = GlobalCell::new(ptr::null_mut());
// Spin lock for the heap queue, holds the owning thread id
static GLOBAL_HEAP_LOCK: AtomicUsize = AtomicUsize::new(0);
// Heap ID counter
static GLOBAL_HEAP_ID: AtomicU32 = AtomicU32::new(1);

#[inline]
fn heap_lock_acquire() {
    let this_lock = get_thread_id();
    while GLOBAL_HEAP_LOCK
        .compare_exchange(0, this_lock, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        wait_spin();
    }
}

#[inline]
fn heap_lock_release() {
    debug_assert!(
        GLOBAL_HEAP_LOCK.load(Ordering::Relaxed) == get_thread_id(),
        "heap lock released by non-owning thread"
    );
    GLOBAL_HEAP_LOCK.store(0, Ordering::Release);
}

unsafe fn heap_initialize(block: *mut u8) -> *mut Heap {
    let heap = block as *mut Heap;
    ptr::write_bytes(block, 0, core::mem::size_of::<Heap>());
    (*heap).id = 1 + GLOBAL_HEAP_ID.fetch_add(1, Ordering::Relaxed);
    heap
}

unsafe fn heap_allocate_new() -> *mut Heap {
    let heap_size = get_page_aligned_size(core::mem::size_of::<Heap>());
    let mut offset = 0;
    let mut mapped_size = 0;
    let block = (init::memory_interface().map)(heap_size, 0, &mut offset, &mut mapped_size);
    if block.is_null() {
        return ptr::null_mut();
    }
    let heap = heap_initialize(block);
    (*heap).offset = offset as u32;
    (*heap).mapped_size = mapped_size;
    heap
}

// Adopt a released heap from the global queue, or make a new one
pub unsafe fn heap_allocate() -> *mut Heap {
    heap_lock_acquire();
    let mut heap = *GLOBAL_HEAP_QUEUE.get();
    if !heap.is_null() {
        *GLOBAL_HEAP_QUEUE.get() = (*heap).next;
    }
    heap_lock_release();
    if heap.is_null() {
        heap = heap_allocate_new();
    }
    if !heap.is_null() {
        (*heap).next = ptr::null_mut();
        (*heap).owner_thread = get_thread_id();
    }
    heap
}

// Park a heap in the global queue when its thread exits
pub unsafe fn heap_release(heap: *mut Heap) {
    heap_lock_acquire();
    (*heap).next = *GLOBAL_HEAP_QUEUE.get();
    *GLOBAL_HEAP_QUEUE.get() = heap;
    heap_lock_release();
}

// ------------------------------------------------------
// Block interface
// ------------------------------------------------------

pub unsafe fn block_deallocate(block: *mut u8) {
    let span = block_get_span(block);
    if (*span).page_type <= PageType::Large {
        let page = span_get_page_from_block(span, block);
        page_deallocate_block(page, block as *mut Block);
    } else {
        (init::memory_interface().unmap)(
            span as *mut u8,
            (*span).offset as usize,
            (*span).mapped_size as usize,
        );
    }
}

pub unsafe fn block_usable_size(block: *mut u8) -> usize {
    let span = block_get_span(block);
    if (*span).page_type <= PageType::Large {
        let page = span_get_page_from_block(span, block);
        let blocks_start = page_block_start(page) as usize;
        (*page).block_size as usize - (block as usize - blocks_start) % (*page).block_size as usize
    } else {
        (*span).mapped_size as usize - (block as usize - span as usize)
    }
}

// ------------------------------------------------------
// Heap interface
// ------------------------------------------------------

// Reinitialize a free page for the given size class and make it the head of
// the available list
unsafe fn heap_make_free_page_available(heap: *mut Heap, size_class: u32, page: *mut Page) {
    (*page).size_class = size_class;
    (*page).block_size = SIZE_CLASSES[size_class as usize].block_size;
    (*page).block_count = SIZE_CLASSES[size_class as usize].block_count;
    (*page).block_used = 0;
    // A page that has served blocks before carries their old contents; only
    // the recommit path below restores the zero guarantee
    if (*page).block_initialized != 0 {
        (*page).flags &= !PAGE_FLAG_ZERO;
    }
    (*page).block_initialized = 0;
    (*page).local_free = ptr::null_mut();
    (*page).local_free_count = 0;
    (*page).flags &= !(PAGE_FLAG_FULL | PAGE_FLAG_FREE | PAGE_FLAG_ALIGNED_BLOCK);
    (*page).owner_thread = (*heap).owner_thread;
    let head = (*heap).page_available[size_class as usize];
    (*page).next = head;
    (*page).prev = ptr::null_mut();
    (*page).thread_free.store(0, Ordering::Relaxed);
    if !head.is_null() {
        (*head).prev = page;
    }
    (*heap).page_available[size_class as usize] = page;
    if ((*page).flags & PAGE_FLAG_DECOMMITTED) != 0 {
        page_commit_memory_pages(page);

        // A recommitted page reads as zero from the second OS page onward;
        // scrub the remainder of the first one so calloc can rely on it
        let first_page = (page as *mut u8).add(PAGE_HEADER_SIZE);
        ptr::write_bytes(first_page, 0, crate::os::os_page_size() - PAGE_HEADER_SIZE);
        (*page).flags |= PAGE_FLAG_ZERO;
    }
}

// Find or map a span for the given page type
unsafe fn heap_get_span(mut heap: *mut Heap, page_type: PageType) -> *mut Span {
    // Fast path, partially carved span of the right type
    let partial = (*heap).span_partial[page_type as usize];
    if !partial.is_null() {
        return partial;
    }

    if heap == init::heap_default() {
        // Thread has not yet initialized
        init::initialize(None);
        heap = init::get_thread_heap_allocate();
        if heap.is_null() {
            return ptr::null_mut();
        }
        // An adopted heap may come with a partial span already
        let partial = (*heap).span_partial[page_type as usize];
        if !partial.is_null() {
            return partial;
        }
    }

    // Fallback path, map more memory
    let mut offset = 0;
    let mut mapped_size = 0;
    let span =
        (init::memory_interface().map)(SPAN_SIZE, SPAN_SIZE, &mut offset, &mut mapped_size)
            as *mut Span;
    if !span.is_null() {
        (*span).page_type = page_type;
        (*span).page.heap = heap;
        (*span).page.owner_thread = (*heap).owner_thread;
        match page_type {
            PageType::Small => {
                (*span).page_count = (SPAN_SIZE / SMALL_PAGE_SIZE) as u32;
                (*span).page_size = SMALL_PAGE_SIZE as u32;
                (*span).page_size_shift = SMALL_PAGE_SIZE_SHIFT as u32;
            }
            PageType::Medium => {
                (*span).page_count = (SPAN_SIZE / MEDIUM_PAGE_SIZE) as u32;
                (*span).page_size = MEDIUM_PAGE_SIZE as u32;
                (*span).page_size_shift = MEDIUM_PAGE_SIZE_SHIFT as u32;
            }
            _ => {
                (*span).page_count = (SPAN_SIZE / LARGE_PAGE_SIZE) as u32;
                (*span).page_size = LARGE_PAGE_SIZE as u32;
                (*span).page_size_shift = LARGE_PAGE_SIZE_SHIFT as u32;
            }
        }
        (*span).offset = offset as u32;
        (*span).mapped_size = mapped_size as u64;

        (*heap).span_partial[page_type as usize] = span;
    }

    // Make sure a lazily bound heap has an owning thread
    if (*heap).owner_thread == 0 {
        (*heap).owner_thread = get_thread_id();
    }

    span
}

// Find or allocate a page for the given size class
unsafe fn heap_get_page(heap: *mut Heap, size_class: u32) -> *mut Page {
    // Fast path, available page for the size class
    let page = (*heap).page_available[size_class as usize];
    if !page.is_null() {
        return page;
    }

    // Check if there is a free page of the backing page type
    let page_type = get_page_type(size_class);
    let page = (*heap).page_free[page_type as usize];
    if !page.is_null() {
        (*heap).page_free[page_type as usize] = (*page).next;
        heap_make_free_page_available(heap, size_class, page);
        return page;
    }

    // Check for pages emptied by other threads
    let mut page_mt = (*heap).page_free_thread[page_type as usize].load(Ordering::Relaxed);
    if page_mt != 0 {
        while let Err(actual) = (*heap).page_free_thread[page_type as usize].compare_exchange_weak(
            page_mt,
            0,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            page_mt = actual;
            wait_spin();
        }
        let page = page_mt as *mut Page;
        if !page.is_null() {
            (*heap).page_free[page_type as usize] = (*page).next;
            heap_make_free_page_available(heap, size_class, page);
            return page;
        }
    }

    // Fallback path, find or allocate a span for the page type. If the
    // thread was lazily initialized the span's heap differs from the heap
    // in this scope, so finish through the span's heap.
    let span = heap_get_span(heap, page_type);
    if !span.is_null() {
        let page = span_allocate_page(span);
        heap_make_free_page_available((*page).heap, size_class, page);
        return page;
    }

    ptr::null_mut()
}

// Pop a block from the heap local free list
#[inline]
unsafe fn heap_pop_local_free(heap: *mut Heap, size_class: u32) -> *mut Block {
    let block = (*heap).local_free[size_class as usize];
    if !block.is_null() {
        (*heap).local_free[size_class as usize] = (*block).next;
    }
    block
}

// Generic allocation path from heap pages, spans or a new mapping
unsafe fn heap_allocate_block_small_to_large(
    heap: *mut Heap,
    size_class: u32,
    zero: bool,
) -> *mut u8 {
    let page = heap_get_page(heap, size_class);
    if !page.is_null() {
        return page_allocate_block(page, zero);
    }
    ptr::null_mut()
}

// Huge blocks bypass the class table and map a dedicated span
unsafe fn heap_allocate_block_huge(_heap: *mut Heap, size: usize) -> *mut u8 {
    let alloc_size = get_page_aligned_size(size + SPAN_HEADER_SIZE);
    let mut offset = 0;
    let mut mapped_size = 0;
    let span =
        (init::memory_interface().map)(alloc_size, SPAN_SIZE, &mut offset, &mut mapped_size)
            as *mut Span;
    if !span.is_null() {
        (*span).page_type = PageType::Huge;
        (*span).page_size = size as u32;
        (*span).page_size_shift = 0;
        (*span).offset = offset as u32;
        (*span).mapped_size = mapped_size as u64;
        (*span).page.flags |= PAGE_FLAG_FULL;
        return (span as *mut u8).add(SPAN_HEADER_SIZE);
    }
    ptr::null_mut()
}

// Find or allocate a block of the given tiny size
#[inline]
unsafe fn heap_allocate_block_tiny(heap: *mut Heap, size: usize, zero: bool) -> *mut u8 {
    let size_class = get_size_class_tiny(size);
    let block = heap_pop_local_free(heap, size_class);
    if !block.is_null() {
        // Fast track with a block available in the heap level free list
        if zero {
            ptr::write_bytes(
                block as *mut u8,
                0,
                SIZE_CLASSES[size_class as usize].block_size as usize,
            );
        }
        return block as *mut u8;
    }

    heap_allocate_block_small_to_large(heap, size_class, zero)
}

unsafe fn heap_allocate_block_generic(heap: *mut Heap, size: usize, zero: bool) -> *mut u8 {
    let size_class = get_size_class(size);
    if (size_class as usize) < SIZE_CLASS_COUNT {
        let block = heap_pop_local_free(heap, size_class);
        if !block.is_null() {
            // Fast track with a block available in the heap level free list
            if zero {
                ptr::write_bytes(
                    block as *mut u8,
                    0,
                    SIZE_CLASSES[size_class as usize].block_size as usize,
                );
            }
            return block as *mut u8;
        }

        return heap_allocate_block_small_to_large(heap, size_class, zero);
    }

    heap_allocate_block_huge(heap, size)
}

// Find or allocate a block of the given size
#[inline]
pub unsafe fn heap_allocate_block(heap: *mut Heap, size: usize, zero: bool) -> *mut u8 {
    if size <= SMALL_GRANULARITY * 16 {
        return heap_allocate_block_tiny(heap, size, zero);
    }
    heap_allocate_block_generic(heap, size, zero)
}

pub unsafe fn heap_allocate_block_aligned(
    heap: *mut Heap,
    alignment: usize,
    size: usize,
    zero: bool,
) -> *mut u8 {
    if alignment <= SMALL_GRANULARITY {
        return heap_allocate_block(heap, size, zero);
    }

    if size.checked_add(alignment).is_none() {
        set_errno(Errno(libc::EINVAL));
        return ptr::null_mut();
    }
    if alignment & (alignment - 1) != 0 {
        set_errno(Errno(libc::EINVAL));
        return ptr::null_mut();
    }
    if alignment >= MAX_ALIGNMENT {
        set_errno(Errno(libc::EINVAL));
        return ptr::null_mut();
    }

    let align_mask = alignment - 1;
    let mut block = heap_allocate_block(heap, size + alignment, zero);
    if !block.is_null() && (block as usize & align_mask) != 0 {
        block = ((block as usize & !align_mask) + alignment) as *mut u8;
        // Mark the containing page as holding aligned blocks; huge spans
        // recover the block origin from the span header instead
        let span = block_get_span(block);
        if (*span).page_type <= PageType::Large {
            let page = span_get_page_from_block(span, block);
            (*page).flags |= PAGE_FLAG_ALIGNED_BLOCK;
        }
    }
    block
}

pub unsafe fn heap_reallocate_block(
    heap: *mut Heap,
    block: *mut u8,
    size: usize,
    old_size: usize,
    flags: u32,
) -> *mut u8 {
    let mut old_size = old_size;
    if !block.is_null() {
        // Grab the span using the guaranteed span alignment
        let span = block_get_span(block);
        if (*span).page_type <= PageType::Large {
            // Normal sized block
            let page = span_get_page_from_block(span, block);
            let blocks_start = page_block_start(page) as usize;
            let block_offset = block as usize - blocks_start;
            let block_idx = block_offset / (*page).block_size as usize;
            let block_origin = blocks_start + block_idx * (*page).block_size as usize;
            if old_size == 0 {
                old_size = (*page).block_size as usize - (block as usize - block_origin);
            }
            if (*page).block_size as usize >= size {
                // Still fits in the block, never mind trying to save
                // memory, but preserve data if the alignment shifted
                if block as usize != block_origin && (flags & NO_PRESERVE) == 0 {
                    ptr::copy(block, block_origin as *mut u8, old_size);
                }
                return block_origin as *mut u8;
            }
        } else {
            // Oversized block
            let block_start = (span as *mut u8).add(SPAN_HEADER_SIZE);
            if old_size == 0 {
                old_size = (*span).page_size as usize;
            }
            if size < (*span).mapped_size as usize {
                // Still fits in the mapped region, keep it and only adjust
                // the recorded logical size
                if block_start != block && (flags & NO_PRESERVE) == 0 {
                    ptr::copy(block, block_start, old_size);
                }
                (*span).page_size = size as u32;
                return block_start;
            }
        }
    } else {
        old_size = 0;
    }

    if (flags & GROW_OR_FAIL) != 0 {
        return ptr::null_mut();
    }

    // Need a new block; damp reallocation chains by overallocating when the
    // increase is small (below 37%)
    let lower_bound = old_size + (old_size >> 2) + (old_size >> 3);
    let new_size = if size > lower_bound {
        size
    } else if size > old_size {
        lower_bound
    } else {
        size
    };
    let old_block = block;
    let block = heap_allocate_block(heap, new_size, false);
    if !block.is_null() && !old_block.is_null() {
        if (flags & NO_PRESERVE) == 0 {
            ptr::copy_nonoverlapping(
                old_block,
                block,
                if old_size < new_size { old_size } else { new_size },
            );
        }
        block_deallocate(old_block);
    }

    block
}

pub unsafe fn heap_reallocate_block_aligned(
    heap: *mut Heap,
    block: *mut u8,
    alignment: usize,
    size: usize,
    old_size: usize,
    flags: u32,
) -> *mut u8 {
    if alignment <= SMALL_GRANULARITY {
        return heap_reallocate_block(heap, block, size, old_size, flags);
    }

    let no_alloc = (flags & GROW_OR_FAIL) != 0;
    let usable_size = if !block.is_null() {
        block_usable_size(block)
    } else {
        0
    };
    if usable_size >= size && (block as usize & (alignment - 1)) == 0 {
        if no_alloc || size >= usable_size / 2 {
            return block;
        }
    }
    // The aligned allocation marks the containing page as holding aligned
    // blocks
    let old_block = block;
    let block = if !no_alloc {
        heap_allocate_block_aligned(heap, alignment, size, false)
    } else {
        ptr::null_mut()
    };
    if !block.is_null() {
        if (flags & NO_PRESERVE) == 0 && !old_block.is_null() {
            let old_size = if old_size == 0 { usable_size } else { old_size };
            ptr::copy_nonoverlapping(
                old_block,
                block,
                if old_size < size { old_size } else { size },
            );
        }
        if !old_block.is_null() {
            block_deallocate(old_block);
        }
    }
    block
}
