use crate::init;
use crate::internal::{get_thread_id, wait_spin};
use crate::os;
use crate::types::*;

use core::ptr;
use core::sync::atomic::Ordering;

// ------------------------------------------------------
// Page interface
// ------------------------------------------------------

// Span that contains the page, recovered through the span alignment
#[inline]
pub unsafe fn page_get_span(page: *mut Page) -> *mut Span {
    ((page as usize) & SPAN_MASK) as *mut Span
}

#[inline]
pub unsafe fn page_get_size(page: *mut Page) -> usize {
    match (*page).page_type {
        PageType::Small => SMALL_PAGE_SIZE,
        PageType::Medium => MEDIUM_PAGE_SIZE,
        PageType::Large => LARGE_PAGE_SIZE,
        PageType::Huge => (*page_get_span(page)).page_size as usize,
    }
}

#[inline]
pub unsafe fn page_block_start(page: *mut Page) -> *mut Block {
    (page as *mut u8).add(PAGE_HEADER_SIZE) as *mut Block
}

#[inline]
pub unsafe fn page_block(page: *mut Page, block_index: u32) -> *mut Block {
    (page as *mut u8)
        .add(PAGE_HEADER_SIZE + (*page).block_size as usize * block_index as usize)
        as *mut Block
}

#[inline]
pub unsafe fn page_block_index(page: *mut Page, block: *mut Block) -> u32 {
    let block_first = page_block_start(page);
    ((block as usize - block_first as usize) / (*page).block_size as usize) as u32
}

// The thread free word packs the head block index in the low 32 bits and
// the list count in the high 32 bits; zero means the list is empty
#[inline]
pub fn thread_free_pack(block_index: u32, list_count: u32) -> u64 {
    ((list_count as u64) << 32) | block_index as u64
}

#[inline]
pub fn thread_free_unpack(token: u64) -> (u32, u32) {
    (
        (token & 0xFFFF_FFFF) as u32,
        ((token >> 32) & 0xFFFF_FFFF) as u32,
    )
}

// Head block and length of the list a thread free word describes
#[inline]
pub unsafe fn page_thread_free_list(page: *mut Page, token: u64) -> (*mut Block, u32) {
    let (block_index, list_count) = thread_free_unpack(token);
    let block = if list_count != 0 {
        page_block(page, block_index)
    } else {
        ptr::null_mut()
    };
    (block, list_count)
}

// Realign a possibly forward-shifted user pointer to its block origin
#[inline]
pub unsafe fn page_block_realign(page: *mut Page, block: *mut Block) -> *mut Block {
    let blocks_start = page_block_start(page);
    let block_offset = block as usize - blocks_start as usize;
    ((block as usize) - block_offset % (*page).block_size as usize) as *mut Block
}

#[inline]
pub unsafe fn page_get_local_free_block(page: *mut Page) -> *mut Block {
    let block = (*page).local_free;
    if !block.is_null() {
        (*page).local_free = (*block).next;
        (*page).local_free_count -= 1;
        (*page).block_used += 1;
    }
    block
}

// Decommit everything but the first OS page, which holds the header
#[inline]
pub unsafe fn page_decommit_memory_pages(page: *mut Page) {
    let os_page_size = os::os_page_size();
    let page_size = page_get_size(page);
    if page_size <= os_page_size {
        return;
    }
    let extra_page = (page as *mut u8).add(os_page_size);
    (init::memory_interface().decommit)(extra_page, page_size - os_page_size);
    (*page).flags |= PAGE_FLAG_DECOMMITTED;
}

#[inline]
pub unsafe fn page_commit_memory_pages(page: *mut Page) {
    let os_page_size = os::os_page_size();
    let page_size = page_get_size(page);
    if page_size > os_page_size {
        let extra_page = (page as *mut u8).add(os_page_size);
        (init::memory_interface().commit)(extra_page, page_size - os_page_size);
    }
    (*page).flags &= !PAGE_FLAG_DECOMMITTED;
}

// Unlink a fully returned page from the available list and park it on the
// heap free list for its page type, keeping the previous head committed as
// the single warm page
pub unsafe fn page_available_to_free(page: *mut Page) {
    debug_assert!(
        ((*page).flags & PAGE_FLAG_FULL) == 0,
        "page full flag internal failure"
    );
    let heap = (*page).heap;
    let size_class = (*page).size_class as usize;
    if (*heap).page_available[size_class] == page {
        (*heap).page_available[size_class] = (*page).next;
    } else {
        (*(*page).prev).next = (*page).next;
        if !(*page).next.is_null() {
            (*(*page).next).prev = (*page).prev;
        }
    }
    (*page).flags |= PAGE_FLAG_FREE;
    let page_type = (*page).page_type as usize;
    (*page).next = (*heap).page_free[page_type];
    (*heap).page_free[page_type] = page;
    // Keep one page committed
    if !(*page).next.is_null() {
        page_decommit_memory_pages((*page).next);
    }
}

// A block came back to a full page, put the page back in rotation
pub unsafe fn page_full_to_available(page: *mut Page) {
    let heap = (*page).heap;
    let size_class = (*page).size_class as usize;
    (*page).next = (*heap).page_available[size_class];
    (*page).prev = ptr::null_mut();
    if !(*page).next.is_null() {
        (*(*page).next).prev = page;
    }
    (*heap).page_available[size_class] = page;
    (*page).flags &= !PAGE_FLAG_FULL;
}

#[inline]
pub unsafe fn page_put_local_free_block(page: *mut Page, block: *mut Block) {
    (*block).next = (*page).local_free;
    (*page).local_free = block;
    (*page).local_free_count += 1;
    debug_assert!((*page).block_used > 0, "page block use counter underflow");
    (*page).block_used -= 1;

    if (*page).block_used == 0 {
        page_available_to_free(page);
    } else if ((*page).flags & PAGE_FLAG_FULL) != 0 {
        page_full_to_available(page);
    }
}

// Take over the entire thread free list in one swap. Other threads only
// ever replace the word with another valid list head, never with zero.
#[inline]
pub unsafe fn page_adopt_thread_free_block_list(page: *mut Page) {
    let mut thread_free = (*page).thread_free.load(Ordering::Relaxed);
    if thread_free != 0 {
        while let Err(actual) = (*page).thread_free.compare_exchange_weak(
            thread_free,
            0,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            thread_free = actual;
            wait_spin();
        }
        let (local_free, local_free_count) = page_thread_free_list(page, thread_free);
        (*page).local_free = local_free;
        (*page).local_free_count = local_free_count;
        debug_assert!(
            local_free_count <= (*page).block_used,
            "page thread free list count internal failure"
        );
        (*page).block_used -= local_free_count;
    }
}

#[inline]
pub unsafe fn page_get_thread_free_block(page: *mut Page) -> *mut Block {
    page_adopt_thread_free_block_list(page);
    let block = (*page).local_free;
    if !block.is_null() {
        (*page).local_free = (*block).next;
        (*page).local_free_count -= 1;
        (*page).block_used += 1;
    }
    block
}

// Deferred free from a non-owning thread. Lock free: the block is linked
// into the chain running through the page's own blocks and published with a
// single compare and swap of the packed word.
pub unsafe fn page_put_thread_free_block(page: *mut Page, block: *mut Block) {
    let mut prev_thread_free = (*page).thread_free.load(Ordering::Relaxed);
    let block_index = page_block_index(page, block);
    debug_assert!(
        page_block(page, block_index) == block,
        "block pointer is not aligned to start of block"
    );
    let (head, prev_count) = page_thread_free_list(page, prev_thread_free);
    (*block).next = head;
    let mut list_size = prev_count + 1;
    let mut thread_free = thread_free_pack(block_index, list_size);
    while let Err(actual) = (*page).thread_free.compare_exchange_weak(
        prev_thread_free,
        thread_free,
        Ordering::Relaxed,
        Ordering::Relaxed,
    ) {
        prev_thread_free = actual;
        let (head, prev_count) = page_thread_free_list(page, prev_thread_free);
        (*block).next = head;
        list_size = prev_count + 1;
        thread_free = thread_free_pack(block_index, list_size);
        wait_spin();
    }
    if list_size == 1 && ((*page).flags & PAGE_FLAG_FULL) != 0 {
        // First remote free into a full page. The owning heap stays the
        // sole writer of its available lists, so the page only becomes
        // reachable again once this list has swallowed every block.
    } else if list_size >= (*page).block_count {
        // Page completely freed by other threads. Safe to clean up from
        // here since a full page is never touched by the owning heap until
        // it is re-entered through the available list.
        debug_assert!(
            ((*page).flags & PAGE_FLAG_FULL) != 0,
            "mismatch between page full flag and thread free list"
        );
        page_decommit_memory_pages(page);
        let heap = (*page).heap;
        let page_type = (*page).page_type as usize;
        let mut prev_head = (*heap).page_free_thread[page_type].load(Ordering::Relaxed);
        (*page).next = prev_head as *mut Page;
        while let Err(actual) = (*heap).page_free_thread[page_type].compare_exchange_weak(
            prev_head,
            page as usize,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            prev_head = actual;
            (*page).next = prev_head as *mut Page;
            wait_spin();
        }
    }
}

// Hand the page local free list to the heap as the fast track list for the
// size class; the blocks count as used from the page's point of view
#[inline]
pub unsafe fn page_push_local_free_to_heap(page: *mut Page) {
    if !(*page).local_free.is_null() {
        let heap = (*page).heap;
        let size_class = (*page).size_class as usize;
        debug_assert!(
            (*heap).local_free[size_class].is_null(),
            "local free list internal failure"
        );
        (*heap).local_free[size_class] = (*page).local_free;
        (*page).block_used += (*page).local_free_count;
        (*page).local_free = ptr::null_mut();
        (*page).local_free_count = 0;
    }
}

// Bump the initialization watermark and hand out a fresh block. For small
// blocks the rest of the same OS page is linked into the local free list in
// one pass, which amortizes initialization and keeps the working set tight.
pub unsafe fn page_initialize_blocks(page: *mut Page) -> *mut Block {
    debug_assert!(
        (*page).block_initialized < (*page).block_count,
        "block initialization internal failure"
    );
    let block = page_block(page, (*page).block_initialized);
    (*page).block_initialized += 1;
    (*page).block_used += 1;

    let block_size = (*page).block_size as usize;
    let os_page_size = os::os_page_size();
    if (*page).page_type == PageType::Small && block_size < (os_page_size >> 1) {
        // Link up until the next OS page boundary
        let memory_page_start = (block as usize) & !(os_page_size - 1);
        let memory_page_next = memory_page_start + os_page_size;
        let mut free_block = (block as *mut u8).add(block_size) as *mut Block;
        let first_block = free_block;
        let mut last_block = free_block;
        let mut list_count: u32 = 0;
        let max_list_count = (*page).block_count - (*page).block_initialized;
        while (free_block as usize) < memory_page_next && list_count < max_list_count {
            last_block = free_block;
            let next_block = (free_block as *mut u8).add(block_size) as *mut Block;
            (*free_block).next = next_block;
            free_block = next_block;
            list_count += 1;
        }
        if list_count > 0 {
            (*last_block).next = ptr::null_mut();
            (*page).local_free = first_block;
            (*page).block_initialized += list_count;
            (*page).local_free_count = list_count;
        }
    }

    block
}

// Allocate a block from the page, trying the local free list, then the
// thread free list, then fresh blocks
pub unsafe fn page_allocate_block(page: *mut Page, zero: bool) -> *mut u8 {
    let mut is_zero = false;
    let mut block = page_get_local_free_block(page);
    if block.is_null() {
        block = page_get_thread_free_block(page);
        if block.is_null() {
            block = page_initialize_blocks(page);
            is_zero = ((*page).flags & PAGE_FLAG_ZERO) != 0;
        }
    }

    debug_assert!(
        (*page).block_used <= (*page).block_count,
        "page block use counter out of sync"
    );
    page_push_local_free_to_heap(page);

    if (*page).block_used == (*page).block_count {
        page_adopt_thread_free_block_list(page);
    }

    if (*page).block_used == (*page).block_count {
        // Page is fully utilized
        if ((*page).flags & PAGE_FLAG_FULL) == 0 {
            let heap = (*page).heap;
            let size_class = (*page).size_class as usize;
            if (*heap).page_available[size_class] == page {
                (*heap).page_available[size_class] = (*page).next;
            } else {
                (*(*page).prev).next = (*page).next;
                if !(*page).next.is_null() {
                    (*(*page).next).prev = (*page).prev;
                }
            }
        }
        (*page).flags |= PAGE_FLAG_FULL;
        (*page).flags &= !PAGE_FLAG_ZERO;
    }

    if zero && !is_zero && !block.is_null() {
        ptr::write_bytes(block as *mut u8, 0, (*page).block_size as usize);
    }

    block as *mut u8
}

// Return a block to the page it came from. Local when the calling thread
// owns the page or the page is unowned, deferred otherwise. Never called
// for huge pages, the caller detects those.
pub unsafe fn page_deallocate_block(page: *mut Page, block: *mut Block) {
    let calling_thread = get_thread_id();
    let is_local = (*page).owner_thread == 0 || (*page).owner_thread == calling_thread;

    let block = if ((*page).flags & PAGE_FLAG_ALIGNED_BLOCK) != 0 {
        page_block_realign(page, block)
    } else {
        block
    };

    if is_local {
        page_put_local_free_block(page, block);
    } else {
        page_put_thread_free_block(page, block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_free_word_round_trips() {
        let token = thread_free_pack(173, 42);
        assert_eq!(thread_free_unpack(token), (173, 42));
        let token = thread_free_pack(0, 1);
        assert_eq!(thread_free_unpack(token), (0, 1));
        assert_ne!(token, 0);
    }

    #[test]
    fn empty_thread_free_word_is_zero_sentinel() {
        assert_eq!(thread_free_pack(0, 0), 0);
        assert_eq!(thread_free_unpack(0), (0, 0));
    }

    #[test]
    fn word_halves_do_not_bleed_into_each_other() {
        let token = thread_free_pack(u32::max_value(), u32::max_value());
        assert_eq!(
            thread_free_unpack(token),
            (u32::max_value(), u32::max_value())
        );
    }
}
