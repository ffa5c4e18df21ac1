use crate::types::*;

use core::ptr;

// ------------------------------------------------------
// Span interface
// ------------------------------------------------------

// Spans are mapped aligned to their own size, so the containing span of any
// interior address is a single mask away. A span serves exactly one page
// type; pages are carved off a rising watermark and never returned to the
// span.

// Span that contains the block, recovered through the span alignment
#[inline]
pub unsafe fn block_get_span(block: *mut u8) -> *mut Span {
    ((block as usize) & SPAN_MASK) as *mut Span
}

// Page of the span holding the given block, by shift-dividing the offset
// inside the span
#[inline]
pub unsafe fn span_get_page_from_block(span: *mut Span, block: *mut u8) -> *mut Page {
    let offset = block as usize - span as usize;
    let page_index = offset >> (*span).page_size_shift;
    (span as *mut u8).add(page_index << (*span).page_size_shift) as *mut Page
}

// Initialize the next page of the span. The caller guarantees the span is
// not yet fully carved up.
pub unsafe fn span_allocate_page(span: *mut Span) -> *mut Page {
    debug_assert!(
        (*span).page_initialized < (*span).page_count,
        "page initialization internal failure"
    );
    let heap = (*span).page.heap;
    let page = (span as *mut u8).add((*span).page_size as usize * (*span).page_initialized as usize)
        as *mut Page;
    (*span).page_initialized += 1;

    (*page).page_type = (*span).page_type;
    (*page).flags |= PAGE_FLAG_ZERO;
    (*page).owner_thread = (*heap).owner_thread;
    (*page).heap = heap;

    if (*span).page_initialized == (*span).page_count {
        // Span fully utilized
        let page_type = (*span).page_type as usize;
        debug_assert!(
            span == (*heap).span_partial[page_type],
            "span partial tracking out of sync"
        );
        (*heap).span_partial[page_type] = ptr::null_mut();

        (*span).next = (*heap).span_used[page_type];
        if !(*span).next.is_null() {
            (*(*span).next).prev = span;
        }
        (*heap).span_used[page_type] = span;
    }

    page
}
