//! Heap lifecycle: heaps released on thread exit are adopted by later
//! threads together with their pages. A single test in its own process so
//! the global heap queue is predictable.

const SMALL_PAGE_MASK: usize = !(64 * 1024 - 1);

#[test]
fn released_heap_is_adopted_by_next_thread() {
    spanalloc::thread_initialize();
    spanalloc::thread_collect();

    let first_base = std::thread::spawn(|| {
        assert!(!spanalloc::is_thread_initialized());
        let p = spanalloc::alloc(48);
        assert!(!p.is_null());
        assert!(spanalloc::is_thread_initialized());
        unsafe { spanalloc::free(p) };
        let base = p as usize & SMALL_PAGE_MASK;
        spanalloc::thread_finalize(true);
        assert!(!spanalloc::is_thread_initialized());
        base
    })
    .join()
    .unwrap();

    let second_base = std::thread::spawn(|| {
        let p = spanalloc::alloc(48);
        assert!(!p.is_null());
        unsafe { spanalloc::free(p) };
        spanalloc::thread_finalize(true);
        p as usize & SMALL_PAGE_MASK
    })
    .join()
    .unwrap();

    // The second thread adopted the first thread's heap and allocated from
    // the very same page
    assert_eq!(first_base, second_base);

    // Collection hooks stay harmless with live state around
    let p = spanalloc::alloc(100);
    assert!(!p.is_null());
    spanalloc::thread_collect();
    unsafe { spanalloc::free(p) };
    assert_eq!(spanalloc::initialize(None), 0);
}
