//! The map failure callback: installed next to the built-in OS interface,
//! consulted when a mapping is refused. Own process so the interface can be
//! installed before any other allocator traffic.
#![cfg(unix)]

use std::sync::atomic::{AtomicUsize, Ordering};

static CALLBACK_CALLS: AtomicUsize = AtomicUsize::new(0);

fn refuse_retry(_size: usize) -> bool {
    CALLBACK_CALLS.fetch_add(1, Ordering::Relaxed);
    false
}

#[test]
fn failed_map_reports_out_of_memory() {
    let interface = spanalloc::MemoryInterface {
        map_fail_callback: Some(refuse_retry as spanalloc::MapFailFn),
        ..Default::default()
    };
    assert_eq!(spanalloc::initialize(Some(&interface)), 0);

    // A request no address space can satisfy, so the mapping is refused
    // regardless of the kernel's overcommit policy
    #[cfg(target_pointer_width = "64")]
    {
        let ptr = spanalloc::alloc(usize::max_value() / 4);
        assert!(ptr.is_null());
        assert!(CALLBACK_CALLS.load(Ordering::Relaxed) >= 1);
        assert_eq!(
            std::io::Error::last_os_error().raw_os_error(),
            Some(libc::ENOMEM)
        );
    }

    // Ordinary traffic still works after the failure
    let ptr = spanalloc::alloc(128);
    assert!(!ptr.is_null());
    unsafe { spanalloc::free(ptr) };
}
