use crate::heap;
use crate::internal::{get_thread_id, wait_spin, GlobalCell};
use crate::os;
use crate::types::*;

use core::cell::Cell;
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

// ------------------------------------------------------
// Process global state
// ------------------------------------------------------

// Memory interface with every operation resolved, either to the caller
// supplied functions or to the OS defaults. Written once during
// `initialize_config`, read-only afterwards.
#[derive(Clone, Copy)]
pub(crate) struct ResolvedInterface {
    pub map: MapFn,
    pub commit: CommitFn,
    pub decommit: CommitFn,
    pub unmap: UnmapFn,
    pub map_fail: Option<MapFailFn>,
}

const OS_INTERFACE: ResolvedInterface = ResolvedInterface {
    map: os::os_mmap,
    commit: os::os_mcommit,
    decommit: os::os_mdecommit,
    unmap: os::os_munmap,
    map_fail: None,
};

static GLOBAL_MEMORY_INTERFACE: GlobalCell<ResolvedInterface> = GlobalCell::new(OS_INTERFACE);

const UNINITIALIZED: usize = 0;
const INITIALIZING: usize = 1;
const INITIALIZED: usize = 2;
static GLOBAL_INIT_STATE: AtomicUsize = AtomicUsize::new(UNINITIALIZED);

// Fallback heap bound to threads that have not allocated yet. Its lists are
// always empty, so any allocation through it falls into the span path which
// binds a real heap.
static GLOBAL_HEAP_FALLBACK: GlobalCell<Heap> = GlobalCell::new(Heap::new());

#[inline]
pub(crate) fn heap_default() -> *mut Heap {
    GLOBAL_HEAP_FALLBACK.get()
}

#[inline]
pub(crate) fn memory_interface() -> &'static ResolvedInterface {
    unsafe { &*GLOBAL_MEMORY_INTERFACE.get() }
}

#[inline]
pub(crate) fn map_fail_callback() -> Option<MapFailFn> {
    memory_interface().map_fail
}

// ------------------------------------------------------
// Thread local heap
// ------------------------------------------------------

std::thread_local! {
    static THREAD_HEAP: Cell<*mut Heap> = const { Cell::new(ptr::null_mut()) };
}

// Heap bound to the current thread, or the fallback heap when unbound
#[inline]
pub(crate) fn get_thread_heap() -> *mut Heap {
    let heap = THREAD_HEAP
        .try_with(|slot| slot.get())
        .unwrap_or(ptr::null_mut());
    if heap.is_null() {
        heap_default()
    } else {
        heap
    }
}

pub(crate) fn set_thread_heap(heap: *mut Heap) {
    let _ = THREAD_HEAP.try_with(|slot| slot.set(heap));
    if !heap.is_null() {
        unsafe {
            (*heap).owner_thread = get_thread_id();
        }
    }
}

pub(crate) fn get_thread_heap_allocate() -> *mut Heap {
    let heap = unsafe { heap::heap_allocate() };
    if !heap.is_null() {
        set_thread_heap(heap);
    }
    heap
}

/// True once the calling thread has a heap bound, which happens on its
/// first allocation.
pub fn is_thread_initialized() -> bool {
    !THREAD_HEAP
        .try_with(|slot| slot.get())
        .unwrap_or(ptr::null_mut())
        .is_null()
}

// ------------------------------------------------------
// Initialization and finalization
// ------------------------------------------------------

fn resolve_interface(interface: Option<&MemoryInterface>) -> ResolvedInterface {
    let interface = match interface {
        Some(interface) => *interface,
        None => return OS_INTERFACE,
    };
    // Without both map and unmap the built-in implementation backs all four
    // operations; the failure callback is honored either way
    if interface.memory_map.is_none() || interface.memory_unmap.is_none() {
        return ResolvedInterface {
            map_fail: interface.map_fail_callback,
            ..OS_INTERFACE
        };
    }
    ResolvedInterface {
        map: interface.memory_map.unwrap(),
        commit: interface.memory_commit.unwrap_or(os::os_mcommit as CommitFn),
        decommit: interface
            .memory_decommit
            .unwrap_or(os::os_mdecommit as CommitFn),
        unmap: interface.memory_unmap.unwrap(),
        map_fail: interface.map_fail_callback,
    }
}

/// Initialize the allocator with an optional memory interface and the
/// default configuration. Returns 0 on success. Idempotent; entry points
/// invoke it lazily on the first allocation of the process.
pub fn initialize(memory_interface: Option<&MemoryInterface>) -> i32 {
    initialize_config(memory_interface, Config::default())
}

/// Initialize the allocator with an optional memory interface and an
/// explicit configuration. Returns 0 on success.
pub fn initialize_config(memory_interface: Option<&MemoryInterface>, config: Config) -> i32 {
    if GLOBAL_INIT_STATE
        .compare_exchange(
            UNINITIALIZED,
            INITIALIZING,
            Ordering::Acquire,
            Ordering::Acquire,
        )
        .is_err()
    {
        // Someone else initializes or already has; wait until the interface
        // is usable
        while GLOBAL_INIT_STATE.load(Ordering::Acquire) != INITIALIZED {
            wait_spin();
        }
        return 0;
    }

    unsafe {
        ptr::write(
            GLOBAL_MEMORY_INTERFACE.get(),
            resolve_interface(memory_interface),
        );
    }
    os::os_init(&config);
    GLOBAL_INIT_STATE.store(INITIALIZED, Ordering::Release);

    thread_initialize();
    0
}

/// Tear down the process state. Mapped memory is retained; a later
/// `initialize` starts over with a fresh interface.
pub fn finalize() {
    thread_finalize(true);
    GLOBAL_INIT_STATE.store(UNINITIALIZED, Ordering::Release);
}

/// Bind-on-first-use makes explicit per-thread setup unnecessary; the hook
/// exists for symmetry with `thread_finalize`.
pub fn thread_initialize() {}

/// Release the calling thread's heap back to the global queue. Intended to
/// run from a thread-exit hook; the heap is rebound to whichever thread
/// adopts it next.
pub fn thread_finalize(release_caches: bool) {
    let _ = release_caches;
    let heap = THREAD_HEAP
        .try_with(|slot| slot.get())
        .unwrap_or(ptr::null_mut());
    if !heap.is_null() {
        let _ = THREAD_HEAP.try_with(|slot| slot.set(ptr::null_mut()));
        unsafe {
            heap::heap_release(heap);
        }
    }
}

/// Explicit collection point. All reclamation happens inline on the
/// allocation and deallocation paths, so there is nothing to do.
pub fn thread_collect() {}
