use crate::init;
use crate::internal::GlobalCell;
use crate::types::Config;

use core::ptr::null_mut;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use errno::{set_errno, Errno};
use log::warn;

#[cfg(windows)]
use winapi::{
    shared::winerror::ERROR_SUCCESS,
    um::{
        errhandlingapi::GetLastError,
        handleapi::CloseHandle,
        memoryapi::{GetLargePageMinimum, VirtualAlloc, VirtualFree},
        processthreadsapi::{GetCurrentProcess, OpenProcessToken},
        securitybaseapi::AdjustTokenPrivileges,
        sysinfoapi::{GetSystemInfo, SYSTEM_INFO},
        winbase::LookupPrivilegeValueA,
        winnt::{
            HANDLE, MEM_COMMIT, MEM_DECOMMIT, MEM_LARGE_PAGES, MEM_RELEASE, MEM_RESERVE,
            PAGE_READWRITE, SE_PRIVILEGE_ENABLED, TOKEN_ADJUST_PRIVILEGES, TOKEN_PRIVILEGES,
            TOKEN_QUERY,
        },
    },
};

// OS memory page size (overwritten in `os_init`)
static OS_PAGE_SIZE: AtomicUsize = AtomicUsize::new(4096);
// OS memory map granularity (overwritten in `os_init`)
static OS_MAP_GRANULARITY: AtomicUsize = AtomicUsize::new(4096);
// Huge page backing was requested at initialization
static OS_HUGE_PAGES: AtomicBool = AtomicBool::new(false);

// Names tagged onto anonymous mappings, NUL terminated
const PAGE_NAME_MAX: usize = 64;
static OS_PAGE_NAME: GlobalCell<[u8; PAGE_NAME_MAX]> = GlobalCell::new([0; PAGE_NAME_MAX]);
static OS_HUGE_PAGE_NAME: GlobalCell<[u8; PAGE_NAME_MAX]> = GlobalCell::new([0; PAGE_NAME_MAX]);

#[inline]
pub fn os_page_size() -> usize {
    OS_PAGE_SIZE.load(Ordering::Relaxed)
}

#[inline]
fn os_huge_pages() -> bool {
    OS_HUGE_PAGES.load(Ordering::Relaxed)
}

fn store_page_name(slot: &GlobalCell<[u8; PAGE_NAME_MAX]>, name: &str) {
    let buffer = slot.get();
    let bytes = name.as_bytes();
    let count = bytes.len().min(PAGE_NAME_MAX - 1);
    unsafe {
        (&mut *buffer)[..count].copy_from_slice(&bytes[..count]);
        (&mut *buffer)[count] = 0;
    }
}

// ------------------------------------------------------
// Initialization
// ------------------------------------------------------

// Called once from `initialize_config`, before any mapping is made.
pub(crate) fn os_init(config: &Config) {
    store_page_name(&OS_PAGE_NAME, config.page_name);
    store_page_name(&OS_HUGE_PAGE_NAME, config.huge_page_name);

    #[cfg(windows)]
    unsafe {
        let mut system_info: SYSTEM_INFO = core::mem::zeroed();
        GetSystemInfo(&mut system_info);
        if system_info.dwPageSize > 0 {
            OS_PAGE_SIZE.store(system_info.dwPageSize as usize, Ordering::Relaxed);
        }
        if system_info.dwAllocationGranularity > 0 {
            OS_MAP_GRANULARITY.store(system_info.dwAllocationGranularity as usize, Ordering::Relaxed);
        }
    }
    #[cfg(not(windows))]
    unsafe {
        let result = libc::sysconf(libc::_SC_PAGESIZE);
        if result > 0 {
            OS_PAGE_SIZE.store(result as usize, Ordering::Relaxed);
            OS_MAP_GRANULARITY.store(result as usize, Ordering::Relaxed);
        }
    }

    if config.enable_huge_pages {
        OS_HUGE_PAGES.store(true, Ordering::Relaxed);
        os_init_huge_pages();
    }
}

#[cfg(windows)]
fn os_init_huge_pages() {
    unsafe {
        // Using large pages needs the lock-memory privilege; try to enable
        // it for the current process and take the large page minimum as the
        // effective page size when it sticks
        let large_page_minimum = GetLargePageMinimum();
        if large_page_minimum == 0 {
            warn!("large pages not supported by this system");
            return;
        }
        let mut token: HANDLE = null_mut();
        let mut enabled = false;
        if OpenProcessToken(
            GetCurrentProcess(),
            TOKEN_ADJUST_PRIVILEGES | TOKEN_QUERY,
            &mut token,
        ) != 0
        {
            let mut privileges: TOKEN_PRIVILEGES = core::mem::zeroed();
            if LookupPrivilegeValueA(
                null_mut(),
                b"SeLockMemoryPrivilege\0".as_ptr() as *const i8,
                &mut privileges.Privileges[0].Luid,
            ) != 0
            {
                privileges.PrivilegeCount = 1;
                privileges.Privileges[0].Attributes = SE_PRIVILEGE_ENABLED;
                if AdjustTokenPrivileges(token, 0, &mut privileges, 0, null_mut(), null_mut()) != 0
                    && GetLastError() == ERROR_SUCCESS
                {
                    enabled = true;
                }
            }
            CloseHandle(token);
        }
        if enabled {
            if large_page_minimum > os_page_size() {
                OS_PAGE_SIZE.store(large_page_minimum, Ordering::Relaxed);
            }
            if large_page_minimum > OS_MAP_GRANULARITY.load(Ordering::Relaxed) {
                OS_MAP_GRANULARITY.store(large_page_minimum, Ordering::Relaxed);
            }
        } else {
            warn!("cannot enable large page support, error {}", GetLastError());
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn os_init_huge_pages() {
    let huge_page_size = os_huge_page_size();
    if huge_page_size != 0 {
        OS_PAGE_SIZE.store(huge_page_size, Ordering::Relaxed);
        OS_MAP_GRANULARITY.store(huge_page_size, Ordering::Relaxed);
    } else {
        warn!("huge page size not found in /proc/meminfo");
    }
}

#[cfg(not(any(windows, target_os = "linux", target_os = "android")))]
fn os_init_huge_pages() {
    // Assume the common 2MiB superpage
    OS_PAGE_SIZE.store(2 * 1024 * 1024, Ordering::Relaxed);
    OS_MAP_GRANULARITY.store(2 * 1024 * 1024, Ordering::Relaxed);
}

// Read the configured huge page size from /proc/meminfo without allocating
#[cfg(any(target_os = "linux", target_os = "android"))]
fn os_huge_page_size() -> usize {
    unsafe {
        let fd = libc::open(b"/proc/meminfo\0".as_ptr() as *const libc::c_char, libc::O_RDONLY);
        if fd < 0 {
            return 0;
        }
        let mut buffer = [0u8; 4096];
        let bytes_read = libc::read(fd, buffer.as_mut_ptr() as *mut libc::c_void, buffer.len());
        libc::close(fd);
        if bytes_read <= 0 {
            return 0;
        }
        parse_huge_page_size(&buffer[..bytes_read as usize])
    }
}

// Find the "Hugepagesize:" entry and convert it from kilobytes
#[cfg(any(target_os = "linux", target_os = "android", test))]
fn parse_huge_page_size(meminfo: &[u8]) -> usize {
    const KEY: &[u8] = b"Hugepagesize:";
    let position = meminfo
        .windows(KEY.len())
        .position(|window| window == KEY);
    let position = match position {
        Some(position) => position + KEY.len(),
        None => return 0,
    };
    let mut value = 0usize;
    let mut seen_digit = false;
    for &byte in &meminfo[position..] {
        match byte {
            b' ' | b'\t' if !seen_digit => continue,
            b'0'..=b'9' => {
                seen_digit = true;
                value = value * 10 + (byte - b'0') as usize;
            }
            _ => break,
        }
    }
    value * 1024
}

// ------------------------------------------------------
// Default memory interface
// ------------------------------------------------------

// Tag the mapped region so it is identifiable in memory maps
#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn os_set_page_name(address: *mut u8, size: usize) {
    let name = if os_huge_pages() {
        OS_HUGE_PAGE_NAME.get()
    } else {
        OS_PAGE_NAME.get()
    };
    // A kernel without CONFIG_ANON_VMA_NAME makes this a no-op
    let _ = libc::prctl(
        libc::PR_SET_VMA,
        libc::PR_SET_VMA_ANON_NAME as libc::c_ulong,
        address as libc::c_ulong,
        size as libc::c_ulong,
        name as libc::c_ulong,
    );
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
unsafe fn os_set_page_name(_address: *mut u8, _size: usize) {}

#[cfg(not(windows))]
unsafe fn os_mmap_raw(map_size: usize, advise_size: usize) -> *mut u8 {
    let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
    let prot = libc::PROT_READ | libc::PROT_WRITE;
    let mut ptr: *mut libc::c_void = libc::MAP_FAILED;

    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        if os_huge_pages() {
            ptr = libc::mmap(null_mut(), map_size, prot, flags | libc::MAP_HUGETLB, -1, 0);
            if ptr == libc::MAP_FAILED {
                // Huge page allocation can fail even when configured; fall
                // back to normal pages and promote the region to
                // transparent huge pages
                ptr = libc::mmap(null_mut(), map_size, prot, flags, -1, 0);
                if ptr != libc::MAP_FAILED
                    && libc::madvise(ptr, advise_size, libc::MADV_HUGEPAGE) != 0
                {
                    warn!(
                        "failed to promote mapping to transparent huge pages: {}",
                        errno::errno()
                    );
                }
            }
        }
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let _ = advise_size;

    if ptr == libc::MAP_FAILED {
        ptr = libc::mmap(null_mut(), map_size, prot, flags, -1, 0);
    }
    if ptr == libc::MAP_FAILED {
        return null_mut();
    }
    os_set_page_name(ptr as *mut u8, map_size);
    ptr as *mut u8
}

#[cfg(windows)]
unsafe fn os_mmap_raw(map_size: usize, _advise_size: usize) -> *mut u8 {
    // MEM_COMMIT up front is fine, physical pages are only allocated once
    // the virtual addresses are touched
    let mut ptr = null_mut();
    if os_huge_pages() {
        ptr = VirtualAlloc(
            null_mut(),
            map_size,
            MEM_LARGE_PAGES | MEM_RESERVE | MEM_COMMIT,
            PAGE_READWRITE,
        );
        // Fall back to normal pages when large pages are exhausted or the
        // privilege was not granted
    }
    if ptr.is_null() {
        ptr = VirtualAlloc(null_mut(), map_size, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE);
    }
    ptr as *mut u8
}

// Reserve and commit `size + alignment` bytes and shift the returned base
// forward so it lands on `alignment`. The shift and the total mapped size
// are reported for the matching unmap.
pub(crate) unsafe fn os_mmap(
    size: usize,
    alignment: usize,
    offset: &mut usize,
    mapped_size: &mut usize,
) -> *mut u8 {
    let map_size = size + alignment;
    let mut ptr = os_mmap_raw(map_size, size);
    if ptr.is_null() {
        if let Some(callback) = init::map_fail_callback() {
            if callback(map_size) {
                return os_mmap(size, alignment, offset, mapped_size);
            }
        }
        set_errno(Errno(libc::ENOMEM));
        return null_mut();
    }
    if alignment != 0 {
        let mut padding = (ptr as usize) & (alignment - 1);
        if padding != 0 {
            padding = alignment - padding;
        }
        debug_assert!(padding <= alignment, "internal failure in map padding");
        debug_assert!(padding % 8 == 0, "internal failure in map padding");
        ptr = ptr.add(padding);
        *offset = padding;
    }
    *mapped_size = map_size;
    ptr
}

pub(crate) unsafe fn os_mcommit(address: *mut u8, size: usize) {
    #[cfg(windows)]
    {
        if VirtualAlloc(address as *mut _, size, MEM_COMMIT, PAGE_READWRITE).is_null() {
            warn!("failed to commit virtual memory block, error {}", GetLastError());
            debug_assert!(false, "failed to commit virtual memory block");
        }
    }
    #[cfg(not(windows))]
    {
        if libc::mprotect(address as *mut _, size, libc::PROT_READ | libc::PROT_WRITE) != 0 {
            warn!("failed to commit virtual memory block: {}", errno::errno());
            debug_assert!(false, "failed to commit virtual memory block");
        }
    }
}

pub(crate) unsafe fn os_mdecommit(address: *mut u8, size: usize) {
    #[cfg(windows)]
    {
        if VirtualFree(address as *mut _, size, MEM_DECOMMIT) == 0 {
            warn!("failed to decommit virtual memory block, error {}", GetLastError());
            debug_assert!(false, "failed to decommit virtual memory block");
        }
    }
    #[cfg(not(windows))]
    {
        if libc::mprotect(address as *mut _, size, libc::PROT_NONE) != 0 {
            warn!("failed to decommit virtual memory block: {}", errno::errno());
            debug_assert!(false, "failed to decommit virtual memory block");
        }
        #[cfg(any(target_os = "linux", target_os = "android"))]
        let err = libc::madvise(address as *mut _, size, libc::MADV_DONTNEED);
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        let err = libc::madvise(address as *mut _, size, libc::MADV_FREE);
        #[cfg(not(any(
            target_os = "linux",
            target_os = "android",
            target_os = "macos",
            target_os = "ios"
        )))]
        let err = libc::posix_madvise(address as *mut _, size, libc::POSIX_MADV_DONTNEED);
        if err != 0 {
            warn!("failed to release physical pages: {}", errno::errno());
        }
    }
}

pub(crate) unsafe fn os_munmap(address: *mut u8, offset: usize, mapped_size: usize) {
    let address = address.sub(offset);
    #[cfg(windows)]
    {
        let _ = mapped_size;
        if VirtualFree(address as *mut _, 0, MEM_RELEASE) == 0 {
            warn!("failed to unmap virtual memory block, error {}", GetLastError());
            debug_assert!(false, "failed to unmap virtual memory block");
        }
    }
    #[cfg(not(windows))]
    {
        if libc::munmap(address as *mut _, mapped_size) != 0 {
            warn!("failed to unmap virtual memory block: {}", errno::errno());
            debug_assert!(false, "failed to unmap virtual memory block");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_huge_page_size_from_meminfo() {
        let meminfo = b"MemTotal: 16314448 kB\nHugepagesize:    2048 kB\nDirectMap4k: 1 kB\n";
        assert_eq!(parse_huge_page_size(meminfo), 2048 * 1024);
    }

    #[test]
    fn missing_huge_page_entry_reads_as_zero() {
        assert_eq!(parse_huge_page_size(b"MemTotal: 1 kB\n"), 0);
        assert_eq!(parse_huge_page_size(b"Hugepagesize: garbage\n"), 0);
    }
}
