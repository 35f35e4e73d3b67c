//! Unix implementation using mmap/munmap and sysconf.

use core::ffi::c_void;

const PROT_READ: i32 = 0x1;
const PROT_WRITE: i32 = 0x2;
const MAP_PRIVATE: i32 = 0x02;
#[cfg(target_os = "macos")]
const MAP_ANONYMOUS: i32 = 0x1000;
#[cfg(not(target_os = "macos"))]
const MAP_ANONYMOUS: i32 = 0x20;
const MAP_FAILED: *mut c_void = !0usize as *mut c_void;

#[cfg(target_os = "linux")]
const SC_PHYS_PAGES: i32 = 85;
#[cfg(target_os = "linux")]
const SC_PAGESIZE: i32 = 30;
#[cfg(target_os = "macos")]
const SC_PHYS_PAGES: i32 = 200;
#[cfg(target_os = "macos")]
const SC_PAGESIZE: i32 = 29;

unsafe extern "C" {
    fn mmap(
        addr: *mut c_void,
        length: usize,
        prot: i32,
        flags: i32,
        fd: i32,
        offset: i64,
    ) -> *mut c_void;

    fn munmap(addr: *mut c_void, length: usize) -> i32;

    fn sysconf(name: i32) -> i64;
}

pub unsafe fn page_alloc(size: usize) -> *mut u8 {
    let ptr = unsafe {
        mmap(
            core::ptr::null_mut(),
            size,
            PROT_READ | PROT_WRITE,
            MAP_PRIVATE | MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == MAP_FAILED {
        core::ptr::null_mut()
    } else {
        ptr as *mut u8
    }
}

pub unsafe fn page_dealloc(ptr: *mut u8, size: usize) {
    unsafe { munmap(ptr as *mut c_void, size) };
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
pub fn memory_size() -> usize {
    let pages = unsafe { sysconf(SC_PHYS_PAGES) };
    let page_size = unsafe { sysconf(SC_PAGESIZE) };
    if pages > 0 && page_size > 0 {
        (pages as usize).saturating_mul(page_size as usize)
    } else {
        super::DEFAULT_MEMORY_SIZE
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn memory_size() -> usize {
    super::DEFAULT_MEMORY_SIZE
}
