//! Platform-specific page-eviction hints.
//!
//! Isolated behind this module so the rest of [`crate::workspace`] stays
//! free of `unsafe` and `cfg(unix)`.

use std::io;

/// Advise the kernel that `[addr, addr+len)` is not needed and may be
/// discarded (Unix: `madvise(MADV_DONTNEED)`). Discarded pages are re-read
/// from the backing file transparently on next access.
#[cfg(unix)]
pub fn advise_dontneed(addr: *mut std::ffi::c_void, len: usize) -> io::Result<()> {
    let ret = unsafe { libc::madvise(addr.cast(), len, libc::MADV_DONTNEED) };
    if ret != 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Advise the kernel that `[addr, addr+len)` will be needed soon (Unix:
/// `madvise(MADV_WILLNEED)`), triggering readahead.
#[cfg(unix)]
pub fn advise_willneed(addr: *mut std::ffi::c_void, len: usize) -> io::Result<()> {
    let ret = unsafe { libc::madvise(addr.cast(), len, libc::MADV_WILLNEED) };
    if ret != 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(not(unix))]
pub fn advise_dontneed(_addr: *mut std::ffi::c_void, _len: usize) -> io::Result<()> {
    Ok(())
}

#[cfg(not(unix))]
pub fn advise_willneed(_addr: *mut std::ffi::c_void, _len: usize) -> io::Result<()> {
    Ok(())
}
