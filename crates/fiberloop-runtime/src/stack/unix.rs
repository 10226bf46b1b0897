//! Unix stack mapping using mmap + mprotect

use fiberloop_core::error::StackError;
use nix::unistd::{sysconf, SysconfVar};
use std::sync::OnceLock;

static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

/// System page size (cached)
pub fn page_size() -> usize {
    *PAGE_SIZE.get_or_init(|| match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(n)) if n > 0 => n as usize,
        _ => 4096,
    })
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Map `size` usable bytes bracketed by two `PROT_NONE` pages.
///
/// Returns the mapping base and total length.
pub(super) fn map_guarded(size: usize, page: usize) -> Result<(*mut u8, usize), StackError> {
    let total = size
        .checked_add(2 * page)
        .ok_or(StackError::InvalidSize(size))?;

    let base = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            total,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    if base == libc::MAP_FAILED {
        return Err(StackError::AllocationFailed(last_errno()));
    }
    let base = base as *mut u8;

    // Low guard, then high guard
    for guard in [base, unsafe { base.add(page + size) }] {
        let ret = unsafe { libc::mprotect(guard as *mut libc::c_void, page, libc::PROT_NONE) };
        if ret != 0 {
            let errno = last_errno();
            unsafe { libc::munmap(base as *mut libc::c_void, total) };
            return Err(StackError::ProtectionFailed(errno));
        }
    }

    Ok((base, total))
}

/// Undo `map_guarded`
pub(super) fn unmap_guarded(base: *mut u8, total: usize, page: usize) {
    unsafe {
        // Lift the guards first so the whole range is released uniformly
        libc::mprotect(base as *mut libc::c_void, page, libc::PROT_READ | libc::PROT_WRITE);
        libc::mprotect(
            base.add(total - page) as *mut libc::c_void,
            page,
            libc::PROT_READ | libc::PROT_WRITE,
        );
        libc::munmap(base as *mut libc::c_void, total);
    }
}
