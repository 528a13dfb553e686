//! Page mapping and protection, per host OS.
//!
//! The only OS services the link layer needs: anonymous mappings for code
//! regions and protection changes for W^X sealing and smashing.

use std::io;
use std::ptr::NonNull;
use std::sync::OnceLock;

/// Access rights requested for a range of pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PageAccess {
    ReadWrite,
    ReadExecute,
    ReadWriteExecute,
}

/// Host page size, queried once.
pub(crate) fn page_size() -> usize {
    static PAGE: OnceLock<usize> = OnceLock::new();
    *PAGE.get_or_init(sys::page_size)
}

/// Round `len` up to a whole number of pages.
#[inline]
pub(crate) fn round_to_pages(len: usize) -> usize {
    let page = page_size();
    len.div_ceil(page) * page
}

/// Start of the page holding `addr`.
#[inline]
pub(crate) fn page_of(addr: usize) -> usize {
    addr & !(page_size() - 1)
}

/// Map `len` bytes of fresh anonymous memory.
pub(crate) fn map(len: usize, access: PageAccess) -> io::Result<NonNull<u8>> {
    // SAFETY: a fresh anonymous mapping aliases nothing
    let ptr = unsafe { sys::map(len, access) };
    NonNull::new(ptr).ok_or_else(io::Error::last_os_error)
}

/// Release a mapping made by [`map`].
///
/// # Safety
/// `ptr` and `len` must describe exactly one live mapping, and no code in
/// it may run again.
pub(crate) unsafe fn unmap(ptr: NonNull<u8>, len: usize) {
    // SAFETY: forwarded from the caller
    unsafe { sys::unmap(ptr.as_ptr(), len) }
}

/// Change the protection of the pages covering `[addr, addr + len)`.
///
/// # Safety
/// The range must be page aligned and lie inside a live mapping.
pub(crate) unsafe fn protect(addr: usize, len: usize, access: PageAccess) -> io::Result<()> {
    // SAFETY: forwarded from the caller
    if unsafe { sys::protect(addr as *mut u8, len, access) } {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
mod sys {
    use super::PageAccess;

    fn prot(access: PageAccess) -> libc::c_int {
        match access {
            PageAccess::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            PageAccess::ReadExecute => libc::PROT_READ | libc::PROT_EXEC,
            PageAccess::ReadWriteExecute => libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        }
    }

    pub fn page_size() -> usize {
        // SAFETY: sysconf has no preconditions
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        usize::try_from(page).unwrap_or(4096)
    }

    pub unsafe fn map(len: usize, access: PageAccess) -> *mut u8 {
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        // SAFETY: anonymous mapping with no address hint
        let p = unsafe { libc::mmap(std::ptr::null_mut(), len, prot(access), flags, -1, 0) };
        if p == libc::MAP_FAILED {
            std::ptr::null_mut()
        } else {
            p.cast()
        }
    }

    pub unsafe fn unmap(ptr: *mut u8, len: usize) {
        // SAFETY: the caller owns the mapping
        unsafe { libc::munmap(ptr.cast(), len) };
    }

    pub unsafe fn protect(ptr: *mut u8, len: usize, access: PageAccess) -> bool {
        // SAFETY: the caller guarantees the range is mapped and aligned
        unsafe { libc::mprotect(ptr.cast(), len, prot(access)) == 0 }
    }
}

#[cfg(windows)]
mod sys {
    use super::PageAccess;
    use windows_sys::Win32::System::Memory::{
        MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE,
        PAGE_PROTECTION_FLAGS, PAGE_READWRITE, VirtualAlloc, VirtualFree, VirtualProtect,
    };
    use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

    fn prot(access: PageAccess) -> PAGE_PROTECTION_FLAGS {
        match access {
            PageAccess::ReadWrite => PAGE_READWRITE,
            PageAccess::ReadExecute => PAGE_EXECUTE_READ,
            PageAccess::ReadWriteExecute => PAGE_EXECUTE_READWRITE,
        }
    }

    pub fn page_size() -> usize {
        // SAFETY: SYSTEM_INFO is plain data and GetSystemInfo cannot fail
        let mut info: SYSTEM_INFO = unsafe { std::mem::zeroed() };
        unsafe { GetSystemInfo(&mut info) };
        info.dwPageSize as usize
    }

    pub unsafe fn map(len: usize, access: PageAccess) -> *mut u8 {
        // SAFETY: fresh reservation with no address hint
        let kind = MEM_COMMIT | MEM_RESERVE;
        unsafe { VirtualAlloc(std::ptr::null(), len, kind, prot(access)).cast() }
    }

    pub unsafe fn unmap(ptr: *mut u8, _len: usize) {
        // SAFETY: the caller owns the reservation
        unsafe { VirtualFree(ptr.cast(), 0, MEM_RELEASE) };
    }

    pub unsafe fn protect(ptr: *mut u8, len: usize, access: PageAccess) -> bool {
        let mut previous = 0;
        // SAFETY: the caller guarantees the range is mapped
        unsafe { VirtualProtect(ptr.cast(), len, prot(access), &mut previous) != 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_rounding() {
        let page = page_size();
        assert!(page.is_power_of_two());
        assert_eq!(round_to_pages(1), page);
        assert_eq!(round_to_pages(page), page);
        assert_eq!(round_to_pages(page + 1), 2 * page);
        assert_eq!(page_of(page + 17), page);
    }

    #[test]
    fn test_map_protect_unmap() {
        let len = page_size();
        let ptr = map(len, PageAccess::ReadWrite).unwrap();
        // SAFETY: freshly mapped and writable
        unsafe {
            ptr.as_ptr().write(0xC3);
            protect(ptr.as_ptr() as usize, len, PageAccess::ReadExecute).unwrap();
            assert_eq!(ptr.as_ptr().read(), 0xC3);
            unmap(ptr, len);
        }
    }
}
