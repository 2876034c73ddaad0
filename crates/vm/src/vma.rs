//! Page-aligned host virtual memory allocation.
//!
//! Guest RAM and other large, long-lived buffers are backed by anonymous
//! mappings rather than the Rust allocator so they are page-aligned, lazily
//! populated, and can carry kernel hints (same-page merging, transparent
//! huge pages).

use std::ptr::NonNull;

bitflags::bitflags! {
    /// Allocation attributes for [`VmaRegion::alloc`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmaFlags: u32 {
        /// Readable + writable mapping.
        const RDWR  = 1 << 0;
        /// Hint the kernel to merge identical pages (KSM).
        const MERGE = 1 << 1;
        /// Hint the kernel to back the region with huge pages.
        const HUGE  = 1 << 2;
    }
}

/// Host page size. Guest pages are always 4 KiB; the host allocator rounds
/// region sizes up to its own granularity.
pub fn host_page_size() -> usize {
    // SAFETY: sysconf(_SC_PAGESIZE) has no preconditions.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as usize
    } else {
        4096
    }
}

/// An owned, page-aligned anonymous mapping. Unmapped on drop.
pub struct VmaRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// The region is a plain byte buffer; all concurrent-access discipline is the
// caller's (guest RAM uses per-address atomics).
unsafe impl Send for VmaRegion {}
unsafe impl Sync for VmaRegion {}

impl VmaRegion {
    /// Map `len` bytes of zeroed anonymous memory. Returns `None` if the
    /// host refuses the mapping.
    pub fn alloc(len: usize, flags: VmaFlags) -> Option<VmaRegion> {
        let page = host_page_size();
        let len = len.checked_add(page - 1)? & !(page - 1);
        if len == 0 {
            return None;
        }
        let prot = if flags.contains(VmaFlags::RDWR) {
            libc::PROT_READ | libc::PROT_WRITE
        } else {
            libc::PROT_READ
        };
        // SAFETY: anonymous private mapping with no address hint.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                prot,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return None;
        }
        #[cfg(target_os = "linux")]
        {
            // Advisory only; failure is ignored.
            if flags.contains(VmaFlags::MERGE) {
                // SAFETY: ptr/len describe the mapping created above.
                unsafe { libc::madvise(ptr, len, libc::MADV_MERGEABLE) };
            }
            if flags.contains(VmaFlags::HUGE) {
                // SAFETY: as above.
                unsafe { libc::madvise(ptr, len, libc::MADV_HUGEPAGE) };
            }
        }
        Some(VmaRegion {
            ptr: NonNull::new(ptr as *mut u8)?,
            len,
        })
    }

    /// Base pointer of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Mapped length in bytes (rounded up to host pages).
    pub fn len(&self) -> usize {
        self.len
    }

    /// Release the backing pages of `[offset, offset+len)` back to the host
    /// without unmapping, so a machine reset starts from zeroed RAM cheaply.
    pub fn clean(&self, offset: usize, len: usize) {
        if offset >= self.len {
            return;
        }
        let len = len.min(self.len - offset);
        #[cfg(target_os = "linux")]
        // SAFETY: the range lies inside the mapping.
        unsafe {
            libc::madvise(
                self.ptr.as_ptr().add(offset) as *mut libc::c_void,
                len,
                libc::MADV_DONTNEED,
            );
        }
        #[cfg(not(target_os = "linux"))]
        // SAFETY: the range lies inside the mapping.
        unsafe {
            std::ptr::write_bytes(self.ptr.as_ptr().add(offset), 0, len);
        }
    }
}

impl Drop for VmaRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap and are unmapped once.
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

/// Best-effort thread hardening after spawn. Guest-facing threads never need
/// core dumps; full capability dropping is platform work outside this crate.
/// Disabled by setting `RVBOX_NO_ISOLATION`.
pub fn isolate_thread() {
    if std::env::var_os("RVBOX_NO_ISOLATION").is_some() {
        return;
    }
    #[cfg(target_os = "linux")]
    // SAFETY: PR_SET_DUMPABLE only affects this process's dump policy.
    unsafe {
        libc::prctl(libc::PR_SET_DUMPABLE, 0, 0, 0, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_is_page_aligned_and_zeroed() {
        let r = VmaRegion::alloc(12345, VmaFlags::RDWR).expect("mmap failed");
        assert_eq!(r.as_ptr() as usize % host_page_size(), 0);
        assert!(r.len() >= 12345);
        let bytes = unsafe { std::slice::from_raw_parts(r.as_ptr(), r.len()) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn clean_rezeroes() {
        let r = VmaRegion::alloc(8192, VmaFlags::RDWR).unwrap();
        unsafe { *r.as_ptr() = 0xAA };
        r.clean(0, r.len());
        assert_eq!(unsafe { *r.as_ptr() }, 0);
    }
}
