//! Fixed pool of physical pages backing the encrypted view.
//!
//! A pool owns one unlinked temp file mapped shared, carved into
//! equally-sized pages. The encrypted view maps individual pool pages into
//! its virtual region with `MAP_FIXED`; the pool itself never grows — when
//! it runs dry the view evicts its own mappings instead.

use std::fs::File;
use std::os::unix::io::{AsRawFd, RawFd};

use memmap2::MmapRaw;
use tracing::warn;

use crate::MemError;

/// Lower bound on pages per pool.
///
/// Two pages are the minimum for correctness: a `memcpy` spanning a
/// virtual-page boundary faults both pages in quick succession, and with a
/// single physical page the second fault would evict the first page and
/// loop forever.
pub const MIN_POOL_PAGES: usize = 2;

/// Upper bound on pages per pool. Larger working sets should use a larger
/// page size instead.
pub const MAX_POOL_PAGES: usize = 512;

/// One physical page of a [`PagePool`]: a file descriptor, an offset into
/// the pool file, and the pool-side mapping of that range.
#[derive(Clone, Copy, Debug)]
pub struct PhysPage {
    /// File descriptor of the pool's backing file.
    pub fd: RawFd,
    /// Byte offset of this page within the pool file.
    pub offset: usize,
    /// Pool-side pointer to the page contents (always mapped read-write).
    pub ptr: *mut u8,
}

// SAFETY: a PhysPage is a plain descriptor; the memory it points at is
// owned by the pool, which outlives every handed-out descriptor.
unsafe impl Send for PhysPage {}

/// A fixed-size pool of physical pages.
#[derive(Debug)]
pub struct PagePool {
    /// Keeps the unlinked temp file (and its fd) alive.
    _file: File,
    /// Keeps the pool-side mapping alive for the PhysPage pointers.
    _map: MmapRaw,
    page_size: usize,
    pages: Vec<PhysPage>,
    free: Vec<PhysPage>,
    /// Size originally requested, used for registry matching.
    requested_size: usize,
}

// SAFETY: the raw page pointers all target the pool's own shared mapping.
unsafe impl Send for PagePool {}

impl PagePool {
    /// Creates a pool covering at least `size` bytes in pages of
    /// `page_size` bytes, clamped to `[MIN_POOL_PAGES, MAX_POOL_PAGES]`
    /// pages.
    ///
    /// The backing file is an unlinked temp file; `mlock` is attempted and
    /// a warning is logged when it fails (the pool still works, but pages
    /// may be swapped out).
    ///
    /// # Errors
    ///
    /// Returns [`MemError::InvalidPageSize`] if `page_size` is not a
    /// positive multiple of the OS page size, and I/O or mmap errors from
    /// file creation.
    pub fn new(size: usize, page_size: usize) -> Result<Self, MemError> {
        let os_page = os_page_size();
        if page_size == 0 || page_size % os_page != 0 {
            return Err(MemError::InvalidPageSize {
                got: page_size,
                os: os_page,
            });
        }

        let n_pages = size
            .div_ceil(page_size)
            .clamp(MIN_POOL_PAGES, MAX_POOL_PAGES);
        let pool_len = n_pages * page_size;

        let file = tempfile::tempfile()?;
        // Reserve blocks up front so a page fault cannot hit ENOSPC later.
        let rc = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, pool_len as libc::off_t) };
        if rc != 0 {
            return Err(MemError::Sys {
                call: "posix_fallocate",
                source: std::io::Error::from_raw_os_error(rc),
            });
        }

        let map = MmapRaw::map_raw(&file)?;

        // SAFETY: the mapping covers exactly pool_len bytes we just mapped.
        if unsafe { libc::mlock(map.as_mut_ptr().cast(), pool_len) } != 0 {
            warn!(
                pool_len,
                "mlock of page pool failed; pages may be swapped to disk"
            );
        }

        let fd = file.as_raw_fd();
        let base = map.as_mut_ptr();
        let pages: Vec<PhysPage> = (0..n_pages)
            .map(|i| PhysPage {
                fd,
                offset: i * page_size,
                // SAFETY: i * page_size < pool_len, inside the mapping.
                ptr: unsafe { base.add(i * page_size) },
            })
            .collect();
        let free = pages.clone();

        Ok(PagePool {
            _file: file,
            _map: map,
            page_size,
            pages,
            free,
            requested_size: size,
        })
    }

    /// Takes a free page, or `None` when the pool is exhausted. Never
    /// waits and never allocates new pages.
    pub fn alloc(&mut self) -> Option<PhysPage> {
        self.free.pop()
    }

    /// Returns a page to the pool. The pool does not verify double frees.
    pub fn free(&mut self, page: PhysPage) {
        debug_assert!(self.free.len() < self.pages.len());
        self.free.push(page);
    }

    /// Restores the full free stack. Callers must first unmap any virtual
    /// pages still referring to pool pages.
    pub fn free_all(&mut self) {
        if self.free.len() != self.pages.len() {
            self.free.clear();
            self.free.extend_from_slice(&self.pages);
        }
    }

    /// Page size in bytes.
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Total pool capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.pages.len() * self.page_size
    }

    /// The `(size, page_size)` this pool was created with, used by the
    /// registry to match reuse requests.
    #[must_use]
    pub fn create_params(&self) -> (usize, usize) {
        (self.requested_size, self.page_size)
    }

    #[cfg(test)]
    pub(crate) fn free_count(&self) -> usize {
        self.free.len()
    }
}

/// The OS page size.
pub(crate) fn os_page_size() -> usize {
    // SAFETY: sysconf(_SC_PAGESIZE) has no preconditions.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_unaligned_page_size() {
        let err = PagePool::new(1 << 16, 1000).unwrap_err();
        assert!(matches!(err, MemError::InvalidPageSize { .. }));
    }

    #[test]
    fn test_clamps_to_min_pages() {
        let ps = os_page_size();
        let pool = PagePool::new(1, ps).unwrap();
        assert_eq!(pool.capacity(), MIN_POOL_PAGES * ps);
    }

    #[test]
    fn test_alloc_exhausts_then_frees() {
        let ps = os_page_size();
        let mut pool = PagePool::new(4 * ps, ps).unwrap();
        let mut taken = Vec::new();
        while let Some(p) = pool.alloc() {
            taken.push(p);
        }
        assert_eq!(taken.len(), 4);
        assert!(pool.alloc().is_none());

        pool.free(taken.pop().unwrap());
        assert!(pool.alloc().is_some());
    }

    #[test]
    fn test_pages_are_disjoint_and_writable() {
        let ps = os_page_size();
        let mut pool = PagePool::new(2 * ps, ps).unwrap();
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert_ne!(a.offset, b.offset);
        // SAFETY: both pages are live, disjoint ranges of the pool mapping.
        unsafe {
            a.ptr.write_bytes(0xAA, ps);
            b.ptr.write_bytes(0xBB, ps);
            assert_eq!(*a.ptr, 0xAA);
            assert_eq!(*b.ptr, 0xBB);
        }
    }

    #[test]
    fn test_free_all_restores_stack() {
        let ps = os_page_size();
        let mut pool = PagePool::new(3 * ps, ps).unwrap();
        let _a = pool.alloc().unwrap();
        let _b = pool.alloc().unwrap();
        pool.free_all();
        assert_eq!(pool.free_count(), 3);
    }
}
