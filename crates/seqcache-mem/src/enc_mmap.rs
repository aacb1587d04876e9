//! Encrypted demand-paged view of a file mapping.
//!
//! [`EncMmap`] reserves a `PROT_NONE` virtual region the size of the
//! backing file and lets clients dereference pointers into it as if it
//! were plain memory. The first touch of a page raises a fault; a
//! process-wide `SIGSEGV` handler decrypts the corresponding window of the
//! backing file into a [`PagePool`] page and maps it in place with
//! `MAP_FIXED`. A write to a clean page upgrades its protection and marks
//! it dirty; dirty pages are re-encrypted into the backing file on `sync`
//! or when the pool runs dry and mappings must be evicted.
//!
//! The fault handler owns no locks: it guards all per-mapping state with a
//! single atomic flag and simply returns when the flag is contended — the
//! hardware re-raises the fault and the access retries. State the handler
//! touches is pre-allocated at construction (dense per-page tables), so
//! the fault path never allocates except through the pool.
//!
//! # Fatal errors
//!
//! `mmap`/`mprotect` failures inside the handler leave the address space
//! in an unusable state; they are reported on stderr and abort the
//! process.

use std::cell::UnsafeCell;
use std::mem::{self, MaybeUninit};
use std::os::raw::{c_int, c_void};
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use tracing::error;

use crate::cipher::{FileKey, PageCipher};
use crate::mmap::{AccessMode, FileMmap, MemMap};
use crate::page_pool::{PagePool, PhysPage};
use crate::pool_registry::PagePoolRegistry;
use crate::MemError;

/// Upper bound on pages flushed/freed in one eviction pass.
const FLUSH_LIMIT: usize = 100;

/// Pages read ahead per fault while in [`AccessMode::Read`].
const READ_AHEAD_PAGES: usize = 100;

/// Protection state of one virtual page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum VProt {
    /// Not mapped; any access faults.
    None,
    /// Mapped clean; writes fault.
    Read,
    /// Mapped dirty.
    ReadWrite,
}

impl VProt {
    fn flags(self) -> c_int {
        match self {
            VProt::None => libc::PROT_NONE,
            VProt::Read => libc::PROT_READ,
            VProt::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        }
    }
}

/// State the fault handler mutates, guarded by `Inner::lock`.
struct MapState {
    /// `Some` until drop hands the pool back to the registry.
    pool: Option<PagePool>,
    cipher: PageCipher,
    /// Per-page protection, dense.
    prot: Box<[VProt]>,
    /// Physical page behind each mapped virtual page, dense.
    phys: Box<[Option<PhysPage>]>,
    mapped_cnt: usize,
}

impl MapState {
    fn pool(&mut self) -> &mut PagePool {
        self.pool.as_mut().expect("pool is present until drop")
    }
}

struct Inner {
    /// Spin flag serializing the fault handler, sync and set_key.
    lock: AtomicBool,
    raw: FileMmap,
    raw_ptr: *mut u8,
    /// Unaligned anonymous reservation, `vmem_size + 2 * page_size` long.
    reservation: *mut u8,
    reservation_len: usize,
    /// Page-aligned base clients see.
    base: *mut u8,
    vmem_size: usize,
    page_size: usize,
    pages_cnt: usize,
    last_page_size: usize,
    /// Bytes below this file offset bypass the cipher.
    plaintext_prefix: usize,
    /// Encodes `VProt` for freshly faulted pages (1 = Read, 2 = ReadWrite).
    default_prot: AtomicU8,
    read_ahead: AtomicUsize,
    sync_on_destroy: bool,
    registry: Arc<PagePoolRegistry>,
    state: UnsafeCell<MapState>,
}

// SAFETY: all raw pointers target mappings owned by this Inner; cross-thread
// access to `state` is serialized by the atomic `lock` flag.
unsafe impl Send for Inner {}
// SAFETY: the fault handler reaches Inner from arbitrary threads by design;
// every mutation path takes the spin flag first.
unsafe impl Sync for Inner {}

/// An encrypted demand-paged view over a [`FileMmap`].
pub struct EncMmap {
    inner: Box<Inner>,
}

// ---------------------------------------------------------------------------
// Process-wide registry of live mappings, probed from the fault handler.

struct MmapRegistry {
    lock: AtomicBool,
    entries: UnsafeCell<Vec<RegEntry>>,
}

struct RegEntry {
    start: usize,
    end: usize,
    inner: *const Inner,
}

// SAFETY: `entries` is only touched while `lock` is held; the fault path
// merely probes and bails out on contention.
unsafe impl Sync for MmapRegistry {}

static REGISTRY: MmapRegistry = MmapRegistry {
    lock: AtomicBool::new(false),
    entries: UnsafeCell::new(Vec::new()),
};

enum Probe {
    /// Registry busy; let the fault re-fire.
    Contended,
    /// Address belongs to no registered mapping.
    NotOurs,
    Found(*const Inner),
}

impl MmapRegistry {
    fn acquire(&self) {
        while self.lock.swap(true, Ordering::Acquire) {
            std::thread::yield_now();
        }
    }

    fn release(&self) {
        self.lock.store(false, Ordering::Release);
    }

    fn add(&self, start: usize, end: usize, inner: *const Inner) {
        self.acquire();
        // SAFETY: lock held.
        unsafe { (*self.entries.get()).push(RegEntry { start, end, inner }) };
        self.release();
    }

    fn remove(&self, inner: *const Inner) {
        self.acquire();
        // SAFETY: lock held.
        unsafe { (*self.entries.get()).retain(|e| e.inner != inner) };
        self.release();
    }

    /// Non-blocking lookup for the fault path.
    fn probe(&self, addr: usize) -> Probe {
        if self.lock.swap(true, Ordering::Acquire) {
            return Probe::Contended;
        }
        // SAFETY: lock held; probing performs no allocation.
        let found = unsafe {
            (*self.entries.get())
                .iter()
                .find(|e| addr >= e.start && addr < e.end)
                .map(|e| e.inner)
        };
        self.release();
        match found {
            Some(inner) => Probe::Found(inner),
            None => Probe::NotOurs,
        }
    }
}

// ---------------------------------------------------------------------------
// Signal handler installation and dispatch.

static HANDLER_INIT: Once = Once::new();
static mut OLD_ACTION: MaybeUninit<libc::sigaction> = MaybeUninit::uninit();

fn install_fault_handler() -> Result<(), MemError> {
    let mut result = Ok(());
    HANDLER_INIT.call_once(|| {
        // SAFETY: standard sigaction installation; OLD_ACTION is written
        // exactly once, before the new handler can observe it.
        unsafe {
            let mut sa: libc::sigaction = mem::zeroed();
            sa.sa_sigaction = fault_handler as usize;
            sa.sa_flags = libc::SA_SIGINFO | libc::SA_NODEFER;
            libc::sigemptyset(&mut sa.sa_mask);
            if libc::sigaction(
                libc::SIGSEGV,
                &sa,
                ptr::addr_of_mut!(OLD_ACTION).cast::<libc::sigaction>(),
            ) != 0
            {
                result = Err(MemError::sys("sigaction"));
            }
        }
    });
    result
}

extern "C" fn fault_handler(sig: c_int, info: *mut libc::siginfo_t, ctx: *mut c_void) {
    // SAFETY: the kernel hands us a valid siginfo for SIGSEGV.
    let addr = unsafe { (*info).si_addr() } as usize;
    match REGISTRY.probe(addr) {
        Probe::Contended => {
            // Registration or another fault is in flight. Returning
            // re-executes the faulting instruction and the fault re-fires.
        }
        Probe::NotOurs => {
            // SAFETY: chains to the action that was installed before ours.
            unsafe { chain_to_previous(sig, info, ctx) };
        }
        Probe::Found(inner) => {
            // SAFETY: the registry only holds live mappings; unmapping a
            // region while another thread still faults into it is a caller
            // contract violation.
            unsafe { (*inner).handle_fault(addr) };
        }
    }
}

/// Dispatches a fault that is not ours to the previously installed action.
unsafe fn chain_to_previous(sig: c_int, info: *mut libc::siginfo_t, ctx: *mut c_void) {
    let old = (*ptr::addr_of!(OLD_ACTION)).assume_init_ref();
    if old.sa_flags & libc::SA_SIGINFO != 0 {
        let f: extern "C" fn(c_int, *mut libc::siginfo_t, *mut c_void) =
            mem::transmute(old.sa_sigaction);
        f(sig, info, ctx);
    } else {
        match old.sa_sigaction {
            libc::SIG_DFL => {
                // Restore the default action; the re-raised fault then
                // terminates the process the usual way.
                libc::signal(sig, libc::SIG_DFL);
            }
            libc::SIG_IGN => {}
            handler => {
                let f: extern "C" fn(c_int) = mem::transmute(handler);
                f(sig);
            }
        }
    }
}

/// Async-signal-safe last resort: report and abort.
fn fault_fatal(msg: &str) -> ! {
    // SAFETY: write(2) and abort(2) are async-signal-safe.
    unsafe {
        let _ = libc::write(libc::STDERR_FILENO, msg.as_ptr().cast(), msg.len());
        libc::abort();
    }
}

// ---------------------------------------------------------------------------

impl EncMmap {
    /// Wraps `raw` in an encrypted view.
    ///
    /// `page_size` must be a positive multiple of the OS page size;
    /// `cache_size` bounds the decrypted working set (the pool is clamped
    /// to at least two pages). Bytes below `plaintext_prefix` are stored
    /// in the clear.
    ///
    /// # Errors
    ///
    /// Propagates pool construction, reservation and signal-handler
    /// installation failures.
    pub fn new(
        key: FileKey,
        raw: FileMmap,
        page_size: usize,
        cache_size: usize,
        sync_on_destroy: bool,
        plaintext_prefix: usize,
        registry: Arc<PagePoolRegistry>,
    ) -> Result<Self, MemError> {
        install_fault_handler()?;

        let pool = registry.allocate(page_size, cache_size)?;
        let vmem_size = raw.len();
        let reservation_len = vmem_size + 2 * page_size;

        // SAFETY: fresh anonymous reservation, address chosen by the kernel.
        let reservation = unsafe {
            libc::mmap(
                ptr::null_mut(),
                reservation_len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if reservation == libc::MAP_FAILED {
            registry.release(pool);
            return Err(MemError::sys("mmap"));
        }
        let reservation = reservation.cast::<u8>();

        // Align the base up so page arithmetic is exact; at most one page
        // of the reservation is sacrificed at each end.
        let base = ((reservation as usize + page_size) / page_size) * page_size;
        let base = base as *mut u8;

        let pages_cnt = vmem_size.div_ceil(page_size);
        let last_page_size = match vmem_size % page_size {
            0 => page_size,
            rem => rem,
        };

        let raw_ptr = raw.ptr();
        let inner = Box::new(Inner {
            lock: AtomicBool::new(false),
            raw,
            raw_ptr,
            reservation,
            reservation_len,
            base,
            vmem_size,
            page_size,
            pages_cnt,
            last_page_size,
            plaintext_prefix,
            default_prot: AtomicU8::new(prot_code(VProt::ReadWrite)),
            read_ahead: AtomicUsize::new(0),
            sync_on_destroy,
            registry,
            state: UnsafeCell::new(MapState {
                pool: Some(pool),
                cipher: PageCipher::new(key),
                prot: vec![VProt::None; pages_cnt].into_boxed_slice(),
                phys: vec![None; pages_cnt].into_boxed_slice(),
                mapped_cnt: 0,
            }),
        });

        REGISTRY.add(base as usize, base as usize + vmem_size, &*inner);
        Ok(EncMmap { inner })
    }

    #[cfg(test)]
    fn mapped_pages(&self) -> usize {
        self.inner.lock_blocking();
        // SAFETY: lock held.
        let cnt = unsafe { (*self.inner.state.get()).mapped_cnt };
        self.inner.unlock();
        cnt
    }
}

fn prot_code(prot: VProt) -> u8 {
    match prot {
        VProt::None => 0,
        VProt::Read => 1,
        VProt::ReadWrite => 2,
    }
}

fn prot_from_code(code: u8) -> VProt {
    match code {
        1 => VProt::Read,
        2 => VProt::ReadWrite,
        _ => VProt::None,
    }
}

impl Inner {
    fn try_lock(&self) -> bool {
        !self.lock.swap(true, Ordering::Acquire)
    }

    fn lock_blocking(&self) {
        while self.lock.swap(true, Ordering::Acquire) {
            std::thread::yield_now();
        }
    }

    fn unlock(&self) {
        self.lock.store(false, Ordering::Release);
    }

    fn default_vprot(&self) -> VProt {
        prot_from_code(self.default_prot.load(Ordering::Relaxed))
    }

    /// Effective length of page `n` (the last page may be partial).
    fn page_len(&self, n: usize) -> usize {
        if n + 1 == self.pages_cnt {
            self.last_page_size
        } else {
            self.page_size
        }
    }

    fn page_start(&self, n: usize) -> *mut u8 {
        // SAFETY: n < pages_cnt, within the aligned reservation.
        unsafe { self.base.add(n * self.page_size) }
    }

    fn mprotect_page(&self, n: usize, prot: VProt) -> Result<(), MemError> {
        // SAFETY: the page lies within our reservation.
        let rc = unsafe {
            libc::mprotect(self.page_start(n).cast(), self.page_size, prot.flags())
        };
        if rc != 0 {
            return Err(MemError::sys("mprotect"));
        }
        Ok(())
    }

    /// Applies the cipher between `src` and `dst`, honouring the plaintext
    /// prefix. `file_off` is the absolute file offset of both slices.
    fn transform(&self, cipher: &PageCipher, file_off: usize, src: &[u8], dst: &mut [u8]) {
        let head = self.plaintext_prefix.saturating_sub(file_off).min(src.len());
        dst[..head].copy_from_slice(&src[..head]);
        if head < src.len() {
            cipher.apply((file_off + head) as u64, &src[head..], &mut dst[head..]);
        }
    }

    /// Re-encrypts `byte_len` bytes starting at page `first_page` from the
    /// virtual region into the backing file.
    fn flush_span(&self, cipher: &PageCipher, first_page: usize, byte_len: usize) {
        let off = first_page * self.page_size;
        // SAFETY: the span covers mapped, readable virtual pages and the
        // matching range of the backing file; the two ranges are disjoint.
        unsafe {
            let src = slice::from_raw_parts(self.base.add(off), byte_len);
            let dst = slice::from_raw_parts_mut(self.raw_ptr.add(off), byte_len);
            self.transform(cipher, off, src, dst);
        }
    }

    /// Decrypts page `n` of the backing file into `page` and maps it at
    /// the page's virtual address. Fault-path only: errors are fatal.
    fn install_page(&self, state: &mut MapState, n: usize, page: PhysPage) {
        let len = self.page_len(n);
        let file_off = n * self.page_size;
        // SAFETY: source is within the backing file, destination is the
        // pool-side mapping of a page we exclusively hold.
        unsafe {
            let src = slice::from_raw_parts(self.raw_ptr.add(file_off), len);
            let dst = slice::from_raw_parts_mut(page.ptr, len);
            self.transform(&state.cipher, file_off, src, dst);
        }

        let prot = self.default_vprot();
        // SAFETY: MAP_FIXED inside our reservation, over a previously
        // PROT_NONE page.
        let mapped = unsafe {
            libc::mmap(
                self.page_start(n).cast(),
                self.page_size,
                prot.flags(),
                libc::MAP_SHARED | libc::MAP_FIXED,
                page.fd,
                page.offset as libc::off_t,
            )
        };
        if mapped == libc::MAP_FAILED {
            fault_fatal("seqcache-mem: fatal: mmap of pool page into view failed\n");
        }
        state.prot[n] = prot;
        state.phys[n] = Some(page);
        state.mapped_cnt += 1;
    }

    /// Evicts up to [`FLUSH_LIMIT`] mapped pages, flushing dirty ones.
    /// Consecutive dirty pages are glued into single cipher calls.
    fn evict_some(&self, state: &mut MapState) {
        let mut evicted = [0usize; FLUSH_LIMIT];
        let mut evicted_cnt = 0;

        let mut run_first = 0usize;
        let mut run_pages = 0usize;
        let mut run_len = 0usize;

        for n in 0..self.pages_cnt {
            if evicted_cnt == FLUSH_LIMIT {
                break;
            }
            if state.phys[n].is_none() {
                continue;
            }
            if state.prot[n] == VProt::ReadWrite {
                // Stop concurrent writers before the page is re-encrypted.
                if self.mprotect_page(n, VProt::Read).is_err() {
                    fault_fatal("seqcache-mem: fatal: mprotect failed during eviction\n");
                }
                let len = self.page_len(n);
                if run_pages > 0 && run_first + run_pages == n {
                    run_pages += 1;
                    run_len += len;
                } else {
                    if run_pages > 0 {
                        self.flush_span(&state.cipher, run_first, run_len);
                    }
                    run_first = n;
                    run_pages = 1;
                    run_len = len;
                }
            }
            state.prot[n] = VProt::None;
            evicted[evicted_cnt] = n;
            evicted_cnt += 1;
        }
        if run_pages > 0 {
            self.flush_span(&state.cipher, run_first, run_len);
        }

        for &n in &evicted[..evicted_cnt] {
            // SAFETY: MAP_FIXED inside our reservation; restores the
            // untouched-reservation state for this page.
            let remapped = unsafe {
                libc::mmap(
                    self.page_start(n).cast(),
                    self.page_size,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
                    -1,
                    0,
                )
            };
            if remapped == libc::MAP_FAILED {
                fault_fatal("seqcache-mem: fatal: unmapping evicted page failed\n");
            }
            if let Some(page) = state.phys[n].take() {
                state.pool().free(page);
                state.mapped_cnt -= 1;
            }
        }
    }

    /// Entry point from the signal handler.
    fn handle_fault(&self, addr: usize) {
        if !self.try_lock() {
            // Contended: the fault re-fires once the holder is done.
            return;
        }
        let n = (addr - self.base as usize) / self.page_size;
        // SAFETY: lock held.
        let state = unsafe { &mut *self.state.get() };
        match state.prot[n] {
            VProt::None => self.service_miss(state, n),
            VProt::Read => {
                // Write to a clean page: upgrade in place, no I/O.
                if self.mprotect_page(n, VProt::ReadWrite).is_err() {
                    fault_fatal("seqcache-mem: fatal: mprotect failed in fault path\n");
                }
                state.prot[n] = VProt::ReadWrite;
            }
            VProt::ReadWrite => {
                // Another thread serviced this page between the hardware
                // fault and lock acquisition; nothing to do.
            }
        }
        self.unlock();
    }

    fn service_miss(&self, state: &mut MapState, n: usize) {
        let page = match state.pool().alloc() {
            Some(p) => p,
            None => {
                self.evict_some(state);
                match state.pool().alloc() {
                    Some(p) => p,
                    None => fault_fatal("seqcache-mem: fatal: page pool empty after eviction\n"),
                }
            }
        };
        self.install_page(state, n, page);

        // Sequential-read phases keep faulting page after page; prefetch a
        // window while the cipher state is warm.
        if self.default_vprot() == VProt::Read {
            let mut next = n;
            for _ in 0..self.read_ahead.load(Ordering::Relaxed) {
                next = if next + 1 < self.pages_cnt { next + 1 } else { 0 };
                if state.prot[next] != VProt::None {
                    continue;
                }
                let Some(page) = state.pool().alloc() else {
                    // No eviction during read-ahead.
                    break;
                };
                self.install_page(state, next, page);
            }
        }
    }

    /// Flushes one dirty page and restores the default protection.
    fn flush_page(&self, state: &mut MapState, n: usize) -> Result<(), MemError> {
        self.mprotect_page(n, VProt::Read)?;
        self.flush_span(&state.cipher, n, self.page_len(n));
        let default = self.default_vprot();
        self.mprotect_page(n, default)?;
        state.prot[n] = default;
        Ok(())
    }

    fn flush_pages_in(&self, first: usize, last: usize) -> Result<(), MemError> {
        self.lock_blocking();
        // SAFETY: lock held.
        let state = unsafe { &mut *self.state.get() };
        for n in first..=last.min(self.pages_cnt - 1) {
            if state.phys[n].is_some() && state.prot[n] == VProt::ReadWrite {
                if let Err(e) = self.flush_page(state, n) {
                    self.unlock();
                    return Err(e);
                }
            }
        }
        self.unlock();
        Ok(())
    }
}

impl MemMap for EncMmap {
    fn ptr(&self) -> *mut u8 {
        self.inner.base
    }

    fn len(&self) -> usize {
        self.inner.vmem_size
    }

    fn sync_range(&self, offset: usize, len: usize) -> Result<(), MemError> {
        if len == 0 || self.inner.vmem_size == 0 {
            return Ok(());
        }
        let inner = &*self.inner;
        let first = offset / inner.page_size;
        let last = (offset + len - 1) / inner.page_size;
        inner.flush_pages_in(first, last)?;

        let start = first * inner.page_size;
        let end = ((last + 1) * inner.page_size).min(inner.vmem_size);
        inner.raw.sync_range(start, end - start)
    }

    fn sync(&self) -> Result<(), MemError> {
        let inner = &*self.inner;
        if inner.pages_cnt > 0 {
            inner.flush_pages_in(0, inner.pages_cnt - 1)?;
        }
        inner.raw.sync()
    }

    fn set_key(&self, key: &FileKey) {
        let inner = &*self.inner;
        inner.lock_blocking();
        // SAFETY: lock held.
        let state = unsafe { &mut *inner.state.get() };
        state.cipher = PageCipher::new(key.clone());

        // Anything decrypted so far belongs to the old key; re-encrypting
        // it under the new one would corrupt the file. Drop every mapping.
        // SAFETY: the span covers exactly our page-aligned region.
        let rc = unsafe {
            libc::mprotect(
                inner.base.cast(),
                inner.pages_cnt * inner.page_size,
                libc::PROT_NONE,
            )
        };
        if rc != 0 {
            error!("mprotect(PROT_NONE) during key change failed; aborting");
            std::process::abort();
        }
        state.phys.iter_mut().for_each(|p| *p = None);
        state.prot.iter_mut().for_each(|p| *p = VProt::None);
        state.mapped_cnt = 0;
        state.pool().free_all();
        inner.unlock();
    }

    fn set_access_mode(&self, mode: AccessMode) {
        let inner = &*self.inner;
        match mode {
            AccessMode::Read => {
                inner.read_ahead.store(READ_AHEAD_PAGES, Ordering::Relaxed);
                inner
                    .default_prot
                    .store(prot_code(VProt::Read), Ordering::Relaxed);
            }
            AccessMode::ReadWrite => {
                inner.read_ahead.store(0, Ordering::Relaxed);
                inner
                    .default_prot
                    .store(prot_code(VProt::ReadWrite), Ordering::Relaxed);
            }
        }
    }

    fn dont_need(&self) {
        self.inner.raw.dont_need();
    }
}

impl Drop for EncMmap {
    fn drop(&mut self) {
        if self.inner.sync_on_destroy {
            if let Err(e) = self.sync() {
                error!("flush of encrypted mapping on close failed: {e}");
            }
        }

        REGISTRY.remove(&*self.inner);

        // SAFETY: releases the reservation created in `new`; all pool-page
        // mappings live inside it.
        let rc = unsafe {
            libc::munmap(
                self.inner.reservation.cast(),
                self.inner.reservation_len,
            )
        };
        if rc != 0 {
            error!("munmap of encrypted view failed: {}", std::io::Error::last_os_error());
        }

        let state = self.inner.state.get_mut();
        if let Some(mut pool) = state.pool.take() {
            pool.free_all();
            self.inner.registry.release(pool);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_pool::os_page_size;
    use std::io::Write;

    fn test_file(len: usize) -> std::fs::File {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(&vec![0u8; len]).unwrap();
        f
    }

    fn make_view(
        file: &std::fs::File,
        key: FileKey,
        pool_pages: usize,
        prefix: usize,
    ) -> EncMmap {
        let ps = os_page_size();
        let raw = FileMmap::map(file).unwrap();
        EncMmap::new(
            key,
            raw,
            ps,
            pool_pages * ps,
            false,
            prefix,
            Arc::new(PagePoolRegistry::new()),
        )
        .unwrap()
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn test_write_sync_read_back() {
        let ps = os_page_size();
        let len = 8 * ps;
        let file = test_file(len);
        let key = FileKey::from_bytes([3u8; 32]);

        let data = pattern(len);
        {
            let view = make_view(&file, key.clone(), 4, ps);
            // SAFETY: the view spans `len` writable bytes.
            unsafe {
                std::ptr::copy_nonoverlapping(data.as_ptr(), view.ptr(), len);
            }
            view.sync().unwrap();
        }

        // The backing file holds the plaintext prefix in the clear and
        // ciphertext beyond it.
        let raw = FileMmap::map(&file).unwrap();
        // SAFETY: mapping is len bytes long.
        let on_disk = unsafe { slice::from_raw_parts(raw.ptr(), len) };
        assert_eq!(&on_disk[..ps], &data[..ps]);
        assert_ne!(&on_disk[ps..], &data[ps..]);

        // A fresh view with the same key decrypts back to the pattern.
        let view = make_view(&file, key, 4, ps);
        // SAFETY: the view spans `len` readable bytes.
        let seen = unsafe { slice::from_raw_parts(view.ptr(), len) };
        assert_eq!(seen, &data[..]);
    }

    #[test]
    fn test_eviction_cycles_small_pool() {
        let ps = os_page_size();
        let len = 16 * ps;
        let file = test_file(len);
        let key = FileKey::generate();

        let data = pattern(len);
        let view = make_view(&file, key, 2, 0);
        // Writing 16 pages through a 2-page pool forces repeated eviction.
        // SAFETY: the view spans `len` writable bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), view.ptr(), len);
        }
        assert!(view.mapped_pages() <= 2);
        view.sync().unwrap();

        // SAFETY: the view spans `len` readable bytes.
        let seen = unsafe { slice::from_raw_parts(view.ptr(), len) };
        assert_eq!(seen, &data[..]);
    }

    #[test]
    fn test_memcpy_across_page_boundary_two_page_pool() {
        let ps = os_page_size();
        let len = 8 * ps;
        let file = test_file(len);
        let view = make_view(&file, FileKey::generate(), 2, 0);

        let chunk = pattern(64);
        for page in 0..7 {
            // Straddle every page boundary with a single copy.
            let at = (page + 1) * ps - 32;
            // SAFETY: at + 64 <= len.
            unsafe {
                std::ptr::copy_nonoverlapping(chunk.as_ptr(), view.ptr().add(at), chunk.len());
                let got = slice::from_raw_parts(view.ptr().add(at), chunk.len());
                assert_eq!(got, &chunk[..]);
            }
        }
    }

    #[test]
    fn test_set_key_discards_mappings() {
        let ps = os_page_size();
        let len = 4 * ps;
        let file = test_file(len);
        let view = make_view(&file, FileKey::generate(), 4, 0);

        // SAFETY: in-bounds write faults a page in.
        unsafe { view.ptr().write(0x77) };
        assert!(view.mapped_pages() >= 1);

        view.set_key(&FileKey::generate());
        assert_eq!(view.mapped_pages(), 0);
    }

    #[test]
    fn test_read_mode_reads_ahead() {
        let ps = os_page_size();
        let len = 8 * ps;
        let file = test_file(len);
        let view = make_view(&file, FileKey::generate(), 4, 0);

        view.set_access_mode(AccessMode::Read);
        // SAFETY: in-bounds read; volatile so the fault actually happens.
        let _ = unsafe { view.ptr().read_volatile() };
        // One fault pulled in as many pages as the pool allows.
        assert_eq!(view.mapped_pages(), 4);
        view.set_access_mode(AccessMode::ReadWrite);
    }
}
