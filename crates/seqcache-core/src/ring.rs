//! The ring-buffer storage engine.
//!
//! One backing file holds a 4 KiB preamble, a reserved header slot, and
//! the ring body. Buffers are appended at `next` and reclaimed from
//! `first`; when the tail cannot fit an allocation the ring rolls over to
//! `start`, leaving a trailing gap (`size_trail`) that becomes usable once
//! `first` wraps past it. At most two live segments exist at any time.
//!
//! The allocator never blocks: when space runs short it discards released
//! buffers from the head of the seqno order, and fails the allocation the
//! moment it meets a buffer that is still held or still wanted. Recovery
//! rebuilds the seqno index after a crash by scanning the file for valid
//! header chains.
//!
//! All methods expect external serialization (see
//! [`Cache`](crate::cache::Cache)); payload pointers handed out remain
//! valid without any lock until the buffer is discarded.

use std::fs::OpenOptions;
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;
use xxhash_rust::xxh3::xxh3_128;

use seqcache_mem::cipher::{self, FileKey};
use seqcache_mem::keys::{master_key_name, MasterKeyProvider};
use seqcache_mem::{AccessMode, MemMap, MmapFactory};

use crate::config::CacheConfig;
use crate::header::{
    align_size, header_at, header_of, BufferHeader, Seqno, Store, ALIGNMENT, HEADER_SIZE,
    SEQNO_ILL, SEQNO_NONE,
};
use crate::preamble::{EncryptionInfo, Preamble, PREAMBLE_LEN, VERSION};
use crate::seqno_index::SeqnoIndex;
use crate::CacheError;

/// Bytes reserved between the preamble and the ring body.
pub const HEADER_SLOT: usize = 64;

/// Encryption metadata format version.
const ENC_VERSION: u32 = 1;

/// Largest representable buffer (the header size field is 32-bit).
const MAX_BUFFER_SIZE: usize = (u32::MAX as usize) - 2 * ALIGNMENT;

/// Distinguishes ring instances within one process; stamped into every
/// buffer's `ctx` field and checked during recovery walks.
static NEXT_TAG: AtomicU64 = AtomicU64::new(1);

/// The ring-buffer storage engine over one backing file.
pub struct RingBuffer {
    mmap: Box<dyn MemMap>,
    /// First byte of the ring body.
    start: *mut u8,
    /// One past the last byte usable for buffer data (the clear marker at
    /// `next` may still extend into the trailing header slack).
    end: *mut u8,
    /// Oldest live buffer.
    first: *mut u8,
    /// Position of the next allocation; always holds a clear marker.
    next: *mut u8,
    index: SeqnoIndex,
    gid: Uuid,
    size_cache: usize,
    size_free: usize,
    size_used: usize,
    size_trail: usize,
    /// High-water mark of file bytes ever occupied, for pool sizing.
    max_used: usize,
    tag: u64,
    open: bool,

    encrypt: bool,
    provider: Option<Arc<dyn MasterKeyProvider>>,
    mk_id: u32,
    mk_const_id: Uuid,
    mk_uuid: Uuid,
    /// Master-key-wrapped file key, base64, as stored in the preamble.
    file_key_wrapped: String,
}

// SAFETY: the raw pointers all target the owned mapping; cross-thread use
// is serialized by the Cache facade.
unsafe impl Send for RingBuffer {}

impl RingBuffer {
    /// Opens (or creates) the cache file described by `config`.
    ///
    /// With `config.recover` set, cached writesets of a previous process
    /// are rebuilt from the file; any inconsistency falls back to a full
    /// reset rather than an error. Encryption requires a key `provider`.
    ///
    /// # Errors
    ///
    /// Propagates file, mapping and key-provider failures. A missing
    /// master key with encryption on is fatal
    /// ([`CacheError::EncryptionUnavailable`]).
    pub fn open(
        config: &CacheConfig,
        factory: &MmapFactory,
        gid: Uuid,
        provider: Option<Arc<dyn MasterKeyProvider>>,
    ) -> Result<RingBuffer, CacheError> {
        config.validate()?;
        let encrypt = config.encryption.enabled && provider.is_some();

        let file_len = (PREAMBLE_LEN + HEADER_SLOT + config.size + HEADER_SIZE) as u64;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&config.name)?;
        if file.metadata()?.len() != file_len {
            file.set_len(file_len)?;
        }

        let mmap = factory.create(
            &file,
            encrypt,
            config.encryption.cache_page_size,
            config.encryption.cache_size,
            false,
            PREAMBLE_LEN,
        )?;
        drop(file); // the mapping keeps the file open

        let base = mmap.ptr();
        let map_len = mmap.len();
        // SAFETY: the file was sized to cover preamble + slot + body.
        let start = unsafe { base.add(PREAMBLE_LEN + HEADER_SLOT) };
        let end = unsafe { base.add(map_len) };
        let size_cache = map_len - PREAMBLE_LEN - HEADER_SLOT - HEADER_SIZE;

        let mut rb = RingBuffer {
            mmap,
            start,
            end,
            first: start,
            next: start,
            index: SeqnoIndex::new(),
            gid,
            size_cache,
            size_free: size_cache,
            size_used: 0,
            size_trail: 0,
            max_used: PREAMBLE_LEN + HEADER_SLOT + HEADER_SIZE,
            tag: NEXT_TAG.fetch_add(1, Ordering::Relaxed),
            open: true,
            encrypt,
            provider,
            mk_id: 0,
            mk_const_id: Uuid::nil(),
            mk_uuid: Uuid::nil(),
            file_key_wrapped: String::new(),
        };

        rb.open_preamble(config.recover)?;
        // SAFETY: next is in-bounds; the terminator invariant starts here.
        unsafe { header_at(rb.next).clear() };
        Ok(rb)
    }

    /// Closes the cache gracefully: writes a synced preamble and flushes.
    /// Called from `Drop`; explicit use allows error inspection.
    ///
    /// # Errors
    ///
    /// Propagates flush failures.
    pub fn close(&mut self) -> Result<(), CacheError> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.write_preamble(true)?;
        self.mmap.sync()?;
        Ok(())
    }

    // -- accessors ---------------------------------------------------------

    /// The seqno index.
    #[must_use]
    pub fn index(&self) -> &SeqnoIndex {
        &self.index
    }

    /// Payload pointer of the buffer ordered as `seqno`, if cached.
    #[must_use]
    pub fn get(&self, seqno: Seqno) -> Option<NonNull<u8>> {
        self.index.get(seqno)
    }

    /// Usable ring capacity in bytes.
    #[must_use]
    pub fn size_cache(&self) -> usize {
        self.size_cache
    }

    /// Bytes immediately reclaimable.
    #[must_use]
    pub fn size_free(&self) -> usize {
        self.size_free
    }

    /// Bytes occupied by buffers not yet discarded.
    #[must_use]
    pub fn size_used(&self) -> usize {
        self.size_used
    }

    /// High-water mark of file bytes ever occupied.
    #[must_use]
    pub fn max_used(&self) -> usize {
        self.max_used
    }

    /// The group id the cached seqnos belong to.
    #[must_use]
    pub fn gid(&self) -> Uuid {
        self.gid
    }

    fn mapping_ptr(&self) -> *mut u8 {
        self.mmap.ptr()
    }

    fn offset_of(&self, p: *mut u8) -> usize {
        p as usize - self.mapping_ptr() as usize
    }

    fn assert_sizes(&self) {
        debug_assert_eq!(self.size_free + self.size_used, self.size_cache);
    }

    // -- allocation --------------------------------------------------------

    /// Allocates a buffer of `size` total bytes (header included, aligned
    /// up) and returns its payload pointer, or `None` when the space
    /// cannot be made available. A single buffer never exceeds half the
    /// ring. The payload is not zeroed.
    pub fn malloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        let size = align_size(size);
        if size <= HEADER_SIZE || size > self.size_cache / 2 || size > MAX_BUFFER_SIZE {
            return None;
        }
        let bh_pos = self.get_new_buffer(size)?;
        // SAFETY: the buffer spans size > HEADER_SIZE bytes from bh_pos.
        NonNull::new(unsafe { bh_pos.add(HEADER_SIZE) })
    }

    /// Grows or shrinks the buffer at `ptr` to `size` total bytes,
    /// preserving the payload prefix. Growing the latest allocation
    /// extends it in place; otherwise the payload moves. Returns `None`
    /// (leaving the buffer untouched) when the request cannot be
    /// satisfied.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live payload pointer from this ring's `malloc`,
    /// not yet ordered or freed.
    pub unsafe fn realloc(&mut self, ptr: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
        let size = align_size(size);
        if size > self.size_cache / 2 || size > MAX_BUFFER_SIZE {
            return None;
        }

        let old_size = header_of(ptr).size();
        if size <= old_size {
            return Some(ptr);
        }
        let delta = size - old_size;

        let bh_pos = ptr.as_ptr().sub(HEADER_SIZE);
        let adjacent = bh_pos.add(old_size);
        if adjacent == self.next {
            // Try to extend in place by allocating the adjacent bytes.
            let trail_saved = self.size_trail;
            match self.get_new_buffer(delta) {
                Some(grabbed) if grabbed == adjacent => {
                    header_of(ptr).grow(delta);
                    debug_assert_eq!(bh_pos.add(size), self.next);
                    return Some(ptr);
                }
                Some(_elsewhere) => {
                    // The slot finder wrapped; give the allocation back.
                    self.next = adjacent;
                    header_at(self.next).clear();
                    self.size_used -= delta;
                    self.size_free += delta;
                    if self.next < self.first {
                        self.size_trail = trail_saved;
                    }
                }
                None => {}
            }
        }

        let new_ptr = self.malloc(size)?;
        ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), old_size - HEADER_SIZE);
        self.free(ptr);
        self.assert_sizes();
        Some(new_ptr)
    }

    /// Releases the buffer at `ptr`. An unordered buffer is discarded on
    /// the spot; an ordered one stays cached until eviction reaches it.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live payload pointer from this ring's `malloc`,
    /// released exactly once.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        self.free_bh(header_of(ptr));
    }

    fn free_bh(&mut self, bh: &mut BufferHeader) {
        bh.set_released();
        if bh.seqno() == SEQNO_NONE {
            self.discard_bh(bh);
        }
    }

    /// Marks `bh` discarded and reclaims its bytes.
    fn discard_bh(&mut self, bh: &mut BufferHeader) {
        debug_assert!(bh.is_released());
        bh.set_empty();
        self.size_free += bh.size();
        self.size_used -= bh.size();
    }

    /// Orders the buffer at `ptr` as `seqno` and records it in the index.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live payload pointer from this ring's `malloc`,
    /// not ordered before.
    ///
    /// # Errors
    ///
    /// The seqno must exceed the current index back.
    pub unsafe fn assign_seqno(&mut self, ptr: NonNull<u8>, seqno: Seqno) -> Result<(), CacheError> {
        let bh = header_of(ptr);
        debug_assert_eq!(bh.seqno(), SEQNO_NONE);
        self.index.insert(seqno, ptr)?;
        bh.set_seqno(seqno);
        Ok(())
    }

    /// Discards every indexed buffer with seqno at most `seqno`, in
    /// order, stopping at the first buffer that is not yet released. Never
    /// reorders: one pinned old buffer holds everything behind it.
    pub fn seqno_release(&mut self, seqno: Seqno) {
        let _ = self.discard_seqno(seqno);
    }

    /// Eviction core shared by the allocator and `seqno_release`. Returns
    /// false when it stopped early at an unreleased buffer.
    fn discard_seqno(&mut self, seqno: Seqno) -> bool {
        while let Some(front) = self.index.index_front() {
            if front > seqno {
                break;
            }
            let ptr = self.index.get(front).expect("index front entry is present");
            // SAFETY: index entries point at live buffers.
            let bh = unsafe { header_of(ptr) };
            if !bh.is_released() {
                return false;
            }
            self.index.erase(front);
            match bh.store() {
                Some(Store::Ring) => self.discard_bh(bh),
                Some(Store::Mem | Store::Page) => {
                    // Overflow stores reclaim their own memory; dropping
                    // the index entry detaches the buffer.
                }
                None => {
                    tracing::error!("corrupt buffer header in seqno index, aborting");
                    std::process::abort();
                }
            }
        }
        true
    }

    /// The slot finder: makes room for `size` aligned bytes plus the next
    /// clear marker and writes the new buffer header. Returns the header
    /// position.
    fn get_new_buffer(&mut self, size: usize) -> Option<*mut u8> {
        debug_assert_eq!(size % ALIGNMENT, 0);
        self.assert_sizes();
        debug_assert!(unsafe { header_at(self.next) }.is_clear());

        let size_next = size + HEADER_SIZE;
        let mut ret = self.next;

        if ret >= self.first {
            debug_assert_eq!(self.size_trail, 0);
            let end_space = self.end as usize - ret as usize;
            if end_space >= size_next {
                return Some(self.place(ret, size));
            }
            // No room at the tail: roll over.
            self.size_trail = end_space;
            ret = self.start;
        }

        debug_assert!(ret <= self.first);
        loop {
            let gap = self.first as usize - ret as usize;
            if gap >= size_next {
                break;
            }

            // Try to discard the oldest buffer for more space.
            // SAFETY: first always points at a header inside the body.
            let bh = unsafe { header_at(self.first) };
            let seqno = bh.seqno();
            if !bh.is_released() || (seqno > 0 && !self.discard_seqno(seqno)) {
                // Cannot free any more space; undo a wrap if one happened.
                if self.next >= self.first {
                    self.size_trail = 0;
                }
                self.assert_sizes();
                return None;
            }
            debug_assert!(self.first != self.next);
            // The buffer is discarded by now (free or discard_seqno).
            debug_assert!(unsafe { header_at(self.first) }.is_empty());

            let advanced = unsafe { self.first.add(header_at(self.first).size()) };
            self.first = advanced;

            if unsafe { header_at(self.first) }.size() == 0 {
                // Segment boundary: wrap first and retry the tail.
                debug_assert!(self.first >= ret);
                self.first = self.start;
                let end_space = self.end as usize - ret as usize;
                if end_space >= size_next {
                    self.size_trail = 0;
                    break;
                }
                self.size_trail = end_space;
                ret = self.start;
            }
            debug_assert!(ret <= self.first);
        }

        Some(self.place(ret, size))
    }

    /// Writes the header for a found slot and re-establishes the
    /// terminator invariant.
    fn place(&mut self, ret: *mut u8, size: usize) -> *mut u8 {
        debug_assert_eq!(ret as usize % ALIGNMENT, 0);
        self.size_used += size;
        debug_assert!(self.size_free >= size);
        self.size_free -= size;

        // SAFETY: the slot finder guaranteed size + HEADER_SIZE bytes.
        unsafe {
            let bh = header_at(ret);
            bh.init(u32::try_from(size).expect("buffer size fits u32"), Store::Ring, self.tag);
            self.next = ret.add(size);
            debug_assert!(self.next.add(HEADER_SIZE) <= self.end);
            header_at(self.next).clear();
        }

        let high = self.offset_of(self.next) + HEADER_SIZE;
        if high > self.max_used {
            self.max_used = high;
        }
        self.assert_sizes();
        ret
    }

    // -- seqno lifecycle ---------------------------------------------------

    /// Invalidates the seqno of every ring-owned ordered buffer, seeks the
    /// new `first` past everything released, and recomputes the size
    /// accounting. With `zero_out` the freed regions are wiped and synced.
    ///
    /// Precondition (unsynchronized by design): no service-worker action
    /// is in flight.
    ///
    /// # Errors
    ///
    /// Propagates flush failures.
    pub fn seqno_reset(&mut self, zero_out: bool) -> Result<(), CacheError> {
        self.write_preamble(false)?;

        if self.size_cache == self.size_free {
            self.index.clear(SEQNO_NONE);
            return Ok(());
        }

        // Invalidate all ordered ring buffers so a restart cannot recover
        // them; remember the last one in file order of the index.
        let mut last_ring: Option<NonNull<u8>> = None;
        for (_, p) in self.index.iter() {
            // SAFETY: index entries point at live buffers.
            let bh = unsafe { header_of(p) };
            if bh.store() == Some(Store::Ring) {
                debug_assert!(bh.is_released());
                bh.set_seqno(SEQNO_NONE);
                last_ring = Some(p);
            }
        }
        self.index.clear(SEQNO_NONE);

        let Some(last) = last_ring else {
            return Ok(()); // no ordered ring buffers
        };

        let old_free = self.size_free;
        debug_assert!(self.size_trail == 0 || self.first > self.next);

        // Seek the first unreleased buffer from the last seqno'd one on.
        // SAFETY: walks the header chain, which is terminated at next.
        let mut pos = unsafe { last.as_ptr().sub(HEADER_SIZE) };
        unsafe {
            loop {
                let bh = header_at(pos);
                if bh.size() == 0 && pos != self.next {
                    pos = self.start; // rollover
                    continue;
                }
                if !bh.is_released() {
                    break; // the clear marker at next is never released
                }
                pos = pos.add(bh.size());
            }
        }
        self.first = pos;

        if self.first == self.next {
            debug!("seqno reset found an empty ring, full reset");
            return self.reset();
        }

        self.estimate_space(zero_out)?;
        debug!(
            discarded = self.size_free - old_free,
            "seqno reset discarded released buffers"
        );

        // Some released buffers may still be locked inside unreleased
        // aborted local actions; discard every ordered leftover up to
        // next.
        let mut total: usize = 1;
        let mut locked: usize = 0;
        // SAFETY: bounded walk over the terminated header chain.
        unsafe {
            let mut pos = {
                let bh = header_at(self.first);
                debug_assert!(!bh.is_released());
                debug_assert_eq!(bh.seqno(), SEQNO_NONE);
                self.first.add(bh.size())
            };
            while pos != self.next {
                let bh = header_at(pos);
                if bh.size() > 0 {
                    total += 1;
                    if bh.seqno() != SEQNO_NONE {
                        debug_assert!(bh.is_released());
                        self.discard_bh(bh);
                        locked += 1;
                    } else {
                        debug_assert!(!bh.is_released());
                    }
                    pos = pos.add(bh.size());
                } else {
                    pos = self.start; // rollover
                }
            }
        }
        debug!(locked, total, "seqno reset scanned live buffers");
        self.assert_sizes();

        // Keep a future recovery from rescanning the dead region before
        // first.
        if self.next > self.first && self.first > self.start {
            // SAFETY: start is in-bounds.
            unsafe { header_at(self.start).clear() };
        }
        Ok(())
    }

    /// Hard reset: drops everything and zeroes the ring body.
    ///
    /// # Errors
    ///
    /// Propagates flush failures.
    pub fn reset(&mut self) -> Result<(), CacheError> {
        self.write_preamble(false)?;

        let mine: Vec<Seqno> = self
            .index
            .iter()
            .filter(|(_, p)| {
                // SAFETY: index entries point at live buffers.
                let bh = unsafe { header_of(*p) };
                bh.store() == Some(Store::Ring) && bh.ctx() == self.tag
            })
            .map(|(s, _)| s)
            .collect();
        for s in mine {
            self.index.erase(s);
        }

        self.first = self.start;
        self.next = self.start;
        self.size_free = self.size_cache;
        self.size_used = 0;
        self.size_trail = 0;

        // A reset usually accompanies a new group identity; stale seqnos
        // in the body would be misattributed to it on a later recovery.
        info!("complete reset of the writeset cache");
        // SAFETY: wipes exactly the ring body; re-creates the terminator.
        unsafe {
            ptr::write_bytes(self.start, 0, self.size_cache);
            header_at(self.next).clear();
        }
        self.mmap.sync()?;
        Ok(())
    }

    /// Recomputes `size_free`/`size_used`/`size_trail` from the segment
    /// geometry, optionally wiping the free regions.
    fn estimate_space(&mut self, zero_out: bool) -> Result<(), CacheError> {
        if self.first < self.next {
            // start    first ######## next        end
            self.size_used = self.next as usize - self.first as usize;
            self.size_free = self.size_cache - self.size_used;
            self.size_trail = 0;
            if zero_out {
                // SAFETY: both ranges lie inside the body.
                unsafe {
                    ptr::write_bytes(self.next, 0, self.end as usize - self.next as usize);
                    ptr::write_bytes(self.start, 0, self.first as usize - self.start as usize);
                }
                self.mmap.sync()?;
            }
        } else {
            // start ## next        first ##### (trail) end
            debug_assert!(self.size_trail > 0);
            self.size_free =
                (self.first as usize - self.next as usize) + self.size_trail - HEADER_SIZE;
            self.size_used = self.size_cache - self.size_free;
            if zero_out {
                // SAFETY: both ranges lie inside the body.
                unsafe {
                    ptr::write_bytes(self.end.sub(self.size_trail), 0, self.size_trail);
                    ptr::write_bytes(self.next, 0, self.first as usize - self.next as usize);
                }
                self.mmap.sync()?;
            }
        }
        self.assert_sizes();
        Ok(())
    }

    // -- preamble ----------------------------------------------------------

    fn write_preamble(&mut self, synced: bool) -> Result<(), CacheError> {
        let (seqno_min, seqno_max, offset) = if synced && !self.index.is_empty() {
            (
                self.index.index_front().unwrap_or(SEQNO_ILL),
                self.index.index_back().unwrap_or(SEQNO_ILL),
                i64::try_from(self.offset_of(self.first)).unwrap_or(-1),
            )
        } else {
            (SEQNO_ILL, SEQNO_ILL, -1)
        };

        let p = Preamble {
            version: VERSION,
            gid: self.gid,
            seqno_min,
            seqno_max,
            offset,
            synced,
            enc: EncryptionInfo {
                version: ENC_VERSION,
                encrypted: self.encrypt,
                mk_id: self.mk_id,
                mk_const_id: self.mk_const_id,
                mk_uuid: self.mk_uuid,
                file_key: self.file_key_wrapped.clone(),
                crc: 0, // render() recomputes
            },
        };
        let block = p.render();
        // SAFETY: the mapping always covers the preamble block.
        unsafe {
            ptr::copy_nonoverlapping(block.as_ptr(), self.mapping_ptr(), PREAMBLE_LEN);
        }
        self.mmap.sync_range(0, PREAMBLE_LEN)?;
        Ok(())
    }

    fn open_preamble(&mut self, do_recover: bool) -> Result<(), CacheError> {
        // SAFETY: the mapping always covers the preamble block.
        let parsed =
            Preamble::parse(unsafe { slice::from_raw_parts(self.mapping_ptr(), PREAMBLE_LEN) });
        let version = parsed.sane_version();

        let mut offset = parsed.offset;
        let map_len = i64::try_from(self.mmap.len()).unwrap_or(i64::MAX);
        if offset < -1
            || offset.saturating_add(HEADER_SIZE as i64) > map_len
            || (version >= 2 && offset >= 0 && offset % ALIGNMENT as i64 != 0)
        {
            warn!(offset, "bogus offset in cache preamble, assuming unknown");
            offset = -1;
        }

        if parsed.gid != Uuid::nil() {
            self.gid = parsed.gid;
        }
        self.mk_id = parsed.enc.mk_id;
        self.mk_const_id = parsed.enc.mk_const_id;
        self.mk_uuid = parsed.enc.mk_uuid;
        self.file_key_wrapped = parsed.enc.file_key.clone();

        let mut force_reset = false;

        if self.mk_const_id == Uuid::nil() {
            self.mk_const_id = Uuid::new_v4();
            info!(id = %self.mk_const_id, "generated new cache id");
        }

        if parsed.enc.encrypted != self.encrypt {
            info!(
                was = parsed.enc.encrypted,
                now = self.encrypt,
                "switching encryption mode forces a cache reset"
            );
            self.file_key_wrapped.clear();
            self.mk_id = 0;
            self.mk_uuid = Uuid::nil();
            force_reset = true;
        }

        if self.encrypt {
            if !parsed.enc.crc_valid() {
                warn!(
                    stored = parsed.enc.crc,
                    "encryption metadata CRC missing or mismatched"
                );
                // Cannot trust the lineage; a fresh file key below forces
                // a reset.
                self.file_key_wrapped.clear();
                self.mk_id = 0;
            }
            force_reset |= self.setup_file_key()?;
        }

        info!(
            version,
            gid = %self.gid,
            seqno_min = parsed.seqno_min,
            seqno_max = parsed.seqno_max,
            offset,
            synced = parsed.synced,
            encrypted = self.encrypt,
            mk_id = self.mk_id,
            "opened cache preamble"
        );

        if force_reset {
            info!("cache forced reset");
            self.reset()?;
        } else if do_recover {
            if self.gid == Uuid::nil() {
                info!("skipped cache recovery: history uuid unknown");
            } else {
                info!(gid = %self.gid, offset, "recovering cache ring buffer");
                let body_offset = if offset >= (PREAMBLE_LEN + HEADER_SLOT) as i64 {
                    offset - (PREAMBLE_LEN + HEADER_SLOT) as i64
                } else {
                    -1
                };
                self.recover(body_offset, version)?;
            }
        }

        self.write_preamble(false)
    }

    /// Resolves the master key and installs the file key into the
    /// mapping. Returns whether a reset became necessary (fresh file
    /// key).
    fn setup_file_key(&mut self) -> Result<bool, CacheError> {
        let provider = self
            .provider
            .clone()
            .expect("encryption is only enabled with a provider");

        let mut master: Option<FileKey>;
        let mut allow_retry = true;
        loop {
            if self.mk_id == 0 || self.mk_uuid == Uuid::nil() {
                // No usable lineage: start a fresh one, a single attempt.
                self.mk_uuid = Uuid::new_v4();
                self.mk_id = 1;
                let name = master_key_name(&self.mk_const_id, &self.mk_uuid, self.mk_id);
                info!(%name, "master key does not exist, generating a new one");
                master = generate_new_master_key(&*provider, &name);
                allow_retry = false;
            } else {
                let name = master_key_name(&self.mk_const_id, &self.mk_uuid, self.mk_id);
                master = provider.get_key(&name);
                let next_name = master_key_name(&self.mk_const_id, &self.mk_uuid, self.mk_id + 1);
                if master.is_none() {
                    info!(
                        %name,
                        "cache is encrypted with a missing master key, generating a new one"
                    );
                } else if provider.get_key(&next_name).is_some() {
                    // An aborted rotation or an old backup: keys beyond the
                    // recorded id may be compromised, start over.
                    info!(
                        %name,
                        %next_name,
                        "successor master key exists, starting a fresh lineage"
                    );
                    master = None;
                }
            }

            if master.is_some() || !allow_retry {
                break;
            }
            self.mk_id = 0;
            self.file_key_wrapped.clear();
        }

        let Some(master) = master else {
            return Err(CacheError::EncryptionUnavailable(
                "master key not generated or not found; check that the keyring is loaded \
                 or disable cache encryption"
                    .into(),
            ));
        };

        let mut force_reset = false;
        let file_key = if self.file_key_wrapped.is_empty() {
            info!("file key empty, generating a new one; this forces a cache reset");
            let fk = FileKey::generate();
            self.file_key_wrapped = cipher::wrap_key(&fk, &master);
            force_reset = true;
            fk
        } else {
            match cipher::unwrap_key(&self.file_key_wrapped, &master) {
                Ok(fk) => fk,
                Err(e) => {
                    warn!("stored file key unusable ({e}), generating a new one");
                    let fk = FileKey::generate();
                    self.file_key_wrapped = cipher::wrap_key(&fk, &master);
                    force_reset = true;
                    fk
                }
            }
        };
        self.mmap.set_key(&file_key);
        Ok(force_reset)
    }

    /// Rotates the master key: wraps the file key under a freshly minted
    /// successor key and rewrites the preamble. On failure nothing
    /// changes.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::RotationFailed`] when the current key is
    /// missing or the successor cannot be minted.
    pub fn rotate_master_key(&mut self) -> Result<(), CacheError> {
        if !self.encrypt {
            info!("master key not rotated: cache encryption is disabled");
            return Err(CacheError::RotationFailed("encryption is disabled".into()));
        }
        let provider = self
            .provider
            .clone()
            .expect("encryption is only enabled with a provider");

        let old_name = master_key_name(&self.mk_const_id, &self.mk_uuid, self.mk_id);
        let Some(old_master) = provider.get_key(&old_name) else {
            return Err(CacheError::RotationFailed(format!(
                "current master key {old_name} is missing"
            )));
        };
        let file_key = cipher::unwrap_key(&self.file_key_wrapped, &old_master)
            .map_err(|e| CacheError::RotationFailed(e.to_string()))?;

        let new_name = master_key_name(&self.mk_const_id, &self.mk_uuid, self.mk_id + 1);
        let Some(new_master) = generate_new_master_key(&*provider, &new_name) else {
            info!(%new_name, "generation of a new master key failed");
            return Err(CacheError::RotationFailed(format!(
                "could not mint master key {new_name}"
            )));
        };

        self.mk_id += 1;
        self.file_key_wrapped = cipher::wrap_key(&file_key, &new_master);
        self.write_preamble(false)?;
        info!(name = %new_name, "rotated cache master key");
        Ok(())
    }

    // -- recovery ----------------------------------------------------------

    /// Whether `pos` starts a believable buffer: magic passes, the size is
    /// sane, and the following header also passes the magic test.
    fn scan_test(&self, pos: *mut u8, segment_end: *mut u8) -> bool {
        // SAFETY: callers keep pos within [start, segment_end].
        unsafe {
            let bh = header_at(pos);
            bh.test()
                && bh.size() > 0
                && pos.add(bh.size()) <= segment_end
                && header_at(pos.add(bh.size())).test()
        }
    }

    /// Walks the file and repopulates the index, locating both segments.
    /// Returns the highest seqno invalidated by irreconcilable
    /// collisions.
    #[allow(clippy::too_many_lines)]
    fn scan(&mut self, offset: i64, step: usize) -> Seqno {
        let mut segment_scans = 0u32;
        let mut seqno_max: Seqno = SEQNO_ILL;
        let mut collisions: usize = 0;
        let mut erase_up_to: Seqno = -1;

        let mut segment_start = self.start;
        // SAFETY: the body always has HEADER_SIZE of slack before end.
        let mut segment_end = unsafe { self.end.sub(HEADER_SIZE) };

        self.mmap.set_access_mode(AccessMode::Read);

        if offset >= 0 {
            debug_assert_eq!(offset as usize % step, 0);
            // SAFETY: offset was validated against the mapping length.
            let hinted = unsafe { self.start.add(offset as usize) };
            if unsafe { hinted.add(HEADER_SIZE) } < segment_end {
                segment_start = hinted;
            } else {
                // The hinted first segment is gone entirely.
                segment_scans = 1;
            }
        }

        'segments: while segment_scans < 2 {
            segment_scans += 1;
            let mut pos = segment_start;

            while self.scan_test(pos, segment_end) {
                // SAFETY: scan_test vouched for a full header at pos.
                let bh = unsafe { header_at(pos) };
                bh.set_released();
                bh.set_ctx(self.tag);
                let size = bh.size();
                let seqno = bh.seqno();

                if seqno > 0 {
                    let collision = seqno <= seqno_max && self.index.get(seqno).is_some();
                    if collision {
                        collisions += 1;
                        if let Some(bad) = self.resolve_collision(pos, seqno) {
                            erase_up_to = erase_up_to.max(bad);
                        }
                    } else {
                        // SAFETY: payload directly follows the header.
                        let payload =
                            NonNull::new(unsafe { pos.add(HEADER_SIZE) }).expect("non-null");
                        if let Err(e) = self.index.insert(seqno, payload) {
                            warn!(
                                seqno,
                                "failed to map writeset during scan ({e}), aborting recovery"
                            );
                            // Everything recovered so far is useless if the
                            // latest writesets are lost; force a reset.
                            self.index.clear(SEQNO_ILL);
                            // SAFETY: pos holds a full header.
                            unsafe { header_at(pos).clear() };
                            self.next = pos;
                            break 'segments;
                        }
                        seqno_max = seqno_max.max(seqno);
                    }
                }

                // SAFETY: scan_test bounded pos + size by segment_end.
                pos = unsafe { pos.add(size) };
            }

            // SAFETY: pos is within the body (scan_test stopped here).
            let tail = unsafe { header_at(pos) };
            if !tail.is_clear() {
                if segment_start == self.start && pos != self.first {
                    warn!(
                        last_seqno = seqno_max,
                        "could not scan the last segment to its end, latest events may be missing"
                    );
                }
                // Close the segment.
                tail.clear();
            }

            if offset > 0 && segment_start == unsafe { self.start.add(offset as usize) } {
                // Scanned the hinted first segment; jump to the second.
                debug_assert_eq!(segment_scans, 1);
                self.first = segment_start;
                self.size_trail = self.end as usize - pos as usize;
                // At least one header separates the segments.
                // SAFETY: segment_start is at least HEADER_SIZE into the body
                // here, since offset > 0.
                segment_end = unsafe { segment_start.sub(HEADER_SIZE) };
                segment_start = self.start;
            } else if offset < 0 && segment_start == self.start {
                // Unknown offset: the scan from start covered the newest
                // segment; probe forward for the start of the older one.
                debug_assert_eq!(segment_scans, 1);
                self.next = pos;
                // SAFETY: probing stays below end.
                unsafe {
                    pos = pos.add(HEADER_SIZE);
                    while pos.add(HEADER_SIZE) < self.end && !self.scan_test(pos, segment_end) {
                        pos = pos.add(step);
                    }
                }
                if self.scan_test(pos, segment_end) {
                    // A believable buffer: the older segment starts here.
                    segment_start = pos;
                    self.first = pos;
                } else {
                    // No second segment; it was a single segment at start.
                    self.first = self.start;
                    break 'segments;
                }
            } else if offset == 0 && segment_start == self.start {
                // Single known segment.
                debug_assert_eq!(segment_scans, 1);
                self.first = segment_start;
                self.next = pos;
                break 'segments;
            } else {
                debug_assert_eq!(segment_scans, 2);
                debug_assert_ne!(offset, 0);

                if offset >= 0 {
                    self.next = pos; // end of the second scanned segment
                }
                if offset < 0 && segment_start > self.start {
                    // The trailing segment was scanned last.
                    self.size_trail = self.end as usize - pos as usize;
                } else if offset > 0 && self.next > self.first {
                    self.size_trail = 0;
                }
            }
        }

        debug_assert!(unsafe { header_at(self.next) }.is_clear());
        if collisions > 0 {
            info!(collisions, "seqno collisions found during cache scan");
        }
        self.mmap.set_access_mode(AccessMode::ReadWrite);
        erase_up_to
    }

    /// Handles a second buffer claiming an already-indexed seqno. Keeps
    /// one copy when metadata and payload hash agree, otherwise empties
    /// both and reports the seqno so that everything below it is
    /// discarded.
    fn resolve_collision(&mut self, pos: *mut u8, seqno: Seqno) -> Option<Seqno> {
        let old_ptr = self.index.get(seqno);
        // SAFETY: pos holds a scanned header; old_ptr is an index entry.
        unsafe {
            let new_bh = header_at(pos);
            let old_bh = old_ptr.map(|p| header_of(p));

            let same_meta = old_bh.as_ref().is_some_and(|old| {
                old.seqno() == new_bh.seqno()
                    && old.size() == new_bh.size()
                    && old.flags() == new_bh.flags()
            });

            // Payload digests decide between the copies; they stay zero
            // when the metadata already disagrees.
            let mut cs_old: u128 = 0;
            let mut cs_new: u128 = 0;
            if same_meta {
                let old = old_ptr.expect("same_meta implies an old entry");
                // same_meta implies equal sizes.
                let len = new_bh.size() - HEADER_SIZE;
                cs_old = xxh3_128(slice::from_raw_parts(old.as_ptr(), len));
                cs_new = xxh3_128(slice::from_raw_parts(pos.add(HEADER_SIZE), len));
            }
            let same_data = same_meta && cs_old == cs_new;

            warn!(
                seqno,
                new_ptr = ?pos,
                new_cs = %format_args!("{cs_new:032x}"),
                old_ptr = ?old_ptr,
                old_cs = %format_args!("{cs_old:032x}"),
                "attempt to reuse the same seqno"
            );

            // The new copy is unusable either way.
            new_bh.set_empty();
            debug_assert!(new_bh.is_released());

            match old_bh {
                Some(old) if !same_data => {
                    // No way to choose which copy is correct.
                    old.set_empty();
                    debug_assert!(old.is_released());
                    warn!(seqno, "contents differ, discarding both copies");
                    Some(seqno)
                }
                Some(_) => {
                    info!(
                        seqno,
                        discarded = ?pos,
                        "contents are the same, keeping the previously scanned copy"
                    );
                    None
                }
                None => None,
            }
        }
    }

    /// Rebuilds cache state after a crash: scan, keep the longest gapless
    /// seqno suffix, trim the segment pointers, release transients. Any
    /// inconsistency degrades to a full reset.
    #[allow(clippy::too_many_lines)]
    fn recover(&mut self, offset: i64, version: u32) -> Result<(), CacheError> {
        let step = if version > 0 { ALIGNMENT } else { 1 };
        // Lowest seqno untainted by collisions.
        let lowest = self.scan(offset, step) + 1;

        if self.index.is_empty() {
            info!("cache recovery found nothing usable, full reset");
            return self.reset();
        }

        debug_assert!(self.next <= self.first || self.size_trail == 0);
        debug_assert!(self.next > self.first || self.size_trail > 0);

        let seqno_max = self.index.index_back().expect("index is non-empty");
        if lowest >= seqno_max {
            // Collisions reached the newest writeset; nothing trustworthy.
            self.index.clear(SEQNO_NONE);
            info!("cache recovery failed, full reset");
            return self.reset();
        }

        // Find the longest gapless suffix, walking back from seqno_max.
        let mut seqno_min = seqno_max;
        {
            let back = self.index.back().expect("index is non-empty");
            // SAFETY: index entries point at live buffers.
            if unsafe { header_of(back) }.seqno() != seqno_max {
                self.index.clear(SEQNO_NONE);
                info!("cache recovery failed, full reset");
                return self.reset();
            }
        }
        let mut consistent = true;
        for (seqno, slot) in self.index.iter_rev_with_holes().skip(1) {
            if seqno_min <= lowest {
                break;
            }
            let Some(p) = slot else { break };
            seqno_min -= 1;
            debug_assert_eq!(seqno, seqno_min);
            // SAFETY: index entries point at live buffers.
            if unsafe { header_of(p) }.seqno() != seqno_min {
                consistent = false;
                break;
            }
        }
        if !consistent {
            self.index.clear(SEQNO_NONE);
            info!("cache recovery failed, full reset");
            return self.reset();
        }
        info!(seqno_min, seqno_max, "recovery found gapless sequence");

        if self.index.index_front().expect("non-empty") < seqno_min {
            info!(
                from = self.index.index_front().expect("non-empty"),
                to = seqno_min - 1,
                "recovery discarding seqnos below the gapless suffix"
            );
            let below: Vec<NonNull<u8>> = self
                .index
                .iter()
                .take_while(|(s, _)| *s < seqno_min)
                .map(|(_, p)| p)
                .collect();
            for p in below {
                // SAFETY: index entries point at live buffers.
                unsafe { header_of(p).set_empty() };
            }
            self.index.erase_up_to(seqno_min - 1);
        }
        debug_assert!(!self.index.is_empty());

        // Trim first forward over discarded buffers.
        // SAFETY: bounded walk; at least one seqno'd buffer exists.
        unsafe {
            let mut pos = self.first;
            while header_at(pos).is_empty() {
                pos = pos.add(header_at(pos).size());
                if header_at(pos).size() == 0 {
                    pos = self.start; // rollover
                }
            }
            self.first = pos;
        }

        // Trim next back to the end of the last seqno'd buffer.
        let back = self.index.back().expect("index is non-empty");
        let mut chain_ok = true;
        // SAFETY: chain walk from the last indexed buffer to next, with
        // corruption checks at every hop.
        unsafe {
            let mut pos = back.as_ptr().sub(HEADER_SIZE);
            let mut last_pos = pos;
            while pos != self.next {
                let bh = header_at(pos);
                if bh.size() > 0 {
                    let nxt = pos.add(bh.size());
                    if nxt > self.end.sub(HEADER_SIZE) || bh.ctx() != self.tag {
                        warn!("corrupt buffer chain while trimming the tail");
                        chain_ok = false;
                        break;
                    }
                    if bh.seqno() > 0 {
                        last_pos = pos;
                    }
                    pos = nxt;
                } else {
                    pos = self.start; // rollover
                }
            }
            if chain_ok {
                let last_bh = header_at(last_pos);
                self.next = last_pos.add(last_bh.size());
                // Older versions did not align buffers; pad the last one so
                // that everything from now on is.
                let misalign = self.next as usize % ALIGNMENT;
                if misalign != 0 {
                    let pad = ALIGNMENT - misalign;
                    last_bh.grow(pad);
                    self.next = self.next.add(pad);
                }
                header_at(self.next).clear();
            }
        }
        if !chain_ok {
            self.index.clear(SEQNO_NONE);
            info!("cache recovery failed, full reset");
            return self.reset();
        }

        debug_assert!(self.next != self.first);
        if self.first < self.next {
            self.size_trail = 0;
        } else {
            debug_assert!(self.size_trail >= HEADER_SIZE);
        }

        self.estimate_space(false)?;

        // Release every ordered buffer (no one holds references after a
        // restart) and discard the transients that died unordered.
        let mut total: usize = 0;
        let mut locked: usize = 0;
        let mut clean = true;
        // SAFETY: bounded walk over the terminated header chain.
        unsafe {
            let mut pos = self.first;
            while pos != self.next {
                let bh = header_at(pos);
                if bh.size() > 0 {
                    if pos.add(bh.size()) > self.end.sub(HEADER_SIZE) || bh.ctx() != self.tag {
                        warn!("corrupt buffer chain while releasing recovered buffers");
                        clean = false;
                        break;
                    }
                    total += 1;
                    let size = bh.size();
                    if bh.seqno() > 0 {
                        self.free_bh(bh);
                    } else {
                        // Transient at death: unordered buffers cannot be
                        // referenced anymore.
                        locked += 1;
                        self.discard_bh(bh);
                    }
                    pos = pos.add(size);
                } else {
                    pos = self.start; // rollover
                }
            }
        }
        if !clean {
            self.index.clear(SEQNO_NONE);
            info!("cache recovery failed, full reset");
            return self.reset();
        }

        info!(locked, total, "recovery released scanned buffers");
        info!(
            free = self.size_free,
            cache = self.size_cache,
            "recovery complete"
        );
        self.assert_sizes();
        Ok(())
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("cache close failed: {e}");
        }
    }
}

/// Mints a key under `name`, requiring that it did not exist before.
fn generate_new_master_key(provider: &dyn MasterKeyProvider, name: &str) -> Option<FileKey> {
    if provider.get_key(name).is_some() {
        return None;
    }
    if !provider.create_key(name) {
        return None;
    }
    provider.get_key(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_ring_as(dir: &TempDir, size: usize, recover: bool, gid: Uuid) -> RingBuffer {
        let config = CacheConfig::new(dir.path().join("cache.rb"), size).recover(recover);
        RingBuffer::open(&config, &MmapFactory::new(), gid, None).unwrap()
    }

    fn open_ring(dir: &TempDir, size: usize, recover: bool) -> RingBuffer {
        open_ring_as(dir, size, recover, Uuid::from_u128(0xA5))
    }

    fn fill(ptr: NonNull<u8>, len: usize, byte: u8) {
        // SAFETY: len bytes of payload were allocated.
        unsafe { ptr.as_ptr().write_bytes(byte, len) };
    }

    #[test]
    fn test_malloc_free_accounting() {
        let dir = TempDir::new().unwrap();
        let mut rb = open_ring(&dir, 1024, false);
        assert_eq!(rb.size_cache(), 1024);
        assert_eq!(rb.size_free(), 1024);

        let p = rb.malloc(128).unwrap();
        fill(p, 128 - HEADER_SIZE, 0xAB);
        assert_eq!(rb.size_free(), 1024 - 128);
        assert_eq!(rb.size_used(), 128);

        // Unordered free discards in place.
        unsafe { rb.free(p) };
        assert_eq!(rb.size_free(), 1024);
        assert_eq!(rb.size_used(), 0);
    }

    #[test]
    fn test_malloc_rejects_oversize() {
        let dir = TempDir::new().unwrap();
        let mut rb = open_ring(&dir, 1024, false);
        assert!(rb.malloc(513).is_none());
        assert!(rb.malloc(512).is_some());
    }

    #[test]
    fn test_malloc_rejects_tiny() {
        let dir = TempDir::new().unwrap();
        let mut rb = open_ring(&dir, 1024, false);
        assert!(rb.malloc(0).is_none());
        assert!(rb.malloc(HEADER_SIZE).is_none());
        assert!(rb.malloc(HEADER_SIZE + 1).is_some());
    }

    #[test]
    fn test_assign_and_release_cycle() {
        let dir = TempDir::new().unwrap();
        let mut rb = open_ring(&dir, 1024, false);

        let mut ptrs = Vec::new();
        for s in 1..=3 {
            let p = rb.malloc(64).unwrap();
            fill(p, 64 - HEADER_SIZE, s as u8);
            unsafe { rb.assign_seqno(p, s).unwrap() };
            ptrs.push(p);
        }
        assert_eq!(rb.index().index_front(), Some(1));
        assert_eq!(rb.index().index_back(), Some(3));
        assert_eq!(rb.get(2), Some(ptrs[1]));

        for p in &ptrs {
            unsafe { rb.free(*p) };
        }
        // Ordered buffers stay cached after release.
        assert_eq!(rb.index().len(), 3);

        rb.seqno_release(2);
        assert_eq!(rb.index().index_front(), Some(3));
        assert_eq!(rb.size_free(), 1024 - 64);
    }

    #[test]
    fn test_seqno_release_stops_at_unreleased() {
        let dir = TempDir::new().unwrap();
        let mut rb = open_ring(&dir, 1024, false);

        let p1 = rb.malloc(64).unwrap();
        unsafe { rb.assign_seqno(p1, 1).unwrap() };
        let p2 = rb.malloc(64).unwrap();
        unsafe { rb.assign_seqno(p2, 2).unwrap() };
        unsafe { rb.free(p2) };

        rb.seqno_release(2);
        // p1 pins the head: nothing may be discarded.
        assert_eq!(rb.index().index_front(), Some(1));
        assert_eq!(rb.index().len(), 2);
    }

    #[test]
    fn test_rollover_reuses_head_space() {
        let dir = TempDir::new().unwrap();
        let mut rb = open_ring(&dir, 256, false);

        let mut ptrs = Vec::new();
        for s in 1..=3 {
            let p = rb.malloc(64).unwrap();
            unsafe { rb.assign_seqno(p, s).unwrap() };
            ptrs.push(p);
        }
        for p in &ptrs {
            unsafe { rb.free(*p) };
        }
        rb.seqno_release(3);

        let p = rb.malloc(128).unwrap();
        // The allocation wrapped to the start of the body.
        assert_eq!(
            p.as_ptr() as usize - HEADER_SIZE,
            ptrs[0].as_ptr() as usize - HEADER_SIZE
        );
        fill(p, 128 - HEADER_SIZE, 0xEE);
        rb.assert_sizes();
    }

    #[test]
    fn test_pinned_buffer_blocks_eviction_but_tail_works() {
        let dir = TempDir::new().unwrap();
        let mut rb = open_ring(&dir, 256, false);

        let p1 = rb.malloc(64).unwrap();
        unsafe { rb.assign_seqno(p1, 1).unwrap() };
        let p2 = rb.malloc(64).unwrap();
        unsafe { rb.assign_seqno(p2, 2).unwrap() };
        let p3 = rb.malloc(64).unwrap();
        unsafe { rb.assign_seqno(p3, 3).unwrap() };
        unsafe {
            rb.free(p2);
            rb.free(p3);
        }
        rb.seqno_release(3);
        // p1 unreleased: everything stays.
        assert_eq!(rb.index().len(), 3);

        // But the tail still has room.
        assert!(rb.malloc(64).is_some());
        // And now the ring is full and the pinned head blocks reclaim.
        assert!(rb.malloc(64).is_none());
    }

    #[test]
    fn test_realloc_shrink_is_noop() {
        let dir = TempDir::new().unwrap();
        let mut rb = open_ring(&dir, 1024, false);
        let p = rb.malloc(128).unwrap();
        let q = unsafe { rb.realloc(p, 64) }.unwrap();
        assert_eq!(p, q);
        assert_eq!(unsafe { header_of(p) }.size(), 128);
    }

    #[test]
    fn test_realloc_grows_last_in_place() {
        let dir = TempDir::new().unwrap();
        let mut rb = open_ring(&dir, 1024, false);
        let p = rb.malloc(64).unwrap();
        fill(p, 64 - HEADER_SIZE, 0x11);
        let q = unsafe { rb.realloc(p, 128) }.unwrap();
        assert_eq!(p, q);
        assert_eq!(unsafe { header_of(q) }.size(), 128);
        assert_eq!(rb.size_used(), 128);
        rb.assert_sizes();
    }

    #[test]
    fn test_realloc_moves_when_not_last() {
        let dir = TempDir::new().unwrap();
        let mut rb = open_ring(&dir, 1024, false);
        let p = rb.malloc(64).unwrap();
        fill(p, 64 - HEADER_SIZE, 0x22);
        let _blocker = rb.malloc(64).unwrap();

        let q = unsafe { rb.realloc(p, 128) }.unwrap();
        assert_ne!(p, q);
        // Payload preserved.
        // SAFETY: q has at least the old payload length.
        let payload = unsafe { slice::from_raw_parts(q.as_ptr(), 64 - HEADER_SIZE) };
        assert!(payload.iter().all(|&b| b == 0x22));
        rb.assert_sizes();
    }

    #[test]
    fn test_recover_round_trip_gapless() {
        let dir = TempDir::new().unwrap();
        {
            let mut rb = open_ring(&dir, 4096, false);
            for s in 1..=5 {
                let p = rb.malloc(96).unwrap();
                fill(p, 96 - HEADER_SIZE, s as u8);
                unsafe {
                    rb.assign_seqno(p, s).unwrap();
                    rb.free(p);
                }
            }
            rb.close().unwrap();
        }

        let rb = open_ring(&dir, 4096, true);
        assert_eq!(rb.index().index_front(), Some(1));
        assert_eq!(rb.index().index_back(), Some(5));
        for s in 1..=5 {
            let p = rb.get(s).unwrap();
            // SAFETY: recovered payloads span 96 - HEADER_SIZE bytes.
            let payload = unsafe { slice::from_raw_parts(p.as_ptr(), 96 - HEADER_SIZE) };
            assert!(payload.iter().all(|&b| b == s as u8));
        }
    }

    #[test]
    fn test_recover_keeps_longest_gapless_suffix() {
        let dir = TempDir::new().unwrap();
        {
            let mut rb = open_ring(&dir, 4096, false);
            for s in [5, 6, 7, 8, 10, 11] {
                let p = rb.malloc(64).unwrap();
                fill(p, 64 - HEADER_SIZE, s as u8);
                unsafe {
                    rb.assign_seqno(p, s).unwrap();
                    rb.free(p);
                }
            }
            rb.close().unwrap();
        }

        let rb = open_ring(&dir, 4096, true);
        assert_eq!(rb.index().index_front(), Some(10));
        assert_eq!(rb.index().index_back(), Some(11));
        assert_eq!(rb.index().len(), 2);
    }

    #[test]
    fn test_recover_without_sync_finds_dense_range() {
        let dir = TempDir::new().unwrap();
        {
            let mut rb = open_ring(&dir, 4096, false);
            for s in 1..=3 {
                let p = rb.malloc(64).unwrap();
                unsafe {
                    rb.assign_seqno(p, s).unwrap();
                    rb.free(p);
                }
            }
            rb.close().unwrap();
        }
        {
            // Reopen, append more, then die without a graceful close.
            let mut rb = open_ring(&dir, 4096, true);
            for s in 4..=5 {
                let p = rb.malloc(64).unwrap();
                unsafe {
                    rb.assign_seqno(p, s).unwrap();
                    rb.free(p);
                }
            }
            rb.mmap.sync().unwrap();
            std::mem::forget(rb);
        }

        let rb = open_ring(&dir, 4096, true);
        let front = rb.index().index_front().unwrap();
        let back = rb.index().index_back().unwrap();
        // At least the synced prefix must be back, and the range is dense.
        assert!(back >= 3);
        for s in front..=back {
            assert!(rb.get(s).is_some());
        }
    }

    #[test]
    fn test_recover_skipped_without_gid() {
        let dir = TempDir::new().unwrap();
        {
            // gid stays nil: nothing to attribute seqnos to.
            let mut rb = open_ring_as(&dir, 4096, false, Uuid::nil());
            let p = rb.malloc(64).unwrap();
            unsafe {
                rb.assign_seqno(p, 1).unwrap();
                rb.free(p);
            }
            rb.close().unwrap();
        }
        let rb = open_ring_as(&dir, 4096, true, Uuid::nil());
        assert!(rb.index().is_empty());
    }

    #[test]
    fn test_seqno_reset_drops_order() {
        let dir = TempDir::new().unwrap();
        let mut rb = open_ring(&dir, 1024, false);
        let mut ptrs = Vec::new();
        for s in 1..=3 {
            let p = rb.malloc(64).unwrap();
            unsafe { rb.assign_seqno(p, s).unwrap() };
            ptrs.push(p);
        }
        for p in &ptrs {
            unsafe { rb.free(*p) };
        }
        // A fresh unordered buffer survives the reset as the new head.
        let keep = rb.malloc(64).unwrap();

        rb.seqno_reset(false).unwrap();
        assert!(rb.index().is_empty());
        rb.assert_sizes();
        // Old seqnos are gone; new ordering restarts from anywhere.
        unsafe { rb.assign_seqno(keep, 1).unwrap() };
    }

    #[test]
    fn test_reset_clears_everything() {
        let dir = TempDir::new().unwrap();
        let mut rb = open_ring(&dir, 1024, false);
        for s in 1..=3 {
            let p = rb.malloc(64).unwrap();
            unsafe {
                rb.assign_seqno(p, s).unwrap();
                rb.free(p);
            }
        }
        rb.reset().unwrap();
        assert!(rb.index().is_empty());
        assert_eq!(rb.size_free(), rb.size_cache());
        assert_eq!(rb.size_used(), 0);
    }

    #[test]
    fn test_max_used_high_water() {
        let dir = TempDir::new().unwrap();
        let mut rb = open_ring(&dir, 1024, false);
        let base = rb.max_used();
        let p = rb.malloc(256).unwrap();
        assert_eq!(rb.max_used(), base + 256);
        unsafe { rb.free(p) };
        // Freeing does not lower the high-water mark.
        assert_eq!(rb.max_used(), base + 256);
    }
}
