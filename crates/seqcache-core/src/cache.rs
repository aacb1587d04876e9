//! Thread-safe cache facade.
//!
//! Writers share one [`RingBuffer`] behind a single mutex: allocation,
//! release, seqno assignment and eviction all serialize on it. Readers
//! never take the lock — a payload pointer obtained from the cache stays
//! valid (and dereferenceable, faulting pages in transparently when
//! encryption is on) until the buffer is discarded, which cannot happen
//! while its seqno has not been released.

use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use seqcache_mem::{MasterKeyProvider, MmapFactory};

use crate::config::CacheConfig;
use crate::header::Seqno;
use crate::ring::RingBuffer;
use crate::CacheError;

/// A shared handle to one writeset cache.
pub struct Cache {
    ring: Mutex<RingBuffer>,
}

impl Cache {
    /// Opens the cache described by `config`.
    ///
    /// `gid` is the group identity new writesets belong to (a recovered
    /// preamble overrides it); `provider` supplies master keys when
    /// encryption is enabled.
    ///
    /// # Errors
    ///
    /// See [`RingBuffer::open`].
    pub fn open(
        config: &CacheConfig,
        gid: Uuid,
        provider: Option<Arc<dyn MasterKeyProvider>>,
    ) -> Result<Arc<Cache>, CacheError> {
        let factory = MmapFactory::new();
        let ring = RingBuffer::open(config, &factory, gid, provider)?;
        Ok(Arc::new(Cache {
            ring: Mutex::new(ring),
        }))
    }

    /// Allocates a buffer of `size` total bytes (header included) and
    /// returns its payload pointer, or `None` when space cannot be made.
    pub fn malloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.ring.lock().malloc(size)
    }

    /// Resizes the buffer at `ptr`; see [`RingBuffer::realloc`].
    ///
    /// # Safety
    ///
    /// `ptr` must be a live payload pointer from this cache, not yet
    /// ordered or freed, and no reader may hold it across the call.
    pub unsafe fn realloc(&self, ptr: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
        self.ring.lock().realloc(ptr, size)
    }

    /// Releases the buffer at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live payload pointer from this cache, released
    /// exactly once.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        self.ring.lock().free(ptr);
    }

    /// Orders the buffer at `ptr` as `seqno`.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live payload pointer from this cache, ordered at
    /// most once.
    ///
    /// # Errors
    ///
    /// The seqno must exceed every previously assigned one.
    pub unsafe fn assign_seqno(&self, ptr: NonNull<u8>, seqno: Seqno) -> Result<(), CacheError> {
        self.ring.lock().assign_seqno(ptr, seqno)
    }

    /// Payload pointer of the writeset ordered as `seqno`, if cached.
    /// Donors use this to stream recent history without copying.
    #[must_use]
    pub fn get(&self, seqno: Seqno) -> Option<NonNull<u8>> {
        self.ring.lock().get(seqno)
    }

    /// Lowest and highest cached seqnos.
    #[must_use]
    pub fn seqno_range(&self) -> Option<(Seqno, Seqno)> {
        let ring = self.ring.lock();
        Some((ring.index().index_front()?, ring.index().index_back()?))
    }

    /// Discards every released buffer ordered at most `seqno`.
    pub fn seqno_release(&self, seqno: Seqno) {
        self.ring.lock().seqno_release(seqno);
    }

    /// Drops the seqno ordering, keeping unreleased buffers; see
    /// [`RingBuffer::seqno_reset`]. Callers must ensure no service-worker
    /// action is in flight.
    ///
    /// # Errors
    ///
    /// Propagates flush failures.
    pub fn seqno_reset(&self, zero_out: bool) -> Result<(), CacheError> {
        self.ring.lock().seqno_reset(zero_out)
    }

    /// Wraps the file key under a freshly minted master key; the provider
    /// calls this from its rotation hook.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::RotationFailed`] when no state was changed.
    pub fn rotate_master_key(&self) -> Result<(), CacheError> {
        self.ring.lock().rotate_master_key()
    }

    /// Writes a synced preamble and flushes the mapping. Invoked on drop
    /// as well; an explicit call surfaces errors.
    ///
    /// # Errors
    ///
    /// Propagates flush failures.
    pub fn close(&self) -> Result<(), CacheError> {
        self.ring.lock().close()
    }

    /// Bytes immediately reclaimable.
    #[must_use]
    pub fn size_free(&self) -> usize {
        self.ring.lock().size_free()
    }

    /// Bytes occupied by buffers not yet discarded.
    #[must_use]
    pub fn size_used(&self) -> usize {
        self.ring.lock().size_used()
    }

    /// Usable ring capacity.
    #[must_use]
    pub fn size_cache(&self) -> usize {
        self.ring.lock().size_cache()
    }

    /// The group identity of the cached history.
    #[must_use]
    pub fn gid(&self) -> Uuid {
        self.ring.lock().gid()
    }
}
