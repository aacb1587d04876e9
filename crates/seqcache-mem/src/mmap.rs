//! Memory-map abstraction and factory.
//!
//! The ring buffer talks to its backing file through [`MemMap`], so the
//! same allocator code runs over a plain file mapping or over the
//! encrypted demand-paged view — the only difference is which one the
//! [`MmapFactory`] hands back.

use std::fs::File;
use std::sync::Arc;

use memmap2::{MmapRaw, UncheckedAdvice};

use crate::cipher::FileKey;
use crate::enc_mmap::EncMmap;
use crate::pool_registry::PagePoolRegistry;
use crate::MemError;

/// Access pattern hint for the encrypted view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    /// Sequential read phase (recovery scan): freshly faulted pages stay
    /// read-only and the fault handler reads ahead aggressively.
    Read,
    /// Normal operation: faulted pages become writable on the first write.
    ReadWrite,
}

/// A byte region backed by a file.
///
/// Implementations expose a stable base pointer for the whole lifetime of
/// the mapping; readers dereference it without further calls into the
/// trait.
pub trait MemMap: Send {
    /// Base pointer of the mapped region.
    fn ptr(&self) -> *mut u8;

    /// Length of the mapped region in bytes.
    fn len(&self) -> usize;

    /// Whether the region is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flushes the byte range `[offset, offset + len)` to the backing
    /// file.
    ///
    /// # Errors
    ///
    /// Propagates `msync` failures.
    fn sync_range(&self, offset: usize, len: usize) -> Result<(), MemError>;

    /// Flushes the whole region to the backing file.
    ///
    /// # Errors
    ///
    /// Propagates `msync` failures.
    fn sync(&self) -> Result<(), MemError>;

    /// Installs the encryption key for the region. No-op for plain
    /// mappings.
    fn set_key(&self, key: &FileKey);

    /// Sets the access pattern hint. No-op for plain mappings.
    fn set_access_mode(&self, mode: AccessMode);

    /// Tells the OS the region is not needed soon.
    fn dont_need(&self);
}

/// A plain shared mapping of a file.
pub struct FileMmap {
    raw: MmapRaw,
}

impl FileMmap {
    /// Maps the whole of `file` shared, read-write.
    ///
    /// # Errors
    ///
    /// Propagates mmap failures.
    pub fn map(file: &File) -> Result<Self, MemError> {
        let raw = MmapRaw::map_raw(file)?;
        Ok(FileMmap { raw })
    }
}

impl MemMap for FileMmap {
    fn ptr(&self) -> *mut u8 {
        self.raw.as_mut_ptr()
    }

    fn len(&self) -> usize {
        self.raw.len()
    }

    fn sync_range(&self, offset: usize, len: usize) -> Result<(), MemError> {
        self.raw.flush_range(offset, len)?;
        Ok(())
    }

    fn sync(&self) -> Result<(), MemError> {
        self.raw.flush()?;
        Ok(())
    }

    fn set_key(&self, _key: &FileKey) {}

    fn set_access_mode(&self, _mode: AccessMode) {}

    fn dont_need(&self) {
        // Advisory only; failure changes nothing for correctness.
        let _ = unsafe { self.raw.unchecked_advise(UncheckedAdvice::DontNeed) };
    }
}

/// Builds the mapping a cache file should use.
pub struct MmapFactory {
    registry: Arc<PagePoolRegistry>,
}

impl MmapFactory {
    /// Creates a factory with its own pool registry.
    #[must_use]
    pub fn new() -> Self {
        MmapFactory {
            registry: Arc::new(PagePoolRegistry::new()),
        }
    }

    /// Creates a factory sharing an existing pool registry.
    #[must_use]
    pub fn with_registry(registry: Arc<PagePoolRegistry>) -> Self {
        MmapFactory { registry }
    }

    /// Maps `file` either plainly or through an encrypted view.
    ///
    /// For an encrypted view a fresh random file key is installed; the
    /// caller replaces it with the real key via [`MemMap::set_key`] once
    /// it has been recovered from the preamble.
    ///
    /// # Errors
    ///
    /// Propagates mapping and pool construction failures.
    pub fn create(
        &self,
        file: &File,
        encrypt: bool,
        cache_page_size: usize,
        cache_size: usize,
        sync_on_destroy: bool,
        plaintext_prefix: usize,
    ) -> Result<Box<dyn MemMap>, MemError> {
        let plain = FileMmap::map(file)?;
        if !encrypt {
            return Ok(Box::new(plain));
        }
        let enc = EncMmap::new(
            FileKey::generate(),
            plain,
            cache_page_size,
            cache_size,
            sync_on_destroy,
            plaintext_prefix,
            Arc::clone(&self.registry),
        )?;
        Ok(Box::new(enc))
    }
}

impl Default for MmapFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_plain_map_round_trip() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&[0u8; 8192]).unwrap();
        let map = FileMmap::map(&file).unwrap();
        assert_eq!(map.len(), 8192);

        // SAFETY: offset 100 is inside the mapping and nothing else
        // aliases it.
        unsafe {
            map.ptr().add(100).write(0x5A);
            assert_eq!(map.ptr().add(100).read(), 0x5A);
        }
        map.sync().unwrap();
        map.sync_range(0, 4096).unwrap();
    }

    #[test]
    fn test_factory_plain() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&[0u8; 4096]).unwrap();
        let factory = MmapFactory::new();
        let map = factory.create(&file, false, 4096, 8192, false, 0).unwrap();
        assert_eq!(map.len(), 4096);
    }
}
