//! # seqcache memory subsystem
//!
//! Low-level memory plumbing for the seqcache ring buffer:
//!
//! - **`PagePool`**: a fixed pool of physical pages backed by an unlinked
//!   temp file, handed out to the encrypted view one page at a time
//! - **`PagePoolRegistry`**: a small cache of idle pools so that short-lived
//!   mappings do not pay pool construction over and over
//! - **`FileMmap` / `EncMmap`**: a plain file mapping and an encrypted
//!   demand-paged view over one, both behind the [`MemMap`] trait
//! - **`MmapFactory`**: picks one of the two based on configuration
//!
//! The encrypted view keeps data AES-256-CTR encrypted in the backing file
//! and decrypts 4 KiB-aligned windows on access, driven by a process-wide
//! page-fault handler. Clients see an ordinary pointer they can `memcpy`
//! through; the working set is bounded by the pool size.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
// Raw mmap/mprotect plumbing and the fault handler live here.
#![allow(unsafe_code)]

pub mod cipher;
pub mod enc_mmap;
pub mod keys;
pub mod mmap;
pub mod page_pool;
pub mod pool_registry;

pub use self::cipher::{FileKey, PageCipher, FILE_KEY_LEN};
pub use self::enc_mmap::EncMmap;
pub use self::keys::MasterKeyProvider;
pub use self::mmap::{AccessMode, FileMmap, MemMap, MmapFactory};
pub use self::page_pool::{PagePool, PhysPage};
pub use self::pool_registry::PagePoolRegistry;

/// Error type for the memory subsystem.
#[derive(Debug, thiserror::Error)]
pub enum MemError {
    /// I/O error from file creation or sizing.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A raw memory-management syscall failed.
    #[error("{call} failed: {source}")]
    Sys {
        /// The syscall that failed.
        call: &'static str,
        /// The underlying OS error.
        source: std::io::Error,
    },

    /// Pool page size is not usable on this system.
    #[error("invalid page size {got}: must be a non-zero multiple of the OS page size {os}")]
    InvalidPageSize {
        /// The requested page size.
        got: usize,
        /// The OS page size.
        os: usize,
    },

    /// A wrapped key could not be decoded.
    #[error("malformed key material: {0}")]
    BadKeyMaterial(String),
}

impl MemError {
    pub(crate) fn sys(call: &'static str) -> Self {
        MemError::Sys {
            call,
            source: std::io::Error::last_os_error(),
        }
    }
}
