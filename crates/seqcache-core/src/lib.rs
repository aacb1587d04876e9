//! # seqcache core
//!
//! A persistent, recoverable ring-buffer cache of totally ordered
//! writesets, embedded in a replication stack:
//!
//! - **`RingBuffer`**: append/evict ring over a single backing file,
//!   holding variable-length buffers tagged with a global sequence number
//! - **`SeqnoIndex`**: dense-by-seqno map from sequence numbers to live
//!   buffer pointers, used for donation and certification preload
//! - **`Preamble`**: the 4 KiB textual metadata block at the start of the
//!   cache file (identity, recovered range, encryption lineage)
//! - **`Cache`**: the thread-safe facade — one write-side mutex, lock-free
//!   pointer reads
//! - **`ServiceWorker`**: a background thread that takes eviction and
//!   last-applied reporting off the replication hot path
//!
//! Buffers live entirely inside the mapped file; a fixed header precedes
//! every payload, and recovery after a crash re-discovers the live chain
//! by scanning for valid headers. With encryption enabled the mapping is
//! an encrypted demand-paged view from `seqcache-mem` and the file never
//! holds plaintext payloads at rest.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
// The intrusive-header design requires raw pointer access into the
// mapping; all unsafe is concentrated behind the header helpers.
#![allow(unsafe_code)]

pub mod cache;
pub mod config;
pub mod header;
pub mod preamble;
pub mod ring;
pub mod seqno_index;
pub mod service;

pub use cache::Cache;
pub use config::{CacheConfig, EncryptionConfig};
pub use header::{Seqno, SEQNO_ILL, SEQNO_NONE};
pub use ring::RingBuffer;
pub use seqno_index::SeqnoIndex;
pub use service::{LastAppliedSink, ServiceWorker};

/// Error type for cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// I/O error on the backing file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure in the memory subsystem (mapping, pool, key material).
    #[error("memory subsystem error: {0}")]
    Mem(#[from] seqcache_mem::MemError),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(#[from] config::ConfigError),

    /// A master key could not be fetched or minted and encrypted data
    /// would be unreadable. Fatal by policy.
    #[error("encryption unavailable: {0}")]
    EncryptionUnavailable(String),

    /// The seqno index rejected an update (non-monotonic seqno or
    /// exhausted memory).
    #[error("seqno index error: {0}")]
    Index(#[from] seqno_index::IndexError),

    /// Master-key rotation could not complete; no state was changed.
    #[error("master key rotation failed: {0}")]
    RotationFailed(String),
}
