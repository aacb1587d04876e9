//! Startup configuration.
//!
//! All options are read once when the cache opens; the config struct is
//! consumed by [`Cache::open`](crate::Cache::open), so there is no runtime
//! mutation surface. Sizes accept plain byte counts or `K`/`M`/`G`
//! suffixes.

use std::path::PathBuf;

/// Error from configuration parsing or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A size string could not be parsed.
    #[error("invalid size value {0:?}")]
    InvalidSize(String),

    /// A required option is out of range.
    #[error("{option} must be {requirement}")]
    OutOfRange {
        /// Offending option name.
        option: &'static str,
        /// Human description of the constraint.
        requirement: &'static str,
    },
}

/// Encryption-at-rest options.
#[derive(Clone, Debug)]
pub struct EncryptionConfig {
    /// Whether page data is encrypted in the backing file.
    pub enabled: bool,
    /// Size of one decrypted-cache page. Must be a multiple of the OS
    /// page size.
    pub cache_page_size: usize,
    /// Total size of the decrypted working set.
    pub cache_size: usize,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        EncryptionConfig {
            enabled: false,
            cache_page_size: 32 * 1024,
            cache_size: 16 * 1024 * 1024,
        }
    }
}

/// Options for one cache instance.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Path of the backing file.
    pub name: PathBuf,
    /// Usable ring capacity in bytes.
    pub size: usize,
    /// Whether to recover cached writesets from an existing file.
    pub recover: bool,
    /// Encryption options.
    pub encryption: EncryptionConfig,
}

impl CacheConfig {
    /// Creates a config with the required options and defaults for the
    /// rest (no recovery, no encryption).
    pub fn new(name: impl Into<PathBuf>, size: usize) -> Self {
        CacheConfig {
            name: name.into(),
            size,
            recover: false,
            encryption: EncryptionConfig::default(),
        }
    }

    /// Enables or disables recovery at open.
    #[must_use]
    pub fn recover(mut self, recover: bool) -> Self {
        self.recover = recover;
        self
    }

    /// Replaces the encryption options.
    #[must_use]
    pub fn encryption(mut self, encryption: EncryptionConfig) -> Self {
        self.encryption = encryption;
        self
    }

    /// Validates option ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::OutOfRange`] for unusable values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.size == 0 {
            return Err(ConfigError::OutOfRange {
                option: "size",
                requirement: "positive",
            });
        }
        if self.encryption.enabled {
            if self.encryption.cache_page_size == 0 {
                return Err(ConfigError::OutOfRange {
                    option: "encryption.cache_page_size",
                    requirement: "positive",
                });
            }
            if self.encryption.cache_size < 2 * self.encryption.cache_page_size {
                return Err(ConfigError::OutOfRange {
                    option: "encryption.cache_size",
                    requirement: "at least two cache pages",
                });
            }
        }
        Ok(())
    }
}

/// Parses a human-readable size: plain bytes or a `K`/`M`/`G` suffix
/// (case-insensitive, powers of 1024).
///
/// # Errors
///
/// Returns [`ConfigError::InvalidSize`] on malformed input or overflow.
pub fn parse_size(raw: &str) -> Result<usize, ConfigError> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(ConfigError::InvalidSize(raw.to_string()));
    }

    let (digits, mult): (&str, usize) = match s.chars().last() {
        Some('k' | 'K') => (&s[..s.len() - 1], 1 << 10),
        Some('m' | 'M') => (&s[..s.len() - 1], 1 << 20),
        Some('g' | 'G') => (&s[..s.len() - 1], 1 << 30),
        _ => (s, 1),
    };

    digits
        .trim()
        .parse::<usize>()
        .ok()
        .and_then(|v| v.checked_mul(mult))
        .ok_or_else(|| ConfigError::InvalidSize(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("32K").unwrap(), 32 * 1024);
        assert_eq!(parse_size("32k").unwrap(), 32 * 1024);
        assert_eq!(parse_size("16M").unwrap(), 16 * 1024 * 1024);
        assert_eq!(parse_size("2G").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_size(" 8K ").unwrap(), 8192);
    }

    #[test]
    fn test_parse_size_rejects_garbage() {
        assert!(parse_size("").is_err());
        assert!(parse_size("K").is_err());
        assert!(parse_size("12Q").is_err());
        assert!(parse_size("-5M").is_err());
        assert!(parse_size("999999999999999999999G").is_err());
    }

    #[test]
    fn test_defaults() {
        let cfg = CacheConfig::new("/tmp/cache.rb", 1 << 20);
        assert!(!cfg.recover);
        assert!(!cfg.encryption.enabled);
        assert_eq!(cfg.encryption.cache_page_size, 32 * 1024);
        assert_eq!(cfg.encryption.cache_size, 16 * 1024 * 1024);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_tiny_enc_cache() {
        let mut cfg = CacheConfig::new("/tmp/cache.rb", 1 << 20);
        cfg.encryption.enabled = true;
        cfg.encryption.cache_size = cfg.encryption.cache_page_size;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_size() {
        assert!(CacheConfig::new("/tmp/cache.rb", 0).validate().is_err());
    }
}
