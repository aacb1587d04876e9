//! Master-key provider interface and key naming.
//!
//! The cache never manages master keys itself: an embedding application
//! injects a [`MasterKeyProvider`] backed by whatever keyring it uses. The
//! cache only derives deterministic key *names* from its identity and asks
//! the provider to fetch or mint keys under those names.

use uuid::Uuid;

use crate::cipher::FileKey;

/// Source of master keys, implemented by the embedding application.
///
/// Implementations must be safe to call from multiple threads; the cache
/// invokes the provider during startup recovery and during key rotation.
pub trait MasterKeyProvider: Send + Sync {
    /// Fetches the key stored under `name`, or `None` if it does not exist.
    fn get_key(&self, name: &str) -> Option<FileKey>;

    /// Creates a new key under `name`. Returns `true` on success.
    fn create_key(&self, name: &str) -> bool;
}

/// Builds the keyring name for one master key of a cache's lineage.
///
/// `const_id` ties the name to this cache file for its whole life,
/// `lineage` changes whenever a fresh lineage must start (e.g. after an
/// interrupted rotation), and `key_id` grows by one per rotation.
#[must_use]
pub fn master_key_name(const_id: &Uuid, lineage: &Uuid, key_id: u32) -> String {
    format!("SeqcacheKey-{const_id}@{lineage}-{key_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_shape() {
        let const_id = Uuid::new_v4();
        let lineage = Uuid::new_v4();
        assert_eq!(
            master_key_name(&const_id, &lineage, 3),
            format!("SeqcacheKey-{const_id}@{lineage}-3")
        );
    }

    #[test]
    fn test_names_distinct_per_id() {
        let const_id = Uuid::new_v4();
        let lineage = Uuid::new_v4();
        assert_ne!(
            master_key_name(&const_id, &lineage, 1),
            master_key_name(&const_id, &lineage, 2)
        );
    }
}
