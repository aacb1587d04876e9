//! The 4 KiB textual preamble at the start of the cache file.
//!
//! Newline-terminated `key value` pairs, UTF-8, zero-padded to
//! [`PREAMBLE_LEN`]. The preamble carries the cache identity, the
//! recovered seqno range of a cleanly closed file, and the encryption
//! lineage (master-key ids plus the wrapped file key) protected by a
//! CRC32C. Reading is strict: unknown keys are ignored, unparseable
//! values warn and fall back to defaults.

use std::fmt::Write as _;

use tracing::warn;
use uuid::Uuid;

use crate::header::{Seqno, SEQNO_ILL};

/// Length of the preamble block.
pub const PREAMBLE_LEN: usize = 4096;

/// Current format version.
pub const VERSION: u32 = 2;

const KEY_VERSION: &str = "Version:";
const KEY_GID: &str = "GID:";
const KEY_SEQNO_MIN: &str = "seqno_min:";
const KEY_SEQNO_MAX: &str = "seqno_max:";
const KEY_OFFSET: &str = "offset:";
const KEY_SYNCED: &str = "synced:";
const KEY_ENC_VERSION: &str = "enc_version:";
const KEY_ENC_ENCRYPTED: &str = "enc_encrypted:";
const KEY_ENC_MK_ID: &str = "enc_mk_id:";
const KEY_ENC_MK_CONST_ID: &str = "enc_mk_const_id:";
const KEY_ENC_MK_UUID: &str = "enc_mk_uuid:";
const KEY_ENC_FILE_KEY: &str = "enc_fk_id:";
const KEY_ENC_CRC: &str = "enc_crc:";

/// Encryption lineage stored in the preamble.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EncryptionInfo {
    /// Encryption format version (currently 1).
    pub version: u32,
    /// Whether the file body is encrypted.
    pub encrypted: bool,
    /// Monotonically growing master-key id.
    pub mk_id: u32,
    /// Constant id tying this cache file to a lineage.
    pub mk_const_id: Uuid,
    /// Lineage uuid; changes when a fresh lineage must start.
    pub mk_uuid: Uuid,
    /// Master-key-wrapped file key, base64.
    pub file_key: String,
    /// CRC32C over the fields above as stored.
    pub crc: u32,
}

impl EncryptionInfo {
    /// CRC32C over the canonical little-endian serialization of the
    /// encryption fields.
    #[must_use]
    pub fn compute_crc(&self) -> u32 {
        let mut buf = Vec::with_capacity(64 + self.file_key.len());
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.push(u8::from(self.encrypted));
        buf.extend_from_slice(&self.mk_id.to_le_bytes());
        buf.extend_from_slice(self.mk_const_id.as_bytes());
        buf.extend_from_slice(self.mk_uuid.as_bytes());
        buf.extend_from_slice(self.file_key.as_bytes());
        crc32c::crc32c(&buf)
    }

    /// Whether the stored CRC matches the stored fields. A zero CRC never
    /// validates — it marks a preamble written before encryption state
    /// existed.
    #[must_use]
    pub fn crc_valid(&self) -> bool {
        self.crc != 0 && self.crc == self.compute_crc()
    }
}

/// Parsed preamble contents.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Preamble {
    /// Format version.
    pub version: u32,
    /// Group id the cached seqnos belong to.
    pub gid: Uuid,
    /// Lowest cached seqno at clean close, `SEQNO_ILL` if unknown.
    pub seqno_min: Seqno,
    /// Highest cached seqno at clean close, `SEQNO_ILL` if unknown.
    pub seqno_max: Seqno,
    /// File offset of the first live buffer, -1 if unknown.
    pub offset: i64,
    /// Whether the previous process closed cleanly.
    pub synced: bool,
    /// Encryption lineage.
    pub enc: EncryptionInfo,
}

impl Default for Preamble {
    fn default() -> Self {
        Preamble {
            version: VERSION,
            gid: Uuid::nil(),
            seqno_min: SEQNO_ILL,
            seqno_max: SEQNO_ILL,
            offset: -1,
            synced: false,
            enc: EncryptionInfo::default(),
        }
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, raw: &str, default: T) -> T {
    match raw.parse() {
        Ok(v) => v,
        Err(_) => {
            warn!(key, raw, "unparseable preamble value, using default");
            default
        }
    }
}

fn parse_bool(key: &str, raw: &str) -> bool {
    match raw {
        "1" | "true" => true,
        "0" | "false" => false,
        _ => {
            warn!(key, raw, "unparseable preamble flag, assuming false");
            false
        }
    }
}

impl Preamble {
    /// Parses the preamble block. Bytes past the first NUL are ignored;
    /// unknown keys are skipped; malformed values warn and default.
    #[must_use]
    pub fn parse(block: &[u8]) -> Self {
        let mut p = Preamble {
            version: 0,
            ..Preamble::default()
        };

        let end = block.iter().position(|&b| b == 0).unwrap_or(block.len());
        let text = String::from_utf8_lossy(&block[..end]);

        for line in text.lines() {
            let mut parts = line.split_whitespace();
            let Some(key) = parts.next() else { continue };
            if key.starts_with('#') {
                continue;
            }
            let value = parts.next().unwrap_or("");
            match key {
                KEY_VERSION => p.version = parse_value(key, value, 0),
                KEY_GID => p.gid = parse_value(key, value, Uuid::nil()),
                KEY_SEQNO_MIN => p.seqno_min = parse_value(key, value, SEQNO_ILL),
                KEY_SEQNO_MAX => p.seqno_max = parse_value(key, value, SEQNO_ILL),
                KEY_OFFSET => p.offset = parse_value(key, value, -1),
                KEY_SYNCED => p.synced = parse_bool(key, value),
                KEY_ENC_VERSION => p.enc.version = parse_value(key, value, 0),
                KEY_ENC_ENCRYPTED => p.enc.encrypted = parse_bool(key, value),
                KEY_ENC_MK_ID => p.enc.mk_id = parse_value(key, value, 0),
                KEY_ENC_MK_CONST_ID => p.enc.mk_const_id = parse_value(key, value, Uuid::nil()),
                KEY_ENC_MK_UUID => p.enc.mk_uuid = parse_value(key, value, Uuid::nil()),
                KEY_ENC_FILE_KEY => p.enc.file_key = value.to_string(),
                KEY_ENC_CRC => p.enc.crc = parse_value(key, value, 0),
                _ => {}
            }
        }

        p
    }

    /// Renders the preamble as a zero-padded [`PREAMBLE_LEN`] block. The
    /// seqno range and offset are only written for a synced preamble with
    /// a non-empty index, mirroring what recovery may trust.
    #[must_use]
    pub fn render(&self) -> Vec<u8> {
        let mut text = String::with_capacity(512);
        let _ = writeln!(text, "{KEY_VERSION} {}", self.version);
        let _ = writeln!(text, "{KEY_GID} {}", self.gid);

        if self.synced {
            let _ = writeln!(text, "{KEY_SEQNO_MIN} {}", self.seqno_min);
            let _ = writeln!(text, "{KEY_SEQNO_MAX} {}", self.seqno_max);
            if self.offset >= 0 {
                let _ = writeln!(text, "{KEY_OFFSET} {}", self.offset);
            }
        }
        let _ = writeln!(text, "{KEY_SYNCED} {}", u8::from(self.synced));

        let _ = writeln!(text, "{KEY_ENC_VERSION} {}", self.enc.version);
        let _ = writeln!(text, "{KEY_ENC_ENCRYPTED} {}", u8::from(self.enc.encrypted));
        let _ = writeln!(text, "{KEY_ENC_MK_ID} {}", self.enc.mk_id);
        let _ = writeln!(text, "{KEY_ENC_MK_CONST_ID} {}", self.enc.mk_const_id);
        let _ = writeln!(text, "{KEY_ENC_MK_UUID} {}", self.enc.mk_uuid);
        let _ = writeln!(text, "{KEY_ENC_FILE_KEY} {}", self.enc.file_key);
        let _ = writeln!(text, "{KEY_ENC_CRC} {}", self.enc.compute_crc());

        text.push('\n');

        let mut block = vec![0u8; PREAMBLE_LEN];
        let len = text.len().min(PREAMBLE_LEN - 1);
        block[..len].copy_from_slice(&text.as_bytes()[..len]);
        block
    }

    /// Sanitizes a parsed version field; recovery treats out-of-range
    /// values as "unknown, assume oldest".
    #[must_use]
    pub fn sane_version(&self) -> u32 {
        if self.version > 16 {
            warn!(version = self.version, "bogus preamble version, assuming 0");
            0
        } else {
            self.version
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_parse_round_trip() {
        let mut p = Preamble {
            gid: Uuid::new_v4(),
            seqno_min: 17,
            seqno_max: 40,
            offset: 4160,
            synced: true,
            ..Preamble::default()
        };
        p.enc.version = 1;
        p.enc.encrypted = true;
        p.enc.mk_id = 3;
        p.enc.mk_const_id = Uuid::new_v4();
        p.enc.mk_uuid = Uuid::new_v4();
        p.enc.file_key = "c29tZSB3cmFwcGVkIGtleQ==".to_string();

        let block = p.render();
        assert_eq!(block.len(), PREAMBLE_LEN);

        let q = Preamble::parse(&block);
        assert_eq!(q.version, VERSION);
        assert_eq!(q.gid, p.gid);
        assert_eq!(q.seqno_min, 17);
        assert_eq!(q.seqno_max, 40);
        assert_eq!(q.offset, 4160);
        assert!(q.synced);
        assert_eq!(q.enc.encrypted, p.enc.encrypted);
        assert_eq!(q.enc.mk_id, 3);
        assert_eq!(q.enc.mk_const_id, p.enc.mk_const_id);
        assert_eq!(q.enc.mk_uuid, p.enc.mk_uuid);
        assert_eq!(q.enc.file_key, p.enc.file_key);
        assert!(q.enc.crc_valid());
    }

    #[test]
    fn test_unsynced_render_omits_range() {
        let p = Preamble {
            seqno_min: 5,
            seqno_max: 9,
            offset: 4160,
            synced: false,
            ..Preamble::default()
        };
        let q = Preamble::parse(&p.render());
        assert!(!q.synced);
        assert_eq!(q.seqno_min, SEQNO_ILL);
        assert_eq!(q.seqno_max, SEQNO_ILL);
        assert_eq!(q.offset, -1);
    }

    #[test]
    fn test_parse_tolerates_garbage() {
        let text = b"# comment line\nVersion: not-a-number\nbogus_key: 17\nsynced: maybe\n\n";
        let mut block = vec![0u8; PREAMBLE_LEN];
        block[..text.len()].copy_from_slice(text);
        let p = Preamble::parse(&block);
        assert_eq!(p.version, 0);
        assert!(!p.synced);
        assert_eq!(p.offset, -1);
    }

    #[test]
    fn test_parse_empty_block() {
        let p = Preamble::parse(&[0u8; PREAMBLE_LEN]);
        assert_eq!(p.version, 0);
        assert_eq!(p.gid, Uuid::nil());
        assert!(!p.enc.encrypted);
        assert!(!p.enc.crc_valid());
    }

    #[test]
    fn test_crc_detects_tampering() {
        let mut p = Preamble::default();
        p.enc.version = 1;
        p.enc.encrypted = true;
        p.enc.file_key = "d3JhcHBlZA==".to_string();

        let block = p.render();
        let mut q = Preamble::parse(&block);
        assert!(q.enc.crc_valid());
        q.enc.mk_id += 1;
        assert!(!q.enc.crc_valid());
    }
}
