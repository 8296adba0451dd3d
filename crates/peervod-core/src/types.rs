use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;

/// 20-byte SHA-1 of a torrent's `info` dictionary; the canonical torrent
/// identity everywhere in the system.
///
/// Formats as 40 lowercase hex characters for logs and filenames.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Wrap raw digest bytes.
    #[must_use]
    pub const fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// The raw 20-byte digest.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Parse from a 40-character hex string (either case).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Metainfo`] if the input is not 40 hex characters.
    pub fn from_hex(text: &str) -> Result<Self, Error> {
        let bytes = text.as_bytes();
        if bytes.len() != 40 {
            return Err(Error::Metainfo(format!(
                "infohash must be 40 hex chars, got {}",
                bytes.len()
            )));
        }
        let mut out = [0_u8; 20];
        for (i, chunk) in bytes.chunks_exact(2).enumerate() {
            let hi = hex_nibble(chunk[0])?;
            let lo = hex_nibble(chunk[1])?;
            out[i] = (hi << 4) | lo;
        }
        Ok(Self(out))
    }
}

fn hex_nibble(ch: u8) -> Result<u8, Error> {
    match ch {
        b'0'..=b'9' => Ok(ch - b'0'),
        b'a'..=b'f' => Ok(ch - b'a' + 10),
        b'A'..=b'F' => Ok(ch - b'A' + 10),
        other => Err(Error::Metainfo(format!(
            "invalid hex character {:?} in infohash",
            char::from(other)
        ))),
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({self})")
    }
}

impl FromStr for InfoHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for InfoHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for InfoHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::from_hex(&text).map_err(D::Error::custom)
    }
}

/// A contiguous byte range within one torrent's linear data view (files
/// concatenated in declared order).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TorrentSlice {
    /// Torrent identity.
    pub info_hash: InfoHash,
    /// Offset of the first byte.
    pub start: u64,
    /// Offset of the last byte, plus one.
    pub stop: u64,
}

impl TorrentSlice {
    /// Create a slice.
    ///
    /// # Panics
    ///
    /// Panics if `start > stop`; a backwards slice is a programming error.
    #[must_use]
    pub fn new(info_hash: InfoHash, start: u64, stop: u64) -> Self {
        assert!(start <= stop, "slice start {start} past stop {stop}");
        Self {
            info_hash,
            start,
            stop,
        }
    }

    /// Number of bytes addressed.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.stop - self.start
    }

    /// Whether the slice addresses no bytes.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.start == self.stop
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_hash() -> InfoHash {
        InfoHash::new([0xab; 20])
    }

    #[test]
    fn hex_round_trip() {
        let hash = sample_hash();
        let text = hash.to_string();
        assert_eq!(text.len(), 40);
        assert_eq!(text, "ab".repeat(20));
        assert_eq!(InfoHash::from_hex(&text).unwrap(), hash);
        assert_eq!(InfoHash::from_hex(&text.to_uppercase()).unwrap(), hash);
    }

    #[test]
    fn rejects_bad_hex() {
        assert!(InfoHash::from_hex("abcd").is_err());
        assert!(InfoHash::from_hex(&"zz".repeat(20)).is_err());
    }

    #[test]
    fn slice_length() {
        let slice = TorrentSlice::new(sample_hash(), 10, 30);
        assert_eq!(slice.len(), 20);
        assert!(!slice.is_empty());
        assert!(TorrentSlice::new(sample_hash(), 5, 5).is_empty());
    }

    #[test]
    #[should_panic(expected = "slice start")]
    fn backwards_slice_panics() {
        let _ = TorrentSlice::new(sample_hash(), 2, 1);
    }
}
