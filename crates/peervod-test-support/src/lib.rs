#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::all)]

//! Shared test fixtures: deterministic synthetic torrents with real piece
//! hashes, and temp config directories laid out the way the application
//! expects.

use std::collections::BTreeMap;
use std::path::PathBuf;

use peervod_core::bencode::Value;
use peervod_core::TorrentMetadata;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tempfile::TempDir;

/// A torrent whose payload and metainfo were generated together, so piece
/// hashes verify against the content.
pub struct SyntheticTorrent {
    /// Parsed metainfo.
    pub metadata: TorrentMetadata,
    /// The full linear payload.
    pub content: Vec<u8>,
}

impl SyntheticTorrent {
    /// A single-file torrent named `payload.bin` with deterministic
    /// pseudo-random content.
    ///
    /// # Panics
    ///
    /// Panics if the generated metainfo fails to parse; that is a bug in
    /// the generator.
    #[must_use]
    pub fn single_file(total_len: u64, piece_length: u64) -> Self {
        let content = deterministic_bytes(total_len, 0x5eed);
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), Value::bytes("payload.bin"));
        info.insert(b"piece length".to_vec(), Value::Int(piece_length as i64));
        info.insert(b"length".to_vec(), Value::Int(total_len as i64));
        info.insert(
            b"pieces".to_vec(),
            Value::bytes(piece_hashes(&content, piece_length)),
        );
        let info_bytes = Value::Dict(info).encode();
        let metadata = TorrentMetadata::from_info_bytes(&info_bytes)
            .expect("generated metainfo must parse");
        Self { metadata, content }
    }

    /// A multi-file torrent under the directory name `album`. Each entry is
    /// `(relative_path, length)`, with `/`-separated components.
    ///
    /// # Panics
    ///
    /// Panics if the generated metainfo fails to parse; that is a bug in
    /// the generator.
    #[must_use]
    pub fn multi_file(files: &[(&str, u64)], piece_length: u64) -> Self {
        let total_len: u64 = files.iter().map(|(_, len)| len).sum();
        let content = deterministic_bytes(total_len, 0xa1b2);

        let entries: Vec<Value> = files
            .iter()
            .map(|(path, len)| {
                let mut entry = BTreeMap::new();
                entry.insert(b"length".to_vec(), Value::Int(*len as i64));
                entry.insert(
                    b"path".to_vec(),
                    Value::List(path.split('/').map(Value::bytes).collect()),
                );
                Value::Dict(entry)
            })
            .collect();

        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), Value::bytes("album"));
        info.insert(b"piece length".to_vec(), Value::Int(piece_length as i64));
        info.insert(b"files".to_vec(), Value::List(entries));
        info.insert(
            b"pieces".to_vec(),
            Value::bytes(piece_hashes(&content, piece_length)),
        );
        let info_bytes = Value::Dict(info).encode();
        let metadata = TorrentMetadata::from_info_bytes(&info_bytes)
            .expect("generated metainfo must parse");
        Self { metadata, content }
    }

    /// The bencoded `.torrent` file for this torrent.
    #[must_use]
    pub fn torrent_bytes(&self) -> Vec<u8> {
        self.metadata.to_torrent_bytes()
    }
}

fn deterministic_bytes(len: u64, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut bytes = vec![0_u8; usize::try_from(len).expect("length fits in memory")];
    rng.fill_bytes(&mut bytes);
    bytes
}

fn piece_hashes(content: &[u8], piece_length: u64) -> Vec<u8> {
    use sha1::{Digest, Sha1};
    let mut hashes = Vec::new();
    if content.is_empty() {
        return hashes;
    }
    for piece in content.chunks(usize::try_from(piece_length).expect("piece length fits")) {
        hashes.extend_from_slice(&Sha1::digest(piece));
    }
    hashes
}

/// A scratch config directory with the standard `resume/` and `downloads/`
/// subdirectories created.
pub struct ConfigDirFixture {
    dir: TempDir,
}

impl ConfigDirFixture {
    /// Create the fixture.
    ///
    /// # Panics
    ///
    /// Panics if the temp directory cannot be created.
    #[must_use]
    pub fn new() -> Self {
        let dir = TempDir::new().expect("temp dir");
        std::fs::create_dir_all(dir.path().join("resume")).expect("resume dir");
        std::fs::create_dir_all(dir.path().join("downloads")).expect("downloads dir");
        Self { dir }
    }

    /// The config directory root.
    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        self.dir.path()
    }

    /// The resume-data directory.
    #[must_use]
    pub fn resume_dir(&self) -> PathBuf {
        self.dir.path().join("resume")
    }

    /// The default download directory.
    #[must_use]
    pub fn downloads_dir(&self) -> PathBuf {
        self.dir.path().join("downloads")
    }
}

impl Default for ConfigDirFixture {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_file_hashes_verify() {
        let torrent = SyntheticTorrent::single_file(147_400, 16_384);
        assert_eq!(torrent.metadata.num_pieces, 9);
        assert_eq!(torrent.metadata.total_length, 147_400);
        // The final piece is short.
        assert_eq!(torrent.metadata.piece_size(8), 147_400 - 8 * 16_384);
        // Generation is deterministic.
        let again = SyntheticTorrent::single_file(147_400, 16_384);
        assert_eq!(again.metadata.info_hash, torrent.metadata.info_hash);
        assert_eq!(again.content, torrent.content);
    }

    #[test]
    fn multi_file_layout_matches_lengths() {
        let torrent =
            SyntheticTorrent::multi_file(&[("disc1/a.mkv", 30_000), ("b.nfo", 1_000)], 16_384);
        assert_eq!(torrent.metadata.total_length, 31_000);
        assert_eq!(torrent.metadata.files.len(), 2);
        assert_eq!(
            torrent.metadata.files[0].path,
            vec!["album".to_string(), "disc1".to_string(), "a.mkv".to_string()]
        );
        assert_eq!(torrent.metadata.files[1].start, 30_000);
    }

    #[test]
    fn config_dir_fixture_creates_layout() {
        let fixture = ConfigDirFixture::new();
        assert!(fixture.resume_dir().is_dir());
        assert!(fixture.downloads_dir().is_dir());
    }
}
