use std::collections::BTreeMap;

use sha1::{Digest, Sha1};

use crate::bencode::{self, Value};
use crate::error::{Error, Result};
use crate::types::InfoHash;

/// One file within a torrent's payload.
///
/// `path` is the full component list including the torrent name; components
/// are decoded as UTF-8 with invalid bytes replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Index of the file within the metainfo.
    pub index: u32,
    /// Path components, torrent name first.
    pub path: Vec<String>,
    /// Offset of the first byte within the linear data view.
    pub start: u64,
    /// Offset of the last byte, plus one.
    pub stop: u64,
    /// BEP 47 padding file; carries no payload of interest.
    pub is_pad: bool,
    /// BEP 47 symlink file.
    pub is_symlink: bool,
    /// Symlink target components (empty unless `is_symlink`).
    pub symlink_target: Vec<String>,
}

impl FileEntry {
    /// File length in bytes.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.stop - self.start
    }

    /// Whether the file is zero-length.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.start == self.stop
    }
}

/// Immutable torrent metadata, parsed once from a bencoded `info`
/// dictionary and shared by reference afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentMetadata {
    /// SHA-1 of `info_bytes`.
    pub info_hash: InfoHash,
    /// Torrent display name.
    pub name: String,
    /// Length of every piece except possibly the last.
    pub piece_length: u64,
    /// Total number of pieces.
    pub num_pieces: u32,
    /// Total payload length in bytes.
    pub total_length: u64,
    /// Files in declared order.
    pub files: Vec<FileEntry>,
    /// Per-piece SHA-1 digests.
    pub piece_hashes: Vec<[u8; 20]>,
    /// The canonical bencoded `info` dictionary.
    pub info_bytes: Vec<u8>,
}

impl TorrentMetadata {
    /// Parse from a bencoded `info` dictionary.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Bencode`] on malformed bencode and
    /// [`Error::Metainfo`] when required keys are missing or ill-typed.
    pub fn from_info_bytes(info_bytes: &[u8]) -> Result<Self> {
        let value = Value::decode(info_bytes)?;
        let dict = value
            .as_dict()
            .ok_or_else(|| Error::Metainfo("info is not a dictionary".into()))?;

        let name = String::from_utf8_lossy(require_bytes(dict, b"name")?).into_owned();
        let piece_length = require_int(dict, b"piece length")?;
        let piece_length = u64::try_from(piece_length)
            .ok()
            .filter(|len| *len > 0)
            .ok_or_else(|| Error::Metainfo(format!("bad piece length {piece_length}")))?;

        let hashes_blob = require_bytes(dict, b"pieces")?;
        if hashes_blob.len() % 20 != 0 {
            return Err(Error::Metainfo(format!(
                "pieces blob length {} not a multiple of 20",
                hashes_blob.len()
            )));
        }
        let piece_hashes: Vec<[u8; 20]> = hashes_blob
            .chunks_exact(20)
            .map(|chunk| {
                let mut digest = [0_u8; 20];
                digest.copy_from_slice(chunk);
                digest
            })
            .collect();

        let files = parse_files(dict, &name)?;
        let total_length = files.last().map_or(0, |file| file.stop);

        let num_pieces = u32::try_from(piece_hashes.len())
            .map_err(|_| Error::Metainfo("too many pieces".into()))?;
        let expected = total_length.div_ceil(piece_length);
        if total_length > 0 && u64::from(num_pieces) != expected {
            return Err(Error::Metainfo(format!(
                "{num_pieces} piece hashes for {total_length} bytes of {piece_length}-byte pieces"
            )));
        }

        let digest = Sha1::digest(info_bytes);
        let mut hash = [0_u8; 20];
        hash.copy_from_slice(&digest);

        Ok(Self {
            info_hash: InfoHash::new(hash),
            name,
            piece_length,
            num_pieces,
            total_length,
            files,
            piece_hashes,
            info_bytes: info_bytes.to_vec(),
        })
    }

    /// Parse from a full `.torrent` file (a dictionary with an `info` key).
    ///
    /// # Errors
    ///
    /// Propagates the errors of [`TorrentMetadata::from_info_bytes`].
    pub fn from_torrent_bytes(torrent: &[u8]) -> Result<Self> {
        let info = bencode::extract_info_slice(torrent)?;
        Self::from_info_bytes(info)
    }

    /// Size of `piece`, accounting for the short final piece.
    #[must_use]
    pub fn piece_size(&self, piece: u32) -> u64 {
        if self.num_pieces == 0 || piece >= self.num_pieces {
            return 0;
        }
        if piece + 1 == self.num_pieces {
            self.total_length - u64::from(piece) * self.piece_length
        } else {
            self.piece_length
        }
    }

    /// A minimal `.torrent` file wrapping this metadata.
    #[must_use]
    pub fn to_torrent_bytes(&self) -> Vec<u8> {
        bencode::wrap_info_dict(&self.info_bytes)
    }
}

fn require_bytes<'d>(dict: &'d BTreeMap<Vec<u8>, Value>, key: &[u8]) -> Result<&'d [u8]> {
    dict.get(key)
        .and_then(Value::as_bytes)
        .ok_or_else(|| missing(key))
}

fn require_int(dict: &BTreeMap<Vec<u8>, Value>, key: &[u8]) -> Result<i64> {
    dict.get(key).and_then(Value::as_int).ok_or_else(|| missing(key))
}

fn missing(key: &[u8]) -> Error {
    Error::Metainfo(format!("missing key {:?}", String::from_utf8_lossy(key)))
}

fn decode_component(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn parse_files(dict: &BTreeMap<Vec<u8>, Value>, name: &str) -> Result<Vec<FileEntry>> {
    let Some(file_list) = dict.get(b"files".as_slice()) else {
        // Single-file layout: the name is the file name.
        let length = require_int(dict, b"length")?;
        let length =
            u64::try_from(length).map_err(|_| Error::Metainfo("negative length".into()))?;
        let attr = dict
            .get(b"attr".as_slice())
            .and_then(Value::as_bytes)
            .unwrap_or_default();
        return Ok(vec![FileEntry {
            index: 0,
            path: vec![name.to_owned()],
            start: 0,
            stop: length,
            is_pad: attr.contains(&b'p'),
            is_symlink: attr.contains(&b'l'),
            symlink_target: Vec::new(),
        }]);
    };

    let file_list = file_list
        .as_list()
        .ok_or_else(|| Error::Metainfo("files is not a list".into()))?;

    let mut files = Vec::with_capacity(file_list.len());
    let mut offset = 0_u64;
    for (index, entry) in file_list.iter().enumerate() {
        let entry = entry
            .as_dict()
            .ok_or_else(|| Error::Metainfo(format!("file {index} is not a dictionary")))?;
        // Length can be absent for symlinks.
        let length = entry
            .get(b"length".as_slice())
            .and_then(Value::as_int)
            .unwrap_or(0);
        let length =
            u64::try_from(length).map_err(|_| Error::Metainfo("negative file length".into()))?;
        let attr = entry
            .get(b"attr".as_slice())
            .and_then(Value::as_bytes)
            .unwrap_or_default();
        let is_symlink = attr.contains(&b'l');

        let mut path = vec![name.to_owned()];
        let components = entry
            .get(b"path".as_slice())
            .and_then(Value::as_list)
            .ok_or_else(|| Error::Metainfo(format!("file {index} has no path")))?;
        for component in components {
            let component = component
                .as_bytes()
                .ok_or_else(|| Error::Metainfo(format!("file {index} path is not bytes")))?;
            path.push(decode_component(component));
        }

        let mut symlink_target = Vec::new();
        if is_symlink {
            symlink_target.push(name.to_owned());
            if let Some(target) = entry.get(b"symlink path".as_slice()).and_then(Value::as_list) {
                for component in target {
                    if let Some(bytes) = component.as_bytes() {
                        symlink_target.push(decode_component(bytes));
                    }
                }
            }
        }

        files.push(FileEntry {
            index: u32::try_from(index).map_err(|_| Error::Metainfo("too many files".into()))?,
            path,
            start: offset,
            stop: offset + length,
            is_pad: attr.contains(&b'p'),
            is_symlink,
            symlink_target,
        });
        offset += length;
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_file_info() -> Vec<u8> {
        // 32 bytes, 16-byte pieces, two dummy hashes.
        let mut dict = BTreeMap::new();
        dict.insert(b"name".to_vec(), Value::bytes("demo.bin"));
        dict.insert(b"piece length".to_vec(), Value::Int(16));
        dict.insert(b"length".to_vec(), Value::Int(32));
        dict.insert(b"pieces".to_vec(), Value::bytes(vec![0_u8; 40]));
        Value::Dict(dict).encode()
    }

    #[test]
    fn parses_single_file_layout() {
        let info = single_file_info();
        let meta = TorrentMetadata::from_info_bytes(&info).unwrap();
        assert_eq!(meta.name, "demo.bin");
        assert_eq!(meta.piece_length, 16);
        assert_eq!(meta.num_pieces, 2);
        assert_eq!(meta.total_length, 32);
        assert_eq!(meta.files.len(), 1);
        assert_eq!(meta.files[0].path, vec!["demo.bin".to_string()]);
        assert_eq!(meta.info_bytes, info);
    }

    #[test]
    fn parses_multi_file_layout_with_padding() {
        let mut pad = BTreeMap::new();
        pad.insert(b"length".to_vec(), Value::Int(6));
        pad.insert(b"path".to_vec(), Value::List(vec![Value::bytes(".pad")]));
        pad.insert(b"attr".to_vec(), Value::bytes("p"));

        let mut file_a = BTreeMap::new();
        file_a.insert(b"length".to_vec(), Value::Int(10));
        file_a.insert(
            b"path".to_vec(),
            Value::List(vec![Value::bytes("sub"), Value::bytes("a.bin")]),
        );

        let mut dict = BTreeMap::new();
        dict.insert(b"name".to_vec(), Value::bytes("album"));
        dict.insert(b"piece length".to_vec(), Value::Int(16));
        dict.insert(
            b"files".to_vec(),
            Value::List(vec![Value::Dict(file_a), Value::Dict(pad)]),
        );
        dict.insert(b"pieces".to_vec(), Value::bytes(vec![0_u8; 20]));

        let meta = TorrentMetadata::from_info_bytes(&Value::Dict(dict).encode()).unwrap();
        assert_eq!(meta.total_length, 16);
        assert_eq!(meta.files.len(), 2);
        assert_eq!(
            meta.files[0].path,
            vec!["album".to_string(), "sub".to_string(), "a.bin".to_string()]
        );
        assert_eq!(meta.files[0].start, 0);
        assert_eq!(meta.files[0].stop, 10);
        assert!(meta.files[1].is_pad);
        assert_eq!(meta.files[1].start, 10);
        assert_eq!(meta.files[1].stop, 16);
    }

    #[test]
    fn last_piece_is_short() {
        let mut dict = BTreeMap::new();
        dict.insert(b"name".to_vec(), Value::bytes("x"));
        dict.insert(b"piece length".to_vec(), Value::Int(16));
        dict.insert(b"length".to_vec(), Value::Int(20));
        dict.insert(b"pieces".to_vec(), Value::bytes(vec![0_u8; 40]));
        let meta = TorrentMetadata::from_info_bytes(&Value::Dict(dict).encode()).unwrap();
        assert_eq!(meta.piece_size(0), 16);
        assert_eq!(meta.piece_size(1), 4);
        assert_eq!(meta.piece_size(2), 0);
    }

    #[test]
    fn torrent_wrapper_round_trip() {
        let info = single_file_info();
        let meta = TorrentMetadata::from_info_bytes(&info).unwrap();
        let torrent = meta.to_torrent_bytes();
        let reparsed = TorrentMetadata::from_torrent_bytes(&torrent).unwrap();
        assert_eq!(reparsed.info_hash, meta.info_hash);
        assert_eq!(reparsed.info_bytes, info);
    }

    #[test]
    fn rejects_piece_count_mismatch() {
        let mut dict = BTreeMap::new();
        dict.insert(b"name".to_vec(), Value::bytes("x"));
        dict.insert(b"piece length".to_vec(), Value::Int(16));
        dict.insert(b"length".to_vec(), Value::Int(64));
        dict.insert(b"pieces".to_vec(), Value::bytes(vec![0_u8; 20]));
        assert!(TorrentMetadata::from_info_bytes(&Value::Dict(dict).encode()).is_err());
    }
}
