//! Startup enumeration of persisted resume state.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use peervod_core::bencode::Value;
use peervod_core::{AddTorrentParams, InfoHash, TorrentMetadata};
use tracing::warn;

use crate::RESUME_DIR_NAME;

/// Path of the stripped resume blob for a torrent.
#[must_use]
pub fn resume_data_path(data_dir: &Path, info_hash: InfoHash) -> PathBuf {
    data_dir.join(format!("{info_hash}.resume"))
}

/// Path of the persisted metainfo for a torrent.
#[must_use]
pub fn torrent_path(data_dir: &Path, info_hash: InfoHash) -> PathBuf {
    data_dir.join(format!("{info_hash}.torrent"))
}

/// Lazily yields an add-torrent descriptor per valid `<40-hex>.resume`
/// file. Unparseable or misnamed files are logged and skipped.
pub struct ResumeDataIter {
    entries: std::vec::IntoIter<PathBuf>,
}

impl Iterator for ResumeDataIter {
    type Item = AddTorrentParams;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let path = self.entries.next()?;
            if let Some(params) = load_one(&path) {
                return Some(params);
            }
        }
    }
}

/// Enumerate the resume directory of a config dir.
///
/// Entries are visited in filename order so restoration is deterministic.
#[must_use]
pub fn iter_resume_data(config_dir: &Path) -> ResumeDataIter {
    let data_dir = config_dir.join(RESUME_DIR_NAME);
    let mut paths: Vec<PathBuf> = match fs::read_dir(&data_dir) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .collect(),
        Err(_) => Vec::new(),
    };
    paths.sort();
    ResumeDataIter {
        entries: paths.into_iter(),
    }
}

fn load_one(path: &Path) -> Option<AddTorrentParams> {
    if path.extension().and_then(|ext| ext.to_str()) != Some("resume") {
        return None;
    }
    let stem = path.file_stem().and_then(|stem| stem.to_str())?;
    let Ok(info_hash) = InfoHash::from_hex(stem) else {
        warn!(path = %path.display(), "ignoring misnamed resume file");
        return None;
    };

    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "ignoring unreadable resume file");
            return None;
        }
    };
    let resume = match Value::decode(&data) {
        Ok(value @ Value::Dict(_)) => value,
        Ok(_) => {
            warn!(path = %path.display(), "ignoring non-dictionary resume file");
            return None;
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "ignoring unparseable resume file");
            return None;
        }
    };

    let mut params = AddTorrentParams::new(info_hash);
    if let Some(save_path) = resume
        .as_dict()
        .and_then(|dict| dict.get(b"save_path".as_slice()))
        .and_then(Value::as_bytes)
    {
        params.save_path = PathBuf::from(String::from_utf8_lossy(save_path).into_owned());
    }

    // The blob is stripped of the info dict on write; the sibling .torrent
    // is the canonical metainfo.
    let metadata = resume
        .as_dict()
        .and_then(|dict| dict.get(b"info".as_slice()))
        .and_then(Value::as_bytes)
        .and_then(|info| TorrentMetadata::from_info_bytes(info).ok())
        .or_else(|| load_sibling_metadata(path));
    if let Some(metadata) = metadata {
        if metadata.info_hash == info_hash {
            params.metadata = Some(Arc::new(metadata));
        } else {
            warn!(
                path = %path.display(),
                "ignoring metainfo whose infohash does not match the filename"
            );
        }
    }

    params.resume = Some(resume);
    Some(params)
}

fn load_sibling_metadata(resume_path: &Path) -> Option<TorrentMetadata> {
    let sibling = resume_path.with_extension("torrent");
    let data = fs::read(&sibling).ok()?;
    match TorrentMetadata::from_torrent_bytes(&data) {
        Ok(metadata) => Some(metadata),
        Err(err) => {
            warn!(path = %sibling.display(), error = %err, "ignoring unparseable torrent file");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peervod_core::bencode;
    use peervod_test_support::{ConfigDirFixture, SyntheticTorrent};
    use std::collections::BTreeMap;

    fn write_blob(dir: &Path, name: &str, value: &Value) {
        fs::write(dir.join(name), value.encode()).expect("write blob");
    }

    fn minimal_blob(save_path: &str) -> Value {
        let mut dict = BTreeMap::new();
        dict.insert(b"file-format".to_vec(), Value::bytes("libtorrent resume file"));
        dict.insert(b"save_path".to_vec(), Value::bytes(save_path));
        Value::Dict(dict)
    }

    #[test]
    fn yields_valid_entries_with_sibling_metadata() {
        let fixture = ConfigDirFixture::new();
        let torrent = SyntheticTorrent::single_file(32_768, 16_384);
        let info_hash = torrent.metadata.info_hash;

        write_blob(
            &fixture.resume_dir(),
            &format!("{info_hash}.resume"),
            &minimal_blob("/data/downloads"),
        );
        fs::write(
            torrent_path(&fixture.resume_dir(), info_hash),
            torrent.torrent_bytes(),
        )
        .expect("write torrent");

        let params: Vec<_> = iter_resume_data(fixture.path()).collect();
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].info_hash, info_hash);
        assert_eq!(params[0].save_path, PathBuf::from("/data/downloads"));
        let metadata = params[0].metadata.as_ref().expect("metadata");
        assert_eq!(metadata.info_hash, info_hash);
        assert!(params[0].resume.is_some());
    }

    #[test]
    fn skips_misnamed_and_garbage_files() {
        let fixture = ConfigDirFixture::new();
        let resume_dir = fixture.resume_dir();

        // Misnamed: stem is not 40 hex chars.
        write_blob(&resume_dir, "not-a-hash.resume", &minimal_blob("/x"));
        // Wrong extension.
        write_blob(&resume_dir, &format!("{}.backup", "ab".repeat(20)), &minimal_blob("/x"));
        // Garbage content.
        fs::write(resume_dir.join(format!("{}.resume", "cd".repeat(20))), b"not bencode")
            .expect("write garbage");

        assert_eq!(iter_resume_data(fixture.path()).count(), 0);
    }

    #[test]
    fn missing_directory_yields_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(iter_resume_data(dir.path()).count(), 0);
    }

    #[test]
    fn embedded_info_wins_over_sibling() {
        let fixture = ConfigDirFixture::new();
        let torrent = SyntheticTorrent::single_file(16_384, 16_384);
        let info_hash = torrent.metadata.info_hash;

        let mut dict = BTreeMap::new();
        dict.insert(b"info".to_vec(), Value::Bytes(torrent.metadata.info_bytes.clone()));
        write_blob(
            &fixture.resume_dir(),
            &format!("{info_hash}.resume"),
            &Value::Dict(dict),
        );

        let params: Vec<_> = iter_resume_data(fixture.path()).collect();
        assert_eq!(params.len(), 1);
        assert!(params[0].metadata.is_some());
    }

    #[test]
    fn mismatched_metainfo_is_dropped() {
        let fixture = ConfigDirFixture::new();
        let torrent = SyntheticTorrent::single_file(16_384, 16_384);
        // Name the resume file after a different infohash.
        let other = InfoHash::new([0x11; 20]);
        write_blob(
            &fixture.resume_dir(),
            &format!("{other}.resume"),
            &minimal_blob("/x"),
        );
        fs::write(
            torrent_path(&fixture.resume_dir(), other),
            bencode::wrap_info_dict(&torrent.metadata.info_bytes),
        )
        .expect("write torrent");

        let params: Vec<_> = iter_resume_data(fixture.path()).collect();
        assert_eq!(params.len(), 1);
        assert!(params[0].metadata.is_none());
    }
}
