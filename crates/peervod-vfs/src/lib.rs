#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::all)]

//! The virtual filesystem: a tree of directories, symlinks, and
//! torrent-backed files, resolving paths to byte ranges within torrents.
//!
//! Three fixed subtrees hang off the root:
//!
//! - `/v1/<infohash>/<accessor>/{f,i}` for direct addressing: `i/<k>` is
//!   the file at index `k`, `f/...` mirrors the declared paths with
//!   symlinks back into the index view.
//! - `/browse/<library>/...` for human browsing, populated by registered
//!   providers; leaves are typically symlinks into `/v1`.
//! - Nothing else.
//!
//! `/v1` is lazy: providers are consulted per lookup and `readdir` there
//! is unsupported.

pub mod node;
mod v1;

use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

use peervod_core::InfoHash;
use peervod_io::MetainfoFetcher;

pub use node::{
    DirNode, Dirent, FileHints, FileType, Node, Stat, StaticDir, SymlinkNode, SymlinkTarget,
    TorrentFileNode,
};

/// Bound on symlink follows during one resolution.
const MAX_SYMLINK_FOLLOWS: usize = 40;

/// Filesystem errors.
#[derive(Debug, thiserror::Error)]
pub enum VfsError {
    /// No such file or directory.
    #[error("not found: {0}")]
    NotFound(String),
    /// A path component other than the last was not a directory.
    #[error("not a directory")]
    NotADirectory,
    /// The operation is not meaningful for this node.
    #[error("operation not supported")]
    NotSupported,
    /// Too many levels of symbolic links.
    #[error("too many levels of symbolic links")]
    SymlinkLoop,
}

/// How a provider grants access to a torrent: either a redirect to another
/// path (materialized as a symlink), or a concrete metainfo fetch.
pub struct Access {
    /// Relative redirect target, e.g. another accessor's subtree.
    pub redirect_to: Option<String>,
    /// Concrete access: fetch the torrent's metainfo.
    pub fetch: Option<MetainfoFetcher>,
}

impl Access {
    /// A redirect.
    #[must_use]
    pub fn redirect(target: impl Into<String>) -> Self {
        Self {
            redirect_to: Some(target.into()),
            fetch: None,
        }
    }

    /// Concrete access through a metainfo fetcher.
    #[must_use]
    pub fn direct(fetch: MetainfoFetcher) -> Self {
        Self {
            redirect_to: None,
            fetch: Some(fetch),
        }
    }
}

/// An extension point: a named accessor/metadata/browse provider.
///
/// All methods have empty defaults so a provider implements only the
/// surfaces it serves.
pub trait TorrentProvider: Send + Sync {
    /// Access to a torrent's data, or `None` if unknown here.
    fn resolve_access(&self, info_hash: InfoHash) -> Option<Access> {
        let _ = info_hash;
        None
    }

    /// The torrent's bencoded `info` dictionary, or `None` if unknown.
    fn resolve_metadata(&self, info_hash: InfoHash) -> Option<Vec<u8>> {
        let _ = info_hash;
        None
    }

    /// Presentation hints for one file.
    fn file_hints(&self, info_hash: InfoHash, index: u32) -> FileHints {
        let _ = (info_hash, index);
        FileHints::default()
    }

    /// A browse tree exposed under `/browse/<name>`.
    fn browse_root(&self) -> Option<Node> {
        None
    }
}

pub(crate) struct VfsInner {
    providers: RwLock<Vec<(String, Arc<dyn TorrentProvider>)>>,
}

impl VfsInner {
    pub(crate) fn providers(&self) -> Vec<(String, Arc<dyn TorrentProvider>)> {
        self.providers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

/// The virtual filesystem root and provider registry.
#[derive(Clone)]
pub struct Vfs {
    inner: Arc<VfsInner>,
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs {
    /// An empty filesystem with no providers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(VfsInner {
                providers: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Register a provider. Lookup order is registration order; names are
    /// the accessor and browse directory names.
    pub fn register(&self, name: impl Into<String>, provider: Arc<dyn TorrentProvider>) {
        self.inner
            .providers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((name.into(), provider));
    }

    /// The root directory.
    #[must_use]
    pub fn root(&self) -> Node {
        let mut root = StaticDir::new();
        root.mkchild(
            "v1",
            Node::Dir(Arc::new(v1::V1Dir {
                inner: Arc::clone(&self.inner),
            })),
        );
        root.mkchild(
            "browse",
            Node::Dir(Arc::new(BrowseDir {
                inner: Arc::clone(&self.inner),
            })),
        );
        root.into_node()
    }

    /// Resolve a path, following symlinks (bounded).
    ///
    /// # Errors
    ///
    /// [`VfsError`] for missing components, non-directories along the way,
    /// or symlink loops.
    pub fn resolve(&self, path: &str) -> Result<Node, VfsError> {
        self.walk(path, true)
    }

    /// Resolve a path without following a final symlink (lstat-style).
    ///
    /// # Errors
    ///
    /// Same as [`Vfs::resolve`].
    pub fn resolve_nofollow(&self, path: &str) -> Result<Node, VfsError> {
        self.walk(path, false)
    }

    /// List a directory by path.
    ///
    /// # Errors
    ///
    /// Resolution errors, [`VfsError::NotADirectory`], or
    /// [`VfsError::NotSupported`].
    pub fn readdir(&self, path: &str, offset: usize) -> Result<Vec<Dirent>, VfsError> {
        self.resolve(path)?.as_dir()?.readdir(offset)
    }

    /// The `/v1/<infohash>` node for a torrent.
    ///
    /// # Errors
    ///
    /// [`VfsError::NotFound`] when no provider knows the torrent.
    pub fn lookup_torrent(&self, info_hash: InfoHash) -> Result<Node, VfsError> {
        self.resolve(&format!("/v1/{info_hash}"))
    }

    fn walk(&self, path: &str, follow_last: bool) -> Result<Node, VfsError> {
        let mut stack: Vec<Node> = vec![self.root()];
        let mut queue: VecDeque<String> =
            path.split('/').map(str::to_owned).collect();
        let mut follows = 0_usize;

        while let Some(token) = queue.pop_front() {
            match token.as_str() {
                "" | "." => {}
                ".." => {
                    if stack.len() > 1 {
                        stack.pop();
                    }
                }
                name => {
                    let current = stack.last().cloned().expect("stack never empties");
                    let child = current.as_dir()?.lookup(name)?;
                    match child {
                        Node::Symlink(link) if follow_last || !queue.is_empty() => {
                            follows += 1;
                            if follows > MAX_SYMLINK_FOLLOWS {
                                return Err(VfsError::SymlinkLoop);
                            }
                            match &link.target {
                                SymlinkTarget::Node(node) => stack.push(node.clone()),
                                SymlinkTarget::Path(target) => {
                                    // Absolute targets restart at the root;
                                    // relative ones resolve against the
                                    // current directory.
                                    if target.starts_with('/') {
                                        stack.truncate(1);
                                    }
                                    for part in target.split('/').rev() {
                                        queue.push_front(part.to_owned());
                                    }
                                }
                            }
                        }
                        other => stack.push(other),
                    }
                }
            }
        }
        Ok(stack.pop().expect("stack never empties"))
    }
}

struct BrowseDir {
    inner: Arc<VfsInner>,
}

impl DirNode for BrowseDir {
    fn lookup(&self, name: &str) -> Result<Node, VfsError> {
        for (provider_name, provider) in self.inner.providers() {
            if provider_name == name
                && let Some(root) = provider.browse_root()
            {
                return Ok(root);
            }
        }
        Err(VfsError::NotFound(name.to_owned()))
    }

    fn readdir(&self, offset: usize) -> Result<Vec<Dirent>, VfsError> {
        let mut entries = Vec::new();
        for (provider_name, provider) in self.inner.providers() {
            if let Some(root) = provider.browse_root() {
                entries.push(Dirent {
                    name: provider_name,
                    stat: root.stat(),
                    next_offset: entries.len() + 1,
                });
            }
        }
        Ok(entries.split_off(offset.min(entries.len())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peervod_core::bencode::Value;
    use std::collections::BTreeMap;

    /// A provider serving one synthetic multi-file torrent with a pad file
    /// and one file whose path cannot be presented.
    struct FakeProvider {
        info_bytes: Vec<u8>,
        info_hash: InfoHash,
        browse: Option<Node>,
        redirect: Option<String>,
    }

    impl TorrentProvider for FakeProvider {
        fn resolve_access(&self, info_hash: InfoHash) -> Option<Access> {
            if info_hash != self.info_hash {
                return None;
            }
            if let Some(target) = &self.redirect {
                return Some(Access::redirect(target.clone()));
            }
            let info_bytes = self.info_bytes.clone();
            Some(Access::direct(Arc::new(move || {
                Ok(peervod_core::bencode::wrap_info_dict(&info_bytes))
            })))
        }

        fn resolve_metadata(&self, info_hash: InfoHash) -> Option<Vec<u8>> {
            (info_hash == self.info_hash).then(|| self.info_bytes.clone())
        }

        fn browse_root(&self) -> Option<Node> {
            self.browse.clone()
        }
    }

    fn file_dict(path: &[&str], length: i64, attr: Option<&str>) -> Value {
        let mut dict = BTreeMap::new();
        dict.insert(b"length".to_vec(), Value::Int(length));
        dict.insert(
            b"path".to_vec(),
            Value::List(path.iter().map(|part| Value::bytes(*part)).collect()),
        );
        if let Some(attr) = attr {
            dict.insert(b"attr".to_vec(), Value::bytes(attr));
        }
        Value::Dict(dict)
    }

    fn sample_info() -> Vec<u8> {
        let files = vec![
            file_dict(&["season1", "e01.mkv"], 30_000, None),
            file_dict(&[".pad", "1"], 2_768, Some("p")),
            file_dict(&[".."], 100, None),
            file_dict(&["notes.txt"], 668, None),
        ];
        let total = 30_000 + 2_768 + 100 + 668;
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), Value::bytes("show"));
        info.insert(b"piece length".to_vec(), Value::Int(16_384));
        info.insert(b"files".to_vec(), Value::List(files));
        info.insert(
            b"pieces".to_vec(),
            Value::bytes(vec![0_u8; (total as usize).div_ceil(16_384) * 20]),
        );
        Value::Dict(info).encode()
    }

    fn fixture() -> (Vfs, InfoHash) {
        let info_bytes = sample_info();
        let metadata = peervod_core::TorrentMetadata::from_info_bytes(&info_bytes).unwrap();
        let info_hash = metadata.info_hash;
        let vfs = Vfs::new();
        vfs.register(
            "example",
            Arc::new(FakeProvider {
                info_bytes,
                info_hash,
                browse: None,
                redirect: None,
            }),
        );
        (vfs, info_hash)
    }

    #[test]
    fn v1_is_lazy_and_unenumerable() {
        let (vfs, info_hash) = fixture();
        assert!(matches!(
            vfs.readdir("/v1", 0),
            Err(VfsError::NotSupported)
        ));
        assert!(vfs.lookup_torrent(info_hash).is_ok());
        assert!(matches!(
            vfs.resolve("/v1/zzzz"),
            Err(VfsError::NotFound(_))
        ));
    }

    #[test]
    fn index_view_omits_pads_and_keeps_bad_paths() {
        let (vfs, info_hash) = fixture();
        let index_dir = format!("/v1/{info_hash}/example/i");
        let entries = vfs.readdir(&index_dir, 0).unwrap();
        let names: Vec<_> = entries.iter().map(|entry| entry.name.as_str()).collect();
        // Pad file (index 1) is gone; the bad-path file (index 2) stays
        // addressable by index.
        assert_eq!(names, vec!["0", "2", "3"]);

        let bad = vfs.resolve(&format!("{index_dir}/2")).unwrap();
        assert_eq!(bad.stat().size, 100);
    }

    #[test]
    fn path_view_resolves_through_symlinks_to_slices() {
        let (vfs, info_hash) = fixture();
        let path = format!("/v1/{info_hash}/example/f/show/season1/e01.mkv");
        let node = vfs.resolve(&path).unwrap();
        let Node::File(file) = &node else {
            panic!("expected a file node");
        };
        assert_eq!(file.slice.info_hash, info_hash);
        assert_eq!(file.slice.start, 0);
        assert_eq!(file.slice.stop, 30_000);
        assert_eq!(file.tracker.as_deref(), Some("example"));
        assert_eq!(file.hints.filename.as_deref(), Some("e01.mkv"));

        // lstat-style resolution reveals the symlink itself.
        let revealed = vfs.resolve_nofollow(&path).unwrap();
        assert_eq!(revealed.stat().file_type, FileType::Symlink);

        // The bad-path file is absent from the f/ view.
        let listing = vfs
            .readdir(&format!("/v1/{info_hash}/example/f/show"), 0)
            .unwrap();
        let names: Vec<_> = listing.iter().map(|entry| entry.name.as_str()).collect();
        assert_eq!(names, vec!["notes.txt", "season1"]);
    }

    #[test]
    fn dotdot_and_absolute_symlinks_walk_correctly() {
        let (vfs, info_hash) = fixture();
        let node = vfs
            .resolve(&format!(
                "/v1/{info_hash}/example/f/show/season1/../notes.txt"
            ))
            .unwrap();
        assert_eq!(node.stat().size, 668);

        // A browse tree linking into /v1 by absolute path.
        let browse_vfs = Vfs::new();
        let info_bytes = sample_info();
        let mut shows = StaticDir::new();
        shows.mkchild(
            "best-show",
            Node::Symlink(Arc::new(SymlinkNode {
                target: SymlinkTarget::Path(format!("/v1/{info_hash}/library")),
            })),
        );
        browse_vfs.register(
            "library",
            Arc::new(FakeProvider {
                info_bytes,
                info_hash,
                browse: Some(shows.into_node()),
                redirect: None,
            }),
        );
        let node = browse_vfs
            .resolve("/browse/library/best-show/i/0")
            .unwrap();
        assert_eq!(node.stat().size, 30_000);
    }

    #[test]
    fn redirect_accessors_materialize_as_symlinks() {
        let info_bytes = sample_info();
        let metadata = peervod_core::TorrentMetadata::from_info_bytes(&info_bytes).unwrap();
        let info_hash = metadata.info_hash;
        let vfs = Vfs::new();
        // Redirect targets are sibling accessor names, resolved against
        // the torrent directory.
        vfs.register(
            "default",
            Arc::new(FakeProvider {
                info_bytes: info_bytes.clone(),
                info_hash,
                browse: None,
                redirect: Some("example".to_owned()),
            }),
        );
        vfs.register(
            "example",
            Arc::new(FakeProvider {
                info_bytes,
                info_hash,
                browse: None,
                redirect: None,
            }),
        );

        let listing = vfs.readdir(&format!("/v1/{info_hash}"), 0).unwrap();
        assert_eq!(listing[0].name, "default");
        assert_eq!(listing[0].stat.file_type, FileType::Symlink);
        assert_eq!(listing[1].name, "example");
        assert_eq!(listing[1].stat.file_type, FileType::Directory);

        // Following the redirect lands in the concrete accessor.
        let node = vfs
            .resolve(&format!("/v1/{info_hash}/default/i/0"))
            .unwrap();
        assert_eq!(node.stat().size, 30_000);
    }

    #[test]
    fn symlink_loops_are_bounded() {
        let vfs = Vfs::new();
        let mut dir = StaticDir::new();
        dir.mkchild(
            "a",
            Node::Symlink(Arc::new(SymlinkNode {
                target: SymlinkTarget::Path("b".to_owned()),
            })),
        );
        dir.mkchild(
            "b",
            Node::Symlink(Arc::new(SymlinkNode {
                target: SymlinkTarget::Path("a".to_owned()),
            })),
        );
        struct LoopProvider {
            root: Node,
        }
        impl TorrentProvider for LoopProvider {
            fn browse_root(&self) -> Option<Node> {
                Some(self.root.clone())
            }
        }
        vfs.register(
            "loops",
            Arc::new(LoopProvider {
                root: dir.into_node(),
            }),
        );
        assert!(matches!(
            vfs.resolve("/browse/loops/a"),
            Err(VfsError::SymlinkLoop)
        ));
    }
}
