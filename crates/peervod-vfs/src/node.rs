//! The node model: directories, symlinks, and torrent-backed files.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

use peervod_core::TorrentSlice;
use peervod_io::MetainfoFetcher;

use crate::VfsError;

/// File type reported by stat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// A directory.
    Directory,
    /// A regular (torrent-backed) file.
    File,
    /// A symbolic link.
    Symlink,
}

/// A minimal stat structure.
#[derive(Debug, Clone)]
pub struct Stat {
    /// Node type.
    pub file_type: FileType,
    /// Size in bytes; zero for directories.
    pub size: u64,
    /// Last-modified time, when known.
    pub mtime: Option<SystemTime>,
}

/// One directory entry.
///
/// `next_offset` can be passed back to `readdir` to resume listing after
/// this entry.
#[derive(Debug, Clone)]
pub struct Dirent {
    /// Entry name.
    pub name: String,
    /// Entry stat.
    pub stat: Stat,
    /// Offset of the entry after this one.
    pub next_offset: usize,
}

/// Presentation hints attached to a torrent-backed file.
#[derive(Debug, Clone, Default)]
pub struct FileHints {
    /// Last-modified time.
    pub mtime: Option<SystemTime>,
    /// MIME type for HTTP-style consumers.
    pub mime_type: Option<String>,
    /// Content encoding for HTTP-style consumers.
    pub content_encoding: Option<String>,
    /// Preferred download filename.
    pub filename: Option<String>,
}

/// Directory behavior. Static trees implement this over a map; lazy trees
/// resolve children on demand.
pub trait DirNode: Send + Sync {
    /// Look up a child by name.
    ///
    /// # Errors
    ///
    /// [`VfsError::NotFound`] when there is no such child.
    fn lookup(&self, name: &str) -> Result<Node, VfsError>;

    /// List entries starting at `offset` (0 for the beginning; an entry's
    /// `next_offset` to resume after it).
    ///
    /// # Errors
    ///
    /// [`VfsError::NotSupported`] for unenumerable directories.
    fn readdir(&self, offset: usize) -> Result<Vec<Dirent>, VfsError>;

    /// Directory mtime, when known.
    fn mtime(&self) -> Option<SystemTime> {
        None
    }
}

/// A symlink target: either a relative path, or a direct back-edge to
/// another node (used by the by-path view to point into the by-index
/// view).
#[derive(Clone)]
pub enum SymlinkTarget {
    /// Relative path, interpreted against the symlink's parent.
    Path(String),
    /// Direct node reference.
    Node(Node),
}

/// A symbolic link.
pub struct SymlinkNode {
    /// Where the link points.
    pub target: SymlinkTarget,
}

impl SymlinkNode {
    /// The path form of the target, for readlink-style consumers.
    #[must_use]
    pub fn readlink(&self) -> Option<&str> {
        match &self.target {
            SymlinkTarget::Path(path) => Some(path),
            SymlinkTarget::Node(_) => None,
        }
    }
}

/// A torrent-backed file: a byte range plus the means to fetch the
/// torrent's metainfo.
pub struct TorrentFileNode {
    /// The byte range within the torrent.
    pub slice: TorrentSlice,
    /// Fetches the bencoded `.torrent` for the engine.
    pub fetch: MetainfoFetcher,
    /// Accessor the file was resolved through.
    pub tracker: Option<String>,
    /// Presentation hints.
    pub hints: FileHints,
}

/// A node in the virtual filesystem.
#[derive(Clone)]
pub enum Node {
    /// A directory.
    Dir(Arc<dyn DirNode>),
    /// A torrent-backed file.
    File(Arc<TorrentFileNode>),
    /// A symlink.
    Symlink(Arc<SymlinkNode>),
}

impl Node {
    /// Stat for this node; symlinks describe themselves, not their target.
    #[must_use]
    pub fn stat(&self) -> Stat {
        match self {
            Self::Dir(dir) => Stat {
                file_type: FileType::Directory,
                size: 0,
                mtime: dir.mtime(),
            },
            Self::File(file) => Stat {
                file_type: FileType::File,
                size: file.slice.len(),
                mtime: file.hints.mtime,
            },
            Self::Symlink(link) => Stat {
                file_type: FileType::Symlink,
                size: link.readlink().map_or(0, |target| target.len() as u64),
                mtime: None,
            },
        }
    }

    /// Borrow as a directory.
    ///
    /// # Errors
    ///
    /// [`VfsError::NotADirectory`] otherwise.
    pub fn as_dir(&self) -> Result<&Arc<dyn DirNode>, VfsError> {
        match self {
            Self::Dir(dir) => Ok(dir),
            _ => Err(VfsError::NotADirectory),
        }
    }
}

/// A directory with fixed contents, built up front.
#[derive(Default)]
pub struct StaticDir {
    children: BTreeMap<String, Node>,
    mtime: Option<SystemTime>,
}

impl StaticDir {
    /// An empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty directory with an mtime.
    #[must_use]
    pub fn with_mtime(mtime: SystemTime) -> Self {
        Self {
            children: BTreeMap::new(),
            mtime: Some(mtime),
        }
    }

    /// Add a child node.
    pub fn mkchild(&mut self, name: impl Into<String>, node: Node) {
        self.children.insert(name.into(), node);
    }

    /// Borrow a child.
    #[must_use]
    pub fn child(&self, name: &str) -> Option<&Node> {
        self.children.get(name)
    }

    /// Whether the directory has no children.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Wrap into a [`Node`].
    #[must_use]
    pub fn into_node(self) -> Node {
        Node::Dir(Arc::new(self))
    }
}

impl DirNode for StaticDir {
    fn lookup(&self, name: &str) -> Result<Node, VfsError> {
        self.children
            .get(name)
            .cloned()
            .ok_or_else(|| VfsError::NotFound(name.to_owned()))
    }

    fn readdir(&self, offset: usize) -> Result<Vec<Dirent>, VfsError> {
        Ok(self
            .children
            .iter()
            .enumerate()
            .skip(offset)
            .map(|(index, (name, node))| Dirent {
                name: name.clone(),
                stat: node.stat(),
                next_offset: index + 1,
            })
            .collect())
    }

    fn mtime(&self) -> Option<SystemTime> {
        self.mtime
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peervod_core::InfoHash;

    fn file_node(size: u64) -> Node {
        Node::File(Arc::new(TorrentFileNode {
            slice: TorrentSlice::new(InfoHash::new([1; 20]), 0, size),
            fetch: Arc::new(|| Ok(Vec::new())),
            tracker: None,
            hints: FileHints::default(),
        }))
    }

    #[test]
    fn static_dir_lists_in_name_order_with_offsets() {
        let mut dir = StaticDir::new();
        dir.mkchild("zeta", file_node(1));
        dir.mkchild("alpha", file_node(2));
        dir.mkchild(
            "link",
            Node::Symlink(Arc::new(SymlinkNode {
                target: SymlinkTarget::Path("../alpha".into()),
            })),
        );

        let entries = dir.readdir(0).unwrap();
        let names: Vec<_> = entries.iter().map(|entry| entry.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "link", "zeta"]);
        assert_eq!(entries[1].stat.file_type, FileType::Symlink);

        // Resuming from a next_offset skips what was already listed.
        let rest = dir.readdir(entries[0].next_offset).unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].name, "link");
    }

    #[test]
    fn stat_reports_sizes() {
        let node = file_node(321);
        assert_eq!(node.stat().size, 321);
        assert_eq!(node.stat().file_type, FileType::File);
        let mut dir = StaticDir::new();
        dir.mkchild("f", node);
        let dir_node = dir.into_node();
        assert_eq!(dir_node.stat().file_type, FileType::Directory);
        assert!(dir_node.as_dir().is_ok());
    }

    #[test]
    fn missing_child_is_not_found() {
        let dir = StaticDir::new();
        assert!(matches!(dir.lookup("nope"), Err(VfsError::NotFound(_))));
    }
}
