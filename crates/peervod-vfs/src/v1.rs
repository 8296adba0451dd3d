//! The `/v1/<infohash>/<accessor>/{f,i}` pseudo-root.
//!
//! `/v1` is lazy: torrents are materialized per lookup by asking the
//! registered providers for metadata, so the directory itself cannot be
//! enumerated.

use std::sync::Arc;

use peervod_core::{InfoHash, TorrentMetadata, TorrentSlice};
use peervod_io::MetainfoFetcher;
use tracing::warn;

use crate::node::{
    DirNode, Dirent, FileType, Node, Stat, StaticDir, SymlinkNode, SymlinkTarget, TorrentFileNode,
};
use crate::{VfsError, VfsInner};

pub(crate) struct V1Dir {
    pub(crate) inner: Arc<VfsInner>,
}

impl DirNode for V1Dir {
    fn lookup(&self, name: &str) -> Result<Node, VfsError> {
        let info_hash =
            InfoHash::from_hex(name).map_err(|_| VfsError::NotFound(name.to_owned()))?;
        // First provider that knows the torrent wins.
        for (provider_name, provider) in self.inner.providers() {
            let Some(info_bytes) = provider.resolve_metadata(info_hash) else {
                continue;
            };
            match TorrentMetadata::from_info_bytes(&info_bytes) {
                Ok(metadata) if metadata.info_hash == info_hash => {
                    return Ok(Node::Dir(Arc::new(V1TorrentDir {
                        inner: Arc::clone(&self.inner),
                        info_hash,
                        metadata: Arc::new(metadata),
                    })));
                }
                Ok(metadata) => {
                    warn!(
                        provider = provider_name.as_str(),
                        wanted = %info_hash,
                        got = %metadata.info_hash,
                        "provider returned metadata for the wrong torrent"
                    );
                }
                Err(err) => {
                    warn!(
                        provider = provider_name.as_str(),
                        %info_hash,
                        error = %err,
                        "provider returned unparseable metadata"
                    );
                }
            }
        }
        Err(VfsError::NotFound(name.to_owned()))
    }

    fn readdir(&self, _offset: usize) -> Result<Vec<Dirent>, VfsError> {
        // Enumerating every addressable torrent is not meaningful.
        Err(VfsError::NotSupported)
    }
}

pub(crate) struct V1TorrentDir {
    inner: Arc<VfsInner>,
    info_hash: InfoHash,
    metadata: Arc<TorrentMetadata>,
}

impl DirNode for V1TorrentDir {
    fn lookup(&self, name: &str) -> Result<Node, VfsError> {
        for (provider_name, provider) in self.inner.providers() {
            if provider_name != name {
                continue;
            }
            let Some(access) = provider.resolve_access(self.info_hash) else {
                break;
            };
            if let Some(target) = access.redirect_to {
                return Ok(Node::Symlink(Arc::new(SymlinkNode {
                    target: SymlinkTarget::Path(target),
                })));
            }
            let Some(fetch) = access.fetch else {
                break;
            };
            return Ok(build_access_dir(
                provider.as_ref(),
                &provider_name,
                self.info_hash,
                &self.metadata,
                &fetch,
            ));
        }
        Err(VfsError::NotFound(name.to_owned()))
    }

    fn readdir(&self, offset: usize) -> Result<Vec<Dirent>, VfsError> {
        let mut entries = Vec::new();
        for (provider_name, provider) in self.inner.providers() {
            let Some(access) = provider.resolve_access(self.info_hash) else {
                continue;
            };
            let file_type = if access.redirect_to.is_some() {
                FileType::Symlink
            } else {
                FileType::Directory
            };
            entries.push(Dirent {
                name: provider_name,
                stat: Stat {
                    file_type,
                    size: 0,
                    mtime: None,
                },
                next_offset: entries.len() + 1,
            });
        }
        Ok(entries.split_off(offset.min(entries.len())))
    }
}

/// A path is presentable in the `f/` view only if no component could
/// escape or alias the tree. Files with bad paths remain addressable by
/// index.
fn is_valid_path(components: &[String]) -> bool {
    components
        .iter()
        .all(|part| !part.is_empty() && part != "." && part != ".." && !part.contains('/'))
}

fn build_access_dir(
    provider: &dyn crate::TorrentProvider,
    provider_name: &str,
    info_hash: InfoHash,
    metadata: &TorrentMetadata,
    fetch: &MetainfoFetcher,
) -> Node {
    let mut by_index = StaticDir::new();
    let mut path_entries: Vec<(Vec<String>, Node)> = Vec::new();

    for file in &metadata.files {
        if file.is_pad || file.is_symlink || file.is_empty() {
            continue;
        }
        let mut hints = provider.file_hints(info_hash, file.index);
        hints.filename = file.path.last().cloned();
        let node = Node::File(Arc::new(TorrentFileNode {
            slice: TorrentSlice::new(info_hash, file.start, file.stop),
            fetch: Arc::clone(fetch),
            tracker: Some(provider_name.to_owned()),
            hints,
        }));
        by_index.mkchild(file.index.to_string(), node.clone());

        if is_valid_path(&file.path) {
            path_entries.push((
                file.path.clone(),
                Node::Symlink(Arc::new(SymlinkNode {
                    target: SymlinkTarget::Node(node),
                })),
            ));
        }
    }

    let by_path = build_tree(path_entries);

    let mut access = StaticDir::new();
    access.mkchild("i", by_index.into_node());
    access.mkchild("f", by_path.into_node());
    access.into_node()
}

/// Group path entries into nested static directories. On a file/directory
/// name collision the directory wins.
fn build_tree(entries: Vec<(Vec<String>, Node)>) -> StaticDir {
    let mut leaves: Vec<(String, Node)> = Vec::new();
    let mut subtrees: std::collections::BTreeMap<String, Vec<(Vec<String>, Node)>> =
        std::collections::BTreeMap::new();
    for (mut path, node) in entries {
        match path.len() {
            0 => {}
            1 => leaves.push((path.remove(0), node)),
            _ => {
                let head = path.remove(0);
                subtrees.entry(head).or_default().push((path, node));
            }
        }
    }
    let mut dir = StaticDir::new();
    for (name, node) in leaves {
        dir.mkchild(name, node);
    }
    for (name, entries) in subtrees {
        dir.mkchild(name, build_tree(entries).into_node());
    }
    dir
}
