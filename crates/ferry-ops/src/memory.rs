//! In-memory adapter with fault injection.
//!
//! `MemoryFs` models a filesystem tree, a trash and optional device
//! boundaries. Paths are used verbatim; `/` always exists. Faults can be
//! injected per path so failure handling can be exercised deterministically.
//! Only built for tests and with the `test-util` feature.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use ferry_core::{ErrorKind, FsError};
use tokio_util::sync::CancellationToken;

use crate::adapter::sealed::Primitives;
use crate::adapter::{EntryKind, EntryMeta, FileSystemAdapter, TrashItem};
use crate::operation::sibling;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    File { len: u64 },
    Dir,
    Symlink { target: PathBuf },
}

impl Node {
    fn meta(&self) -> EntryMeta {
        match self {
            Self::File { len } => EntryMeta {
                kind: EntryKind::File,
                len: *len,
            },
            Self::Dir => EntryMeta {
                kind: EntryKind::Directory,
                len: 0,
            },
            Self::Symlink { .. } => EntryMeta {
                kind: EntryKind::Symlink,
                len: 0,
            },
        }
    }
}

static ROOT: Node = Node::Dir;

#[derive(Debug)]
struct Trashed {
    item: TrashItem,
    // Entries relative to the trashed root; the root itself is the empty path.
    nodes: Vec<(PathBuf, Node)>,
}

#[derive(Debug, Default)]
struct State {
    nodes: BTreeMap<PathBuf, Node>,
    trash: Vec<Trashed>,
    faults: HashMap<PathBuf, ErrorKind>,
    tripwires: HashMap<PathBuf, CancellationToken>,
    devices: Vec<PathBuf>,
    next_trash_id: u64,
    files_written: usize,
    touched: Vec<PathBuf>,
}

/// In-memory [`FileSystemAdapter`].
#[derive(Debug, Default)]
pub struct MemoryFs {
    state: Mutex<State>,
    latency: Option<Duration>,
}

impl MemoryFs {
    /// Create an empty filesystem containing only `/`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep for `latency` on every file write, to make long jobs observable.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means a test thread panicked mid-operation.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a directory and any missing ancestors.
    pub fn add_dir(&self, path: impl AsRef<Path>) {
        let mut state = self.lock();
        state.ensure_dirs(path.as_ref());
    }

    /// Create a file of `len` bytes, creating missing ancestors.
    pub fn add_file(&self, path: impl AsRef<Path>, len: u64) {
        let path = path.as_ref();
        let mut state = self.lock();
        if let Some(parent) = path.parent() {
            state.ensure_dirs(parent);
        }
        state.nodes.insert(path.to_path_buf(), Node::File { len });
    }

    /// Make every primitive touching `path` fail with `kind`.
    pub fn fail_on(&self, path: impl AsRef<Path>, kind: ErrorKind) {
        self.lock().faults.insert(path.as_ref().to_path_buf(), kind);
    }

    /// Remove an injected fault.
    pub fn clear_fault(&self, path: impl AsRef<Path>) {
        self.lock().faults.remove(path.as_ref());
    }

    /// Cancel `token` the first time a primitive checks `path`.
    pub fn cancel_on(&self, path: impl AsRef<Path>, token: CancellationToken) {
        self.lock()
            .tripwires
            .insert(path.as_ref().to_path_buf(), token);
    }

    /// Declare `root` as the mount point of a separate device.
    pub fn add_device(&self, root: impl AsRef<Path>) {
        let root = root.as_ref().to_path_buf();
        let mut state = self.lock();
        state.ensure_dirs(&root);
        state.devices.push(root);
    }

    /// Whether anything exists at `path`.
    pub fn exists(&self, path: impl AsRef<Path>) -> bool {
        self.stat(path.as_ref()).is_some()
    }

    /// Whether `path` is a directory.
    pub fn is_dir(&self, path: impl AsRef<Path>) -> bool {
        self.stat(path.as_ref()).is_some_and(|m| m.is_dir())
    }

    /// Whether `path` is a regular file.
    pub fn is_file(&self, path: impl AsRef<Path>) -> bool {
        self.stat(path.as_ref())
            .is_some_and(|m| m.kind == EntryKind::File)
    }

    /// Size of the file at `path`.
    pub fn file_len(&self, path: impl AsRef<Path>) -> Option<u64> {
        self.stat(path.as_ref())
            .filter(|m| m.kind == EntryKind::File)
            .map(|m| m.len)
    }

    /// Every path currently present, sorted.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.lock().nodes.keys().cloned().collect()
    }

    /// Number of items in the trash.
    pub fn trash_len(&self) -> usize {
        self.lock().trash.len()
    }

    /// Number of files written by `copy_file` so far.
    pub fn files_written(&self) -> usize {
        self.lock().files_written
    }

    /// Paths passed to mutating primitives, in call order.
    pub fn touched(&self) -> Vec<PathBuf> {
        self.lock().touched.clone()
    }

    /// Forget the recorded mutating calls.
    pub fn clear_touched(&self) {
        self.lock().touched.clear();
    }

    fn pause(&self) {
        if let Some(latency) = self.latency {
            std::thread::sleep(latency);
        }
    }
}

impl State {
    fn ensure_dirs(&mut self, path: &Path) {
        for ancestor in path.ancestors() {
            if ancestor.as_os_str().is_empty() || is_root(ancestor) {
                continue;
            }
            self.nodes
                .entry(ancestor.to_path_buf())
                .or_insert(Node::Dir);
        }
    }

    fn get(&self, path: &Path) -> Option<&Node> {
        if is_root(path) {
            return Some(&ROOT);
        }
        self.nodes.get(path)
    }

    fn check(&self, path: &Path) -> Result<(), FsError> {
        if let Some(token) = self.tripwires.get(path) {
            token.cancel();
        }
        match self.faults.get(path) {
            Some(kind) => Err(injected(*kind, path)),
            None => Ok(()),
        }
    }

    fn require(&self, path: &Path) -> Result<&Node, FsError> {
        self.check(path)?;
        self.get(path).ok_or_else(|| FsError::NotFound {
            path: path.to_path_buf(),
        })
    }

    fn require_parent(&self, path: &Path) -> Result<(), FsError> {
        let parent = path.parent().unwrap_or(Path::new("/"));
        match self.get(parent) {
            Some(Node::Dir) => Ok(()),
            Some(_) => Err(FsError::invalid_target(parent, "Parent is not a directory")),
            None => Err(FsError::NotFound {
                path: parent.to_path_buf(),
            }),
        }
    }

    fn require_vacant(&self, path: &Path) -> Result<(), FsError> {
        self.check(path)?;
        if self.get(path).is_some() {
            return Err(FsError::AlreadyExists {
                path: path.to_path_buf(),
            });
        }
        self.require_parent(path)
    }

    fn children(&self, path: &Path) -> Vec<PathBuf> {
        self.nodes
            .keys()
            .filter(|p| p.parent() == Some(path))
            .cloned()
            .collect()
    }

    fn device_of(&self, path: &Path) -> Option<&PathBuf> {
        self.devices
            .iter()
            .filter(|root| path.starts_with(root))
            .max_by_key(|root| root.components().count())
    }

    // Detach `path` and everything below it, returning entries relative to it.
    fn detach(&mut self, path: &Path) -> Vec<(PathBuf, Node)> {
        let keys: Vec<PathBuf> = self
            .nodes
            .keys()
            .filter(|p| p.starts_with(path))
            .cloned()
            .collect();
        keys.into_iter()
            .filter_map(|key| {
                let node = self.nodes.remove(&key)?;
                let rel = key.strip_prefix(path).map(Path::to_path_buf).ok()?;
                Some((rel, node))
            })
            .collect()
    }

    fn attach(&mut self, root: &Path, nodes: Vec<(PathBuf, Node)>) {
        for (rel, node) in nodes {
            let path = if rel.as_os_str().is_empty() {
                root.to_path_buf()
            } else {
                root.join(rel)
            };
            self.nodes.insert(path, node);
        }
    }

    fn touch(&mut self, path: &Path) {
        self.touched.push(path.to_path_buf());
    }
}

impl FileSystemAdapter for MemoryFs {}

impl Primitives for MemoryFs {
    fn stat(&self, path: &Path) -> Option<EntryMeta> {
        self.lock().get(path).map(Node::meta)
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>, FsError> {
        let state = self.lock();
        match state.require(path)? {
            Node::Dir => Ok(state.children(path)),
            _ => Err(FsError::invalid_target(path, "Not a directory")),
        }
    }

    fn copy_file(
        &self,
        source: &Path,
        destination: &Path,
        overwrite: bool,
    ) -> Result<u64, FsError> {
        self.pause();
        let mut state = self.lock();
        let node = state.require(source)?.clone();
        if matches!(node, Node::Dir) {
            return Err(FsError::invalid_target(source, "Is a directory"));
        }
        state.check(destination)?;
        match state.get(destination) {
            Some(Node::Dir) => {
                return Err(FsError::invalid_target(
                    destination,
                    "Cannot replace a directory with a file",
                ));
            }
            Some(_) if !overwrite => {
                return Err(FsError::AlreadyExists {
                    path: destination.to_path_buf(),
                });
            }
            _ => state.require_parent(destination)?,
        }
        let len = node.meta().len;
        state.touch(destination);
        state.nodes.insert(destination.to_path_buf(), node);
        state.files_written += 1;
        Ok(len)
    }

    fn create_folder(&self, path: &Path) -> Result<PathBuf, FsError> {
        let mut state = self.lock();
        state.require_vacant(path)?;
        state.touch(path);
        state.nodes.insert(path.to_path_buf(), Node::Dir);
        Ok(path.to_path_buf())
    }

    fn create_file(&self, path: &Path) -> Result<PathBuf, FsError> {
        let mut state = self.lock();
        state.require_vacant(path)?;
        state.touch(path);
        state.nodes.insert(path.to_path_buf(), Node::File { len: 0 });
        Ok(path.to_path_buf())
    }

    fn create_symlink(&self, target: &Path, link: &Path) -> Result<PathBuf, FsError> {
        let mut state = self.lock();
        state.require_vacant(link)?;
        state.touch(link);
        state.nodes.insert(
            link.to_path_buf(),
            Node::Symlink {
                target: target.to_path_buf(),
            },
        );
        Ok(link.to_path_buf())
    }

    fn move_entry(
        &self,
        source: &Path,
        destination: &Path,
        overwrite: bool,
    ) -> Result<PathBuf, FsError> {
        let mut state = self.lock();
        let source_is_dir = matches!(state.require(source)?, Node::Dir);
        state.check(destination)?;

        if state.device_of(source) != state.device_of(destination) {
            return Err(FsError::CrossDevice {
                from: source.to_path_buf(),
                to: destination.to_path_buf(),
            });
        }

        let existing_is_dir = state.get(destination).map(|n| matches!(n, Node::Dir));
        match existing_is_dir {
            Some(_) if !overwrite => {
                return Err(FsError::AlreadyExists {
                    path: destination.to_path_buf(),
                });
            }
            Some(true) if source_is_dir => {
                return Err(FsError::WouldMerge {
                    from: source.to_path_buf(),
                    to: destination.to_path_buf(),
                });
            }
            Some(true) => {
                return Err(FsError::invalid_target(
                    destination,
                    "Cannot replace a directory with a file",
                ));
            }
            Some(false) => {
                state.nodes.remove(destination);
            }
            None => state.require_parent(destination)?,
        }

        state.touch(source);
        state.touch(destination);
        let nodes = state.detach(source);
        state.attach(destination, nodes);
        Ok(destination.to_path_buf())
    }

    fn rename(&self, path: &Path, new_name: &str) -> Result<PathBuf, FsError> {
        let destination = sibling(path, new_name);
        {
            let state = self.lock();
            state.require(path)?;
            if destination == path {
                return Ok(destination);
            }
            if state.get(&destination).is_some() {
                return Err(FsError::AlreadyExists { path: destination });
            }
        }
        self.move_entry(path, &destination, false)
    }

    fn remove(&self, path: &Path) -> Result<(), FsError> {
        let mut state = self.lock();
        if matches!(state.require(path)?, Node::Dir) && !state.children(path).is_empty() {
            return Err(FsError::invalid_target(path, "Directory not empty"));
        }
        state.touch(path);
        state.nodes.remove(path);
        Ok(())
    }

    fn trash(&self, path: &Path) -> Result<TrashItem, FsError> {
        let mut state = self.lock();
        state.require(path)?;
        state.touch(path);
        state.next_trash_id += 1;
        let item = TrashItem {
            id: format!("trash-{}", state.next_trash_id),
            original_path: path.to_path_buf(),
            deleted_at: state.next_trash_id as i64,
        };
        let nodes = state.detach(path);
        state.trash.push(Trashed {
            item: item.clone(),
            nodes,
        });
        Ok(item)
    }

    fn restore(&self, item: &TrashItem) -> Result<PathBuf, FsError> {
        let mut state = self.lock();
        state.require_vacant(&item.original_path)?;
        let index = state
            .trash
            .iter()
            .position(|t| t.item.id == item.id)
            .ok_or_else(|| FsError::NotFound {
                path: item.original_path.clone(),
            })?;
        let trashed = state.trash.remove(index);
        state.touch(&item.original_path);
        state.attach(&item.original_path, trashed.nodes);
        Ok(item.original_path.clone())
    }

    fn enumerate_trash(&self) -> Result<Vec<TrashItem>, FsError> {
        Ok(self.lock().trash.iter().map(|t| t.item.clone()).collect())
    }

    fn empty_trash(&self) -> Result<(), FsError> {
        self.lock().trash.clear();
        Ok(())
    }
}

fn is_root(path: &Path) -> bool {
    path.parent().is_none() && path.has_root()
}

fn injected(kind: ErrorKind, path: &Path) -> FsError {
    let path = path.to_path_buf();
    match kind {
        ErrorKind::NotFound => FsError::NotFound { path },
        ErrorKind::PermissionDenied => FsError::PermissionDenied { path },
        ErrorKind::AlreadyExists => FsError::AlreadyExists { path },
        ErrorKind::Cancelled => FsError::Cancelled,
        _ => FsError::Io {
            path,
            source: std::io::Error::other(format!("injected {kind} fault")),
        },
    }
}
