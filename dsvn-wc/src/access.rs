//! Hierarchical working-copy access and locking
//!
//! An `AccessTree` is an arena of per-directory nodes keyed by normalized
//! path. Opening a root registers every descendant (up to the requested
//! depth) in the same shared map, so closing the root closes them all,
//! deepest first. Write locking is cross-process: a zero-byte sentinel
//! file inside the admin area, created with create-exclusive semantics.
//! Any failure during recursive descent unwinds by closing everything
//! already opened at that level, so no lock files leak.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::admin::{AdminArea, adm_path};
use crate::entry::{NodeKind, uri_append};
use crate::error::{Result, WcError};
use crate::log::{LogContext, run_logs};

/// Caller-supplied cancellation check, polled at directory-open
/// boundaries. Returning true unwinds the operation cleanly.
pub type CancelCheck<'a> = &'a dyn Fn() -> bool;

/// State of one registered path.
enum NodeSlot {
    Open(Node),
    /// Registered by a parent but not openable: directory or admin area
    /// missing on disk.
    Missing,
    /// Formerly open, now closed. Terminal; closing again is a no-op.
    Absent,
}

struct Node {
    admin: AdminArea,
    locked: bool,
}

/// Open working-copy directories of one logical operation.
#[derive(Default)]
pub struct AccessTree {
    nodes: BTreeMap<PathBuf, NodeSlot>,
}

impl AccessTree {
    pub fn new() -> Self {
        AccessTree::default()
    }

    /// Open `path` and, when `depth` allows, its subdirectories.
    /// `depth < 0` is unbounded, `0` opens just the directory itself,
    /// `n > 0` descends n levels. With `lock`, each opened directory
    /// gets the write-lock sentinel, and pending transaction logs are
    /// replayed before the directory is used.
    pub fn open(
        &mut self,
        path: &Path,
        lock: bool,
        depth: i32,
        cancel: Option<CancelCheck>,
    ) -> Result<PathBuf> {
        let root = normalize(path);
        let mut opened = Vec::new();
        match self.open_inner(&root, lock, depth, cancel, &mut opened) {
            Ok(()) => Ok(root),
            Err(e) => {
                // Unwind everything this call managed to open.
                for p in opened.iter().rev() {
                    let _ = self.close_single(p, false);
                    self.nodes.remove(p);
                }
                Err(e)
            }
        }
    }

    /// Like open, but a `path` that is not itself a versioned directory
    /// retries against its parent with depth clamped to 0.
    pub fn probe_open(
        &mut self,
        path: &Path,
        lock: bool,
        depth: i32,
        cancel: Option<CancelCheck>,
    ) -> Result<PathBuf> {
        let norm = normalize(path);
        if norm.is_dir() && adm_path(&norm).join("entries").exists() {
            self.open(&norm, lock, depth, cancel)
        } else {
            let parent = norm
                .parent()
                .ok_or_else(|| WcError::MissingAdminArea(norm.clone()))?
                .to_path_buf();
            self.open(&parent, lock, 0, cancel)
        }
    }

    /// Return the already-open admin area for `path`.
    pub fn retrieve(&self, path: &Path) -> Result<&AdminArea> {
        let norm = normalize(path);
        match self.nodes.get(&norm) {
            Some(NodeSlot::Open(node)) => Ok(&node.admin),
            _ => Err(self.retrieve_diagnosis(&norm)),
        }
    }

    pub fn retrieve_mut(&mut self, path: &Path) -> Result<&mut AdminArea> {
        let norm = normalize(path);
        if !matches!(self.nodes.get(&norm), Some(NodeSlot::Open(_))) {
            return Err(self.retrieve_diagnosis(&norm));
        }
        match self.nodes.get_mut(&norm) {
            Some(NodeSlot::Open(node)) => Ok(&mut node.admin),
            _ => Err(WcError::NotLocked(norm)),
        }
    }

    /// Distinguish why a path is not retrievable: the directory itself
    /// missing, the admin area missing, or simply never opened.
    fn retrieve_diagnosis(&self, norm: &Path) -> WcError {
        if !norm.is_dir() {
            WcError::MissingDir(norm.to_path_buf())
        } else if !adm_path(norm).join("entries").exists() {
            WcError::MissingAdminArea(norm.to_path_buf())
        } else {
            WcError::NotLocked(norm.to_path_buf())
        }
    }

    pub fn is_open(&self, path: &Path) -> bool {
        matches!(self.nodes.get(&normalize(path)), Some(NodeSlot::Open(_)))
    }

    pub fn holds_write_lock(&self, path: &Path) -> bool {
        matches!(
            self.nodes.get(&normalize(path)),
            Some(NodeSlot::Open(Node { locked: true, .. }))
        )
    }

    /// All open paths at or under `root`, sorted.
    pub fn open_paths_under(&self, root: &Path) -> Vec<PathBuf> {
        let root = normalize(root);
        self.nodes
            .iter()
            .filter(|(p, slot)| {
                matches!(slot, NodeSlot::Open(_)) && (*p == &root || p.starts_with(&root))
            })
            .map(|(p, _)| p.clone())
            .collect()
    }

    /// Register a child slot the caller knows cannot open.
    pub fn mark_missing(&mut self, path: &Path) {
        self.nodes.insert(normalize(path), NodeSlot::Missing);
    }

    pub fn is_missing(&self, path: &Path) -> bool {
        matches!(self.nodes.get(&normalize(path)), Some(NodeSlot::Missing))
    }

    /// Resolve the conventional (anchor, target) pair for a single-path
    /// operation: the anchor directory that stays open for context plus
    /// the target's name within it.
    pub fn open_anchor(
        &mut self,
        path: &Path,
        lock: bool,
        depth: i32,
        cancel: Option<CancelCheck>,
    ) -> Result<(PathBuf, String)> {
        let norm = normalize(path);
        let Some(parent) = norm.parent().map(Path::to_path_buf) else {
            let root = self.open(&norm, lock, depth, cancel)?;
            return Ok((root, String::new()));
        };
        let name = norm
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        match self.open(&parent, lock, 0, cancel) {
            Ok(_) => {}
            Err(WcError::MissingAdminArea(_)) | Err(WcError::MissingDir(_)) => {
                // Parent is not versioned: the path itself is the anchor.
                let root = self.open(&norm, lock, depth, cancel)?;
                return Ok((root, String::new()));
            }
            Err(e) => return Err(e),
        }

        let target_is_dir = norm.is_dir() && adm_path(&norm).join("entries").exists();
        if !target_is_dir {
            return Ok((parent, name));
        }

        match self.open(&norm, lock, depth, cancel) {
            Ok(_) => {}
            Err(WcError::MissingAdminArea(_)) => return Ok((parent, name)),
            Err(e) => {
                let _ = self.close(&parent, false, true);
                return Err(e);
            }
        }

        // The parent absorbs the target only when its own listing agrees
        // about where the child lives; disjoint working copies split.
        let consistent = {
            let parent_admin = self.retrieve(&parent)?;
            let parent_url = parent_admin.this_dir()?.url.clone();
            let child_entry = parent_admin.entry(&name, true);
            match (parent_url, child_entry) {
                (Some(parent_url), Some(child)) => match &child.url {
                    Some(child_url) => *child_url == uri_append(&parent_url, &name),
                    None => true,
                },
                _ => false,
            }
        };
        if consistent {
            Ok((parent, name))
        } else {
            self.close(&parent, false, false)?;
            self.nodes.remove(&parent);
            Ok((norm, String::new()))
        }
    }

    /// Close `path` (and with `recurse` every registered node under it,
    /// deepest first), flushing dirty record sets and releasing lock
    /// sentinels unless `preserve_locks`. Idempotent.
    pub fn close(&mut self, path: &Path, preserve_locks: bool, recurse: bool) -> Result<()> {
        let root = normalize(path);
        if recurse {
            let children: Vec<PathBuf> = self
                .nodes
                .keys()
                .filter(|p| p.starts_with(&root) && **p != root)
                .cloned()
                .collect();
            for child in children.iter().rev() {
                self.close_single(child, preserve_locks)?;
            }
        }
        self.close_single(&root, preserve_locks)
    }

    fn close_single(&mut self, path: &Path, preserve_locks: bool) -> Result<()> {
        let transition = match self.nodes.get_mut(path) {
            Some(NodeSlot::Open(node)) => {
                if node.admin.is_dirty() {
                    node.admin.write_entries()?;
                }
                if node.locked && !preserve_locks {
                    // An already-removed lock file counts as satisfied.
                    match fs::remove_file(node.admin.lock_path()) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                tracing::debug!(dir = %path.display(), "closed working copy directory");
                true
            }
            Some(NodeSlot::Missing) => true,
            Some(NodeSlot::Absent) | None => false,
        };
        if transition {
            self.nodes.insert(path.to_path_buf(), NodeSlot::Absent);
        }
        Ok(())
    }

    fn open_inner(
        &mut self,
        path: &PathBuf,
        lock: bool,
        depth: i32,
        cancel: Option<CancelCheck>,
        opened: &mut Vec<PathBuf>,
    ) -> Result<()> {
        if let Some(cancel) = cancel {
            if cancel() {
                return Err(WcError::Cancelled);
            }
        }
        if matches!(self.nodes.get(path), Some(NodeSlot::Open(_))) {
            return Err(WcError::Locked(path.clone()));
        }

        let mut admin = AdminArea::open(path)?;
        let locked = if lock {
            acquire_lock(&admin)?;
            true
        } else {
            false
        };
        if locked {
            // Crash recovery: a previous writer may have left a durable
            // command sequence behind. A replay failure keeps the logs
            // but must not keep our fresh lock.
            match run_logs(&mut admin, &LogContext::recovery()) {
                Ok(true) => {
                    tracing::debug!(dir = %path.display(), "replayed pending logs on open");
                }
                Ok(false) => {}
                Err(e) => {
                    let _ = fs::remove_file(admin.lock_path());
                    return Err(e);
                }
            }
        }

        let child_names: Vec<String> = if depth != 0 {
            admin
                .entries(false)
                .filter(|e| e.kind == NodeKind::Dir && !e.name.is_empty())
                .map(|e| e.name.clone())
                .collect()
        } else {
            Vec::new()
        };

        self.nodes
            .insert(path.clone(), NodeSlot::Open(Node { admin, locked }));
        opened.push(path.clone());

        let child_depth = if depth > 0 { depth - 1 } else { depth };
        for name in child_names {
            let child = path.join(&name);
            match self.open_inner(&child, lock, child_depth, cancel, opened) {
                Ok(()) => {}
                Err(WcError::MissingAdminArea(_)) | Err(WcError::MissingDir(_)) => {
                    self.nodes.insert(child, NodeSlot::Missing);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

fn acquire_lock(admin: &AdminArea) -> Result<()> {
    let lock = admin.lock_path();
    match fs::File::options().write(true).create_new(true).open(&lock) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            Err(WcError::Locked(admin.path().to_path_buf()))
        }
        Err(e) => Err(e.into()),
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            c => out.push(c),
        }
    }
    out
}
