//! Tree-delta state machine for update and switch
//!
//! `UpdateEditor` implements the [`Editor`] contract: a strictly nested
//! stream of add/open/delete/close events describing the difference
//! between the working copy's current view and a target revision. Each
//! event turns into transaction-log commands against the directory it
//! touches, so a crash mid-update leaves a replayable log instead of a
//! half-mutated tree. Local edits survive through three-way text and
//! property merges; overlaps become conflict artifacts referenced by the
//! entry's conflict fields.
//!
//! The editor expects its [`AccessTree`] pre-opened (write-locked) over
//! the directories the update may touch.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use sha1::{Digest, Sha1};

use crate::access::AccessTree;
use crate::admin::{AdminArea, adm_path, file_checksum};
use crate::entry::{Entry, EntryPatch, Field, NodeKind, Schedule, UNKNOWN_SIZE, uri_append};
use crate::error::{Result, WcError};
use crate::log::{Command, LogBuilder, LogContext, next_sequence, run_logs};
use crate::merge::{MergeLabels, MergeStatus, TextMerger};
use crate::props::{
    PropChange, PropKind, merge_prop_changes, present_cachable, serialize_props,
};
use crate::translate::Translator;

/// Tree-delta consumer contract. Paths are relative to the edit root
/// (the anchor directory); events arrive strictly nested.
pub trait Editor {
    fn open_root(&mut self, base_revision: i64) -> Result<()>;
    fn delete_entry(&mut self, path: &str, revision: i64) -> Result<()>;
    fn add_dir(&mut self, path: &str, copyfrom: Option<(String, i64)>) -> Result<()>;
    fn open_dir(&mut self, path: &str, base_revision: i64) -> Result<()>;
    fn absent_dir(&mut self, path: &str) -> Result<()>;
    fn change_dir_prop(&mut self, name: &str, value: Option<&str>) -> Result<()>;
    fn close_dir(&mut self) -> Result<()>;
    fn add_file(&mut self, path: &str, copyfrom: Option<(String, i64)>) -> Result<()>;
    fn open_file(&mut self, path: &str, base_revision: i64) -> Result<()>;
    fn absent_file(&mut self, path: &str) -> Result<()>;
    fn apply_text_delta(&mut self, base_checksum: Option<&str>) -> Result<()>;
    fn write_text_chunk(&mut self, chunk: &[u8]) -> Result<()>;
    fn finish_text(&mut self) -> Result<()>;
    fn change_file_prop(&mut self, name: &str, value: Option<&str>) -> Result<()>;
    fn close_file(&mut self, expected_checksum: Option<&str>) -> Result<()>;
    fn close_edit(&mut self) -> Result<()>;
    fn abort_edit(&mut self) -> Result<()>;
}

/// Per-path outcome of one update event, reported to the caller's sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentStatus {
    Unchanged,
    Changed,
    Merged,
    Conflicted,
    /// A previous conflict is still unresolved; the incoming change was
    /// staged as the new base but not merged into the working file.
    ConflictedUnresolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    Unchanged,
    Unlocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyAction {
    Add,
    Delete,
    Update,
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub path: PathBuf,
    pub action: NotifyAction,
    pub kind: NodeKind,
    pub text: ContentStatus,
    pub props: ContentStatus,
    pub lock: LockStatus,
}

pub type NotifyFn<'a> = dyn FnMut(&Notification) + 'a;

/// Knobs for one update/switch drive.
pub struct UpdateConfig {
    pub target_revision: i64,
    pub recurse: bool,
    /// Switch destination for the target; must stay inside the
    /// repository root. `None` means plain update.
    pub switch_url: Option<String>,
}

/// Property names in these namespaces never reach the property store:
/// `svn:entry:` carries record fields piggybacked on the delta, and
/// `svn:wc:` addresses the protocol-layer wcprops cache.
const ENTRY_PROP_PREFIX: &str = "svn:entry:";
const WC_PROP_PREFIX: &str = "svn:wc:";

struct DirState {
    path: PathBuf,
    url: String,
    added: bool,
    prop_changes: Vec<(String, Option<String>)>,
    wcprop_changes: Vec<(String, Option<String>)>,
    entry_patch: EntryPatch,
    log: LogBuilder,
}

struct PendingDir {
    ref_count: usize,
    parent: Option<PathBuf>,
}

struct FileState {
    name: String,
    dir_path: PathBuf,
    url: String,
    added: bool,
    prop_changes: Vec<(String, Option<String>)>,
    wcprop_changes: Vec<(String, Option<String>)>,
    entry_patch: EntryPatch,
    text_updated: bool,
    staged: Option<fs::File>,
    actual_checksum: Option<String>,
    hasher: Option<Sha1>,
    lock_defunct: bool,
}

/// Fold one `svn:entry:` property from the delta into a record patch.
/// A deleted lock token defuncts the whole lock. Unknown names in the
/// namespace are ignored, matching what older servers send.
fn apply_entry_prop(
    dir: &Path,
    patch: &mut EntryPatch,
    lock_defunct: &mut bool,
    name: &str,
    value: Option<&str>,
) -> Result<()> {
    let field = &name[ENTRY_PROP_PREFIX.len()..];
    match (field, value) {
        ("committed-rev", Some(v)) => {
            let revision: i64 = v.parse().map_err(|_| {
                WcError::corrupt(dir, format!("invalid committed revision '{v}'"))
            })?;
            patch.committed_revision = Field::Set(revision);
        }
        ("committed-date", Some(v)) => {
            let date = chrono::DateTime::parse_from_rfc3339(v)
                .map_err(|_| WcError::corrupt(dir, format!("invalid committed date '{v}'")))?;
            patch.committed_date = Field::Set(date.with_timezone(&Utc));
        }
        ("last-author", v) => patch.committed_author = v.map(str::to_string).into(),
        ("uuid", Some(v)) => patch.uuid = Field::Set(v.to_string()),
        ("lock-token", Some(v)) => patch.lock_token = Field::Set(v.to_string()),
        ("lock-token", None) => {
            *lock_defunct = true;
        }
        ("lock-owner", v) => patch.lock_owner = v.map(str::to_string).into(),
        ("lock-comment", v) => patch.lock_comment = v.map(str::to_string).into(),
        ("lock-creation-date", Some(v)) => {
            let date = chrono::DateTime::parse_from_rfc3339(v)
                .map_err(|_| WcError::corrupt(dir, format!("invalid lock date '{v}'")))?;
            patch.lock_creation_date = Field::Set(date.with_timezone(&Utc));
        }
        _ => {}
    }
    Ok(())
}

/// The update/switch editor driving an [`AccessTree`].
pub struct UpdateEditor<'a> {
    tree: &'a mut AccessTree,
    anchor: PathBuf,
    target: String,
    target_revision: i64,
    switch_url: Option<String>,
    recurse: bool,
    merger: &'a dyn TextMerger,
    translator: &'a dyn Translator,
    notify: Option<Box<NotifyFn<'a>>>,
    dirs: Vec<DirState>,
    pending: BTreeMap<PathBuf, PendingDir>,
    file: Option<FileState>,
    root_opened: bool,
    target_deleted: bool,
}

impl<'a> UpdateEditor<'a> {
    pub fn new(
        tree: &'a mut AccessTree,
        anchor: &Path,
        target: &str,
        config: UpdateConfig,
        merger: &'a dyn TextMerger,
        translator: &'a dyn Translator,
        notify: Option<Box<NotifyFn<'a>>>,
    ) -> Result<UpdateEditor<'a>> {
        let anchor_admin = tree.retrieve(anchor)?;
        if let Some(switch_url) = &config.switch_url {
            let root = anchor_admin.this_dir()?.repos_root.clone();
            if let Some(root) = root {
                if !switch_url.starts_with(&root) {
                    return Err(WcError::InvalidSwitch {
                        url: switch_url.clone(),
                        root,
                    });
                }
            }
        }
        Ok(UpdateEditor {
            anchor: anchor.to_path_buf(),
            target: target.to_string(),
            target_revision: config.target_revision,
            switch_url: config.switch_url,
            recurse: config.recurse,
            merger,
            translator,
            notify,
            tree,
            dirs: Vec::new(),
            pending: BTreeMap::new(),
            file: None,
            root_opened: false,
            target_deleted: false,
        })
    }

    fn notify(&mut self, notification: Notification) {
        if let Some(sink) = self.notify.as_mut() {
            sink(&notification);
        }
    }

    fn current_dir(&mut self) -> Result<&mut DirState> {
        let anchor = self.anchor.clone();
        self.dirs
            .last_mut()
            .ok_or_else(|| WcError::corrupt(&anchor, "editor event outside an open directory"))
    }

    fn drive_error(&self, reason: &str) -> WcError {
        WcError::corrupt(&self.anchor, reason)
    }

    /// Split an edit-root-relative path into its absolute path and name.
    fn resolve(&self, path: &str) -> (PathBuf, String) {
        let full = self.anchor.join(path);
        let name = full
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        (full, name)
    }

    /// One step of the reference-count bookkeeping: a directory finished
    /// closing (or a child of it did). Completed directories run the
    /// post-update sweep and propagate the decrement to their parent.
    fn decrement(&mut self, path: &Path) -> Result<()> {
        let mut current = path.to_path_buf();
        loop {
            let Some(pending) = self.pending.get_mut(&current) else {
                break;
            };
            pending.ref_count -= 1;
            if pending.ref_count > 0 {
                break;
            }
            let parent = pending.parent.clone();
            self.pending.remove(&current);
            self.complete_directory(&current)?;
            match parent {
                Some(parent) => current = parent,
                None => break,
            }
        }
        Ok(())
    }

    /// Post-update cleanup of one fully-closed directory: the incomplete
    /// flag clears, confirmed-deleted and stale absent records go, and
    /// (with full recursion) records for subdirectories whose access
    /// node died signal a server-side deletion.
    fn complete_directory(&mut self, path: &Path) -> Result<()> {
        if path == self.anchor && !self.target.is_empty() {
            // The anchor itself is outside a single-target update.
            return Ok(());
        }
        let target_revision = self.target_revision;
        let recurse = self.recurse;

        let mut removed: Vec<(String, NodeKind)> = Vec::new();
        let mut missing_dirs: Vec<String> = Vec::new();
        {
            let admin = self.tree.retrieve(path)?;
            for entry in admin.entries(true) {
                if entry.name.is_empty() {
                    continue;
                }
                if entry.deleted && entry.schedule != Schedule::Add {
                    removed.push((entry.name.clone(), entry.kind));
                } else if entry.absent && entry.revision != target_revision {
                    removed.push((entry.name.clone(), entry.kind));
                } else if recurse && entry.kind == NodeKind::Dir {
                    missing_dirs.push(entry.name.clone());
                }
            }
        }
        for name in missing_dirs {
            let child = path.join(&name);
            if self.tree.is_missing(&child) && !adm_path(&child).join("entries").exists() {
                removed.push((name, NodeKind::Dir));
            }
        }

        let admin = self.tree.retrieve_mut(path)?;
        let patch = EntryPatch {
            incomplete: Field::Clear,
            ..EntryPatch::default()
        };
        admin.modify_entry("", &patch)?;
        for (name, _) in &removed {
            admin.remove_entry(name)?;
        }
        admin.write_entries()?;

        for (name, kind) in removed {
            let notification = Notification {
                path: path.join(&name),
                action: NotifyAction::Delete,
                kind,
                text: ContentStatus::Unchanged,
                props: ContentStatus::Unchanged,
                lock: LockStatus::Unchanged,
            };
            self.notify(notification);
        }
        Ok(())
    }

    /// Build the property-merge plan shared by files and directories:
    /// stages new base/working maps under tmp/, emits the install
    /// commands, and returns (prop status, entry patch fields).
    fn plan_prop_merge(
        &mut self,
        dir_path: &Path,
        name: &str,
        prop_changes: &[(String, Option<String>)],
        log_commands: &mut Vec<Command>,
    ) -> Result<(ContentStatus, EntryPatch)> {
        if prop_changes.is_empty() {
            return Ok((ContentStatus::Unchanged, EntryPatch::default()));
        }
        let (tmp_base, tmp_work, tmp_rej, base_rel, work_rel, status, patch) = {
            let admin = self.tree.retrieve(dir_path)?;
            let props = admin.props();

            let base_map = props.read(name, PropKind::Base)?.unwrap_or_default();
            let changes: Vec<PropChange> = prop_changes
                .iter()
                .map(|(prop, value)| PropChange {
                    name: prop.clone(),
                    old_value: base_map.get(prop).cloned(),
                    new_value: value.clone(),
                })
                .collect();

            let mut new_base = base_map.clone();
            for change in &changes {
                match &change.new_value {
                    Some(v) => {
                        new_base.insert(change.name.clone(), v.clone());
                    }
                    None => {
                        new_base.remove(&change.name);
                    }
                }
            }

            let mut working = props
                .read(name, PropKind::Working)?
                .unwrap_or_else(|| base_map.clone());
            let conflicts = merge_prop_changes(&mut working, &changes);

            let tmp_base = admin.tmp_unique("prop-base");
            fs::write(&tmp_base, serialize_props(&new_base))?;
            let tmp_work = admin.tmp_unique("props");
            fs::write(&tmp_work, serialize_props(&working))?;
            let base_rel = rel_str(dir_path, &props.prop_path(name, PropKind::Base));
            let work_rel = rel_str(dir_path, &props.prop_path(name, PropKind::Working));

            let status = if !conflicts.is_empty() {
                let mut reject = String::new();
                for line in &conflicts {
                    reject.push_str(line);
                    reject.push('\n');
                }
                let tmp_rej = admin.tmp_unique("prop-reject");
                fs::write(&tmp_rej, reject)?;
                (Some(tmp_rej), ContentStatus::Conflicted)
            } else {
                (None, ContentStatus::Changed)
            };

            let cachable = admin.this_dir()?.cachable_props.clone();
            let mut patch = EntryPatch {
                has_props: Field::Set(!working.is_empty()),
                has_prop_mods: Field::Set(working != new_base),
                // A clean result gets stamped so the next modification
                // check stays on the cheap path; a conflict stays
                // unstamped and forces the full compare.
                prop_time: if status.1 == ContentStatus::Conflicted {
                    Field::Clear
                } else {
                    Field::Set(Utc::now())
                },
                ..EntryPatch::default()
            };
            if crate::format::has_prop_caching(admin.format()) {
                patch.present_props = Field::Set(present_cachable(&working, &cachable));
            }
            (tmp_base, tmp_work, status.0, base_rel, work_rel, status.1, patch)
        };

        log_commands.push(Command::MoveFile {
            src: rel_str(dir_path, &tmp_base),
            dst: base_rel,
        });
        log_commands.push(Command::MoveFile {
            src: rel_str(dir_path, &tmp_work),
            dst: work_rel,
        });
        let mut patch = patch;
        if let Some(tmp_rej) = tmp_rej {
            let prej_name = if name.is_empty() {
                "dir-props.prej".to_string()
            } else {
                format!("{name}.prej")
            };
            log_commands.push(Command::AppendFile {
                src: rel_str(dir_path, &tmp_rej),
                dst: prej_name.clone(),
            });
            patch.prop_reject_file = Field::Set(prej_name);
        }
        Ok((status, patch))
    }
}

impl Editor for UpdateEditor<'_> {
    fn open_root(&mut self, _base_revision: i64) -> Result<()> {
        if self.root_opened {
            return Err(self.drive_error("open_root called twice"));
        }
        self.root_opened = true;

        let anchor = self.anchor.clone();
        let url = {
            let admin = self.tree.retrieve_mut(&anchor)?;
            let this_dir = admin.this_dir()?;
            let url = self
                .switch_url
                .clone()
                .or_else(|| this_dir.url.clone())
                .ok_or_else(|| WcError::corrupt(&anchor, "anchor has no URL"))?;
            if self.target.is_empty() {
                // The whole directory is being updated: mark it in
                // progress before any change lands.
                admin.modify_entry(
                    "",
                    &EntryPatch {
                        incomplete: Field::Set(true),
                        ..EntryPatch::default()
                    },
                )?;
                admin.write_entries()?;
            }
            url
        };

        self.pending.insert(
            anchor.clone(),
            PendingDir {
                ref_count: 1,
                parent: None,
            },
        );
        self.dirs.push(DirState {
            path: anchor,
            url,
            added: false,
            prop_changes: Vec::new(),
            wcprop_changes: Vec::new(),
            entry_patch: EntryPatch::default(),
            log: LogBuilder::new(),
        });
        Ok(())
    }

    fn delete_entry(&mut self, path: &str, _revision: i64) -> Result<()> {
        let (full, name) = self.resolve(path);
        let is_target = !self.target.is_empty() && path == self.target;
        let target_revision = self.target_revision;
        let dir = self.current_dir()?;
        let dir_path = dir.path.clone();

        let admin = self.tree.retrieve_mut(&dir_path)?;
        let Some(entry) = admin.entry(&name, true) else {
            return Ok(());
        };
        let was_hidden = entry.is_hidden();
        let kind = entry.kind;

        if kind == NodeKind::Dir {
            // Flush and drop the subtree's nodes before the replay tears
            // its admin area out from under them; the dead node must not
            // look alive to the completion sweep either.
            self.tree.close(&full, false, true)?;
            self.tree.mark_missing(&full);
        }

        // Deletions run through their own immediate log so the record
        // and its files go together or not at all.
        let admin = self.tree.retrieve_mut(&dir_path)?;
        let mut log = LogBuilder::new();
        log.delete_entry(&name);
        if is_target {
            // Leave a stub so close_edit does not re-delete the target.
            let patch = EntryPatch {
                kind: Field::Set(kind),
                deleted: Field::Set(true),
                revision: Field::Set(target_revision),
                ..EntryPatch::default()
            };
            log.modify_entry(&name, patch);
            self.target_deleted = true;
        }
        log.save(admin, next_sequence(admin)?)?;
        let ctx = LogContext {
            merger: self.merger,
            translator: self.translator,
        };
        run_logs(admin, &ctx)?;

        if !was_hidden {
            self.notify(Notification {
                path: full,
                action: NotifyAction::Delete,
                kind,
                text: ContentStatus::Unchanged,
                props: ContentStatus::Unchanged,
                lock: LockStatus::Unchanged,
            });
        }
        Ok(())
    }

    fn add_dir(&mut self, path: &str, copyfrom: Option<(String, i64)>) -> Result<()> {
        if copyfrom.is_some() {
            return Err(self.drive_error("add_dir with copy history is not supported"));
        }
        let (full, name) = self.resolve(path);
        let target_revision = self.target_revision;
        let parent = self.current_dir()?;
        let parent_path = parent.path.clone();
        let child_url = uri_append(&parent.url, &name);

        if fs::symlink_metadata(&full).is_ok() {
            return Err(WcError::Obstructed(full));
        }
        let (repos_root, uuid) = {
            let admin = self.tree.retrieve(&parent_path)?;
            if let Some(existing) = admin.entry(&name, false) {
                if existing.schedule == Schedule::Add || existing.kind != NodeKind::None {
                    return Err(WcError::Obstructed(full));
                }
            }
            let this_dir = admin.this_dir()?;
            (this_dir.repos_root.clone(), this_dir.uuid.clone())
        };

        {
            let admin = self.tree.retrieve_mut(&parent_path)?;
            let patch = EntryPatch {
                kind: Field::Set(NodeKind::Dir),
                deleted: Field::Clear,
                absent: Field::Clear,
                ..EntryPatch::default()
            };
            admin.modify_entry(&name, &patch)?;
            admin.write_entries()?;
        }
        AdminArea::create(
            &full,
            &child_url,
            repos_root.as_deref(),
            uuid.as_deref(),
            target_revision,
        )?;
        self.tree.open(&full, true, 0, None)?;

        self.pending.insert(
            full.clone(),
            PendingDir {
                ref_count: 1,
                parent: Some(parent_path.clone()),
            },
        );
        if let Some(parent_pending) = self.pending.get_mut(&parent_path) {
            parent_pending.ref_count += 1;
        }
        self.dirs.push(DirState {
            path: full.clone(),
            url: child_url,
            added: true,
            prop_changes: Vec::new(),
            wcprop_changes: Vec::new(),
            entry_patch: EntryPatch::default(),
            log: LogBuilder::new(),
        });

        self.notify(Notification {
            path: full,
            action: NotifyAction::Add,
            kind: NodeKind::Dir,
            text: ContentStatus::Unchanged,
            props: ContentStatus::Unchanged,
            lock: LockStatus::Unchanged,
        });
        Ok(())
    }

    fn open_dir(&mut self, path: &str, _base_revision: i64) -> Result<()> {
        let (full, name) = self.resolve(path);
        let parent = self.current_dir()?;
        let parent_path = parent.path.clone();
        let child_url = uri_append(&parent.url, &name);

        {
            let admin = self.tree.retrieve_mut(&full)?;
            admin.modify_entry(
                "",
                &EntryPatch {
                    incomplete: Field::Set(true),
                    ..EntryPatch::default()
                },
            )?;
            admin.write_entries()?;
        }

        self.pending.insert(
            full.clone(),
            PendingDir {
                ref_count: 1,
                parent: Some(parent_path.clone()),
            },
        );
        if let Some(parent_pending) = self.pending.get_mut(&parent_path) {
            parent_pending.ref_count += 1;
        }
        self.dirs.push(DirState {
            path: full,
            url: child_url,
            added: false,
            prop_changes: Vec::new(),
            wcprop_changes: Vec::new(),
            entry_patch: EntryPatch::default(),
            log: LogBuilder::new(),
        });
        Ok(())
    }

    fn absent_dir(&mut self, path: &str) -> Result<()> {
        mark_absent(self, path, NodeKind::Dir)
    }

    fn change_dir_prop(&mut self, name: &str, value: Option<&str>) -> Result<()> {
        let anchor = self.anchor.clone();
        let dir = self.current_dir()?;
        if name.starts_with(ENTRY_PROP_PREFIX) {
            let mut defunct = false;
            apply_entry_prop(&anchor, &mut dir.entry_patch, &mut defunct, name, value)?;
            if defunct {
                dir.entry_patch.lock_token = Field::Clear;
                dir.entry_patch.lock_owner = Field::Clear;
                dir.entry_patch.lock_comment = Field::Clear;
                dir.entry_patch.lock_creation_date = Field::Clear;
            }
        } else if name.starts_with(WC_PROP_PREFIX) {
            dir.wcprop_changes
                .push((name.to_string(), value.map(str::to_string)));
        } else {
            dir.prop_changes
                .push((name.to_string(), value.map(str::to_string)));
        }
        Ok(())
    }

    fn close_dir(&mut self) -> Result<()> {
        let Some(mut dir) = self.dirs.pop() else {
            return Err(self.drive_error("close_dir without an open directory"));
        };

        let prop_changes = std::mem::take(&mut dir.prop_changes);
        let mut commands = Vec::new();
        let (prop_status, patch) =
            self.plan_prop_merge(&dir.path, "", &prop_changes, &mut commands)?;
        for command in commands {
            dir.log.push(command);
        }
        for (prop, value) in std::mem::take(&mut dir.wcprop_changes) {
            dir.log.push(Command::ModifyWcProperty {
                name: String::new(),
                prop,
                value,
            });
        }
        if !patch.is_empty() {
            dir.log.modify_entry("", patch);
        }
        let entry_patch = std::mem::take(&mut dir.entry_patch);
        if !entry_patch.is_empty() {
            dir.log.modify_entry("", entry_patch);
        }

        if !dir.log.is_empty() {
            let admin = self.tree.retrieve_mut(&dir.path)?;
            dir.log.save(admin, next_sequence(admin)?)?;
            let ctx = LogContext {
                merger: self.merger,
                translator: self.translator,
            };
            run_logs(admin, &ctx)?;
        }

        if prop_status != ContentStatus::Unchanged && !dir.added {
            self.notify(Notification {
                path: dir.path.clone(),
                action: NotifyAction::Update,
                kind: NodeKind::Dir,
                text: ContentStatus::Unchanged,
                props: prop_status,
                lock: LockStatus::Unchanged,
            });
        }

        self.decrement(&dir.path)
    }

    fn add_file(&mut self, path: &str, copyfrom: Option<(String, i64)>) -> Result<()> {
        if copyfrom.is_some() {
            return Err(self.drive_error("add_file with copy history is not supported"));
        }
        if self.file.is_some() {
            return Err(self.drive_error("add_file while another file is open"));
        }
        let (full, name) = self.resolve(path);
        let dir = self.current_dir()?;
        let dir_path = dir.path.clone();
        let url = uri_append(&dir.url, &name);

        if fs::symlink_metadata(&full).is_ok() {
            return Err(WcError::Obstructed(full));
        }
        let admin = self.tree.retrieve(&dir_path)?;
        // A visible record, scheduled add or otherwise, blocks the
        // incoming add; hidden ones get revived instead.
        if admin.entry(&name, false).is_some() {
            return Err(WcError::Obstructed(full));
        }

        self.file = Some(FileState {
            name,
            dir_path,
            url,
            added: true,
            prop_changes: Vec::new(),
            wcprop_changes: Vec::new(),
            entry_patch: EntryPatch::default(),
            text_updated: false,
            staged: None,
            actual_checksum: None,
            hasher: None,
            lock_defunct: false,
        });
        Ok(())
    }

    fn open_file(&mut self, path: &str, _base_revision: i64) -> Result<()> {
        if self.file.is_some() {
            return Err(self.drive_error("open_file while another file is open"));
        }
        let (full, name) = self.resolve(path);
        let dir = self.current_dir()?;
        let dir_path = dir.path.clone();
        let url = uri_append(&dir.url, &name);

        let admin = self.tree.retrieve(&dir_path)?;
        if admin.entry(&name, false).is_none() {
            return Err(WcError::corrupt(
                &dir_path,
                format!("'{}' is not under version control", full.display()),
            ));
        }

        self.file = Some(FileState {
            name,
            dir_path,
            url,
            added: false,
            prop_changes: Vec::new(),
            wcprop_changes: Vec::new(),
            entry_patch: EntryPatch::default(),
            text_updated: false,
            staged: None,
            actual_checksum: None,
            hasher: None,
            lock_defunct: false,
        });
        Ok(())
    }

    fn absent_file(&mut self, path: &str) -> Result<()> {
        mark_absent(self, path, NodeKind::File)
    }

    fn apply_text_delta(&mut self, base_checksum: Option<&str>) -> Result<()> {
        let anchor = self.anchor.clone();
        let Some(file) = self.file.as_mut() else {
            return Err(WcError::corrupt(&anchor, "apply_text_delta without an open file"));
        };
        let (base_path, staging, stored_checksum) = {
            let admin = self.tree.retrieve(&file.dir_path)?;
            (
                admin.text_base_path(&file.name),
                admin.tmp_text_base_path(&file.name),
                admin
                    .entry(&file.name, true)
                    .and_then(|e| e.checksum.clone()),
            )
        };

        // The server's declared base must match the pristine we have;
        // with no declaration the stored checksum stands in for it.
        let expected = base_checksum.map(str::to_string).or(stored_checksum);
        if let Some(expected) = expected {
            if base_path.exists() {
                let actual = file_checksum(&base_path)?;
                if actual != expected {
                    return Err(WcError::CorruptTextBase {
                        path: file.dir_path.join(&file.name),
                        expected,
                        actual,
                    });
                }
            }
        }

        if let Some(parent) = staging.parent() {
            fs::create_dir_all(parent)?;
        }
        file.staged = Some(fs::File::create(&staging)?);
        file.hasher = Some(Sha1::new());
        file.text_updated = true;
        Ok(())
    }

    fn write_text_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let anchor = self.anchor.clone();
        let Some(file) = self.file.as_mut() else {
            return Err(WcError::corrupt(&anchor, "text chunk without an open delta"));
        };
        let staged = file
            .staged
            .as_mut()
            .ok_or_else(|| WcError::corrupt(&anchor, "text chunk without an open delta"))?;
        use std::io::Write;
        staged.write_all(chunk)?;
        if let Some(hasher) = file.hasher.as_mut() {
            hasher.update(chunk);
        }
        Ok(())
    }

    fn finish_text(&mut self) -> Result<()> {
        let anchor = self.anchor.clone();
        let Some(file) = self.file.as_mut() else {
            return Err(WcError::corrupt(&anchor, "finish_text without an open delta"));
        };
        if let Some(staged) = file.staged.take() {
            staged.sync_all()?;
        }
        if let Some(hasher) = file.hasher.take() {
            file.actual_checksum = Some(hex::encode(hasher.finalize()));
        }
        Ok(())
    }

    fn change_file_prop(&mut self, name: &str, value: Option<&str>) -> Result<()> {
        let anchor = self.anchor.clone();
        let Some(file) = self.file.as_mut() else {
            return Err(WcError::corrupt(&anchor, "file property change without an open file"));
        };
        if name.starts_with(ENTRY_PROP_PREFIX) {
            apply_entry_prop(
                &anchor,
                &mut file.entry_patch,
                &mut file.lock_defunct,
                name,
                value,
            )?;
        } else if name.starts_with(WC_PROP_PREFIX) {
            file.wcprop_changes
                .push((name.to_string(), value.map(str::to_string)));
        } else {
            file.prop_changes
                .push((name.to_string(), value.map(str::to_string)));
        }
        Ok(())
    }

    fn close_file(&mut self, expected_checksum: Option<&str>) -> Result<()> {
        let Some(file) = self.file.take() else {
            return Err(self.drive_error("close_file without an open file"));
        };
        let full = file.dir_path.join(&file.name);

        if file.text_updated {
            if let (Some(expected), Some(actual)) =
                (expected_checksum, file.actual_checksum.as_deref())
            {
                if expected != actual {
                    return Err(WcError::ChecksumMismatch {
                        path: full,
                        expected: expected.to_string(),
                        actual: actual.to_string(),
                    });
                }
            }
        }

        let target_revision = self.target_revision;
        let now = Utc::now();

        // Plan the text half eagerly: snapshots of the old base and the
        // pre-merge working file go under tmp/ so replay recomputes the
        // identical merge.
        let mut text_status = ContentStatus::Unchanged;
        let mut commands: Vec<Command> = Vec::new();
        // Entry props from the delta seed the patch; the update's own
        // fields override where they overlap.
        let mut patch = file.entry_patch.clone();
        patch.kind = Field::Set(NodeKind::File);
        patch.revision = Field::Set(target_revision);
        patch.url = Field::Set(file.url.clone());
        patch.deleted = Field::Clear;
        patch.absent = Field::Clear;

        if file.text_updated {
            let (base_rel, staged_rel, staged_abs, base_abs, old_entry, locally_modified) = {
                let admin = self.tree.retrieve_mut(&file.dir_path)?;
                let staged_abs = admin.tmp_text_base_path(&file.name);
                let base_abs = admin.text_base_path(&file.name);
                let old_entry = admin.entry(&file.name, true).cloned();
                let locally_modified = if file.added {
                    false
                } else {
                    admin.text_modified(&file.name, self.translator)?
                };
                (
                    rel_str(&file.dir_path, &base_abs),
                    rel_str(&file.dir_path, &staged_abs),
                    staged_abs,
                    base_abs,
                    old_entry,
                    locally_modified,
                )
            };

            patch.checksum = match file.actual_checksum.clone() {
                Some(checksum) => Field::Set(checksum),
                None => Field::Set(file_checksum(&staged_abs)?),
            };

            if unresolved_conflict(&file.dir_path, old_entry.as_ref()) {
                // An earlier conflict is still sitting in the working
                // file; install the new pristine only and leave the
                // marked-up text alone.
                commands.push(Command::MoveFile {
                    src: staged_rel,
                    dst: base_rel,
                });
                patch.text_time = Field::Clear;
                patch.working_size = Field::Set(UNKNOWN_SIZE);
                text_status = ContentStatus::ConflictedUnresolved;
            } else if !locally_modified {
                // No local edits: the new base simply becomes the
                // working file.
                commands.push(Command::MoveFile {
                    src: staged_rel,
                    dst: base_rel.clone(),
                });
                commands.push(Command::CopyAndTranslate {
                    src: base_rel,
                    dst: file.name.clone(),
                });
                commands.push(Command::SetTimestamp {
                    path: file.name.clone(),
                    timestamp: now,
                });
                commands.push(Command::MaybeReadonly {
                    name: file.name.clone(),
                });
                commands.push(Command::MaybeExecutable {
                    name: file.name.clone(),
                });
                patch.text_time = Field::Set(now);
                patch.working_size =
                    Field::Set(self.translator.translate(&fs::read(&staged_abs)?).len() as i64);
                text_status = ContentStatus::Changed;
            } else {
                // Local edits: three-way merge of old base, new base and
                // the working file, labeled by revision.
                let admin = self.tree.retrieve(&file.dir_path)?;
                let old_revision = old_entry
                    .as_ref()
                    .map(|e| e.revision)
                    .unwrap_or(target_revision);
                let left_label = format!("r{old_revision}");
                let right_label = format!("r{target_revision}");
                let mine_label = "mine".to_string();

                let old_base_snapshot = admin.tmp_unique("old-base");
                fs::copy(&base_abs, &old_base_snapshot)?;
                let mine_snapshot = admin.tmp_unique("mine");
                fs::copy(file.dir_path.join(&file.name), &mine_snapshot)?;

                // Decide the outcome now with the same inputs replay
                // will see; the verdict feeds the notification.
                let base_text = fs::read(&old_base_snapshot)?;
                let theirs_text = fs::read(&staged_abs)?;
                let mine_text = self
                    .translator
                    .detranslate(&fs::read(&mine_snapshot)?);
                let labels = MergeLabels {
                    base: format!(".{left_label}"),
                    theirs: format!(".{right_label}"),
                    mine: format!(".{mine_label}"),
                };
                let verdict = self
                    .merger
                    .merge(&base_text, &theirs_text, &mine_text, &labels);
                text_status = match verdict.status {
                    MergeStatus::Unchanged => ContentStatus::Unchanged,
                    MergeStatus::Merged => ContentStatus::Merged,
                    MergeStatus::Conflicted => ContentStatus::Conflicted,
                };

                commands.push(Command::MoveFile {
                    src: staged_rel,
                    dst: base_rel.clone(),
                });
                commands.push(Command::MergeText {
                    target: file.name.clone(),
                    mine: rel_str(&file.dir_path, &mine_snapshot),
                    left: rel_str(&file.dir_path, &old_base_snapshot),
                    right: base_rel,
                    left_label,
                    right_label,
                    mine_label,
                });
                patch.text_time = Field::Clear;
                patch.working_size = Field::Set(UNKNOWN_SIZE);
            }
        }

        let prop_changes = file.prop_changes.clone();
        let mut prop_commands = Vec::new();
        let (prop_status, prop_patch) =
            self.plan_prop_merge(&file.dir_path, &file.name, &prop_changes, &mut prop_commands)?;
        commands.extend(prop_commands);
        merge_patches(&mut patch, prop_patch);
        for (prop, value) in &file.wcprop_changes {
            commands.push(Command::ModifyWcProperty {
                name: file.name.clone(),
                prop: prop.clone(),
                value: value.clone(),
            });
        }

        let lock_status = if file.lock_defunct {
            patch.lock_token = Field::Clear;
            patch.lock_owner = Field::Clear;
            patch.lock_comment = Field::Clear;
            patch.lock_creation_date = Field::Clear;
            LockStatus::Unlocked
        } else {
            LockStatus::Unchanged
        };

        let dir = self.current_dir()?;
        for command in commands {
            dir.log.push(command);
        }
        dir.log.modify_entry(&file.name, patch);

        if file.added
            || text_status != ContentStatus::Unchanged
            || prop_status != ContentStatus::Unchanged
            || lock_status != LockStatus::Unchanged
        {
            let action = if file.added {
                NotifyAction::Add
            } else {
                NotifyAction::Update
            };
            let text = if file.added && text_status == ContentStatus::Unchanged {
                ContentStatus::Changed
            } else {
                text_status
            };
            self.notify(Notification {
                path: full,
                action,
                kind: NodeKind::File,
                text,
                props: prop_status,
                lock: lock_status,
            });
        }
        Ok(())
    }

    fn close_edit(&mut self) -> Result<()> {
        if !self.root_opened {
            // Nothing arrived at all; still bump the target below.
            self.pending.clear();
        }
        if !self.dirs.is_empty() || self.file.is_some() {
            return Err(self.drive_error("close_edit with unclosed items"));
        }

        // A single target that disappeared from under the anchor without
        // an explicit deletion event was removed in the repository.
        if !self.target.is_empty() && !self.target_deleted {
            let target_path = self.anchor.join(&self.target);
            if self.tree.is_missing(&target_path)
                && !adm_path(&target_path).join("entries").exists()
            {
                let anchor = self.anchor.clone();
                let target = self.target.clone();
                let target_revision = self.target_revision;
                let admin = self.tree.retrieve_mut(&anchor)?;
                let mut log = LogBuilder::new();
                log.delete_entry(&target);
                let patch = EntryPatch {
                    kind: Field::Set(NodeKind::Dir),
                    deleted: Field::Set(true),
                    revision: Field::Set(target_revision),
                    ..EntryPatch::default()
                };
                log.modify_entry(&target, patch);
                log.save(admin, next_sequence(admin)?)?;
                let ctx = LogContext {
                    merger: self.merger,
                    translator: self.translator,
                };
                run_logs(admin, &ctx)?;
                self.target_deleted = true;
                self.notify(Notification {
                    path: target_path,
                    action: NotifyAction::Delete,
                    kind: NodeKind::Dir,
                    text: ContentStatus::Unchanged,
                    props: ContentStatus::Unchanged,
                    lock: LockStatus::Unchanged,
                });
                return Ok(());
            }
        }

        if self.target_deleted {
            return Ok(());
        }

        // Bump: everything that survived moves to the target revision.
        let anchor = self.anchor.clone();
        let root_url = {
            let admin = self.tree.retrieve(&anchor)?;
            self.switch_url
                .clone()
                .or_else(|| admin.this_dir().ok().and_then(|e| e.url.clone()))
        };
        let Some(root_url) = root_url else {
            return Ok(());
        };
        if self.target.is_empty() {
            self.bump_directory(&anchor, &root_url)?;
        } else {
            self.bump_target(&anchor, &self.target.clone(), &root_url)?;
        }
        Ok(())
    }

    fn abort_edit(&mut self) -> Result<()> {
        // Logs already replayed for closed directories stay applied; the
        // half-finished rest is simply dropped and a re-run resolves it.
        self.dirs.clear();
        self.pending.clear();
        self.file = None;
        tracing::warn!(anchor = %self.anchor.display(), "edit aborted; re-run the update to finish");
        Ok(())
    }
}

impl UpdateEditor<'_> {
    /// Post-update revision/URL walk. Scheduled additions keep their
    /// local state; hidden leftovers vanish.
    fn bump_directory(&mut self, path: &Path, url: &str) -> Result<()> {
        let target_revision = self.target_revision;
        let mut subdirs: Vec<(PathBuf, String)> = Vec::new();
        {
            let admin = self.tree.retrieve_mut(path)?;
            let names: Vec<String> = admin.entry_names(true);
            for name in names {
                let Some(entry) = admin.entry(&name, true).cloned() else {
                    continue;
                };
                if name.is_empty() {
                    let patch = EntryPatch {
                        revision: Field::Set(target_revision),
                        url: Field::Set(url.to_string()),
                        ..EntryPatch::default()
                    };
                    admin.modify_entry("", &patch)?;
                    continue;
                }
                if entry.schedule == Schedule::Add || entry.schedule == Schedule::Replace {
                    continue;
                }
                if entry.deleted {
                    if entry.revision != target_revision {
                        admin.remove_entry(&name)?;
                    }
                    continue;
                }
                if entry.absent {
                    if entry.revision != target_revision {
                        admin.remove_entry(&name)?;
                    }
                    continue;
                }
                match entry.kind {
                    NodeKind::File => {
                        let patch = EntryPatch {
                            revision: Field::Set(target_revision),
                            url: Field::Set(uri_append(url, &name)),
                            ..EntryPatch::default()
                        };
                        admin.modify_entry(&name, &patch)?;
                    }
                    NodeKind::Dir => {
                        subdirs.push((path.join(&name), uri_append(url, &name)));
                    }
                    NodeKind::None => {}
                }
            }
            admin.write_entries()?;
        }
        if self.recurse {
            for (subdir, sub_url) in subdirs {
                if self.tree.is_open(&subdir) {
                    self.bump_directory(&subdir, &sub_url)?;
                }
            }
        }
        Ok(())
    }

    /// Bump a single named target inside the anchor.
    fn bump_target(&mut self, anchor: &Path, target: &str, anchor_url: &str) -> Result<()> {
        let target_revision = self.target_revision;
        let target_path = anchor.join(target);
        let target_url = match &self.switch_url {
            Some(url) => url.clone(),
            None => uri_append(anchor_url, target),
        };

        let admin = self.tree.retrieve_mut(anchor)?;
        if let Some(entry) = admin.entry(target, true).cloned() {
            if entry.schedule != Schedule::Add && entry.schedule != Schedule::Replace {
                if entry.deleted && entry.revision != target_revision {
                    admin.remove_entry(target)?;
                } else if !entry.deleted {
                    let patch = EntryPatch {
                        revision: Field::Set(target_revision),
                        url: Field::Set(target_url.clone()),
                        ..EntryPatch::default()
                    };
                    admin.modify_entry(target, &patch)?;
                }
            }
            admin.write_entries()?;
            if entry.kind == NodeKind::Dir && self.tree.is_open(&target_path) {
                self.bump_directory(&target_path, &target_url)?;
            }
        }
        Ok(())
    }
}

/// Record a path the server refuses to reveal: a placeholder entry the
/// next update can re-check, never shown by default enumeration.
fn mark_absent(editor: &mut UpdateEditor<'_>, path: &str, kind: NodeKind) -> Result<()> {
    let (full, name) = editor.resolve(path);
    let target_revision = editor.target_revision;
    let dir = editor.current_dir()?;
    let dir_path = dir.path.clone();

    let admin = editor.tree.retrieve_mut(&dir_path)?;
    if let Some(existing) = admin.entry(&name, true) {
        if existing.schedule == Schedule::Add {
            return Err(WcError::ScheduleConflict {
                path: full,
                reason: "cannot mark absent: same name is scheduled for addition".to_string(),
            });
        }
    }
    let patch = EntryPatch {
        kind: Field::Set(kind),
        absent: Field::Set(true),
        deleted: Field::Clear,
        schedule: Field::Clear,
        revision: Field::Set(target_revision),
        ..EntryPatch::default()
    };
    admin.modify_entry(&name, &patch)?;
    Ok(())
}

/// Whether a record still points at live conflict artifacts; such files
/// are never re-merged behind the user's back.
fn unresolved_conflict(dir_path: &Path, entry: Option<&Entry>) -> bool {
    let Some(entry) = entry else {
        return false;
    };
    [&entry.conflict_old, &entry.conflict_new, &entry.conflict_wrk]
        .iter()
        .any(|file| {
            file.as_ref()
                .is_some_and(|name| dir_path.join(name).exists())
        })
}

/// Overlay `extra` onto `base`, field by field.
fn merge_patches(base: &mut EntryPatch, extra: EntryPatch) {
    if !extra.has_props.is_keep() {
        base.has_props = extra.has_props;
    }
    if !extra.has_prop_mods.is_keep() {
        base.has_prop_mods = extra.has_prop_mods;
    }
    if !extra.present_props.is_keep() {
        base.present_props = extra.present_props;
    }
    if !extra.prop_time.is_keep() {
        base.prop_time = extra.prop_time;
    }
    if !extra.prop_reject_file.is_keep() {
        base.prop_reject_file = extra.prop_reject_file;
    }
}

fn rel_str(dir: &Path, abs: &Path) -> String {
    abs.strip_prefix(dir)
        .unwrap_or(abs)
        .to_string_lossy()
        .into_owned()
}

// The integration scenarios for this editor live in
// tests/update_editor_test.rs; the in-module tests cover the pieces with
// no filesystem choreography.
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_patches_overlays_prop_fields_only() {
        let mut base = EntryPatch::default().revision(7);
        let extra = EntryPatch {
            has_props: Field::Set(true),
            prop_reject_file: Field::Set("alpha.prej".to_string()),
            ..EntryPatch::default()
        };
        merge_patches(&mut base, extra);
        assert_eq!(base.revision, Field::Set(7));
        assert_eq!(base.has_props, Field::Set(true));
        assert_eq!(base.prop_reject_file, Field::Set("alpha.prej".to_string()));
        assert!(base.checksum.is_keep());
    }

    #[test]
    fn test_rel_str() {
        let dir = Path::new("/wc/a");
        assert_eq!(rel_str(dir, Path::new("/wc/a/.dsvn/tmp/x")), ".dsvn/tmp/x");
        assert_eq!(rel_str(dir, Path::new("/elsewhere/x")), "/elsewhere/x");
    }
}
