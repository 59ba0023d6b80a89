//! Per-path metadata records
//!
//! One `Entry` exists per versioned path, keyed by name within its owning
//! directory's record set. The record with the this-dir name describes the
//! directory itself and is the source of inherited defaults for its file
//! children. Records are never mutated field-by-field from the outside;
//! every change goes through an [`EntryPatch`] so that live mutation and
//! log replay share one code path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, WcError};

/// Node kind of a versioned path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    #[default]
    None,
    File,
    Dir,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::None => "none",
            NodeKind::File => "file",
            NodeKind::Dir => "dir",
        }
    }

    pub fn parse(s: &str) -> Option<NodeKind> {
        match s {
            "none" | "" => Some(NodeKind::None),
            "file" => Some(NodeKind::File),
            "dir" => Some(NodeKind::Dir),
            _ => None,
        }
    }
}

/// Pending local intent for a record, not yet committed to the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Schedule {
    #[default]
    Normal,
    Add,
    Delete,
    Replace,
}

impl Schedule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Schedule::Normal => "",
            Schedule::Add => "add",
            Schedule::Delete => "delete",
            Schedule::Replace => "replace",
        }
    }

    pub fn parse(s: &str) -> Option<Schedule> {
        match s {
            "" | "normal" => Some(Schedule::Normal),
            "add" => Some(Schedule::Add),
            "delete" => Some(Schedule::Delete),
            "replace" => Some(Schedule::Replace),
            _ => None,
        }
    }
}

/// Sticky ambient depth of a directory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Depth {
    Empty,
    Files,
    Immediates,
    #[default]
    Infinity,
}

impl Depth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Depth::Empty => "empty",
            Depth::Files => "files",
            Depth::Immediates => "immediates",
            Depth::Infinity => "infinity",
        }
    }

    pub fn parse(s: &str) -> Option<Depth> {
        match s {
            "empty" => Some(Depth::Empty),
            "files" => Some(Depth::Files),
            "immediates" => Some(Depth::Immediates),
            "" | "infinity" => Some(Depth::Infinity),
            _ => None,
        }
    }
}

/// Revision value meaning "unset".
pub const UNSET_REVISION: i64 = -1;

/// Working-size value meaning "unknown".
pub const UNKNOWN_SIZE: i64 = -1;

/// One versioned path's metadata record.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub name: String,
    pub kind: NodeKind,

    // Version info, inherited from this-dir when unset on file records.
    pub revision: i64,
    pub url: Option<String>,
    pub repos_root: Option<String>,
    pub uuid: Option<String>,

    // Local intent.
    pub schedule: Schedule,
    pub copied: bool,
    pub copyfrom_url: Option<String>,
    pub copyfrom_revision: i64,

    // State flags.
    pub deleted: bool,
    pub absent: bool,
    pub incomplete: bool,

    // Content tracking.
    pub text_time: Option<DateTime<Utc>>,
    pub checksum: Option<String>,
    pub working_size: i64,

    // Property tracking.
    pub prop_time: Option<DateTime<Utc>>,
    pub has_props: bool,
    pub has_prop_mods: bool,
    pub cachable_props: Vec<String>,
    pub present_props: Vec<String>,

    // Commit metadata.
    pub committed_revision: i64,
    pub committed_date: Option<DateTime<Utc>>,
    pub committed_author: Option<String>,

    // Conflict markers (file names relative to the entry's directory).
    pub conflict_old: Option<String>,
    pub conflict_new: Option<String>,
    pub conflict_wrk: Option<String>,
    pub prop_reject_file: Option<String>,

    // Repository lock metadata.
    pub lock_token: Option<String>,
    pub lock_owner: Option<String>,
    pub lock_comment: Option<String>,
    pub lock_creation_date: Option<DateTime<Utc>>,

    // Workflow.
    pub changelist: Option<String>,
    pub keep_local: bool,
    pub depth: Depth,
}

impl Entry {
    pub fn new(name: &str, kind: NodeKind) -> Self {
        Entry {
            name: name.to_string(),
            kind,
            revision: UNSET_REVISION,
            url: None,
            repos_root: None,
            uuid: None,
            schedule: Schedule::Normal,
            copied: false,
            copyfrom_url: None,
            copyfrom_revision: UNSET_REVISION,
            deleted: false,
            absent: false,
            incomplete: false,
            text_time: None,
            checksum: None,
            working_size: UNKNOWN_SIZE,
            prop_time: None,
            has_props: false,
            has_prop_mods: false,
            cachable_props: Vec::new(),
            present_props: Vec::new(),
            committed_revision: UNSET_REVISION,
            committed_date: None,
            committed_author: None,
            conflict_old: None,
            conflict_new: None,
            conflict_wrk: None,
            prop_reject_file: None,
            lock_token: None,
            lock_owner: None,
            lock_comment: None,
            lock_creation_date: None,
            changelist: None,
            keep_local: false,
            depth: Depth::Infinity,
        }
    }

    /// Hidden records are excluded from default enumeration but retained
    /// in the record set.
    pub fn is_hidden(&self) -> bool {
        (self.deleted || self.absent)
            && self.schedule != Schedule::Add
            && self.schedule != Schedule::Replace
    }

    pub fn is_scheduled(&self) -> bool {
        self.schedule != Schedule::Normal
    }

    /// Fill unset version fields from the directory's this-dir record.
    /// Applies to file records only and resolves once per load.
    pub fn inherit_from(&mut self, this_dir: &Entry) {
        if self.kind != NodeKind::File {
            return;
        }
        if self.revision == UNSET_REVISION {
            self.revision = this_dir.revision;
        }
        if self.url.is_none() {
            if let Some(parent_url) = &this_dir.url {
                self.url = Some(uri_append(parent_url, &self.name));
            }
        }
        if self.repos_root.is_none() {
            self.repos_root = this_dir.repos_root.clone();
        }
        if self.uuid.is_none() {
            self.uuid = this_dir.uuid.clone();
        }
        if self.cachable_props.is_empty() {
            self.cachable_props = this_dir.cachable_props.clone();
        }
    }

    /// Apply exactly the fields carried by `patch`. The only mutation
    /// primitive for records; both live updates and log replay use it.
    pub fn apply(&mut self, patch: &EntryPatch) {
        patch.kind.apply(&mut self.kind);
        patch.revision.apply(&mut self.revision);
        patch.url.apply_opt(&mut self.url);
        patch.repos_root.apply_opt(&mut self.repos_root);
        patch.uuid.apply_opt(&mut self.uuid);
        patch.schedule.apply(&mut self.schedule);
        patch.copied.apply(&mut self.copied);
        patch.copyfrom_url.apply_opt(&mut self.copyfrom_url);
        patch.copyfrom_revision.apply(&mut self.copyfrom_revision);
        patch.deleted.apply(&mut self.deleted);
        patch.absent.apply(&mut self.absent);
        patch.incomplete.apply(&mut self.incomplete);
        patch.text_time.apply_opt(&mut self.text_time);
        patch.checksum.apply_opt(&mut self.checksum);
        patch.working_size.apply(&mut self.working_size);
        patch.prop_time.apply_opt(&mut self.prop_time);
        patch.has_props.apply(&mut self.has_props);
        patch.has_prop_mods.apply(&mut self.has_prop_mods);
        patch.cachable_props.apply(&mut self.cachable_props);
        patch.present_props.apply(&mut self.present_props);
        patch.committed_revision.apply(&mut self.committed_revision);
        patch.committed_date.apply_opt(&mut self.committed_date);
        patch.committed_author.apply_opt(&mut self.committed_author);
        patch.conflict_old.apply_opt(&mut self.conflict_old);
        patch.conflict_new.apply_opt(&mut self.conflict_new);
        patch.conflict_wrk.apply_opt(&mut self.conflict_wrk);
        patch.prop_reject_file.apply_opt(&mut self.prop_reject_file);
        patch.lock_token.apply_opt(&mut self.lock_token);
        patch.lock_owner.apply_opt(&mut self.lock_owner);
        patch.lock_comment.apply_opt(&mut self.lock_comment);
        patch.lock_creation_date.apply_opt(&mut self.lock_creation_date);
        patch.changelist.apply_opt(&mut self.changelist);
        patch.keep_local.apply(&mut self.keep_local);
        patch.depth.apply(&mut self.depth);
    }
}

/// One optional field of an [`EntryPatch`]: leave alone, set, or reset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Field<T> {
    Keep,
    Set(T),
    Clear,
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Field::Keep
    }
}

impl<T> Field<T> {
    pub fn is_keep(&self) -> bool {
        matches!(self, Field::Keep)
    }
}

impl<T: Clone + Default> Field<T> {
    fn apply(&self, target: &mut T) {
        match self {
            Field::Keep => {}
            Field::Set(v) => *target = v.clone(),
            Field::Clear => *target = T::default(),
        }
    }
}

impl<T: Clone> Field<T> {
    fn apply_opt(&self, target: &mut Option<T>) {
        match self {
            Field::Keep => {}
            Field::Set(v) => *target = Some(v.clone()),
            Field::Clear => *target = None,
        }
    }
}

impl<T> From<Option<T>> for Field<T> {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => Field::Set(v),
            None => Field::Clear,
        }
    }
}

macro_rules! patch_field {
    ($($field:ident: $ty:ty),* $(,)?) => {
        /// A partial update of an [`Entry`]: carries exactly the fields to
        /// change. Serialized inside modify-entry log commands so replay
        /// performs the identical mutation.
        #[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
        pub struct EntryPatch {
            $(
                #[serde(default, skip_serializing_if = "Field::is_keep")]
                pub $field: Field<$ty>,
            )*
        }
    };
}

patch_field! {
    kind: NodeKind,
    revision: i64,
    url: String,
    repos_root: String,
    uuid: String,
    schedule: Schedule,
    copied: bool,
    copyfrom_url: String,
    copyfrom_revision: i64,
    deleted: bool,
    absent: bool,
    incomplete: bool,
    text_time: DateTime<Utc>,
    checksum: String,
    working_size: i64,
    prop_time: DateTime<Utc>,
    has_props: bool,
    has_prop_mods: bool,
    cachable_props: Vec<String>,
    present_props: Vec<String>,
    committed_revision: i64,
    committed_date: DateTime<Utc>,
    committed_author: String,
    conflict_old: String,
    conflict_new: String,
    conflict_wrk: String,
    prop_reject_file: String,
    lock_token: String,
    lock_owner: String,
    lock_comment: String,
    lock_creation_date: DateTime<Utc>,
    changelist: String,
    keep_local: bool,
    depth: Depth,
}

impl EntryPatch {
    pub fn is_empty(&self) -> bool {
        *self == EntryPatch::default()
    }

    pub fn schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = Field::Set(schedule);
        self
    }

    pub fn revision(mut self, revision: i64) -> Self {
        self.revision = Field::Set(revision);
        self
    }

    pub fn kind(mut self, kind: NodeKind) -> Self {
        self.kind = Field::Set(kind);
        self
    }

    pub fn url(mut self, url: &str) -> Self {
        self.url = Field::Set(url.to_string());
        self
    }
}

/// What the delete-after-uncommitted-add folding edge does. The source
/// lineage disagrees with itself here, so it is carried as policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddDeletePolicy {
    /// Remove the record outright (the record never reached the server).
    #[default]
    Remove,
    /// Keep the record, clearing its schedule back to normal.
    ClearSchedule,
}

/// Resolution of a schedule request against the current record state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldOutcome {
    /// Record keeps existing with the given schedule.
    Schedule(Schedule),
    /// Record is removed from the set outright.
    Remove,
}

/// Resolve a requested schedule against the current record without ever
/// producing an invalid state. The only place schedule transitions are
/// legal.
pub fn fold_scheduling(
    dir: &std::path::Path,
    entry: Option<&Entry>,
    this_dir: &Entry,
    requested: Schedule,
    policy: AddDeletePolicy,
) -> Result<FoldOutcome> {
    let Some(entry) = entry else {
        // No record yet: only scheduling an addition can create one.
        if requested == Schedule::Add {
            return Ok(FoldOutcome::Schedule(Schedule::Add));
        }
        return Err(WcError::ScheduleConflict {
            path: dir.to_path_buf(),
            reason: "path is not under version control".to_string(),
        });
    };

    if entry.absent && requested == Schedule::Add {
        return Err(WcError::ScheduleConflict {
            path: dir.to_path_buf(),
            reason: format!("'{}' is marked absent and cannot be scheduled for addition", entry.name),
        });
    }

    // Requests under a directory that is itself scheduled for deletion:
    // the children go with it; bringing new ones in needs the parent
    // undeleted first.
    let is_this_dir = entry.name == this_dir.name;
    if !is_this_dir
        && this_dir.schedule == Schedule::Delete
        && (requested == Schedule::Add || requested == Schedule::Replace)
    {
        return Err(WcError::ScheduleConflict {
            path: dir.to_path_buf(),
            reason: format!(
                "cannot add '{}' to a directory scheduled for deletion; undelete the parent first",
                entry.name
            ),
        });
    }

    let outcome = match (entry.schedule, requested) {
        (current, Schedule::Normal) => FoldOutcome::Schedule(current),

        (Schedule::Normal, req) => FoldOutcome::Schedule(req),

        (Schedule::Add, Schedule::Delete) => {
            if entry.deleted {
                // The server already knows this name is gone; keep the
                // record but drop the local add.
                FoldOutcome::Schedule(Schedule::Normal)
            } else {
                match policy {
                    AddDeletePolicy::Remove => FoldOutcome::Remove,
                    AddDeletePolicy::ClearSchedule => FoldOutcome::Schedule(Schedule::Normal),
                }
            }
        }
        (Schedule::Add, _) => FoldOutcome::Schedule(Schedule::Add),

        (Schedule::Delete, Schedule::Add) => FoldOutcome::Schedule(Schedule::Replace),
        (Schedule::Delete, _) => FoldOutcome::Schedule(Schedule::Delete),

        (Schedule::Replace, Schedule::Delete) => FoldOutcome::Schedule(Schedule::Delete),
        (Schedule::Replace, _) => FoldOutcome::Schedule(Schedule::Replace),
    };
    Ok(outcome)
}

/// Append a path component to a URL, percent-encoding the characters a
/// URL cannot carry verbatim.
pub fn uri_append(url: &str, name: &str) -> String {
    let mut out = String::with_capacity(url.len() + name.len() + 1);
    out.push_str(url.trim_end_matches('/'));
    out.push('/');
    out.push_str(&uri_encode(name));
    out
}

pub fn uri_encode(component: &str) -> String {
    let mut out = String::with_capacity(component.len());
    for b in component.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' => out.push(b as char),
            b'-' | b'.' | b'_' | b'~' | b'!' | b'$' | b'&' | b'\'' | b'(' | b')' | b'*'
            | b'+' | b',' | b'=' | b'@' => out.push(b as char),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}
