//! Write-ahead transaction log
//!
//! Multi-step local mutations are expressed as a command sequence,
//! accumulated in a [`LogBuilder`], saved durably to a numbered log file
//! inside the admin area, then replayed immediately. Replay deletes the
//! log files only after every command succeeded; a failure (or crash)
//! leaves them in place so the next open of the directory re-runs the
//! same sequence. That makes replay the sole crash-recovery mechanism,
//! and every command idempotent by construction: file mutations happen
//! first, the record mutation is the final step of each command.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::admin::{
    AdminArea, adm_path, remove_if_exists, set_file_mtime, set_readonly, set_writable,
};
use crate::entry::{EntryPatch, Field, NodeKind, UNSET_REVISION};
use crate::error::{Result, WcError};
use crate::merge::{ConservativeMerger, MergeLabels, MergeStatus, TextMerger};
use crate::props::{PropKind, system_time_to_utc};
use crate::translate::{NoopTranslator, Translator};

/// One durable log command. Paths are relative to the working directory
/// and may reach into the admin area (`.dsvn/tmp/...`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "kebab-case")]
pub enum Command {
    ModifyEntry {
        name: String,
        patch: EntryPatch,
    },
    DeleteEntry {
        name: String,
    },
    MoveFile {
        src: String,
        dst: String,
    },
    CopyFile {
        src: String,
        dst: String,
    },
    DeleteFile {
        path: String,
    },
    /// Append `src` to `dst`, consuming `src`; a missing `src` means the
    /// append already happened.
    AppendFile {
        src: String,
        dst: String,
    },
    CopyAndTranslate {
        src: String,
        dst: String,
    },
    CopyAndDetranslate {
        src: String,
        dst: String,
    },
    SetReadonly {
        path: String,
    },
    MaybeReadonly {
        name: String,
    },
    MaybeExecutable {
        name: String,
    },
    SetTimestamp {
        path: String,
        timestamp: DateTime<Utc>,
    },
    /// Three-way merge of `right` (incoming) and the saved pre-merge
    /// working snapshot `mine` against `left` (old base), into `target`.
    /// Labels are marker/artifact suffixes such as `r5` or `mine`.
    MergeText {
        target: String,
        mine: String,
        left: String,
        right: String,
        left_label: String,
        right_label: String,
        mine_label: String,
    },
    ModifyWcProperty {
        name: String,
        prop: String,
        value: Option<String>,
    },
    DeleteLock {
        name: String,
    },
    DeleteChangelist {
        name: String,
    },
    MarkCommitted {
        name: String,
        revision: i64,
        date: Option<DateTime<Utc>>,
        author: Option<String>,
        checksum: Option<String>,
    },
    UpgradeFormat {
        format: u32,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::ModifyEntry { .. } => "modify-entry",
            Command::DeleteEntry { .. } => "delete-entry",
            Command::MoveFile { .. } => "move-file",
            Command::CopyFile { .. } => "copy-file",
            Command::DeleteFile { .. } => "delete-file",
            Command::AppendFile { .. } => "append-file",
            Command::CopyAndTranslate { .. } => "copy-and-translate",
            Command::CopyAndDetranslate { .. } => "copy-and-detranslate",
            Command::SetReadonly { .. } => "set-readonly",
            Command::MaybeReadonly { .. } => "maybe-readonly",
            Command::MaybeExecutable { .. } => "maybe-executable",
            Command::SetTimestamp { .. } => "set-timestamp",
            Command::MergeText { .. } => "merge-text",
            Command::ModifyWcProperty { .. } => "modify-wc-property",
            Command::DeleteLock { .. } => "delete-lock",
            Command::DeleteChangelist { .. } => "delete-changelist",
            Command::MarkCommitted { .. } => "mark-committed",
            Command::UpgradeFormat { .. } => "upgrade-format",
        }
    }
}

/// Collaborators log replay needs: the merge primitive and the content
/// translator. Recovery paths fall back to the conservative built-ins.
pub struct LogContext<'a> {
    pub merger: &'a dyn TextMerger,
    pub translator: &'a dyn Translator,
}

static RECOVERY_MERGER: ConservativeMerger = ConservativeMerger;
static RECOVERY_TRANSLATOR: NoopTranslator = NoopTranslator;

impl LogContext<'_> {
    pub fn recovery() -> LogContext<'static> {
        LogContext {
            merger: &RECOVERY_MERGER,
            translator: &RECOVERY_TRANSLATOR,
        }
    }
}

/// In-memory command accumulator for one logical operation.
#[derive(Debug, Default)]
pub struct LogBuilder {
    commands: Vec<Command>,
}

impl LogBuilder {
    pub fn new() -> Self {
        LogBuilder::default()
    }

    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub fn modify_entry(&mut self, name: &str, patch: EntryPatch) {
        self.push(Command::ModifyEntry {
            name: name.to_string(),
            patch,
        });
    }

    pub fn delete_entry(&mut self, name: &str) {
        self.push(Command::DeleteEntry {
            name: name.to_string(),
        });
    }

    pub fn move_file(&mut self, src: &str, dst: &str) {
        self.push(Command::MoveFile {
            src: src.to_string(),
            dst: dst.to_string(),
        });
    }

    pub fn copy_file(&mut self, src: &str, dst: &str) {
        self.push(Command::CopyFile {
            src: src.to_string(),
            dst: dst.to_string(),
        });
    }

    pub fn delete_file(&mut self, path: &str) {
        self.push(Command::DeleteFile {
            path: path.to_string(),
        });
    }

    pub fn set_timestamp(&mut self, path: &str, timestamp: DateTime<Utc>) {
        self.push(Command::SetTimestamp {
            path: path.to_string(),
            timestamp,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Serialize to the numbered log file, durably. upgrade-format may
    /// only close a sequence, never sit in the middle of one.
    pub fn save(&self, area: &AdminArea, sequence: u32) -> Result<PathBuf> {
        let last_upgrade = self
            .commands
            .iter()
            .position(|c| matches!(c, Command::UpgradeFormat { .. }));
        if let Some(pos) = last_upgrade {
            if pos + 1 != self.commands.len() {
                return Err(WcError::corrupt(
                    area.path(),
                    "upgrade-format must be the last command of a log sequence",
                ));
            }
        }

        let mut body = String::new();
        for command in &self.commands {
            body.push_str(&serde_json::to_string(command).map_err(|e| {
                WcError::corrupt(area.path(), format!("unserializable log command: {e}"))
            })?);
            body.push('\n');
        }

        fs::create_dir_all(area.tmp_dir())?;
        let tmp = area.tmp_unique("log");
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(body.as_bytes())?;
            f.sync_all()?;
        }
        let target = area.adm().join(log_name(sequence));
        fs::rename(&tmp, &target)?;
        tracing::debug!(dir = %area.path().display(), sequence, commands = self.commands.len(), "saved log");
        Ok(target)
    }
}

pub fn log_name(sequence: u32) -> String {
    if sequence == 0 {
        "log".to_string()
    } else {
        format!("log.{sequence}")
    }
}

/// Numbered log files currently on disk, ascending.
pub fn pending_logs(area: &AdminArea) -> Result<Vec<(u32, PathBuf)>> {
    let adm = area.adm();
    let mut found = Vec::new();
    for entry in fs::read_dir(&adm)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name == "log" {
            found.push((0, entry.path()));
        } else if let Some(seq) = name.strip_prefix("log.") {
            if let Ok(seq) = seq.parse::<u32>() {
                found.push((seq, entry.path()));
            }
        }
    }
    found.sort_by_key(|(seq, _)| *seq);
    Ok(found)
}

/// Next free sequence number for [`LogBuilder::save`].
pub fn next_sequence(area: &AdminArea) -> Result<u32> {
    Ok(pending_logs(area)?.last().map(|(seq, _)| seq + 1).unwrap_or(0))
}

/// Replay every pending log of this directory in sequence order, then
/// delete the log files. Returns whether anything ran. On command
/// failure the logs stay for the next attempt.
pub fn run_logs(area: &mut AdminArea, ctx: &LogContext) -> Result<bool> {
    let logs = pending_logs(area)?;
    if logs.is_empty() {
        return Ok(false);
    }

    let mut commands = Vec::new();
    for (_, path) in &logs {
        let text = fs::read_to_string(path)?;
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let command: Command = serde_json::from_str(line).map_err(|e| {
                WcError::corrupt(area.path(), format!("unreadable log command: {e}"))
            })?;
            commands.push(command);
        }
    }

    tracing::debug!(dir = %area.path().display(), commands = commands.len(), files = logs.len(), "replaying logs");
    for command in &commands {
        exec_command(area, ctx, command)
            .map_err(|e| e.in_command(command.name(), area.path()))?;
    }

    area.write_entries()?;
    for (_, path) in &logs {
        set_writable(path)?;
        fs::remove_file(path)?;
    }
    Ok(true)
}

/// Recovery entry point: walk the tree depth-first, replay pending logs,
/// clear stale lock sentinels and empty each scratch area.
pub fn cleanup(
    path: &Path,
    ctx: &LogContext,
    cancel: Option<&dyn Fn() -> bool>,
) -> Result<()> {
    if let Some(cancel) = cancel {
        if cancel() {
            return Err(WcError::Cancelled);
        }
    }
    let mut area = AdminArea::open(path)?;

    for name in area.entry_names(true) {
        if name.is_empty() {
            continue;
        }
        let child = path.join(&name);
        if adm_path(&child).exists() {
            cleanup(&child, ctx, cancel)?;
        }
    }

    run_logs(&mut area, ctx)?;

    let tmp = area.tmp_dir();
    if tmp.exists() {
        for entry in fs::read_dir(&tmp)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                for inner in fs::read_dir(entry.path())? {
                    remove_if_exists(&inner?.path())?;
                }
            } else {
                remove_if_exists(&entry.path())?;
            }
        }
    }

    let lock = area.lock_path();
    if lock.exists() {
        tracing::warn!(dir = %path.display(), "removing stale lock sentinel");
        remove_if_exists(&lock)?;
    }
    if area.is_dirty() {
        area.write_entries()?;
    }
    Ok(())
}

/// Post-commit bookkeeping for one path, expressed as a durable log
/// sequence: the working text is detranslated into a staged base, then
/// mark-committed installs it and flips the record to the new revision.
/// A crash at any point replays on the next open.
pub fn process_committed(
    area: &mut AdminArea,
    name: &str,
    revision: i64,
    date: Option<DateTime<Utc>>,
    author: Option<&str>,
    ctx: &LogContext,
) -> Result<()> {
    let is_file = area
        .entry(name, true)
        .is_some_and(|e| e.kind == NodeKind::File);

    let mut log = LogBuilder::new();
    if is_file {
        let staged = area.tmp_text_base_path(name);
        let staged_rel = staged
            .strip_prefix(area.path())
            .unwrap_or(&staged)
            .to_string_lossy()
            .into_owned();
        log.push(Command::CopyAndDetranslate {
            src: name.to_string(),
            dst: staged_rel,
        });
    }
    log.push(Command::MarkCommitted {
        name: name.to_string(),
        revision,
        date,
        author: author.map(str::to_string),
        checksum: None,
    });
    log.save(area, next_sequence(area)?)?;
    run_logs(area, ctx)?;
    Ok(())
}

pub(crate) fn exec_command(
    area: &mut AdminArea,
    ctx: &LogContext,
    command: &Command,
) -> Result<()> {
    let dir = area.path().to_path_buf();
    let abs = |rel: &str| dir.join(rel);

    match command {
        Command::ModifyEntry { name, patch } => area.modify_entry(name, patch),

        Command::DeleteEntry { name } => {
            area.remove_from_revision_control(name, true, ctx.translator)
        }

        Command::MoveFile { src, dst } => {
            let src = abs(src);
            let dst = abs(dst);
            if src.exists() {
                if let Some(parent) = dst.parent() {
                    fs::create_dir_all(parent)?;
                }
                set_writable(&dst)?;
                fs::rename(&src, &dst)?;
            }
            Ok(())
        }

        Command::CopyFile { src, dst } => {
            let src = abs(src);
            let dst = abs(dst);
            if !src.exists() {
                if dst.exists() {
                    return Ok(());
                }
                return Err(WcError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("copy source '{}' is missing", src.display()),
                )));
            }
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent)?;
            }
            set_writable(&dst)?;
            fs::copy(&src, &dst)?;
            Ok(())
        }

        Command::DeleteFile { path } => remove_if_exists(&abs(path)),

        Command::AppendFile { src, dst } => {
            let src = abs(src);
            if !src.exists() {
                return Ok(());
            }
            let content = fs::read(&src)?;
            let dst = abs(dst);
            set_writable(&dst)?;
            let mut f = fs::File::options().create(true).append(true).open(&dst)?;
            f.write_all(&content)?;
            f.sync_all()?;
            fs::remove_file(&src)?;
            Ok(())
        }

        Command::CopyAndTranslate { src, dst } => {
            let content = fs::read(abs(src))?;
            let dst = abs(dst);
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent)?;
            }
            set_writable(&dst)?;
            fs::write(&dst, ctx.translator.translate(&content))?;
            Ok(())
        }

        Command::CopyAndDetranslate { src, dst } => {
            let content = fs::read(abs(src))?;
            let dst = abs(dst);
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent)?;
            }
            set_writable(&dst)?;
            fs::write(&dst, ctx.translator.detranslate(&content))?;
            Ok(())
        }

        Command::SetReadonly { path } => set_readonly(&abs(path)),

        Command::MaybeReadonly { name } => {
            let needs_lock = path_has_prop(area, name, "svn:needs-lock")?;
            let has_token = area
                .entry(name, true)
                .is_some_and(|e| e.lock_token.is_some());
            if needs_lock && !has_token {
                set_readonly(&abs(name))?;
            }
            Ok(())
        }

        Command::MaybeExecutable { name } => {
            if path_has_prop(area, name, "svn:executable")? {
                set_executable(&abs(name))?;
            }
            Ok(())
        }

        Command::SetTimestamp { path, timestamp } => {
            let path = abs(path);
            if path.exists() {
                set_file_mtime(&path, *timestamp)?;
            }
            Ok(())
        }

        Command::MergeText {
            target,
            mine,
            left,
            right,
            left_label,
            right_label,
            mine_label,
        } => {
            let base = fs::read(abs(left))?;
            let theirs = fs::read(abs(right))?;
            let mine_text = fs::read(abs(mine))?;
            let labels = MergeLabels {
                base: format!(".{left_label}"),
                theirs: format!(".{right_label}"),
                mine: format!(".{mine_label}"),
            };
            let result = ctx.merger.merge(&base, &theirs, &mine_text, &labels);

            let target_abs = abs(target);
            set_writable(&target_abs)?;
            fs::write(&target_abs, ctx.translator.translate(&result.merged_text))?;

            if result.status == MergeStatus::Conflicted {
                let old_name = format!("{target}.{left_label}");
                let new_name = format!("{target}.{right_label}");
                let wrk_name = format!("{target}.{mine_label}");
                fs::write(abs(&old_name), &base)?;
                fs::write(abs(&new_name), &theirs)?;
                fs::write(abs(&wrk_name), ctx.translator.translate(&mine_text))?;
                let patch = EntryPatch {
                    conflict_old: Field::Set(old_name),
                    conflict_new: Field::Set(new_name),
                    conflict_wrk: Field::Set(wrk_name),
                    ..EntryPatch::default()
                };
                area.modify_entry(target, &patch)?;
            }
            Ok(())
        }

        Command::ModifyWcProperty { name, prop, value } => {
            area.props().set_wcprop(name, prop, value.as_deref())
        }

        Command::DeleteLock { name } => {
            let patch = EntryPatch {
                lock_token: Field::Clear,
                lock_owner: Field::Clear,
                lock_comment: Field::Clear,
                lock_creation_date: Field::Clear,
                ..EntryPatch::default()
            };
            area.modify_entry(name, &patch)
        }

        Command::DeleteChangelist { name } => {
            let patch = EntryPatch {
                changelist: Field::Clear,
                ..EntryPatch::default()
            };
            area.modify_entry(name, &patch)
        }

        Command::MarkCommitted {
            name,
            revision,
            date,
            author,
            checksum,
        } => exec_mark_committed(area, name, *revision, *date, author.clone(), checksum.clone()),

        Command::UpgradeFormat { format } => area.set_format(*format),
    }
}

fn exec_mark_committed(
    area: &mut AdminArea,
    name: &str,
    revision: i64,
    date: Option<DateTime<Utc>>,
    author: Option<String>,
    checksum: Option<String>,
) -> Result<()> {
    let Some(entry) = area.entry(name, true).cloned() else {
        return Ok(());
    };

    // Working files and property files first; the record flips last.
    let mut new_checksum = checksum;
    if entry.kind == NodeKind::File {
        let installed = area.install_text_base(name)?;
        if new_checksum.is_none() {
            new_checksum = Some(installed);
        }
    }

    let props = area.props();
    let working_props = props.read(name, PropKind::Working)?;
    if let Some(map) = &working_props {
        props.write(name, PropKind::Base, map)?;
    }
    props.remove(name, PropKind::Revert)?;

    let mut patch = EntryPatch {
        revision: Field::Set(revision),
        committed_revision: Field::Set(revision),
        schedule: Field::Clear,
        copied: Field::Clear,
        deleted: Field::Clear,
        copyfrom_url: Field::Clear,
        copyfrom_revision: Field::Set(UNSET_REVISION),
        conflict_old: Field::Clear,
        conflict_new: Field::Clear,
        conflict_wrk: Field::Clear,
        prop_reject_file: Field::Clear,
        ..EntryPatch::default()
    };
    patch.committed_date = date.into();
    patch.committed_author = author.into();
    if let Some(checksum) = new_checksum {
        patch.checksum = Field::Set(checksum);
    }

    let working = area.path().join(name);
    if entry.kind == NodeKind::File && working.exists() {
        let meta = fs::metadata(&working)?;
        if let Ok(mtime) = meta.modified() {
            patch.text_time = Field::Set(system_time_to_utc(mtime));
        }
        patch.working_size = Field::Set(meta.len() as i64);
    }
    area.modify_entry(name, &patch)
}

fn path_has_prop(area: &AdminArea, name: &str, prop: &str) -> Result<bool> {
    if let Some(entry) = area.entry(name, true) {
        if entry.present_props.iter().any(|p| p == prop) {
            return Ok(true);
        }
    }
    let props = area.props().read(name, PropKind::Working)?;
    Ok(props.is_some_and(|map| map.contains_key(prop)))
}

fn set_executable(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let meta = fs::metadata(path)?;
        let mut perms = meta.permissions();
        perms.set_mode(perms.mode() | 0o111);
        fs::set_permissions(path, perms)?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::file_checksum;
    use crate::entry::Schedule;
    use tempfile::TempDir;

    const ADM_TMP: &str = ".dsvn/tmp";

    fn new_area(tmp: &TempDir) -> AdminArea {
        AdminArea::create(tmp.path(), "http://host/repo/trunk", None, None, 5).unwrap()
    }

    fn entry_patch(kind: NodeKind, revision: i64) -> EntryPatch {
        EntryPatch::default().kind(kind).revision(revision)
    }

    #[test]
    fn test_save_and_replay_modify_entry() {
        let tmp = TempDir::new().unwrap();
        let mut area = new_area(&tmp);

        let mut log = LogBuilder::new();
        log.modify_entry("alpha", entry_patch(NodeKind::File, 5));
        log.save(&area, next_sequence(&area).unwrap()).unwrap();

        assert!(area.entry("alpha", true).is_none());
        assert!(run_logs(&mut area, &LogContext::recovery()).unwrap());
        assert_eq!(area.entry("alpha", false).unwrap().revision, 5);
        assert!(pending_logs(&area).unwrap().is_empty());

        // Durable too: the flush happened before the logs were deleted.
        let reopened = AdminArea::open(tmp.path()).unwrap();
        assert!(reopened.entry("alpha", false).is_some());
    }

    #[test]
    fn test_replay_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let mut area = new_area(&tmp);
        fs::write(tmp.path().join("src.txt"), b"payload\n").unwrap();

        let mut log = LogBuilder::new();
        log.move_file("src.txt", "dst.txt");
        log.modify_entry("dst.txt", entry_patch(NodeKind::File, 5));
        let saved = log.save(&area, 0).unwrap();
        let body = fs::read_to_string(&saved).unwrap();

        assert!(run_logs(&mut area, &LogContext::recovery()).unwrap());
        let first = fs::read(tmp.path().join("dst.txt")).unwrap();

        // Same sequence again, as a crashed run would leave it.
        fs::write(&saved, &body).unwrap();
        assert!(run_logs(&mut area, &LogContext::recovery()).unwrap());
        assert_eq!(fs::read(tmp.path().join("dst.txt")).unwrap(), first);
        assert_eq!(area.entry("dst.txt", false).unwrap().revision, 5);
    }

    #[test]
    fn test_interrupted_replay_restarts_cleanly() {
        let tmp = TempDir::new().unwrap();
        let mut area = new_area(&tmp);
        fs::write(tmp.path().join("a.tmp"), b"a\n").unwrap();
        fs::write(tmp.path().join("b.tmp"), b"b\n").unwrap();

        let mut log = LogBuilder::new();
        log.move_file("a.tmp", "a.txt");
        log.move_file("b.tmp", "b.txt");
        log.modify_entry("a.txt", entry_patch(NodeKind::File, 9));
        log.modify_entry("b.txt", entry_patch(NodeKind::File, 9));
        log.save(&area, 0).unwrap();

        // Crash after command 1 of 4: execute one command by hand, then
        // pretend the process died and the next open replays everything.
        let commands: Vec<Command> = fs::read_to_string(area.adm().join("log"))
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        exec_command(&mut area, &LogContext::recovery(), &commands[0]).unwrap();
        drop(area);

        let mut area = AdminArea::open(tmp.path()).unwrap();
        assert!(run_logs(&mut area, &LogContext::recovery()).unwrap());
        assert!(tmp.path().join("a.txt").exists());
        assert!(tmp.path().join("b.txt").exists());
        assert_eq!(area.entry("a.txt", false).unwrap().revision, 9);
        assert_eq!(area.entry("b.txt", false).unwrap().revision, 9);
        assert!(pending_logs(&area).unwrap().is_empty());
    }

    #[test]
    fn test_failed_command_keeps_logs() {
        let tmp = TempDir::new().unwrap();
        let mut area = new_area(&tmp);

        let mut log = LogBuilder::new();
        log.copy_file("missing-src", "dst");
        log.save(&area, 0).unwrap();

        let err = run_logs(&mut area, &LogContext::recovery()).unwrap_err();
        match err {
            WcError::LogCommand { command, .. } => assert_eq!(command, "copy-file"),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(pending_logs(&area).unwrap().len(), 1);
    }

    #[test]
    fn test_multiple_log_files_run_in_sequence() {
        let tmp = TempDir::new().unwrap();
        let mut area = new_area(&tmp);

        let mut first = LogBuilder::new();
        first.modify_entry("alpha", entry_patch(NodeKind::File, 5));
        first.save(&area, 0).unwrap();
        let mut second = LogBuilder::new();
        second.modify_entry(
            "alpha",
            EntryPatch::default().schedule(Schedule::Delete),
        );
        second.save(&area, next_sequence(&area).unwrap()).unwrap();

        run_logs(&mut area, &LogContext::recovery()).unwrap();
        assert_eq!(
            area.entry("alpha", true).unwrap().schedule,
            Schedule::Delete
        );
    }

    #[test]
    fn test_upgrade_format_must_close_sequence() {
        let tmp = TempDir::new().unwrap();
        let area = new_area(&tmp);
        let mut log = LogBuilder::new();
        log.push(Command::UpgradeFormat { format: 8 });
        log.modify_entry("alpha", entry_patch(NodeKind::File, 5));
        assert!(matches!(log.save(&area, 0), Err(WcError::Corrupt { .. })));
    }

    #[test]
    fn test_merge_text_conflict_sets_entry_fields() {
        let tmp = TempDir::new().unwrap();
        let mut area = new_area(&tmp);
        fs::write(tmp.path().join("alpha"), b"local\n").unwrap();
        let adm_tmp = area.tmp_dir();
        fs::write(adm_tmp.join("alpha.old"), b"base\n").unwrap();
        fs::write(adm_tmp.join("alpha.new"), b"server\n").unwrap();
        fs::write(adm_tmp.join("alpha.mine"), b"local\n").unwrap();
        area.modify_entry("alpha", &entry_patch(NodeKind::File, 5))
            .unwrap();

        let mut log = LogBuilder::new();
        log.push(Command::MergeText {
            target: "alpha".to_string(),
            mine: format!("{ADM_TMP}/alpha.mine"),
            left: format!("{ADM_TMP}/alpha.old"),
            right: format!("{ADM_TMP}/alpha.new"),
            left_label: "r5".to_string(),
            right_label: "r7".to_string(),
            mine_label: "mine".to_string(),
        });
        log.save(&area, 0).unwrap();
        run_logs(&mut area, &LogContext::recovery()).unwrap();

        let entry = area.entry("alpha", false).unwrap();
        assert_eq!(entry.conflict_old.as_deref(), Some("alpha.r5"));
        assert_eq!(entry.conflict_new.as_deref(), Some("alpha.r7"));
        assert_eq!(entry.conflict_wrk.as_deref(), Some("alpha.mine"));
        assert!(tmp.path().join("alpha.r5").exists());
        assert!(tmp.path().join("alpha.r7").exists());
        assert!(tmp.path().join("alpha.mine").exists());
        let merged = fs::read_to_string(tmp.path().join("alpha")).unwrap();
        assert!(merged.contains("<<<<<<<"));
    }

    #[test]
    fn test_mark_committed() {
        let tmp = TempDir::new().unwrap();
        let mut area = new_area(&tmp);
        fs::write(tmp.path().join("alpha"), b"new text\n").unwrap();
        fs::create_dir_all(area.adm().join("tmp/text-base")).unwrap();
        fs::write(area.tmp_text_base_path("alpha"), b"new text\n").unwrap();
        let mut patch = entry_patch(NodeKind::File, 5);
        patch.schedule = Field::Set(Schedule::Add);
        area.modify_entry("alpha", &patch).unwrap();

        let mut log = LogBuilder::new();
        log.push(Command::MarkCommitted {
            name: "alpha".to_string(),
            revision: 6,
            date: None,
            author: Some("jrandom".to_string()),
            checksum: None,
        });
        log.save(&area, 0).unwrap();
        run_logs(&mut area, &LogContext::recovery()).unwrap();

        let entry = area.entry("alpha", false).unwrap();
        assert_eq!(entry.revision, 6);
        assert_eq!(entry.committed_revision, 6);
        assert_eq!(entry.schedule, Schedule::Normal);
        assert_eq!(entry.committed_author.as_deref(), Some("jrandom"));
        assert_eq!(
            entry.checksum.as_deref(),
            Some(file_checksum(&area.text_base_path("alpha")).unwrap().as_str())
        );
        assert!(area.text_base_path("alpha").exists());
    }

    #[test]
    fn test_process_committed_stages_base_from_working() {
        let tmp = TempDir::new().unwrap();
        let mut area = new_area(&tmp);
        fs::write(tmp.path().join("alpha"), b"committed text\n").unwrap();
        let mut patch = entry_patch(NodeKind::File, 5);
        patch.schedule = Field::Set(Schedule::Add);
        area.modify_entry("alpha", &patch).unwrap();

        process_committed(
            &mut area,
            "alpha",
            6,
            None,
            Some("jrandom"),
            &LogContext::recovery(),
        )
        .unwrap();

        let entry = area.entry("alpha", false).unwrap();
        assert_eq!(entry.revision, 6);
        assert_eq!(entry.schedule, Schedule::Normal);
        assert_eq!(
            fs::read(area.text_base_path("alpha")).unwrap(),
            b"committed text\n"
        );
        assert!(pending_logs(&area).unwrap().is_empty());
    }

    #[test]
    fn test_wcprop_and_lock_commands() {
        let tmp = TempDir::new().unwrap();
        let mut area = new_area(&tmp);
        area.modify_entry("alpha", &entry_patch(NodeKind::File, 5))
            .unwrap();
        let mut patch = EntryPatch::default();
        patch.lock_token = Field::Set("opaquelocktoken:42".to_string());
        patch.lock_owner = Field::Set("jrandom".to_string());
        area.modify_entry("alpha", &patch).unwrap();

        let mut log = LogBuilder::new();
        log.push(Command::ModifyWcProperty {
            name: "alpha".to_string(),
            prop: "dav:activity".to_string(),
            value: Some("xyz".to_string()),
        });
        log.push(Command::DeleteLock {
            name: "alpha".to_string(),
        });
        log.save(&area, 0).unwrap();
        run_logs(&mut area, &LogContext::recovery()).unwrap();

        assert_eq!(
            area.props().read_wcprops("alpha").unwrap().get("dav:activity"),
            Some(&"xyz".to_string())
        );
        let entry = area.entry("alpha", false).unwrap();
        assert!(entry.lock_token.is_none());
        assert!(entry.lock_owner.is_none());
    }
}
