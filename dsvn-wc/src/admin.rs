//! Per-directory admin area facade
//!
//! Every versioned directory carries a `.dsvn` subdirectory holding its
//! format marker, entries file, property files, pristine text bases, the
//! transaction log and a scratch area. `AdminArea` is the in-memory view
//! of one such directory: the parsed record set plus the path helpers the
//! other subsystems route through. Record mutation goes through
//! [`EntryPatch`] exclusively.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sha1::{Digest, Sha1};

use crate::entry::{
    AddDeletePolicy, Entry, EntryPatch, Field, FoldOutcome, NodeKind, Schedule,
    fold_scheduling,
};
use crate::entries_file;
use crate::error::{Result, WcError};
use crate::format;
use crate::props::{PropKind, PropertyStore, system_time_to_utc};
use crate::translate::Translator;

/// Name of the admin subdirectory inside every versioned directory.
pub const ADM_DIR: &str = ".dsvn";

pub fn adm_path(dir: &Path) -> PathBuf {
    dir.join(ADM_DIR)
}

pub fn sha1_hex(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

pub fn file_checksum(path: &Path) -> Result<String> {
    Ok(sha1_hex(&fs::read(path)?))
}

/// One directory's admin area: format, record set and path layout.
pub struct AdminArea {
    path: PathBuf,
    format: u32,
    entries: BTreeMap<String, Entry>,
    dirty: bool,
}

impl AdminArea {
    /// Load an existing admin area from disk.
    pub fn open(path: &Path) -> Result<AdminArea> {
        let adm = adm_path(path);
        let format = format::read_format(path, &adm)?;
        let text = fs::read_to_string(adm.join("entries")).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                WcError::MissingAdminArea(path.to_path_buf())
            } else {
                e.into()
            }
        })?;
        let entries = entries_file::parse_entries(path, format, &text)?;
        Ok(AdminArea {
            path: path.to_path_buf(),
            format,
            entries,
            dirty: false,
        })
    }

    /// Create a fresh admin area for a directory entering version
    /// control. The this-dir record starts incomplete; an update fills
    /// the directory in and clears the flag.
    pub fn create(
        path: &Path,
        url: &str,
        repos_root: Option<&str>,
        uuid: Option<&str>,
        revision: i64,
    ) -> Result<AdminArea> {
        let adm = adm_path(path);
        if adm.join("entries").exists() {
            return Err(WcError::Obstructed(path.to_path_buf()));
        }
        fs::create_dir_all(path)?;
        for sub in ["tmp", "tmp/text-base", "text-base", "props", "prop-base"] {
            fs::create_dir_all(adm.join(sub))?;
        }

        let mut this_dir = Entry::new("", NodeKind::Dir);
        this_dir.revision = revision.max(0);
        this_dir.url = Some(url.to_string());
        this_dir.repos_root = repos_root.map(str::to_string);
        this_dir.uuid = uuid.map(str::to_string);
        this_dir.incomplete = true;
        if format::has_prop_caching(format::CURRENT_FORMAT) {
            this_dir.cachable_props = format::DEFAULT_CACHABLE_PROPS
                .iter()
                .map(|s| s.to_string())
                .collect();
        }

        let mut entries = BTreeMap::new();
        entries.insert(String::new(), this_dir);
        let mut area = AdminArea {
            path: path.to_path_buf(),
            format: format::CURRENT_FORMAT,
            entries,
            dirty: true,
        };
        fs::write(adm.join("format"), format!("{}\n", area.format))?;
        area.write_entries()?;
        Ok(area)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn adm(&self) -> PathBuf {
        adm_path(&self.path)
    }

    pub fn format(&self) -> u32 {
        self.format
    }

    /// Called by upgrade-format replay; takes effect on the next flush.
    pub(crate) fn set_format(&mut self, format: u32) -> Result<()> {
        format::check_format(&self.path, format)?;
        self.format = format;
        self.dirty = true;
        Ok(())
    }

    pub fn this_dir(&self) -> Result<&Entry> {
        self.entries
            .get("")
            .ok_or_else(|| WcError::corrupt(&self.path, "record set has no this-dir record"))
    }

    /// Look up one record; hidden records only surface on request.
    pub fn entry(&self, name: &str, show_hidden: bool) -> Option<&Entry> {
        self.entries
            .get(name)
            .filter(|e| show_hidden || !e.is_hidden())
    }

    pub fn entry_names(&self, show_hidden: bool) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, e)| show_hidden || !e.is_hidden())
            .map(|(n, _)| n.clone())
            .collect()
    }

    pub fn entries(&self, show_hidden: bool) -> impl Iterator<Item = &Entry> {
        self.entries
            .values()
            .filter(move |e| show_hidden || !e.is_hidden())
    }

    /// Apply a partial update to one record, creating it when absent.
    /// A patch creating a record must carry the node kind.
    pub fn modify_entry(&mut self, name: &str, patch: &EntryPatch) -> Result<()> {
        if let Some(entry) = self.entries.get_mut(name) {
            entry.apply(patch);
            self.dirty = true;
            return Ok(());
        }
        let Field::Set(kind) = patch.kind else {
            return Err(WcError::corrupt(
                &self.path,
                format!("attempt to modify nonexistent record '{name}'"),
            ));
        };
        let mut entry = Entry::new(name, kind);
        entry.apply(patch);
        self.entries.insert(name.to_string(), entry);
        self.dirty = true;
        Ok(())
    }

    /// Resolve and apply a schedule request through the folding table.
    /// Returns the outcome so callers can follow up on removals.
    pub fn fold_schedule(
        &mut self,
        name: &str,
        requested: Schedule,
        policy: AddDeletePolicy,
    ) -> Result<FoldOutcome> {
        let this_dir = self.this_dir()?.clone();
        let entry = self.entries.get(name);
        let outcome = fold_scheduling(&self.path, entry, &this_dir, requested, policy)?;
        match outcome {
            FoldOutcome::Remove => {
                self.remove_entry(name)?;
            }
            FoldOutcome::Schedule(schedule) => {
                if let Some(entry) = self.entries.get_mut(name) {
                    entry.schedule = schedule;
                    if schedule == Schedule::Add {
                        entry.absent = false;
                    }
                } else {
                    let mut entry = Entry::new(name, NodeKind::None);
                    entry.schedule = schedule;
                    self.entries.insert(name.to_string(), entry);
                }
                self.dirty = true;
            }
        }
        Ok(outcome)
    }

    /// Drop one record and the metadata files that belong to it.
    pub fn remove_entry(&mut self, name: &str) -> Result<()> {
        self.entries.remove(name);
        self.dirty = true;
        if !name.is_empty() {
            remove_if_exists(&self.text_base_path(name))?;
            let props = self.props();
            props.remove(name, PropKind::Base)?;
            props.remove(name, PropKind::Working)?;
            props.remove(name, PropKind::Revert)?;
            props.remove_wcprops(name)?;
        }
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Flush the record set atomically: tmp file, durable sync, rename.
    pub fn write_entries(&mut self) -> Result<()> {
        let adm = self.adm();
        let text = entries_file::serialize_entries(self.format, &self.entries);
        let tmp_dir = adm.join("tmp");
        fs::create_dir_all(&tmp_dir)?;
        let tmp = tmp_dir.join(format!("entries.{}", uuid::Uuid::new_v4()));
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(text.as_bytes())?;
            f.sync_all()?;
        }
        let target = adm.join("entries");
        set_writable(&target)?;
        fs::rename(&tmp, &target)?;
        set_readonly(&target)?;

        let marker = adm.join("format");
        if !format::format_in_entries_file(self.format) || marker.exists() {
            set_writable(&marker)?;
            fs::write(&marker, format!("{}\n", self.format))?;
        }
        self.dirty = false;
        Ok(())
    }

    pub fn props(&self) -> PropertyStore {
        PropertyStore::new(&self.path, &self.adm(), self.format)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.adm().join("lock")
    }

    pub fn is_locked(&self) -> bool {
        self.lock_path().exists()
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.adm().join("tmp")
    }

    /// Pristine copy of a file's last-synced content.
    pub fn text_base_path(&self, name: &str) -> PathBuf {
        self.adm().join("text-base").join(format!("{name}.base"))
    }

    /// Staging location for an incoming new text base.
    pub fn tmp_text_base_path(&self, name: &str) -> PathBuf {
        self.adm().join("tmp").join("text-base").join(format!("{name}.base"))
    }

    /// Scratch file with a unique name under tmp/.
    pub fn tmp_unique(&self, hint: &str) -> PathBuf {
        self.tmp_dir().join(format!("{hint}.{}", uuid::Uuid::new_v4()))
    }

    /// Cheap local-modification check for a file's text: working-size and
    /// text-timestamp first, byte comparison against the detranslated
    /// working content only when those are inconclusive; proven-equal
    /// content re-stamps the record.
    pub fn text_modified(&mut self, name: &str, translator: &dyn Translator) -> Result<bool> {
        let Some(entry) = self.entries.get(name) else {
            return Ok(false);
        };
        let working = self.path.join(name);
        let base = self.text_base_path(name);
        let meta = match fs::metadata(&working) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if !base.exists() {
            // Nothing to compare against: scheduled additions count as
            // modified by definition.
            return Ok(entry.schedule == Schedule::Add || entry.schedule == Schedule::Replace);
        }

        let mtime = meta.modified().ok().map(system_time_to_utc);
        if let (Some(stored), Some(actual)) = (entry.text_time, mtime) {
            if stored.timestamp() == actual.timestamp() {
                let base_len = fs::metadata(&base)?.len();
                let known_size = if entry.working_size >= 0 {
                    entry.working_size as u64
                } else {
                    base_len
                };
                if meta.len() == known_size {
                    return Ok(false);
                }
            }
        }

        let working_text = translator.detranslate(&fs::read(&working)?);
        let base_text = fs::read(&base)?;
        if working_text == base_text {
            if let Some(actual) = mtime {
                let patch = EntryPatch {
                    text_time: Field::Set(actual),
                    working_size: Field::Set(meta.len() as i64),
                    ..EntryPatch::default()
                };
                self.modify_entry(name, &patch)?;
            }
            Ok(false)
        } else {
            Ok(true)
        }
    }

    /// Move a staged text base into place and return its checksum.
    pub fn install_text_base(&self, name: &str) -> Result<String> {
        let tmp = self.tmp_text_base_path(name);
        let target = self.text_base_path(name);
        if tmp.exists() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            set_writable(&target)?;
            fs::rename(&tmp, &target)?;
            set_readonly(&target)?;
        }
        file_checksum(&target)
    }

    /// Tear one record out of version control. Directories recurse into
    /// their own admin areas bottom-up. Unmodified working files go too
    /// unless `keep_working` (or the record's keep-local flag) says
    /// otherwise; obstructions and local edits are left alone.
    pub fn remove_from_revision_control(
        &mut self,
        name: &str,
        destroy_working: bool,
        translator: &dyn Translator,
    ) -> Result<()> {
        if name.is_empty() {
            let child_names = self.entry_names(true);
            for child in child_names {
                if child.is_empty() {
                    continue;
                }
                self.remove_from_revision_control(&child, destroy_working, translator)?;
            }
            let keep = self.this_dir().map(|e| e.keep_local).unwrap_or(false);
            self.entries.retain(|n, _| n.is_empty());
            self.dirty = false;
            fs::remove_dir_all(self.adm()).or_else(ignore_not_found)?;
            if destroy_working && !keep {
                // Only an empty directory disappears; obstructions stay.
                let _ = fs::remove_dir(&self.path);
            }
            return Ok(());
        }

        let Some(entry) = self.entries.get(name).cloned() else {
            return Ok(());
        };
        match entry.kind {
            NodeKind::Dir => {
                let child_path = self.path.join(name);
                if adm_path(&child_path).exists() {
                    let mut child = AdminArea::open(&child_path)?;
                    child.remove_from_revision_control("", destroy_working, translator)?;
                }
                self.remove_entry(name)?;
            }
            _ => {
                let modified = self.text_modified(name, translator)?;
                self.remove_entry(name)?;
                if destroy_working && !modified && !entry.keep_local {
                    remove_if_exists(&self.path.join(name))?;
                }
            }
        }
        Ok(())
    }
}

pub(crate) fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn ignore_not_found(e: std::io::Error) -> std::io::Result<()> {
    if e.kind() == std::io::ErrorKind::NotFound {
        Ok(())
    } else {
        Err(e)
    }
}

pub(crate) fn set_readonly(path: &Path) -> Result<()> {
    match fs::metadata(path) {
        Ok(meta) => {
            let mut perms = meta.permissions();
            perms.set_readonly(true);
            fs::set_permissions(path, perms)?;
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn set_writable(path: &Path) -> Result<()> {
    match fs::metadata(path) {
        Ok(meta) => {
            let mut perms = meta.permissions();
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                perms.set_mode(perms.mode() | 0o600);
            }
            #[cfg(not(unix))]
            perms.set_readonly(false);
            fs::set_permissions(path, perms)?;
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn set_file_mtime(path: &Path, time: DateTime<Utc>) -> Result<()> {
    let system: std::time::SystemTime = time.into();
    let file = fs::File::options().write(true).open(path)?;
    file.set_times(fs::FileTimes::new().set_modified(system))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::NoopTranslator;
    use tempfile::TempDir;

    fn new_area(tmp: &TempDir) -> AdminArea {
        AdminArea::create(
            tmp.path(),
            "http://host/repo/trunk",
            Some("http://host/repo"),
            Some("91d2ff43-84f9-4d3f-9c2a-3f1e0d6a77b1"),
            5,
        )
        .unwrap()
    }

    #[test]
    fn test_create_and_reopen() {
        let tmp = TempDir::new().unwrap();
        let area = new_area(&tmp);
        assert_eq!(area.format(), format::CURRENT_FORMAT);
        drop(area);

        let area = AdminArea::open(tmp.path()).unwrap();
        let td = area.this_dir().unwrap();
        assert_eq!(td.revision, 5);
        assert_eq!(td.url.as_deref(), Some("http://host/repo/trunk"));
        assert!(td.incomplete);
    }

    #[test]
    fn test_open_missing_admin_area() {
        let tmp = TempDir::new().unwrap();
        assert!(matches!(
            AdminArea::open(tmp.path()),
            Err(WcError::MissingAdminArea(_))
        ));
    }

    #[test]
    fn test_modify_entry_creates_with_kind() {
        let tmp = TempDir::new().unwrap();
        let mut area = new_area(&tmp);
        let patch = EntryPatch::default().kind(NodeKind::File).revision(5);
        area.modify_entry("alpha", &patch).unwrap();
        assert!(area.entry("alpha", false).is_some());

        // Creating without a kind is a caller bug surfaced as corruption.
        let patch = EntryPatch::default().revision(5);
        assert!(area.modify_entry("beta", &patch).is_err());
    }

    #[test]
    fn test_fold_schedule_add_then_delete_removes() {
        let tmp = TempDir::new().unwrap();
        let mut area = new_area(&tmp);
        area.modify_entry("alpha", &EntryPatch::default().kind(NodeKind::File))
            .unwrap();
        area.fold_schedule("alpha", Schedule::Add, AddDeletePolicy::Remove)
            .unwrap();
        assert_eq!(area.entry("alpha", false).unwrap().schedule, Schedule::Add);
        let outcome = area
            .fold_schedule("alpha", Schedule::Delete, AddDeletePolicy::Remove)
            .unwrap();
        assert_eq!(outcome, FoldOutcome::Remove);
        assert!(area.entry("alpha", true).is_none());
    }

    #[test]
    fn test_write_entries_roundtrip_and_readonly() {
        let tmp = TempDir::new().unwrap();
        let mut area = new_area(&tmp);
        area.modify_entry(
            "alpha",
            &EntryPatch::default().kind(NodeKind::File).revision(5),
        )
        .unwrap();
        area.write_entries().unwrap();

        let meta = fs::metadata(area.adm().join("entries")).unwrap();
        assert!(meta.permissions().readonly());

        let reopened = AdminArea::open(tmp.path()).unwrap();
        assert!(reopened.entry("alpha", false).is_some());
    }

    #[test]
    fn test_text_modified_restamps_equal_content() {
        let tmp = TempDir::new().unwrap();
        let mut area = new_area(&tmp);
        fs::write(tmp.path().join("alpha"), b"same\n").unwrap();
        fs::create_dir_all(area.adm().join("text-base")).unwrap();
        fs::write(area.text_base_path("alpha"), b"same\n").unwrap();
        area.modify_entry("alpha", &EntryPatch::default().kind(NodeKind::File))
            .unwrap();

        assert!(!area.text_modified("alpha", &NoopTranslator).unwrap());
        let entry = area.entry("alpha", false).unwrap();
        assert!(entry.text_time.is_some());
        assert_eq!(entry.working_size, 5);

        fs::write(tmp.path().join("alpha"), b"different\n").unwrap();
        assert!(area.text_modified("alpha", &NoopTranslator).unwrap());
    }

    #[test]
    fn test_remove_from_revision_control_keeps_modified() {
        let tmp = TempDir::new().unwrap();
        let mut area = new_area(&tmp);
        fs::write(tmp.path().join("clean"), b"c\n").unwrap();
        fs::write(tmp.path().join("edited"), b"local\n").unwrap();
        fs::create_dir_all(area.adm().join("text-base")).unwrap();
        fs::write(area.text_base_path("clean"), b"c\n").unwrap();
        fs::write(area.text_base_path("edited"), b"server\n").unwrap();
        for name in ["clean", "edited"] {
            area.modify_entry(name, &EntryPatch::default().kind(NodeKind::File))
                .unwrap();
        }

        area.remove_from_revision_control("clean", true, &NoopTranslator)
            .unwrap();
        area.remove_from_revision_control("edited", true, &NoopTranslator)
            .unwrap();
        assert!(!tmp.path().join("clean").exists());
        assert!(tmp.path().join("edited").exists());
        assert!(area.entry("clean", true).is_none());
        assert!(area.entry("edited", true).is_none());
    }
}
