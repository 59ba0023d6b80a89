//! Property storage for versioned paths
//!
//! Each path carries up to three value maps: base (last known server
//! value), working (local, possibly edited) and revert (pre-replace
//! snapshot, only while the entry is a copied replace). A fourth map,
//! wcprops, caches protocol-layer properties and is stored per entry in
//! older formats or consolidated into one file in newer ones.
//!
//! Maps are serialized in the hash-dump format:
//! `K <len>\n<name>\nV <len>\n<value>\n` pairs closed by `END\n`. An empty
//! map still produces a file, so "no properties" stays distinguishable
//! from "file absent".

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};

use crate::entry::Entry;
use crate::error::{Result, WcError};
use crate::format;

pub type PropMap = BTreeMap<String, String>;

/// Which of a path's property maps a call addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropKind {
    Base,
    Working,
    Revert,
}

/// Outcome of the cheap modification check.
#[derive(Debug, Clone, PartialEq)]
pub struct PropsStatus {
    pub modified: bool,
    /// Set when a full compare proved the maps equal; the caller should
    /// stamp this mtime onto the entry so the next check stays cheap.
    pub restamp: Option<DateTime<Utc>>,
}

/// One property's transition between two maps.
#[derive(Debug, Clone, PartialEq)]
pub struct PropChange {
    pub name: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

/// Access to the property files of one directory's admin area.
pub struct PropertyStore {
    dir: PathBuf,
    adm: PathBuf,
    format: u32,
}

impl PropertyStore {
    pub fn new(dir: &Path, adm: &Path, format: u32) -> Self {
        PropertyStore {
            dir: dir.to_path_buf(),
            adm: adm.to_path_buf(),
            format,
        }
    }

    /// On-disk location of one property map. The this-dir maps live at
    /// the admin root; per-entry maps under props/ and prop-base/.
    pub fn prop_path(&self, name: &str, kind: PropKind) -> PathBuf {
        if name.is_empty() {
            let file = match kind {
                PropKind::Working => "dir-props",
                PropKind::Base => "dir-prop-base",
                PropKind::Revert => "dir-prop-revert",
            };
            self.adm.join(file)
        } else {
            match kind {
                PropKind::Working => self.adm.join("props").join(format!("{name}.work")),
                PropKind::Base => self.adm.join("prop-base").join(format!("{name}.base")),
                PropKind::Revert => self.adm.join("prop-base").join(format!("{name}.revert")),
            }
        }
    }

    /// Read one map; `None` when the file does not exist.
    pub fn read(&self, name: &str, kind: PropKind) -> Result<Option<PropMap>> {
        let path = self.prop_path(name, kind);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(parse_props(&self.dir, &bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn write(&self, name: &str, kind: PropKind, props: &PropMap) -> Result<()> {
        let path = self.prop_path(name, kind);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_dir = self.adm.join("tmp");
        fs::create_dir_all(&tmp_dir)?;
        let tmp = tmp_dir.join(format!("prop.{}", uuid::Uuid::new_v4()));
        fs::write(&tmp, serialize_props(props))?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn remove(&self, name: &str, kind: PropKind) -> Result<()> {
        let path = self.prop_path(name, kind);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Decide whether working properties diverged from base without
    /// reading both files when cheaper evidence suffices: equal lengths
    /// plus a matching stored prop-timestamp mean unmodified; only an
    /// inconclusive comparison falls back to parsing both maps.
    pub fn props_modified(&self, entry: &Entry) -> Result<PropsStatus> {
        let working = self.prop_path(&entry.name, PropKind::Working);
        let base = self.prop_path(&entry.name, PropKind::Base);

        let working_meta = stat(&working)?;
        let base_meta = stat(&base)?;
        let unmodified = PropsStatus { modified: false, restamp: None };

        match (&working_meta, &base_meta) {
            (None, None) => return Ok(unmodified),
            (None, Some(_)) => {
                let base_map = self.read(&entry.name, PropKind::Base)?.unwrap_or_default();
                return Ok(PropsStatus { modified: !base_map.is_empty(), restamp: None });
            }
            (Some(_), None) => {
                let work_map = self.read(&entry.name, PropKind::Working)?.unwrap_or_default();
                return Ok(PropsStatus { modified: !work_map.is_empty(), restamp: None });
            }
            (Some(w), Some(b)) => {
                if w.len != b.len {
                    return Ok(PropsStatus { modified: true, restamp: None });
                }
                if let (Some(stored), Some(actual)) = (entry.prop_time, w.mtime) {
                    if stored.timestamp() == actual.timestamp() {
                        return Ok(unmodified);
                    }
                }
            }
        }

        // Inconclusive: compare structurally; equal maps earn a restamp so
        // the expensive path is not repeated.
        let work_map = self.read(&entry.name, PropKind::Working)?.unwrap_or_default();
        let base_map = self.read(&entry.name, PropKind::Base)?.unwrap_or_default();
        if work_map == base_map {
            Ok(PropsStatus {
                modified: false,
                restamp: working_meta.and_then(|m| m.mtime),
            })
        } else {
            Ok(PropsStatus { modified: true, restamp: None })
        }
    }

    /// Read the wcprops map for one entry.
    pub fn read_wcprops(&self, name: &str) -> Result<PropMap> {
        if format::has_consolidated_wcprops(self.format) {
            let all = self.read_all_wcprops()?;
            Ok(all.get(name).cloned().unwrap_or_default())
        } else {
            let path = self.wcprop_file(name);
            match fs::read(&path) {
                Ok(bytes) => parse_props(&self.dir, &bytes),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PropMap::new()),
                Err(e) => Err(e.into()),
            }
        }
    }

    /// Set or delete one wcprop for one entry.
    pub fn set_wcprop(&self, name: &str, prop: &str, value: Option<&str>) -> Result<()> {
        if format::has_consolidated_wcprops(self.format) {
            let mut all = self.read_all_wcprops()?;
            let map = all.entry(name.to_string()).or_default();
            match value {
                Some(v) => {
                    map.insert(prop.to_string(), v.to_string());
                }
                None => {
                    map.remove(prop);
                }
            }
            if map.is_empty() {
                all.remove(name);
            }
            self.write_all_wcprops(&all)
        } else {
            let mut map = self.read_wcprops(name)?;
            match value {
                Some(v) => {
                    map.insert(prop.to_string(), v.to_string());
                }
                None => {
                    map.remove(prop);
                }
            }
            let path = self.wcprop_file(name);
            if map.is_empty() {
                return match fs::remove_file(&path) {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(e.into()),
                };
            }
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, serialize_props(&map))?;
            Ok(())
        }
    }

    pub fn remove_wcprops(&self, name: &str) -> Result<()> {
        if format::has_consolidated_wcprops(self.format) {
            let mut all = self.read_all_wcprops()?;
            if all.remove(name).is_some() {
                self.write_all_wcprops(&all)?;
            }
            Ok(())
        } else {
            let path = self.wcprop_file(name);
            match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        }
    }

    fn wcprop_file(&self, name: &str) -> PathBuf {
        if name.is_empty() {
            self.adm.join("dir-wcprops")
        } else {
            self.adm.join("wcprops").join(format!("{name}.work"))
        }
    }

    fn read_all_wcprops(&self) -> Result<BTreeMap<String, PropMap>> {
        let path = self.adm.join("all-wcprops");
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = BTreeMap::new();
        let mut pos = 0;
        while pos < bytes.len() {
            let (name, next) = read_line(&self.dir, &bytes, pos)?;
            let (map, next) = parse_hash(&self.dir, &bytes, next)?;
            out.insert(name, map);
            pos = next;
        }
        Ok(out)
    }

    fn write_all_wcprops(&self, all: &BTreeMap<String, PropMap>) -> Result<()> {
        let path = self.adm.join("all-wcprops");
        if all.is_empty() {
            return match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            };
        }
        let mut out = Vec::new();
        for (name, map) in all {
            out.extend_from_slice(name.as_bytes());
            out.push(b'\n');
            out.extend_from_slice(&serialize_props(map));
        }
        fs::write(&path, out)?;
        Ok(())
    }
}

struct FileStat {
    len: u64,
    mtime: Option<DateTime<Utc>>,
}

fn stat(path: &Path) -> Result<Option<FileStat>> {
    match fs::metadata(path) {
        Ok(meta) => {
            let mtime = meta.modified().ok().map(system_time_to_utc);
            Ok(Some(FileStat { len: meta.len(), mtime }))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn system_time_to_utc(t: std::time::SystemTime) -> DateTime<Utc> {
    let dur = t
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    Utc.timestamp_opt(dur.as_secs() as i64, dur.subsec_nanos())
        .single()
        .unwrap_or_default()
}

pub fn serialize_props(props: &PropMap) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, value) in props {
        out.extend_from_slice(format!("K {}\n", name.len()).as_bytes());
        out.extend_from_slice(name.as_bytes());
        out.push(b'\n');
        out.extend_from_slice(format!("V {}\n", value.len()).as_bytes());
        out.extend_from_slice(value.as_bytes());
        out.push(b'\n');
    }
    out.extend_from_slice(b"END\n");
    out
}

pub fn parse_props(dir: &Path, bytes: &[u8]) -> Result<PropMap> {
    let (map, pos) = parse_hash(dir, bytes, 0)?;
    if bytes[pos..].iter().any(|b| !b.is_ascii_whitespace()) {
        return Err(WcError::corrupt(dir, "trailing data after property END marker"));
    }
    Ok(map)
}

fn parse_hash(dir: &Path, bytes: &[u8], mut pos: usize) -> Result<(PropMap, usize)> {
    let mut map = PropMap::new();
    loop {
        let (line, next) = read_line(dir, bytes, pos)?;
        if line == "END" {
            return Ok((map, next));
        }
        let klen = parse_len(dir, &line, 'K')?;
        let (name, next) = read_sized(dir, bytes, next, klen)?;
        let (vline, next) = read_line(dir, bytes, next)?;
        let vlen = parse_len(dir, &vline, 'V')?;
        let (value, next) = read_sized(dir, bytes, next, vlen)?;
        map.insert(name, value);
        pos = next;
    }
}

fn parse_len(dir: &Path, line: &str, tag: char) -> Result<usize> {
    let rest = line
        .strip_prefix(tag)
        .and_then(|r| r.strip_prefix(' '))
        .ok_or_else(|| WcError::corrupt(dir, format!("malformed property line '{line}'")))?;
    rest.parse()
        .map_err(|_| WcError::corrupt(dir, format!("malformed property length '{line}'")))
}

fn read_line(dir: &Path, bytes: &[u8], pos: usize) -> Result<(String, usize)> {
    if pos >= bytes.len() {
        return Err(WcError::corrupt(dir, "property file ends without END marker"));
    }
    let end = bytes[pos..]
        .iter()
        .position(|&b| b == b'\n')
        .map(|i| pos + i)
        .ok_or_else(|| WcError::corrupt(dir, "property file ends without END marker"))?;
    let line = std::str::from_utf8(&bytes[pos..end])
        .map_err(|_| WcError::corrupt(dir, "property file is not valid UTF-8"))?;
    Ok((line.to_string(), end + 1))
}

fn read_sized(dir: &Path, bytes: &[u8], pos: usize, len: usize) -> Result<(String, usize)> {
    let end = pos + len;
    if end >= bytes.len() || bytes[end] != b'\n' {
        return Err(WcError::corrupt(dir, "property value overruns its declared length"));
    }
    let value = std::str::from_utf8(&bytes[pos..end])
        .map_err(|_| WcError::corrupt(dir, "property value is not valid UTF-8"))?;
    Ok((value.to_string(), end + 1))
}

/// Compute the transitions taking `old` to `new`.
pub fn diff_props(old: &PropMap, new: &PropMap) -> Vec<PropChange> {
    let mut changes = Vec::new();
    for (name, old_value) in old {
        match new.get(name) {
            Some(v) if v == old_value => {}
            other => changes.push(PropChange {
                name: name.clone(),
                old_value: Some(old_value.clone()),
                new_value: other.cloned(),
            }),
        }
    }
    for (name, new_value) in new {
        if !old.contains_key(name) {
            changes.push(PropChange {
                name: name.clone(),
                old_value: None,
                new_value: Some(new_value.clone()),
            });
        }
    }
    changes
}

/// Apply server-side property changes onto a working map, three-way.
/// Returns conflict descriptions for changes the working map already
/// diverged from; applied changes mutate `working` in place.
pub fn merge_prop_changes(working: &mut PropMap, changes: &[PropChange]) -> Vec<String> {
    let mut conflicts = Vec::new();
    for change in changes {
        let current = working.get(&change.name).cloned();
        if current == change.new_value {
            continue;
        }
        if current == change.old_value {
            match &change.new_value {
                Some(v) => {
                    working.insert(change.name.clone(), v.clone());
                }
                None => {
                    working.remove(&change.name);
                }
            }
            continue;
        }
        conflicts.push(format!(
            "Property '{}': incoming change from '{}' to '{}' conflicts with local value '{}'",
            change.name,
            change.old_value.as_deref().unwrap_or("<unset>"),
            change.new_value.as_deref().unwrap_or("<deleted>"),
            current.as_deref().unwrap_or("<unset>"),
        ));
    }
    conflicts
}

/// Names from `present` that the format allows caching on the entry.
pub fn present_cachable(props: &PropMap, cachable: &[String]) -> Vec<String> {
    cachable
        .iter()
        .filter(|name| props.contains_key(*name))
        .cloned()
        .collect()
}
