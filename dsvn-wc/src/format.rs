//! Admin-area format versions and the capability policy table
//!
//! Every read or write of entries and properties routes through these
//! lookups instead of a per-format type hierarchy. A directory's format
//! number is read once at open time and carried on its admin area.

use std::fs;
use std::path::Path;

use crate::error::{Result, WcError};

/// Oldest on-disk format this engine can still read. Directories below
/// this used the pre-line-oriented entry encodings and must be checked
/// out fresh.
pub const MIN_FORMAT: u32 = 5;

/// Format written for new admin areas.
pub const CURRENT_FORMAT: u32 = 8;

/// First format that caches property presence on the entry.
const PROP_CACHING_FORMAT: u32 = 6;

/// First format that stores the number as the entries first line and
/// consolidates wcprops into one file.
const CONSOLIDATED_FORMAT: u32 = 7;

/// First format carrying changelist, keep-local, working-size and depth.
const CHANGELIST_FORMAT: u32 = 8;

/// This-dir record name used by formats older than the consolidated
/// layout. The colon keeps it out of the filename space.
pub const LEGACY_THIS_DIR_NAME: &str = "dsvn:this-dir";

/// Properties cached on entries by default when caching is available.
pub const DEFAULT_CACHABLE_PROPS: &[&str] =
    &["svn:special", "svn:externals", "svn:needs-lock"];

pub fn has_prop_caching(format: u32) -> bool {
    format >= PROP_CACHING_FORMAT
}

/// Newer formats keep all wcprops of a directory in a single file
/// instead of one file per entry.
pub fn has_consolidated_wcprops(format: u32) -> bool {
    format >= CONSOLIDATED_FORMAT
}

/// Whether the format stores its number as the entries file's first
/// line (newer) or only in the separate `format` marker file (older).
pub fn format_in_entries_file(format: u32) -> bool {
    format >= CONSOLIDATED_FORMAT
}

pub fn supports_changelists(format: u32) -> bool {
    format >= CHANGELIST_FORMAT
}

pub fn this_dir_name(format: u32) -> &'static str {
    if format >= CONSOLIDATED_FORMAT {
        ""
    } else {
        LEGACY_THIS_DIR_NAME
    }
}

/// Validate a format number read from disk.
pub fn check_format(dir: &Path, format: u32) -> Result<u32> {
    if format < MIN_FORMAT {
        return Err(WcError::corrupt(
            dir,
            format!("working copy format {format} is too old to read"),
        ));
    }
    if format > CURRENT_FORMAT {
        return Err(WcError::corrupt(
            dir,
            format!("working copy format {format} is newer than this client supports"),
        ));
    }
    Ok(format)
}

/// Read a directory's format number, preferring the `format` marker file
/// and falling back to the entries file's first line.
pub fn read_format(dir: &Path, adm: &Path) -> Result<u32> {
    let marker = adm.join("format");
    let raw = match fs::read_to_string(&marker) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let entries = adm.join("entries");
            match fs::read_to_string(&entries) {
                Ok(s) => s,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(WcError::MissingAdminArea(dir.to_path_buf()));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(e) => return Err(e.into()),
    };
    let first = raw.lines().next().unwrap_or("").trim();
    let format: u32 = first
        .parse()
        .map_err(|_| WcError::corrupt(dir, format!("invalid format number '{first}'")))?;
    check_format(dir, format)
}
