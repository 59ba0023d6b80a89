//! DSvn Working Copy Library
//!
//! Local metadata engine for checked-out trees:
//! - Per-path metadata records with schedule folding and format-versioned
//!   on-disk encoding
//! - Base/working/revert property storage with cheap change detection
//! - Per-directory admin areas under `.dsvn`
//! - Hierarchical access tree with sentinel-file write locking
//! - Write-ahead transaction log with idempotent, crash-safe replay
//! - Tree-delta update/switch editor with three-way text and property
//!   merges
//!
//! The engine is synchronous and single-writer per tree; cross-process
//! exclusion comes from the per-directory lock sentinel. Network
//! transport, the diff3 primitive and keyword/EOL translation are
//! consumed through traits, never implemented here.

pub mod access;
pub mod admin;
pub mod entries_file;
pub mod entry;
pub mod error;
pub mod format;
pub mod log;
pub mod merge;
pub mod props;
pub mod translate;
pub mod update;

pub use access::{AccessTree, CancelCheck};
pub use admin::{ADM_DIR, AdminArea};
pub use entry::{
    AddDeletePolicy, Depth, Entry, EntryPatch, Field, FoldOutcome, NodeKind, Schedule,
    fold_scheduling,
};
pub use error::{Result, WcError};
pub use log::{Command, LogBuilder, LogContext, cleanup, process_committed, run_logs};
pub use merge::{ConservativeMerger, MergeLabels, MergeResult, MergeStatus, TextMerger};
pub use props::{PropKind, PropMap, PropertyStore};
pub use translate::{NoopTranslator, Translator};
pub use update::{
    ContentStatus, Editor, LockStatus, Notification, NotifyAction, UpdateConfig, UpdateEditor,
};
