//! End-to-end update scenarios against a real on-disk working copy

use std::cell::RefCell;
use std::fs;
use std::path::Path;
use std::rc::Rc;

use anyhow::Result;
use tempfile::TempDir;

use dsvn_wc::access::AccessTree;
use dsvn_wc::admin::{AdminArea, adm_path, sha1_hex};
use dsvn_wc::entry::{EntryPatch, Field, NodeKind};
use dsvn_wc::error::WcError;
use dsvn_wc::merge::ConservativeMerger;
use dsvn_wc::translate::NoopTranslator;
use dsvn_wc::update::{
    ContentStatus, Editor, Notification, NotifyAction, UpdateConfig, UpdateEditor,
};

const TRUNK: &str = "http://host/repo/trunk";
const ROOT: &str = "http://host/repo";
const UUID: &str = "5f9c2d61-7b3e-44a8-93d7-6f2e9b0a1c55";

fn add_versioned_file(area: &mut AdminArea, name: &str, content: &[u8]) -> Result<()> {
    fs::write(area.path().join(name), content)?;
    fs::create_dir_all(area.text_base_path(name).parent().unwrap())?;
    fs::write(area.text_base_path(name), content)?;
    let mut patch = EntryPatch::default().kind(NodeKind::File).revision(5);
    patch.checksum = Field::Set(sha1_hex(content));
    area.modify_entry(name, &patch)?;
    Ok(())
}

/// A working copy at revision 5 with two clean files.
fn make_wc(root: &Path) -> Result<()> {
    let mut area = AdminArea::create(root, TRUNK, Some(ROOT), Some(UUID), 5)?;
    area.modify_entry(
        "",
        &EntryPatch {
            incomplete: Field::Clear,
            ..EntryPatch::default()
        },
    )?;
    add_versioned_file(&mut area, "alpha", b"old\n")?;
    add_versioned_file(&mut area, "beta", b"beta\n")?;
    area.write_entries()?;
    Ok(())
}

type Notes = Rc<RefCell<Vec<Notification>>>;

fn editor<'a>(
    tree: &'a mut AccessTree,
    root: &Path,
    target: &str,
    merger: &'a ConservativeMerger,
    translator: &'a NoopTranslator,
    notes: &Notes,
) -> Result<UpdateEditor<'a>> {
    let sink = {
        let notes = notes.clone();
        move |n: &Notification| notes.borrow_mut().push(n.clone())
    };
    Ok(UpdateEditor::new(
        tree,
        root,
        target,
        UpdateConfig {
            target_revision: 7,
            recurse: true,
            switch_url: None,
        },
        merger,
        translator,
        Some(Box::new(sink)),
    )?)
}

#[test]
fn file_url_inherits_from_this_dir() -> Result<()> {
    let tmp = TempDir::new().unwrap();
    make_wc(tmp.path())?;

    let area = AdminArea::open(tmp.path())?;
    let alpha = area.entry("alpha", false).unwrap();
    assert_eq!(alpha.url.as_deref(), Some("http://host/repo/trunk/alpha"));
    assert_eq!(alpha.revision, 5);
    assert_eq!(alpha.uuid.as_deref(), Some(UUID));
    Ok(())
}

#[test]
fn add_file_over_disk_obstruction_fails_without_record() -> Result<()> {
    let tmp = TempDir::new().unwrap();
    make_wc(tmp.path())?;
    fs::write(tmp.path().join("foo"), b"in the way\n")?;

    let mut tree = AccessTree::new();
    tree.open(tmp.path(), true, -1, None)?;
    let merger = ConservativeMerger;
    let translator = NoopTranslator;
    let notes: Notes = Rc::new(RefCell::new(Vec::new()));
    let mut editor = editor(&mut tree, tmp.path(), "", &merger, &translator, &notes)?;

    editor.open_root(5)?;
    let err = editor.add_file("foo", None).unwrap_err();
    assert!(matches!(err, WcError::Obstructed(_)));
    editor.abort_edit()?;
    drop(editor);
    tree.close(tmp.path(), false, true)?;

    let area = AdminArea::open(tmp.path())?;
    assert!(area.entry("foo", true).is_none());
    Ok(())
}

#[test]
fn clean_file_update_replaces_working_text() -> Result<()> {
    let tmp = TempDir::new().unwrap();
    make_wc(tmp.path())?;

    let mut tree = AccessTree::new();
    tree.open(tmp.path(), true, -1, None)?;
    let merger = ConservativeMerger;
    let translator = NoopTranslator;
    let notes: Notes = Rc::new(RefCell::new(Vec::new()));
    let mut editor = editor(&mut tree, tmp.path(), "", &merger, &translator, &notes)?;

    editor.open_root(5)?;
    editor.open_file("alpha", 5)?;
    editor.apply_text_delta(None)?;
    editor.write_text_chunk(b"new\n")?;
    editor.finish_text()?;
    editor.close_file(Some(&sha1_hex(b"new\n")))?;
    editor.close_dir()?;
    editor.close_edit()?;
    drop(editor);
    tree.close(tmp.path(), false, true)?;

    assert_eq!(fs::read(tmp.path().join("alpha"))?, b"new\n");
    let area = AdminArea::open(tmp.path())?;
    let alpha = area.entry("alpha", false).unwrap();
    assert_eq!(alpha.checksum.as_deref(), Some(sha1_hex(b"new\n").as_str()));
    assert_eq!(alpha.revision, 7);
    assert!(alpha.conflict_wrk.is_none());
    assert_eq!(fs::read(area.text_base_path("alpha"))?, b"new\n");
    // The untouched sibling was bumped too.
    assert_eq!(area.entry("beta", false).unwrap().revision, 7);
    assert_eq!(area.this_dir()?.revision, 7);
    assert!(!area.this_dir()?.incomplete);

    let notes = notes.borrow();
    let update = notes
        .iter()
        .find(|n| n.path.ends_with("alpha"))
        .expect("notification for alpha");
    assert_eq!(update.action, NotifyAction::Update);
    assert_eq!(update.text, ContentStatus::Changed);
    Ok(())
}

#[test]
fn conflicting_update_leaves_artifacts_and_conflict_fields() -> Result<()> {
    let tmp = TempDir::new().unwrap();
    make_wc(tmp.path())?;
    // Local edit on top of the r5 base.
    fs::write(tmp.path().join("alpha"), b"local\n")?;

    let mut tree = AccessTree::new();
    tree.open(tmp.path(), true, -1, None)?;
    let merger = ConservativeMerger;
    let translator = NoopTranslator;
    let notes: Notes = Rc::new(RefCell::new(Vec::new()));
    let mut editor = editor(&mut tree, tmp.path(), "", &merger, &translator, &notes)?;

    editor.open_root(5)?;
    editor.open_file("alpha", 5)?;
    editor.apply_text_delta(Some(&sha1_hex(b"old\n")))?;
    editor.write_text_chunk(b"server\n")?;
    editor.finish_text()?;
    editor.close_file(Some(&sha1_hex(b"server\n")))?;
    editor.close_dir()?;
    editor.close_edit()?;
    drop(editor);
    tree.close(tmp.path(), false, true)?;

    let area = AdminArea::open(tmp.path())?;
    let alpha = area.entry("alpha", false).unwrap();
    assert_eq!(alpha.conflict_old.as_deref(), Some("alpha.r5"));
    assert_eq!(alpha.conflict_new.as_deref(), Some("alpha.r7"));
    assert_eq!(alpha.conflict_wrk.as_deref(), Some("alpha.mine"));
    assert_eq!(fs::read(tmp.path().join("alpha.r5"))?, b"old\n");
    assert_eq!(fs::read(tmp.path().join("alpha.r7"))?, b"server\n");
    assert_eq!(fs::read(tmp.path().join("alpha.mine"))?, b"local\n");
    let merged = fs::read_to_string(tmp.path().join("alpha"))?;
    assert!(merged.contains("<<<<<<< .mine"));
    assert!(merged.contains(">>>>>>> .r7"));
    // The new base is in place regardless of the conflict.
    assert_eq!(fs::read(area.text_base_path("alpha"))?, b"server\n");

    let notes = notes.borrow();
    let update = notes
        .iter()
        .find(|n| n.path.ends_with("alpha"))
        .expect("notification for alpha");
    assert_eq!(update.text, ContentStatus::Conflicted);
    Ok(())
}

#[test]
fn unresolved_conflict_blocks_further_merging() -> Result<()> {
    let tmp = TempDir::new().unwrap();
    make_wc(tmp.path())?;
    fs::write(tmp.path().join("alpha"), b"local\n")?;

    let merger = ConservativeMerger;
    let translator = NoopTranslator;

    // First update conflicts.
    {
        let mut tree = AccessTree::new();
        tree.open(tmp.path(), true, -1, None)?;
        let notes: Notes = Rc::new(RefCell::new(Vec::new()));
        let mut editor = editor(&mut tree, tmp.path(), "", &merger, &translator, &notes)?;
        editor.open_root(5)?;
        editor.open_file("alpha", 5)?;
        editor.apply_text_delta(None)?;
        editor.write_text_chunk(b"server\n")?;
        editor.finish_text()?;
        editor.close_file(Some(&sha1_hex(b"server\n")))?;
        editor.close_dir()?;
        editor.close_edit()?;
        drop(editor);
        tree.close(tmp.path(), false, true)?;
    }

    // Second update arrives while the conflict is unresolved: the new
    // pristine lands, the marked-up working file stays untouched.
    let marked = fs::read(tmp.path().join("alpha"))?;
    let mut tree = AccessTree::new();
    tree.open(tmp.path(), true, -1, None)?;
    let notes: Notes = Rc::new(RefCell::new(Vec::new()));
    let mut editor = editor(&mut tree, tmp.path(), "", &merger, &translator, &notes)?;
    editor.open_root(7)?;
    editor.open_file("alpha", 7)?;
    editor.apply_text_delta(None)?;
    editor.write_text_chunk(b"server two\n")?;
    editor.finish_text()?;
    editor.close_file(Some(&sha1_hex(b"server two\n")))?;
    editor.close_dir()?;
    editor.close_edit()?;
    drop(editor);
    tree.close(tmp.path(), false, true)?;

    assert_eq!(fs::read(tmp.path().join("alpha"))?, marked);
    let area = AdminArea::open(tmp.path())?;
    assert_eq!(fs::read(area.text_base_path("alpha"))?, b"server two\n");
    let notes = notes.borrow();
    let update = notes
        .iter()
        .find(|n| n.path.ends_with("alpha"))
        .expect("notification for alpha");
    assert_eq!(update.text, ContentStatus::ConflictedUnresolved);
    Ok(())
}

#[test]
fn corrupt_text_base_is_detected_before_applying() -> Result<()> {
    let tmp = TempDir::new().unwrap();
    make_wc(tmp.path())?;

    let mut tree = AccessTree::new();
    tree.open(tmp.path(), true, -1, None)?;
    let merger = ConservativeMerger;
    let translator = NoopTranslator;
    let notes: Notes = Rc::new(RefCell::new(Vec::new()));
    let mut editor = editor(&mut tree, tmp.path(), "", &merger, &translator, &notes)?;

    editor.open_root(5)?;
    editor.open_file("alpha", 5)?;
    let err = editor
        .apply_text_delta(Some(&sha1_hex(b"something else\n")))
        .unwrap_err();
    assert!(matches!(err, WcError::CorruptTextBase { .. }));
    Ok(())
}

#[test]
fn delta_result_checksum_mismatch_is_fatal() -> Result<()> {
    let tmp = TempDir::new().unwrap();
    make_wc(tmp.path())?;

    let mut tree = AccessTree::new();
    tree.open(tmp.path(), true, -1, None)?;
    let merger = ConservativeMerger;
    let translator = NoopTranslator;
    let notes: Notes = Rc::new(RefCell::new(Vec::new()));
    let mut editor = editor(&mut tree, tmp.path(), "", &merger, &translator, &notes)?;

    editor.open_root(5)?;
    editor.open_file("alpha", 5)?;
    editor.apply_text_delta(None)?;
    editor.write_text_chunk(b"new\n")?;
    editor.finish_text()?;
    let err = editor
        .close_file(Some("0000000000000000000000000000000000000000"))
        .unwrap_err();
    assert!(matches!(err, WcError::ChecksumMismatch { .. }));
    Ok(())
}

#[test]
fn server_delete_removes_record_and_clean_file() -> Result<()> {
    let tmp = TempDir::new().unwrap();
    make_wc(tmp.path())?;

    let mut tree = AccessTree::new();
    tree.open(tmp.path(), true, -1, None)?;
    let merger = ConservativeMerger;
    let translator = NoopTranslator;
    let notes: Notes = Rc::new(RefCell::new(Vec::new()));
    let mut editor = editor(&mut tree, tmp.path(), "", &merger, &translator, &notes)?;

    editor.open_root(5)?;
    editor.delete_entry("beta", 5)?;
    editor.close_dir()?;
    editor.close_edit()?;
    drop(editor);
    tree.close(tmp.path(), false, true)?;

    let area = AdminArea::open(tmp.path())?;
    assert!(area.entry("beta", true).is_none());
    assert!(!tmp.path().join("beta").exists());
    assert!(!area.text_base_path("beta").exists());

    let notes = notes.borrow();
    assert!(
        notes
            .iter()
            .any(|n| n.action == NotifyAction::Delete && n.path.ends_with("beta"))
    );
    Ok(())
}

#[test]
fn added_directory_with_file_gets_its_own_admin_area() -> Result<()> {
    let tmp = TempDir::new().unwrap();
    make_wc(tmp.path())?;

    let mut tree = AccessTree::new();
    tree.open(tmp.path(), true, -1, None)?;
    let merger = ConservativeMerger;
    let translator = NoopTranslator;
    let notes: Notes = Rc::new(RefCell::new(Vec::new()));
    let mut editor = editor(&mut tree, tmp.path(), "", &merger, &translator, &notes)?;

    editor.open_root(5)?;
    editor.add_dir("newdir", None)?;
    editor.add_file("newdir/gamma", None)?;
    editor.apply_text_delta(None)?;
    editor.write_text_chunk(b"gamma\n")?;
    editor.finish_text()?;
    editor.close_file(Some(&sha1_hex(b"gamma\n")))?;
    editor.close_dir()?; // newdir
    editor.close_dir()?; // root
    editor.close_edit()?;
    drop(editor);
    tree.close(tmp.path(), false, true)?;

    let parent = AdminArea::open(tmp.path())?;
    assert_eq!(
        parent.entry("newdir", false).unwrap().kind,
        NodeKind::Dir
    );
    let child = AdminArea::open(&tmp.path().join("newdir"))?;
    let this_dir = child.this_dir()?;
    assert_eq!(this_dir.url.as_deref(), Some("http://host/repo/trunk/newdir"));
    assert_eq!(this_dir.revision, 7);
    assert!(!this_dir.incomplete);
    let gamma = child.entry("gamma", false).unwrap();
    assert_eq!(gamma.revision, 7);
    assert_eq!(gamma.checksum.as_deref(), Some(sha1_hex(b"gamma\n").as_str()));
    assert_eq!(fs::read(tmp.path().join("newdir/gamma"))?, b"gamma\n");

    let notes = notes.borrow();
    assert!(
        notes
            .iter()
            .any(|n| n.action == NotifyAction::Add && n.path.ends_with("newdir"))
    );
    assert!(
        notes
            .iter()
            .any(|n| n.action == NotifyAction::Add && n.path.ends_with("gamma"))
    );
    Ok(())
}

#[test]
fn property_update_merges_into_base_and_working() -> Result<()> {
    let tmp = TempDir::new().unwrap();
    make_wc(tmp.path())?;

    let mut tree = AccessTree::new();
    tree.open(tmp.path(), true, -1, None)?;
    let merger = ConservativeMerger;
    let translator = NoopTranslator;
    let notes: Notes = Rc::new(RefCell::new(Vec::new()));
    let mut editor = editor(&mut tree, tmp.path(), "", &merger, &translator, &notes)?;

    editor.open_root(5)?;
    editor.open_file("alpha", 5)?;
    editor.change_file_prop("svn:eol-style", Some("native"))?;
    editor.close_file(None)?;
    editor.close_dir()?;
    editor.close_edit()?;
    drop(editor);
    tree.close(tmp.path(), false, true)?;

    let area = AdminArea::open(tmp.path())?;
    let props = area.props();
    let base = props.read("alpha", dsvn_wc::props::PropKind::Base)?.unwrap();
    assert_eq!(base.get("svn:eol-style").map(String::as_str), Some("native"));
    let working = props
        .read("alpha", dsvn_wc::props::PropKind::Working)?
        .unwrap();
    assert_eq!(working.get("svn:eol-style").map(String::as_str), Some("native"));
    let alpha = area.entry("alpha", false).unwrap();
    assert!(alpha.has_props);
    assert!(!alpha.has_prop_mods);

    let notes = notes.borrow();
    let update = notes
        .iter()
        .find(|n| n.path.ends_with("alpha"))
        .expect("notification for alpha");
    assert_eq!(update.props, ContentStatus::Changed);
    assert_eq!(update.text, ContentStatus::Unchanged);
    Ok(())
}

#[test]
fn absent_file_is_recorded_but_hidden() -> Result<()> {
    let tmp = TempDir::new().unwrap();
    make_wc(tmp.path())?;

    let mut tree = AccessTree::new();
    tree.open(tmp.path(), true, -1, None)?;
    let merger = ConservativeMerger;
    let translator = NoopTranslator;
    let notes: Notes = Rc::new(RefCell::new(Vec::new()));
    let mut editor = editor(&mut tree, tmp.path(), "", &merger, &translator, &notes)?;

    editor.open_root(5)?;
    editor.absent_file("gamma")?;
    editor.close_dir()?;
    editor.close_edit()?;
    drop(editor);
    tree.close(tmp.path(), false, true)?;

    let area = AdminArea::open(tmp.path())?;
    // Hidden from default enumeration, retained for the next update.
    assert!(area.entry("gamma", false).is_none());
    let gamma = area.entry("gamma", true).unwrap();
    assert!(gamma.absent);
    assert_eq!(gamma.revision, 7);
    Ok(())
}

#[test]
fn update_locks_are_released_recursively() -> Result<()> {
    let tmp = TempDir::new().unwrap();
    make_wc(tmp.path())?;

    let mut tree = AccessTree::new();
    tree.open(tmp.path(), true, -1, None)?;
    let merger = ConservativeMerger;
    let translator = NoopTranslator;
    let notes: Notes = Rc::new(RefCell::new(Vec::new()));
    let mut editor = editor(&mut tree, tmp.path(), "", &merger, &translator, &notes)?;

    editor.open_root(5)?;
    editor.add_dir("newdir", None)?;
    editor.close_dir()?;
    editor.close_dir()?;
    editor.close_edit()?;
    drop(editor);

    assert!(adm_path(tmp.path()).join("lock").exists());
    assert!(adm_path(&tmp.path().join("newdir")).join("lock").exists());
    tree.close(tmp.path(), false, true)?;
    assert!(!adm_path(tmp.path()).join("lock").exists());
    assert!(!adm_path(&tmp.path().join("newdir")).join("lock").exists());
    Ok(())
}

#[test]
fn defunct_lock_token_is_cleared_and_reported() -> Result<()> {
    let tmp = TempDir::new().unwrap();
    make_wc(tmp.path())?;
    {
        let mut area = AdminArea::open(tmp.path())?;
        let mut patch = EntryPatch::default();
        patch.lock_token = Field::Set("opaquelocktoken:42".to_string());
        patch.lock_owner = Field::Set("jrandom".to_string());
        area.modify_entry("alpha", &patch)?;
        area.write_entries()?;
    }

    let mut tree = AccessTree::new();
    tree.open(tmp.path(), true, -1, None)?;
    let merger = ConservativeMerger;
    let translator = NoopTranslator;
    let notes: Notes = Rc::new(RefCell::new(Vec::new()));
    let mut editor = editor(&mut tree, tmp.path(), "", &merger, &translator, &notes)?;

    editor.open_root(5)?;
    editor.open_file("alpha", 5)?;
    editor.change_file_prop("svn:entry:lock-token", None)?;
    editor.close_file(None)?;
    editor.close_dir()?;
    editor.close_edit()?;
    drop(editor);
    tree.close(tmp.path(), false, true)?;

    let area = AdminArea::open(tmp.path())?;
    let alpha = area.entry("alpha", false).unwrap();
    assert!(alpha.lock_token.is_none());
    assert!(alpha.lock_owner.is_none());

    let notes = notes.borrow();
    let update = notes
        .iter()
        .find(|n| n.path.ends_with("alpha"))
        .expect("notification for alpha");
    assert_eq!(update.lock, dsvn_wc::update::LockStatus::Unlocked);
    Ok(())
}
