//! End-to-end incremental indexing over a real corpus on disk: the full
//! add / modify / delete lifecycle, manifest fallbacks, and the equivalence
//! of incremental application with a from-scratch rebuild.

mod common;

use std::collections::BTreeSet;
use std::fs;
use std::sync::atomic::Ordering;

use common::TestHarness;
use markdown_qa::identity::chunk_id;
use markdown_qa::index_manager::{RebuildReason, RefreshResult};

const INDEX: &str = "default";

#[test]
fn add_modify_delete_lifecycle() {
    let h = TestHarness::new();

    // Add one file to an empty corpus.
    let path = h.write("a.md", "# Hello\n\nWorld.");
    let path_str = path.to_string_lossy().to_string();
    let result = h.manager.refresh(INDEX, &h.dirs).unwrap();
    assert!(matches!(result, RefreshResult::FullRebuild { .. }));
    assert_eq!(h.manager.with_index(|s| s.size()).unwrap(), 1);
    let expected_id = chunk_id(&path_str, 0);
    assert_eq!(
        h.manager.manifest().chunk_ids_for(INDEX, &path_str),
        vec![expected_id]
    );

    // Modify it: same structure, same chunk ID, re-embedded vector.
    fs::write(&path, "# Hello\n\nNew text.").unwrap();
    h.bump_mtime(&path, 5);
    let result = h.manager.refresh(INDEX, &h.dirs).unwrap();
    match result {
        RefreshResult::Incremental {
            added,
            modified,
            deleted,
        } => {
            assert!(added.is_empty());
            assert_eq!(modified, vec![path_str.clone()]);
            assert!(deleted.is_empty());
        }
        other => panic!("expected incremental, got {other:?}"),
    }
    assert_eq!(h.manager.with_index(|s| s.size()).unwrap(), 1);
    assert_eq!(h.store_ids(), BTreeSet::from([expected_id]));

    // Delete it: the store empties and the manifest follows.
    let checksum_before = h.manager.manifest().get_checksum(INDEX).unwrap();
    fs::remove_file(&path).unwrap();
    let result = h.manager.refresh(INDEX, &h.dirs).unwrap();
    match result {
        RefreshResult::Incremental { deleted, .. } => {
            assert_eq!(deleted, vec![path_str.clone()]);
        }
        other => panic!("expected incremental, got {other:?}"),
    }
    assert_eq!(h.manager.with_index(|s| s.size()).unwrap(), 0);
    assert!(h.manager.manifest().all_file_records(INDEX).is_empty());
    assert_ne!(
        h.manager.manifest().get_checksum(INDEX).unwrap(),
        checksum_before
    );

    // A file added to the emptied-but-live index flows through the
    // incremental path, not another rebuild.
    let again = h.write("b.md", "# Back\n\nAgain.");
    let again_str = again.to_string_lossy().to_string();
    let result = h.manager.refresh(INDEX, &h.dirs).unwrap();
    match result {
        RefreshResult::Incremental { added, .. } => {
            assert_eq!(added, vec![again_str.clone()]);
        }
        other => panic!("expected incremental, got {other:?}"),
    }
    assert_eq!(h.manager.with_index(|s| s.size()).unwrap(), 1);
    assert_eq!(
        h.manager.manifest().chunk_ids_for(INDEX, &again_str),
        vec![chunk_id(&again_str, 0)]
    );
}

#[test]
fn stripped_manifest_metadata_triggers_full_rebuild_fallback() {
    let h = TestHarness::new();
    let path = h.write("a.md", "# Hello\n\nWorld.");
    let path_str = path.to_string_lossy().to_string();
    h.manager.load_or_build(INDEX, &h.dirs).unwrap();

    // Drop the per-file records the way an older manifest would look.
    let checksum = h.manager.manifest().get_checksum(INDEX);
    h.manager
        .manifest()
        .add_index(INDEX, &h.dirs, checksum)
        .unwrap();

    let result = h.manager.refresh(INDEX, &h.dirs).unwrap();
    assert!(matches!(
        result,
        RefreshResult::FullRebuild {
            reason: RebuildReason::MissingPerFileMetadata
        }
    ));
    assert_eq!(h.manager.with_index(|s| s.size()).unwrap(), 1);
    assert_eq!(
        h.manager.manifest().chunk_ids_for(INDEX, &path_str),
        vec![chunk_id(&path_str, 0)]
    );
}

#[test]
fn missing_on_disk_index_triggers_full_rebuild_fallback() {
    let h = TestHarness::new();
    h.write("a.md", "# Hello\n\nWorld.");
    h.manager.load_or_build(INDEX, &h.dirs).unwrap();

    // Remove the persisted index files but keep the manifest.
    let cache_indexes = h.tmp.path().join("cache").join("indexes");
    for entry in fs::read_dir(&cache_indexes).unwrap() {
        fs::remove_file(entry.unwrap().path()).unwrap();
    }

    let result = h.manager.refresh(INDEX, &h.dirs).unwrap();
    assert!(matches!(
        result,
        RefreshResult::FullRebuild {
            reason: RebuildReason::IndexNotFound
        }
    ));
    assert!(h.manager.is_ready());
}

#[test]
fn incremental_application_matches_full_rebuild() {
    let h = TestHarness::new();
    h.write("keep.md", "# Keep\n\nstays the same");
    let modify = h.write("modify.md", "# Modify\n\noriginal words");
    let delete = h.write("delete.md", "# Delete\n\ngoing away");
    h.manager.load_or_build(INDEX, &h.dirs).unwrap();

    // A batch of filesystem mutations.
    fs::write(&modify, "# Modify\n\ncompletely different words").unwrap();
    h.bump_mtime(&modify, 5);
    fs::remove_file(&delete).unwrap();
    h.write("new.md", "# New\n\nbrand new");

    h.manager.refresh(INDEX, &h.dirs).unwrap();
    let incremental_ids = h.store_ids();
    assert_eq!(incremental_ids, h.manifest_ids(INDEX));

    // The same corpus state, rebuilt from scratch, yields the same ID set.
    h.manager.rebuild(INDEX, &h.dirs).unwrap();
    assert_eq!(h.store_ids(), incremental_ids);
    assert_eq!(h.manifest_ids(INDEX), incremental_ids);
}

#[test]
fn embedding_cache_spans_rebuilds() {
    let h = TestHarness::new();
    h.write("a.md", "# Stable\n\nNever changes.");
    h.manager.load_or_build(INDEX, &h.dirs).unwrap();
    let calls_after_build = h.provider.calls.load(Ordering::SeqCst);
    assert!(calls_after_build >= 1);

    // A full rebuild re-embeds nothing: every chunk text is cached.
    h.manager.rebuild(INDEX, &h.dirs).unwrap();
    assert_eq!(h.provider.calls.load(Ordering::SeqCst), calls_after_build);
}

#[test]
fn consistency_holds_across_many_random_refreshes() {
    let h = TestHarness::new();
    for i in 0..6 {
        h.write(
            &format!("doc{i}.md"),
            &format!("# Doc {i}\n\n{}", "text ".repeat(i * 30 + 5)),
        );
    }
    h.manager.load_or_build(INDEX, &h.dirs).unwrap();
    assert_eq!(h.store_ids(), h.manifest_ids(INDEX));

    // Interleave deletes, rewrites and creations over several refreshes.
    fs::remove_file(h.docs.join("doc0.md")).unwrap();
    h.manager.refresh(INDEX, &h.dirs).unwrap();
    assert_eq!(h.store_ids(), h.manifest_ids(INDEX));

    let rewrite = h.docs.join("doc3.md");
    fs::write(&rewrite, "# Doc 3\n\nshrunk").unwrap();
    h.bump_mtime(&rewrite, 5);
    h.write("late.md", "# Late\n\narrival");
    h.manager.refresh(INDEX, &h.dirs).unwrap();
    assert_eq!(h.store_ids(), h.manifest_ids(INDEX));

    fs::remove_file(h.docs.join("late.md")).unwrap();
    fs::remove_file(h.docs.join("doc5.md")).unwrap();
    h.manager.refresh(INDEX, &h.dirs).unwrap();
    assert_eq!(h.store_ids(), h.manifest_ids(INDEX));
}
