//! Per-kind reconciliation flows and failure handling

use treesync_core::domain::newtypes::{HashPair, RelPath};
use treesync_core::ports::ErrorCategory;
use treesync_sync::filesystem::hash_bytes;
use treesync_sync::{ReplicaStatus, TaskKind, TaskTicket};

use crate::common::{rel, Harness};

// ============================================================================
// Adds
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_new_local_file_is_uploaded() {
    let h = Harness::new(Vec::new());
    let local_hash = h.write_local("docs/new.txt", b"fresh");

    let outcome = h.run(TaskTicket::local_add(rel("docs/new.txt"), true)).await;

    assert_eq!(outcome, Ok(None));
    assert_eq!(h.remote.content("docs/new.txt").unwrap(), b"fresh");
    assert_eq!(
        h.hashes("docs/new.txt"),
        Some(HashPair::known(local_hash, h.remote.hash("docs/new.txt").unwrap()))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_local_edit_is_uploaded_when_remote_untouched() {
    let h = Harness::new(vec![(rel("a.txt"), HashPair::known(hash_bytes(b"old"), "v1"))]);
    h.remote.put("a.txt", b"old");
    let local_hash = h.write_local("a.txt", b"edited");

    assert_eq!(h.run(TaskTicket::local_add(rel("a.txt"), false)).await, Ok(None));

    assert_eq!(h.remote.calls.download.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert_eq!(h.remote.content("a.txt").unwrap(), b"edited");
    assert_eq!(h.hashes("a.txt").unwrap().local, Some(local_hash));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remote_file_is_downloaded() {
    let h = Harness::new(Vec::new());
    let remote_hash = h.remote.put("sub/r.txt", b"from afar");

    assert_eq!(h.run(TaskTicket::remote_add(rel("sub/r.txt"))).await, Ok(None));

    assert_eq!(h.read_local("sub/r.txt").unwrap(), b"from afar");
    assert_eq!(
        h.hashes("sub/r.txt"),
        Some(HashPair::known(hash_bytes(b"from afar"), remote_hash))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_identical_contents_need_no_transfer_up() {
    let h = Harness::new(Vec::new());
    let remote_hash = h.remote.put("same.txt", b"twins");
    let local_hash = h.write_local("same.txt", b"twins");

    assert_eq!(h.run(TaskTicket::local_add(rel("same.txt"), true)).await, Ok(None));

    assert_eq!(h.remote.calls.uploads(), 0);
    assert_eq!(h.hashes("same.txt"), Some(HashPair::known(local_hash, remote_hash)));
}

// ============================================================================
// Removals
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_local_removal_deletes_remote_copy() {
    let h = Harness::new(vec![(rel("d/gone.txt"), HashPair::known(hash_bytes(b"x"), "v1"))]);
    h.remote.put("d/gone.txt", b"x");

    assert_eq!(h.run(TaskTicket::local_remove(rel("d/gone.txt"))).await, Ok(None));

    assert!(h.remote.names().is_empty());
    assert_eq!(h.hashes("d/gone.txt"), None);
    assert!(!h.ctx.replica().index().contains(&rel("d")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_local_removal_restores_remotely_changed_file() {
    let h = Harness::new(vec![(rel("a.txt"), HashPair::known(hash_bytes(b"x"), "v1"))]);
    h.remote.put("a.txt", b"x");
    let remote_hash = h.remote.put("a.txt", b"changed remotely");

    assert_eq!(h.run(TaskTicket::local_remove(rel("a.txt"))).await, Ok(None));

    assert_eq!(h.remote.calls.remove.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert_eq!(h.read_local("a.txt").unwrap(), b"changed remotely");
    assert_eq!(h.hashes("a.txt").unwrap().remote, Some(remote_hash));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remote_removal_deletes_unchanged_local_copy() {
    let local_hash = hash_bytes(b"doomed");
    let h = Harness::new(vec![(rel("a.txt"), HashPair::known(&local_hash, "v1"))]);
    h.write_local("a.txt", b"doomed");

    assert_eq!(h.run(TaskTicket::remote_remove(rel("a.txt"))).await, Ok(None));

    assert_eq!(h.read_local("a.txt"), None);
    assert_eq!(h.hashes("a.txt"), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remote_removal_keeps_local_edits() {
    let h = Harness::new(vec![(rel("a.txt"), HashPair::known(hash_bytes(b"old"), "v1"))]);
    h.write_local("a.txt", b"edited offline");

    assert_eq!(h.run(TaskTicket::remote_remove(rel("a.txt"))).await, Ok(None));

    assert_eq!(h.read_local("a.txt").unwrap(), b"edited offline");
    assert_eq!(h.remote.content("a.txt").unwrap(), b"edited offline");
}

// ============================================================================
// Moves
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_move_is_replayed_remotely() {
    let h = Harness::new(vec![(rel("a.txt"), HashPair::known(hash_bytes(b"data"), "v1"))]);
    h.remote.put("a.txt", b"data");
    h.write_local("dir/b.txt", b"data");

    assert_eq!(
        h.run(TaskTicket::moved(rel("a.txt"), rel("dir/b.txt"))).await,
        Ok(None)
    );

    assert_eq!(h.remote.names(), vec!["dir/b.txt".to_string()]);
    assert_eq!(h.hashes("a.txt"), None);
    assert_eq!(
        h.hashes("dir/b.txt"),
        Some(HashPair::known(hash_bytes(b"data"), h.remote.hash("dir/b.txt").unwrap()))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_move_over_unknown_remote_content_keeps_it() {
    let h = Harness::new(vec![(rel("a.txt"), HashPair::known(hash_bytes(b"data"), "v1"))]);
    h.remote.put("a.txt", b"data");
    h.remote.put("b.txt", b"someone else's");
    h.write_local("b.txt", b"data");

    assert_eq!(h.run(TaskTicket::moved(rel("a.txt"), rel("b.txt"))).await, Ok(None));

    let names = h.local_names("");
    let conflict = names
        .iter()
        .find(|name| name.starts_with("b (conflict_"))
        .expect("conflict copy");
    assert_eq!(h.read_local(conflict).unwrap(), b"someone else's");
    assert_eq!(h.remote.content(conflict).unwrap(), b"someone else's");
    assert_eq!(h.remote.content("b.txt").unwrap(), b"data");
    assert_eq!(h.remote.content("a.txt"), None);
}

// ============================================================================
// Resync
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_resync_pushes_new_files_and_removes_missing_ones() {
    let keep_hash = hash_bytes(b"keep");
    let h = Harness::new(vec![
        (rel("keep.txt"), HashPair::known(&keep_hash, "v1")),
        (rel("d/old.txt"), HashPair::known(hash_bytes(b"old"), "v2")),
    ]);
    h.remote.put("keep.txt", b"keep");
    h.remote.put("d/old.txt", b"old");
    h.write_local("keep.txt", b"keep");
    h.write_local("d/new.txt", b"new");
    h.write_local(".hidden", b"secret");

    assert_eq!(h.run(TaskTicket::resync(RelPath::root())).await, Ok(None));

    assert_eq!(
        h.remote.names(),
        vec!["d/new.txt".to_string(), "keep.txt".to_string()]
    );
    assert_eq!(h.hashes("keep.txt"), Some(HashPair::known(keep_hash, "v1")));
    assert_eq!(h.hashes("d/old.txt"), None);
    assert!(h.hashes("d/new.txt").unwrap().remote.is_some());
    assert!(h.ctx.replica().index().is_idle());
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_quota_exceeded_fails_task_and_marks_replica() {
    let h = Harness::new(Vec::new());
    h.ctx.replica().set_status(ReplicaStatus::Started);
    h.write_local("big.bin", b"too large");
    h.remote.set_quota_exceeded(true);

    let failures = h
        .run(TaskTicket::local_add(rel("big.bin"), true))
        .await
        .unwrap()
        .expect("task should fail");

    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].kind, TaskKind::LocalAdd);
    assert_eq!(failures[0].paths, vec![rel("big.bin")]);
    assert_eq!(h.ctx.replica().status(), ReplicaStatus::QuotaExceeded);
    assert_eq!(h.reporter.categories(), vec![ErrorCategory::Quota]);
    assert!(!h.ctx.replica().index().is_locked(&rel("big.bin")));
    assert_eq!(h.hashes("big.bin").and_then(|pair| pair.local), None);

    // Space freed: the next upload succeeds and clears the state
    h.remote.set_quota_exceeded(false);
    assert_eq!(h.run(TaskTicket::local_add(rel("big.bin"), true)).await, Ok(None));
    assert_eq!(h.ctx.replica().status(), ReplicaStatus::Started);
    assert_eq!(h.remote.content("big.bin").unwrap(), b"too large");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_subtask_failures_reach_the_parent() {
    let h = Harness::new(Vec::new());
    h.write_local("one.txt", b"1");
    h.write_local("two.txt", b"2");
    h.remote.set_quota_exceeded(true);

    let failures = h
        .run(TaskTicket::resync(RelPath::root()))
        .await
        .unwrap()
        .expect("subtasks should fail");

    let mut paths: Vec<_> = failures.iter().flat_map(|f| f.paths.clone()).collect();
    paths.sort();
    assert_eq!(paths, vec![rel("one.txt"), rel("two.txt")]);
    assert!(failures.iter().all(|f| f.kind == TaskKind::LocalAdd));
    assert!(h.ctx.replica().index().is_idle());
}
