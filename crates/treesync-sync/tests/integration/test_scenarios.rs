//! End-to-end scenarios of the lock engine, the tasks and the scheduler

use std::time::Duration;

use treesync_core::domain::newtypes::HashPair;
use treesync_sync::filesystem::hash_bytes;
use treesync_sync::TaskTicket;

use crate::common::{rel, Harness};

const BASE: &[u8] = b"common ancestor";

// ============================================================================
// Unchanged content
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unchanged_local_add_makes_no_network_call() {
    let content = b"same as last time";
    let local_hash = hash_bytes(content);
    let h = Harness::new(vec![(rel("a.txt"), HashPair::known(&local_hash, "r1"))]);
    h.write_local("a.txt", content);

    let outcome = h.run(TaskTicket::local_add(rel("a.txt"), false)).await;

    assert_eq!(outcome, Ok(None));
    assert_eq!(h.remote.calls.total(), 0);
    assert_eq!(h.hashes("a.txt"), Some(HashPair::known(local_hash, "r1")));
}

// ============================================================================
// Both sides changed
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_both_sides_changed_keeps_a_conflict_copy() {
    let h = Harness::new(vec![(rel("a.txt"), HashPair::known(hash_bytes(BASE), "v1"))]);
    h.remote.put("a.txt", BASE);
    let remote_hash = h.remote.put("a.txt", b"theirs");
    h.write_local("a.txt", b"mine");

    let outcome = h.run(TaskTicket::local_add(rel("a.txt"), false)).await;
    assert_eq!(outcome, Ok(None));

    // Exactly one conflict copy, holding the local edit
    let names = h.local_names("");
    assert_eq!(names.len(), 2, "unexpected files: {names:?}");
    let conflict = names
        .iter()
        .find(|name| name.contains("conflict_"))
        .expect("conflict copy");
    assert!(conflict.starts_with("a (conflict_"));
    assert!(conflict.ends_with(").txt"));
    assert_eq!(h.read_local(conflict).unwrap(), b"mine");

    // The conflict copy is the only upload
    assert_eq!(h.remote.calls.uploads(), 1);
    assert_eq!(h.remote.content(conflict).unwrap(), b"mine");

    // The original path now holds the remote winner
    assert_eq!(h.read_local("a.txt").unwrap(), b"theirs");
    assert_eq!(h.remote.content("a.txt").unwrap(), b"theirs");
    assert_eq!(
        h.hashes("a.txt"),
        Some(HashPair::known(hash_bytes(b"theirs"), remote_hash))
    );
}

// ============================================================================
// Merged local adds
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_second_local_add_upgrades_queued_one() {
    let h = Harness::new(Vec::new());
    h.write_local("a.txt", b"new file");
    let index = h.ctx.replica().index().clone();

    let holder = TaskTicket::remote_add(rel("a.txt")).share();
    index.acquire(&holder).await.unwrap();

    let first = TaskTicket::local_add(rel("a.txt"), false).share();
    let first_handle = h.ctx.spawn(first.clone(), false).unwrap();
    h.wait_until(|_| index.waiting_task(&rel("a.txt")) == Some(first.id()))
        .await;

    let second = TaskTicket::local_add(rel("a.txt"), true).share();
    let second_handle = h.ctx.spawn(second, false).unwrap();
    assert_eq!(second_handle.await, Ok(None));
    assert!(first.create_mode());
    assert_eq!(h.remote.calls.total(), 0);

    index.release(&holder, None);
    assert_eq!(first_handle.await, Ok(None));

    assert_eq!(h.remote.calls.uploads(), 1);
    assert_eq!(h.remote.content("a.txt").unwrap(), b"new file");
    assert!(index.is_idle());
}

// ============================================================================
// Chained moves
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_chained_moves_collapse_into_one() {
    let content = b"moved twice";
    let h = Harness::new(vec![(rel("a"), HashPair::known(hash_bytes(content), "v1"))]);
    h.remote.put("a", content);
    // a -> b -> c already happened on disk
    h.write_local("c", content);
    let index = h.ctx.replica().index().clone();

    let holder = TaskTicket::remote_add(rel("b")).share();
    index.acquire(&holder).await.unwrap();

    let first = TaskTicket::moved(rel("a"), rel("b")).share();
    let first_handle = h.ctx.spawn(first.clone(), false).unwrap();
    h.wait_until(|_| index.waiting_task(&rel("b")) == Some(first.id()))
        .await;

    let second = TaskTicket::moved(rel("b"), rel("c")).share();
    let second_handle = h.ctx.spawn(second, false).unwrap();

    // Both original moves are cancelled
    assert_eq!(second_handle.await, Ok(None));
    assert_eq!(first_handle.await, Ok(None));

    // The replacement move a -> c runs while b is still held
    h.wait_until(|h| h.remote.names() == vec!["c".to_string()])
        .await;
    assert_eq!(h.remote.content("c").unwrap(), content);

    // The synthesized removal of b runs once b is free
    index.release(&holder, None);
    h.wait_until(|h| h.ctx.replica().index().is_idle()).await;

    assert_eq!(h.hashes("a"), None);
    assert_eq!(h.hashes("b"), None);
    assert_eq!(
        h.hashes("c"),
        Some(HashPair::known(hash_bytes(content), h.remote.hash("c").unwrap()))
    );
}

// ============================================================================
// Scheduler cap
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_task_over_the_cap_waits_for_a_completion() {
    let h = Harness::new(Vec::new());
    let scheduler = h.ctx.scheduler().clone();
    let names: Vec<String> = (0..101).map(|i| format!("f{i:03}")).collect();
    for name in &names {
        h.remote.put(name, name.as_bytes());
    }
    let gate = h.remote.close_gate();

    let handles: Vec<_> = names
        .iter()
        .map(|name| h.ctx.spawn(TaskTicket::remote_add(rel(name)).share(), false).unwrap())
        .collect();

    h.wait_until(|h| h.remote.calls.download.load(std::sync::atomic::Ordering::SeqCst) == 100)
        .await;
    assert_eq!(scheduler.in_flight(), 100);
    assert_eq!(scheduler.pending_count(), 1);

    // Still queued while nothing completes
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(scheduler.in_flight(), 100);
    assert_eq!(scheduler.pending_count(), 1);

    // One completion lets the last task start
    gate.add_permits(1);
    h.wait_until(|_| scheduler.pending_count() == 0).await;
    assert!(scheduler.in_flight() <= 100);

    gate.add_permits(1000);
    for handle in handles {
        assert_eq!(handle.await, Ok(None));
    }
    assert_eq!(scheduler.in_flight(), 0);
    assert_eq!(h.local_names("").len(), 101);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_parents_awaiting_subtasks_do_not_fill_the_cap() {
    // Both remote deletions find local edits and push them back through a
    // subtask, while the two parents alone fill the cap.
    let h = Harness::with_config(
        vec![
            (rel("a.txt"), HashPair::known(hash_bytes(BASE), "v1")),
            (rel("b.txt"), HashPair::known(hash_bytes(BASE), "v2")),
        ],
        |builder| builder.scheduler_workers(1).scheduler_max_in_flight(2),
    );
    h.write_local("a.txt", b"edited a");
    h.write_local("b.txt", b"edited b");

    let handles: Vec<_> = ["a.txt", "b.txt"]
        .iter()
        .map(|name| {
            h.ctx
                .spawn(TaskTicket::remote_remove(rel(name)).share(), false)
                .unwrap()
        })
        .collect();

    let all = async {
        for handle in handles {
            assert_eq!(handle.await, Ok(None));
        }
    };
    tokio::time::timeout(Duration::from_secs(10), all)
        .await
        .expect("parents starved their subtasks");

    assert_eq!(h.remote.content("a.txt").unwrap(), b"edited a");
    assert_eq!(h.remote.content("b.txt").unwrap(), b"edited b");
    assert_eq!(h.ctx.scheduler().in_flight(), 0);
    assert!(h.ctx.replica().index().is_idle());
}

// ============================================================================
// Queued rescan
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remote_removal_under_queued_rescan_is_applied() {
    let h = Harness::new(vec![(rel("d/a"), HashPair::known(hash_bytes(BASE), "v1"))]);
    // Deleted remotely, untouched locally
    h.write_local("d/a", BASE);
    let index = h.ctx.replica().index().clone();

    let holder = TaskTicket::remote_add(rel("d/a")).share();
    index.acquire(&holder).await.unwrap();

    let resync = TaskTicket::resync(rel("d")).share();
    let resync_handle = h.ctx.spawn(resync.clone(), false).unwrap();
    h.wait_until(|_| index.waiting_task(&rel("d")) == Some(resync.id()))
        .await;

    let removal = TaskTicket::remote_remove(rel("d/a")).share();
    let removal_handle = h.ctx.spawn(removal.clone(), false).unwrap();
    h.wait_until(|_| index.waiting_task(&rel("d/a")) == Some(removal.id()))
        .await;

    index.release(&holder, None);
    assert_eq!(removal_handle.await, Ok(None));
    assert_eq!(resync_handle.await, Ok(None));

    // The rescan must not resurrect the file
    assert_eq!(h.read_local("d/a"), None);
    assert_eq!(h.hashes("d/a"), None);
    assert!(h.remote.names().is_empty());
    assert_eq!(h.remote.calls.uploads(), 0);
    assert!(index.is_idle());
}
