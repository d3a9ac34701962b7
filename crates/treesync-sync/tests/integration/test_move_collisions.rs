//! Moves meeting on one path, driven through real tasks
//!
//! `p -> x` is queued behind a lock on `p` when `s -> p` arrives. Whatever
//! the merge turns them into, both sides must end up as if the two moves
//! had been replayed one after the other.

use std::time::Duration;

use proptest::prelude::*;
use treesync_core::domain::newtypes::HashPair;
use treesync_sync::filesystem::hash_bytes;
use treesync_sync::TaskTicket;

use crate::common::{rel, Harness};

fn names_strategy() -> impl Strategy<Value = (String, String, String)> {
    ("[a-f]{1,3}", "[a-f]{1,3}", "[a-f]{1,3}")
        .prop_filter("names must be distinct", |(p, x, s)| p != x && x != s && p != s)
}

fn content_strategy() -> impl Strategy<Value = Vec<u8>> {
    "[a-z]{1,16}".prop_map(String::into_bytes)
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

/// Remote versions are handed out in `put` order: `p` is v1, `s` v2, `x` v3
async fn replay_collision(
    (p, x, s): (String, String, String),
    moved: Vec<u8>,
    incoming: Vec<u8>,
    overwritten: Option<Vec<u8>>,
) {
    let mut entries = vec![
        (rel(&p), HashPair::known(hash_bytes(&moved), "v1")),
        (rel(&s), HashPair::known(hash_bytes(&incoming), "v2")),
    ];
    if let Some(content) = &overwritten {
        entries.push((rel(&x), HashPair::known(hash_bytes(content), "v3")));
    }
    let h = Harness::new(entries);
    h.remote.put(&p, &moved);
    h.remote.put(&s, &incoming);
    if let Some(content) = &overwritten {
        h.remote.put(&x, content);
    }

    // Both moves already happened on disk
    h.write_local(&x, &moved);
    h.write_local(&p, &incoming);
    let index = h.ctx.replica().index().clone();

    let holder = TaskTicket::remote_add(rel(&p)).share();
    index.acquire(&holder).await.unwrap();

    let queued = TaskTicket::moved(rel(&p), rel(&x)).share();
    let queued_handle = h.ctx.spawn(queued.clone(), false).unwrap();
    h.wait_until(|_| index.waiting_task(&rel(&p)) == Some(queued.id()))
        .await;

    let second = TaskTicket::moved(rel(&s), rel(&p)).share();
    let second_handle = h.ctx.spawn(second, false).unwrap();
    assert_eq!(second_handle.await, Ok(None));
    assert_eq!(queued_handle.await, Ok(None));

    index.release(&holder, None);
    h.wait_until(|h| {
        h.remote.content(&x).as_deref() == Some(moved.as_slice())
            && h.remote.content(&p).as_deref() == Some(incoming.as_slice())
            && h.remote.content(&s).is_none()
    })
    .await;
    h.wait_until(|h| {
        let scheduler = h.ctx.scheduler();
        scheduler.in_flight() == 0 && scheduler.pending_count() == 0 && index.is_idle()
    })
    .await;

    let mut expected = vec![p.clone(), x.clone()];
    expected.sort();
    assert_eq!(h.remote.names(), expected, "no conflict copy expected");
    assert_eq!(h.read_local(&x).unwrap(), moved);
    assert_eq!(h.read_local(&p).unwrap(), incoming);
    assert_eq!(h.read_local(&s), None);

    assert_eq!(
        h.hashes(&x),
        Some(HashPair::known(hash_bytes(&moved), h.remote.hash(&x).unwrap()))
    );
    assert_eq!(
        h.hashes(&p),
        Some(HashPair::known(hash_bytes(&incoming), h.remote.hash(&p).unwrap()))
    );
    assert_eq!(h.hashes(&s), None);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn test_moves_meeting_on_a_path_match_sequential_replay(
        names in names_strategy(),
        moved in content_strategy(),
        incoming in content_strategy(),
        overwritten in prop::option::of(content_strategy()),
    ) {
        runtime().block_on(async {
            tokio::time::timeout(
                Duration::from_secs(20),
                replay_collision(names, moved, incoming, overwritten),
            )
            .await
            .expect("moves did not settle");
        });
    }
}
