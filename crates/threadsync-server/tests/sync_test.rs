//! Feed synchronisation tests
//!
//! Subscribing to a thread delivers the log suffix after the client's
//! counter, then every later entry exactly once, whatever the interleaving
//! with concurrent writers.

use std::time::Duration;

use bytes::Bytes;
use proptest::prelude::*;
use threadsync_harness::{
    BOARD, FeedSnapshot, IMAGE_BOARD, InvariantRegistry, SimClient, SimWorld, thread_request,
};
use threadsync_proto::{ErrorPayload, MessageType, decode_message};
use threadsync_server::Storage;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
}

/// Create a thread and post `replies` replies to it. Each reply closes the
/// previous post first, so the log holds two entries per reply. Returns the
/// thread id and the writer, which has consumed its own live feed.
async fn seeded_thread(world: &mut SimWorld, replies: usize) -> (u64, SimClient) {
    let mut writer = world.connect();
    let thread = writer.create_thread(&thread_request(BOARD, "seed")).await.id;
    writer.sync_with_backlog(BOARD, thread, 0, 0).await;

    for i in 0..replies {
        writer.reply(&format!("reply {i}")).await;
    }
    for _ in 0..2 * replies {
        writer.recv().await;
    }

    (thread, writer)
}

#[test]
fn prop_catch_up_from_any_counter() {
    proptest!(ProptestConfig::with_cases(32), |(
        replies in 0usize..8,
        seed in any::<u64>(),
        pick in any::<prop::sample::Index>(),
    )| {
        runtime().block_on(async {
            let mut world = SimWorld::new(seed);
            let (thread, _writer) = seeded_thread(&mut world, replies).await;
            let log = world.storage().load_log(thread, 0).unwrap();
            let ctr = pick.index(log.len() + 1);

            let mut reader = world.connect();
            let backlog =
                reader.sync_with_backlog(BOARD, thread, ctr as i64, log.len() - ctr).await;

            // ORACLE: the backlog is exactly the stored log after the counter
            assert_eq!(backlog, log[ctr..].to_vec());
            assert!(reader.drain().await.is_empty(), "nothing beyond the backlog");
        });
    });
}

#[tokio::test]
async fn sync_ack_carries_connection_id() {
    let mut world = SimWorld::new(1);
    let (thread, _writer) = seeded_thread(&mut world, 0).await;

    let mut reader = world.connect();
    reader.sync(BOARD, thread, 0).await;
    let payload = reader.expect_type(MessageType::Synchronise).await;
    let id: u64 = std::str::from_utf8(&payload).unwrap().parse().unwrap();

    assert!(id > 0);
    assert_eq!(world.ctx.registry.thread_subscriber_count(thread), 2);
}

#[tokio::test]
async fn live_entries_follow_the_backlog() {
    let mut world = SimWorld::new(2);
    let (thread, writer) = seeded_thread(&mut world, 2).await;

    let mut reader = world.connect();
    let backlog = reader.sync_with_backlog(BOARD, thread, 0, 4).await;
    assert_eq!(backlog.len(), 4);

    writer.reply("live").await;
    let close = reader.recv().await;
    let reply = reader.recv().await;

    let log = world.storage().load_log(thread, 0).unwrap();
    assert_eq!(log.len(), 6);
    assert_eq!(close, log[4]);
    assert_eq!(reply, log[5]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_appends_reach_late_subscriber_exactly_once() {
    const REPLIES: usize = 25;

    let mut world = SimWorld::new(3);
    let (thread, mut writer) = seeded_thread(&mut world, 0).await;
    let mut reader = world.connect();

    let writing = tokio::spawn(async move {
        for i in 0..REPLIES {
            writer.reply(&format!("concurrent {i}")).await;
        }
        for _ in 0..2 * REPLIES {
            writer.recv().await;
        }
        writer
    });

    // Subscribe somewhere in the middle of the writes.
    tokio::time::sleep(Duration::from_millis(2)).await;
    reader.sync(BOARD, thread, 0).await;
    reader.expect_type(MessageType::Synchronise).await;

    let _writer = writing.await.unwrap();
    let mut received = Vec::new();
    while received.len() < 2 * REPLIES {
        received.push(reader.recv().await);
    }
    assert!(reader.drain().await.is_empty(), "no duplicates after the full log");

    let snapshot = world
        .snapshot()
        .with_feed(FeedSnapshot::new(1, thread, 0).with_received(received));
    InvariantRegistry::standard().assert_all(&snapshot, "after concurrent replies");
}

#[tokio::test]
async fn unknown_board_is_rejected() {
    let mut world = SimWorld::new(4);
    let mut client = world.connect();

    client.sync("nope", 0, 0).await;
    client.expect_error(ErrorPayload::INVALID_BOARD).await;
}

#[tokio::test]
async fn unknown_thread_is_rejected() {
    let mut world = SimWorld::new(5);
    let mut client = world.connect();

    client.sync(BOARD, 4242, 0).await;
    client.expect_error(ErrorPayload::INVALID_THREAD).await;
}

#[tokio::test]
async fn thread_on_another_board_is_rejected() {
    let mut world = SimWorld::new(6);
    let (thread, _writer) = seeded_thread(&mut world, 0).await;
    let mut client = world.connect();

    client.sync(IMAGE_BOARD, thread, 0).await;
    client.expect_error(ErrorPayload::INVALID_THREAD).await;
}

#[tokio::test]
async fn out_of_range_counters_leave_client_unsubscribed() {
    let mut world = SimWorld::new(7);
    let (thread, _writer) = seeded_thread(&mut world, 1).await;
    let mut client = world.connect();

    client.sync(BOARD, thread, -1).await;
    client.expect_error(ErrorPayload::INVALID_COUNTER).await;

    client.sync(BOARD, thread, 3).await;
    client.expect_error(ErrorPayload::INVALID_COUNTER).await;

    assert_eq!(world.ctx.registry.thread_subscriber_count(thread), 1, "only the writer");
    client.reply("not allowed").await;
    client.expect_error(ErrorPayload::NOT_SYNCED).await;
}

#[tokio::test]
async fn counter_at_log_length_sends_no_backlog() {
    let mut world = SimWorld::new(8);
    let (thread, _writer) = seeded_thread(&mut world, 3).await;
    let mut client = world.connect();

    let backlog = client.sync_with_backlog(BOARD, thread, 6, 0).await;
    assert!(backlog.is_empty());
    assert!(client.drain().await.is_empty());
}

#[tokio::test]
async fn board_feed_gets_no_thread_entries() {
    let mut world = SimWorld::new(9);
    let (thread, writer) = seeded_thread(&mut world, 0).await;

    let mut watcher = world.connect();
    watcher.sync_with_backlog(BOARD, 0, 0, 0).await;
    assert_eq!(world.ctx.registry.board_subscriber_count(BOARD), 1);

    writer.reply("on the thread").await;
    assert!(watcher.drain().await.is_empty());

    watcher.reply("from the board page").await;
    watcher.expect_error(ErrorPayload::NOT_SYNCED).await;
    assert_eq!(world.ctx.registry.thread_subscriber_count(thread), 1);
}

#[tokio::test]
async fn meta_board_can_be_followed() {
    let mut world = SimWorld::new(10);
    let mut client = world.connect();

    let backlog = client.sync_with_backlog("all", 0, 0, 0).await;
    assert!(backlog.is_empty());
}

#[tokio::test]
async fn resync_moves_the_subscription() {
    let mut world = SimWorld::new(11);
    let (first, _a) = seeded_thread(&mut world, 0).await;
    let (second, _b) = seeded_thread(&mut world, 0).await;

    let mut client = world.connect();
    client.sync_with_backlog(BOARD, first, 0, 0).await;
    client.sync_with_backlog(BOARD, second, 0, 0).await;

    assert_eq!(world.ctx.registry.thread_subscriber_count(first), 1);
    assert_eq!(world.ctx.registry.thread_subscriber_count(second), 2);
}

#[tokio::test]
async fn malformed_frames_do_not_end_the_connection() {
    let mut world = SimWorld::new(12);
    let mut client = world.connect();

    client.send(Bytes::from_static(b"x")).await;
    client.expect_error(ErrorPayload::MALFORMED).await;

    client.send(Bytes::from_static(b"30{not json")).await;
    client.expect_error(ErrorPayload::MALFORMED).await;

    client.send(Bytes::from_static(b"00{}")).await;
    let error = client.expect_error(ErrorPayload::MALFORMED).await;
    assert!(!error.message.is_empty());

    let backlog = client.sync_with_backlog(BOARD, 0, 0, 0).await;
    assert!(backlog.is_empty());
}

#[tokio::test]
async fn disconnect_leaves_the_registry() {
    let mut world = SimWorld::new(13);
    let (thread, writer) = seeded_thread(&mut world, 0).await;
    assert_eq!(world.ctx.registry.connection_count(), 1);

    writer.disconnect().await;
    assert_eq!(world.ctx.registry.connection_count(), 0);
    assert_eq!(world.ctx.registry.thread_subscriber_count(thread), 0);
}

#[tokio::test]
async fn every_frame_is_a_typed_message() {
    let mut world = SimWorld::new(14);
    let (thread, _writer) = seeded_thread(&mut world, 2).await;
    let mut client = world.connect();

    for frame in client.sync_with_backlog(BOARD, thread, 0, 4).await {
        let (ty, _) = decode_message(&frame).unwrap();
        assert!(matches!(ty, MessageType::InsertPost | MessageType::ClosePost));
    }
}
