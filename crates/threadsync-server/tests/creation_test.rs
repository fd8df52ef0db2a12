//! Post creation tests
//!
//! Threads, replies, splices and closes through real connection tasks, with
//! the stored thread checked after each step.

use std::time::Duration;

use threadsync_core::{Environment, Thread};
use threadsync_harness::{
    BOARD, IMAGE_BOARD, InvariantRegistry, READ_ONLY_BOARD, SimClient, SimWorld, post_common,
    thread_request, thread_request_with_image,
};
use threadsync_proto::{
    ErrorPayload, ImageRequest, MessageType, PostCommon, PostMessage, ReplyCreationRequest,
    SpliceMessage, ThreadCreationResponse, decode_message, decode_payload,
};
use threadsync_server::{
    Storage,
    collaborators::CaptchaPolicy,
    config::{PostingConfig, UpkeepConfig},
};

async fn open_thread(world: &mut SimWorld) -> (u64, SimClient) {
    let mut client = world.connect();
    let response = client.create_thread(&thread_request(BOARD, "subject")).await;
    assert_eq!(response.code, ThreadCreationResponse::CREATED);
    client.sync_with_backlog(BOARD, response.id, 0, 0).await;
    (response.id, client)
}

/// Open a thread on [`IMAGE_BOARD`] with a freshly seeded image.
async fn open_image_thread(world: &mut SimWorld) -> (u64, SimClient) {
    world.seed_image("op", "op-token", Duration::from_secs(3600)).unwrap();
    let mut client = world.connect();
    let request = thread_request_with_image(IMAGE_BOARD, "op-token", "op.png");
    let response = client.create_thread(&request).await;
    assert_eq!(response.code, ThreadCreationResponse::CREATED);
    client.sync_with_backlog(IMAGE_BOARD, response.id, 0, 0).await;
    (response.id, client)
}

/// Wait until the writer's own feed has delivered `entries` entries.
async fn settle(client: &mut SimClient, entries: usize) {
    for _ in 0..entries {
        client.recv().await;
    }
}

fn load(world: &SimWorld, id: u64) -> Thread {
    world.storage().load_thread(id).unwrap().unwrap()
}

fn entry_type(entry: &[u8]) -> MessageType {
    decode_message(entry).unwrap().0
}

fn post_entry(entry: &[u8]) -> PostMessage {
    let (ty, payload) = decode_message(entry).unwrap();
    assert_eq!(ty, MessageType::InsertPost);
    decode_payload(payload).unwrap()
}

fn splice_entry(entry: &[u8]) -> SpliceMessage {
    let (ty, payload) = decode_message(entry).unwrap();
    assert_eq!(ty, MessageType::Splice);
    decode_payload(payload).unwrap()
}

fn closed_id(entry: &[u8]) -> u64 {
    let (ty, payload) = decode_message(entry).unwrap();
    assert_eq!(ty, MessageType::ClosePost);
    decode_payload(payload).unwrap()
}

fn reply_with(common: PostCommon, body: &str) -> ReplyCreationRequest {
    ReplyCreationRequest { common, body: body.to_string() }
}

#[tokio::test]
async fn thread_creation_stores_open_opening_post() {
    let mut world = SimWorld::new(1);
    let mut client = world.connect();

    let response = client.create_thread(&thread_request(BOARD, "hello")).await;
    assert_eq!(response.code, ThreadCreationResponse::CREATED);
    assert!(response.id > 0);

    let thread = load(&world, response.id);
    assert_eq!(thread.board, BOARD);
    assert_eq!(thread.subject, "hello");
    assert_eq!(thread.post_ctr, 0);
    assert!(thread.log.is_empty());
    assert!(thread.posts[&response.id].editing);
    assert_eq!(thread.posts[&response.id].time, world.env().wall_clock_secs());
    assert_eq!(world.storage().board_counter(BOARD).unwrap(), 1);
}

#[tokio::test]
async fn thread_creation_rejects_unusable_boards() {
    let mut world = SimWorld::new(2);
    let mut client = world.connect();

    for board in ["nope", "all"] {
        client.request(MessageType::InsertThread, &thread_request(board, "s")).await;
        client.expect_error(ErrorPayload::INVALID_BOARD).await;
    }

    client.request(MessageType::InsertThread, &thread_request(READ_ONLY_BOARD, "s")).await;
    client.expect_error(ErrorPayload::READ_ONLY_BOARD).await;

    assert_eq!(world.storage().thread_count(), 0);
}

#[tokio::test]
async fn failed_captcha_is_an_answer_not_an_error() {
    let mut world = SimWorld::new(3);
    world.ctx = world.ctx.clone().with_captcha(CaptchaPolicy::RejectAll);
    let mut client = world.connect();

    let response = client.create_thread(&thread_request(BOARD, "bot")).await;
    assert_eq!(response, ThreadCreationResponse::captcha_rejected());
    assert_eq!(world.storage().thread_count(), 0);
    assert_eq!(world.storage().board_counter(BOARD).unwrap(), 0);
}

#[tokio::test]
async fn overlong_subject_is_rejected() {
    let mut world = SimWorld::new(4);
    let mut client = world.connect();

    client.request(MessageType::InsertThread, &thread_request(BOARD, &"s".repeat(101))).await;
    client.expect_error(ErrorPayload::INVALID_POST).await;
    assert_eq!(world.storage().thread_count(), 0);
}

#[tokio::test]
async fn thread_image_consumes_its_token() {
    let mut world = SimWorld::new(5);
    world.seed_image("abc123", "tok", Duration::from_secs(60)).unwrap();
    let mut client = world.connect();

    let response =
        client.create_thread(&thread_request_with_image(IMAGE_BOARD, "tok", "cat.png")).await;
    let thread = load(&world, response.id);

    let image = thread.posts[&response.id].image.clone().unwrap();
    assert_eq!(image.common.sha1, "abc123");
    assert_eq!(thread.image_ctr, 1);
    assert_eq!(world.storage().image_token_count(), 0);
}

#[tokio::test]
async fn unknown_image_token_is_rejected() {
    let mut world = SimWorld::new(6);
    let mut client = world.connect();

    client
        .request(
            MessageType::InsertThread,
            &thread_request_with_image(IMAGE_BOARD, "missing", "a.png"),
        )
        .await;
    client.expect_error(ErrorPayload::INVALID_IMAGE).await;
    assert_eq!(world.storage().thread_count(), 0);
}

#[tokio::test]
async fn image_board_thread_needs_an_image() {
    let mut world = SimWorld::new(26);
    let mut client = world.connect();

    client.request(MessageType::InsertThread, &thread_request(IMAGE_BOARD, "bare")).await;
    client.expect_error(ErrorPayload::INVALID_IMAGE).await;
    assert_eq!(world.storage().thread_count(), 0);
}

#[tokio::test]
async fn text_only_board_ignores_images() {
    let mut world = SimWorld::new(7);
    world.seed_image("abc123", "tok", Duration::from_secs(60)).unwrap();
    let mut client = world.connect();

    let response =
        client.create_thread(&thread_request_with_image(BOARD, "tok", "cat.png")).await;
    let thread = load(&world, response.id);

    assert!(thread.posts[&response.id].image.is_none());
    assert_eq!(thread.image_ctr, 0);
    assert_eq!(world.storage().image_token_count(), 1, "token left for later use");
}

#[tokio::test]
async fn reply_requires_thread_subscription() {
    let mut world = SimWorld::new(8);
    let mut client = world.connect();

    client.reply("hi").await;
    client.expect_error(ErrorPayload::NOT_SYNCED).await;
}

#[tokio::test]
async fn reply_updates_counters_and_bumps() {
    let mut world = SimWorld::new(9);
    let (id, mut client) = open_thread(&mut world).await;

    world.env().advance(Duration::from_secs(30));
    client.reply("first").await;
    settle(&mut client, 2).await;

    let thread = load(&world, id);
    let now = world.env().wall_clock_secs();
    assert_eq!(thread.post_ctr, 1);
    assert_eq!(thread.reply_time, now);
    assert_eq!(thread.bump_time, now);
    assert_eq!(world.storage().board_counter(BOARD).unwrap(), 2);

    let reply = post_entry(&thread.log[1]);
    assert_eq!(reply.body, "first");
    assert!(reply.editing);
    assert_eq!(closed_id(&thread.log[0]), id, "opening post closed first");
}

#[tokio::test]
async fn sage_reply_does_not_bump() {
    let mut world = SimWorld::new(10);
    let (id, mut client) = open_thread(&mut world).await;
    let created = load(&world, id).bump_time;

    world.env().advance(Duration::from_secs(30));
    let sage = PostCommon { email: "sage".to_string(), ..post_common() };
    client.request(MessageType::InsertPost, &reply_with(sage, "quiet")).await;
    settle(&mut client, 2).await;

    let thread = load(&world, id);
    assert_eq!(thread.post_ctr, 1);
    assert_eq!(thread.bump_time, created);
    assert_eq!(thread.reply_time, world.env().wall_clock_secs());
}

#[tokio::test]
async fn bumping_stops_at_the_limit() {
    let posting = PostingConfig { max_bump: 2, ..PostingConfig::default() };
    let mut world = SimWorld::with_posting(11, posting);
    let (id, mut client) = open_thread(&mut world).await;

    for body in ["one", "two"] {
        world.env().advance(Duration::from_secs(10));
        client.reply(body).await;
        settle(&mut client, 2).await;
    }
    let bumped = load(&world, id).bump_time;
    assert_eq!(bumped, world.env().wall_clock_secs());

    world.env().advance(Duration::from_secs(10));
    client.reply("three").await;
    settle(&mut client, 2).await;

    let thread = load(&world, id);
    assert_eq!(thread.post_ctr, 3);
    assert_eq!(thread.bump_time, bumped);
}

#[tokio::test]
async fn locked_thread_refuses_replies_without_change() {
    let mut world = SimWorld::new(12);
    let (id, _author) = open_thread(&mut world).await;
    world.storage().set_locked(id, true).unwrap();
    let before = load(&world, id);

    let mut client = world.connect();
    client.sync_with_backlog(BOARD, id, 0, 0).await;
    client.reply("let me in").await;
    client.expect_error(ErrorPayload::THREAD_LOCKED).await;

    assert_eq!(load(&world, id), before);
}

#[tokio::test]
async fn empty_reply_is_rejected() {
    let mut world = SimWorld::new(13);
    let (id, mut client) = open_thread(&mut world).await;

    client.reply("").await;
    client.expect_error(ErrorPayload::NO_TEXT_OR_IMAGE).await;
    // The opening post was closed before validation.
    settle(&mut client, 1).await;
    assert_eq!(load(&world, id).post_ctr, 0);
}

#[tokio::test]
async fn overlong_reply_is_rejected() {
    let posting = PostingConfig { max_body_len: 10, ..PostingConfig::default() };
    let mut world = SimWorld::with_posting(14, posting);
    let (id, mut client) = open_thread(&mut world).await;

    client.reply("0123456789x").await;
    client.expect_error(ErrorPayload::BODY_TOO_LONG).await;
    settle(&mut client, 1).await;
    assert_eq!(load(&world, id).post_ctr, 0);
}

#[tokio::test]
async fn new_reply_silently_closes_the_previous_one() {
    let mut world = SimWorld::new(15);
    let (id, mut client) = open_thread(&mut world).await;

    client.reply("a").await;
    client.reply("b").await;
    settle(&mut client, 4).await;

    let thread = load(&world, id);
    let first = post_entry(&thread.log[1]);
    let second = post_entry(&thread.log[3]);
    assert!(!thread.posts[&first.id].editing);
    assert!(thread.posts[&second.id].editing);
    assert_eq!(closed_id(&thread.log[2]), first.id);

    InvariantRegistry::standard().assert_all(&world.snapshot(), "after two replies");
}

#[tokio::test]
async fn multi_line_reply_is_committed_then_spliced() {
    let mut world = SimWorld::new(16);
    let (id, mut client) = open_thread(&mut world).await;

    client.reply("hello\nworld").await;
    settle(&mut client, 3).await;

    let thread = load(&world, id);
    let reply = post_entry(&thread.log[1]);
    assert_eq!(reply.body, "hello");

    let splice = splice_entry(&thread.log[2]);
    assert_eq!(splice, SpliceMessage { id: reply.id, start: 5, len: 0, text: "\nworld".into() });
    assert_eq!(thread.posts[&reply.id].body, "hello\nworld");
}

#[tokio::test]
async fn splice_edits_the_open_post() {
    let mut world = SimWorld::new(17);
    let (id, mut client) = open_thread(&mut world).await;

    client.reply("abc").await;
    client.splice(1, 1, "XY").await;
    settle(&mut client, 3).await;

    let thread = load(&world, id);
    let reply = post_entry(&thread.log[1]);
    assert_eq!(thread.posts[&reply.id].body, "aXYc");
    assert_eq!(entry_type(&thread.log[2]), MessageType::Splice);
}

#[tokio::test]
async fn invalid_splices_are_rejected() {
    let posting = PostingConfig { max_body_len: 5, ..PostingConfig::default() };
    let mut world = SimWorld::with_posting(18, posting);
    let (id, mut client) = open_thread(&mut world).await;
    client.reply("abc").await;
    settle(&mut client, 2).await;

    client.splice(2, 5, "x").await;
    client.expect_error(ErrorPayload::INVALID_SPLICE).await;

    client.splice(0, 0, "").await;
    client.expect_error(ErrorPayload::INVALID_SPLICE).await;

    client.splice(3, 0, "def").await;
    client.expect_error(ErrorPayload::BODY_TOO_LONG).await;

    assert_eq!(load(&world, id).log.len(), 2);
}

#[tokio::test]
async fn splice_without_open_post_is_rejected() {
    let mut world = SimWorld::new(19);
    let mut client = world.connect();

    client.splice(0, 0, "x").await;
    client.expect_error(ErrorPayload::NO_OPEN_POST).await;
}

#[tokio::test]
async fn close_appends_once() {
    let mut world = SimWorld::new(20);
    let (id, mut client) = open_thread(&mut world).await;

    client.reply("done").await;
    client.close_post().await;
    settle(&mut client, 3).await;

    client.close_post().await;
    client.expect_error(ErrorPayload::NO_OPEN_POST).await;

    let thread = load(&world, id);
    assert_eq!(thread.log.len(), 3);
    InvariantRegistry::standard().assert_all(&world.snapshot(), "after explicit close");
}

#[tokio::test]
async fn closing_a_post_upkeep_already_closed_is_silent() {
    let mut world = SimWorld::new(21);
    let (id, mut client) = open_thread(&mut world).await;
    client.reply("slow").await;
    settle(&mut client, 2).await;

    world.env().advance(Duration::from_secs(31 * 60));
    let closed = world.upkeep(UpkeepConfig::default()).close_dangling_posts().unwrap();
    assert_eq!(closed.posts, 1);
    settle(&mut client, 1).await;

    client.close_post().await;
    assert!(client.drain().await.is_empty(), "no error and no entry");
    assert_eq!(load(&world, id).log.len(), 3);
}

#[tokio::test]
async fn disconnect_closes_the_open_post() {
    let mut world = SimWorld::new(22);
    let (id, mut client) = open_thread(&mut world).await;
    client.reply("bye").await;
    settle(&mut client, 2).await;

    client.disconnect().await;

    let thread = load(&world, id);
    assert_eq!(thread.log.len(), 3);
    assert!(thread.posts.values().all(|post| !post.editing));
    InvariantRegistry::standard().assert_all(&world.snapshot(), "after disconnect");
}

#[tokio::test]
async fn image_reply_counts_the_image() {
    let mut world = SimWorld::new(23);
    world.seed_image("feed", "tok", Duration::from_secs(60)).unwrap();
    let (id, mut client) = open_image_thread(&mut world).await;

    let common = PostCommon {
        image: ImageRequest { spoiler: true, token: "tok".into(), name: "pic.jpg".into() },
        ..post_common()
    };
    client.request(MessageType::InsertPost, &reply_with(common, "")).await;
    settle(&mut client, 2).await;

    let thread = load(&world, id);
    assert_eq!(thread.post_ctr, 1);
    assert_eq!(thread.image_ctr, 2);
    let reply = post_entry(&thread.log[1]);
    let image = reply.image.unwrap();
    assert!(image.spoiler);
    assert_eq!(image.name, "pic");
}

#[tokio::test]
async fn expired_token_is_released_and_rejected() {
    let mut world = SimWorld::new(24);
    world.seed_image("old", "tok", Duration::from_secs(60)).unwrap();
    let (id, mut client) = open_image_thread(&mut world).await;
    world.env().advance(Duration::from_secs(120));

    let common = PostCommon {
        image: ImageRequest { spoiler: false, token: "tok".into(), name: "late.png".into() },
        ..post_common()
    };
    client.request(MessageType::InsertPost, &reply_with(common, "")).await;
    client.expect_error(ErrorPayload::INVALID_IMAGE).await;
    settle(&mut client, 1).await;

    assert_eq!(world.images.ref_count("old"), 0);
    assert_eq!(world.storage().image_token_count(), 0);
    assert_eq!(load(&world, id).post_ctr, 0);
}

#[tokio::test]
async fn tripcode_and_password_are_stored_privately() {
    let mut world = SimWorld::new(25);
    let (id, mut client) = open_thread(&mut world).await;

    let common = PostCommon {
        name: "anon#secret".into(),
        password: "hunter2".into(),
        ..post_common()
    };
    client.request(MessageType::InsertPost, &reply_with(common, "signed")).await;
    settle(&mut client, 2).await;

    let thread = load(&world, id);
    let reply = post_entry(&thread.log[1]);
    assert_eq!(reply.name, "anon");
    assert_eq!(reply.trip.len(), 10);

    let stored = &thread.posts[&reply.id];
    assert!(stored.ip.is_some());
    assert!(!stored.password.is_empty());
    assert!(!String::from_utf8_lossy(&thread.log[1]).contains("hunter2"));
}
