//! A complete in-process server for tests.
//!
//! [`SimWorld`] wires an in-memory store, a [`SimEnv`], a handful of boards,
//! an image store the test can seed and the append feed, then hands out
//! [`SimClient`]s connected to it.

use std::{
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
    time::Duration,
};

use threadsync_core::{Board, Environment, ImageCommon, ImageToken};
use threadsync_proto::{Captcha, ImageRequest, PostCommon, ThreadCreationRequest};
use threadsync_server::{
    MemoryStorage, ServerContext, Storage, StorageError, Upkeep,
    collaborators::{BoardConfig, HashError, MemoryImages, PasswordHasher, StaticBoards},
    config::{PostingConfig, UpkeepConfig},
    spawn_append_feed,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{SimClient, SimEnv, invariants::SystemSnapshot};

/// Writable text-only board. Threads here need no image.
pub const BOARD: &str = "a";
/// Writable board whose threads must open with an image.
pub const IMAGE_BOARD: &str = "img";
/// Board refusing new posts.
pub const READ_ONLY_BOARD: &str = "ro";

/// Cheap stand-in for Argon2: the salt followed by the password bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimHasher;

impl PasswordHasher for SimHasher {
    fn hash(&self, password: &str, salt: &[u8]) -> Result<Vec<u8>, HashError> {
        Ok([salt, password.as_bytes()].concat())
    }
}

/// In-process server over [`MemoryStorage`] and [`SimEnv`].
pub struct SimWorld {
    /// Shared request context
    pub ctx: ServerContext<MemoryStorage, SimEnv>,
    /// Image store behind the context, for seeding and ref counts
    pub images: MemoryImages,
    shutdown: CancellationToken,
    feed: JoinHandle<u64>,
    next_ip: u32,
}

impl SimWorld {
    /// World with boards [`BOARD`], [`IMAGE_BOARD`] and [`READ_ONLY_BOARD`].
    ///
    /// Must be called inside a tokio runtime: the append feed is spawned
    /// immediately.
    pub fn new(seed: u64) -> Self {
        Self::with_posting(seed, PostingConfig::default())
    }

    /// World with custom posting limits.
    #[allow(clippy::expect_used, reason = "Board creation on a fresh store cannot fail")]
    pub fn with_posting(seed: u64, posting: PostingConfig) -> Self {
        let env = SimEnv::with_seed(seed);
        let storage = MemoryStorage::new();
        let boards = StaticBoards::new()
            .with_board(BOARD, BoardConfig { text_only: true, ..BoardConfig::default() })
            .with_board(IMAGE_BOARD, BoardConfig::default())
            .with_board(READ_ONLY_BOARD, BoardConfig { read_only: true, ..BoardConfig::default() });

        let created = env.wall_clock_secs();
        for id in boards.ids() {
            storage
                .create_board(&Board { id: id.to_string(), created })
                .expect("fresh store accepts boards");
        }

        let images = MemoryImages::new();
        let ctx = ServerContext::new(storage, env, boards)
            .with_hasher(SimHasher)
            .with_images(Arc::new(images.clone()))
            .with_posting(posting);

        let shutdown = CancellationToken::new();
        let feed = spawn_append_feed(&ctx.storage, ctx.registry.clone(), shutdown.clone());

        Self { ctx, images, shutdown, feed, next_ip: 1 }
    }

    /// Log store.
    pub fn storage(&self) -> &MemoryStorage {
        &self.ctx.storage
    }

    /// Simulated environment.
    pub fn env(&self) -> &SimEnv {
        &self.ctx.env
    }

    /// Connect a new client from a fresh address.
    pub fn connect(&mut self) -> SimClient {
        let ip = IpAddr::V4(Ipv4Addr::from(0x0a00_0000 + self.next_ip));
        self.next_ip += 1;
        SimClient::connect(&self.ctx, ip)
    }

    /// Allocate an image and issue a token for it, expiring `ttl` from now.
    pub fn seed_image(&self, sha1: &str, token: &str, ttl: Duration) -> Result<(), StorageError> {
        self.images.allocate(ImageCommon {
            sha1: sha1.to_string(),
            file_type: "png".to_string(),
            dims: [640, 480, 125, 94],
            size: 4096,
        });
        self.ctx.storage.insert_image_token(&ImageToken {
            token: token.to_string(),
            expires: self.env().wall_clock_secs() + ttl.as_secs(),
            sha1: sha1.to_string(),
        })
    }

    /// Upkeep passes over this world's store, image store and clock.
    pub fn upkeep(&self, config: UpkeepConfig) -> Upkeep<MemoryStorage, SimEnv> {
        Upkeep::new(self.ctx.storage.clone(), self.ctx.env.clone(), self.ctx.images.clone(), config)
    }

    /// Snapshot of every stored thread.
    #[allow(clippy::expect_used, reason = "The in-memory store does not fail reads")]
    pub fn snapshot(&self) -> SystemSnapshot {
        SystemSnapshot::capture(&self.ctx.storage).expect("memory store reads succeed")
    }

    /// Stop the append feed, returning how many entries it forwarded.
    pub async fn shutdown(self) -> u64 {
        self.shutdown.cancel();
        self.feed.await.unwrap_or(0)
    }
}

/// Password every harness post is created with.
pub const POST_PASSWORD: &str = "sim-password";

/// Post fields with only the password filled in.
pub fn post_common() -> PostCommon {
    PostCommon { password: POST_PASSWORD.to_string(), ..PostCommon::default() }
}

/// Thread creation request with just a board and subject.
pub fn thread_request(board: &str, subject: &str) -> ThreadCreationRequest {
    ThreadCreationRequest {
        common: post_common(),
        subject: subject.to_string(),
        board: board.to_string(),
        captcha: Captcha::default(),
    }
}

/// Thread creation request carrying an image.
pub fn thread_request_with_image(board: &str, token: &str, name: &str) -> ThreadCreationRequest {
    let mut req = thread_request(board, "image thread");
    req.common.image = ImageRequest { spoiler: false, token: token.to_string(), name: name.to_string() };
    req
}
