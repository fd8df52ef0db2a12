//! Threadsync server.
//!
//! Real-time backbone of a discussion board: keeps connected viewers of a
//! thread in sync with the thread's append-only event log, creates threads
//! and replies under per-connection and per-thread constraints, and runs
//! periodic upkeep passes beside live traffic.
//!
//! # Architecture
//!
//! ```text
//!  client ── WsTransport ── run_connection ──┬── creation ──┐
//!                               ▲            └── sync ──────┤
//!                               │                           ▼
//!                          SyncRegistry ◀── append feed ◀── Storage ◀── Upkeep
//! ```
//!
//! Writers (the creation pipeline and the upkeep passes) only ever change a
//! thread through one atomic [`Storage::update_thread`]. The store publishes
//! every appended entry in commit order; the append feed routes each one to
//! the connections following that thread, and each connection filters what
//! it receives through its [`sync::FeedCursor`] so catch-up and live
//! delivery join without gaps or duplicates.
//!
//! # Components
//!
//! - [`storage`]: log store trait, [`MemoryStorage`], [`ChaoticStorage`]
//! - [`collaborators`]: board config, captcha, parsing, hashing, images
//! - [`creation`]: thread/reply creation, splicing, closing
//! - [`sync`] and [`SyncRegistry`]: subscription and catch-up
//! - [`upkeep`]: periodic maintenance passes
//! - [`Server`]: production runtime over WebSockets with [`SystemEnv`]

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod client;
pub mod collaborators;
pub mod config;
mod connection;
mod context;
pub mod creation;
mod error;
mod feed;
mod registry;
pub mod storage;
pub mod sync;
mod system_env;
mod transport;
pub mod upkeep;

use std::net::SocketAddr;

pub use client::{Client, OpenPost};
pub use collaborators::StaticBoards;
pub use config::{BoardSettings, PostingConfig, ServerRuntimeConfig, UpkeepConfig};
pub use connection::run_connection;
pub use context::ServerContext;
pub use error::{Rejection, RequestError, ServerError, UpkeepError};
pub use feed::{run_append_feed, spawn_append_feed};
pub use registry::{LiveEntry, SyncId, SyncRegistry};
pub use storage::{ChaoticStorage, MemoryStorage, Storage, StorageError};
pub use system_env::SystemEnv;
use threadsync_core::{Board, Environment};
use tokio_util::sync::CancellationToken;
pub use transport::{WsTransport, serve_websocket};
pub use upkeep::{Pass, PassReport, Upkeep};

/// Production threadsync server.
///
/// In-memory store, system environment, WebSocket transport.
pub struct Server {
    ctx: ServerContext<MemoryStorage, SystemEnv>,
    upkeep: UpkeepConfig,
    transport: WsTransport,
}

impl Server {
    /// Create the configured boards and bind the listener.
    pub async fn bind(config: ServerRuntimeConfig) -> Result<Self, ServerError> {
        if config.boards.is_empty() {
            return Err(ServerError::Config("no boards configured".to_string()));
        }

        let env = SystemEnv::new();
        let storage = MemoryStorage::new();
        let created = env.wall_clock_secs();
        for board in &config.boards {
            storage.create_board(&Board { id: board.id.clone(), created })?;
        }

        let boards = StaticBoards::from(config.boards.as_slice());
        let ctx = ServerContext::new(storage, env, boards).with_posting(config.posting);
        let transport = WsTransport::bind(&config.bind_address).await?;

        Ok(Self { ctx, upkeep: config.upkeep, transport })
    }

    /// Run until `shutdown` fires: accept connections, fan out appends and
    /// run the upkeep passes.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ServerError> {
        tracing::info!("Server starting on {}", self.transport.local_addr()?);

        let feed = spawn_append_feed(&self.ctx.storage, self.ctx.registry.clone(), shutdown.clone());
        let upkeep = Upkeep::new(
            self.ctx.storage.clone(),
            self.ctx.env,
            self.ctx.images.clone(),
            self.upkeep,
        )
        .spawn(&shutdown);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = self.transport.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let ctx = self.ctx.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_websocket(stream, addr, ctx, shutdown).await {
                                tracing::debug!(%addr, error = %e, "connection error");
                            }
                        });
                    },
                    Err(e) => tracing::error!("Accept error: {}", e),
                },
            }
        }

        for task in upkeep {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "upkeep task panicked");
            }
        }
        match feed.await {
            Ok(forwarded) => tracing::info!(forwarded, "Server stopped"),
            Err(e) => tracing::error!(error = %e, "append feed panicked"),
        }
        Ok(())
    }

    /// Local address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.transport.local_addr()
    }

    /// Shared request context, e.g. to seed image tokens.
    pub fn context(&self) -> &ServerContext<MemoryStorage, SystemEnv> {
        &self.ctx
    }
}
