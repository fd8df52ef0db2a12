//! Threadsync server binary.
//!
//! # Usage
//!
//! ```bash
//! # Single text-only board "a" on the default port
//! threadsync-server
//!
//! # Several boards, one of them read-only
//! threadsync-server --bind 0.0.0.0:8000 --board a --board g --read-only-board news
//! ```

use clap::Parser;
use threadsync_server::{BoardSettings, PostingConfig, Server, ServerRuntimeConfig};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Discussion thread synchronisation server
#[derive(Parser, Debug)]
#[command(name = "threadsync-server")]
#[command(about = "Real-time discussion thread synchronisation server")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:8000")]
    bind: String,

    /// Writable board accepting images (repeatable)
    #[arg(long = "board")]
    boards: Vec<String>,

    /// Board that refuses new posts (repeatable)
    #[arg(long = "read-only-board")]
    read_only_boards: Vec<String>,

    /// Board whose posts never carry images (repeatable)
    #[arg(long = "text-only-board")]
    text_only_boards: Vec<String>,

    /// Replies after which a thread stops bumping
    #[arg(long, default_value = "1000")]
    max_bump: u64,

    /// Maximum post body length in chars
    #[arg(long, default_value = "2000")]
    max_body_len: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn board_settings(&self) -> Vec<BoardSettings> {
        let writable = self.boards.iter().map(BoardSettings::new);
        let read_only = self
            .read_only_boards
            .iter()
            .map(|id| BoardSettings { read_only: true, ..BoardSettings::new(id) });
        let text_only = self
            .text_only_boards
            .iter()
            .map(|id| BoardSettings { text_only: true, ..BoardSettings::new(id) });

        writable.chain(read_only).chain(text_only).collect()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("Threadsync server starting");
    tracing::info!("Binding to {}", args.bind);

    let mut config = ServerRuntimeConfig {
        bind_address: args.bind.clone(),
        posting: PostingConfig { max_bump: args.max_bump, max_body_len: args.max_body_len },
        ..Default::default()
    };
    let boards = args.board_settings();
    if !boards.is_empty() {
        config.boards = boards;
    }

    let server = Server::bind(config).await?;
    tracing::info!("Server listening on {}", server.local_addr()?);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        tracing::info!("Shutdown requested");
        signal.cancel();
    });

    server.run(shutdown).await?;

    Ok(())
}
