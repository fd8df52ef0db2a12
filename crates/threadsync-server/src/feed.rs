//! Append feed: fans every committed log entry out to its subscribers.
//!
//! Writers never broadcast themselves. The store publishes each append in
//! commit order and this task hands it to the registry, so entries written
//! by the allocator, by splices and closes, or by the upkeep scheduler all
//! reach live connections the same way.

use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    registry::SyncRegistry,
    storage::{LogAppended, Storage},
};

/// Forward appends to the registry until cancelled or the store goes away.
///
/// Returns the number of entries forwarded.
pub async fn run_append_feed(
    mut appends: mpsc::UnboundedReceiver<LogAppended>,
    registry: SyncRegistry,
    shutdown: CancellationToken,
) -> u64 {
    let mut forwarded = 0;

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            appended = appends.recv() => {
                let Some(LogAppended { thread, index, entry }) = appended else {
                    tracing::warn!("append feed closed by store");
                    break;
                };
                let delivered = registry.broadcast(thread, index, &entry);
                tracing::trace!(thread, index, delivered, "entry fanned out");
                forwarded += 1;
            }
        }
    }

    tracing::debug!(forwarded, "append feed stopped");
    forwarded
}

/// Subscribe to `storage` and run the feed on a new task.
pub fn spawn_append_feed<S: Storage>(
    storage: &S,
    registry: SyncRegistry,
    shutdown: CancellationToken,
) -> JoinHandle<u64> {
    let appends = storage.watch_appends();
    tokio::spawn(run_append_feed(appends, registry, shutdown))
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::registry::SyncId;

    #[tokio::test]
    async fn forwards_until_sender_closes() {
        let registry = SyncRegistry::new();
        let (conn, mut live) = registry.register();
        registry.subscribe(conn, SyncId::thread("a", 1));

        let (tx, rx) = mpsc::unbounded_channel();
        for index in 0..3 {
            tx.send(LogAppended { thread: 1, index, entry: Bytes::from_static(b"x") }).unwrap();
        }
        drop(tx);

        let forwarded = run_append_feed(rx, registry, CancellationToken::new()).await;
        assert_eq!(forwarded, 3);

        for index in 0..3 {
            assert_eq!(live.recv().await.unwrap().index, index);
        }
    }

    #[tokio::test]
    async fn stops_on_cancellation() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        assert_eq!(run_append_feed(rx, SyncRegistry::new(), shutdown).await, 0);
    }
}
