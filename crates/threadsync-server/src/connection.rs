//! Per-connection task.
//!
//! One task per client waits on three sources at once: the next inbound
//! frame, the next live entry routed by the registry, and cancellation.
//! Requests are handled one at a time, in arrival order, against the
//! connection's own [`Client`] state. The task is transport-agnostic: the
//! WebSocket runtime and the test harness both drive it over channels.

use std::net::IpAddr;

use bytes::Bytes;
use threadsync_core::Environment;
use threadsync_proto::{MessageType, Request, encode_message};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    client::Client,
    context::ServerContext,
    creation,
    error::{Rejection, RequestError},
    registry::LiveEntry,
    storage::{Storage, StorageError},
    sync::{self, Delivery},
};

/// Log reads attempted before a feed gap is reported to the client.
const GAP_FILL_ATTEMPTS: u32 = 3;

/// The outbound side went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Disconnected;

struct Connection<S: Storage, E: Environment> {
    ctx: ServerContext<S, E>,
    client: Client,
    outbound: mpsc::UnboundedSender<Bytes>,
}

/// Serve one client until it disconnects or `cancel` fires.
///
/// Frames from `inbound` are decoded and handled in order; everything the
/// client should see (responses, errors, backlog and live entries) is sent
/// on `outbound`. On exit the client's open post is closed and the
/// connection leaves the registry.
pub async fn run_connection<S: Storage, E: Environment>(
    ctx: ServerContext<S, E>,
    ip: Option<IpAddr>,
    mut inbound: mpsc::Receiver<Bytes>,
    outbound: mpsc::UnboundedSender<Bytes>,
    cancel: CancellationToken,
) {
    let (id, mut live) = ctx.registry.register();
    let mut conn = Connection { ctx, client: Client::new(id, ip), outbound };
    tracing::debug!(connection = id, ip = ?ip, "connection opened");

    loop {
        let step = tokio::select! {
            () = cancel.cancelled() => break,
            frame = inbound.recv() => match frame {
                Some(frame) => conn.handle_frame(&frame),
                None => break,
            },
            Some(entry) = live.recv() => conn.deliver_live(entry),
        };
        if step.is_err() {
            break;
        }
    }

    conn.shutdown();
}

impl<S: Storage, E: Environment> Connection<S, E> {
    fn send(&self, frame: Bytes) -> Result<(), Disconnected> {
        self.outbound.send(frame).map_err(|_| Disconnected)
    }

    fn handle_frame(&mut self, frame: &[u8]) -> Result<(), Disconnected> {
        let request = match Request::decode(frame) {
            Ok(request) => request,
            Err(e) => return self.report(None, &Rejection::Malformed(e).into()),
        };

        let ty = request.message_type();
        match self.dispatch(request) {
            Ok(frames) => frames.into_iter().try_for_each(|frame| self.send(frame)),
            Err(e) => self.report(Some(ty), &e),
        }
    }

    /// Handle one request, returning the frames to send back.
    fn dispatch(&mut self, request: Request) -> Result<Vec<Bytes>, RequestError> {
        let ctx = &self.ctx;
        let client = &mut self.client;

        match request {
            Request::Synchronise(req) => {
                let backlog = sync::synchronise(ctx, client, &req)?;
                let ack = encode_message(MessageType::Synchronise, &client.id)?;
                Ok(std::iter::once(ack).chain(backlog).collect())
            },
            Request::InsertThread(req) => {
                let response = creation::insert_thread(ctx, client, &req)?;
                Ok(vec![encode_message(MessageType::InsertThread, &response)?])
            },
            Request::InsertPost(req) => {
                creation::insert_post(ctx, client, &req)?;
                Ok(Vec::new())
            },
            Request::Splice(req) => {
                creation::splice(ctx, client, &req)?;
                Ok(Vec::new())
            },
            Request::ClosePost => {
                creation::close_post(ctx, client)?;
                Ok(Vec::new())
            },
        }
    }

    /// Send an error report. The connection stays usable.
    fn report(&self, ty: Option<MessageType>, err: &RequestError) -> Result<(), Disconnected> {
        let id = self.client.id;
        match err {
            RequestError::Rejected(rejection) => {
                tracing::debug!(connection = id, request = ?ty, %rejection, "request rejected");
            },
            _ => tracing::warn!(connection = id, request = ?ty, error = %err, "request failed"),
        }

        match encode_message(MessageType::Invalid, &err.to_payload()) {
            Ok(frame) => self.send(frame),
            Err(e) => {
                tracing::error!(connection = id, error = %e, "failed to encode error report");
                Ok(())
            },
        }
    }

    /// Forward a live entry through the feed cursor.
    fn deliver_live(&mut self, entry: LiveEntry) -> Result<(), Disconnected> {
        let Some(mut cursor) = self.client.cursor else {
            return Ok(());
        };

        match cursor.accept(&entry) {
            Delivery::Stale => return Ok(()),
            Delivery::Deliver => {
                cursor.advance(1);
                self.client.cursor = Some(cursor);
                return self.send(entry.entry);
            },
            Delivery::Gap { from } => {
                tracing::debug!(
                    connection = self.client.id,
                    thread = cursor.thread,
                    from,
                    to = entry.index,
                    "filling feed gap"
                );
                let missing = match self.fill_gap(cursor.thread, from) {
                    Ok(missing) => missing,
                    Err(e) => {
                        // Cursor stays put; the next live entry fills from `from` again.
                        return self.report(None, &e.into());
                    },
                };
                cursor.advance(missing.len() as u64);
                self.client.cursor = Some(cursor);
                missing.into_iter().try_for_each(|frame| self.send(frame))
            },
        }
    }

    /// Load the missed log suffix, retrying transient store failures.
    ///
    /// The gap includes the entry that revealed it, so giving up here
    /// would leave the client behind until some later append.
    fn fill_gap(&self, thread: u64, from: u64) -> Result<Vec<Bytes>, StorageError> {
        let mut attempt = 1;
        loop {
            match self.ctx.storage.load_log(thread, from) {
                Ok(missing) => return Ok(missing),
                Err(e) if attempt < GAP_FILL_ATTEMPTS => {
                    tracing::debug!(
                        connection = self.client.id,
                        attempt,
                        error = %e,
                        "gap fill failed, retrying"
                    );
                    attempt += 1;
                },
                Err(e) => return Err(e),
            }
        }
    }

    fn shutdown(mut self) {
        let id = self.client.id;
        if let Err(e) = creation::close_previous_post(&self.ctx, &mut self.client) {
            tracing::warn!(connection = id, error = %e, "failed to close open post on disconnect");
        }
        self.ctx.registry.detach(id);
        tracing::debug!(connection = id, "connection closed");
    }
}
