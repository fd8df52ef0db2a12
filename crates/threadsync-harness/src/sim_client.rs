//! Scripted client driving one connection task over channels.

#![allow(clippy::expect_used, clippy::panic, reason = "Harness failures abort the test")]

use std::{net::IpAddr, time::Duration};

use bytes::Bytes;
use serde::Serialize;
use threadsync_core::Environment;
use threadsync_proto::{
    ErrorPayload, MessageType, ReplyCreationRequest, SpliceRequest, SyncRequest,
    ThreadCreationRequest, ThreadCreationResponse, decode_message, decode_payload, encode_message,
};
use threadsync_server::{ServerContext, Storage, run_connection};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::world::post_common;

/// How long [`SimClient::recv`] waits for a frame.
const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Quiet period after which [`SimClient::drain`] stops collecting.
const QUIET: Duration = Duration::from_millis(50);

/// Test client. Frames go straight into the connection task's channels; no
/// transport is involved.
pub struct SimClient {
    inbound: mpsc::Sender<Bytes>,
    outbound: mpsc::UnboundedReceiver<Bytes>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SimClient {
    /// Spawn a connection task for a client at `ip`.
    pub fn connect<S: Storage, E: Environment>(ctx: &ServerContext<S, E>, ip: IpAddr) -> Self {
        let (inbound, inbound_rx) = mpsc::channel(64);
        let (outbound_tx, outbound) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_connection(
            ctx.clone(),
            Some(ip),
            inbound_rx,
            outbound_tx,
            cancel.clone(),
        ));

        Self { inbound, outbound, cancel, task }
    }

    /// Send a raw frame.
    ///
    /// # Panics
    ///
    /// If the connection task has exited.
    pub async fn send(&self, frame: impl Into<Bytes>) {
        self.inbound.send(frame.into()).await.expect("connection task exited");
    }

    /// Encode and send a request.
    pub async fn request<T: Serialize + ?Sized>(&self, ty: MessageType, payload: &T) {
        let frame = encode_message(ty, payload).expect("request encodes");
        self.send(frame).await;
    }

    /// Request a feed subscription.
    pub async fn sync(&self, board: &str, thread: u64, ctr: i64) {
        let req = SyncRequest { board: board.to_string(), thread, ctr };
        self.request(MessageType::Synchronise, &req).await;
    }

    /// Request a feed subscription and consume its acknowledgment. Returns
    /// the backlog frames that follow the acknowledgment, waiting for
    /// exactly `backlog` of them.
    pub async fn sync_with_backlog(
        &mut self,
        board: &str,
        thread: u64,
        ctr: i64,
        backlog: usize,
    ) -> Vec<Bytes> {
        self.sync(board, thread, ctr).await;
        self.expect_type(MessageType::Synchronise).await;

        let mut frames = Vec::with_capacity(backlog);
        for _ in 0..backlog {
            frames.push(self.recv().await);
        }
        frames
    }

    /// Create a thread and return the decoded response.
    pub async fn create_thread(&mut self, req: &ThreadCreationRequest) -> ThreadCreationResponse {
        self.request(MessageType::InsertThread, req).await;
        let payload = self.expect_type(MessageType::InsertThread).await;
        decode_payload(&payload).expect("thread creation response decodes")
    }

    /// Send a reply creation request. Replies produce no direct response.
    pub async fn reply(&self, body: &str) {
        let req = ReplyCreationRequest { body: body.to_string(), common: post_common() };
        self.request(MessageType::InsertPost, &req).await;
    }

    /// Send a splice request.
    pub async fn splice(&self, start: usize, len: usize, text: &str) {
        let req = SpliceRequest { start, len, text: text.to_string() };
        self.request(MessageType::Splice, &req).await;
    }

    /// Send a close request for the open post.
    pub async fn close_post(&self) {
        self.send(Bytes::from_static(b"06")).await;
    }

    /// Next outbound frame.
    ///
    /// # Panics
    ///
    /// If nothing arrives within the receive timeout.
    pub async fn recv(&mut self) -> Bytes {
        match tokio::time::timeout(RECV_TIMEOUT, self.outbound.recv()).await {
            Ok(Some(frame)) => frame,
            Ok(None) => panic!("connection closed while waiting for a frame"),
            Err(_) => panic!("no frame within {RECV_TIMEOUT:?}"),
        }
    }

    /// Next outbound frame, which must have type `ty`. Returns its payload.
    pub async fn expect_type(&mut self, ty: MessageType) -> Bytes {
        let frame = self.recv().await;
        let (actual, payload) = decode_message(&frame).expect("server frames decode");
        assert_eq!(actual, ty, "unexpected frame {:?}", String::from_utf8_lossy(&frame));
        frame.slice(frame.len() - payload.len()..)
    }

    /// Next outbound frame, which must be an error report with `code`.
    pub async fn expect_error(&mut self, code: u16) -> ErrorPayload {
        let payload = self.expect_type(MessageType::Invalid).await;
        let error: ErrorPayload = decode_payload(&payload).expect("error payload decodes");
        assert_eq!(error.code, code, "unexpected error: {}", error.message);
        error
    }

    /// Collect frames until none arrive for a short quiet period.
    pub async fn drain(&mut self) -> Vec<Bytes> {
        let mut frames = Vec::new();
        while let Ok(Some(frame)) = tokio::time::timeout(QUIET, self.outbound.recv()).await {
            frames.push(frame);
        }
        frames
    }

    /// Disconnect and wait for the connection task to finish its cleanup.
    pub async fn disconnect(self) {
        self.cancel.cancel();
        drop(self.inbound);
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "connection task panicked");
        }
    }
}
