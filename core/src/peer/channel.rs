//! Peer channel — one negotiated TCP connection carrying many concurrent requests
//!
//! A single writer task serializes outgoing frames; a reader task matches
//! responses to waiters by `request_id` and hands inbound requests to the
//! local [`RequestHandler`], one task per request, at most
//! `max_inflight` at once across all channels sharing the semaphore. Every
//! pending entry is removed exactly once: by its response, by its caller's
//! timeout, or by teardown.
//!
//! Each side announces its object size limit in the hello. Frames are never
//! written above the peer's limit, and an inbound frame above the local limit
//! is drained and answered with `TooLarge` instead of closing the channel.

use super::PeerError;
use crate::identity::{EndpointId, ObjectId};
use crate::message::{
    decode_peer_frame, encode_peer_frame, read_frame_or_skip, write_frame, InboundFrame,
    Operation, PeerFrame, RequestEnvelope, ResponseEnvelope, SkippedFrame, FRAME_OVERHEAD,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Serves requests that arrive from peers
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, from: EndpointId, request: RequestEnvelope) -> ResponseEnvelope;
}

/// Which side dialed the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Size and concurrency limits a channel is opened with
#[derive(Debug, Clone)]
pub struct ChannelLimits {
    /// Largest object this endpoint accepts
    pub local_max_object: usize,
    /// Largest object the peer announced in its hello
    pub peer_max_object: usize,
    pub queue_depth: usize,
    /// Permits for inbound requests executing at once
    pub inflight: Arc<Semaphore>,
}

impl ChannelLimits {
    pub fn new(
        local_max_object: usize,
        peer_max_object: usize,
        queue_depth: usize,
        inflight: Arc<Semaphore>,
    ) -> Self {
        Self {
            local_max_object,
            peer_max_object,
            queue_depth,
            inflight,
        }
    }

    fn read_cap(&self) -> usize {
        self.local_max_object.saturating_add(FRAME_OVERHEAD)
    }

    fn write_cap(&self) -> usize {
        self.peer_max_object.saturating_add(FRAME_OVERHEAD)
    }
}

pub struct PeerChannel {
    channel_id: u64,
    peer_id: EndpointId,
    direction: Direction,
    local_max_object: usize,
    peer_max_object: usize,
    outbound: mpsc::Sender<PeerFrame>,
    pending: Mutex<HashMap<u64, oneshot::Sender<ResponseEnvelope>>>,
    next_request_id: AtomicU64,
    last_activity: Mutex<Instant>,
    closed: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerChannel {
    /// Take over an established (post-hello) stream and start its tasks
    pub fn spawn(
        channel_id: u64,
        peer_id: EndpointId,
        direction: Direction,
        stream: TcpStream,
        handler: Arc<dyn RequestHandler>,
        limits: ChannelLimits,
    ) -> Arc<Self> {
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::channel(limits.queue_depth.max(1));
        let (closed, _) = watch::channel(false);

        let channel = Arc::new(Self {
            channel_id,
            peer_id,
            direction,
            local_max_object: limits.local_max_object,
            peer_max_object: limits.peer_max_object,
            outbound,
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            last_activity: Mutex::new(Instant::now()),
            closed,
            tasks: Mutex::new(Vec::new()),
        });

        let writer_task =
            tokio::spawn(Arc::clone(&channel).run_writer(writer, outbound_rx, limits.write_cap()));
        let reader_task = tokio::spawn(Arc::clone(&channel).run_reader(
            reader,
            handler,
            limits.read_cap(),
            limits.inflight,
        ));
        channel.tasks.lock().extend([writer_task, reader_task]);
        // A stream that died instantly may have closed before the handles were stored
        if channel.is_closed() {
            for task in channel.tasks.lock().drain(..) {
                task.abort();
            }
        }
        channel
    }

    pub fn channel_id(&self) -> u64 {
        self.channel_id
    }

    pub fn peer_id(&self) -> EndpointId {
        self.peer_id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Largest object the peer accepts
    pub fn peer_max_object(&self) -> usize {
        self.peer_max_object
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the channel is closed
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Time since the last frame in either direction
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Send one request and wait for its response, at most `timeout`
    pub async fn request(
        &self,
        operation: Operation,
        object_id: ObjectId,
        payload: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<ResponseEnvelope, PeerError> {
        if self.is_closed() {
            return Err(PeerError::ConnectionClosed);
        }
        if let Some(size) = payload.as_ref().map(Vec::len) {
            if size > self.peer_max_object {
                return Err(PeerError::TooLarge {
                    size,
                    max: self.peer_max_object,
                });
            }
        }
        let deadline = tokio::time::Instant::now() + timeout;
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id, tx);
        // Teardown may have drained the map between the check and the insert
        if self.is_closed() {
            self.pending.lock().remove(&request_id);
            return Err(PeerError::ConnectionClosed);
        }
        self.touch();

        let request = RequestEnvelope {
            request_id,
            operation,
            object_id,
            payload,
            deadline_ms: timeout.as_millis() as u64,
        };
        match tokio::time::timeout_at(deadline, self.outbound.send(PeerFrame::Request(request))).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                self.pending.lock().remove(&request_id);
                return Err(PeerError::ConnectionClosed);
            }
            Err(_) => {
                self.pending.lock().remove(&request_id);
                return Err(PeerError::Timeout);
            }
        }

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(response)) => Ok(response),
            // Sender dropped by teardown, which already removed the entry
            Ok(Err(_)) => Err(PeerError::ConnectionClosed),
            Err(_) => {
                if self.pending.lock().remove(&request_id).is_some() {
                    debug!(
                        "Request {} to {} timed out; a late response will be dropped",
                        request_id,
                        self.peer_id.short()
                    );
                }
                Err(PeerError::Timeout)
            }
        }
    }

    /// Close the channel and fail every pending request with `ConnectionClosed`
    pub fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        let pending = std::mem::take(&mut *self.pending.lock());
        if !pending.is_empty() {
            debug!(
                "Channel {} to {} closed with {} pending requests",
                self.channel_id,
                self.peer_id.short(),
                pending.len()
            );
        }
        drop(pending);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn complete(&self, response: ResponseEnvelope) {
        let waiter = self.pending.lock().remove(&response.request_id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => debug!(
                "Dropping response {} from {}: no longer awaited",
                response.request_id,
                self.peer_id.short()
            ),
        }
    }

    async fn run_writer(
        self: Arc<Self>,
        mut writer: OwnedWriteHalf,
        mut outbound: mpsc::Receiver<PeerFrame>,
        max_frame: usize,
    ) {
        while let Some(frame) = outbound.recv().await {
            let result = match encode_peer_frame(&frame) {
                Ok(bytes) => write_frame(&mut writer, &bytes, max_frame).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                debug!("Write to {} failed: {}", self.peer_id.short(), e);
                break;
            }
            self.touch();
        }
        self.close();
    }

    async fn run_reader(
        self: Arc<Self>,
        mut reader: OwnedReadHalf,
        handler: Arc<dyn RequestHandler>,
        max_frame: usize,
        inflight: Arc<Semaphore>,
    ) {
        loop {
            let bytes = match read_frame_or_skip(&mut reader, max_frame).await {
                Ok(InboundFrame::Body(bytes)) => bytes,
                Ok(InboundFrame::Skipped(skipped)) => {
                    self.touch();
                    if !self.reject_oversized(skipped).await {
                        break;
                    }
                    continue;
                }
                Err(e) if e.is_eof() => {
                    debug!("Peer {} closed channel {}", self.peer_id.short(), self.channel_id);
                    break;
                }
                Err(e) => {
                    warn!("Read from {} failed: {}", self.peer_id.short(), e);
                    break;
                }
            };
            self.touch();

            match decode_peer_frame(&bytes) {
                Ok(PeerFrame::Response(response)) => self.complete(response),
                Ok(PeerFrame::Request(request)) => {
                    let received_at = Instant::now();
                    // Waiting here stops reading, which pushes back on the peer
                    let permit = match Arc::clone(&inflight).acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };
                    self.dispatch(request, received_at, permit, Arc::clone(&handler));
                }
                Ok(other) => {
                    warn!(
                        "Unexpected {} on established channel from {}",
                        other.frame_type(),
                        self.peer_id.short()
                    );
                    break;
                }
                Err(e) => {
                    warn!("Undecodable frame from {}: {}", self.peer_id.short(), e);
                    break;
                }
            }
        }
        self.close();
    }

    /// Answer a frame that exceeded the local limit. Returns false when the
    /// channel should close.
    async fn reject_oversized(&self, skipped: SkippedFrame) -> bool {
        let limit = self.local_max_object as u64;
        match skipped {
            SkippedFrame::Request { request_id, len } => {
                warn!(
                    "Request {} from {} is {} bytes, above the limit of {}",
                    request_id,
                    self.peer_id.short(),
                    len,
                    limit
                );
                let response = ResponseEnvelope::too_large(request_id, None, limit);
                self.outbound.send(PeerFrame::Response(response)).await.is_ok()
            }
            SkippedFrame::Response { request_id, len } => {
                warn!(
                    "Response {} from {} is {} bytes, above the limit of {}",
                    request_id,
                    self.peer_id.short(),
                    len,
                    limit
                );
                // Frame length bounds the object size from above
                self.complete(ResponseEnvelope::too_large(request_id, Some(len as u64), limit));
                true
            }
            SkippedFrame::Other { len } => {
                warn!("Dropped {} byte frame from {}", len, self.peer_id.short());
                false
            }
        }
    }

    fn dispatch(
        &self,
        request: RequestEnvelope,
        received_at: Instant,
        permit: OwnedSemaphorePermit,
        handler: Arc<dyn RequestHandler>,
    ) {
        let outbound = self.outbound.clone();
        let peer_id = self.peer_id;
        let peer_max = self.peer_max_object;
        tokio::spawn(async move {
            let budget = Duration::from_millis(request.deadline_ms);
            let request_id = request.request_id;
            let mut response = if received_at.elapsed() >= budget {
                ResponseEnvelope::error(request_id, "deadline exceeded before execution")
            } else {
                handler.handle(peer_id, request).await
            };
            drop(permit);
            if let Some(size) = response.payload.as_ref().map(Vec::len) {
                if size > peer_max {
                    debug!(
                        "Response {} of {} bytes exceeds the limit of {} for {}",
                        request_id,
                        size,
                        peer_max,
                        peer_id.short()
                    );
                    response =
                        ResponseEnvelope::too_large(request_id, Some(size as u64), peer_max as u64);
                }
            }
            if outbound.send(PeerFrame::Response(response)).await.is_err() {
                debug!("Response to {} dropped: channel closed", peer_id.short());
            }
        });
    }
}

impl Drop for PeerChannel {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for PeerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerChannel")
            .field("channel_id", &self.channel_id)
            .field("peer_id", &self.peer_id)
            .field("direction", &self.direction)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
