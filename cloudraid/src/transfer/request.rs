//! Per-connection request state.

use std::fmt;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::crypto::ChunkMacMap;
use crate::transport::{ExchangeState, HttpExchange, HttpRequest, HttpResponse, HttpTransport, TransportFailure};

use super::fileio::AsyncIoContext;
use super::policy::RequestFailure;
use super::speed::SpeedController;

/// Lifecycle of one connection's current request.
///
/// ```text
/// Ready ─► Prepared ─► InFlight ─► Success ─┬─► [Decrypting] ─► Decrypted ─► AsyncIo ─► Ready
///   │         ▲                      │      └─► Ready (upload)
///   │         └──────── Failure ◄────┘
///   ├─► PreparedButWaiting (upload gap cap) ─► Ready
///   ├─► Encrypting (upload) ─► Prepared
///   └─► Done
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqStatus {
    Ready,
    Prepared,
    PreparedButWaiting,
    Encrypting,
    InFlight,
    Success,
    Failure,
    Decrypting,
    Decrypted,
    AsyncIo,
    Done,
}

impl fmt::Display for ReqStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReqStatus::Ready => "ready",
            ReqStatus::Prepared => "prepared",
            ReqStatus::PreparedButWaiting => "waiting",
            ReqStatus::Encrypting => "encrypting",
            ReqStatus::InFlight => "in-flight",
            ReqStatus::Success => "success",
            ReqStatus::Failure => "failure",
            ReqStatus::Decrypting => "decrypting",
            ReqStatus::Decrypted => "decrypted",
            ReqStatus::AsyncIo => "async-io",
            ReqStatus::Done => "done",
        };
        f.write_str(name)
    }
}

/// One connection of a transfer slot.
pub(crate) struct ConnectionRequest {
    pub status: ReqStatus,
    /// Requested range: file positions for plain transfers, shard
    /// positions for raid downloads.
    pub pos: u64,
    pub npos: u64,
    pub url: String,
    /// Encrypted upload payload.
    pub body: Bytes,
    /// Chunk MACs of the upload payload, merged once the server accepts it.
    pub upload_macs: ChunkMacMap,
    pub exchange: Option<Box<dyn HttpExchange>>,
    pub response: Option<HttpResponse>,
    pub failure: Option<RequestFailure>,
    pub posted_at: Option<Instant>,
    /// Body bytes seen at the last poll.
    pub transferred: u64,
    /// Do not post before this instant.
    pub retry_after: Option<Instant>,
    pub io: Option<AsyncIoContext>,
    pub speed: SpeedController,
}

impl fmt::Debug for ConnectionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRequest")
            .field("status", &self.status)
            .field("pos", &self.pos)
            .field("npos", &self.npos)
            .field("url", &self.url)
            .field("in_flight", &self.exchange.is_some())
            .finish()
    }
}

impl ConnectionRequest {
    pub fn new() -> Self {
        Self {
            status: ReqStatus::Ready,
            pos: 0,
            npos: 0,
            url: String::new(),
            body: Bytes::new(),
            upload_macs: ChunkMacMap::new(),
            exchange: None,
            response: None,
            failure: None,
            posted_at: None,
            transferred: 0,
            retry_after: None,
            io: None,
            speed: SpeedController::new(),
        }
    }

    /// Record a prepared range.
    pub fn prepare(&mut self, url: String, pos: u64, npos: u64, body: Bytes) {
        self.url = url;
        self.pos = pos;
        self.npos = npos;
        self.body = body;
        self.response = None;
        self.failure = None;
        self.status = ReqStatus::Prepared;
    }

    /// Bytes the request expects to move.
    pub fn size(&self) -> u64 {
        self.npos - self.pos
    }

    pub fn can_post(&self, now: Instant) -> bool {
        self.retry_after.map_or(true, |at| now >= at)
    }

    pub fn post(&mut self, transport: &dyn HttpTransport, now: Instant) {
        let request = if self.body.is_empty() {
            HttpRequest::download(self.url.clone())
        } else {
            HttpRequest::upload(self.url.clone(), self.body.clone())
        };
        self.exchange = Some(transport.post(request));
        self.posted_at = Some(now);
        self.transferred = 0;
        self.retry_after = None;
        self.speed.start(now);
        self.status = ReqStatus::InFlight;
    }

    /// Poll the exchange. Returns the newly transferred byte count and the
    /// exchange's state.
    pub fn poll(&mut self) -> (u64, ExchangeState) {
        let Some(exchange) = self.exchange.as_mut() else {
            return (0, ExchangeState::Failed(TransportFailure::Connection("not posted".to_string())));
        };
        let state = exchange.poll();
        let transferred = exchange.transferred();
        let delta = transferred.saturating_sub(self.transferred);
        self.transferred = transferred;
        if !matches!(state, ExchangeState::Pending) {
            self.exchange = None;
        }
        (delta, state)
    }

    pub fn headers_received(&self) -> bool {
        self.exchange.as_ref().is_some_and(|e| e.headers_received())
    }

    /// Time since the request was posted.
    pub fn in_flight_for(&self, now: Instant) -> Duration {
        self.posted_at.map_or(Duration::ZERO, |at| now.saturating_duration_since(at))
    }

    /// Abandon any exchange in progress.
    pub fn disconnect(&mut self) {
        if let Some(mut exchange) = self.exchange.take() {
            exchange.cancel();
        }
        self.posted_at = None;
        self.transferred = 0;
    }

    /// Back to square one (used when a raid shard is repurposed).
    pub fn reset(&mut self) {
        self.disconnect();
        self.response = None;
        self.failure = None;
        self.body = Bytes::new();
        self.upload_macs.clear();
        self.retry_after = None;
        self.speed.reset();
        self.status = ReqStatus::Ready;
    }

    pub fn is_in_flight(&self) -> bool {
        self.status == ReqStatus::InFlight
    }
}
