//! Shared fixtures for the transfer integration tests.
//!
//! [`MockTransport`] answers requests from a closure on the posting thread,
//! so a whole transfer runs deterministically inside `doio()` ticks.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};

use cloudraid::clock::ManualClock;
use cloudraid::config::TransferConfig;
use cloudraid::crypto::{ChunkMacMap, CryptDirection, CtrIv, MetaMac, TransferCipher, KEY_LENGTH};
use cloudraid::raid::{encode_shards, FilePiece, RAIDPARTS};
use cloudraid::transfer::{crypt_whole_chunks, SlotStatus, TransferContext, TransferSlot};
use cloudraid::transport::{ExchangeState, HttpExchange, HttpRequest, HttpResponse, HttpTransport};

pub const KEY: [u8; KEY_LENGTH] = [
    0x3c, 0x1f, 0x72, 0x05, 0x9e, 0xa4, 0x11, 0x60, 0xd2, 0x8b, 0x47, 0x39, 0x0e, 0xf5, 0x6a, 0xc8,
];
pub const IV: CtrIv = CtrIv([0x21, 0x43, 0x65, 0x87, 0xa9, 0xcb, 0xed, 0x0f]);

// ============================================================================
// Payloads
// ============================================================================

/// Deterministic pseudo-random file contents.
pub fn payload(size: usize, seed: u64) -> Vec<u8> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut data = vec![0u8; size];
    rng.fill(&mut data[..]);
    data
}

/// Encrypt a whole file, returning the ciphertext and its chunk MACs.
pub fn encrypt_file(plain: &[u8]) -> (Vec<u8>, ChunkMacMap) {
    let mut piece = FilePiece::from_vec(0, plain.to_vec());
    crypt_whole_chunks(
        &mut piece,
        &TransferCipher::new(&KEY),
        IV,
        plain.len() as u64,
        CryptDirection::Encrypt,
    );
    let data = piece.buf.data().map(<[u8]>::to_vec).unwrap_or_default();
    (data, piece.chunkmacs)
}

pub fn meta_mac(macs: &ChunkMacMap) -> MetaMac {
    macs.macsmac(&TransferCipher::new(&KEY))
}

/// Split `http://host/path/<start>-<end>` into the base URL and the
/// inclusive byte range.
pub fn parse_range(url: &str) -> (&str, usize, usize) {
    let (base, range) = url.rsplit_once('/').unwrap();
    let (start, end) = range.split_once('-').unwrap();
    (base, start.parse().unwrap(), end.parse().unwrap())
}

/// Raid shard URLs on six distinct hosts.
pub fn raid_urls() -> Vec<String> {
    (0..6).map(|i| format!("http://gfs{}.example.net/dl/raid", i)).collect()
}

/// Shard index encoded in a [`raid_urls`] URL.
pub fn shard_of(url: &str) -> usize {
    let host = url.trim_start_matches("http://gfs");
    host[..1].parse().unwrap()
}

/// The requested byte range of one of the six shards of `cipher_text`.
pub fn shard_range(shards: &[Vec<u8>; RAIDPARTS], url: &str) -> HttpResponse {
    let (_, start, end) = parse_range(url);
    HttpResponse::ok(shards[shard_of(url)][start..=end].to_vec())
}

/// Serves byte ranges of the six shards of `cipher_text`.
pub fn shard_server(cipher_text: &[u8]) -> impl Fn(&HttpRequest) -> Reply + Send + Sync {
    let shards: Arc<[Vec<u8>; RAIDPARTS]> = Arc::new(encode_shards(cipher_text));
    move |request| Reply::Now(shard_range(&shards, &request.url))
}

/// Bytes requested from one shard across all logged requests.
pub fn requested_bytes(transport: &MockTransport, shard: usize) -> usize {
    transport
        .urls()
        .iter()
        .filter(|url| shard_of(url) == shard)
        .map(|url| {
            let (_, start, end) = parse_range(url);
            end + 1 - start
        })
        .sum()
}

// ============================================================================
// Mock transport
// ============================================================================

/// How the mock answers one request.
pub enum Reply {
    /// Complete on the first poll with the whole body transferred.
    Now(HttpResponse),
    /// Complete on the first poll after moving `transferred` bytes.
    After { response: HttpResponse, transferred: u64 },
    /// Move `per_poll` body bytes on each poll; complete once all arrived.
    Trickle { response: HttpResponse, per_poll: u64 },
    /// Headers arrive but the body never does.
    Never,
    /// Nothing arrives, not even headers.
    Silent,
}

type Handler = dyn Fn(&HttpRequest) -> Reply + Send + Sync;

pub struct MockTransport {
    handler: Box<Handler>,
    log: Mutex<Vec<HttpRequest>>,
    cancelled: Arc<AtomicU32>,
}

impl MockTransport {
    pub fn new(handler: impl Fn(&HttpRequest) -> Reply + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            log: Mutex::new(Vec::new()),
            cancelled: Arc::new(AtomicU32::new(0)),
        })
    }

    /// Every request posted so far.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.log.lock().clone()
    }

    pub fn urls(&self) -> Vec<String> {
        self.log.lock().iter().map(|r| r.url.clone()).collect()
    }

    pub fn cancelled(&self) -> u32 {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl HttpTransport for MockTransport {
    fn post(&self, request: HttpRequest) -> Box<dyn HttpExchange> {
        let reply = (self.handler)(&request);
        self.log.lock().push(request);
        let (outcome, total, per_poll, headers) = match reply {
            Reply::Now(response) => {
                let len = response.body.len() as u64;
                (Some(ExchangeState::Complete(response)), len, u64::MAX, true)
            }
            Reply::After { response, transferred } => {
                (Some(ExchangeState::Complete(response)), transferred, u64::MAX, true)
            }
            Reply::Trickle { response, per_poll } => {
                let len = response.body.len() as u64;
                (Some(ExchangeState::Complete(response)), len, per_poll, true)
            }
            Reply::Never => (None, 0, 0, true),
            Reply::Silent => (None, 0, 0, false),
        };
        Box::new(MockExchange {
            outcome,
            total,
            per_poll,
            moved: 0,
            headers,
            cancelled: Arc::clone(&self.cancelled),
        })
    }
}

struct MockExchange {
    /// Final state, handed out once `moved` reaches `total`.
    outcome: Option<ExchangeState>,
    total: u64,
    per_poll: u64,
    moved: u64,
    headers: bool,
    cancelled: Arc<AtomicU32>,
}

impl HttpExchange for MockExchange {
    fn poll(&mut self) -> ExchangeState {
        if self.outcome.is_none() {
            return ExchangeState::Pending;
        }
        self.moved = self.moved.saturating_add(self.per_poll).min(self.total);
        if self.moved < self.total {
            return ExchangeState::Pending;
        }
        self.outcome.take().unwrap_or(ExchangeState::Pending)
    }

    fn transferred(&self) -> u64 {
        self.moved
    }

    fn headers_received(&self) -> bool {
        self.headers
    }

    fn cancel(&mut self) {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Slot helpers
// ============================================================================

/// A context over `transport` with a manual clock and one worker thread.
pub fn context(transport: Arc<MockTransport>, config: TransferConfig) -> (TransferContext, ManualClock) {
    let clock = ManualClock::new();
    let ctx = TransferContext::new(config.with_worker_threads(1), transport)
        .unwrap()
        .with_clock(Arc::new(clock.clone()));
    (ctx, clock)
}

/// Tick until the slot reaches a terminal status.
pub fn run_to_end(slot: &mut TransferSlot<'_>) -> SlotStatus {
    for _ in 0..20_000 {
        let status = slot.doio();
        if status.is_terminal() {
            return status;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    panic!("transfer did not finish: {:?}", slot);
}
