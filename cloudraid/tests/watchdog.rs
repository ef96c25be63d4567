//! Stall watchdog integration tests.
//!
//! Time is driven by a `ManualClock`, so a 60 second silence is simulated by
//! advancing the clock between ticks.
//!
//! Run with: `cargo test --test watchdog`

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cloudraid::config::TransferConfig;
use cloudraid::error::TransferError;
use cloudraid::transfer::{
    Completion, MemoryAsyncMode, MemoryFile, ReqStatus, SlotFailure, SlotStatus, Transfer, TransferSlot,
};
use cloudraid::transport::HttpResponse;

use common::{
    context, encrypt_file, meta_mac, parse_range, payload, raid_urls, run_to_end, shard_of, shard_server,
    MockTransport, Reply, IV, KEY,
};

const SIZE: usize = 1000;
const URL: &str = "http://gfs.example.net/dl/single";

fn config() -> TransferConfig {
    TransferConfig::default().with_download_connections(1)
}

/// Shard servers where the first request to `silent_shard` never even
/// returns headers.
fn silent_shard_transport(cipher_text: &[u8], silent_shard: usize) -> Arc<MockTransport> {
    let serve = shard_server(cipher_text);
    let silenced = AtomicBool::new(false);
    MockTransport::new(move |request| {
        if shard_of(&request.url) == silent_shard && !silenced.swap(true, Ordering::SeqCst) {
            return Reply::Silent;
        }
        serve(request)
    })
}

// ============================================================================
// Tests
// ============================================================================

/// A request that stops delivering is cancelled and re-posted on the
/// alternate port, and the transfer then completes.
#[test]
fn test_stalled_request_is_reposted() {
    let plain = payload(SIZE, 3);
    let (cipher_text, macs) = encrypt_file(&plain);
    let stalled = Arc::new(AtomicBool::new(false));
    let first = Arc::clone(&stalled);
    let transport = MockTransport::new(move |request| {
        if !first.swap(true, Ordering::SeqCst) {
            return Reply::Never;
        }
        let (_, start, end) = parse_range(&request.url);
        Reply::Now(HttpResponse::ok(cipher_text[start..=end].to_vec()))
    });
    let (ctx, clock) = context(Arc::clone(&transport), config());

    let file = MemoryFile::new();
    let mut transfer = Transfer::download(SIZE as u64, KEY, IV, Some(meta_mac(&macs)), vec![URL.to_string()]);
    let mut slot = TransferSlot::new(&mut transfer, &ctx, Box::new(file.clone())).unwrap();

    for _ in 0..5 {
        assert!(!slot.doio().is_terminal());
    }
    assert_eq!(slot.connection_status(0), Some(ReqStatus::InFlight));

    clock.advance(Duration::from_secs(61));
    assert!(!slot.doio().is_terminal());

    let status = run_to_end(&mut slot);
    assert!(matches!(status, SlotStatus::Complete(Completion::Download { repaired: false, .. })));
    drop(slot);

    assert_eq!(file.contents(), plain);
    assert_eq!(transport.cancelled(), 1);
    let urls = transport.urls();
    assert_eq!(urls.len(), 2);
    assert_eq!(urls[0], format!("{}/0-999", URL));
    assert_eq!(urls[1], "http://gfs.example.net:8080/dl/single/0-999");
}

/// With the alternate port disabled the reposted URL is unchanged.
#[test]
fn test_stalled_request_keeps_url_without_alt_port() {
    let plain = payload(SIZE, 4);
    let (cipher_text, macs) = encrypt_file(&plain);
    let stalled = Arc::new(AtomicBool::new(false));
    let first = Arc::clone(&stalled);
    let transport = MockTransport::new(move |request| {
        if !first.swap(true, Ordering::SeqCst) {
            return Reply::Never;
        }
        let (_, start, end) = parse_range(&request.url);
        Reply::Now(HttpResponse::ok(cipher_text[start..=end].to_vec()))
    });
    let (ctx, clock) = context(Arc::clone(&transport), config().with_auto_alt_port(false));

    let file = MemoryFile::new();
    let mut transfer = Transfer::download(SIZE as u64, KEY, IV, Some(meta_mac(&macs)), vec![URL.to_string()]);
    let mut slot = TransferSlot::new(&mut transfer, &ctx, Box::new(file.clone())).unwrap();

    slot.doio();
    clock.advance(Duration::from_secs(61));
    assert!(matches!(run_to_end(&mut slot), SlotStatus::Complete(_)));
    drop(slot);

    let urls = transport.urls();
    assert_eq!(urls.len(), 2);
    assert_eq!(urls[0], urls[1]);
    assert!(!ctx.alt_port());
}

/// Silence with nothing in flight fails the transfer with a retryable
/// error; output already decrypted is still written when the slot drops.
#[test]
fn test_stall_without_requests_fails_with_again() {
    let plain = payload(SIZE, 9);
    let (cipher_text, macs) = encrypt_file(&plain);
    let transport = MockTransport::new(move |request| {
        let (_, start, end) = parse_range(&request.url);
        Reply::Now(HttpResponse::ok(cipher_text[start..=end].to_vec()))
    });
    let (ctx, clock) = context(Arc::clone(&transport), config());

    let file = MemoryFile::new().with_async_mode(MemoryAsyncMode::StallWrites);
    let mut transfer = Transfer::download(SIZE as u64, KEY, IV, Some(meta_mac(&macs)), vec![URL.to_string()]);
    let mut slot = TransferSlot::new(&mut transfer, &ctx, Box::new(file.clone())).unwrap();

    let mut waited = 0;
    while slot.connection_status(0) != Some(ReqStatus::AsyncIo) {
        assert!(!slot.doio().is_terminal());
        std::thread::sleep(Duration::from_millis(1));
        waited += 1;
        assert!(waited < 5000, "write never started");
    }

    clock.advance(Duration::from_secs(61));
    assert_eq!(
        slot.doio(),
        SlotStatus::Failed(SlotFailure {
            error: TransferError::Again,
            backoff: None
        })
    );
    assert_eq!(slot.transfer().progress_completed, 0);
    drop(slot);

    assert_eq!(file.contents(), plain);
    assert_eq!(transfer.progress_completed, SIZE as u64);
    assert!(transfer.chunkmacs.is_finished(0));
    assert_eq!(transport.urls().len(), 1);
}

// ============================================================================
// Raid
// ============================================================================

/// A raid shard without headers for 30 seconds is replaced by parity; until
/// then nothing changes.
#[test]
fn test_raid_header_timeout_switches_to_parity() {
    let plain = payload(300_017, 41);
    let (cipher_text, macs) = encrypt_file(&plain);
    let transport = silent_shard_transport(&cipher_text, 2);
    let (ctx, clock) = context(Arc::clone(&transport), TransferConfig::default());

    let file = MemoryFile::new();
    let mut transfer = Transfer::download(plain.len() as u64, KEY, IV, Some(meta_mac(&macs)), raid_urls());
    let mut slot = TransferSlot::new(&mut transfer, &ctx, Box::new(file.clone())).unwrap();

    for _ in 0..5 {
        assert!(!slot.doio().is_terminal());
    }
    clock.advance(Duration::from_secs(29));
    assert!(!slot.doio().is_terminal());
    assert_eq!(slot.connection_status(2), Some(ReqStatus::InFlight));
    assert_eq!(slot.unused_raid_connection(), Some(0));

    clock.advance(Duration::from_secs(2));
    assert!(!slot.doio().is_terminal());
    assert_eq!(slot.unused_raid_connection(), Some(2));

    let status = run_to_end(&mut slot);
    assert!(matches!(status, SlotStatus::Complete(Completion::Download { repaired: false, .. })));
    drop(slot);

    assert_eq!(file.contents(), plain);
    assert_eq!(transport.cancelled(), 1);
    assert_eq!(ctx.faulty_servers().len(), 1);
}

/// A header timeout noticed only after a full watchdog period still
/// recovers: the recovery itself counts as progress, so the watchdog does
/// not fire on the freshly reactivated parity shard.
#[test]
fn test_raid_recovery_after_long_silence_is_not_a_stall() {
    let plain = payload(300_017, 42);
    let (cipher_text, macs) = encrypt_file(&plain);
    let transport = silent_shard_transport(&cipher_text, 2);
    let (ctx, clock) = context(Arc::clone(&transport), TransferConfig::default());

    let file = MemoryFile::new();
    let mut transfer = Transfer::download(plain.len() as u64, KEY, IV, Some(meta_mac(&macs)), raid_urls());
    let mut slot = TransferSlot::new(&mut transfer, &ctx, Box::new(file.clone())).unwrap();

    for _ in 0..5 {
        assert!(!slot.doio().is_terminal());
    }
    assert_eq!(slot.connection_status(2), Some(ReqStatus::InFlight));

    clock.advance(Duration::from_secs(61));
    assert!(!slot.doio().is_terminal());
    assert_eq!(slot.unused_raid_connection(), Some(2));
    assert!(!ctx.alt_port());

    let status = run_to_end(&mut slot);
    assert!(matches!(status, SlotStatus::Complete(Completion::Download { repaired: false, .. })));
    drop(slot);

    assert_eq!(file.contents(), plain);
    assert_eq!(transport.cancelled(), 1);
    // nothing was reposted on the alternate port
    assert!(transport.urls().iter().all(|u| !u.contains(":8080")));
}
