//! The per-transfer state machine.
//!
//! A [`TransferSlot`] drives every connection of one transfer. Each call to
//! [`TransferSlot::doio`] is one non-blocking tick: every connection advances
//! through its [`ReqStatus`] states as far as it can without waiting, worker
//! results are applied, and the watchdog, slow-shard check and completion
//! check run. Waiting is always expressed by leaving a connection in an
//! intermediate state for the next tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::clock::{Clock, SystemClock};
use crate::config::TransferConfig;
use crate::crypto::{file_key, find_late_gap_match, ChunkMacMap, CryptDirection, MetaMac};
use crate::error::{TransferError, TransferResult, SERVER_ERROR_KEY};
use crate::raid::{FaultyServers, FilePiece, RAIDPARTS};
use crate::transport::{with_alt_port, ExchangeState, HttpTransport, TransportFailure, STATUS_OK};

use super::buffer::{NextRange, TransferBufferManager};
use super::fileio::FileAccess;
use super::model::{Direction, NoopObserver, Transfer, TransferObserver, TransferProgress, UPLOAD_TOKEN_LEN};
use super::policy::{classify, FailureAction, RequestFailure, SlowShardDetector};
use super::request::{ConnectionRequest, ReqStatus};
use super::speed::SpeedController;
use super::worker::{crypt_whole_chunks, CryptoQueue, CryptoWorkers};

/// Upper bound on state transitions one connection makes per tick.
const MAX_TRANSITIONS_PER_TICK: usize = 16;

// =============================================================================
// Shared context
// =============================================================================

/// Process-wide collaborators shared by every slot.
pub struct TransferContext {
    pub config: TransferConfig,
    transport: Arc<dyn HttpTransport>,
    faulty_servers: Arc<FaultyServers>,
    workers: CryptoWorkers,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn TransferObserver>,
    alt_port: AtomicBool,
}

impl TransferContext {
    pub fn new(config: TransferConfig, transport: Arc<dyn HttpTransport>) -> TransferResult<Self> {
        let workers = CryptoWorkers::new(config.worker_threads)?;
        Ok(Self {
            config,
            transport,
            faulty_servers: Arc::new(FaultyServers::new()),
            workers,
            clock: Arc::new(SystemClock),
            observer: Arc::new(NoopObserver),
            alt_port: AtomicBool::new(false),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn TransferObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Share a failing-server registry with other contexts.
    pub fn with_faulty_servers(mut self, registry: Arc<FaultyServers>) -> Self {
        self.faulty_servers = registry;
        self
    }

    pub fn faulty_servers(&self) -> &Arc<FaultyServers> {
        &self.faulty_servers
    }

    /// Whether requests currently go to the alternate port.
    pub fn alt_port(&self) -> bool {
        self.alt_port.load(Ordering::Relaxed)
    }

    fn toggle_alt_port(&self) -> bool {
        !self.alt_port.fetch_xor(true, Ordering::Relaxed)
    }
}

impl std::fmt::Debug for TransferContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferContext")
            .field("config", &self.config)
            .field("alt_port", &self.alt_port())
            .finish()
    }
}

// =============================================================================
// Slot outcome
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Download {
        /// MAC of the delivered data.
        meta_mac: MetaMac,
        /// The recorded MAC only matched after skipping late gaps.
        repaired: bool,
    },
    Upload {
        token: Vec<u8>,
        file_key: [u8; 32],
    },
}

/// Terminal failure of a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotFailure {
    pub error: TransferError,
    /// Suggested wait before the transfer is retried.
    pub backoff: Option<Duration>,
}

impl SlotFailure {
    fn new(error: TransferError) -> Self {
        Self { error, backoff: None }
    }
}

/// Result of one [`TransferSlot::doio`] tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotStatus {
    /// Call again; `retry_in` is a hint when nothing can happen sooner.
    InProgress { retry_in: Option<Duration> },
    Complete(Completion),
    Failed(SlotFailure),
}

impl SlotStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SlotStatus::InProgress { .. })
    }
}

/// Whether a connection can make another transition this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Continue,
    Wait,
}

type StepResult = Result<Step, SlotFailure>;

// =============================================================================
// Slot
// =============================================================================

/// Drives one active transfer.
pub struct TransferSlot<'t> {
    transfer: &'t mut Transfer,
    ctx: &'t TransferContext,
    file: Box<dyn FileAccess>,
    buffers: TransferBufferManager,
    crypto: CryptoQueue,
    /// Running MAC state of chunks split across output pieces.
    serial_macs: ChunkMacMap,
    reqs: Vec<ConnectionRequest>,
    speed: SpeedController,
    last_data: Instant,
    last_progress_report: Instant,
    error_count: u32,
    last_error: TransferError,
    /// The one soft-failure cycle has been used since the last success.
    soft_failure: bool,
    slow_shards: SlowShardDetector,
    empty_upload_posted: bool,
    outcome: Option<SlotStatus>,
}

impl std::fmt::Debug for TransferSlot<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferSlot")
            .field("direction", &self.transfer.direction)
            .field("size", &self.transfer.size)
            .field("progress", &self.transfer.progress_completed)
            .field("reqs", &self.reqs)
            .finish()
    }
}

impl<'t> TransferSlot<'t> {
    /// Prepare a slot for `transfer`, restoring resumable progress.
    ///
    /// Raid downloads restart from the end of the finished chunk prefix;
    /// plain transfers drop partial chunks and skip finished ones.
    pub fn new(
        transfer: &'t mut Transfer,
        ctx: &'t TransferContext,
        file: Box<dyn FileAccess>,
    ) -> TransferResult<Self> {
        if transfer.temp_urls.is_empty() {
            return Err(TransferError::Setup("no temporary URL".to_string()));
        }

        let size = transfer.size;
        let cipher = transfer.cipher();
        let mut buffers = TransferBufferManager::new(
            Arc::clone(&ctx.faulty_servers),
            cipher.clone(),
            transfer.ctr_iv,
            &ctx.config,
        );

        let connections = match transfer.direction {
            Direction::Download => {
                let limit = transfer.deliver_limit();
                let resume = if transfer.temp_urls.len() == RAIDPARTS {
                    let resume = transfer.chunkmacs.contiguous_progress(size).min(limit);
                    transfer.chunkmacs.truncate_from(resume);
                    transfer.progress_completed = resume;
                    resume
                } else {
                    transfer.chunkmacs.discard_unfinished();
                    transfer.progress_completed = transfer.chunkmacs.processed_bytes(size);
                    0
                };
                buffers.set_is_raid(
                    transfer.temp_urls.clone(),
                    resume,
                    limit,
                    size,
                    ctx.config.all_shards,
                )?;
                if buffers.is_raid() {
                    RAIDPARTS
                } else {
                    ctx.config.download_connections.max(1)
                }
            }
            Direction::Upload => {
                if transfer.temp_urls.len() != 1 {
                    return Err(TransferError::Setup(format!(
                        "uploads take one URL, got {}",
                        transfer.temp_urls.len()
                    )));
                }
                transfer.chunkmacs.discard_unfinished();
                transfer.progress_completed = transfer.chunkmacs.processed_bytes(size);
                buffers.set_is_raid(transfer.temp_urls.clone(), 0, size, size, false)?;
                ctx.config.upload_connections.max(1)
            }
        };

        let now = ctx.clock.now();
        let mut speed = SpeedController::new();
        speed.start(now);

        tracing::info!(
            direction = ?transfer.direction,
            size,
            connections,
            raid = buffers.is_raid(),
            resume = transfer.progress_completed,
            "Transfer slot started"
        );

        Ok(Self {
            crypto: ctx.workers.queue(cipher, transfer.ctr_iv, size),
            transfer,
            ctx,
            file,
            buffers,
            serial_macs: ChunkMacMap::new(),
            reqs: (0..connections).map(|_| ConnectionRequest::new()).collect(),
            speed,
            last_data: now,
            last_progress_report: now,
            error_count: 0,
            last_error: TransferError::Failed,
            soft_failure: false,
            slow_shards: SlowShardDetector::new(ctx.config.max_slow_shard_swaps),
            empty_upload_posted: false,
            outcome: None,
        })
    }

    pub fn transfer(&self) -> &Transfer {
        self.transfer
    }

    pub fn connections(&self) -> usize {
        self.reqs.len()
    }

    pub fn connection_status(&self, connection: usize) -> Option<ReqStatus> {
        self.reqs.get(connection).map(|r| r.status)
    }

    pub fn is_raid(&self) -> bool {
        self.buffers.is_raid()
    }

    /// The raid shard currently rebuilt from parity instead of fetched.
    pub fn unused_raid_connection(&self) -> Option<usize> {
        if self.buffers.is_raid() {
            self.buffers.raid().unused_raid_connection()
        } else {
            None
        }
    }

    pub fn buffers(&self) -> &TransferBufferManager {
        &self.buffers
    }

    /// Advance the transfer by one non-blocking tick.
    ///
    /// Once a terminal status has been returned, later calls return it again.
    pub fn doio(&mut self) -> SlotStatus {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }

        let status = match self.tick() {
            Ok(Some(completion)) => SlotStatus::Complete(completion),
            Ok(None) => SlotStatus::InProgress {
                retry_in: self.retry_in(),
            },
            Err(failure) => SlotStatus::Failed(failure),
        };

        match &status {
            SlotStatus::Complete(completion) => {
                tracing::info!(size = self.transfer.size, ?completion, "Transfer complete");
                self.ctx.observer.on_persist(self.transfer);
            }
            SlotStatus::Failed(failure) => {
                tracing::warn!(error = %failure.error, backoff = ?failure.backoff, "Transfer failed");
                for req in &mut self.reqs {
                    req.disconnect();
                }
                self.ctx.observer.on_persist(self.transfer);
            }
            SlotStatus::InProgress { .. } => {}
        }
        if status.is_terminal() {
            self.outcome = Some(status.clone());
        }
        status
    }

    fn tick(&mut self) -> Result<Option<Completion>, SlotFailure> {
        let now = self.ctx.clock.now();

        if self.error_count > self.ctx.config.max_request_errors {
            tracing::warn!(errors = self.error_count, "Too many request errors");
            return Err(SlotFailure::new(self.last_error.clone()));
        }

        self.apply_crypto_results();

        for i in 0..self.reqs.len() {
            for _ in 0..MAX_TRANSITIONS_PER_TICK {
                if let Some(completion) = self.take_upload_completion(i)? {
                    return Ok(Some(completion));
                }
                if self.step(i, now)? == Step::Wait {
                    break;
                }
            }
        }

        self.check_slow_shards(now);
        self.report_progress(now);

        if self.transfer.direction == Direction::Download && self.download_finished() {
            return self.verify_download().map(Some);
        }

        self.check_watchdog(now)?;
        Ok(None)
    }

    fn step(&mut self, i: usize, now: Instant) -> StepResult {
        let download = self.transfer.direction == Direction::Download;
        let status = self.reqs[i].status;
        match status {
            ReqStatus::Ready if download => self.step_ready_download(i),
            ReqStatus::Ready => self.step_ready_upload(i, now),
            ReqStatus::PreparedButWaiting => self.step_upload_waiting(i, now),
            ReqStatus::Encrypting | ReqStatus::Decrypting => Ok(Step::Wait),
            ReqStatus::Prepared => Ok(self.step_prepared(i, now)),
            ReqStatus::InFlight => Ok(self.step_in_flight(i, now)),
            ReqStatus::Success if download => self.step_download_success(i, now),
            ReqStatus::Success => self.step_upload_success(i),
            ReqStatus::Failure => self.step_failure(i, now),
            ReqStatus::Decrypted => self.step_decrypted(i, now),
            ReqStatus::AsyncIo if download => self.step_write_io(i, now),
            ReqStatus::AsyncIo => self.step_read_io(i, now),
            ReqStatus::Done if download && self.buffers.output(i).is_some() => Ok(self.finalize_output(i)),
            ReqStatus::Done => Ok(Step::Wait),
        }
    }

    // =========================================================================
    // Range planning
    // =========================================================================

    fn base_url(&self, i: usize) -> Result<String, SlotFailure> {
        self.buffers
            .temp_url(i)
            .map(|url| with_alt_port(url, self.ctx.alt_port()))
            .ok_or_else(|| SlotFailure::new(TransferError::Internal(format!("no URL for connection {}", i))))
    }

    fn step_ready_download(&mut self, i: usize) -> StepResult {
        if self.buffers.output(i).is_some() {
            return Ok(self.finalize_output(i));
        }

        let range = self.buffers.next_download_range(
            i,
            &self.transfer.chunkmacs,
            self.transfer.progress_completed,
            self.reqs.len(),
        );
        match range {
            NextRange::Fetch { pos, npos } => {
                let url = format!("{}/{}-{}", self.base_url(i)?, pos, npos - 1);
                tracing::debug!(connection = i, pos, npos, "Requesting range");
                self.reqs[i].prepare(url, pos, npos, Bytes::new());
                Ok(Step::Continue)
            }
            NextRange::Supplied => Ok(Step::Continue),
            NextRange::Paused => Ok(Step::Wait),
            NextRange::Done => {
                self.reqs[i].status = ReqStatus::Done;
                Ok(Step::Continue)
            }
        }
    }

    fn step_ready_upload(&mut self, i: usize, now: Instant) -> StepResult {
        if self.transfer.size == 0 {
            if self.empty_upload_posted {
                self.reqs[i].status = ReqStatus::Done;
                return Ok(Step::Wait);
            }
            // a zero-byte upload still needs one request to obtain its token
            self.empty_upload_posted = true;
            let url = format!("{}/0", self.base_url(i)?);
            self.reqs[i].prepare(url, 0, 0, Bytes::new());
            return Ok(Step::Continue);
        }

        let speed = self.speed.speed(now);
        match self
            .buffers
            .next_upload_range(&self.transfer.chunkmacs, speed, self.reqs.len())
        {
            NextRange::Fetch { pos, npos } => {
                let url = format!("{}/{}", self.base_url(i)?, pos);
                let req = &mut self.reqs[i];
                req.url = url;
                req.pos = pos;
                req.npos = npos;
                req.status = ReqStatus::PreparedButWaiting;
                Ok(Step::Continue)
            }
            NextRange::Done => {
                self.reqs[i].status = ReqStatus::Done;
                Ok(Step::Wait)
            }
            NextRange::Supplied | NextRange::Paused => Ok(Step::Wait),
        }
    }

    /// Hold an upload range back while it is too far ahead of the earliest
    /// unacknowledged one, then read its data.
    fn step_upload_waiting(&mut self, i: usize, now: Instant) -> StepResult {
        if !self.reqs[i].can_post(now) {
            return Ok(Step::Wait);
        }

        let earliest = self
            .reqs
            .iter()
            .enumerate()
            .filter(|&(j, r)| {
                j != i
                    && matches!(
                        r.status,
                        ReqStatus::Encrypting
                            | ReqStatus::Prepared
                            | ReqStatus::InFlight
                            | ReqStatus::Success
                            | ReqStatus::Failure
                            | ReqStatus::AsyncIo
                    )
            })
            .map(|(_, r)| r.pos)
            .min();
        let npos = self.reqs[i].npos;
        if let Some(earliest) = earliest {
            if npos.saturating_sub(earliest) > self.ctx.config.max_upload_gap {
                return Ok(Step::Wait);
            }
        }

        let (pos, len) = (self.reqs[i].pos, self.reqs[i].size() as usize);
        if self.file.async_available() {
            self.reqs[i].io = Some(self.file.async_read(pos, len));
            self.reqs[i].status = ReqStatus::AsyncIo;
            return Ok(Step::Continue);
        }

        match self.file.read_at(pos, len) {
            Ok(data) => {
                self.submit_encrypt(i, data);
                Ok(Step::Wait)
            }
            Err(e) if e.retry => {
                tracing::warn!(connection = i, error = %e, "Retrying failed read");
                self.reqs[i].retry_after = Some(now + self.ctx.config.io_retry_backoff());
                Ok(Step::Wait)
            }
            Err(e) => {
                tracing::error!(connection = i, error = %e, "Read failed");
                Err(SlotFailure::new(TransferError::Read))
            }
        }
    }

    fn submit_encrypt(&mut self, i: usize, data: Vec<u8>) {
        let piece = FilePiece::from_vec(self.reqs[i].pos, data);
        self.crypto.submit(i, CryptDirection::Encrypt, piece);
        self.reqs[i].status = ReqStatus::Encrypting;
    }

    // =========================================================================
    // Network
    // =========================================================================

    fn step_prepared(&mut self, i: usize, now: Instant) -> Step {
        let req = &mut self.reqs[i];
        if !req.can_post(now) {
            return Step::Wait;
        }
        req.post(self.ctx.transport.as_ref(), now);
        Step::Continue
    }

    fn step_in_flight(&mut self, i: usize, now: Instant) -> Step {
        let raid = self.buffers.is_raid();
        let header_timeout = self.ctx.config.raid_header_timeout();
        let req = &mut self.reqs[i];

        let (delta, state) = req.poll();
        if delta > 0 {
            req.speed.record(delta, now);
            self.speed.record(delta, now);
            self.last_data = now;
        }

        match state {
            ExchangeState::Pending => {
                if raid && !req.headers_received() && req.in_flight_for(now) >= header_timeout {
                    tracing::warn!(connection = i, "Raid connection timed out waiting for headers");
                    req.disconnect();
                    req.failure = Some(RequestFailure::Transport(TransportFailure::Timeout {
                        headers_received: false,
                    }));
                    req.status = ReqStatus::Failure;
                    return Step::Continue;
                }
                Step::Wait
            }
            ExchangeState::Complete(response) if response.status == STATUS_OK => {
                req.response = Some(response);
                req.status = ReqStatus::Success;
                Step::Continue
            }
            ExchangeState::Complete(response) => {
                req.failure = Some(RequestFailure::Status {
                    status: response.status,
                    time_left: response.time_left,
                });
                req.status = ReqStatus::Failure;
                Step::Continue
            }
            ExchangeState::Failed(failure) => {
                req.failure = Some(RequestFailure::Transport(failure));
                req.status = ReqStatus::Failure;
                Step::Continue
            }
        }
    }

    fn record_success(&mut self, now: Instant) {
        self.error_count = 0;
        self.soft_failure = false;
        self.last_data = now;
    }

    fn step_download_success(&mut self, i: usize, now: Instant) -> StepResult {
        let req = &mut self.reqs[i];
        let body = req.response.take().map(|r| r.body).unwrap_or_default();

        if body.len() as u64 != req.size() {
            tracing::warn!(
                connection = i,
                expected = req.size(),
                received = body.len(),
                "Invalid chunk size"
            );
            self.error_count += 1;
            self.last_error = TransferError::Read;
            req.status = ReqStatus::Prepared;
            return Ok(Step::Wait);
        }

        let pos = req.pos;
        req.status = ReqStatus::Ready;
        self.buffers.submit_download(i, pos, body);
        self.record_success(now);
        Ok(Step::Continue)
    }

    /// Raid recovery finished: reactivate the shards whose roles changed.
    ///
    /// A recovery restarts the stall clock; the reactivated shard gets a
    /// full watchdog period to deliver.
    fn after_raid_recovery(&mut self, failed: usize, old_unused: Option<usize>, now: Instant) {
        for (j, req) in self.reqs.iter_mut().enumerate() {
            if j == failed {
                req.reset();
            } else if (Some(j) == old_unused || old_unused.is_none() || req.status == ReqStatus::Done)
                && matches!(req.status, ReqStatus::Ready | ReqStatus::Done)
            {
                req.status = ReqStatus::Ready;
            }
        }
        self.last_data = now;
        self.ctx.observer.on_temporary_error(self.transfer, &TransferError::Again, None);
    }

    fn step_failure(&mut self, i: usize, now: Instant) -> StepResult {
        let failure = self.reqs[i]
            .failure
            .take()
            .unwrap_or_else(|| RequestFailure::Transport(TransportFailure::Connection("unknown".to_string())));
        let raid = self.buffers.is_raid();
        let action = classify(&failure, raid, self.ctx.config.over_quota_backoff());
        tracing::warn!(connection = i, ?failure, ?action, "Request failed");

        match action {
            FailureAction::OverQuota(backoff) => Err(SlotFailure {
                error: TransferError::OverQuota,
                backoff: Some(backoff),
            }),
            FailureAction::RateLimited => {
                let backoff = self.ctx.config.rate_limit_backoff();
                self.reqs[i].retry_after = Some(now + backoff);
                self.reqs[i].status = ReqStatus::Prepared;
                self.ctx
                    .observer
                    .on_temporary_error(self.transfer, &TransferError::Again, Some(backoff));
                Ok(Step::Wait)
            }
            FailureAction::RaidRecovery => {
                let old_unused = self.buffers.raid().unused_raid_connection();
                if self.buffers.raid_mut().try_raid_http_get_error_recovery(i, true) {
                    self.after_raid_recovery(i, old_unused, now);
                    Ok(Step::Continue)
                } else {
                    Err(SlotFailure::new(TransferError::Again))
                }
            }
            FailureAction::Again => Err(SlotFailure::new(TransferError::Again)),
            FailureAction::SoftRetry => {
                if self.soft_failure {
                    return Err(SlotFailure::new(TransferError::Failed));
                }
                self.soft_failure = true;
                self.error_count += 1;
                self.last_error = TransferError::Failed;
                if self.ctx.config.auto_alt_port {
                    let alt = self.ctx.toggle_alt_port();
                    tracing::debug!(alt_port = alt, "Automatically changing port");
                    self.reqs[i].url = with_alt_port(&self.reqs[i].url, alt);
                }
                self.ctx.observer.on_chunk_failed(self.transfer, failure.status());
                self.reqs[i].status = ReqStatus::Prepared;
                Ok(Step::Continue)
            }
        }
    }

    // =========================================================================
    // Decrypt and write
    // =========================================================================

    /// Run the serial decrypt pass over a connection's output and hand any
    /// whole chunks to the workers.
    fn finalize_output(&mut self, i: usize) -> Step {
        let Some(mut piece) = self.buffers.take_output(i) else {
            return Step::Wait;
        };
        if self.buffers.finalize(&mut piece, &mut self.serial_macs) {
            self.crypto.submit(i, CryptDirection::Decrypt, piece);
            self.reqs[i].status = ReqStatus::Decrypting;
            Step::Wait
        } else {
            piece.finalized = true;
            self.buffers.put_output(i, piece);
            self.reqs[i].status = ReqStatus::Decrypted;
            Step::Continue
        }
    }

    fn apply_crypto_results(&mut self) {
        while let Some(done) = self.crypto.try_recv() {
            let i = done.connection;
            let mut piece = done.piece;
            match done.direction {
                CryptDirection::Decrypt => {
                    piece.finalized = true;
                    self.buffers.put_output(i, piece);
                    self.reqs[i].status = ReqStatus::Decrypted;
                }
                CryptDirection::Encrypt => {
                    let req = &mut self.reqs[i];
                    req.upload_macs = std::mem::take(&mut piece.chunkmacs);
                    req.body = piece.buf.data().map(Bytes::copy_from_slice).unwrap_or_default();
                    req.status = ReqStatus::Prepared;
                }
            }
        }
    }

    fn step_decrypted(&mut self, i: usize, now: Instant) -> StepResult {
        if !self.reqs[i].can_post(now) {
            return Ok(Step::Wait);
        }
        let Some(piece) = self.buffers.output_piece(i) else {
            return Err(SlotFailure::new(TransferError::Internal(format!(
                "connection {} has no decrypted output",
                i
            ))));
        };
        let pos = piece.pos;
        let Some(data) = piece.buf.data() else {
            return Err(SlotFailure::new(TransferError::Internal("null piece in output".to_string())));
        };

        if self.file.async_available() {
            tracing::trace!(connection = i, pos, len = data.len(), "Writing data asynchronously");
            let ctx = self.file.async_write(pos, Bytes::copy_from_slice(data));
            self.reqs[i].io = Some(ctx);
            self.reqs[i].status = ReqStatus::AsyncIo;
            return Ok(Step::Continue);
        }

        match self.file.write_at(pos, data) {
            Ok(()) => {
                self.write_completed(i, now);
                Ok(Step::Continue)
            }
            Err(e) if e.retry => {
                tracing::warn!(connection = i, error = %e, "Retrying failed write");
                self.last_error = TransferError::Write;
                self.reqs[i].retry_after = Some(now + self.ctx.config.io_retry_backoff());
                Ok(Step::Wait)
            }
            Err(e) => {
                tracing::error!(connection = i, error = %e, "Error saving finished chunk");
                Err(SlotFailure::new(TransferError::Write))
            }
        }
    }

    fn step_write_io(&mut self, i: usize, now: Instant) -> StepResult {
        let Some(io) = self.reqs[i].io.as_mut() else {
            self.reqs[i].status = ReqStatus::Decrypted;
            return Ok(Step::Continue);
        };
        if !io.poll() {
            return Ok(Step::Wait);
        }
        let outcome = io.take_outcome();
        self.reqs[i].io = None;

        match outcome {
            Some(Ok(_)) => {
                self.write_completed(i, now);
                Ok(Step::Continue)
            }
            Some(Err(e)) if e.retry => {
                tracing::warn!(connection = i, error = %e, "Retrying failed async write");
                self.reqs[i].retry_after = Some(now + self.ctx.config.io_retry_backoff());
                self.reqs[i].status = ReqStatus::Decrypted;
                Ok(Step::Wait)
            }
            Some(Err(e)) => {
                tracing::error!(connection = i, error = %e, "Async write failed");
                Err(SlotFailure::new(TransferError::Write))
            }
            None => Ok(Step::Wait),
        }
    }

    fn step_read_io(&mut self, i: usize, now: Instant) -> StepResult {
        let Some(io) = self.reqs[i].io.as_mut() else {
            self.reqs[i].status = ReqStatus::PreparedButWaiting;
            return Ok(Step::Continue);
        };
        if !io.poll() {
            return Ok(Step::Wait);
        }
        let outcome = io.take_outcome();
        self.reqs[i].io = None;

        match outcome {
            Some(Ok(Some(data))) => {
                self.submit_encrypt(i, data.to_vec());
                Ok(Step::Wait)
            }
            Some(Err(e)) if e.retry => {
                tracing::warn!(connection = i, error = %e, "Retrying failed async read");
                self.reqs[i].retry_after = Some(now + self.ctx.config.io_retry_backoff());
                self.reqs[i].status = ReqStatus::PreparedButWaiting;
                Ok(Step::Wait)
            }
            Some(Ok(None)) | Some(Err(_)) => Err(SlotFailure::new(TransferError::Read)),
            None => Ok(Step::Wait),
        }
    }

    /// A connection's output reached the disk.
    fn write_completed(&mut self, i: usize, now: Instant) {
        if let Some(mut piece) = self.buffers.buffer_write_completed(i) {
            tracing::debug!(connection = i, pos = piece.pos, len = piece.len(), "Saved data");
            self.transfer.chunkmacs.merge(&mut piece.chunkmacs);
            self.transfer.progress_completed += piece.len() as u64;
            self.last_data = now;
        }
        self.reqs[i].retry_after = None;
        self.reqs[i].status = ReqStatus::Ready;
    }

    // =========================================================================
    // Upload completion
    // =========================================================================

    fn step_upload_success(&mut self, i: usize) -> StepResult {
        let body = self.reqs[i]
            .response
            .as_ref()
            .map(|r| r.body.clone())
            .unwrap_or_default();

        if body.len() == UPLOAD_TOKEN_LEN {
            // token handled by take_upload_completion once siblings settle
            return Ok(Step::Wait);
        }

        if !body.is_empty() {
            let code = std::str::from_utf8(&body)
                .ok()
                .and_then(|s| s.trim().parse::<i32>().ok())
                .ok_or_else(|| {
                    SlotFailure::new(TransferError::Internal(format!(
                        "unexpected {}-byte upload response",
                        body.len()
                    )))
                })?;
            tracing::warn!(connection = i, code, "Error uploading chunk");
            self.reqs[i].response = None;
            if code == SERVER_ERROR_KEY {
                self.error_count += 1;
                self.last_error = TransferError::MacMismatch;
                self.reqs[i].status = ReqStatus::Prepared;
                return Ok(Step::Wait);
            }
            return Err(SlotFailure::new(TransferError::from_server_code(code)));
        }

        let now = self.ctx.clock.now();
        let req = &mut self.reqs[i];
        req.response = None;
        req.body = Bytes::new();
        self.transfer.chunkmacs.merge(&mut req.upload_macs);
        self.transfer.progress_completed += req.size();
        req.status = ReqStatus::Ready;
        tracing::debug!(
            connection = i,
            pos = req.pos,
            completed = self.transfer.progress_completed,
            "Chunk uploaded"
        );
        self.record_success(now);
        self.ctx.observer.on_persist(self.transfer);

        if self.transfer.progress_completed >= self.transfer.size {
            tracing::error!("All bytes uploaded without an upload token");
            return Err(SlotFailure::new(TransferError::Internal("no upload token".to_string())));
        }
        Ok(Step::Continue)
    }

    /// Finish the upload once a connection holds the token and no sibling is
    /// still computing chunk MACs.
    fn take_upload_completion(&mut self, i: usize) -> Result<Option<Completion>, SlotFailure> {
        if self.transfer.direction != Direction::Upload || self.reqs[i].status != ReqStatus::Success {
            return Ok(None);
        }
        let has_token = self.reqs[i]
            .response
            .as_ref()
            .is_some_and(|r| r.body.len() == UPLOAD_TOKEN_LEN);
        if !has_token {
            return Ok(None);
        }
        if self.reqs.iter().any(|r| r.status == ReqStatus::Encrypting) {
            tracing::debug!(connection = i, "Upload token received; waiting for sibling MACs");
            return Ok(None);
        }

        let token = self.reqs[i]
            .response
            .take()
            .map(|r| r.body.to_vec())
            .unwrap_or_default();
        for req in &mut self.reqs {
            if matches!(
                req.status,
                ReqStatus::Success | ReqStatus::InFlight | ReqStatus::Prepared | ReqStatus::Failure
            ) && !req.upload_macs.is_empty()
            {
                self.transfer.chunkmacs.merge(&mut req.upload_macs);
                self.transfer.progress_completed += req.size();
                req.disconnect();
            }
            req.status = ReqStatus::Done;
        }

        let cipher = self.transfer.cipher();
        let meta_mac = self.transfer.chunkmacs.macsmac(&cipher);
        let key = file_key(&self.transfer.key, self.transfer.ctr_iv, meta_mac);
        self.transfer.upload_token = Some(token.clone());
        self.error_count = 0;
        tracing::debug!(?meta_mac, "Upload token received");

        Ok(Some(Completion::Upload { token, file_key: key }))
    }

    // =========================================================================
    // Download completion
    // =========================================================================

    fn download_finished(&self) -> bool {
        self.transfer.progress_completed >= self.buffers.deliver_limit()
            && self.crypto.outstanding() == 0
            && self.reqs.iter().enumerate().all(|(i, r)| {
                !self.buffers.raid().has_output(i)
                    && !matches!(
                        r.status,
                        ReqStatus::Decrypting | ReqStatus::Decrypted | ReqStatus::AsyncIo
                    )
            })
    }

    /// Compare the whole-file MAC, falling back to the late-gap repair.
    fn verify_download(&mut self) -> Result<Completion, SlotFailure> {
        for req in &mut self.reqs {
            req.disconnect();
            req.status = ReqStatus::Done;
        }

        let cipher = self.transfer.cipher();
        let actual = self.transfer.chunkmacs.macsmac(&cipher);
        let whole_file = self.buffers.deliver_limit() == self.transfer.size;

        let Some(expected) = self.transfer.meta_mac.filter(|_| whole_file && self.transfer.size > 0) else {
            return Ok(Completion::Download {
                meta_mac: actual,
                repaired: false,
            });
        };

        if actual == expected {
            return Ok(Completion::Download {
                meta_mac: actual,
                repaired: false,
            });
        }

        if find_late_gap_match(&self.transfer.chunkmacs, &cipher, expected).is_some() {
            return Ok(Completion::Download {
                meta_mac: expected,
                repaired: true,
            });
        }

        tracing::error!(?expected, ?actual, "MAC verification failed");
        self.transfer.chunkmacs.clear();
        self.transfer.progress_completed = 0;
        Err(SlotFailure::new(TransferError::MacMismatch))
    }

    // =========================================================================
    // Supervision
    // =========================================================================

    /// Reset in-flight requests after a long silence; fail if none are in flight.
    fn check_watchdog(&mut self, now: Instant) -> Result<(), SlotFailure> {
        if now.saturating_duration_since(self.last_data) < self.ctx.config.timeout() {
            return Ok(());
        }

        let alt = if self.ctx.config.auto_alt_port {
            let alt = self.ctx.toggle_alt_port();
            tracing::debug!(alt_port = alt, "Automatically changing port due to a timeout");
            Some(alt)
        } else {
            None
        };

        let mut reset = 0;
        for (i, req) in self.reqs.iter_mut().enumerate() {
            if req.is_in_flight() {
                tracing::warn!(connection = i, pos = req.pos, "Chunk failed due to a timeout");
                req.disconnect();
                if let Some(alt) = alt {
                    req.url = with_alt_port(&req.url, alt);
                }
                req.status = ReqStatus::Prepared;
                reset += 1;
            }
        }

        if reset == 0 {
            tracing::warn!("Transfer failed due to a timeout");
            return Err(SlotFailure::new(TransferError::Again));
        }
        self.ctx.observer.on_chunk_failed(self.transfer, None);
        self.last_data = now;
        Ok(())
    }

    /// Swap out a raid shard that is persistently much slower than its peers.
    fn check_slow_shards(&mut self, now: Instant) {
        if !self.buffers.is_raid() {
            return;
        }
        let Some(old_unused) = self.buffers.raid().unused_raid_connection() else {
            return;
        };

        let mut speeds = [None; RAIDPARTS];
        for (speed, req) in speeds.iter_mut().zip(self.reqs.iter_mut()) {
            if req.is_in_flight() {
                *speed = Some(req.speed.speed(now));
            }
        }

        if let Some(slow) = self.slow_shards.check(&speeds, now) {
            if self.buffers.raid_mut().try_raid_http_get_error_recovery(slow, false) {
                self.after_raid_recovery(slow, Some(old_unused), now);
            }
        }
    }

    fn report_progress(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_progress_report) < self.ctx.config.progress_interval() {
            return;
        }
        self.last_progress_report = now;
        let progress = TransferProgress {
            completed: self.transfer.progress_completed,
            contiguous: self.transfer.chunkmacs.contiguous_progress(self.transfer.size),
            size: self.transfer.size,
            speed: self.speed.speed(now),
            mean_speed: self.speed.mean_speed(now),
        };
        self.ctx.observer.on_progress(self.transfer, &progress);
    }

    fn retry_in(&self) -> Option<Duration> {
        let now = self.ctx.clock.now();
        self.reqs
            .iter()
            .filter_map(|r| r.retry_after)
            .map(|at| at.saturating_duration_since(now))
            .min()
    }

    /// Write every already-reconstructed piece so a later resume does not
    /// fetch it again.
    fn flush_pending_output(&mut self) {
        for done in self.crypto.drain_blocking() {
            if done.direction == CryptDirection::Decrypt {
                let mut piece = done.piece;
                piece.finalized = true;
                self.buffers.put_output(done.connection, piece);
            }
        }

        let mut pieces: Vec<FilePiece> = (0..self.reqs.len())
            .filter_map(|i| {
                self.reqs[i].io = None;
                self.buffers.take_output(i)
            })
            .collect();
        pieces.sort_by_key(|p| p.pos);

        let cipher = self.transfer.cipher();
        let mut flushed = 0;
        for mut piece in pieces {
            if !piece.finalized {
                self.buffers.finalize(&mut piece, &mut self.serial_macs);
                crypt_whole_chunks(
                    &mut piece,
                    &cipher,
                    self.transfer.ctr_iv,
                    self.transfer.size,
                    CryptDirection::Decrypt,
                );
            }
            let Some(data) = piece.buf.data() else {
                continue;
            };
            match self.file.write_at(piece.pos, data) {
                Ok(()) => {
                    flushed += data.len();
                    self.transfer.progress_completed += data.len() as u64;
                    self.transfer.chunkmacs.merge(&mut piece.chunkmacs);
                }
                Err(e) => {
                    tracing::warn!(pos = piece.pos, error = %e, "Could not flush pending output");
                }
            }
        }
        if flushed > 0 {
            tracing::info!(flushed, "Flushed pending output");
        }
    }
}

impl Drop for TransferSlot<'_> {
    fn drop(&mut self) {
        for req in &mut self.reqs {
            req.disconnect();
        }
        match self.transfer.direction {
            Direction::Download => self.flush_pending_output(),
            Direction::Upload => {
                self.crypto.drain_blocking();
            }
        }
        self.ctx.observer.on_persist(self.transfer);
    }
}
