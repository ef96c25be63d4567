//! Transfer-level buffer management.
//!
//! [`TransferBufferManager`] sits between the slot and the
//! [`RaidBufferManager`]: it decides byte ranges for every kind of transfer
//! (raid download, plain download, upload), routes received data into the
//! raid engine or straight to a connection's output slot, and splits
//! decryption into a serial pass for partial chunks and parallel work for
//! whole chunks.

use std::sync::Arc;

use bytes::Bytes;

use crate::config::TransferConfig;
use crate::crypto::{chunk_ceil, chunk_floor, ChunkMac, ChunkMacMap, CryptDirection, CtrIv, TransferCipher};
use crate::error::TransferResult;
use crate::raid::{FaultyServers, FilePiece, RaidBufferManager, RaidSetup};

use super::worker::is_whole_chunk;

const MIB: u64 = 1024 * 1024;

/// What a connection should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextRange {
    /// Fetch (or upload) `[pos, npos)`.
    Fetch { pos: u64, npos: u64 },
    /// A range was satisfied locally; ask again.
    Supplied,
    /// Too far ahead of the other shards; ask again later.
    Paused,
    /// Nothing left for this connection.
    Done,
}

/// Transfer-specific range planning around the raid engine.
#[derive(Debug)]
pub struct TransferBufferManager {
    raid: RaidBufferManager,
    cipher: TransferCipher,
    iv: CtrIv,
    file_size: u64,
    deliver_limit: u64,
    /// Next unrequested file position (non-raid downloads and uploads).
    next_pos: u64,
    max_download_request_size: u64,
    min_upload_request_size: u64,
    max_upload_request_size: u64,
}

impl TransferBufferManager {
    pub fn new(
        faulty_servers: Arc<FaultyServers>,
        cipher: TransferCipher,
        iv: CtrIv,
        config: &TransferConfig,
    ) -> Self {
        Self {
            raid: RaidBufferManager::new(faulty_servers),
            cipher,
            iv,
            file_size: 0,
            deliver_limit: 0,
            next_pos: 0,
            max_download_request_size: config.max_download_request_size,
            min_upload_request_size: config.min_upload_request_size,
            max_upload_request_size: config.max_upload_request_size,
        }
    }

    /// Initialise once URLs and the resume point are known.
    pub fn set_is_raid(
        &mut self,
        urls: Vec<String>,
        resume_pos: u64,
        read_to_pos: u64,
        file_size: u64,
        all_shards: bool,
    ) -> TransferResult<()> {
        self.file_size = file_size;
        self.deliver_limit = read_to_pos.min(file_size);
        self.next_pos = resume_pos;
        self.raid.set_is_raid(RaidSetup {
            urls,
            resume_pos,
            read_to_pos,
            file_size,
            max_request_size: self.max_download_request_size,
            all_shards,
        })
    }

    pub fn is_raid(&self) -> bool {
        self.raid.is_raid()
    }

    pub fn raid(&self) -> &RaidBufferManager {
        &self.raid
    }

    pub fn raid_mut(&mut self) -> &mut RaidBufferManager {
        &mut self.raid
    }

    pub fn temp_url(&self, connection: usize) -> Option<&str> {
        self.raid.temp_url(connection)
    }

    pub fn deliver_limit(&self) -> u64 {
        self.deliver_limit
    }

    // =========================================================================
    // Range planning
    // =========================================================================

    /// Next download range for a connection.
    pub fn next_download_range(
        &mut self,
        connection: usize,
        chunkmacs: &ChunkMacMap,
        progress_completed: u64,
        connections: usize,
    ) -> NextRange {
        if self.raid.is_raid() {
            let range = self.raid.next_raid_range(connection);
            return if range.paused {
                NextRange::Paused
            } else if range.new_buffer_supplied {
                NextRange::Supplied
            } else if range.npos > range.pos {
                NextRange::Fetch {
                    pos: range.pos,
                    npos: range.npos,
                }
            } else {
                NextRange::Done
            };
        }

        let pos = self.next_unfinished_pos(chunkmacs);
        if pos >= self.deliver_limit {
            return NextRange::Done;
        }

        let remaining = self.file_size.saturating_sub(progress_completed);
        let max_request = download_request_limit(remaining, connections, self.max_download_request_size);
        let npos = expand_unprocessed(chunkmacs, pos, self.deliver_limit, max_request);
        self.next_pos = npos;
        NextRange::Fetch { pos, npos }
    }

    /// Next upload range for a connection, sized from measured throughput.
    pub fn next_upload_range(&mut self, chunkmacs: &ChunkMacMap, speed: u64, connections: usize) -> NextRange {
        let pos = self.next_unfinished_pos(chunkmacs);
        if pos >= self.file_size {
            return NextRange::Done;
        }

        let target = self.upload_request_size(pos, speed, connections);
        let mut npos = chunk_ceil(pos, self.file_size);
        while npos < self.file_size && npos - pos < target {
            npos = chunk_ceil(npos, self.file_size);
        }
        self.next_pos = npos;
        NextRange::Fetch { pos, npos }
    }

    /// Target upload request size: about two seconds of throughput, smaller
    /// near the end of the file so every connection gets a share.
    fn upload_request_size(&self, pos: u64, speed: u64, connections: usize) -> u64 {
        if speed == 0 {
            // single chunk until a throughput measurement exists
            return 0;
        }
        let mut target = speed
            .saturating_mul(2)
            .clamp(self.min_upload_request_size, self.max_upload_request_size);
        let share = (self.file_size - pos) / connections.max(1) as u64;
        if share < target {
            target = share.max(self.min_upload_request_size.min(target));
        }
        target
    }

    fn next_unfinished_pos(&mut self, chunkmacs: &ChunkMacMap) -> u64 {
        while self.next_pos < self.file_size && chunkmacs.is_finished(self.next_pos) {
            self.next_pos = chunk_ceil(self.next_pos, self.file_size);
        }
        self.next_pos
    }

    // =========================================================================
    // Data flow
    // =========================================================================

    /// Hand a received body to the buffers.
    pub fn submit_download(&mut self, connection: usize, pos: u64, body: Bytes) {
        let piece = FilePiece::from_vec(pos, Vec::from(body));
        if self.raid.is_raid() {
            self.raid.submit_buffer(connection, piece);
        } else {
            self.raid.put_output(connection, piece);
        }
    }

    /// The connection's pending output, combining raid data if possible.
    pub fn output(&mut self, connection: usize) -> Option<&mut FilePiece> {
        self.raid.get_async_output_buffer(connection)
    }

    pub fn output_piece(&self, connection: usize) -> Option<&FilePiece> {
        self.raid.output_piece(connection)
    }

    pub fn take_output(&mut self, connection: usize) -> Option<FilePiece> {
        self.raid.take_output(connection)
    }

    pub fn put_output(&mut self, connection: usize, piece: FilePiece) {
        self.raid.put_output(connection, piece);
    }

    pub fn buffer_write_completed(&mut self, connection: usize) -> Option<FilePiece> {
        self.raid.buffer_write_completed(connection)
    }

    /// Serial decrypt pass over the chunks `piece` only partly covers.
    ///
    /// Output pieces reach this pass in file order, so a chunk split across
    /// pieces continues from the running state kept in `serial`. The piece
    /// receives a copy of every state it touched; whole chunks are left for
    /// [`crate::transfer::worker`]. Returns whether any whole chunk remains
    /// to be processed in parallel.
    pub fn finalize(&self, piece: &mut FilePiece, serial: &mut ChunkMacMap) -> bool {
        let start = piece.pos;
        let end = piece.end_pos();
        let file_size = self.file_size;
        let Some(data) = piece.buf.data_mut() else {
            return false;
        };

        let mut parallel = false;
        let mut p = start;
        while p < end {
            let chunk_start = chunk_floor(p);
            let chunk_end = chunk_ceil(p, file_size);
            let seg_end = chunk_end.min(end);

            if is_whole_chunk(p, end, file_size) {
                parallel = true;
                p = seg_end;
                continue;
            }

            let seg = &mut data[(p - start) as usize..(seg_end - start) as usize];
            let mut state = serial.state(chunk_start);
            if !state.finished && chunk_start + u64::from(state.offset) == p {
                let init = state.offset == 0;
                self.cipher
                    .ctr_crypt(seg, p, self.iv, Some(&mut state.mac), CryptDirection::Decrypt, init);
                state.offset += seg.len() as u32;
                if chunk_start + u64::from(state.offset) == chunk_end {
                    state = ChunkMac::finished(state.mac);
                    serial.remove(chunk_start);
                } else {
                    serial.insert(chunk_start, state);
                }
                piece.chunkmacs.insert(chunk_start, state);
            } else {
                tracing::warn!(pos = p, chunk_start, "Chunk MAC cannot be continued; decrypting only");
                self.cipher
                    .ctr_crypt(seg, p, self.iv, None, CryptDirection::Decrypt, false);
            }
            p = seg_end;
        }
        parallel
    }
}

/// Upper bound for one plain download request: half of this connection's
/// share of the remaining bytes, as a power of two minus 1 MiB.
pub fn download_request_limit(remaining: u64, connections: usize, max_request: u64) -> u64 {
    let limit = (remaining / connections.max(1) as u64 / 2).min(max_request);
    if limit <= MIB {
        return 0;
    }
    let mut val = MIB;
    while val <= limit {
        val <<= 1;
    }
    (val >> 1) - MIB
}

/// Extend a request from `pos` over following unprocessed chunks.
fn expand_unprocessed(chunkmacs: &ChunkMacMap, pos: u64, limit: u64, max_request: u64) -> u64 {
    let mut npos = chunk_ceil(pos, limit);
    while npos < limit && npos - pos <= max_request {
        let unprocessed = chunkmacs
            .get(npos)
            .map_or(true, |c| !c.finished && c.offset == 0);
        if !unprocessed {
            break;
        }
        npos = chunk_ceil(npos, limit);
    }
    npos
}
