//! Raid-aware input/output buffer management.
//!
//! [`RaidBufferManager`] accepts shard data from six connections in any
//! order and at any pace, and produces position-tagged output pieces of the
//! reconstructed file in strictly increasing order.
//!
//! # Reconstruction window
//!
//! ```text
//!              raid_parts_pos (common shard position)
//!                    │
//! shard 0 (parity)   ├──[piece]──[piece]──────┤
//! shard 1            ├──[piece]──────┤
//! shard 2 (unused)   ├──[null]──[null]──[null]┤   rebuilt from parity
//! shard 3            ├──[piece]──[piece]──┤
//! ...
//!                    └─ partslen ─┘ combinable now (sector aligned)
//! ```
//!
//! Output is cut at MAC-chunk boundaries; the tail of a combine that does
//! not complete a chunk is held back in a leftover buffer and prepended to
//! the next output. Throughout:
//!
//! `raid_parts_pos * 5 == output_file_pos + leftover.len()`
//!
//! In five-connection mode one shard (the *unused* one) is never fetched;
//! null pieces are queued in its place. In six-connection mode each shard
//! skips one chunk-sized block in rotation instead.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use super::faulty::FaultyServers;
use super::piece::FilePiece;
use super::sector::{line_sector_range, recover_sector};
use super::{raid_part_size, DATA_PARTS, RAIDLINE, RAIDPARTS, RAIDSECTOR};
use crate::crypto::chunk_floor;
use crate::error::{TransferError, TransferResult};

// =============================================================================
// Constants
// =============================================================================

/// Chunk-sized blocks fetched per shard request.
pub const RAID_MAX_CHUNKS_PER_READ: u64 = 5;

/// A shard this many chunks ahead of the common position is paused.
pub const RAID_READ_AHEAD_PAUSE_CHUNKS: u64 = 8;

/// A paused shard resumes once it is no more than this many chunks ahead.
pub const RAID_READ_AHEAD_UNPAUSE_CHUNKS: u64 = 4;

/// Shard errors (excluding the worst shard) tolerated before raid gives up.
pub const RAID_ERROR_THRESHOLD: u32 = 5;

const MIN_RAID_LINES_PER_CHUNK: u64 = 8 * 1024;
const MAX_RAID_LINES_PER_CHUNK: u64 = 64 * 1024;

/// Parameters for [`RaidBufferManager::set_is_raid`].
#[derive(Debug, Clone)]
pub struct RaidSetup {
    /// Six shard URLs for raid, or a single URL for a plain download.
    pub urls: Vec<String>,
    /// File position the transfer resumes from.
    pub resume_pos: u64,
    /// Bytes at or beyond this position are never delivered.
    pub read_to_pos: u64,
    pub file_size: u64,
    pub max_request_size: u64,
    /// Fetch all six shards, each skipping blocks in rotation.
    pub all_shards: bool,
}

/// Next shard range for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaidRange {
    pub pos: u64,
    pub npos: u64,
    /// The range was satisfied locally (null piece or parked piece); do not fetch it.
    pub new_buffer_supplied: bool,
    /// The connection is too far ahead and must wait.
    pub paused: bool,
}

/// Raid-aware buffer manager.
#[derive(Debug)]
pub struct RaidBufferManager {
    faulty_servers: Arc<FaultyServers>,
    is_raid: bool,
    raid_known: bool,
    temp_urls: Vec<String>,
    file_size: u64,
    acquire_limit_pos: u64,
    deliver_limit_pos: u64,
    raid_lines_per_chunk: u64,
    /// `None` means all six shards are active.
    unused_raid_connection: Option<usize>,
    connection_paused: [bool; RAIDPARTS],
    raid_request_part_pos: [u64; RAIDPARTS],
    raid_input_parts: [VecDeque<FilePiece>; RAIDPARTS],
    /// Pieces received beyond a gap, waiting for their queue to catch up.
    raid_input_parts_recovery: [BTreeMap<u64, FilePiece>; RAIDPARTS],
    output_buffers: BTreeMap<usize, FilePiece>,
    leftover_chunk: Vec<u8>,
    raid_parts_pos: u64,
    output_file_pos: u64,
    resume_wasted_bytes: u64,
    raid_http_get_error_count: [u32; RAIDPARTS],
}

impl RaidBufferManager {
    pub fn new(faulty_servers: Arc<FaultyServers>) -> Self {
        Self {
            faulty_servers,
            is_raid: false,
            raid_known: false,
            temp_urls: Vec::new(),
            file_size: 0,
            acquire_limit_pos: 0,
            deliver_limit_pos: 0,
            raid_lines_per_chunk: 16 * 1024,
            unused_raid_connection: None,
            connection_paused: [false; RAIDPARTS],
            raid_request_part_pos: [0; RAIDPARTS],
            raid_input_parts: Default::default(),
            raid_input_parts_recovery: Default::default(),
            output_buffers: BTreeMap::new(),
            leftover_chunk: Vec::new(),
            raid_parts_pos: 0,
            output_file_pos: 0,
            resume_wasted_bytes: 0,
            raid_http_get_error_count: [0; RAIDPARTS],
        }
    }

    /// One-time initialisation once the temporary URLs are known.
    ///
    /// Six URLs select raid. The resume position is aligned down to a
    /// sector boundary on every shard; the bytes this re-fetches in front
    /// of `resume_pos` are discarded from the first output.
    pub fn set_is_raid(&mut self, setup: RaidSetup) -> TransferResult<()> {
        if setup.urls.len() != RAIDPARTS && setup.urls.len() != 1 {
            return Err(TransferError::Setup(format!(
                "expected 1 or {} temporary URLs, got {}",
                RAIDPARTS,
                setup.urls.len()
            )));
        }

        self.is_raid = setup.urls.len() == RAIDPARTS;
        self.raid_known = true;
        self.file_size = setup.file_size;
        self.output_file_pos = setup.resume_pos;
        self.deliver_limit_pos = setup.read_to_pos.min(setup.file_size);

        let line = RAIDLINE as u64;
        let rounded = self.deliver_limit_pos.div_ceil(line) * line;
        self.acquire_limit_pos = rounded.min(setup.file_size);

        if self.is_raid {
            let mut parts_pos = setup.resume_pos / DATA_PARTS as u64;
            parts_pos -= parts_pos % RAIDSECTOR as u64;
            self.raid_parts_pos = parts_pos;
            self.resume_wasted_bytes = setup.resume_pos - parts_pos * DATA_PARTS as u64;
            self.output_file_pos -= self.resume_wasted_bytes;
            self.raid_request_part_pos = [parts_pos; RAIDPARTS];

            // two chunk sets incoming, one outgoing
            let mut lines = setup.max_request_size / RAIDPARTS as u64 / 3 / RAIDSECTOR as u64;
            lines -= lines % 1024;
            self.raid_lines_per_chunk = lines.clamp(MIN_RAID_LINES_PER_CHUNK, MAX_RAID_LINES_PER_CHUNK);

            let whole_file_in_one_read = setup.file_size / DATA_PARTS as u64
                <= RAID_MAX_CHUNKS_PER_READ * self.part_chunk_size();

            self.unused_raid_connection = if setup.all_shards && !whole_file_in_one_read {
                None
            } else {
                Some(self.faulty_servers.select_worst(&setup.urls).unwrap_or(0))
            };

            tracing::debug!(
                raid_parts_pos = self.raid_parts_pos,
                resume_wasted = self.resume_wasted_bytes,
                lines_per_chunk = self.raid_lines_per_chunk,
                unused = ?self.unused_raid_connection,
                "Raid download initialised"
            );
        }

        self.temp_urls = setup.urls;
        Ok(())
    }

    pub fn is_raid(&self) -> bool {
        debug_assert!(self.raid_known, "raid mode queried before set_is_raid");
        self.is_raid
    }

    /// URL a connection fetches from.
    pub fn temp_url(&self, connection: usize) -> Option<&str> {
        if self.is_raid {
            self.temp_urls.get(connection).map(String::as_str)
        } else {
            self.temp_urls.first().map(String::as_str)
        }
    }

    pub fn temp_urls(&self) -> &[String] {
        &self.temp_urls
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn raid_parts_pos(&self) -> u64 {
        self.raid_parts_pos
    }

    pub fn output_file_pos(&self) -> u64 {
        self.output_file_pos
    }

    pub fn leftover_len(&self) -> usize {
        self.leftover_chunk.len()
    }

    pub fn resume_wasted_bytes(&self) -> u64 {
        self.resume_wasted_bytes
    }

    pub fn raid_lines_per_chunk(&self) -> u64 {
        self.raid_lines_per_chunk
    }

    pub fn unused_raid_connection(&self) -> Option<usize> {
        self.unused_raid_connection
    }

    pub fn is_paused(&self, connection: usize) -> bool {
        self.connection_paused[connection]
    }

    /// Next shard position a connection will request from.
    pub fn request_part_pos(&self, connection: usize) -> u64 {
        self.raid_request_part_pos[connection]
    }

    /// Pieces queued for a shard (excluding parked ones).
    pub fn queued_pieces(&self, connection: usize) -> usize {
        self.raid_input_parts[connection].len()
    }

    pub fn error_count(&self, connection: usize) -> u32 {
        self.raid_http_get_error_count[connection]
    }

    /// Bytes per shard in one chunk-sized block.
    fn part_chunk_size(&self) -> u64 {
        self.raid_lines_per_chunk * RAIDSECTOR as u64
    }

    /// Total bytes a connection must fetch.
    pub fn transfer_size(&self, connection: usize) -> u64 {
        if self.is_raid {
            raid_part_size(connection, self.acquire_limit_pos)
        } else {
            self.file_size
        }
    }

    fn transfer_pos_update_minimum(&mut self, min_pos: u64, connection: usize) {
        let pos = &mut self.raid_request_part_pos[connection];
        if *pos < min_pos {
            *pos = min_pos;
        }
    }

    // =========================================================================
    // Input side
    // =========================================================================

    /// Hand a received (or null) shard piece to the manager.
    ///
    /// The piece must continue the shard's queue. A piece beyond the queue
    /// tail can only come from a connection that was re-planned after a
    /// failure; it is parked until the queue catches up.
    pub fn submit_buffer(&mut self, connection: usize, piece: FilePiece) {
        debug_assert!(self.is_raid && connection < RAIDPARTS);

        if !piece.buf.is_null() {
            self.raid_http_get_error_count[connection] = 0;
        }

        let queue = &self.raid_input_parts[connection];
        let contiguous = queue.back().map_or(self.raid_parts_pos, FilePiece::end_pos);

        if piece.pos == contiguous {
            self.transfer_pos_update_minimum(piece.end_pos(), connection);
            self.raid_input_parts[connection].push_back(piece);
        } else if piece.pos > contiguous {
            tracing::debug!(
                connection,
                pos = piece.pos,
                contiguous,
                "Parking shard piece received beyond queue tail"
            );
            self.raid_input_parts_recovery[connection].insert(piece.pos, piece);
        } else {
            tracing::warn!(
                connection,
                pos = piece.pos,
                contiguous,
                "Dropping stale shard piece"
            );
        }
    }

    /// Decide the next shard range for a connection.
    pub fn next_raid_range(&mut self, connection: usize) -> RaidRange {
        debug_assert!(self.is_raid && connection < RAIDPARTS);

        let curpos = self.raid_request_part_pos[connection];
        let mut maxpos = self.transfer_size(connection);
        let chunk = self.part_chunk_size();

        let pause_at = self.raid_parts_pos + RAID_READ_AHEAD_PAUSE_CHUNKS * chunk;
        let unpause_at = self.raid_parts_pos + RAID_READ_AHEAD_UNPAUSE_CHUNKS * chunk;
        if curpos >= pause_at || (curpos > unpause_at && self.connection_paused[connection]) {
            if !self.connection_paused[connection] {
                tracing::debug!(connection, curpos, raid_parts_pos = self.raid_parts_pos, "Pausing shard");
            }
            self.connection_paused[connection] = true;
            return RaidRange {
                pos: curpos,
                npos: curpos,
                new_buffer_supplied: false,
                paused: true,
            };
        }
        self.connection_paused[connection] = false;

        // a piece parked after a failure switch may be usable now
        let parked = self.raid_input_parts_recovery[connection]
            .first_key_value()
            .map(|(&pos, _)| pos);
        if let Some(parked_pos) = parked {
            if parked_pos == curpos {
                if let Some(piece) = self.raid_input_parts_recovery[connection].remove(&parked_pos) {
                    let npos = piece.end_pos();
                    self.submit_buffer(connection, piece);
                    return RaidRange {
                        pos: curpos,
                        npos,
                        new_buffer_supplied: true,
                        paused: false,
                    };
                }
            } else if parked_pos > curpos {
                maxpos = maxpos.min(parked_pos);
            }
        }

        let mut new_buffer_supplied = false;
        let npos = match self.unused_raid_connection {
            Some(unused) => {
                let npos = (curpos + chunk * RAID_MAX_CHUNKS_PER_READ).min(maxpos);
                if unused == connection && npos > curpos {
                    self.submit_buffer(connection, FilePiece::null(curpos, (npos - curpos) as usize));
                    new_buffer_supplied = true;
                }
                npos
            }
            None => {
                // each shard skips one block per cycle of six, in rotation
                let cycle = chunk * RAIDPARTS as u64;
                let skip_point = curpos - curpos % cycle + connection as u64 * chunk;
                if curpos < skip_point {
                    skip_point
                } else if curpos < skip_point + chunk {
                    let npos = (skip_point + chunk).min(maxpos);
                    if npos > curpos {
                        self.submit_buffer(connection, FilePiece::null(curpos, (npos - curpos) as usize));
                        new_buffer_supplied = true;
                    }
                    npos
                } else {
                    // up to the next cycle's skip point
                    skip_point + cycle
                }
            }
        };

        RaidRange {
            pos: curpos,
            npos: npos.min(maxpos),
            new_buffer_supplied,
            paused: false,
        }
    }

    // =========================================================================
    // Output side
    // =========================================================================

    /// Output piece for a connection, combining shard data first if the
    /// connection has none pending.
    pub fn get_async_output_buffer(&mut self, connection: usize) -> Option<&mut FilePiece> {
        if self.is_raid {
            // a combine may land entirely in the leftover buffer
            while !self.output_buffers.contains_key(&connection) && self.combine_raid_parts(connection) {}
        }
        self.output_buffers.get_mut(&connection)
    }

    pub fn has_output(&self, connection: usize) -> bool {
        self.output_buffers.contains_key(&connection)
    }

    pub fn output_piece(&self, connection: usize) -> Option<&FilePiece> {
        self.output_buffers.get(&connection)
    }

    /// Remove a connection's output piece (to hand it to a worker).
    pub fn take_output(&mut self, connection: usize) -> Option<FilePiece> {
        self.output_buffers.remove(&connection)
    }

    /// Store an output piece for a connection.
    pub fn put_output(&mut self, connection: usize, piece: FilePiece) {
        debug_assert!(!self.output_buffers.contains_key(&connection));
        self.output_buffers.insert(connection, piece);
    }

    /// The connection's output has been written; release it to the caller.
    pub fn buffer_write_completed(&mut self, connection: usize) -> Option<FilePiece> {
        self.output_buffers.remove(&connection)
    }

    /// Reconstruct as much output as the shard queues allow. Returns whether
    /// any shard data was consumed.
    fn combine_raid_parts(&mut self, connection: usize) -> bool {
        debug_assert!(!self.output_buffers.contains_key(&connection));
        debug_assert_eq!(
            self.raid_parts_pos * DATA_PARTS as u64,
            self.output_file_pos + self.leftover_chunk.len() as u64
        );

        let mut partslen = usize::MAX;
        let mut sumdatalen = 0usize;
        let mut xorlen = 0usize;
        for (i, queue) in self.raid_input_parts.iter().enumerate() {
            match queue.front() {
                None => partslen = 0,
                Some(front) => {
                    debug_assert_eq!(front.pos, self.raid_parts_pos, "shard queues out of sync");
                    partslen = partslen.min(front.len());
                    if i == 0 {
                        xorlen += front.len();
                    } else {
                        sumdatalen += front.len();
                    }
                }
            }
        }
        partslen -= partslen % RAIDSECTOR;

        let leftover_len = self.leftover_chunk.len();
        let newdatafilepos = self.output_file_pos + leftover_len as u64;
        let limit = self.acquire_limit_pos;
        let combined_len = partslen * DATA_PARTS;

        // all remaining data is at the queue fronts, including the final partial line
        let process_to_eof = newdatafilepos + sumdatalen as u64 == limit
            && xorlen.checked_sub(partslen).map(|x| x as u64)
                == Some(
                    limit
                        .saturating_sub(newdatafilepos + combined_len as u64)
                        .min(RAIDSECTOR as u64),
                )
            && combined_len + RAIDLINE >= sumdatalen;

        if partslen == 0 && !(process_to_eof && sumdatalen > 0) {
            return false;
        }

        let macchunkpos = chunk_floor(newdatafilepos + combined_len as u64);
        let buflen = if process_to_eof { sumdatalen } else { combined_len };

        let mut out = std::mem::take(&mut self.leftover_chunk);
        out.resize(leftover_len + buflen, 0);
        let out_pos = self.output_file_pos;

        self.combine_lines(&mut out[leftover_len..leftover_len + combined_len], partslen);
        self.roll_input_buffers(partslen);
        self.raid_parts_pos += partslen as u64;
        let remaining = sumdatalen - combined_len;
        self.output_file_pos += (combined_len + leftover_len) as u64;

        if process_to_eof && remaining > 0 {
            debug_assert_eq!(self.output_file_pos + remaining as u64, limit);
            let tail_start = leftover_len + combined_len;
            self.combine_last_line(&mut out[tail_start..tail_start + remaining], remaining);
            self.roll_input_buffers(RAIDSECTOR);
        } else if !process_to_eof && self.output_file_pos > macchunkpos {
            // hold back bytes that do not complete a MAC chunk
            let excess = ((self.output_file_pos - macchunkpos) as usize).min(out.len());
            self.leftover_chunk = out.split_off(out.len() - excess);
            self.output_file_pos -= excess as u64;
            debug_assert_eq!(
                self.raid_parts_pos * DATA_PARTS as u64,
                self.output_file_pos + self.leftover_chunk.len() as u64
            );
        }

        let mut piece = FilePiece::from_vec(out_pos, out);

        // bytes re-fetched only to align a resumed download
        let wasted = piece.len().min(self.resume_wasted_bytes as usize);
        if wasted > 0 {
            piece.advance(wasted);
            self.resume_wasted_bytes -= wasted as u64;
        }

        // bytes fetched only to complete the last raid line are never delivered
        if piece.end_pos() > self.deliver_limit_pos {
            let keep = self.deliver_limit_pos.saturating_sub(piece.pos) as usize;
            piece.buf.truncate(keep);
        }

        if !piece.is_empty() {
            tracing::trace!(connection, pos = piece.pos, len = piece.len(), "Combined raid output");
            self.output_buffers.insert(connection, piece);
        }
        true
    }

    /// Copy (or rebuild) `partslen` bytes from every shard front into whole raid lines.
    fn combine_lines(&self, out: &mut [u8], partslen: usize) {
        if partslen == 0 {
            return;
        }
        let fronts: [Option<&[u8]>; RAIDPARTS] =
            std::array::from_fn(|i| self.raid_input_parts[i].front().and_then(|p| p.buf.data()));

        for offset in (0..partslen).step_by(RAIDSECTOR) {
            for part in 1..RAIDPARTS {
                let dest = &mut out[line_sector_range(offset, part)];
                match fronts[part] {
                    Some(src) => dest.copy_from_slice(&src[offset..offset + RAIDSECTOR]),
                    None => recover_sector(dest, &fronts, offset),
                }
            }
        }
    }

    /// Fill the final, partial raid line of the file.
    fn combine_last_line(&self, dest: &mut [u8], mut remaining: usize) {
        let fronts: [Option<&FilePiece>; RAIDPARTS] =
            std::array::from_fn(|i| self.raid_input_parts[i].front());

        let mut written = 0;
        for part in 1..RAIDPARTS {
            if remaining == 0 {
                break;
            }
            let Some(sector) = fronts[part] else {
                continue;
            };
            let n = remaining.min(sector.len());
            let target = &mut dest[written..written + n];
            match sector.buf.data() {
                Some(data) => target.copy_from_slice(&data[..n]),
                None => {
                    target.fill(0);
                    for other in fronts.iter().flatten() {
                        if let Some(data) = other.buf.data() {
                            let m = n.min(data.len());
                            super::sector::xor_into(&mut target[..m], &data[..m]);
                        }
                    }
                }
            }
            written += n;
            remaining -= n;
        }
    }

    /// Discard consumed bytes from every shard front, freeing drained pieces.
    fn roll_input_buffers(&mut self, consumed: usize) {
        for queue in self.raid_input_parts.iter_mut() {
            if let Some(front) = queue.front_mut() {
                front.advance(consumed);
                if front.is_empty() {
                    queue.pop_front();
                }
            }
        }
    }

    // =========================================================================
    // Failure recovery
    // =========================================================================

    /// Try to continue after shard `failed` errored (or was judged too slow).
    ///
    /// Below the error threshold the failed shard becomes the unused one:
    /// its buffered data and that of the previously unused shard are
    /// discarded and both restart from the common position. Returns `false`
    /// without changing any state when raid cannot continue.
    pub fn try_raid_http_get_error_recovery(&mut self, failed: usize, increment_errors: bool) -> bool {
        if !self.is_raid || failed >= RAIDPARTS {
            return false;
        }

        if increment_errors {
            if let Some(url) = self.temp_urls.get(failed) {
                self.faulty_servers.add(url);
            }
        }

        let mut counts = self.raid_http_get_error_count;
        if increment_errors {
            counts[failed] += 1;
        }
        let sum: u32 = counts.iter().sum();
        let highest = counts.iter().copied().max().unwrap_or(0);
        if sum - highest >= RAID_ERROR_THRESHOLD {
            tracing::warn!(
                connection = failed,
                errors = ?counts,
                "Raid error budget exhausted"
            );
            return false;
        }
        self.raid_http_get_error_count = counts;

        let rpp = self.raid_parts_pos;
        match self.unused_raid_connection {
            Some(unused) => {
                tracing::warn!(
                    connection = failed,
                    replacement = unused,
                    "Five-connection raid switching away from failed shard"
                );
                for shard in [unused, failed] {
                    self.reset_shard(shard, rpp);
                }
            }
            None => {
                tracing::warn!(
                    connection = failed,
                    "Six-connection raid dropping to five connections"
                );
                for shard in 0..RAIDPARTS {
                    if shard == failed {
                        self.reset_shard(shard, rpp);
                        continue;
                    }
                    // keep real data contiguous from the common position, park the rest
                    let mut pos = rpp;
                    let pieces = std::mem::take(&mut self.raid_input_parts[shard]);
                    for piece in pieces {
                        if piece.buf.is_null() {
                            continue;
                        }
                        if piece.pos == pos {
                            pos = piece.end_pos();
                            self.raid_input_parts[shard].push_back(piece);
                        } else {
                            self.raid_input_parts_recovery[shard].insert(piece.pos, piece);
                        }
                    }
                    self.raid_request_part_pos[shard] = pos;
                    self.connection_paused[shard] = false;
                }
            }
        }

        self.unused_raid_connection = Some(failed);
        true
    }

    fn reset_shard(&mut self, shard: usize, pos: u64) {
        self.raid_input_parts[shard].clear();
        self.raid_input_parts_recovery[shard].clear();
        self.raid_request_part_pos[shard] = pos;
        self.connection_paused[shard] = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{chunk_ceil, CHUNK_SEGMENT_SIZE};
    use crate::raid::encode_shards;

    const MAX_REQ: u64 = 16 * 1024 * 1024;

    fn urls() -> Vec<String> {
        (0..RAIDPARTS)
            .map(|i| format!("http://gfs{}.example.net/dl/file", i))
            .collect()
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + i / 251) as u8).collect()
    }

    fn manager(resume_pos: u64, size: u64) -> RaidBufferManager {
        let mut mgr = RaidBufferManager::new(Arc::new(FaultyServers::new()));
        mgr.set_is_raid(RaidSetup {
            urls: urls(),
            resume_pos,
            read_to_pos: size,
            file_size: size,
            max_request_size: MAX_REQ,
            all_shards: false,
        })
        .unwrap();
        mgr
    }

    /// Queue each shard from `start` in pieces of `piece_len`, nulling `missing`.
    fn feed(mgr: &mut RaidBufferManager, shards: &[Vec<u8>], missing: usize, start: u64, piece_len: usize) {
        for (part, shard) in shards.iter().enumerate() {
            let mut pos = start as usize;
            while pos < shard.len() {
                let end = (pos + piece_len).min(shard.len());
                let piece = if part == missing {
                    FilePiece::null(pos as u64, end - pos)
                } else {
                    FilePiece::from_vec(pos as u64, shard[pos..end].to_vec())
                };
                mgr.submit_buffer(part, piece);
                pos = end;
            }
        }
    }

    fn drain(mgr: &mut RaidBufferManager) -> Vec<(u64, Vec<u8>)> {
        let mut out = Vec::new();
        while let Some(piece) = mgr.get_async_output_buffer(0) {
            out.push((piece.pos, piece.buf.data().unwrap_or_default().to_vec()));
            mgr.buffer_write_completed(0);
        }
        out
    }

    fn concat(pieces: &[(u64, Vec<u8>)]) -> Vec<u8> {
        pieces.iter().flat_map(|(_, d)| d.iter().copied()).collect()
    }

    #[test]
    fn test_set_is_raid_rejects_wrong_url_count() {
        let mut mgr = RaidBufferManager::new(Arc::new(FaultyServers::new()));
        let result = mgr.set_is_raid(RaidSetup {
            urls: vec!["a".into(), "b".into()],
            resume_pos: 0,
            read_to_pos: 10,
            file_size: 10,
            max_request_size: MAX_REQ,
            all_shards: false,
        });
        assert!(matches!(result, Err(TransferError::Setup(_))));
    }

    #[test]
    fn test_default_unused_shard_is_parity() {
        let mgr = manager(0, 10_000);
        assert!(mgr.is_raid());
        assert_eq!(mgr.unused_raid_connection(), Some(0));
    }

    #[test]
    fn test_faulty_registry_biases_unused_shard() {
        let registry = Arc::new(FaultyServers::new());
        registry.add("http://gfs4.example.net/other");
        let mut mgr = RaidBufferManager::new(registry);
        mgr.set_is_raid(RaidSetup {
            urls: urls(),
            resume_pos: 0,
            read_to_pos: 10_000,
            file_size: 10_000,
            max_request_size: MAX_REQ,
            all_shards: false,
        })
        .unwrap();
        assert_eq!(mgr.unused_raid_connection(), Some(4));
    }

    #[test]
    fn test_lines_per_chunk_clamped() {
        let mgr = manager(0, 1000);
        // 16 MiB / 6 / 3 / 16 = 58254 -> 57344 after rounding to 1024
        assert_eq!(mgr.raid_lines_per_chunk(), 57_344);

        let mut small = RaidBufferManager::new(Arc::new(FaultyServers::new()));
        small
            .set_is_raid(RaidSetup {
                urls: urls(),
                resume_pos: 0,
                read_to_pos: 1000,
                file_size: 1000,
                max_request_size: 1024,
                all_shards: false,
            })
            .unwrap();
        assert_eq!(small.raid_lines_per_chunk(), MIN_RAID_LINES_PER_CHUNK);
    }

    #[test]
    fn test_reconstruct_with_each_shard_missing() {
        let data = sample(5_000);
        let shards = encode_shards(&data);
        for missing in 0..RAIDPARTS {
            let mut mgr = manager(0, data.len() as u64);
            feed(&mut mgr, &shards, missing, 0, 256);
            let out = drain(&mut mgr);
            assert_eq!(concat(&out), data, "missing shard {}", missing);
        }
    }

    #[test]
    fn test_reconstruct_partial_last_line() {
        // residual of 70 bytes exercises the end-of-file path
        let data = sample(80 * 3 + 70);
        let shards = encode_shards(&data);
        for missing in 0..RAIDPARTS {
            let mut mgr = manager(0, data.len() as u64);
            feed(&mut mgr, &shards, missing, 0, 10_000);
            assert_eq!(concat(&drain(&mut mgr)), data, "missing shard {}", missing);
        }
    }

    #[test]
    fn test_output_waits_for_slowest_shard() {
        let data = sample(8_000);
        let shards = encode_shards(&data);
        let mut mgr = manager(0, data.len() as u64);

        for part in 1..RAIDPARTS - 1 {
            mgr.submit_buffer(part, FilePiece::from_vec(0, shards[part].clone()));
        }
        mgr.submit_buffer(0, FilePiece::null(0, shards[0].len()));
        assert!(mgr.get_async_output_buffer(0).is_none());

        mgr.submit_buffer(5, FilePiece::from_vec(0, shards[5].clone()));
        assert_eq!(concat(&drain(&mut mgr)), data);
    }

    #[test]
    fn test_combine_without_new_data_is_idempotent() {
        let data = sample(300_000);
        let shards = encode_shards(&data);
        let mut mgr = manager(0, data.len() as u64);
        let half = 30_000;
        let trimmed: Vec<Vec<u8>> = shards.iter().map(|s| s[..half].to_vec()).collect();
        feed(&mut mgr, &trimmed, 0, 0, half);
        let _ = drain(&mut mgr);

        let before = (mgr.raid_parts_pos(), mgr.output_file_pos(), mgr.leftover_len());
        assert!(mgr.get_async_output_buffer(0).is_none());
        assert!(mgr.get_async_output_buffer(1).is_none());
        assert_eq!(before, (mgr.raid_parts_pos(), mgr.output_file_pos(), mgr.leftover_len()));
    }

    #[test]
    fn test_outputs_end_on_chunk_boundaries() {
        let data = sample(700_000);
        let size = data.len() as u64;
        let shards = encode_shards(&data);
        let mut mgr = manager(0, size);
        feed(&mut mgr, &shards, 2, 0, 4_096);

        let mut expected_pos = 0;
        let mut pieces = Vec::new();
        loop {
            let Some(piece) = mgr.get_async_output_buffer(0) else {
                break;
            };
            assert_eq!(piece.pos, expected_pos);
            expected_pos = piece.end_pos();
            pieces.push(piece.end_pos());
            mgr.buffer_write_completed(0);
        }
        assert_eq!(expected_pos, size);
        for end in &pieces[..pieces.len() - 1] {
            assert_eq!(chunk_ceil(*end - 1, size), *end, "piece ends inside a chunk");
        }
        assert!(pieces.len() > 1);
        assert!(pieces[0] >= CHUNK_SEGMENT_SIZE);
    }

    #[test]
    fn test_invariant_holds_during_combine() {
        let data = sample(200_000);
        let shards = encode_shards(&data);
        let mut mgr = manager(0, data.len() as u64);
        feed(&mut mgr, &shards, 3, 0, 1_024);

        while mgr.get_async_output_buffer(0).is_some() {
            if mgr.output_file_pos() + (mgr.leftover_len() as u64) < data.len() as u64 {
                assert_eq!(
                    mgr.raid_parts_pos() * 5,
                    mgr.output_file_pos() + mgr.leftover_len() as u64
                );
            }
            mgr.buffer_write_completed(0);
        }
    }

    #[test]
    fn test_resume_discards_alignment_bytes() {
        let data = sample(300_000);
        let shards = encode_shards(&data);
        let resume = 12_345;
        let mut mgr = manager(resume, data.len() as u64);

        assert_eq!(mgr.raid_parts_pos(), 2_464);
        assert_eq!(mgr.resume_wasted_bytes(), 25);
        assert_eq!(mgr.output_file_pos(), 12_320);

        feed(&mut mgr, &shards, 0, 2_464, 8_192);
        let out = drain(&mut mgr);
        assert_eq!(out[0].0, resume);
        assert_eq!(out[0].1[0], data[resume as usize]);
        assert_eq!(concat(&out), data[resume as usize..].to_vec());
    }

    #[test]
    fn test_read_to_pos_clips_delivery() {
        let data = sample(10_000);
        let shards = encode_shards(&data);
        let mut mgr = RaidBufferManager::new(Arc::new(FaultyServers::new()));
        mgr.set_is_raid(RaidSetup {
            urls: urls(),
            resume_pos: 0,
            read_to_pos: 4_010,
            file_size: data.len() as u64,
            max_request_size: MAX_REQ,
            all_shards: false,
        })
        .unwrap();

        // acquire limit is rounded up to a whole line
        assert_eq!(mgr.transfer_size(1), 4_080 / 5);
        let limited: Vec<Vec<u8>> = (0..RAIDPARTS)
            .map(|p| shards[p][..mgr.transfer_size(p) as usize].to_vec())
            .collect();
        feed(&mut mgr, &limited, 0, 0, 512);
        assert_eq!(concat(&drain(&mut mgr)), data[..4_010].to_vec());
    }

    #[test]
    fn test_unused_connection_supplies_null_pieces() {
        let mut mgr = manager(0, 1_000_000);
        let range = mgr.next_raid_range(0);
        assert!(range.new_buffer_supplied);
        assert_eq!(range.npos, mgr.transfer_size(0));
        assert_eq!(mgr.request_part_pos(0), range.npos);

        let active = mgr.next_raid_range(1);
        assert!(!active.new_buffer_supplied);
        assert_eq!(active.pos, 0);
        // the request position only moves once data is submitted
        assert_eq!(mgr.request_part_pos(1), 0);
    }

    #[test]
    fn test_connection_pauses_and_resumes() {
        let size = 200_000_000;
        let mut mgr = manager(0, size);
        let chunk = mgr.raid_lines_per_chunk() * 16;

        // shard 1 races ahead: 8 chunks beyond the common position
        let ahead = RAID_READ_AHEAD_PAUSE_CHUNKS * chunk;
        mgr.submit_buffer(1, FilePiece::from_vec(0, vec![0; ahead as usize]));
        let range = mgr.next_raid_range(1);
        assert!(range.paused);
        assert!(mgr.is_paused(1));

        // others catch up enough to bring shard 1 within 4 chunks
        let progress = (ahead - RAID_READ_AHEAD_UNPAUSE_CHUNKS * chunk) as usize;
        for part in [0usize, 2, 3, 4, 5] {
            let piece = if part == 0 {
                FilePiece::null(0, progress)
            } else {
                FilePiece::from_vec(0, vec![0; progress])
            };
            mgr.submit_buffer(part, piece);
        }
        assert!(mgr.get_async_output_buffer(0).is_some());
        mgr.buffer_write_completed(0);

        let range = mgr.next_raid_range(1);
        assert!(!range.paused);
        assert!(!mgr.is_paused(1));
    }

    #[test]
    fn test_recovery_below_threshold_swaps_unused_shard() {
        let data = sample(50_000);
        let shards = encode_shards(&data);
        let mut mgr = manager(0, data.len() as u64);
        feed(&mut mgr, &shards, 0, 0, 4_096);
        // only part of the data is combinable as output until chunk end
        assert!(mgr.queued_pieces(3) > 0);

        assert!(mgr.try_raid_http_get_error_recovery(3, true));
        assert_eq!(mgr.unused_raid_connection(), Some(3));
        assert_eq!(mgr.queued_pieces(3), 0);
        assert_eq!(mgr.queued_pieces(0), 0);
        assert_eq!(mgr.request_part_pos(3), mgr.raid_parts_pos());
        assert_eq!(mgr.request_part_pos(0), mgr.raid_parts_pos());
        assert_eq!(mgr.error_count(3), 1);
    }

    #[test]
    fn test_recovery_above_threshold_changes_nothing() {
        let mut mgr = manager(0, 50_000);
        // errors spread so that the sum excluding the worst shard reaches the threshold
        for shard in [1, 2, 3, 4, 5] {
            assert!(mgr.try_raid_http_get_error_recovery(shard, true));
        }
        let unused = mgr.unused_raid_connection();
        let counts: Vec<u32> = (0..RAIDPARTS).map(|i| mgr.error_count(i)).collect();
        let positions: Vec<u64> = (0..RAIDPARTS).map(|i| mgr.request_part_pos(i)).collect();

        // counts become [1,1,1,1,1,1]: five errors outside the worst shard
        assert!(!mgr.try_raid_http_get_error_recovery(0, true));
        assert_eq!(mgr.unused_raid_connection(), unused);
        assert_eq!((0..RAIDPARTS).map(|i| mgr.error_count(i)).collect::<Vec<_>>(), counts);
        assert_eq!((0..RAIDPARTS).map(|i| mgr.request_part_pos(i)).collect::<Vec<_>>(), positions);
    }

    #[test]
    fn test_successful_piece_resets_error_count() {
        let mut mgr = manager(0, 50_000);
        assert!(mgr.try_raid_http_get_error_recovery(2, true));
        assert!(mgr.try_raid_http_get_error_recovery(0, true));
        assert_eq!(mgr.unused_raid_connection(), Some(0));
        assert_eq!(mgr.error_count(2), 1);

        mgr.submit_buffer(2, FilePiece::from_vec(0, vec![0; 16]));
        mgr.submit_buffer(0, FilePiece::null(0, 16));
        assert_eq!(mgr.error_count(2), 0);
        assert_eq!(mgr.error_count(0), 1);
    }

    #[test]
    fn test_six_connection_mode_rotates_skip_blocks() {
        let size = 100_000_000;
        let mut mgr = RaidBufferManager::new(Arc::new(FaultyServers::new()));
        mgr.set_is_raid(RaidSetup {
            urls: urls(),
            resume_pos: 0,
            read_to_pos: size,
            file_size: size,
            max_request_size: MAX_REQ,
            all_shards: true,
        })
        .unwrap();
        assert_eq!(mgr.unused_raid_connection(), None);
        let chunk = mgr.raid_lines_per_chunk() * 16;

        // shard 0 skips the first block, shard 2 fetches up to its skip point
        let first = mgr.next_raid_range(0);
        assert!(first.new_buffer_supplied);
        assert_eq!(first.npos, chunk);
        let second = mgr.next_raid_range(2);
        assert!(!second.new_buffer_supplied);
        assert_eq!(second.npos, 2 * chunk);
    }

    #[test]
    fn test_six_connection_failure_switches_to_five() {
        let size = 100_000_000;
        let mut mgr = RaidBufferManager::new(Arc::new(FaultyServers::new()));
        mgr.set_is_raid(RaidSetup {
            urls: urls(),
            resume_pos: 0,
            read_to_pos: size,
            file_size: size,
            max_request_size: MAX_REQ,
            all_shards: true,
        })
        .unwrap();
        let chunk = mgr.raid_lines_per_chunk() * 16;
        // shard 1 received its first block; shard 0 queued a null for its skip block
        mgr.submit_buffer(1, FilePiece::from_vec(0, vec![1; chunk as usize]));
        let _ = mgr.next_raid_range(0);

        assert!(mgr.try_raid_http_get_error_recovery(4, true));
        assert_eq!(mgr.unused_raid_connection(), Some(4));
        assert_eq!(mgr.request_part_pos(1), chunk);
        // the null skip block of shard 0 is dropped and must be fetched for real
        assert_eq!(mgr.queued_pieces(0), 0);
        assert_eq!(mgr.request_part_pos(0), 0);
    }

    #[test]
    fn test_parked_piece_is_reused() {
        let mut mgr = manager(0, 100_000_000);
        let chunk = mgr.raid_lines_per_chunk() * 16;
        // a piece beyond the tail gets parked
        mgr.submit_buffer(2, FilePiece::from_vec(chunk, vec![0; 16]));
        assert_eq!(mgr.queued_pieces(2), 0);

        // the next fetch stops at the parked piece
        let range = mgr.next_raid_range(2);
        assert_eq!(range.npos, chunk);
        mgr.submit_buffer(2, FilePiece::from_vec(0, vec![0; chunk as usize]));

        let reuse = mgr.next_raid_range(2);
        assert!(reuse.new_buffer_supplied);
        assert_eq!(reuse.npos, chunk + 16);
        assert_eq!(mgr.queued_pieces(2), 2);
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]

            #[test]
            fn test_roundtrip_with_any_missing_shard(
                len in 0usize..6_000,
                missing in 0usize..RAIDPARTS,
                piece_sectors in 1usize..40,
            ) {
                let data = sample(len);
                let shards = encode_shards(&data);
                let mut mgr = manager(0, len as u64);
                feed(&mut mgr, &shards, missing, 0, piece_sectors * RAIDSECTOR);
                let out = drain(&mut mgr);

                let mut expected_pos = 0;
                for (pos, bytes) in &out {
                    prop_assert_eq!(*pos, expected_pos);
                    expected_pos += bytes.len() as u64;
                }
                prop_assert_eq!(concat(&out), data);
            }
        }
    }
}
