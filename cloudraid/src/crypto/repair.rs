//! Late-entry meta-MAC repair.
//!
//! Some historical uploads recorded a whole-file MAC that left out one or two
//! runs of chunk MACs near the end of the file: a later chunk completed the
//! upload while earlier chunks were still being accounted for. Those files
//! are intact, but their recorded MAC only matches if the same runs are
//! skipped. This search accepts exactly that pattern and nothing more:
//!
//! - a single gap anywhere within the last [`SINGLE_GAP_WINDOW`] chunks, or
//! - two gaps within the last [`DOUBLE_GAP_WINDOW`] chunks.
//!
//! It runs only after a plain meta-MAC comparison has already failed.

use std::ops::Range;

use super::chunk::{fold_mac, ChunkMacMap, MetaMac};
use super::cipher::{MacBlock, TransferCipher, BLOCK_SIZE};

/// Trailing chunks searched for a single missing run.
const SINGLE_GAP_WINDOW: usize = 64;

/// Trailing chunks searched for two missing runs.
const DOUBLE_GAP_WINDOW: usize = 16;

/// Chunk index ranges that had to be skipped to reproduce the expected MAC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GapMatch {
    pub first: Range<usize>,
    pub second: Option<Range<usize>>,
}

/// Search for one or two trailing gaps that reproduce `expected`.
pub fn find_late_gap_match(
    macs: &ChunkMacMap,
    cipher: &TransferCipher,
    expected: MetaMac,
) -> Option<GapMatch> {
    let entries = macs.macs();
    let n = entries.len();

    if let Some(found) = search_single_gap(&entries, cipher, expected) {
        tracing::warn!(
            gap_start = found.first.start,
            gap_len = found.first.len(),
            chunks = n,
            "Meta MAC matched after skipping one late gap"
        );
        return Some(found);
    }

    let found = search_double_gap(&entries, cipher, expected)?;
    tracing::warn!(
        gap1 = ?found.first,
        gap2 = ?found.second,
        chunks = n,
        "Meta MAC matched after skipping two late gaps"
    );
    Some(found)
}

fn fold_range(cipher: &TransferCipher, state: &mut MacBlock, entries: &[MacBlock]) {
    for mac in entries {
        fold_mac(cipher, state, mac);
    }
}

fn prefix_state(cipher: &TransferCipher, entries: &[MacBlock], upto: usize) -> MacBlock {
    let mut state = [0u8; BLOCK_SIZE];
    fold_range(cipher, &mut state, &entries[..upto]);
    state
}

fn search_single_gap(
    entries: &[MacBlock],
    cipher: &TransferCipher,
    expected: MetaMac,
) -> Option<GapMatch> {
    let n = entries.len();
    let window = n.saturating_sub(SINGLE_GAP_WINDOW);
    let mut before_gap = prefix_state(cipher, entries, window);

    for start in window..n {
        for end in start + 1..=n {
            let mut state = before_gap;
            fold_range(cipher, &mut state, &entries[end..]);
            if MetaMac::condense(&state) == expected {
                return Some(GapMatch {
                    first: start..end,
                    second: None,
                });
            }
        }
        fold_mac(cipher, &mut before_gap, &entries[start]);
    }
    None
}

fn search_double_gap(
    entries: &[MacBlock],
    cipher: &TransferCipher,
    expected: MetaMac,
) -> Option<GapMatch> {
    let n = entries.len();
    let window = n.saturating_sub(DOUBLE_GAP_WINDOW);
    let mut before_first = prefix_state(cipher, entries, window);

    for s1 in window..n {
        for e1 in s1 + 1..n {
            // at least one chunk between the gaps
            for s2 in e1 + 1..n {
                let mut between = before_first;
                fold_range(cipher, &mut between, &entries[e1..s2]);
                for e2 in s2 + 1..=n {
                    let mut state = between;
                    fold_range(cipher, &mut state, &entries[e2..]);
                    if MetaMac::condense(&state) == expected {
                        return Some(GapMatch {
                            first: s1..e1,
                            second: Some(s2..e2),
                        });
                    }
                }
            }
        }
        fold_mac(cipher, &mut before_first, &entries[s1]);
    }
    None
}
