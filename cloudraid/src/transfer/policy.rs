//! Failure classification and slow-shard detection.

use std::time::{Duration, Instant};

use crate::raid::RAIDPARTS;
use crate::transport::{
    TransportFailure, STATUS_FORBIDDEN, STATUS_NOT_FOUND, STATUS_OVER_QUOTA, STATUS_SERVICE_UNAVAILABLE,
    STATUS_TOO_MANY_REQUESTS,
};

/// How often shard speeds are compared.
pub const SLOW_SHARD_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Consecutive slow checks before a shard is swapped out.
pub const SLOW_SHARD_STRIKES: u32 = 3;

/// Peers must average at least this many bytes/s before a shard is judged.
pub const SLOW_SHARD_MIN_PEER_SPEED: u64 = 50 * 1024;

/// Why a request did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestFailure {
    /// The server answered with a non-success status.
    Status { status: u16, time_left: Option<Duration> },
    /// No usable response arrived.
    Transport(TransportFailure),
}

impl RequestFailure {
    pub fn status(&self) -> Option<u16> {
        match self {
            RequestFailure::Status { status, .. } => Some(*status),
            RequestFailure::Transport(_) => None,
        }
    }
}

/// What the slot does about a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Fail the transfer with an over-quota backoff.
    OverQuota(Duration),
    /// Re-post the same range after a short pause.
    RateLimited,
    /// Swap the shard out and continue on the other five.
    RaidRecovery,
    /// Fail the transfer; the URL is probably stale.
    Again,
    /// Use the one soft-failure cycle.
    SoftRetry,
}

/// Map a failure to its handling.
pub fn classify(failure: &RequestFailure, is_raid: bool, default_quota_backoff: Duration) -> FailureAction {
    match failure {
        RequestFailure::Status { status, time_left } => match *status {
            STATUS_OVER_QUOTA => FailureAction::OverQuota(
                time_left
                    .filter(|t| !t.is_zero())
                    .unwrap_or(default_quota_backoff),
            ),
            STATUS_TOO_MANY_REQUESTS => FailureAction::RateLimited,
            STATUS_FORBIDDEN | STATUS_NOT_FOUND | STATUS_SERVICE_UNAVAILABLE if is_raid => {
                FailureAction::RaidRecovery
            }
            STATUS_FORBIDDEN | STATUS_NOT_FOUND => FailureAction::Again,
            _ => FailureAction::SoftRetry,
        },
        RequestFailure::Transport(TransportFailure::Timeout {
            headers_received: false,
        }) if is_raid => FailureAction::RaidRecovery,
        RequestFailure::Transport(_) => FailureAction::SoftRetry,
    }
}

/// Tracks persistently slow shards in five-connection raid mode.
#[derive(Debug, Clone)]
pub struct SlowShardDetector {
    strikes: [u32; RAIDPARTS],
    swaps: u32,
    max_swaps: u32,
    last_check: Option<Instant>,
}

impl SlowShardDetector {
    pub fn new(max_swaps: u32) -> Self {
        Self {
            strikes: [0; RAIDPARTS],
            swaps: 0,
            max_swaps,
            last_check: None,
        }
    }

    pub fn swaps(&self) -> u32 {
        self.swaps
    }

    /// Compare recent speeds; `None` marks a shard not being fetched.
    ///
    /// Returns the shard to swap out, if one has been under half its peers'
    /// average for [`SLOW_SHARD_STRIKES`] consecutive checks.
    pub fn check(&mut self, speeds: &[Option<u64>; RAIDPARTS], now: Instant) -> Option<usize> {
        if self.swaps >= self.max_swaps {
            return None;
        }
        if let Some(last) = self.last_check {
            if now.saturating_duration_since(last) < SLOW_SHARD_CHECK_INTERVAL {
                return None;
            }
        }
        self.last_check = Some(now);

        let active: Vec<(usize, u64)> = speeds
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.map(|s| (i, s)))
            .collect();
        if active.len() < 2 {
            return None;
        }
        let total: u64 = active.iter().map(|&(_, s)| s).sum();

        let mut slowest = None;
        for &(i, speed) in &active {
            let peer_avg = (total - speed) / (active.len() as u64 - 1);
            if peer_avg >= SLOW_SHARD_MIN_PEER_SPEED && speed < peer_avg / 2 {
                self.strikes[i] += 1;
                if self.strikes[i] >= SLOW_SHARD_STRIKES && slowest.is_none() {
                    slowest = Some(i);
                }
            } else {
                self.strikes[i] = 0;
            }
        }

        let shard = slowest?;
        self.swaps += 1;
        self.strikes = [0; RAIDPARTS];
        tracing::info!(
            connection = shard,
            speed = speeds[shard].unwrap_or(0),
            swaps = self.swaps,
            "Swapping out slow raid shard"
        );
        Some(shard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUOTA: Duration = Duration::from_secs(3600);

    fn status(code: u16) -> RequestFailure {
        RequestFailure::Status {
            status: code,
            time_left: None,
        }
    }

    #[test]
    fn test_over_quota_uses_time_left() {
        let failure = RequestFailure::Status {
            status: 509,
            time_left: Some(Duration::from_secs(120)),
        };
        assert_eq!(
            classify(&failure, false, QUOTA),
            FailureAction::OverQuota(Duration::from_secs(120))
        );
        assert_eq!(classify(&status(509), true, QUOTA), FailureAction::OverQuota(QUOTA));
    }

    #[test]
    fn test_raid_statuses_recover() {
        for code in [403, 404, 503] {
            assert_eq!(classify(&status(code), true, QUOTA), FailureAction::RaidRecovery);
        }
        let timeout = RequestFailure::Transport(TransportFailure::Timeout {
            headers_received: false,
        });
        assert_eq!(classify(&timeout, true, QUOTA), FailureAction::RaidRecovery);
    }

    #[test]
    fn test_non_raid_statuses() {
        assert_eq!(classify(&status(403), false, QUOTA), FailureAction::Again);
        assert_eq!(classify(&status(404), false, QUOTA), FailureAction::Again);
        assert_eq!(classify(&status(503), false, QUOTA), FailureAction::SoftRetry);
        assert_eq!(classify(&status(429), false, QUOTA), FailureAction::RateLimited);
        assert_eq!(classify(&status(500), true, QUOTA), FailureAction::SoftRetry);
        let reset = RequestFailure::Transport(TransportFailure::Connection("reset".into()));
        assert_eq!(classify(&reset, true, QUOTA), FailureAction::SoftRetry);
    }

    #[test]
    fn test_slow_shard_needs_three_strikes() {
        let mut detector = SlowShardDetector::new(2);
        let t0 = Instant::now();
        let speeds = [Some(1_000_000), Some(1_000_000), None, Some(100_000), Some(1_000_000), Some(1_000_000)];

        assert_eq!(detector.check(&speeds, t0), None);
        // too soon: ignored
        assert_eq!(detector.check(&speeds, t0 + Duration::from_millis(500)), None);
        assert_eq!(detector.check(&speeds, t0 + Duration::from_secs(1)), None);
        assert_eq!(detector.check(&speeds, t0 + Duration::from_secs(2)), Some(3));
        assert_eq!(detector.swaps(), 1);
    }

    #[test]
    fn test_slow_peers_are_not_judged() {
        let mut detector = SlowShardDetector::new(2);
        let t0 = Instant::now();
        let speeds = [Some(10_000), Some(10_000), Some(1_000), Some(10_000), Some(10_000), None];
        for s in 0..10 {
            assert_eq!(detector.check(&speeds, t0 + Duration::from_secs(s)), None);
        }
    }

    #[test]
    fn test_swap_cap() {
        let mut detector = SlowShardDetector::new(2);
        let t0 = Instant::now();
        let speeds = [Some(1_000_000), Some(1), Some(1_000_000), Some(1_000_000), Some(1_000_000), None];
        let swaps: Vec<usize> = (0..20)
            .filter_map(|s| detector.check(&speeds, t0 + Duration::from_secs(s)))
            .collect();
        assert_eq!(swaps, vec![1, 1]);
    }

    #[test]
    fn test_recovered_shard_loses_strikes() {
        let mut detector = SlowShardDetector::new(2);
        let t0 = Instant::now();
        let slow = [Some(1_000_000), Some(1), Some(1_000_000), Some(1_000_000), Some(1_000_000), None];
        let fine = [Some(1_000_000); RAIDPARTS];
        assert_eq!(detector.check(&slow, t0), None);
        assert_eq!(detector.check(&slow, t0 + Duration::from_secs(1)), None);
        assert_eq!(detector.check(&fine, t0 + Duration::from_secs(2)), None);
        assert_eq!(detector.check(&slow, t0 + Duration::from_secs(3)), None);
    }
}
