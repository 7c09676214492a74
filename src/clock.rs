//! Wall-clock timestamps and inter-host clock offset estimation.
//!
//! Offsets are `local - peer` in microseconds. Each complete round trip
//! yields a candidate interval; consistent candidates narrow the running
//! bounds, inconsistent ones mean one of the clocks moved and reset them.

use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Microseconds since the Unix epoch.
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// What a sample did to the bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetUpdate {
    /// At least one bound moved inward.
    Narrowed,
    /// The sample was consistent but no tighter than what we had.
    Unchanged,
    /// The sample was disjoint from the bounds, which were replaced.
    Drift,
}

/// Inferred range of the clock difference between this host and its peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetBounds {
    lower: i64,
    upper: i64,
}

impl Default for OffsetBounds {
    fn default() -> Self {
        Self::unbounded()
    }
}

fn saturate(value: i128) -> i64 {
    value.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

impl OffsetBounds {
    /// The widest interval, used before the first sample.
    pub const fn unbounded() -> Self {
        Self {
            lower: i64::MIN,
            upper: i64::MAX,
        }
    }

    pub fn lower(&self) -> i64 {
        self.lower
    }

    pub fn upper(&self) -> i64 {
        self.upper
    }

    /// Candidate interval for one round trip.
    ///
    /// A negative transit time can only come from a clock stepping during
    /// the exchange and is treated as zero.
    pub fn candidate(
        local_write_start: u64,
        peer_read_end: u64,
        peer_write_start: u64,
        local_read_end: u64,
    ) -> Self {
        let (lws, pre, pws, lre) = (
            local_write_start as i128,
            peer_read_end as i128,
            peer_write_start as i128,
            local_read_end as i128,
        );
        let transit = ((lre - lws) - (pws - pre)).max(0);
        let outbound = lws - pre;
        let inbound = lre - pws;
        Self {
            lower: saturate(outbound.min(inbound) - transit),
            upper: saturate(outbound.max(inbound) + transit),
        }
    }

    /// Folds one round trip into the bounds.
    pub fn update(
        &mut self,
        local_write_start: u64,
        peer_read_end: u64,
        peer_write_start: u64,
        local_read_end: u64,
    ) -> OffsetUpdate {
        let candidate = Self::candidate(
            local_write_start,
            peer_read_end,
            peer_write_start,
            local_read_end,
        );
        self.merge(candidate)
    }

    /// Intersects with `candidate`, or adopts it when the two are disjoint.
    pub fn merge(&mut self, candidate: OffsetBounds) -> OffsetUpdate {
        if candidate.upper < self.lower || candidate.lower > self.upper {
            debug!(
                lower = self.lower,
                upper = self.upper,
                new_lower = candidate.lower,
                new_upper = candidate.upper,
                "Clock drift detected, resetting offset bounds"
            );
            *self = candidate;
            return OffsetUpdate::Drift;
        }

        let narrowed = candidate.lower > self.lower || candidate.upper < self.upper;
        self.lower = self.lower.max(candidate.lower);
        self.upper = self.upper.min(candidate.upper);
        if narrowed {
            OffsetUpdate::Narrowed
        } else {
            OffsetUpdate::Unchanged
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_micros_advances() {
        let a = now_micros();
        let b = now_micros();
        assert!(a > 1_500_000_000_000_000);
        assert!(b >= a);
    }

    #[test]
    fn test_symmetric_exchange() {
        // Peer clock is 1000µs behind, 10µs each way, 5µs of processing.
        let candidate = OffsetBounds::candidate(2000, 1010, 1015, 2025);
        assert!(candidate.lower() <= 1000);
        assert!(candidate.upper() >= 1000);
        assert_eq!(candidate.lower(), 990 - 20);
        assert_eq!(candidate.upper(), 1010 + 20);
    }

    #[test]
    fn test_first_sample_adopted() {
        let mut bounds = OffsetBounds::unbounded();
        assert_eq!(bounds.update(2000, 1010, 1015, 2025), OffsetUpdate::Narrowed);
        assert_eq!(bounds, OffsetBounds::candidate(2000, 1010, 1015, 2025));
    }

    #[test]
    fn test_identical_samples_do_not_widen() {
        let mut bounds = OffsetBounds::unbounded();
        bounds.update(2000, 1010, 1015, 2025);
        let before = bounds;
        assert_eq!(bounds.update(2000, 1010, 1015, 2025), OffsetUpdate::Unchanged);
        assert_eq!(bounds, before);
    }

    #[test]
    fn test_drift_replaces_bounds() {
        let mut bounds = OffsetBounds::unbounded();
        bounds.update(2000, 1010, 1015, 2025);
        // Peer clock jumped forward by a second.
        let candidate = OffsetBounds::candidate(3000, 1_002_010, 1_002_015, 3025);
        assert_eq!(
            bounds.update(3000, 1_002_010, 1_002_015, 3025),
            OffsetUpdate::Drift
        );
        assert_eq!(bounds, candidate);
    }

    #[test]
    fn test_negative_transit_clamped() {
        // Peer claims 100µs of processing inside a 10µs round trip.
        let candidate = OffsetBounds::candidate(1000, 1000, 1100, 1010);
        assert!(candidate.lower() <= candidate.upper());
    }
}
