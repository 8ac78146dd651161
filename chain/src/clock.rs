// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// The logical round clock: round `r` is emitted at
/// `genesis_time + r * period`, so the expected round at any instant is the
/// number of whole periods elapsed since genesis.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoundClock {
    genesis_time: u64,
    period: Duration,
}

impl RoundClock {
    pub fn new(genesis_time: u64, period: Duration) -> Self {
        assert!(!period.is_zero(), "beacon period must be non-zero");
        RoundClock {
            genesis_time,
            period,
        }
    }

    pub fn genesis_time(&self) -> u64 {
        self.genesis_time
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// The round expected to exist at `now`; 0 before genesis.
    pub fn round_at(&self, now: SystemTime) -> u64 {
        let now_ms = unix_millis(now);
        let genesis_ms = self.genesis_time as u128 * 1000;
        if now_ms < genesis_ms {
            return 0;
        }
        ((now_ms - genesis_ms) / self.period.as_millis()) as u64
    }

    /// Wall-clock emission time of `round`.
    pub fn time_of_round(&self, round: u64) -> SystemTime {
        let offset_ms = (self.period.as_millis() as u64).saturating_mul(round);
        UNIX_EPOCH + Duration::from_secs(self.genesis_time) + Duration::from_millis(offset_ms)
    }

    /// Time remaining until `round` is due; zero if it is already due.
    pub fn time_until_round(&self, round: u64, now: SystemTime) -> Duration {
        self.time_of_round(round)
            .duration_since(now)
            .unwrap_or_default()
    }

    /// The next round after `now` together with its emission time.
    pub fn next_round(&self, now: SystemTime) -> (u64, SystemTime) {
        let next = self.round_at(now) + 1;
        (next, self.time_of_round(next))
    }
}

fn unix_millis(t: SystemTime) -> u128 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock() -> RoundClock {
        RoundClock::new(1_000_000, Duration::from_secs(3))
    }

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn round_zero_before_and_at_genesis() {
        assert_eq!(clock().round_at(at(999_990)), 0);
        assert_eq!(clock().round_at(at(1_000_000)), 0);
        assert_eq!(clock().round_at(at(1_000_002)), 0);
    }

    #[test]
    fn rounds_advance_every_period() {
        let c = clock();
        assert_eq!(c.round_at(at(1_000_003)), 1);
        assert_eq!(c.round_at(at(1_000_005)), 1);
        assert_eq!(c.round_at(at(1_000_006)), 2);
        assert_eq!(c.round_at(at(1_000_300)), 100);
    }

    #[test]
    fn time_of_round_inverts_round_at() {
        let c = clock();
        for round in [1u64, 2, 50, 1000] {
            assert_eq!(c.round_at(c.time_of_round(round)), round);
        }
    }

    #[test]
    fn next_round_is_strictly_in_the_future() {
        let c = clock();
        let (round, when) = c.next_round(at(1_000_004));
        assert_eq!(round, 2);
        assert_eq!(when, at(1_000_006));
    }

    #[test]
    fn time_until_due_round_is_zero() {
        let c = clock();
        assert_eq!(
            c.time_until_round(1, at(1_000_004)),
            Duration::from_secs(0)
        );
        assert_eq!(
            c.time_until_round(3, at(1_000_004)),
            Duration::from_secs(5)
        );
    }
}
