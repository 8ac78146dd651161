// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::{BTreeMap, HashMap};

/// How many rounds past the one being collected a partial may be buffered.
/// Anything further out is dropped and counted.
pub const FUTURE_ROUND_WINDOW: u64 = 3;

/// Per-round cap on buffered partials, as a multiple of the roster size.
const PER_ROUND_FACTOR: usize = 2;

/// What happened to an inserted partial.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheOutcome {
    /// Counted toward the round currently being collected.
    Current,
    /// Buffered for a near-future round, replayed on advance.
    Buffered,
    /// Same `(round, index)` seen before; first write wins.
    Duplicate,
    /// At or before the last finalized round.
    OutOfOrder,
    /// Beyond the buffering window.
    TooFarAhead,
    /// The buffered round is full.
    RoundFull,
}

/// Collects partial signatures per round. The engine fully validates
/// current-round partials before insertion; future-round entries are only
/// structurally checked and re-validated when their round becomes current.
pub struct PartialCache {
    /// The round being collected: last finalized + 1.
    current: u64,
    rounds: BTreeMap<u64, HashMap<u32, Vec<u8>>>,
    roster_size: usize,
    out_of_order: u64,
    too_far_ahead: u64,
    duplicates: u64,
}

impl PartialCache {
    pub fn new(current: u64, roster_size: usize) -> Self {
        PartialCache {
            current,
            rounds: BTreeMap::new(),
            roster_size,
            out_of_order: 0,
            too_far_ahead: 0,
            duplicates: 0,
        }
    }

    pub fn current_round(&self) -> u64 {
        self.current
    }

    pub fn insert(&mut self, round: u64, index: u32, sig: Vec<u8>) -> CacheOutcome {
        if round < self.current {
            self.out_of_order += 1;
            return CacheOutcome::OutOfOrder;
        }
        if round > self.current + FUTURE_ROUND_WINDOW {
            self.too_far_ahead += 1;
            return CacheOutcome::TooFarAhead;
        }
        let slot = self.rounds.entry(round).or_default();
        if slot.contains_key(&index) {
            self.duplicates += 1;
            return CacheOutcome::Duplicate;
        }
        if round != self.current && slot.len() >= self.roster_size * PER_ROUND_FACTOR {
            return CacheOutcome::RoundFull;
        }
        slot.insert(index, sig);
        if round == self.current {
            CacheOutcome::Current
        } else {
            CacheOutcome::Buffered
        }
    }

    pub fn count(&self, round: u64) -> usize {
        self.rounds.get(&round).map(HashMap::len).unwrap_or(0)
    }

    /// Snapshot of the partials collected for `round`.
    pub fn partials(&self, round: u64) -> Vec<(u32, Vec<u8>)> {
        self.rounds
            .get(&round)
            .map(|slot| slot.iter().map(|(i, s)| (*i, s.clone())).collect())
            .unwrap_or_default()
    }

    /// Move collection to `round`, dropping state for everything before it
    /// and handing back the buffered entries now due for re-validation.
    pub fn advance(&mut self, round: u64) -> Vec<(u32, Vec<u8>)> {
        self.current = round;
        self.rounds = self.rounds.split_off(&round);
        self.rounds
            .remove(&round)
            .map(|slot| slot.into_iter().collect())
            .unwrap_or_default()
    }

    pub fn update_roster_size(&mut self, roster_size: usize) {
        self.roster_size = roster_size;
    }

    pub fn stats(&self) -> (u64, u64, u64) {
        (self.out_of_order, self.too_far_ahead, self.duplicates)
    }
}
