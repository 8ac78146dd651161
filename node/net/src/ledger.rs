// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::HashSet;

use parking_lot::Mutex;

/// Per-interval record of peers that failed at least one partial dispatch.
/// Duplicate failures for a peer within an interval count once; the
/// threshold monitor drains the set once per sampling tick.
#[derive(Default)]
pub struct FailureLedger {
    failing: Mutex<HashSet<String>>,
}

impl FailureLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, peer: &str) {
        self.failing.lock().insert(peer.to_owned());
    }

    /// Take the current interval's failing set, resetting it.
    pub fn drain(&self) -> HashSet<String> {
        std::mem::take(&mut *self.failing.lock())
    }

    pub fn len(&self) -> usize {
        self.failing.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.failing.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicates_count_once_and_drain_resets() {
        let ledger = FailureLedger::new();
        ledger.record("10.0.0.1:8080");
        ledger.record("10.0.0.1:8080");
        ledger.record("10.0.0.2:8080");
        assert_eq!(ledger.len(), 2);

        let drained = ledger.drain();
        assert_eq!(drained.len(), 2);
        assert!(ledger.is_empty());
    }
}
