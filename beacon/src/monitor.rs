// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::Arc;
use std::time::Duration;

use lantern_net::FailureLedger;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Sampling cadence of the monitor.
const REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Watches the partial-dispatch failure ledger and escalates when the set of
/// failing peers eats into the fault budget `n - threshold`.
pub struct ThresholdMonitor {
    beacon_id: String,
    ledger: Arc<FailureLedger>,
    params: RwLock<(usize, usize)>,
}

impl ThresholdMonitor {
    pub fn new(beacon_id: String, ledger: Arc<FailureLedger>, n: usize, threshold: usize) -> Self {
        ThresholdMonitor {
            beacon_id,
            ledger,
            params: RwLock::new((n, threshold)),
        }
    }

    /// Swap in the post-reshare committee parameters.
    pub fn update_params(&self, n: usize, threshold: usize) {
        *self.params.write() = (n, threshold);
    }

    /// Drain the interval's failing set and log at a severity reflecting how
    /// much of the fault budget it consumes.
    pub fn report(&self) {
        let failing = self.ledger.drain();
        let (n, threshold) = *self.params.read();
        let budget = n.saturating_sub(threshold);
        let count = failing.len();

        if count == 0 {
            return;
        }
        let peers: Vec<&str> = failing.iter().map(String::as_str).collect();
        if count >= budget.max(1) {
            error!(
                beacon_id = %self.beacon_id,
                failing = count,
                fault_budget = budget,
                ?peers,
                "chain at risk: partial dispatch failing to too many peers"
            );
        } else if count * 2 >= budget {
            warn!(
                beacon_id = %self.beacon_id,
                failing = count,
                fault_budget = budget,
                ?peers,
                "partial dispatch failures eating into fault budget"
            );
        } else {
            debug!(
                beacon_id = %self.beacon_id,
                failing = count,
                ?peers,
                "partial dispatch failures this interval"
            );
        }
    }

    /// Parked loop; samples once per minute until canceled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(REPORT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick fires immediately; skip it
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.report(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_the_ledger_each_report() {
        let ledger = Arc::new(FailureLedger::new());
        let monitor = ThresholdMonitor::new("default".into(), ledger.clone(), 5, 4);
        ledger.record("a:1");
        ledger.record("a:1");
        ledger.record("b:2");
        assert_eq!(ledger.len(), 2);
        monitor.report();
        assert!(ledger.is_empty());
    }

    #[test]
    fn params_update_atomically() {
        let monitor =
            ThresholdMonitor::new("default".into(), Arc::new(FailureLedger::new()), 5, 4);
        monitor.update_params(6, 5);
        assert_eq!(*monitor.params.read(), (6, 5));
    }
}
