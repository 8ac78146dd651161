// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use lantern_beacon::Engine;
use lantern_chain::{Beacon, ChainInfo};
use serde::{Deserialize, Serialize};

/// One served chain: the engine (and through it the store), the cached hex
/// form of the chain hash used in URLs, and the owning process's disabled
/// flag, raised on a fatal storage failure.
pub struct ChainHandle {
    engine: Arc<Engine>,
    hash_hex: String,
    disabled: Arc<AtomicBool>,
}

impl ChainHandle {
    pub fn new(engine: Arc<Engine>, disabled: Arc<AtomicBool>) -> Arc<Self> {
        let hash_hex = hex::encode(engine.chain_hash());
        Arc::new(ChainHandle {
            engine,
            hash_hex,
            disabled,
        })
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Whether the owning beacon-id has been disabled after a storage
    /// failure; a disabled chain is unhealthy no matter what its store
    /// still says.
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    pub fn hash_hex(&self) -> &str {
        &self.hash_hex
    }

    pub fn info(&self) -> ChainInfo {
        let state = self.engine.epoch_state();
        ChainInfo::from_group(&state.group, self.engine.chain_hash())
    }

    pub fn latest_round(&self) -> u64 {
        self.engine.last_beacon().round()
    }

    pub fn expected_round(&self) -> u64 {
        self.engine
            .epoch_state()
            .clock
            .round_at(SystemTime::now())
    }

    /// Seconds until `round` is due; zero if already due.
    pub fn seconds_until(&self, round: u64) -> u64 {
        self.engine
            .epoch_state()
            .clock
            .time_until_round(round, SystemTime::now())
            .as_secs()
    }

    pub fn period_secs(&self) -> u64 {
        self.engine.epoch_state().group.period.as_secs()
    }
}

/// Shared router state: every chain hosted by this daemon. Chains appear
/// as their first DKG completes, so the set is behind a lock.
#[derive(Clone, Default)]
pub struct AppState {
    chains: Arc<parking_lot::RwLock<Vec<Arc<ChainHandle>>>>,
}

impl AppState {
    pub fn new(chains: Vec<Arc<ChainHandle>>) -> Self {
        AppState {
            chains: Arc::new(parking_lot::RwLock::new(chains)),
        }
    }

    pub fn add_chain(&self, handle: Arc<ChainHandle>) {
        let mut chains = self.chains.write();
        if !chains.iter().any(|c| c.hash_hex() == handle.hash_hex()) {
            chains.push(handle);
        }
    }

    pub fn chains(&self) -> Vec<Arc<ChainHandle>> {
        self.chains.read().clone()
    }

    /// Resolve a chain by full hash or unambiguous prefix.
    pub fn resolve(&self, chain: &str) -> Option<Arc<ChainHandle>> {
        if chain.is_empty() {
            return None;
        }
        let chains = self.chains.read();
        let mut matches = chains.iter().filter(|c| c.hash_hex().starts_with(chain));
        let found = matches.next()?;
        if matches.next().is_some() {
            return None;
        }
        Some(found.clone())
    }
}

/// JSON rendering of a beacon. `previous_signature` is omitted for
/// unchained chains.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BeaconJson {
    pub round: u64,
    pub signature: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_signature: Option<String>,
    pub randomness: String,
}

impl From<&Beacon> for BeaconJson {
    fn from(beacon: &Beacon) -> Self {
        BeaconJson {
            round: beacon.round(),
            signature: hex::encode(beacon.signature()),
            previous_signature: if beacon.previous_signature().is_empty() {
                None
            } else {
                Some(hex::encode(beacon.previous_signature()))
            },
            randomness: hex::encode(beacon.randomness()),
        }
    }
}
