// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use lantern_chain::proto::{PartialBeaconPacket, StatusResponse};
use lantern_chain::{Beacon, BeaconError, Group, RoundClock};
use lantern_crypto::{sign_partial, verify_partial, verify_sig, Share};
use lantern_db::ChainStore;
use lantern_net::{ProtocolClient, DEFAULT_CALL_TIMEOUT};
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheOutcome, PartialCache};
use crate::errors::EngineError;
use crate::monitor::ThresholdMonitor;
use crate::sync::sync_chain_from;

/// Buffered finalized-beacon broadcast; slow subscribers miss rounds and
/// resync rather than applying backpressure to the engine.
const FINALIZED_CHANNEL_CAPACITY: usize = 64;

/// One epoch's immutable signing state. Rotated atomically at reshare.
pub struct EpochState {
    pub group: Arc<Group>,
    pub share: Option<Share>,
    pub clock: RoundClock,
}

impl EpochState {
    /// Build the state for `group`. For a reshare the clock is re-anchored
    /// so the round counter stays continuous even if the period changed:
    /// the transition round keeps its wall-clock emission time.
    fn new(group: Arc<Group>, share: Option<Share>, previous: Option<&RoundClock>) -> Self {
        let clock = match (previous, group.transition_time) {
            (Some(prev), Some(transition)) => {
                let at = UNIX_EPOCH + Duration::from_secs(transition);
                let transition_round = prev.round_at(at);
                let genesis = transition - transition_round * group.period.as_secs();
                RoundClock::new(genesis, group.period)
            }
            _ => RoundClock::new(group.genesis_time, group.period),
        };
        EpochState {
            group,
            share,
            clock,
        }
    }

    fn my_index(&self) -> Option<u32> {
        self.share.as_ref().map(|s| s.index())
    }
}

/// The per-chain beacon engine.
pub struct Engine {
    beacon_id: String,
    chain_hash: Vec<u8>,
    store: Arc<dyn ChainStore>,
    client: Arc<dyn ProtocolClient>,
    monitor: Arc<ThresholdMonitor>,

    state: RwLock<Arc<EpochState>>,
    staged: Mutex<Option<(Arc<Group>, Option<Share>)>>,

    cache: Mutex<PartialCache>,
    last_beacon: RwLock<Beacon>,
    aggregation: tokio::sync::Mutex<()>,

    finalized: broadcast::Sender<Beacon>,
    latest: watch::Sender<u64>,

    catching_up: AtomicBool,
    invalid_partials: AtomicU64,
}

impl Engine {
    /// Open the engine for one beacon-id, seeding the genesis beacon on a
    /// fresh store. `share` is `None` for follower deployments.
    pub async fn new(
        store: Arc<dyn ChainStore>,
        client: Arc<dyn ProtocolClient>,
        monitor: Arc<ThresholdMonitor>,
        group: Arc<Group>,
        share: Option<Share>,
        chain_hash: Vec<u8>,
    ) -> Result<Arc<Self>, EngineError> {
        group.validate()?;
        let last = match store.last().await {
            Ok(last) => last,
            Err(e) if e.is_not_found() => {
                let genesis = Beacon::genesis(group.genesis_seed.clone());
                store.put(&genesis).await?;
                genesis
            }
            Err(e) => return Err(e.into()),
        };

        let (finalized, _) = broadcast::channel(FINALIZED_CHANNEL_CAPACITY);
        let (latest, _) = watch::channel(last.round());
        let cache = PartialCache::new(last.round() + 1, group.size());
        let state = EpochState::new(group.clone(), share, None);

        info!(
            beacon_id = %group.beacon_id,
            last_round = last.round(),
            epoch = group.epoch,
            signer = state.my_index().is_some(),
            "beacon engine ready"
        );

        Ok(Arc::new(Engine {
            beacon_id: group.beacon_id.clone(),
            chain_hash,
            store,
            client,
            monitor,
            state: RwLock::new(Arc::new(state)),
            staged: Mutex::new(None),
            cache: Mutex::new(cache),
            last_beacon: RwLock::new(last),
            aggregation: tokio::sync::Mutex::new(()),
            finalized,
            latest,
            catching_up: AtomicBool::new(false),
            invalid_partials: AtomicU64::new(0),
        }))
    }

    pub fn beacon_id(&self) -> &str {
        &self.beacon_id
    }

    pub fn chain_hash(&self) -> &[u8] {
        &self.chain_hash
    }

    pub fn store(&self) -> Arc<dyn ChainStore> {
        self.store.clone()
    }

    pub fn epoch_state(&self) -> Arc<EpochState> {
        self.state.read().clone()
    }

    pub fn latest_watch(&self) -> watch::Receiver<u64> {
        self.latest.subscribe()
    }

    pub fn subscribe_finalized(&self) -> broadcast::Receiver<Beacon> {
        self.finalized.subscribe()
    }

    pub fn last_beacon(&self) -> Beacon {
        self.last_beacon.read().clone()
    }

    pub fn is_catching_up(&self) -> bool {
        self.catching_up.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> StatusResponse {
        let state = self.epoch_state();
        StatusResponse {
            beacon_id: self.beacon_id.clone(),
            last_round: self.last_beacon.read().round(),
            expected_round: state.clock.round_at(SystemTime::now()),
            catching_up: self.is_catching_up(),
            epoch: state.group.epoch,
            dkg_status: String::new(),
        }
    }

    /// Stage the next epoch's group and share; the round driver swaps them
    /// in at the group's transition boundary.
    pub fn stage_next_group(&self, group: Arc<Group>, share: Option<Share>) {
        info!(
            beacon_id = %self.beacon_id,
            epoch = group.epoch,
            transition = ?group.transition_time,
            "staged next group"
        );
        *self.staged.lock() = Some((group, share));
    }

    /// Accept a partial signature from a peer (or replayed from the buffer).
    ///
    /// Current-round partials are fully validated and may complete the
    /// round; near-future partials are buffered; anything else is dropped
    /// with a counter.
    pub async fn process_partial(&self, packet: PartialBeaconPacket) -> Result<(), EngineError> {
        if packet.beacon_id != self.beacon_id {
            return Err(BeaconError::Malformed("wrong beacon id".into()).into());
        }
        let state = self.epoch_state();
        if state.group.node(packet.index).is_none() {
            self.invalid_partials.fetch_add(1, Ordering::Relaxed);
            return Err(BeaconError::UnknownSigner(packet.index).into());
        }

        let (current, last_sig) = {
            let last = self.last_beacon.read();
            (last.round() + 1, last.signature().to_vec())
        };

        if packet.round == current {
            let digest = state.group.scheme().beacon_digest(&last_sig, packet.round);
            if verify_partial(
                &state.group.public_poly,
                packet.index,
                &digest,
                &packet.partial_sig,
            )
            .is_err()
            {
                self.invalid_partials.fetch_add(1, Ordering::Relaxed);
                return Err(BeaconError::BadSignature(packet.round).into());
            }
        }

        let outcome = self
            .cache
            .lock()
            .insert(packet.round, packet.index, packet.partial_sig);
        match outcome {
            CacheOutcome::Current => {
                self.try_finalize_current().await?;
                Ok(())
            }
            // idempotent: the first copy already counted
            CacheOutcome::Duplicate | CacheOutcome::Buffered => Ok(()),
            CacheOutcome::RoundFull => Ok(()),
            CacheOutcome::OutOfOrder => Err(BeaconError::OutOfOrder {
                got: packet.round,
                last: current - 1,
            }
            .into()),
            CacheOutcome::TooFarAhead => Err(BeaconError::RoundInFuture(packet.round).into()),
        }
    }

    /// Aggregate and finalize the round being collected, if `threshold`
    /// valid partials are present. Serialized so concurrent partial arrivals
    /// cannot double-finalize a round. Replayed buffer entries may complete
    /// several rounds back to back; all of them are finalized here.
    pub async fn try_finalize_current(&self) -> Result<Option<Beacon>, EngineError> {
        if self.is_catching_up() {
            return Ok(None);
        }
        let _guard = self.aggregation.lock().await;
        let mut first = None;
        while let Some(beacon) = self.aggregate_once().await? {
            if first.is_none() {
                first = Some(beacon);
            }
        }
        Ok(first)
    }

    async fn aggregate_once(&self) -> Result<Option<Beacon>, EngineError> {
        let state = self.epoch_state();
        let prev = self.last_beacon();
        let round = prev.round() + 1;
        let threshold = state.group.threshold as usize;

        let partials = {
            let cache = self.cache.lock();
            if cache.current_round() != round || cache.count(round) < threshold {
                return Ok(None);
            }
            cache.partials(round)
        };

        let scheme = state.group.scheme();
        let digest = scheme.beacon_digest(prev.signature(), round);
        let signature = lantern_crypto::aggregate(threshold, &partials)?;
        if verify_sig(&state.group.public_key(), &digest, &signature).is_err() {
            // an aggregate built from individually-verified partials should
            // never fail; discard and keep collecting
            warn!(beacon_id = %self.beacon_id, round, "aggregate signature failed verification");
            return Ok(None);
        }
        let previous_signature = if scheme.chained() {
            prev.signature().to_vec()
        } else {
            Vec::new()
        };
        let beacon = Beacon::new(round, signature, previous_signature);
        self.finalize(beacon.clone(), &state).await?;
        Ok(Some(beacon))
    }

    async fn finalize(&self, beacon: Beacon, state: &EpochState) -> Result<(), EngineError> {
        self.store.put(&beacon).await?;
        *self.last_beacon.write() = beacon.clone();
        self.latest.send_replace(beacon.round());
        let _ = self.finalized.send(beacon.clone());
        debug!(
            beacon_id = %self.beacon_id,
            round = beacon.round(),
            randomness = %hex_prefix(&beacon.randomness()),
            "round finalized"
        );

        let replayed = self.cache.lock().advance(beacon.round() + 1);
        if !replayed.is_empty() {
            let next = beacon.round() + 1;
            let digest = state
                .group
                .scheme()
                .beacon_digest(beacon.signature(), next);
            let mut cache = self.cache.lock();
            for (index, sig) in replayed {
                if verify_partial(&state.group.public_poly, index, &digest, &sig).is_ok() {
                    cache.insert(next, index, sig);
                } else {
                    self.invalid_partials.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Ok(())
    }

    /// The round driver: a parked loop that arms each round at its boundary,
    /// falls back to catch-up when behind, and swaps epochs at transition.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                break;
            }
            self.maybe_transition();
            let state = self.epoch_state();
            let last = self.last_beacon().round();
            let expected = state.clock.round_at(SystemTime::now());

            // more than one period behind: replay from peers, never sign
            if expected > last + 1 {
                self.catch_up(&state, expected).await;
                if self.last_beacon().round() < expected {
                    let nap = state.group.catchup_period.max(Duration::from_millis(100));
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(nap) => {}
                    }
                }
                continue;
            }

            let next = last + 1;
            let wait = state
                .clock
                .time_of_round(next)
                .duration_since(SystemTime::now())
                .unwrap_or_default();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            self.maybe_transition();
            let state = self.epoch_state();

            // the round may have been finalized by incoming partials or by
            // catch-up while we slept
            if self.last_beacon().round() >= next {
                continue;
            }
            if state.clock.round_at(SystemTime::now()) > next {
                // slept through a boundary (suspend, clock skew): catch up
                continue;
            }
            if state.share.is_none() {
                // follower: nothing to sign, wake again next round
                continue;
            }
            self.run_round(next, &state, &cancel).await;
        }
        info!(beacon_id = %self.beacon_id, "round driver stopped");
    }

    async fn run_round(&self, round: u64, state: &Arc<EpochState>, cancel: &CancellationToken) {
        let share = match &state.share {
            Some(share) => share,
            None => return,
        };
        let prev = self.last_beacon();
        let digest = state.group.scheme().beacon_digest(prev.signature(), round);
        let my_partial = sign_partial(share, &digest);
        let my_index = share.index();

        self.cache.lock().insert(round, my_index, my_partial.clone());

        // fan the partial out to the committee; no retries within a round,
        // failures feed the threshold monitor via the gateway ledger
        let packet = PartialBeaconPacket {
            beacon_id: self.beacon_id.clone(),
            round,
            index: my_index,
            partial_sig: my_partial,
        };
        let send_timeout = state.group.period.min(DEFAULT_CALL_TIMEOUT);
        for node in state.group.nodes.iter().filter(|n| n.index != my_index) {
            let client = self.client.clone();
            let addr = node.address.clone();
            let packet = packet.clone();
            tokio::spawn(async move {
                let _ = client.send_partial(&addr, &packet, send_timeout).await;
            });
        }

        if let Err(e) = self.try_finalize_current().await {
            warn!(beacon_id = %self.beacon_id, round, error = %e, "finalization failed");
            return;
        }

        // collected partials finalize the round through process_partial;
        // wait for that or for the next boundary
        let mut latest = self.latest.subscribe();
        let deadline = state.clock.time_of_round(round + 1);
        loop {
            if *latest.borrow() >= round {
                return;
            }
            let wait = deadline
                .duration_since(SystemTime::now())
                .unwrap_or_default();
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = latest.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = tokio::time::sleep(wait) => {
                    warn!(
                        beacon_id = %self.beacon_id,
                        round,
                        collected = self.cache.lock().count(round),
                        needed = state.group.threshold,
                        "round expired below threshold; catch-up will recover it"
                    );
                    return;
                }
            }
        }
    }

    /// Operator-facing resync against explicit peers. A target of zero
    /// means the currently expected round.
    pub async fn sync_from(&self, peers: &[String], target: u64) -> u64 {
        let state = self.epoch_state();
        let target = if target == 0 {
            state.clock.round_at(SystemTime::now())
        } else {
            target
        };
        self.catch_up_with(&state, peers.to_vec(), target).await;
        self.last_beacon().round()
    }

    async fn catch_up(&self, state: &Arc<EpochState>, target: u64) {
        let my_index = state.my_index();
        let mut peers: Vec<String> = state
            .group
            .nodes
            .iter()
            .filter(|n| Some(n.index) != my_index)
            .map(|n| n.address.clone())
            .collect();
        peers.shuffle(&mut rand::thread_rng());
        self.catch_up_with(state, peers, target).await;
    }

    async fn catch_up_with(&self, state: &Arc<EpochState>, peers: Vec<String>, target: u64) {
        self.catching_up.store(true, Ordering::Relaxed);
        let last = self.last_beacon();
        let result = sync_chain_from(
            self.client.as_ref(),
            &peers,
            &self.beacon_id,
            &self.store,
            &state.group.scheme(),
            &state.group.public_key(),
            last,
            target,
            &|beacon| {
                *self.last_beacon.write() = beacon.clone();
                self.latest.send_replace(beacon.round());
                let _ = self.finalized.send(beacon.clone());
            },
        )
        .await;

        match result {
            Ok(head) => {
                self.cache.lock().advance(head.round() + 1);
                if head.round() >= target {
                    info!(beacon_id = %self.beacon_id, round = head.round(), "caught up");
                }
            }
            Err(e) => warn!(beacon_id = %self.beacon_id, error = %e, "catch-up failed"),
        }
        self.catching_up.store(false, Ordering::Relaxed);
    }

    /// Swap in a staged group once its transition boundary is due. The round
    /// counter continues; only the signing state changes.
    fn maybe_transition(&self) {
        let due = {
            let staged = self.staged.lock();
            match staged.as_ref() {
                Some((group, _)) => {
                    let transition = group.transition_time.unwrap_or(0);
                    SystemTime::now() >= UNIX_EPOCH + Duration::from_secs(transition)
                }
                None => false,
            }
        };
        if !due {
            return;
        }
        let (group, share) = match self.staged.lock().take() {
            Some(staged) => staged,
            None => return,
        };
        let previous = self.epoch_state();
        let next = EpochState::new(group.clone(), share, Some(&previous.clock));
        *self.state.write() = Arc::new(next);
        self.cache.lock().update_roster_size(group.size());
        self.monitor
            .update_params(group.size(), group.threshold as usize);
        info!(
            beacon_id = %self.beacon_id,
            epoch = group.epoch,
            nodes = group.size(),
            threshold = group.threshold,
            "transitioned to new group"
        );
        // the previous epoch's share is dropped here and zeroed on drop
    }
}

fn hex_prefix(bytes: &[u8]) -> String {
    const N: usize = 8;
    let mut out = String::with_capacity(N * 2);
    for b in bytes.iter().take(N) {
        out.push_str(&format!("{b:02x}"));
    }
    out
}
