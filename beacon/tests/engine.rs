// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

//! Engine behavior against an in-process fake gateway: aggregation,
//! out-of-order handling, catch-up and reshare transition.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use lantern_beacon::{Engine, ThresholdMonitor};
use lantern_chain::proto::{BeaconPacket, PartialBeaconPacket, SyncRequest};
use lantern_chain::{Beacon, Group, Node, RoundClock};
use lantern_crypto::{sign_partial, PrivateKey, PrivatePoly, SchemeId, Share};
use lantern_db::{ChainStore, MemoryStore};
use lantern_net::{FailureLedger, NetError, ProtocolClient};
use rand::rngs::OsRng;

/// A committee with its secret material, for driving engines by hand.
struct TestCommittee {
    group: Arc<Group>,
    shares: Vec<Share>,
    group_secret: Share,
}

fn make_committee(n: usize, threshold: u32, genesis_time: u64, period: Duration) -> TestCommittee {
    let poly = PrivatePoly::random(threshold as usize, &mut OsRng);
    let keys: Vec<PrivateKey> = (0..n).map(|_| PrivateKey::generate(&mut OsRng)).collect();
    let nodes: Vec<Node> = keys
        .iter()
        .enumerate()
        .map(|(i, sk)| {
            let address = format!("127.0.0.1:{}", 39000 + i);
            let digest = Node::identity_digest(&address, &sk.public_key());
            Node {
                index: i as u32 + 1,
                address,
                key: sk.public_key(),
                signature: sk.sign(&digest).to_bytes().to_vec(),
            }
        })
        .collect();
    let mut group = Group {
        beacon_id: "default".into(),
        scheme: SchemeId::PedersenBlsChained,
        threshold,
        period,
        catchup_period: Duration::from_millis(200),
        genesis_time,
        genesis_seed: Vec::new(),
        epoch: 1,
        transition_time: None,
        previous_group_hash: None,
        nodes,
        public_poly: poly.commit(),
    };
    group.genesis_seed = group.derive_genesis_seed();
    let shares = (1..=n as u32)
        .map(|i| Share::new(i, poly.eval(i).unwrap()).unwrap())
        .collect();
    TestCommittee {
        group: Arc::new(group),
        shares,
        group_secret: Share::new(1, *poly.secret()).unwrap(),
    }
}

impl TestCommittee {
    /// Sign the chain `1..=rounds` directly with the group secret, as a
    /// peer's finished chain for catch-up tests.
    fn signed_chain(&self, rounds: u64) -> Vec<Beacon> {
        let scheme = self.group.scheme();
        let mut prev = Beacon::genesis(self.group.genesis_seed.clone());
        let mut out = Vec::new();
        for round in 1..=rounds {
            let digest = scheme.beacon_digest(prev.signature(), round);
            let sig = sign_partial(&self.group_secret, &digest);
            let beacon = Beacon::new(round, sig, prev.signature().to_vec());
            out.push(beacon.clone());
            prev = beacon;
        }
        out
    }

    fn partial(&self, signer: usize, round: u64, prev_sig: &[u8]) -> PartialBeaconPacket {
        let digest = self.group.scheme().beacon_digest(prev_sig, round);
        PartialBeaconPacket {
            beacon_id: self.group.beacon_id.clone(),
            round,
            index: self.shares[signer].index(),
            partial_sig: sign_partial(&self.shares[signer], &digest),
        }
    }
}

/// Gateway fake: partial dispatch succeeds silently; sync serves a canned
/// chain when one is configured.
struct FakeGateway {
    ledger: Arc<FailureLedger>,
    chain: Vec<Beacon>,
}

impl FakeGateway {
    fn empty() -> Arc<Self> {
        Arc::new(FakeGateway {
            ledger: Arc::new(FailureLedger::new()),
            chain: Vec::new(),
        })
    }

    fn with_chain(chain: Vec<Beacon>) -> Arc<Self> {
        Arc::new(FakeGateway {
            ledger: Arc::new(FailureLedger::new()),
            chain,
        })
    }
}

#[async_trait]
impl ProtocolClient for FakeGateway {
    async fn send_partial(
        &self,
        _addr: &str,
        _packet: &PartialBeaconPacket,
        _timeout: Duration,
    ) -> Result<(), NetError> {
        Ok(())
    }

    async fn sync_chain(
        &self,
        addr: &str,
        request: &SyncRequest,
    ) -> Result<flume::Receiver<Result<BeaconPacket, NetError>>, NetError> {
        if self.chain.is_empty() {
            return Err(NetError::DialFailure {
                addr: addr.to_owned(),
                reason: "no chain to serve".into(),
            });
        }
        let (tx, rx) = flume::unbounded();
        for beacon in self
            .chain
            .iter()
            .filter(|b| b.round() >= request.from_round)
        {
            let _ = tx.send(Ok(BeaconPacket::from(beacon.clone())));
        }
        Ok(rx)
    }

    fn failure_ledger(&self) -> Arc<FailureLedger> {
        self.ledger.clone()
    }
}

fn monitor_for(group: &Group) -> Arc<ThresholdMonitor> {
    Arc::new(ThresholdMonitor::new(
        group.beacon_id.clone(),
        Arc::new(FailureLedger::new()),
        group.size(),
        group.threshold as usize,
    ))
}

fn past_genesis(secs_ago: u64) -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
        - secs_ago
}

async fn engine_for(
    committee: &TestCommittee,
    client: Arc<dyn ProtocolClient>,
    share: Option<Share>,
) -> Arc<Engine> {
    let store: Arc<dyn ChainStore> = Arc::new(MemoryStore::new(256));
    let chain_hash = committee.group.hash();
    Engine::new(
        store,
        client,
        monitor_for(&committee.group),
        committee.group.clone(),
        share,
        chain_hash,
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn threshold_partials_finalize_a_round() {
    let committee = make_committee(4, 3, past_genesis(60), Duration::from_secs(3));
    let engine = engine_for(&committee, FakeGateway::empty(), None).await;
    let mut finalized = engine.subscribe_finalized();

    let genesis_sig = engine.last_beacon().signature().to_vec();
    engine
        .process_partial(committee.partial(1, 1, &genesis_sig))
        .await
        .unwrap();
    assert_eq!(engine.last_beacon().round(), 0);

    engine
        .process_partial(committee.partial(2, 1, &genesis_sig))
        .await
        .unwrap();
    engine
        .process_partial(committee.partial(3, 1, &genesis_sig))
        .await
        .unwrap();

    let beacon = engine.store().get(1).await.unwrap().expect("round 1 stored");
    beacon
        .verify(
            &committee.group.scheme(),
            &committee.group.public_key(),
            &Beacon::genesis(committee.group.genesis_seed.clone()),
        )
        .unwrap();
    assert_eq!(finalized.recv().await.unwrap().round(), 1);
    assert_eq!(*engine.latest_watch().borrow(), 1);
}

#[tokio::test]
async fn stale_partials_are_rejected_with_out_of_order() {
    let committee = make_committee(4, 3, past_genesis(60), Duration::from_secs(3));
    let engine = engine_for(&committee, FakeGateway::empty(), None).await;

    let genesis_sig = engine.last_beacon().signature().to_vec();
    for signer in 0..3 {
        engine
            .process_partial(committee.partial(signer, 1, &genesis_sig))
            .await
            .unwrap();
    }
    assert_eq!(engine.last_beacon().round(), 1);

    let err = engine
        .process_partial(committee.partial(0, 1, &genesis_sig))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("at or before"), "{err}");
}

#[tokio::test]
async fn buffered_future_partials_replay_and_finalize() {
    let committee = make_committee(4, 3, past_genesis(60), Duration::from_secs(3));
    let engine = engine_for(&committee, FakeGateway::empty(), None).await;

    // precompute the chain so future-round partials sign the right digests
    let chain = committee.signed_chain(3);
    let genesis_sig = engine.last_beacon().signature().to_vec();

    // round 3 partials land while round 1 is being collected (r+2 ahead)
    for signer in 0..3 {
        engine
            .process_partial(committee.partial(signer, 3, chain[1].signature()))
            .await
            .unwrap();
    }
    assert_eq!(engine.last_beacon().round(), 0);

    // far-future rounds are refused outright
    let err = engine
        .process_partial(committee.partial(0, 40, &[0u8; 96]))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("future"), "{err}");

    // rounds 1 and 2 complete; the buffered round-3 partials then replay
    // and finalize round 3 without further input
    for signer in 0..3 {
        engine
            .process_partial(committee.partial(signer, 1, &genesis_sig))
            .await
            .unwrap();
    }
    for signer in 0..3 {
        engine
            .process_partial(committee.partial(signer, 2, chain[0].signature()))
            .await
            .unwrap();
    }
    assert_eq!(engine.last_beacon().round(), 3);
    assert_eq!(
        engine.store().get(3).await.unwrap().unwrap().signature(),
        chain[2].signature()
    );
}

#[tokio::test]
async fn unknown_signers_and_bad_signatures_are_dropped() {
    let committee = make_committee(4, 3, past_genesis(60), Duration::from_secs(3));
    let engine = engine_for(&committee, FakeGateway::empty(), None).await;
    let genesis_sig = engine.last_beacon().signature().to_vec();

    let mut packet = committee.partial(0, 1, &genesis_sig);
    packet.index = 9;
    assert!(engine.process_partial(packet).await.is_err());

    let mut packet = committee.partial(0, 1, &genesis_sig);
    packet.partial_sig = committee.partial(1, 1, &genesis_sig).partial_sig;
    assert!(engine.process_partial(packet).await.is_err());

    // a wrong beacon id never reaches the cache
    let mut packet = committee.partial(0, 1, &genesis_sig);
    packet.beacon_id = "other".into();
    assert!(engine.process_partial(packet).await.is_err());
}

#[tokio::test]
async fn duplicate_partials_are_idempotent() {
    let committee = make_committee(4, 3, past_genesis(60), Duration::from_secs(3));
    let engine = engine_for(&committee, FakeGateway::empty(), None).await;
    let genesis_sig = engine.last_beacon().signature().to_vec();

    let packet = committee.partial(0, 1, &genesis_sig);
    engine.process_partial(packet.clone()).await.unwrap();
    engine.process_partial(packet.clone()).await.unwrap();
    engine.process_partial(packet).await.unwrap();
    assert_eq!(engine.last_beacon().round(), 0);
}

#[tokio::test]
async fn follower_catches_up_from_a_peer_chain() {
    let period = Duration::from_secs(1);
    let committee = make_committee(4, 3, past_genesis(5), period);
    let remote = committee.signed_chain(5);
    let engine = engine_for(&committee, FakeGateway::with_chain(remote), None).await;

    let cancel = tokio_util::sync::CancellationToken::new();
    let driver = tokio::spawn(engine.clone().run(cancel.clone()));

    let mut latest = engine.latest_watch();
    tokio::time::timeout(Duration::from_secs(3), async {
        while *latest.borrow() < 5 {
            latest.changed().await.unwrap();
        }
    })
    .await
    .expect("catch-up should reach round 5");

    assert!(engine.store().get(5).await.unwrap().is_some());
    cancel.cancel();
    driver.await.unwrap();
}

#[tokio::test]
async fn staged_group_swaps_in_at_transition() {
    let period = Duration::from_secs(1);
    let committee = make_committee(4, 3, past_genesis(3), period);
    let engine = engine_for(
        &committee,
        FakeGateway::empty(),
        Some(committee.shares[0].clone()),
    )
    .await;

    // next epoch: five nodes, threshold 4, transition due immediately
    let next = {
        let mut c2 = make_committee(5, 4, committee.group.genesis_time, period);
        let group = Arc::get_mut(&mut c2.group).unwrap();
        group.epoch = 2;
        group.transition_time = Some(past_genesis(0));
        group.previous_group_hash = Some(committee.group.hash());
        c2
    };
    engine.stage_next_group(next.group.clone(), Some(next.shares[0].clone()));

    let cancel = tokio_util::sync::CancellationToken::new();
    let driver = tokio::spawn(engine.clone().run(cancel.clone()));

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if engine.status().epoch == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("engine should transition to epoch 2");

    let state = engine.epoch_state();
    assert_eq!(state.group.size(), 5);
    assert_eq!(state.group.threshold, 4);
    cancel.cancel();
    driver.await.unwrap();
}

#[tokio::test]
async fn round_clock_matches_glossary_formula() {
    let clock = RoundClock::new(1_000, Duration::from_secs(3));
    assert_eq!(
        clock.time_of_round(7),
        UNIX_EPOCH + Duration::from_secs(1_000 + 21)
    );
}
