// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

//! Whole ceremonies run in-process over an in-memory gossip bus: initial
//! key generation, reshare with an offline leaver, eviction of a bad dealer
//! and the idempotence of leader verbs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lantern_chain::proto::{DealBundle, DkgPacket, DkgPacketKind};
use lantern_chain::{Group, Node};
use lantern_crypto::{PrivateKey, PrivatePoly, SchemeId, Share};
use lantern_dkg::{
    sign_packet, Coordinator, CoordinatorConfig, DkgStatus, DkgTransport, PreviousEpoch, Proposal,
};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Bus {
    nodes: Mutex<HashMap<String, Arc<Coordinator>>>,
}

impl Bus {
    fn register(&self, address: &str, coordinator: Arc<Coordinator>) {
        self.nodes.lock().insert(address.to_owned(), coordinator);
    }
}

struct BusTransport(Arc<Bus>);

#[async_trait]
impl DkgTransport for BusTransport {
    async fn gossip(&self, peers: &[String], packet: DkgPacket) {
        for peer in peers {
            let target = self.0.nodes.lock().get(peer).cloned();
            if let Some(coordinator) = target {
                let packet = packet.clone();
                tokio::spawn(async move {
                    let _ = coordinator.handle_packet(packet, false).await;
                });
            }
        }
    }
}

struct TestNode {
    address: String,
    key: Arc<PrivateKey>,
    node: Node,
}

fn make_nodes(n: usize) -> Vec<TestNode> {
    (1..=n as u32)
        .map(|i| {
            let key = Arc::new(PrivateKey::generate(&mut OsRng));
            let address = format!("node-{i}");
            let digest = Node::identity_digest(&address, &key.public_key());
            let node = Node {
                index: i,
                address: address.clone(),
                key: key.public_key(),
                signature: key.sign(&digest).to_bytes().to_vec(),
            };
            TestNode { address, key, node }
        })
        .collect()
}

fn coordinator_on(
    bus: &Arc<Bus>,
    node: &TestNode,
    auto_accept: bool,
    phase_timeout: Duration,
    previous: Option<PreviousEpoch>,
    cancel: &CancellationToken,
) -> Arc<Coordinator> {
    let coordinator = Coordinator::new(
        CoordinatorConfig {
            beacon_id: "default".into(),
            address: node.address.clone(),
            identity_key: node.key.clone(),
            phase_timeout,
            auto_accept,
        },
        Arc::new(BusTransport(bus.clone())),
        previous,
    );
    bus.register(&node.address, coordinator.clone());
    tokio::spawn(coordinator.clone().run(cancel.clone()));
    coordinator
}

fn initial_proposal(nodes: &[TestNode], threshold: u32) -> Proposal {
    Proposal {
        beacon_id: "default".into(),
        epoch: 1,
        threshold,
        scheme: SchemeId::PedersenBlsUnchained,
        period: Duration::from_secs(3),
        catchup_period: Duration::from_secs(1),
        genesis_time: 4_000_000_000,
        transition_time: None,
        leader_index: 1,
        joining: nodes.iter().map(|n| n.node.clone()).collect(),
        remaining: Vec::new(),
        leaving: Vec::new(),
        previous_group_hash: None,
    }
}

async fn collect_outputs(
    coordinators: &[Arc<Coordinator>],
    timeout: Duration,
) -> Vec<(Arc<Group>, Share)> {
    let mut outputs = Vec::new();
    for coordinator in coordinators {
        let completions = coordinator.completions();
        let output = tokio::time::timeout(timeout, completions.recv_async())
            .await
            .expect("ceremony should complete in time")
            .expect("completion channel open");
        outputs.push((output.group, output.share.expect("committee member share")));
    }
    outputs
}

fn assert_signing_committee(outputs: &[(Arc<Group>, Share)], threshold: usize) {
    let group = &outputs[0].0;
    for (other, _) in &outputs[1..] {
        assert_eq!(other.hash(), group.hash(), "groups must agree");
    }
    let digest = [0x5au8; 32];
    let partials: Vec<(u32, Vec<u8>)> = outputs
        .iter()
        .take(threshold)
        .map(|(_, share)| (share.index(), lantern_crypto::sign_partial(share, &digest)))
        .collect();
    let sig = lantern_crypto::aggregate(threshold, &partials).unwrap();
    lantern_crypto::verify_sig(&group.public_key(), &digest, &sig).unwrap();
}

#[tokio::test]
async fn five_node_initial_ceremony_completes() {
    let nodes = make_nodes(5);
    let bus = Arc::new(Bus::default());
    let cancel = CancellationToken::new();
    let coordinators: Vec<Arc<Coordinator>> = nodes
        .iter()
        .map(|n| coordinator_on(&bus, n, true, Duration::from_secs(10), None, &cancel))
        .collect();

    coordinators[0]
        .propose(initial_proposal(&nodes, 4))
        .await
        .unwrap();

    let outputs = collect_outputs(&coordinators, Duration::from_secs(15)).await;
    assert_signing_committee(&outputs, 4);

    let group = &outputs[0].0;
    assert_eq!(group.epoch, 1);
    assert_eq!(group.size(), 5);
    assert_eq!(group.threshold, 4);
    assert!(group.previous_group_hash.is_none());
    assert!(!group.genesis_seed.is_empty());
    for coordinator in &coordinators {
        assert_eq!(coordinator.status(), DkgStatus::Complete);
    }
}

#[tokio::test]
async fn duplicate_proposal_and_accepts_are_no_ops() {
    let nodes = make_nodes(3);
    let bus = Arc::new(Bus::default());
    let cancel = CancellationToken::new();
    // manual acceptance keeps the ceremony parked in Proposed
    let coordinators: Vec<Arc<Coordinator>> = nodes
        .iter()
        .map(|n| coordinator_on(&bus, n, false, Duration::from_secs(30), None, &cancel))
        .collect();

    let proposal = initial_proposal(&nodes, 2);
    coordinators[0].propose(proposal.clone()).await.unwrap();
    // second identical submission: no-op
    coordinators[0].propose(proposal.clone()).await.unwrap();
    assert_eq!(coordinators[0].status(), DkgStatus::Proposed);

    // wait for gossip to land, then accept from the others, twice
    tokio::time::sleep(Duration::from_millis(200)).await;
    for coordinator in &coordinators[1..] {
        coordinator.join().await.unwrap();
        coordinator.accept().await.unwrap();
        coordinator.accept().await.unwrap();
    }

    let outputs = collect_outputs(&coordinators, Duration::from_secs(10)).await;
    assert_signing_committee(&outputs, 2);
}

#[tokio::test]
async fn unaccepted_proposal_times_out() {
    let nodes = make_nodes(3);
    let bus = Arc::new(Bus::default());
    let cancel = CancellationToken::new();
    let leader = coordinator_on(
        &bus,
        &nodes[0],
        false,
        Duration::from_millis(500),
        None,
        &cancel,
    );
    // the other two never come online
    leader.propose(initial_proposal(&nodes, 2)).await.unwrap();

    let mut status = leader.status_watch();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if status.borrow().is_terminal() {
                break;
            }
            status.changed().await.unwrap();
        }
    })
    .await
    .expect("ceremony should time out");
    assert_eq!(leader.status(), DkgStatus::TimedOut);
}

/// Build an epoch-1 group directly from a polynomial, as reshare context.
fn manual_epoch1(nodes: &[TestNode], threshold: u32) -> (Group, Vec<Share>) {
    let poly = PrivatePoly::random(threshold as usize, &mut OsRng);
    let mut group = Group {
        beacon_id: "default".into(),
        scheme: SchemeId::PedersenBlsUnchained,
        threshold,
        period: Duration::from_secs(3),
        catchup_period: Duration::from_secs(1),
        genesis_time: 4_000_000_000,
        genesis_seed: Vec::new(),
        epoch: 1,
        transition_time: None,
        previous_group_hash: None,
        nodes: nodes.iter().map(|n| n.node.clone()).collect(),
        public_poly: poly.commit(),
    };
    group.genesis_seed = group.derive_genesis_seed();
    let shares = nodes
        .iter()
        .map(|n| Share::new(n.node.index, poly.eval(n.node.index).unwrap()).unwrap())
        .collect();
    (group, shares)
}

#[tokio::test]
async fn reshare_completes_without_the_leaver() {
    let nodes = make_nodes(3);
    let (group1, shares1) = manual_epoch1(&nodes, 2);
    let group1 = Arc::new(group1);
    let old_key = group1.public_key();

    let bus = Arc::new(Bus::default());
    let cancel = CancellationToken::new();
    // node 3 is leaving and offline: it is never registered on the bus
    let coordinators: Vec<Arc<Coordinator>> = nodes[..2]
        .iter()
        .zip(shares1.into_iter())
        .map(|(n, share)| {
            coordinator_on(
                &bus,
                n,
                true,
                Duration::from_secs(2),
                Some(PreviousEpoch {
                    group: group1.clone(),
                    share: Some(share),
                }),
                &cancel,
            )
        })
        .collect();

    let proposal = Proposal {
        beacon_id: "default".into(),
        epoch: 2,
        threshold: 2,
        scheme: SchemeId::PedersenBlsUnchained,
        period: Duration::from_secs(3),
        catchup_period: Duration::from_secs(1),
        genesis_time: group1.genesis_time,
        transition_time: Some(4_000_000_300),
        leader_index: 1,
        joining: Vec::new(),
        remaining: vec![nodes[0].node.clone(), nodes[1].node.clone()],
        leaving: vec![nodes[2].node.clone()],
        previous_group_hash: Some(group1.hash()),
    };
    coordinators[0].propose(proposal).await.unwrap();

    let outputs = collect_outputs(&coordinators, Duration::from_secs(10)).await;
    assert_signing_committee(&outputs, 2);

    let group2 = &outputs[0].0;
    assert_eq!(group2.epoch, 2);
    assert_eq!(group2.size(), 2);
    assert_eq!(group2.previous_group_hash.as_deref(), Some(&group1.hash()[..]));
    assert_eq!(group2.genesis_seed, group1.genesis_seed);
    assert_eq!(group2.transition_time, Some(4_000_000_300));
    // the chain key survives the reshare
    assert_eq!(group2.public_key(), old_key);
}

#[tokio::test]
async fn corrupt_dealer_is_evicted_and_ceremony_survives() {
    let nodes = make_nodes(4);
    let bus = Arc::new(Bus::default());
    let cancel = CancellationToken::new();
    // nodes 1, 2 and 4 run coordinators; node 3 is driven by hand
    let honest: Vec<Arc<Coordinator>> = [0usize, 1, 3]
        .iter()
        .map(|i| {
            coordinator_on(
                &bus,
                &nodes[*i],
                true,
                Duration::from_secs(2),
                None,
                &cancel,
            )
        })
        .collect();

    honest[0]
        .propose(initial_proposal(&nodes, 3))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    // node 3 accepts, then deals a bundle whose encrypted shares are junk
    let accept = sign_packet(
        &nodes[2].key,
        "default",
        1,
        3,
        DkgPacketKind::Accept,
        Vec::new(),
    );
    for coordinator in &honest {
        coordinator.handle_packet(accept.clone(), false).await.unwrap();
    }

    // wait until the execute gossip has moved everyone into Executing
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if honest.iter().all(|c| c.status() == DkgStatus::Executing) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("execution should start");

    let poly = PrivatePoly::random(3, &mut OsRng);
    let mut bundle = DealBundle {
        dealer_index: 3,
        commitment: poly.commit().to_bytes(),
        deals: Vec::new(),
    };
    for index in 1..=4u32 {
        bundle.deals.push(lantern_chain::proto::DealEntry {
            recipient_index: index,
            ephemeral: vec![0xaa; 48],
            nonce: vec![0xbb; 24],
            sealed: vec![0xcc; 64],
        });
    }
    let deal = sign_packet(
        &nodes[2].key,
        "default",
        1,
        3,
        DkgPacketKind::Deal,
        lantern_chain::proto::encode(&bundle),
    );
    for coordinator in &honest {
        coordinator.handle_packet(deal.clone(), false).await.unwrap();
    }

    // node 3 never responds nor justifies; deadlines push the honest nodes
    // through response and justification, and node 3 is evicted
    let outputs = collect_outputs(&honest, Duration::from_secs(15)).await;
    assert_signing_committee(&outputs, 3);
    for coordinator in &honest {
        assert_eq!(coordinator.status(), DkgStatus::Complete);
    }
    let indices: Vec<u32> = outputs.iter().map(|(_, s)| s.index()).collect();
    assert_eq!(indices, vec![1, 2, 4]);
}
