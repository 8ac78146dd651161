// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

//! Whole-daemon scenario over loopback sockets: three fresh nodes run a
//! ceremony to completion and produce verifiable rounds. Run with
//! `--features insecure-tests`.
#![cfg(feature = "insecure-tests")]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use lantern_chain::proto::{DkgCommandPacket, DkgVerb, NodePacket, ProposalPacket};
use lantern_daemon::config::{BeaconSection, Config, StoreSection};
use lantern_daemon::Daemon;
use lantern_net::{Pool, RpcKind, Transport};
use rand::Rng;

struct RunningDaemon {
    daemon: Daemon,
    peer_addr: String,
    control_addr: String,
    public_addr: String,
    _dir: tempfile::TempDir,
}

async fn spawn_node(base_port: u16) -> RunningDaemon {
    let dir = tempfile::tempdir().unwrap();
    let peer_addr = format!("127.0.0.1:{base_port}");
    let public_addr = format!("127.0.0.1:{}", base_port + 1);
    let control_addr = format!("127.0.0.1:{}", base_port + 2);
    let config = Config {
        data_dir: dir.path().to_path_buf(),
        address: peer_addr.clone(),
        peer_listen: peer_addr.clone(),
        public_listen: public_addr.clone(),
        control_listen: control_addr.clone(),
        store: StoreSection::Memory { capacity: 512 },
        tls: None,
        beacons: vec![BeaconSection {
            id: "default".into(),
            auto_accept_dkg: true,
            dkg_phase_timeout: Duration::from_secs(20),
        }],
    };
    let daemon = Daemon::start(config).await.unwrap();
    RunningDaemon {
        daemon,
        peer_addr,
        control_addr,
        public_addr,
        _dir: dir,
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

async fn wait_until<F, Fut>(limit: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(limit, async {
        loop {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn http_get_json(addr: &str, path: &str) -> serde_json::Value {
    let url = format!("http://{addr}{path}");
    reqwest::get(&url).await.unwrap().json().await.unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn fresh_network_runs_a_ceremony_and_produces_rounds() {
    let base: u16 = 21000 + rand::thread_rng().gen_range(0..3000) * 10;
    let mut daemons = Vec::new();
    for i in 0..3u16 {
        daemons.push(spawn_node(base + i * 10).await);
    }
    let pool = Pool::new(Transport::insecure());

    // collect self-signed identities over the protocol surface
    let mut nodes = Vec::new();
    for (i, daemon) in daemons.iter().enumerate() {
        let identity = pool
            .get_identity(&daemon.peer_addr, "default")
            .await
            .unwrap();
        nodes.push(NodePacket {
            index: i as u32 + 1,
            address: identity.address,
            key: identity.key,
            signature: identity.signature,
        });
    }

    // the leader proposes a 3-node, threshold-2 chain starting shortly
    let proposal = ProposalPacket {
        beacon_id: "default".into(),
        epoch: 1,
        threshold: 2,
        scheme_id: "pedersen-bls-unchained".into(),
        period_seconds: 1,
        catchup_period_seconds: 1,
        genesis_time: now_secs() + 3,
        transition_time: None,
        leader_index: 1,
        joining: nodes,
        remaining: Vec::new(),
        leaving: Vec::new(),
        previous_group_hash: None,
    };
    let command = DkgCommandPacket {
        beacon_id: "default".into(),
        verb: DkgVerb::Propose as i32,
        proposal: Some(proposal),
    };
    let reply = pool
        .control(
            &daemons[0].control_addr,
            RpcKind::DkgCommand,
            lantern_chain::proto::encode(&command),
        )
        .await
        .unwrap();
    let status = String::from_utf8_lossy(&reply).into_owned();
    assert!(
        status.contains("Proposed") || status.contains("Executing") || status.contains("Complete"),
        "{status}"
    );

    // every node reports the ceremony complete
    for daemon in &daemons {
        wait_until(Duration::from_secs(30), || async {
            pool.status(&daemon.peer_addr, "default")
                .await
                .map(|s| s.dkg_status.contains("Complete"))
                .unwrap_or(false)
        })
        .await;
    }

    // the chain reaches round 2 on every node with identical signatures
    let mut signatures = Vec::new();
    for daemon in &daemons {
        wait_until(Duration::from_secs(30), || async {
            pool.status(&daemon.peer_addr, "default")
                .await
                .map(|s| s.last_round >= 2)
                .unwrap_or(false)
        })
        .await;

        let info = pool.chain_info(&daemon.peer_addr, "default").await.unwrap();
        assert_eq!(info.scheme_id, "pedersen-bls-unchained");

        let chain = hex::encode(&info.hash);
        let body = http_get_json(&daemon.public_addr, &format!("/{chain}/public/2")).await;
        assert_eq!(body["round"], 2);
        // a 96-byte BLS signature and 32 bytes of randomness, hex encoded
        assert_eq!(body["signature"].as_str().unwrap().len(), 192);
        assert_eq!(body["randomness"].as_str().unwrap().len(), 64);
        signatures.push(body["signature"].as_str().unwrap().to_owned());

        let health = reqwest::get(format!("http://{}/{}/health", daemon.public_addr, chain))
            .await
            .unwrap();
        assert_eq!(health.status(), 200);
    }
    assert_eq!(signatures[0], signatures[1]);
    assert_eq!(signatures[1], signatures[2]);

    // control surface is refused on the peer listener
    let err = pool
        .control(&daemons[0].peer_addr, RpcKind::Ping, Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, lantern_net::NetError::Remote(_)));

    for running in daemons {
        running.daemon.shutdown().await;
    }
}
