// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

//! Loopback gateway tests over the plaintext transport; run with
//! `--features insecure-tests`.
#![cfg(feature = "insecure-tests")]

use lantern_chain::proto::{BeaconPacket, PartialBeaconPacket, StatusResponse, SyncRequest};
use lantern_net::{serve, NetworkRequest, Pool, Transport};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

async fn spawn_gateway(
    allow_control: bool,
) -> (String, flume::Receiver<NetworkRequest>, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (tx, rx) = flume::unbounded();
    let cancel = CancellationToken::new();
    tokio::spawn(serve(
        listener,
        Transport::insecure(),
        tx,
        allow_control,
        cancel.clone(),
    ));
    (addr, rx, cancel)
}

#[tokio::test]
async fn partial_beacon_round_trip() {
    let (addr, requests, _cancel) = spawn_gateway(false).await;

    tokio::spawn(async move {
        while let Ok(request) = requests.recv_async().await {
            if let NetworkRequest::PartialBeacon { packet, reply } = request {
                assert_eq!(packet.round, 9);
                let _ = reply.send(Ok(()));
            }
        }
    });

    let pool = Pool::new(Transport::insecure());
    let packet = PartialBeaconPacket {
        beacon_id: "default".into(),
        round: 9,
        index: 2,
        partial_sig: vec![0xab; 96],
    };
    pool.send_partial(&addr, &packet, std::time::Duration::from_secs(5))
        .await
        .unwrap();
    assert!(pool.ledger().is_empty());
}

#[tokio::test]
async fn failed_dispatch_lands_in_the_ledger() {
    let pool = Pool::new(Transport::insecure());
    let packet = PartialBeaconPacket {
        beacon_id: "default".into(),
        round: 1,
        index: 1,
        partial_sig: vec![],
    };
    // nothing listens on this port
    let err = pool
        .send_partial("127.0.0.1:1", &packet, std::time::Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, lantern_net::NetError::DialFailure { .. }));
    assert_eq!(pool.ledger().drain().len(), 1);
}

#[tokio::test]
async fn sync_chain_streams_until_eof() {
    let (addr, requests, _cancel) = spawn_gateway(false).await;

    tokio::spawn(async move {
        while let Ok(request) = requests.recv_async().await {
            if let NetworkRequest::SyncChain { request, sink } = request {
                for round in request.from_round..request.from_round + 3 {
                    sink.send(BeaconPacket {
                        round,
                        signature: vec![round as u8],
                        previous_signature: vec![],
                    })
                    .unwrap();
                }
                // dropping the sink emits eof
            }
        }
    });

    let pool = Pool::new(Transport::insecure());
    let stream = pool
        .sync_chain(
            &addr,
            &SyncRequest {
                beacon_id: "default".into(),
                from_round: 4,
            },
        )
        .await
        .unwrap();

    let mut rounds = Vec::new();
    while let Ok(item) = stream.recv_async().await {
        rounds.push(item.unwrap().round);
    }
    assert_eq!(rounds, vec![4, 5, 6]);
}

#[tokio::test]
async fn public_rand_stream_follows_emissions() {
    let (addr, requests, _cancel) = spawn_gateway(false).await;

    tokio::spawn(async move {
        while let Ok(request) = requests.recv_async().await {
            if let NetworkRequest::PublicRandStream { request, sink } = request {
                assert_eq!(request.beacon_id, "default");
                for round in 1..=3u64 {
                    sink.send(BeaconPacket {
                        round,
                        signature: vec![round as u8; 96],
                        previous_signature: vec![],
                    })
                    .unwrap();
                }
            }
        }
    });

    let pool = Pool::new(Transport::insecure());
    let stream = pool.public_rand_stream(&addr, "default").await.unwrap();
    let mut rounds = Vec::new();
    while let Ok(item) = stream.recv_async().await {
        rounds.push(item.unwrap().round);
        if rounds.len() == 3 {
            break;
        }
    }
    assert_eq!(rounds, vec![1, 2, 3]);
}

#[tokio::test]
async fn requests_fail_cleanly_when_the_daemon_is_gone() {
    let (addr, requests, _cancel) = spawn_gateway(false).await;
    drop(requests);

    let pool = Pool::new(Transport::insecure());
    let err = pool.status(&addr, "default").await.unwrap_err();
    // the handler channel is gone, but the listener still answers
    assert!(matches!(err, lantern_net::NetError::Remote(_)));
}

#[tokio::test]
async fn control_verbs_are_fenced_off_peer_listeners() {
    let (addr, _requests, _cancel) = spawn_gateway(false).await;

    let pool = Pool::new(Transport::insecure());
    let err = pool
        .control(&addr, lantern_net::RpcKind::Ping, Vec::new())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        lantern_net::NetError::Remote("control surface is local-only".into())
    );
}

#[tokio::test]
async fn control_verbs_are_served_on_the_local_listener() {
    let (addr, requests, _cancel) = spawn_gateway(true).await;

    tokio::spawn(async move {
        while let Ok(request) = requests.recv_async().await {
            if let NetworkRequest::Control { payload, reply, .. } = request {
                let _ = reply.send(Ok(payload));
            }
        }
    });

    let pool = Pool::new(Transport::insecure());
    let echoed = pool
        .control(&addr, lantern_net::RpcKind::Ping, b"hello".to_vec())
        .await
        .unwrap();
    assert_eq!(echoed, b"hello");
}

#[tokio::test]
async fn remote_errors_surface_to_the_caller() {
    let (addr, requests, _cancel) = spawn_gateway(false).await;

    tokio::spawn(async move {
        while let Ok(request) = requests.recv_async().await {
            if let NetworkRequest::Status { reply, .. } = request {
                let _ = reply.send(Err("unknown beacon id".into()));
            }
        }
    });

    let pool = Pool::new(Transport::insecure());
    let err = pool.status(&addr, "nope").await.unwrap_err();
    assert_eq!(err, lantern_net::NetError::Remote("unknown beacon id".into()));
}

#[tokio::test]
async fn status_round_trip() {
    let (addr, requests, _cancel) = spawn_gateway(false).await;

    tokio::spawn(async move {
        while let Ok(request) = requests.recv_async().await {
            if let NetworkRequest::Status { request, reply } = request {
                let _ = reply.send(Ok(StatusResponse {
                    beacon_id: request.beacon_id,
                    last_round: 41,
                    expected_round: 42,
                    catching_up: true,
                    epoch: 1,
                    dkg_status: "Complete".into(),
                }));
            }
        }
    });

    let pool = Pool::new(Transport::insecure());
    let status = pool.status(&addr, "default").await.unwrap();
    assert_eq!(status.last_round, 41);
    assert!(status.catching_up);
}
