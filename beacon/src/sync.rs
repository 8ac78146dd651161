// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

//! Chain catch-up: replay missed beacons from peers, verifying each one
//! before it is appended.

use std::collections::HashSet;
use std::sync::Arc;

use lantern_chain::{proto::SyncRequest, Beacon};
use lantern_crypto::{PublicKey, Scheme};
use lantern_db::ChainStore;
use lantern_net::ProtocolClient;
use tracing::{debug, info, warn};

use crate::errors::EngineError;

/// Bound on the merged stream queue; forwarders park when verification and
/// appends fall behind.
const MERGE_QUEUE: usize = 64;

/// Pull beacons `last+1..=target` from `peers`, dialed in parallel and
/// raced: whichever peer delivers the next round first wins it, duplicates
/// from slower peers are skipped, and a peer that serves an invalid beacon
/// is dropped from the race. Each accepted beacon is verified against the
/// group key and chain order before being appended and handed to
/// `on_beacon`. Returns the new chain head.
pub async fn sync_chain_from(
    client: &dyn ProtocolClient,
    peers: &[String],
    beacon_id: &str,
    store: &Arc<dyn ChainStore>,
    scheme: &Scheme,
    public_key: &PublicKey,
    mut last: Beacon,
    target: u64,
    on_beacon: &(dyn Fn(&Beacon) + Sync),
) -> Result<Beacon, EngineError> {
    if last.round() >= target || peers.is_empty() {
        return Ok(last);
    }
    let request = SyncRequest {
        beacon_id: beacon_id.to_owned(),
        from_round: last.round() + 1,
    };

    // dial every peer concurrently; each opened stream feeds one merged
    // queue tagged with its peer
    let dials = peers.iter().map(|peer| {
        let request = &request;
        async move { (peer.clone(), client.sync_chain(peer, request).await) }
    });
    let (merged_tx, merged) = flume::bounded(MERGE_QUEUE);
    let mut live = 0usize;
    for (peer, dial) in futures::future::join_all(dials).await {
        match dial {
            Ok(stream) => {
                live += 1;
                let tx = merged_tx.clone();
                tokio::spawn(async move {
                    while let Ok(item) = stream.recv_async().await {
                        if tx.send_async((peer.clone(), item)).await.is_err() {
                            break;
                        }
                    }
                });
            }
            Err(e) => debug!(%peer, error = %e, "sync dial failed"),
        }
    }
    drop(merged_tx);
    if live == 0 {
        return Ok(last);
    }
    info!(peers = live, from = request.from_round, target, "syncing chain");

    let mut dropped: HashSet<String> = HashSet::new();
    while let Ok((peer, item)) = merged.recv_async().await {
        if last.round() >= target {
            break;
        }
        if dropped.contains(&peer) {
            continue;
        }
        let packet = match item {
            Ok(packet) => packet,
            Err(e) => {
                debug!(%peer, error = %e, "sync stream broke");
                dropped.insert(peer);
                continue;
            }
        };
        let beacon = Beacon::from(packet);
        // a slower peer re-serving rounds another already delivered
        if beacon.round() <= last.round() {
            continue;
        }
        if let Err(e) = beacon.verify(scheme, public_key, &last) {
            warn!(%peer, round = beacon.round(), error = %e, "peer served an invalid beacon");
            dropped.insert(peer);
            continue;
        }
        store.put(&beacon).await?;
        on_beacon(&beacon);
        last = beacon;
    }
    Ok(last)
}
