// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lantern_chain::proto::{
    self, BeaconPacket, ChainInfoPacket, DkgPacket, IdentityPacket, PartialBeaconPacket,
    StatusRequest, StatusResponse, SyncRequest,
};
use parking_lot::Mutex;
use tracing::debug;

use crate::conn::{Connection, ConnectionState};
use crate::errors::NetError;
use crate::frame::RpcKind;
use crate::ledger::FailureLedger;
use crate::transport::Transport;

/// Default per-call deadline.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// The protocol capabilities the beacon engine needs from the gateway,
/// kept narrow so engines can run against fakes in tests.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    async fn send_partial(
        &self,
        addr: &str,
        packet: &PartialBeaconPacket,
        timeout: Duration,
    ) -> Result<(), NetError>;

    async fn sync_chain(
        &self,
        addr: &str,
        request: &SyncRequest,
    ) -> Result<flume::Receiver<Result<BeaconPacket, NetError>>, NetError>;

    fn failure_ledger(&self) -> Arc<FailureLedger>;
}

#[async_trait]
impl ProtocolClient for Pool {
    async fn send_partial(
        &self,
        addr: &str,
        packet: &PartialBeaconPacket,
        timeout: Duration,
    ) -> Result<(), NetError> {
        Pool::send_partial(self, addr, packet, timeout).await
    }

    async fn sync_chain(
        &self,
        addr: &str,
        request: &SyncRequest,
    ) -> Result<flume::Receiver<Result<BeaconPacket, NetError>>, NetError> {
        Pool::sync_chain(self, addr, request).await
    }

    fn failure_ledger(&self) -> Arc<FailureLedger> {
        self.ledger()
    }
}
/// DKG gossip gets a longer leash; a deal bundle can be slow to produce.
pub const DKG_CALL_TIMEOUT: Duration = Duration::from_secs(120);

/// Outbound connection pool keyed by peer address. A peer's connection is
/// dialed on first use and replaced transparently once observed in a
/// terminal state.
pub struct Pool {
    transport: Transport,
    conns: Mutex<HashMap<String, Arc<Connection>>>,
    ledger: Arc<FailureLedger>,
    call_timeout: Duration,
}

impl Pool {
    pub fn new(transport: Transport) -> Self {
        Pool {
            transport,
            conns: Mutex::new(HashMap::new()),
            ledger: Arc::new(FailureLedger::new()),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// The failure ledger feeding the threshold monitor.
    pub fn ledger(&self) -> Arc<FailureLedger> {
        self.ledger.clone()
    }

    /// Current connection states, for status surfaces.
    pub fn peer_states(&self) -> HashMap<String, ConnectionState> {
        self.conns
            .lock()
            .iter()
            .map(|(addr, conn)| (addr.clone(), conn.state()))
            .collect()
    }

    pub fn close(&self) {
        for (_, conn) in self.conns.lock().drain() {
            conn.close();
        }
    }

    async fn conn(&self, addr: &str) -> Result<Arc<Connection>, NetError> {
        if let Some(conn) = self.conns.lock().get(addr) {
            if conn.state() == ConnectionState::Ready {
                return Ok(conn.clone());
            }
        }
        // dial outside the lock; last dialer in wins the map slot
        let io = self.transport.connect(addr).await?;
        let conn = Connection::spawn(io, addr.to_owned());
        let mut conns = self.conns.lock();
        if let Some(stale) = conns.insert(addr.to_owned(), conn.clone()) {
            stale.close();
        }
        Ok(conn)
    }

    async fn unary(
        &self,
        addr: &str,
        kind: RpcKind,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, NetError> {
        let conn = self.conn(addr).await?;
        conn.request(kind, payload, timeout).await
    }

    // --- protocol surface ---

    pub async fn get_identity(
        &self,
        addr: &str,
        beacon_id: &str,
    ) -> Result<IdentityPacket, NetError> {
        let req = StatusRequest {
            beacon_id: beacon_id.to_owned(),
        };
        let bytes = self
            .unary(addr, RpcKind::GetIdentity, proto::encode(&req), self.call_timeout)
            .await?;
        Ok(proto::decode(&bytes)?)
    }

    /// Fire-and-forget-acknowledged partial dispatch. A failure is recorded
    /// against the peer for the threshold monitor; there are no retries
    /// within a round.
    pub async fn send_partial(
        &self,
        addr: &str,
        packet: &PartialBeaconPacket,
        timeout: Duration,
    ) -> Result<(), NetError> {
        let result = self
            .unary(addr, RpcKind::PartialBeacon, proto::encode(packet), timeout)
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                debug!(peer = addr, round = packet.round, error = %e, "partial dispatch failed");
                self.ledger.record(addr);
                Err(e)
            }
        }
    }

    /// Ask a peer to stream its chain from `from_round` upward. The stream
    /// ends cleanly when the channel closes without an error item.
    pub async fn sync_chain(
        &self,
        addr: &str,
        request: &SyncRequest,
    ) -> Result<flume::Receiver<Result<BeaconPacket, NetError>>, NetError> {
        let conn = self.conn(addr).await?;
        let envelopes = conn.request_stream(RpcKind::SyncChain, proto::encode(request))?;
        let (tx, rx) = flume::unbounded();
        let peer = addr.to_owned();
        tokio::spawn(async move {
            while let Ok(item) = envelopes.recv_async().await {
                let mapped = item.and_then(|env| {
                    proto::decode::<BeaconPacket>(&env.payload).map_err(Into::into)
                });
                let failed = mapped.is_err();
                if tx.send(mapped).is_err() {
                    break;
                }
                if failed {
                    debug!(%peer, "sync stream terminated with error");
                    break;
                }
            }
        });
        Ok(rx)
    }

    pub async fn status(
        &self,
        addr: &str,
        beacon_id: &str,
    ) -> Result<StatusResponse, NetError> {
        let req = StatusRequest {
            beacon_id: beacon_id.to_owned(),
        };
        let bytes = self
            .unary(addr, RpcKind::Status, proto::encode(&req), self.call_timeout)
            .await?;
        Ok(proto::decode(&bytes)?)
    }

    // --- public surface ---

    pub async fn chain_info(
        &self,
        addr: &str,
        beacon_id: &str,
    ) -> Result<ChainInfoPacket, NetError> {
        let req = StatusRequest {
            beacon_id: beacon_id.to_owned(),
        };
        let bytes = self
            .unary(addr, RpcKind::ChainInfo, proto::encode(&req), self.call_timeout)
            .await?;
        Ok(proto::decode(&bytes)?)
    }

    /// Follow a peer's beacon emissions. Used by the public handler's watch
    /// task and by follower deployments.
    pub async fn public_rand_stream(
        &self,
        addr: &str,
        beacon_id: &str,
    ) -> Result<flume::Receiver<Result<BeaconPacket, NetError>>, NetError> {
        let req = lantern_chain::proto::PublicRandRequest {
            beacon_id: beacon_id.to_owned(),
            round: 0,
        };
        let conn = self.conn(addr).await?;
        let envelopes = conn.request_stream(RpcKind::PublicRandStream, proto::encode(&req))?;
        let (tx, rx) = flume::unbounded();
        tokio::spawn(async move {
            while let Ok(item) = envelopes.recv_async().await {
                let mapped = item.and_then(|env| {
                    proto::decode::<BeaconPacket>(&env.payload).map_err(Into::into)
                });
                let failed = mapped.is_err();
                if tx.send(mapped).is_err() || failed {
                    break;
                }
            }
        });
        Ok(rx)
    }

    // --- control surface (client side, localhost daemons) ---

    /// Issue a raw control verb; the payload is interpreted by the daemon.
    pub async fn control(
        &self,
        addr: &str,
        kind: RpcKind,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, NetError> {
        self.unary(addr, kind, payload, self.call_timeout).await
    }

    // --- dkg surface ---

    pub async fn send_dkg(&self, addr: &str, packet: &DkgPacket) -> Result<(), NetError> {
        self.unary(addr, RpcKind::DkgPacket, proto::encode(packet), DKG_CALL_TIMEOUT)
            .await
            .map(|_| ())
    }

    /// Gossip a packet to every listed peer in parallel; per-peer results.
    pub async fn broadcast_dkg(
        &self,
        addrs: &[String],
        packet: &DkgPacket,
    ) -> Vec<(String, Result<(), NetError>)> {
        let mut tasks = Vec::with_capacity(addrs.len());
        for addr in addrs {
            tasks.push(async move { (addr.clone(), self.send_dkg(addr, packet).await) });
        }
        futures::future::join_all(tasks).await
    }
}
