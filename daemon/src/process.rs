// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

//! One hosted chain: store, engine, monitor and DKG coordinator, owned
//! together and torn down in isolation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use lantern_beacon::{Engine, ThresholdMonitor};
use lantern_chain::proto::{
    BeaconPacket, ChainInfoPacket, DkgCommandPacket, DkgPacket, DkgVerb, GroupPacket,
    IdentityPacket, PartialBeaconPacket, StatusResponse, SyncRequest,
};
use lantern_chain::{Beacon, ChainInfo, Group, Node};
use lantern_crypto::Share;
use lantern_db::{BeaconCursor, StoreConfig};
use lantern_dkg::{Coordinator, CoordinatorConfig, DkgTransport, PreviousEpoch, Proposal};
use lantern_key::{FileStore, IdentityPair};
use lantern_net::Pool;
use lantern_rpc::{spawn_watcher, AppState, ChainHandle};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::BeaconSection;

/// Ceremony gossip over the gateway's DKG surface.
struct GossipTransport(Arc<Pool>);

#[async_trait]
impl DkgTransport for GossipTransport {
    async fn gossip(&self, peers: &[String], packet: DkgPacket) {
        for (peer, result) in self.0.broadcast_dkg(peers, &packet).await {
            if let Err(e) = result {
                warn!(%peer, error = %e, "dkg gossip failed");
            }
        }
    }
}

pub struct BeaconProcess {
    beacon_id: String,
    keystore: Arc<FileStore>,
    store_config: StoreConfig,
    pool: Arc<Pool>,
    identity: Arc<IdentityPair>,
    monitor: Arc<ThresholdMonitor>,
    coordinator: Arc<Coordinator>,
    engine: RwLock<Option<Arc<Engine>>>,
    app_state: AppState,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Set on a fatal persistence error; shared with the chain's public
    /// handle so `/health` answers 503 immediately while the daemon stays
    /// up.
    disabled: Arc<AtomicBool>,
}

impl BeaconProcess {
    pub async fn start(
        section: &BeaconSection,
        keystore: Arc<FileStore>,
        store_config: StoreConfig,
        pool: Arc<Pool>,
        identity: Arc<IdentityPair>,
        app_state: AppState,
        cancel: CancellationToken,
    ) -> anyhow::Result<Arc<Self>> {
        let beacon_id = section.id.clone();
        let previous_group = keystore.latest_group(&beacon_id)?.map(Arc::new);
        let previous_share = match &previous_group {
            Some(group) => keystore
                .load_share(&beacon_id, group.epoch)?
                .map(|(share, _)| share),
            None => None,
        };

        let coordinator = Coordinator::new(
            CoordinatorConfig {
                beacon_id: beacon_id.clone(),
                address: identity.address.clone(),
                identity_key: Arc::new(identity.key.clone()),
                phase_timeout: section.dkg_phase_timeout,
                auto_accept: section.auto_accept_dkg,
            },
            Arc::new(GossipTransport(pool.clone())),
            previous_group.as_ref().map(|group| PreviousEpoch {
                group: group.clone(),
                share: previous_share.clone(),
            }),
        );

        let (n, threshold) = previous_group
            .as_ref()
            .map(|g| (g.size(), g.threshold as usize))
            .unwrap_or((0, 0));
        let monitor = Arc::new(ThresholdMonitor::new(
            beacon_id.clone(),
            pool.ledger(),
            n,
            threshold,
        ));

        let process = Arc::new(BeaconProcess {
            beacon_id,
            keystore,
            store_config,
            pool,
            identity,
            monitor,
            coordinator,
            engine: RwLock::new(None),
            app_state,
            cancel,
            tasks: Mutex::new(Vec::new()),
            disabled: Arc::new(AtomicBool::new(false)),
        });

        process.spawn(process.monitor.clone().run(process.cancel.clone()));
        process.spawn(process.coordinator.clone().run(process.cancel.clone()));
        process.spawn_completion_loop();

        if let Some(group) = previous_group {
            process.open_engine(group, previous_share).await?;
        }
        Ok(process)
    }

    fn spawn(&self, task: impl std::future::Future<Output = ()> + Send + 'static) {
        self.tasks.lock().push(tokio::spawn(task));
    }

    pub fn beacon_id(&self) -> &str {
        &self.beacon_id
    }

    pub fn engine(&self) -> Option<Arc<Engine>> {
        self.engine.read().clone()
    }

    fn require_engine(&self) -> Result<Arc<Engine>, String> {
        if self.disabled.load(Ordering::Relaxed) {
            return Err("beacon id is disabled after a storage failure".into());
        }
        self.engine()
            .ok_or_else(|| "no group loaded for this beacon id".into())
    }

    /// Bring the signing/collecting machinery up for a (new) group.
    async fn open_engine(
        &self,
        group: Arc<Group>,
        share: Option<Share>,
    ) -> anyhow::Result<()> {
        let store = self.store_config.open(&self.beacon_id).await?;
        let chain_hash = if group.epoch == 1 {
            group.hash()
        } else {
            self.keystore
                .load_group(&self.beacon_id, 1)
                .map(|g| g.hash())
                .unwrap_or_else(|_| group.hash())
        };
        let engine = Engine::new(
            store,
            self.pool.clone(),
            self.monitor.clone(),
            group.clone(),
            share,
            chain_hash,
        )
        .await?;
        self.monitor
            .update_params(group.size(), group.threshold as usize);

        self.spawn(engine.clone().run(self.cancel.clone()));
        let handle = ChainHandle::new(engine.clone(), self.disabled.clone());
        let watcher = spawn_watcher(handle.clone(), self.cancel.clone());
        self.tasks.lock().push(watcher);
        self.app_state.add_chain(handle);

        *self.engine.write() = Some(engine);
        Ok(())
    }

    /// Persist and install each completed ceremony.
    fn spawn_completion_loop(self: &Arc<Self>) {
        let process = self.clone();
        let completions = self.coordinator.completions();
        self.spawn(async move {
            loop {
                let output = tokio::select! {
                    _ = process.cancel.cancelled() => break,
                    output = completions.recv_async() => match output {
                        Ok(output) => output,
                        Err(_) => break,
                    },
                };
                if let Err(e) = process.install(output.group, output.share).await {
                    error!(
                        beacon_id = %process.beacon_id,
                        error = %e,
                        "failed to install completed ceremony"
                    );
                }
            }
        });
    }

    async fn install(&self, group: Arc<Group>, share: Option<Share>) -> anyhow::Result<()> {
        self.keystore.save_group(&group)?;
        if let Some(share) = &share {
            self.keystore
                .save_share(&self.beacon_id, group.epoch, share, &group.public_poly)?;
        }
        // shares two epochs back have served their purpose
        if group.epoch >= 3 {
            let _ = self.keystore.delete_share(&self.beacon_id, group.epoch - 2);
        }
        self.coordinator.set_previous(PreviousEpoch {
            group: group.clone(),
            share: share.clone(),
        });

        match self.engine() {
            Some(engine) => engine.stage_next_group(group, share),
            None => self.open_engine(group, share).await?,
        }
        info!(beacon_id = %self.beacon_id, "ceremony output installed");
        Ok(())
    }

    fn disable(&self) {
        if !self.disabled.swap(true, Ordering::Relaxed) {
            error!(
                beacon_id = %self.beacon_id,
                "disabling beacon id after a storage failure"
            );
        }
    }

    // --- protocol surface ----------------------------------------------

    pub fn identity_packet(&self) -> IdentityPacket {
        let node: Node = self.identity.node(0);
        IdentityPacket {
            address: node.address,
            key: node.key.to_bytes().to_vec(),
            signature: node.signature,
        }
    }

    pub async fn handle_partial(&self, packet: PartialBeaconPacket) -> Result<(), String> {
        let engine = self.require_engine()?;
        match engine.process_partial(packet).await {
            Ok(()) => Ok(()),
            Err(lantern_beacon::EngineError::Store(e)) => {
                self.disable();
                Err(e.to_string())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    /// Stream stored beacons from `from_round` to the chain head.
    pub fn handle_sync(&self, request: SyncRequest, sink: flume::Sender<BeaconPacket>) {
        let engine = match self.require_engine() {
            Ok(engine) => engine,
            Err(_) => return,
        };
        tokio::spawn(async move {
            let store = engine.store();
            let mut cursor = match BeaconCursor::acquire(store).await {
                Ok(cursor) => cursor,
                Err(_) => return,
            };
            let mut item = if request.from_round == 0 {
                cursor.first().await
            } else {
                cursor.seek(request.from_round).await
            };
            loop {
                match item {
                    Ok(Some(beacon)) => {
                        if sink.send(BeaconPacket::from(beacon)).is_err() {
                            return;
                        }
                    }
                    Ok(None) | Err(_) => return,
                }
                item = cursor.next().await;
            }
        });
    }

    pub fn handle_status(&self) -> StatusResponse {
        let mut status = match self.engine() {
            Some(engine) => engine.status(),
            None => StatusResponse {
                beacon_id: self.beacon_id.clone(),
                ..Default::default()
            },
        };
        status.dkg_status = self.coordinator.status_line();
        status
    }

    // --- public surface -------------------------------------------------

    pub async fn handle_public_rand(&self, round: u64) -> Result<BeaconPacket, String> {
        let engine = self.require_engine()?;
        let beacon = if round == 0 {
            engine.last_beacon()
        } else {
            engine
                .store()
                .get(round)
                .await
                .map_err(|e| e.to_string())?
                .ok_or_else(|| "no beacon stored for that round".to_owned())?
        };
        Ok(BeaconPacket::from(beacon))
    }

    pub fn handle_public_stream(&self, sink: flume::Sender<BeaconPacket>) {
        let engine = match self.require_engine() {
            Ok(engine) => engine,
            Err(_) => return,
        };
        tokio::spawn(async move {
            let mut finalized = engine.subscribe_finalized();
            loop {
                match finalized.recv().await {
                    Ok(beacon) => {
                        if sink.send(BeaconPacket::from(beacon)).is_err() {
                            return;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(_) => return,
                }
            }
        });
    }

    pub fn handle_chain_info(&self) -> Result<ChainInfoPacket, String> {
        let engine = self.require_engine()?;
        let state = engine.epoch_state();
        let info = ChainInfo::from_group(&state.group, engine.chain_hash());
        let mut packet = ChainInfoPacket::from(&info);
        packet.beacon_id = self.beacon_id.clone();
        Ok(packet)
    }

    // --- dkg surface ----------------------------------------------------

    pub async fn handle_dkg_packet(
        &self,
        packet: DkgPacket,
        rebroadcast: bool,
    ) -> Result<(), String> {
        self.coordinator
            .handle_packet(packet, rebroadcast)
            .await
            .map_err(|e| e.to_string())
    }

    pub fn handle_dkg_status(&self) -> StatusResponse {
        let mut status = StatusResponse {
            beacon_id: self.beacon_id.clone(),
            ..Default::default()
        };
        status.epoch = self.coordinator.epoch();
        status.dkg_status = self.coordinator.status_line();
        status
    }

    pub async fn handle_dkg_command(&self, command: DkgCommandPacket) -> Result<Vec<u8>, String> {
        let verb =
            DkgVerb::try_from(command.verb).map_err(|_| "unknown dkg verb".to_owned())?;
        let result = match verb {
            DkgVerb::Propose => {
                let packet = command
                    .proposal
                    .ok_or_else(|| "propose needs a proposal".to_owned())?;
                let proposal = Proposal::try_from(packet).map_err(|e| e.to_string())?;
                self.coordinator.propose(proposal).await
            }
            DkgVerb::JoinCeremony => self.coordinator.join().await,
            DkgVerb::AcceptProposal => self.coordinator.accept().await,
            DkgVerb::RejectProposal => self.coordinator.reject().await,
            DkgVerb::ExecuteCeremony => self.coordinator.execute().await,
            DkgVerb::AbortCeremony => self.coordinator.abort().await,
            DkgVerb::CeremonyStatus => Ok(()),
            DkgVerb::UnknownVerb => return Err("unknown dkg verb".into()),
        };
        result.map_err(|e| e.to_string())?;
        Ok(self.coordinator.status_line().into_bytes())
    }

    // --- control surface ------------------------------------------------

    pub fn group_packet(&self) -> Result<GroupPacket, String> {
        let engine = self.require_engine()?;
        let state = engine.epoch_state();
        Ok(GroupPacket::from(state.group.as_ref()))
    }

    pub async fn backup_db(&self, path: &str) -> Result<u64, String> {
        let engine = self.require_engine()?;
        let mut file = std::fs::File::create(path).map_err(|e| e.to_string())?;
        lantern_db::save_to(engine.store(), &mut file)
            .await
            .map_err(|e| e.to_string())
    }

    /// Resync from explicit peers; returns the new chain head.
    pub async fn follow_chain(&self, peers: Vec<String>, up_to: u64) -> Result<u64, String> {
        let engine = self.require_engine()?;
        Ok(engine.sync_from(&peers, up_to).await)
    }

    /// Re-verify the whole stored chain; returns the number of valid rounds.
    pub async fn check_chain(&self) -> Result<u64, String> {
        let engine = self.require_engine()?;
        let state = engine.epoch_state();
        let scheme = state.group.scheme();
        let public_key = state.group.public_key();

        let mut cursor = BeaconCursor::acquire(engine.store())
            .await
            .map_err(|e| e.to_string())?;
        let mut previous: Option<Beacon> = None;
        let mut verified = 0u64;
        let mut item = cursor.first().await.map_err(|e| e.to_string())?;
        while let Some(beacon) = item {
            if let Some(prev) = &previous {
                beacon
                    .verify(&scheme, &public_key, prev)
                    .map_err(|e| format!("round {}: {}", beacon.round(), e))?;
            }
            verified += 1;
            previous = Some(beacon);
            item = cursor.next().await.map_err(|e| e.to_string())?;
        }
        Ok(verified)
    }

    /// Abort this chain's tasks; the daemon tears processes down one by one.
    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
