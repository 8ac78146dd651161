// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

//! Daemon wiring: one gateway and control surface shared by independently
//! owned per-beacon-id processes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use lantern_chain::proto::{
    self, BackupRequest, DkgCommandPacket, FollowRequest, ListBeaconsResponse, StatusRequest,
};
use lantern_crypto::SchemeId;
use lantern_key::{FileStore, IdentityPair};
use lantern_net::{serve as serve_gateway, NetworkRequest, Pool, RpcKind, Transport};
use lantern_rpc::AppState;
use rand::rngs::OsRng;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::process::BeaconProcess;

/// Grace given to in-flight work at shutdown before tasks are aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct Daemon {
    processes: Arc<HashMap<String, Arc<BeaconProcess>>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Daemon {
    pub async fn start(config: Config) -> anyhow::Result<Daemon> {
        let keystore = Arc::new(FileStore::open(&config.data_dir)?);
        let identity = Arc::new(match keystore.load_identity()? {
            Some(identity) => identity,
            None => {
                info!(address = %config.address, "generating a fresh identity keypair");
                let identity = IdentityPair::generate(config.address.clone(), &mut OsRng);
                keystore.save_identity(&identity)?;
                identity
            }
        });

        let transport = build_transport(&config)?;
        let pool = Arc::new(Pool::new(transport.clone()));
        let app_state = AppState::new(Vec::new());
        let cancel = CancellationToken::new();

        let mut processes = HashMap::new();
        for section in &config.beacons {
            let process = BeaconProcess::start(
                section,
                keystore.clone(),
                config.store_config(),
                pool.clone(),
                identity.clone(),
                app_state.clone(),
                cancel.child_token(),
            )
            .await
            .with_context(|| format!("starting beacon id {}", section.id))?;
            processes.insert(section.id.clone(), process);
        }
        let processes = Arc::new(processes);

        let (request_tx, request_rx) = flume::unbounded();
        let mut tasks = Vec::new();

        let peer_listener = TcpListener::bind(&config.peer_listen)
            .await
            .with_context(|| format!("binding peer listener {}", config.peer_listen))?;
        tasks.push(tokio::spawn(serve_gateway(
            peer_listener,
            transport.clone(),
            request_tx.clone(),
            false,
            cancel.clone(),
        )));

        let control_listener = TcpListener::bind(&config.control_listen)
            .await
            .with_context(|| format!("binding control listener {}", config.control_listen))?;
        tasks.push(tokio::spawn(serve_gateway(
            control_listener,
            transport,
            request_tx,
            true,
            cancel.clone(),
        )));

        let public_listener = TcpListener::bind(&config.public_listen)
            .await
            .with_context(|| format!("binding public listener {}", config.public_listen))?;
        info!(addr = %config.public_listen, "public http listening");
        {
            let state = app_state.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = lantern_rpc::serve(public_listener, state, cancel).await {
                    warn!(error = %e, "public http server exited");
                }
            }));
        }

        {
            let processes = processes.clone();
            let identity = identity.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(dispatch(
                processes, identity, request_rx, cancel,
            )));
        }

        Ok(Daemon {
            processes,
            cancel,
            tasks,
        })
    }

    /// Block until shutdown is requested, via signal or control verb.
    pub async fn wait(&self) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            result = tokio::signal::ctrl_c() => {
                if result.is_ok() {
                    info!("interrupt received");
                }
            }
        }
    }

    pub async fn shutdown(self) {
        info!("shutting down");
        self.cancel.cancel();
        for process in self.processes.values() {
            if let Some(engine) = process.engine() {
                let _ = engine.store().close().await;
            }
        }
        let drain = async {
            for task in &self.tasks {
                // tasks watch the cancellation token; give them the grace
                while !task.is_finished() {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!("grace expired; aborting remaining tasks");
        }
        for task in self.tasks {
            task.abort();
        }
        for process in self.processes.values() {
            process.stop();
        }
    }
}

fn build_transport(config: &Config) -> anyhow::Result<Transport> {
    if let Some(tls) = &config.tls {
        #[cfg(feature = "tls")]
        {
            let files = lantern_net::TlsFiles {
                certificate: tls.certificate.clone(),
                private_key: tls.private_key.clone(),
                trusted_roots: tls.trusted_roots.clone(),
            };
            return Ok(Transport::tls(&files)?);
        }
        #[cfg(not(feature = "tls"))]
        {
            let _ = tls;
            anyhow::bail!("built without tls support but [tls] is configured");
        }
    }
    #[cfg(feature = "insecure-tests")]
    {
        warn!("no [tls] section: running with the insecure plaintext transport");
        Ok(Transport::insecure())
    }
    #[cfg(not(feature = "insecure-tests"))]
    {
        anyhow::bail!("a [tls] section is required; plaintext needs the insecure-tests build")
    }
}

/// Route inbound gateway requests to their beacon-id's process.
async fn dispatch(
    processes: Arc<HashMap<String, Arc<BeaconProcess>>>,
    identity: Arc<IdentityPair>,
    requests: flume::Receiver<NetworkRequest>,
    cancel: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => break,
            request = requests.recv_async() => match request {
                Ok(request) => request,
                Err(_) => break,
            },
        };
        let processes = processes.clone();
        let identity = identity.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            handle_request(&processes, &identity, &cancel, request).await;
        });
    }
}

fn lookup<'a>(
    processes: &'a HashMap<String, Arc<BeaconProcess>>,
    beacon_id: &str,
) -> Result<&'a Arc<BeaconProcess>, String> {
    processes
        .get(beacon_id)
        .ok_or_else(|| format!("unknown beacon id {beacon_id:?}"))
}

async fn handle_request(
    processes: &HashMap<String, Arc<BeaconProcess>>,
    identity: &IdentityPair,
    cancel: &CancellationToken,
    request: NetworkRequest,
) {
    match request {
        NetworkRequest::GetIdentity { beacon_id, reply } => {
            let _ = reply.send(
                lookup(processes, &beacon_id).map(|p| p.identity_packet()),
            );
        }
        NetworkRequest::PartialBeacon { packet, reply } => {
            let result = match lookup(processes, &packet.beacon_id) {
                Ok(process) => process.handle_partial(packet).await,
                Err(e) => Err(e),
            };
            let _ = reply.send(result);
        }
        NetworkRequest::SyncChain { request, sink } => {
            if let Ok(process) = lookup(processes, &request.beacon_id) {
                process.handle_sync(request, sink);
            }
        }
        NetworkRequest::Status { request, reply } => {
            let _ = reply.send(
                lookup(processes, &request.beacon_id).map(|p| p.handle_status()),
            );
        }
        NetworkRequest::PublicRand { request, reply } => {
            let result = match lookup(processes, &request.beacon_id) {
                Ok(process) => process.handle_public_rand(request.round).await,
                Err(e) => Err(e),
            };
            let _ = reply.send(result);
        }
        NetworkRequest::PublicRandStream { request, sink } => {
            if let Ok(process) = lookup(processes, &request.beacon_id) {
                process.handle_public_stream(sink);
            }
        }
        NetworkRequest::ChainInfo { beacon_id, reply } => {
            let result = match lookup(processes, &beacon_id) {
                Ok(process) => process.handle_chain_info(),
                Err(e) => Err(e),
            };
            let _ = reply.send(result);
        }
        NetworkRequest::ListBeacons { reply } => {
            let _ = reply.send(Ok(ListBeaconsResponse {
                ids: processes.keys().cloned().collect(),
            }));
        }
        NetworkRequest::Dkg {
            packet,
            broadcast,
            reply,
        } => {
            let result = match lookup(processes, &packet.beacon_id) {
                Ok(process) => process.handle_dkg_packet(packet, broadcast).await,
                Err(e) => Err(e),
            };
            let _ = reply.send(result);
        }
        NetworkRequest::DkgStatus { beacon_id, reply } => {
            let _ = reply.send(
                lookup(processes, &beacon_id).map(|p| p.handle_dkg_status()),
            );
        }
        NetworkRequest::Control {
            kind,
            payload,
            reply,
        } => {
            let _ = reply.send(
                handle_control(processes, identity, cancel, kind, payload).await,
            );
        }
    }
}

async fn handle_control(
    processes: &HashMap<String, Arc<BeaconProcess>>,
    identity: &IdentityPair,
    cancel: &CancellationToken,
    kind: RpcKind,
    payload: Vec<u8>,
) -> Result<Vec<u8>, String> {
    match kind {
        RpcKind::Ping => Ok(b"pong".to_vec()),
        RpcKind::Shutdown => {
            info!("shutdown requested over the control surface");
            cancel.cancel();
            Ok(Vec::new())
        }
        RpcKind::PublicKey => Ok(hex::encode(identity.key.public_key().to_bytes()).into_bytes()),
        RpcKind::ListSchemes => {
            let schemes = [
                SchemeId::PedersenBlsChained.as_str(),
                SchemeId::PedersenBlsUnchained.as_str(),
            ];
            serde_json::to_vec(&schemes).map_err(|e| e.to_string())
        }
        RpcKind::GroupFile => {
            let request: StatusRequest =
                proto::decode(&payload).map_err(|e| e.to_string())?;
            let packet = lookup(processes, &request.beacon_id)?.group_packet()?;
            Ok(proto::encode(&packet))
        }
        RpcKind::LoadBeacon => {
            let request: StatusRequest =
                proto::decode(&payload).map_err(|e| e.to_string())?;
            let status = lookup(processes, &request.beacon_id)?.handle_status();
            Ok(proto::encode(&status))
        }
        RpcKind::BackupDb => {
            let request: BackupRequest =
                proto::decode(&payload).map_err(|e| e.to_string())?;
            let written = lookup(processes, &request.beacon_id)?
                .backup_db(&request.path)
                .await?;
            Ok(written.to_be_bytes().to_vec())
        }
        RpcKind::FollowChain => {
            let request: FollowRequest =
                proto::decode(&payload).map_err(|e| e.to_string())?;
            let head = lookup(processes, &request.beacon_id)?
                .follow_chain(request.peers, request.up_to)
                .await?;
            Ok(head.to_be_bytes().to_vec())
        }
        RpcKind::CheckChain => {
            let request: FollowRequest =
                proto::decode(&payload).map_err(|e| e.to_string())?;
            let verified = lookup(processes, &request.beacon_id)?.check_chain().await?;
            Ok(verified.to_be_bytes().to_vec())
        }
        RpcKind::DkgCommand => {
            let command: DkgCommandPacket =
                proto::decode(&payload).map_err(|e| e.to_string())?;
            lookup(processes, &command.beacon_id)?
                .handle_dkg_command(command)
                .await
        }
        other => Err(format!("unsupported control verb {other:?}")),
    }
}
