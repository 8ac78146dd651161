// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

//! Server side of the gateway: accepts connections, decodes envelopes and
//! fans each request out to the daemon's handler channel, writing responses
//! (and stream items) back in arrival order per connection.

use futures::{SinkExt, StreamExt};
use lantern_chain::proto::{
    self, BeaconPacket, ChainInfoPacket, DkgPacket, IdentityPacket, ListBeaconsResponse,
    PartialBeaconPacket, PublicRandRequest, StatusRequest, StatusResponse, SyncRequest,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::NetError;
use crate::frame::{codec, Envelope, RpcKind};
use crate::transport::Transport;

/// Reply channel of a unary request; the handler answers with the response
/// packet or a human-readable error relayed to the caller.
pub type Reply<T> = oneshot::Sender<Result<T, String>>;

/// A decoded inbound request, handed to the daemon for dispatch.
pub enum NetworkRequest {
    GetIdentity {
        beacon_id: String,
        reply: Reply<IdentityPacket>,
    },
    PartialBeacon {
        packet: PartialBeaconPacket,
        reply: Reply<()>,
    },
    SyncChain {
        request: SyncRequest,
        sink: flume::Sender<BeaconPacket>,
    },
    Status {
        request: StatusRequest,
        reply: Reply<StatusResponse>,
    },
    PublicRand {
        request: PublicRandRequest,
        reply: Reply<BeaconPacket>,
    },
    PublicRandStream {
        request: PublicRandRequest,
        sink: flume::Sender<BeaconPacket>,
    },
    ChainInfo {
        beacon_id: String,
        reply: Reply<ChainInfoPacket>,
    },
    ListBeacons {
        reply: Reply<ListBeaconsResponse>,
    },
    Dkg {
        packet: DkgPacket,
        /// Set when the sender asked for the packet to be re-gossiped.
        broadcast: bool,
        reply: Reply<()>,
    },
    DkgStatus {
        beacon_id: String,
        reply: Reply<StatusResponse>,
    },
    /// Control verbs are opaque to the gateway; the daemon interprets the
    /// payload per kind. Only delivered from the localhost listener.
    Control {
        kind: RpcKind,
        payload: Vec<u8>,
        reply: Reply<Vec<u8>>,
    },
}

/// Accept loop. `allow_control` is true only for the localhost listener.
pub async fn serve(
    listener: TcpListener,
    transport: Transport,
    handler: flume::Sender<NetworkRequest>,
    allow_control: bool,
    cancel: CancellationToken,
) {
    info!(
        addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
        control = allow_control,
        "gateway listening"
    );
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (tcp, remote) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let transport = transport.clone();
        let handler = handler.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let io = match transport.accept(tcp).await {
                Ok(io) => io,
                Err(e) => {
                    debug!(%remote, error = %e, "handshake failed");
                    return;
                }
            };
            handle_connection(io, handler, allow_control, cancel).await;
        });
    }
}

async fn handle_connection(
    io: crate::transport::BoxedIo,
    handler: flume::Sender<NetworkRequest>,
    allow_control: bool,
    cancel: CancellationToken,
) {
    let (mut sink, mut stream) = Framed::new(io, codec()).split();
    let (out_tx, out_rx) = flume::unbounded::<Envelope>();

    let writer = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let env = tokio::select! {
                    _ = cancel.cancelled() => break,
                    env = out_rx.recv_async() => match env {
                        Ok(env) => env,
                        Err(_) => break,
                    },
                };
                if sink.send(env.to_frame()).await.is_err() {
                    break;
                }
            }
        })
    };

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = stream.next() => frame,
        };
        let bytes = match frame {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                debug!(error = %e, "connection read failed");
                break;
            }
            None => break,
        };
        let env = match Envelope::from_frame(&bytes) {
            Ok(env) => env,
            Err(e) => {
                debug!(error = %e, "undecodable request frame");
                continue;
            }
        };
        dispatch(env, &handler, &out_tx, allow_control);
    }
    writer.abort();
}

fn dispatch(
    env: Envelope,
    handler: &flume::Sender<NetworkRequest>,
    out: &flume::Sender<Envelope>,
    allow_control: bool,
) {
    let id = env.request_id;
    let kind = env.rpc_kind();

    if kind.is_control() && !allow_control {
        let _ = out.send(Envelope::failure(
            id,
            kind,
            "control surface is local-only".into(),
        ));
        return;
    }

    let request = match decode_request(&env, kind, id, out) {
        Some(request) => request,
        None => return,
    };
    if handler.send(request).is_err() {
        let _ = out.send(Envelope::failure(id, kind, "daemon is shutting down".into()));
    }
}

/// Build the `NetworkRequest` for an envelope, wiring its reply path back to
/// the connection's outbound queue. Returns `None` after answering a
/// malformed or unknown request inline.
fn decode_request(
    env: &Envelope,
    kind: RpcKind,
    id: u64,
    out: &flume::Sender<Envelope>,
) -> Option<NetworkRequest> {
    fn malformed(out: &flume::Sender<Envelope>, id: u64, kind: RpcKind) {
        let _ = out.send(Envelope::failure(id, kind, "malformed request".into()));
    }

    macro_rules! parse {
        ($ty:ty) => {
            match proto::decode::<$ty>(&env.payload) {
                Ok(req) => req,
                Err(_) => {
                    malformed(out, id, kind);
                    return None;
                }
            }
        };
    }

    let request = match kind {
        RpcKind::GetIdentity => {
            let req = parse!(StatusRequest);
            NetworkRequest::GetIdentity {
                beacon_id: req.beacon_id,
                reply: unary_reply(out.clone(), id, kind),
            }
        }
        RpcKind::PartialBeacon => NetworkRequest::PartialBeacon {
            packet: parse!(PartialBeaconPacket),
            reply: ack_reply(out.clone(), id, kind),
        },
        RpcKind::SyncChain => NetworkRequest::SyncChain {
            request: parse!(SyncRequest),
            sink: stream_sink(out.clone(), id, kind),
        },
        RpcKind::Status => NetworkRequest::Status {
            request: parse!(StatusRequest),
            reply: unary_reply(out.clone(), id, kind),
        },
        RpcKind::PublicRand => NetworkRequest::PublicRand {
            request: parse!(PublicRandRequest),
            reply: unary_reply(out.clone(), id, kind),
        },
        RpcKind::PublicRandStream => NetworkRequest::PublicRandStream {
            request: parse!(PublicRandRequest),
            sink: stream_sink(out.clone(), id, kind),
        },
        RpcKind::ChainInfo => {
            let req = parse!(StatusRequest);
            NetworkRequest::ChainInfo {
                beacon_id: req.beacon_id,
                reply: unary_reply(out.clone(), id, kind),
            }
        }
        RpcKind::ListBeacons => NetworkRequest::ListBeacons {
            reply: unary_reply(out.clone(), id, kind),
        },
        RpcKind::DkgPacket | RpcKind::BroadcastDkg => NetworkRequest::Dkg {
            packet: parse!(DkgPacket),
            broadcast: kind == RpcKind::BroadcastDkg,
            reply: ack_reply(out.clone(), id, kind),
        },
        RpcKind::DkgStatus => {
            let req = parse!(StatusRequest);
            NetworkRequest::DkgStatus {
                beacon_id: req.beacon_id,
                reply: unary_reply(out.clone(), id, kind),
            }
        }
        RpcKind::Unknown => {
            malformed(out, id, kind);
            return None;
        }
        control => NetworkRequest::Control {
            kind: control,
            payload: env.payload.clone(),
            reply: raw_reply(out.clone(), id, kind),
        },
    };
    Some(request)
}

/// An acknowledgement-only reply: success is an empty payload.
fn ack_reply(out: flume::Sender<Envelope>, id: u64, kind: RpcKind) -> Reply<()> {
    let (tx, rx) = oneshot::channel::<Result<(), String>>();
    tokio::spawn(async move {
        let env = match rx.await {
            Ok(Ok(())) => Envelope::response(id, kind, Vec::new()),
            Ok(Err(error)) => Envelope::failure(id, kind, error),
            Err(_) => Envelope::failure(id, kind, "request dropped".into()),
        };
        let _ = out.send(env);
    });
    tx
}

/// A oneshot whose answer is encoded and queued on the connection.
fn unary_reply<T: prost::Message + 'static>(
    out: flume::Sender<Envelope>,
    id: u64,
    kind: RpcKind,
) -> Reply<T> {
    let (tx, rx) = oneshot::channel::<Result<T, String>>();
    tokio::spawn(async move {
        let env = match rx.await {
            Ok(Ok(packet)) => Envelope::response(id, kind, packet.encode_to_vec()),
            Ok(Err(error)) => Envelope::failure(id, kind, error),
            Err(_) => Envelope::failure(id, kind, "request dropped".into()),
        };
        let _ = out.send(env);
    });
    tx
}

/// A reply whose payload is already encoded by the handler.
fn raw_reply(out: flume::Sender<Envelope>, id: u64, kind: RpcKind) -> Reply<Vec<u8>> {
    let (tx, rx) = oneshot::channel::<Result<Vec<u8>, String>>();
    tokio::spawn(async move {
        let env = match rx.await {
            Ok(Ok(payload)) => Envelope::response(id, kind, payload),
            Ok(Err(error)) => Envelope::failure(id, kind, error),
            Err(_) => Envelope::failure(id, kind, "request dropped".into()),
        };
        let _ = out.send(env);
    });
    tx
}

/// A channel whose items become stream frames; dropping it emits `eof`.
fn stream_sink(out: flume::Sender<Envelope>, id: u64, kind: RpcKind) -> flume::Sender<BeaconPacket> {
    let (tx, rx) = flume::unbounded::<BeaconPacket>();
    tokio::spawn(async move {
        while let Ok(packet) = rx.recv_async().await {
            if out
                .send(Envelope::response(id, kind, proto::encode(&packet)))
                .is_err()
            {
                return;
            }
        }
        let _ = out.send(Envelope::stream_end(id, kind));
    });
    tx
}
