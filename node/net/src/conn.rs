// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::errors::NetError;
use crate::frame::{codec, Envelope, RpcKind};
use crate::transport::BoxedIo;

/// Observable lifecycle of one pooled connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Ready,
    /// A read or write failed; the pool redials on next use.
    Broken,
    Closed,
}

enum Pending {
    Unary(oneshot::Sender<Result<Envelope, NetError>>),
    Stream(flume::Sender<Result<Envelope, NetError>>),
}

/// One multiplexed connection: a writer task draining an outbound queue and
/// a reader task routing responses to their callers by request id.
pub(crate) struct Connection {
    outbound: flume::Sender<Envelope>,
    pending: Arc<Mutex<HashMap<u64, Pending>>>,
    next_id: AtomicU64,
    state: Arc<Mutex<ConnectionState>>,
    cancel: CancellationToken,
}

impl Connection {
    pub(crate) fn spawn(io: BoxedIo, peer: String) -> Arc<Connection> {
        let (outbound, outbound_rx) = flume::unbounded::<Envelope>();
        let pending: Arc<Mutex<HashMap<u64, Pending>>> = Arc::default();
        let state = Arc::new(Mutex::new(ConnectionState::Ready));
        let cancel = CancellationToken::new();

        let (mut sink, mut stream) = Framed::new(io, codec()).split();

        // writer
        {
            let state = state.clone();
            let cancel = cancel.clone();
            let peer = peer.clone();
            tokio::spawn(async move {
                loop {
                    let env = tokio::select! {
                        _ = cancel.cancelled() => break,
                        env = outbound_rx.recv_async() => match env {
                            Ok(env) => env,
                            Err(_) => break,
                        },
                    };
                    if let Err(e) = sink.send(env.to_frame()).await {
                        debug!(%peer, error = %e, "connection write failed");
                        *state.lock() = ConnectionState::Broken;
                        cancel.cancel();
                        break;
                    }
                }
            });
        }

        // reader
        {
            let pending = pending.clone();
            let state = state.clone();
            let cancel = cancel.clone();
            let peer = peer.clone();
            tokio::spawn(async move {
                loop {
                    let frame = tokio::select! {
                        _ = cancel.cancelled() => break,
                        frame = stream.next() => frame,
                    };
                    match frame {
                        Some(Ok(bytes)) => match Envelope::from_frame(&bytes) {
                            Ok(env) => route(&pending, env),
                            Err(e) => {
                                debug!(%peer, error = %e, "undecodable frame");
                            }
                        },
                        Some(Err(e)) => {
                            debug!(%peer, error = %e, "connection read failed");
                            break;
                        }
                        None => {
                            trace!(%peer, "connection closed by remote");
                            break;
                        }
                    }
                }
                let mut current = state.lock();
                if *current == ConnectionState::Ready {
                    *current = ConnectionState::Broken;
                }
                drop(current);
                cancel.cancel();
                fail_all(&pending);
            });
        }

        Arc::new(Connection {
            outbound,
            pending,
            next_id: AtomicU64::new(1),
            state,
            cancel,
        })
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub(crate) fn close(&self) {
        *self.state.lock() = ConnectionState::Closed;
        self.cancel.cancel();
        fail_all(&self.pending);
    }

    /// Issue a unary call and await its single response.
    pub(crate) async fn request(
        &self,
        kind: RpcKind,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, NetError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, Pending::Unary(tx));

        if self.outbound.send(Envelope::request(id, kind, payload)).is_err() {
            self.pending.lock().remove(&id);
            return Err(NetError::StreamClosed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result?.into_result(),
            Ok(Err(_)) => Err(NetError::StreamClosed),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(NetError::Timeout)
            }
        }
    }

    /// Issue a streaming call; items arrive on the returned channel until an
    /// `eof` frame (channel closes) or an error item.
    pub(crate) fn request_stream(
        &self,
        kind: RpcKind,
        payload: Vec<u8>,
    ) -> Result<flume::Receiver<Result<Envelope, NetError>>, NetError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        // unbounded: the reader task must never block while routing
        let (tx, rx) = flume::unbounded();
        self.pending.lock().insert(id, Pending::Stream(tx));

        if self.outbound.send(Envelope::request(id, kind, payload)).is_err() {
            self.pending.lock().remove(&id);
            return Err(NetError::StreamClosed);
        }
        Ok(rx)
    }
}

fn route(pending: &Mutex<HashMap<u64, Pending>>, env: Envelope) {
    let id = env.request_id;
    let mut map = pending.lock();
    match map.remove(&id) {
        Some(Pending::Unary(tx)) => {
            let _ = tx.send(Ok(env));
        }
        Some(Pending::Stream(tx)) => {
            if !env.error.is_empty() {
                let _ = tx.send(Err(NetError::Remote(env.error)));
            } else if env.eof {
                // dropping the sender is the clean end-of-stream signal
            } else if tx.send(Ok(env)).is_ok() {
                map.insert(id, Pending::Stream(tx));
            }
        }
        None => trace!(request_id = id, "response for unknown request"),
    }
}

fn fail_all(pending: &Mutex<HashMap<u64, Pending>>) {
    for (_, slot) in pending.lock().drain() {
        match slot {
            Pending::Unary(tx) => {
                let _ = tx.send(Err(NetError::StreamClosed));
            }
            Pending::Stream(tx) => {
                let _ = tx.send(Err(NetError::StreamClosed));
            }
        }
    }
}
