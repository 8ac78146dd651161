// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

//! The peer gateway: a pool of long-lived multiplexed connections carrying
//! the protocol, public, DKG and control RPC surfaces as length-delimited
//! frames, plus the server side dispatching inbound requests onto handler
//! channels.

mod conn;
mod errors;
mod frame;
mod ledger;
mod pool;
mod server;
mod transport;

pub use self::conn::ConnectionState;
pub use self::errors::NetError;
pub use self::frame::{Envelope, RpcKind};
pub use self::ledger::FailureLedger;
pub use self::pool::{Pool, ProtocolClient, DEFAULT_CALL_TIMEOUT, DKG_CALL_TIMEOUT};
pub use self::server::{serve, NetworkRequest};
pub use self::transport::Transport;

#[cfg(feature = "tls")]
pub use self::transport::TlsFiles;
