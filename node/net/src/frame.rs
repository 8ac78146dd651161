// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

use bytes::Bytes;
use prost::Message;
use tokio_util::codec::LengthDelimitedCodec;

use crate::errors::NetError;

/// Upper bound on a single frame; a beacon or DKG bundle is far smaller.
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Every RPC method carried by the gateway, across all four surfaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, prost::Enumeration)]
#[repr(i32)]
pub enum RpcKind {
    Unknown = 0,

    // protocol (intra-committee)
    GetIdentity = 1,
    PartialBeacon = 2,
    SyncChain = 3,
    Status = 4,

    // public
    PublicRand = 10,
    PublicRandStream = 11,
    ChainInfo = 12,
    ListBeacons = 13,

    // dkg
    DkgPacket = 20,
    BroadcastDkg = 21,
    DkgCommand = 22,
    DkgStatus = 23,

    // control (localhost only)
    Ping = 30,
    Shutdown = 31,
    PublicKey = 32,
    GroupFile = 33,
    BackupDb = 34,
    FollowChain = 35,
    CheckChain = 36,
    LoadBeacon = 37,
    ListSchemes = 38,
}

impl RpcKind {
    /// Control verbs are only honored on the localhost listener. DKG
    /// commands are operator verbs, so they are fenced the same way.
    pub fn is_control(&self) -> bool {
        matches!(self, RpcKind::DkgCommand) || (*self as i32) >= RpcKind::Ping as i32
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, RpcKind::SyncChain | RpcKind::PublicRandStream)
    }
}

/// The multiplexing envelope. Responses reuse the request's id; streamed
/// responses end with an empty `eof` frame.
#[derive(Clone, PartialEq, Message)]
pub struct Envelope {
    #[prost(uint64, tag = "1")]
    pub request_id: u64,
    #[prost(enumeration = "RpcKind", tag = "2")]
    pub kind: i32,
    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,
    #[prost(bool, tag = "4")]
    pub eof: bool,
    /// Non-empty on a failed call; the payload is then meaningless.
    #[prost(string, tag = "5")]
    pub error: String,
}

impl Envelope {
    pub fn request(request_id: u64, kind: RpcKind, payload: Vec<u8>) -> Self {
        Envelope {
            request_id,
            kind: kind as i32,
            payload,
            eof: false,
            error: String::new(),
        }
    }

    pub fn response(request_id: u64, kind: RpcKind, payload: Vec<u8>) -> Self {
        Envelope::request(request_id, kind, payload)
    }

    pub fn stream_end(request_id: u64, kind: RpcKind) -> Self {
        Envelope {
            request_id,
            kind: kind as i32,
            payload: Vec::new(),
            eof: true,
            error: String::new(),
        }
    }

    pub fn failure(request_id: u64, kind: RpcKind, error: String) -> Self {
        Envelope {
            request_id,
            kind: kind as i32,
            payload: Vec::new(),
            eof: true,
            error,
        }
    }

    pub fn rpc_kind(&self) -> RpcKind {
        RpcKind::try_from(self.kind).unwrap_or(RpcKind::Unknown)
    }

    pub fn into_result(self) -> Result<Vec<u8>, NetError> {
        if self.error.is_empty() {
            Ok(self.payload)
        } else {
            Err(NetError::Remote(self.error))
        }
    }

    pub fn to_frame(&self) -> Bytes {
        Bytes::from(self.encode_to_vec())
    }

    pub fn from_frame(frame: &[u8]) -> Result<Self, NetError> {
        Ok(Envelope::decode(frame)?)
    }
}

/// The shared framing configuration: 4-byte big-endian length prefixes.
pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_BYTES)
        .new_codec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips() {
        let env = Envelope::request(42, RpcKind::PartialBeacon, vec![1, 2, 3]);
        let restored = Envelope::from_frame(&env.to_frame()).unwrap();
        assert_eq!(restored, env);
        assert_eq!(restored.rpc_kind(), RpcKind::PartialBeacon);
    }

    #[test]
    fn failure_carries_the_error() {
        let env = Envelope::failure(7, RpcKind::Status, "no such chain".into());
        assert_eq!(
            env.into_result(),
            Err(NetError::Remote("no such chain".into()))
        );
    }

    #[test]
    fn control_kinds_are_fenced() {
        assert!(RpcKind::Shutdown.is_control());
        assert!(RpcKind::BackupDb.is_control());
        assert!(!RpcKind::PartialBeacon.is_control());
        assert!(!RpcKind::DkgPacket.is_control());
    }
}
