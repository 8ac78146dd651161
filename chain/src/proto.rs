// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

//! Wire schema for every RPC surface. Field numbers are stable; removing or
//! renumbering a field is a protocol break.

use prost::Message;

#[derive(Clone, PartialEq, Message)]
pub struct BeaconPacket {
    #[prost(uint64, tag = "1")]
    pub round: u64,
    #[prost(bytes = "vec", tag = "2")]
    pub signature: Vec<u8>,
    /// Empty under unchained schemes.
    #[prost(bytes = "vec", tag = "3")]
    pub previous_signature: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PartialBeaconPacket {
    #[prost(string, tag = "1")]
    pub beacon_id: String,
    #[prost(uint64, tag = "2")]
    pub round: u64,
    #[prost(uint32, tag = "3")]
    pub index: u32,
    #[prost(bytes = "vec", tag = "4")]
    pub partial_sig: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct NodePacket {
    #[prost(uint32, tag = "1")]
    pub index: u32,
    #[prost(string, tag = "2")]
    pub address: String,
    #[prost(bytes = "vec", tag = "3")]
    pub key: Vec<u8>,
    /// Self-signed binding of `address` to `key`.
    #[prost(bytes = "vec", tag = "4")]
    pub signature: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct GroupPacket {
    #[prost(string, tag = "1")]
    pub beacon_id: String,
    #[prost(string, tag = "2")]
    pub scheme_id: String,
    #[prost(uint32, tag = "3")]
    pub threshold: u32,
    #[prost(uint64, tag = "4")]
    pub period_seconds: u64,
    #[prost(uint64, tag = "5")]
    pub catchup_period_seconds: u64,
    #[prost(uint64, tag = "6")]
    pub genesis_time: u64,
    #[prost(bytes = "vec", tag = "7")]
    pub genesis_seed: Vec<u8>,
    #[prost(uint64, tag = "8")]
    pub epoch: u64,
    #[prost(uint64, optional, tag = "9")]
    pub transition_time: Option<u64>,
    #[prost(bytes = "vec", optional, tag = "10")]
    pub previous_group_hash: Option<Vec<u8>>,
    #[prost(message, repeated, tag = "11")]
    pub nodes: Vec<NodePacket>,
    #[prost(bytes = "vec", tag = "12")]
    pub public_poly: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct IdentityPacket {
    #[prost(string, tag = "1")]
    pub address: String,
    #[prost(bytes = "vec", tag = "2")]
    pub key: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub signature: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct SyncRequest {
    #[prost(string, tag = "1")]
    pub beacon_id: String,
    #[prost(uint64, tag = "2")]
    pub from_round: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct StatusRequest {
    #[prost(string, tag = "1")]
    pub beacon_id: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct StatusResponse {
    #[prost(string, tag = "1")]
    pub beacon_id: String,
    #[prost(uint64, tag = "2")]
    pub last_round: u64,
    #[prost(uint64, tag = "3")]
    pub expected_round: u64,
    #[prost(bool, tag = "4")]
    pub catching_up: bool,
    #[prost(uint64, tag = "5")]
    pub epoch: u64,
    #[prost(string, tag = "6")]
    pub dkg_status: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct ChainInfoPacket {
    #[prost(string, tag = "1")]
    pub beacon_id: String,
    #[prost(bytes = "vec", tag = "2")]
    pub public_key: Vec<u8>,
    #[prost(uint64, tag = "3")]
    pub period_seconds: u64,
    #[prost(uint64, tag = "4")]
    pub genesis_time: u64,
    #[prost(bytes = "vec", tag = "5")]
    pub hash: Vec<u8>,
    #[prost(bytes = "vec", tag = "6")]
    pub group_hash: Vec<u8>,
    #[prost(string, tag = "7")]
    pub scheme_id: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct PublicRandRequest {
    #[prost(string, tag = "1")]
    pub beacon_id: String,
    /// 0 requests the latest finalized round.
    #[prost(uint64, tag = "2")]
    pub round: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct ListBeaconsResponse {
    #[prost(string, repeated, tag = "1")]
    pub ids: Vec<String>,
}

/// DKG gossip phases.
#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum DkgPacketKind {
    Unknown = 0,
    Proposal = 1,
    Join = 2,
    Accept = 3,
    Reject = 4,
    Execute = 5,
    Deal = 6,
    Response = 7,
    Justification = 8,
    Abort = 9,
}

#[derive(Clone, PartialEq, Message)]
pub struct DkgPacket {
    #[prost(string, tag = "1")]
    pub beacon_id: String,
    #[prost(uint64, tag = "2")]
    pub epoch: u64,
    #[prost(uint32, tag = "3")]
    pub from_index: u32,
    #[prost(enumeration = "DkgPacketKind", tag = "4")]
    pub kind: i32,
    #[prost(bytes = "vec", tag = "5")]
    pub payload: Vec<u8>,
    /// Sender's signature over `(beacon_id, epoch, kind, payload)`.
    #[prost(bytes = "vec", tag = "6")]
    pub signature: Vec<u8>,
}

/// Proposal payload for both initial DKGs and reshares. For an initial DKG
/// the `remaining`/`leaving` sets are empty and `epoch` is 1.
#[derive(Clone, PartialEq, Message)]
pub struct ProposalPacket {
    #[prost(string, tag = "1")]
    pub beacon_id: String,
    #[prost(uint64, tag = "2")]
    pub epoch: u64,
    #[prost(uint32, tag = "3")]
    pub threshold: u32,
    #[prost(string, tag = "4")]
    pub scheme_id: String,
    #[prost(uint64, tag = "5")]
    pub period_seconds: u64,
    #[prost(uint64, tag = "6")]
    pub catchup_period_seconds: u64,
    #[prost(uint64, tag = "7")]
    pub genesis_time: u64,
    #[prost(uint64, optional, tag = "8")]
    pub transition_time: Option<u64>,
    #[prost(uint32, tag = "9")]
    pub leader_index: u32,
    #[prost(message, repeated, tag = "10")]
    pub joining: Vec<NodePacket>,
    #[prost(message, repeated, tag = "11")]
    pub remaining: Vec<NodePacket>,
    #[prost(message, repeated, tag = "12")]
    pub leaving: Vec<NodePacket>,
    #[prost(bytes = "vec", optional, tag = "13")]
    pub previous_group_hash: Option<Vec<u8>>,
}

/// A single encrypted share addressed to one participant.
#[derive(Clone, PartialEq, Message)]
pub struct DealEntry {
    #[prost(uint32, tag = "1")]
    pub recipient_index: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub ephemeral: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub nonce: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub sealed: Vec<u8>,
}

/// One dealer's bundle: commitment polynomial plus an encrypted share per
/// recipient.
#[derive(Clone, PartialEq, Message)]
pub struct DealBundle {
    #[prost(uint32, tag = "1")]
    pub dealer_index: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub commitment: Vec<u8>,
    #[prost(message, repeated, tag = "3")]
    pub deals: Vec<DealEntry>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ResponseBundle {
    #[prost(uint32, tag = "1")]
    pub from_index: u32,
    /// Dealer indices whose deal failed verification for the sender.
    #[prost(uint32, repeated, tag = "2")]
    pub complaints: Vec<u32>,
}

/// Revealed cleartext share answering a complaint.
#[derive(Clone, PartialEq, Message)]
pub struct JustificationBundle {
    #[prost(uint32, tag = "1")]
    pub dealer_index: u32,
    #[prost(uint32, tag = "2")]
    pub recipient_index: u32,
    #[prost(bytes = "vec", tag = "3")]
    pub share: Vec<u8>,
}

/// Operator verbs carried over the localhost control surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum DkgVerb {
    UnknownVerb = 0,
    Propose = 1,
    JoinCeremony = 2,
    AcceptProposal = 3,
    RejectProposal = 4,
    ExecuteCeremony = 5,
    AbortCeremony = 6,
    CeremonyStatus = 7,
}

#[derive(Clone, PartialEq, Message)]
pub struct DkgCommandPacket {
    #[prost(string, tag = "1")]
    pub beacon_id: String,
    #[prost(enumeration = "DkgVerb", tag = "2")]
    pub verb: i32,
    #[prost(message, optional, tag = "3")]
    pub proposal: Option<ProposalPacket>,
}

#[derive(Clone, PartialEq, Message)]
pub struct BackupRequest {
    #[prost(string, tag = "1")]
    pub beacon_id: String,
    #[prost(string, tag = "2")]
    pub path: String,
}

/// Used by both `follow-chain` and `check-chain`. `up_to` of zero means
/// "as far as the peers go".
#[derive(Clone, PartialEq, Message)]
pub struct FollowRequest {
    #[prost(string, tag = "1")]
    pub beacon_id: String,
    #[prost(string, repeated, tag = "2")]
    pub peers: Vec<String>,
    #[prost(uint64, tag = "3")]
    pub up_to: u64,
}

pub fn encode<M: Message>(message: &M) -> Vec<u8> {
    message.encode_to_vec()
}

pub fn decode<M: Message + Default>(bytes: &[u8]) -> Result<M, prost::DecodeError> {
    M::decode(bytes)
}
