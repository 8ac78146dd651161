// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

use serde::{Deserialize, Serialize};

use crate::group::Group;
use crate::proto::ChainInfoPacket;

/// Public chain metadata, served as JSON on `/{chain}/info` and as a packet
/// on the gateway. `hash` is the chain identifier (the epoch-1 group hash);
/// `group_hash` identifies the currently active epoch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainInfo {
    pub public_key: String,
    pub period: u64,
    pub genesis_time: u64,
    pub hash: String,
    #[serde(rename = "groupHash")]
    pub group_hash: String,
    #[serde(rename = "schemeID")]
    pub scheme_id: String,
}

impl ChainInfo {
    /// Build the public view of a group. `chain_hash` is the epoch-1 group
    /// hash; for a first-epoch group it equals the group's own hash.
    pub fn from_group(group: &Group, chain_hash: &[u8]) -> Self {
        ChainInfo {
            public_key: hex::encode(group.public_key().to_bytes()),
            period: group.period.as_secs(),
            genesis_time: group.genesis_time,
            hash: hex::encode(chain_hash),
            group_hash: hex::encode(group.hash()),
            scheme_id: group.scheme.as_str().to_owned(),
        }
    }
}

impl From<&ChainInfo> for ChainInfoPacket {
    fn from(info: &ChainInfo) -> Self {
        ChainInfoPacket {
            beacon_id: String::new(),
            public_key: hex::decode(&info.public_key).unwrap_or_default(),
            period_seconds: info.period,
            genesis_time: info.genesis_time,
            hash: hex::decode(&info.hash).unwrap_or_default(),
            group_hash: hex::decode(&info.group_hash).unwrap_or_default(),
            scheme_id: info.scheme_id.clone(),
        }
    }
}

impl From<ChainInfoPacket> for ChainInfo {
    fn from(p: ChainInfoPacket) -> Self {
        ChainInfo {
            public_key: hex::encode(p.public_key),
            period: p.period_seconds,
            genesis_time: p.genesis_time,
            hash: hex::encode(p.hash),
            group_hash: hex::encode(p.group_hash),
            scheme_id: p.scheme_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::tests::test_group;

    #[test]
    fn json_field_names_are_stable() {
        let (_, group) = test_group(4, 3);
        let info = ChainInfo::from_group(&group, &group.hash());
        let json = serde_json::to_value(&info).unwrap();
        for field in [
            "public_key",
            "period",
            "genesis_time",
            "hash",
            "groupHash",
            "schemeID",
        ] {
            assert!(json.get(field).is_some(), "missing field {field}");
        }
        assert_eq!(json["period"], 3);
        assert_eq!(json["hash"], json["groupHash"]);
    }

    #[test]
    fn packet_round_trip() {
        let (_, group) = test_group(4, 3);
        let info = ChainInfo::from_group(&group, &group.hash());
        let packet = ChainInfoPacket::from(&info);
        assert_eq!(ChainInfo::from(packet), info);
    }
}
