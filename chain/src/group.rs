// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::time::Duration;

use lantern_crypto::{PublicKey, PublicPoly, Scheme, SchemeId, Signature};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::BeaconError;
use crate::proto::{GroupPacket, NodePacket};

/// Domain prefix for the self-signed identity binding of a node.
const IDENTITY_DOMAIN: &[u8] = b"lantern-node-identity:";

/// The smallest sound threshold for a committee of `n`: a strict majority.
#[inline]
pub fn minimum_threshold(n: usize) -> u32 {
    (n as u32) / 2 + 1
}

/// A committee member: the share index assigned for this epoch, the dialable
/// address and the long-term identity key with its self-signed binding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    pub index: u32,
    pub address: String,
    pub key: PublicKey,
    pub signature: Vec<u8>,
}

impl Node {
    /// The digest a node signs to bind its address to its key.
    pub fn identity_digest(address: &str, key: &PublicKey) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(IDENTITY_DOMAIN);
        hasher.update(address.as_bytes());
        hasher.update(key.to_bytes());
        hasher.finalize().into()
    }

    /// Check the self-signed identity binding.
    pub fn verify_identity(&self) -> Result<(), BeaconError> {
        let digest = Self::identity_digest(&self.address, &self.key);
        let sig = Signature::from_bytes(&self.signature)
            .map_err(|_| BeaconError::Malformed("identity signature".into()))?;
        self.key
            .verify(&digest, &sig)
            .map_err(|_| BeaconError::BadSignature(0))
    }
}

impl TryFrom<NodePacket> for Node {
    type Error = BeaconError;

    fn try_from(p: NodePacket) -> Result<Self, Self::Error> {
        Ok(Node {
            index: p.index,
            address: p.address,
            key: PublicKey::from_bytes(&p.key)?,
            signature: p.signature,
        })
    }
}

impl From<&Node> for NodePacket {
    fn from(n: &Node) -> Self {
        NodePacket {
            index: n.index,
            address: n.address.clone(),
            key: n.key.to_bytes().to_vec(),
            signature: n.signature.clone(),
        }
    }
}

/// The sealed output of one DKG epoch: roster, public polynomial and the
/// beacon parameters. Its hash is the chain identifier for epoch 1 and the
/// epoch identifier afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Group {
    pub beacon_id: String,
    pub scheme: SchemeId,
    pub threshold: u32,
    pub period: Duration,
    pub catchup_period: Duration,
    pub genesis_time: u64,
    pub genesis_seed: Vec<u8>,
    pub epoch: u64,
    /// Round boundary at which this group takes over from the previous one.
    pub transition_time: Option<u64>,
    pub previous_group_hash: Option<Vec<u8>>,
    pub nodes: Vec<Node>,
    pub public_poly: PublicPoly,
}

impl Group {
    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    pub fn scheme(&self) -> Scheme {
        Scheme::new(self.scheme)
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_poly.public_key()
    }

    pub fn node(&self, index: u32) -> Option<&Node> {
        self.nodes.iter().find(|n| n.index == index)
    }

    pub fn node_by_address(&self, address: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.address == address)
    }

    /// Basic structural validation: sane threshold, distinct indices, roster
    /// and polynomial sizes consistent.
    pub fn validate(&self) -> Result<(), BeaconError> {
        let n = self.size();
        if n == 0 {
            return Err(BeaconError::Malformed("empty roster".into()));
        }
        if self.threshold < minimum_threshold(n) || self.threshold as usize > n {
            return Err(BeaconError::Malformed(format!(
                "threshold {} unsound for {} nodes",
                self.threshold, n
            )));
        }
        if self.period.is_zero() {
            return Err(BeaconError::Malformed("period is zero".into()));
        }
        if self.genesis_time == 0 {
            return Err(BeaconError::Malformed("genesis time is zero".into()));
        }
        if self.public_poly.threshold() != self.threshold as usize {
            return Err(BeaconError::Malformed(
                "polynomial degree does not match threshold".into(),
            ));
        }
        for (pos, node) in self.nodes.iter().enumerate() {
            if node.index == 0 {
                return Err(BeaconError::UnknownSigner(0));
            }
            if self.nodes[..pos].iter().any(|m| m.index == node.index) {
                return Err(BeaconError::Malformed(format!(
                    "duplicate index {}",
                    node.index
                )));
            }
        }
        Ok(())
    }

    /// Hash over every field the chain identifier depends on. The genesis
    /// seed is derived from this hash at epoch 1 and is therefore excluded.
    pub fn hash(&self) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(self.beacon_id.as_bytes());
        hasher.update(self.scheme.as_str().as_bytes());
        hasher.update(self.threshold.to_be_bytes());
        hasher.update(self.period.as_secs().to_be_bytes());
        hasher.update(self.genesis_time.to_be_bytes());
        hasher.update(self.epoch.to_be_bytes());
        if let Some(tt) = self.transition_time {
            hasher.update(tt.to_be_bytes());
        }
        if let Some(prev) = &self.previous_group_hash {
            hasher.update(prev);
        }
        for node in &self.nodes {
            hasher.update(node.index.to_be_bytes());
            hasher.update(node.address.as_bytes());
            hasher.update(node.key.to_bytes());
        }
        hasher.update(self.public_poly.to_bytes());
        hasher.finalize().to_vec()
    }

    /// The genesis seed of a fresh chain: derived from the epoch-1 group
    /// hash so that distinct committees never share a seed.
    pub fn derive_genesis_seed(&self) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(b"lantern-genesis-seed:");
        hasher.update(self.hash());
        hasher.finalize().to_vec()
    }
}

impl TryFrom<GroupPacket> for Group {
    type Error = BeaconError;

    fn try_from(p: GroupPacket) -> Result<Self, Self::Error> {
        let nodes: Vec<Node> = p
            .nodes
            .into_iter()
            .map(Node::try_from)
            .collect::<Result<_, _>>()?;
        let scheme: SchemeId = p
            .scheme_id
            .parse()
            .map_err(|_| BeaconError::WrongScheme {
                expected: "registered scheme".into(),
                got: p.scheme_id.clone(),
            })?;
        let group = Group {
            beacon_id: p.beacon_id,
            scheme,
            threshold: p.threshold,
            period: Duration::from_secs(p.period_seconds),
            catchup_period: Duration::from_secs(p.catchup_period_seconds),
            genesis_time: p.genesis_time,
            genesis_seed: p.genesis_seed,
            epoch: p.epoch,
            transition_time: p.transition_time,
            previous_group_hash: p.previous_group_hash,
            nodes,
            public_poly: PublicPoly::from_bytes(&p.public_poly)?,
        };
        group.validate()?;
        Ok(group)
    }
}

impl From<&Group> for GroupPacket {
    fn from(g: &Group) -> Self {
        GroupPacket {
            beacon_id: g.beacon_id.clone(),
            scheme_id: g.scheme.as_str().to_owned(),
            threshold: g.threshold,
            period_seconds: g.period.as_secs(),
            catchup_period_seconds: g.catchup_period.as_secs(),
            genesis_time: g.genesis_time,
            genesis_seed: g.genesis_seed.clone(),
            epoch: g.epoch,
            transition_time: g.transition_time,
            previous_group_hash: g.previous_group_hash.clone(),
            nodes: g.nodes.iter().map(NodePacket::from).collect(),
            public_poly: g.public_poly.to_bytes(),
        }
    }
}

/// Text encoding of a group file as stored under `groups/`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupToml {
    pub beacon_id: String,
    pub scheme: String,
    pub threshold: u32,
    #[serde(with = "humantime_serde")]
    pub period: Duration,
    #[serde(with = "humantime_serde")]
    pub catchup_period: Duration,
    pub genesis_time: u64,
    pub genesis_seed: String,
    pub epoch: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transition_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_group_hash: Option<String>,
    pub public_poly: String,
    pub nodes: Vec<NodeToml>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeToml {
    pub index: u32,
    pub address: String,
    pub key: String,
    pub signature: String,
}

impl From<&Group> for GroupToml {
    fn from(g: &Group) -> Self {
        GroupToml {
            beacon_id: g.beacon_id.clone(),
            scheme: g.scheme.as_str().to_owned(),
            threshold: g.threshold,
            period: g.period,
            catchup_period: g.catchup_period,
            genesis_time: g.genesis_time,
            genesis_seed: hex::encode(&g.genesis_seed),
            epoch: g.epoch,
            transition_time: g.transition_time,
            previous_group_hash: g.previous_group_hash.as_ref().map(hex::encode),
            public_poly: hex::encode(g.public_poly.to_bytes()),
            nodes: g
                .nodes
                .iter()
                .map(|n| NodeToml {
                    index: n.index,
                    address: n.address.clone(),
                    key: hex::encode(n.key.to_bytes()),
                    signature: hex::encode(&n.signature),
                })
                .collect(),
        }
    }
}

impl TryFrom<GroupToml> for Group {
    type Error = BeaconError;

    fn try_from(t: GroupToml) -> Result<Self, Self::Error> {
        let decode = |s: &str| {
            hex::decode(s).map_err(|e| BeaconError::Malformed(format!("bad hex: {e}")))
        };
        let nodes = t
            .nodes
            .iter()
            .map(|n| {
                Ok(Node {
                    index: n.index,
                    address: n.address.clone(),
                    key: PublicKey::from_bytes(&decode(&n.key)?)?,
                    signature: decode(&n.signature)?,
                })
            })
            .collect::<Result<Vec<_>, BeaconError>>()?;
        let scheme: SchemeId = t.scheme.parse().map_err(|_| BeaconError::WrongScheme {
            expected: "registered scheme".into(),
            got: t.scheme.clone(),
        })?;
        let group = Group {
            beacon_id: t.beacon_id,
            scheme,
            threshold: t.threshold,
            period: t.period,
            catchup_period: t.catchup_period,
            genesis_time: t.genesis_time,
            genesis_seed: decode(&t.genesis_seed)?,
            epoch: t.epoch,
            transition_time: t.transition_time,
            previous_group_hash: t.previous_group_hash.as_deref().map(decode).transpose()?,
            public_poly: PublicPoly::from_bytes(&decode(&t.public_poly)?)?,
            nodes,
        };
        group.validate()?;
        Ok(group)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use lantern_crypto::{PrivateKey, PrivatePoly};
    use rand::rngs::OsRng;

    pub(crate) fn test_group(n: usize, threshold: u32) -> (Vec<PrivateKey>, Group) {
        let poly = PrivatePoly::random(threshold as usize, &mut OsRng);
        let keys: Vec<PrivateKey> = (0..n).map(|_| PrivateKey::generate(&mut OsRng)).collect();
        let nodes = keys
            .iter()
            .enumerate()
            .map(|(i, sk)| {
                let address = format!("127.0.0.1:{}", 9000 + i);
                let digest = Node::identity_digest(&address, &sk.public_key());
                Node {
                    index: i as u32 + 1,
                    address,
                    key: sk.public_key(),
                    signature: sk.sign(&digest).to_bytes().to_vec(),
                }
            })
            .collect();
        let mut group = Group {
            beacon_id: "default".into(),
            scheme: SchemeId::PedersenBlsChained,
            threshold,
            period: Duration::from_secs(3),
            catchup_period: Duration::from_secs(1),
            genesis_time: 1_700_000_000,
            genesis_seed: Vec::new(),
            epoch: 1,
            transition_time: None,
            previous_group_hash: None,
            nodes,
            public_poly: poly.commit(),
        };
        group.genesis_seed = group.derive_genesis_seed();
        (keys, group)
    }

    #[test]
    fn roster_lookup_and_validation() {
        let (_, group) = test_group(5, 3);
        group.validate().unwrap();
        assert_eq!(group.node(3).unwrap().index, 3);
        assert!(group.node(9).is_none());
        for node in &group.nodes {
            node.verify_identity().unwrap();
        }
    }

    #[test]
    fn unsound_threshold_is_rejected() {
        let (_, mut group) = test_group(5, 3);
        group.threshold = 2;
        assert!(group.validate().is_err());
        group.threshold = 6;
        assert!(group.validate().is_err());
    }

    #[test]
    fn hash_pins_roster_and_epoch() {
        let (_, group) = test_group(4, 3);
        let mut other = group.clone();
        assert_eq!(group.hash(), other.hash());
        other.epoch = 2;
        assert_ne!(group.hash(), other.hash());

        let mut trimmed = group.clone();
        trimmed.nodes.pop();
        assert_ne!(group.hash(), trimmed.hash());
    }

    #[test]
    fn packet_round_trip() {
        let (_, group) = test_group(4, 3);
        let packet = GroupPacket::from(&group);
        let restored = Group::try_from(packet).unwrap();
        assert_eq!(restored, group);
    }

    #[test]
    fn toml_round_trip() {
        let (_, group) = test_group(4, 3);
        let text = toml::to_string_pretty(&GroupToml::from(&group)).unwrap();
        let parsed: GroupToml = toml::from_str(&text).unwrap();
        assert_eq!(Group::try_from(parsed).unwrap(), group);
    }

    #[test]
    fn minimum_threshold_is_majority() {
        assert_eq!(minimum_threshold(3), 2);
        assert_eq!(minimum_threshold(4), 3);
        assert_eq!(minimum_threshold(5), 3);
        assert_eq!(minimum_threshold(6), 4);
    }
}
