// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::time::Duration;

use lantern_chain::proto::{NodePacket, ProposalPacket};
use lantern_chain::{minimum_threshold, Node};
use lantern_crypto::SchemeId;

use crate::errors::DkgError;

/// A node's part in a ceremony.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Entering the committee this epoch; receives a share.
    Joiner,
    /// Holds a previous-epoch share and deals a re-randomization of it.
    Remainer,
    /// Exiting; its absence must not block the ceremony.
    Leaver,
}

/// A validated ceremony proposal. For an initial DKG every participant is a
/// joiner and `epoch` is 1.
#[derive(Clone, Debug, PartialEq)]
pub struct Proposal {
    pub beacon_id: String,
    pub epoch: u64,
    pub threshold: u32,
    pub scheme: SchemeId,
    pub period: Duration,
    pub catchup_period: Duration,
    pub genesis_time: u64,
    pub transition_time: Option<u64>,
    pub leader_index: u32,
    pub joining: Vec<Node>,
    pub remaining: Vec<Node>,
    pub leaving: Vec<Node>,
    pub previous_group_hash: Option<Vec<u8>>,
}

impl Proposal {
    pub fn is_reshare(&self) -> bool {
        self.epoch > 1
    }

    /// The next epoch's committee: joiners plus remainers, ordered by index.
    pub fn committee(&self) -> Vec<&Node> {
        let mut nodes: Vec<&Node> = self.joining.iter().chain(self.remaining.iter()).collect();
        nodes.sort_by_key(|n| n.index);
        nodes
    }

    /// Everyone who takes part in the ceremony, leavers included.
    pub fn participants(&self) -> Vec<&Node> {
        let mut nodes: Vec<&Node> = self
            .joining
            .iter()
            .chain(self.remaining.iter())
            .chain(self.leaving.iter())
            .collect();
        nodes.sort_by_key(|n| n.index);
        nodes
    }

    /// Members whose acceptance gates execution; a leaver's silence never
    /// blocks the ceremony.
    pub fn acceptors(&self) -> Vec<&Node> {
        self.committee()
    }

    /// The dealers of this ceremony: every joiner for an initial DKG, the
    /// remainers for a reshare.
    pub fn dealers(&self) -> Vec<&Node> {
        if self.is_reshare() {
            self.remaining.iter().collect()
        } else {
            self.joining.iter().collect()
        }
    }

    pub fn node(&self, index: u32) -> Option<&Node> {
        self.participants().into_iter().find(|n| n.index == index)
    }

    pub fn role_of(&self, address: &str) -> Option<Role> {
        if self.joining.iter().any(|n| n.address == address) {
            Some(Role::Joiner)
        } else if self.remaining.iter().any(|n| n.address == address) {
            Some(Role::Remainer)
        } else if self.leaving.iter().any(|n| n.address == address) {
            Some(Role::Leaver)
        } else {
            None
        }
    }

    pub fn leader(&self) -> Option<&Node> {
        self.node(self.leader_index)
    }

    pub fn validate(&self) -> Result<(), DkgError> {
        let committee = self.committee();
        let n = committee.len();
        if n == 0 {
            return Err(DkgError::InvalidProposal("empty committee".into()));
        }
        if self.threshold < minimum_threshold(n) || self.threshold as usize > n {
            return Err(DkgError::InvalidProposal(format!(
                "threshold {} unsound for {} nodes",
                self.threshold, n
            )));
        }
        if self.period.is_zero() {
            return Err(DkgError::InvalidProposal("zero period".into()));
        }
        if self.epoch == 0 {
            return Err(DkgError::InvalidProposal("epoch zero".into()));
        }
        if self.is_reshare() {
            if self.remaining.is_empty() {
                return Err(DkgError::InvalidProposal(
                    "reshare without remaining nodes".into(),
                ));
            }
            if self.previous_group_hash.is_none() {
                return Err(DkgError::InvalidProposal(
                    "reshare must link the previous group".into(),
                ));
            }
        } else if !self.remaining.is_empty() || !self.leaving.is_empty() {
            return Err(DkgError::InvalidProposal(
                "initial ceremony only has joiners".into(),
            ));
        }
        // indices must be distinct across every participant
        let participants = self.participants();
        for (pos, node) in participants.iter().enumerate() {
            if node.index == 0 {
                return Err(DkgError::InvalidProposal("zero index".into()));
            }
            if participants[..pos].iter().any(|m| m.index == node.index) {
                return Err(DkgError::InvalidProposal(format!(
                    "duplicate index {}",
                    node.index
                )));
            }
        }
        if self.leader().is_none() {
            return Err(DkgError::InvalidProposal(
                "leader is not a participant".into(),
            ));
        }
        for node in &participants {
            node.verify_identity()
                .map_err(|_| DkgError::InvalidProposal(format!(
                    "bad identity signature for index {}",
                    node.index
                )))?;
        }
        Ok(())
    }
}

impl TryFrom<ProposalPacket> for Proposal {
    type Error = DkgError;

    fn try_from(p: ProposalPacket) -> Result<Self, Self::Error> {
        let convert = |nodes: Vec<NodePacket>| -> Result<Vec<Node>, DkgError> {
            nodes
                .into_iter()
                .map(|n| Node::try_from(n).map_err(|e| DkgError::Malformed(e.to_string())))
                .collect()
        };
        let scheme: SchemeId = p
            .scheme_id
            .parse()
            .map_err(|_| DkgError::InvalidProposal(format!("unknown scheme {}", p.scheme_id)))?;
        let proposal = Proposal {
            beacon_id: p.beacon_id,
            epoch: p.epoch,
            threshold: p.threshold,
            scheme,
            period: Duration::from_secs(p.period_seconds),
            catchup_period: Duration::from_secs(p.catchup_period_seconds),
            genesis_time: p.genesis_time,
            transition_time: p.transition_time,
            leader_index: p.leader_index,
            joining: convert(p.joining)?,
            remaining: convert(p.remaining)?,
            leaving: convert(p.leaving)?,
            previous_group_hash: p.previous_group_hash,
        };
        proposal.validate()?;
        Ok(proposal)
    }
}

impl From<&Proposal> for ProposalPacket {
    fn from(p: &Proposal) -> Self {
        ProposalPacket {
            beacon_id: p.beacon_id.clone(),
            epoch: p.epoch,
            threshold: p.threshold,
            scheme_id: p.scheme.as_str().to_owned(),
            period_seconds: p.period.as_secs(),
            catchup_period_seconds: p.catchup_period.as_secs(),
            genesis_time: p.genesis_time,
            transition_time: p.transition_time,
            leader_index: p.leader_index,
            joining: p.joining.iter().map(NodePacket::from).collect(),
            remaining: p.remaining.iter().map(NodePacket::from).collect(),
            leaving: p.leaving.iter().map(NodePacket::from).collect(),
            previous_group_hash: p.previous_group_hash.clone(),
        }
    }
}
