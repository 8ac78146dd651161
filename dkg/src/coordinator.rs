// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

//! The ceremony coordinator. One lives per beacon-id; it is an explicit
//! state struct advanced by operator verbs and incoming gossip packets, so
//! its progress can be inspected at any time and resumed across restarts.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use blstrs::Scalar;
use lantern_chain::proto::{
    self, DealBundle, DkgPacket, DkgPacketKind, JustificationBundle, ProposalPacket,
    ResponseBundle,
};
use lantern_chain::Group;
use lantern_crypto::{PrivateKey, PublicKey, PublicPoly, Share};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::DkgError;
use crate::phases::{self, DealFault, Dealing};
use crate::proposal::{Proposal, Role};
use crate::status::DkgStatus;

/// How ceremony packets leave the node; implemented over the gateway's DKG
/// surface by the daemon and by an in-process bus in tests.
#[async_trait]
pub trait DkgTransport: Send + Sync {
    async fn gossip(&self, peers: &[String], packet: DkgPacket);
}

#[derive(Clone)]
pub struct CoordinatorConfig {
    pub beacon_id: String,
    pub address: String,
    pub identity_key: Arc<PrivateKey>,
    /// Deadline applied to each phase of the ceremony.
    pub phase_timeout: Duration,
    /// Sign `Join`/`Accept` automatically on a valid proposal instead of
    /// waiting for the operator verbs.
    pub auto_accept: bool,
}

/// What a completed ceremony hands to the daemon.
pub struct DkgOutput {
    pub group: Arc<Group>,
    /// `None` when this node is not part of the new committee.
    pub share: Option<Share>,
}

/// The previous epoch as context for reshare validation and anchoring.
pub struct PreviousEpoch {
    pub group: Arc<Group>,
    pub share: Option<Share>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ExecPhase {
    Dealing,
    Responding,
    Justifying,
}

#[derive(Default)]
struct Ceremony {
    epoch: u64,
    status: DkgStatus,
    phase: Option<ExecPhase>,
    proposal: Option<Proposal>,
    my_index: Option<u32>,
    role: Option<Role>,
    is_leader: bool,
    joined: BTreeSet<u32>,
    accepts: BTreeSet<u32>,
    rejects: BTreeSet<u32>,
    my_dealing: Option<Dealing>,
    deals: BTreeMap<u32, DealBundle>,
    /// dealer -> (commitment, my decrypted share)
    processed: BTreeMap<u32, (PublicPoly, Scalar)>,
    /// dealers whose deal drew a local complaint
    my_faults: BTreeMap<u32, DealFault>,
    /// dealer -> complaining recipients, from everyone's responses
    complaints: BTreeMap<u32, BTreeSet<u32>>,
    responded: BTreeSet<u32>,
    /// dealer -> justified recipients
    justified: BTreeMap<u32, BTreeSet<u32>>,
    evicted: BTreeSet<u32>,
    error: Option<String>,
}

struct Effects {
    gossip: Vec<DkgPacket>,
    output: Option<DkgOutput>,
    deadline: Option<Option<Instant>>,
}

impl Effects {
    fn none() -> Self {
        Effects {
            gossip: Vec::new(),
            output: None,
            deadline: None,
        }
    }

    fn with_gossip(packet: DkgPacket) -> Self {
        Effects {
            gossip: vec![packet],
            output: None,
            deadline: None,
        }
    }

    /// Later effects win the deadline and output slots.
    fn merge(mut self, later: Effects) -> Effects {
        self.gossip.extend(later.gossip);
        if later.output.is_some() {
            self.output = later.output;
        }
        if later.deadline.is_some() {
            self.deadline = later.deadline;
        }
        self
    }
}

pub struct Coordinator {
    config: CoordinatorConfig,
    transport: Arc<dyn DkgTransport>,
    previous: Mutex<Option<PreviousEpoch>>,
    state: Mutex<Ceremony>,
    status_tx: watch::Sender<DkgStatus>,
    deadline_tx: watch::Sender<Option<Instant>>,
    completions_tx: flume::Sender<DkgOutput>,
    completions_rx: flume::Receiver<DkgOutput>,
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        transport: Arc<dyn DkgTransport>,
        previous: Option<PreviousEpoch>,
    ) -> Arc<Self> {
        let (status_tx, _) = watch::channel(DkgStatus::Fresh);
        let (deadline_tx, _) = watch::channel(None);
        let (completions_tx, completions_rx) = flume::unbounded();
        Arc::new(Coordinator {
            config,
            transport,
            previous: Mutex::new(previous),
            state: Mutex::new(Ceremony::default()),
            status_tx,
            deadline_tx,
            completions_tx,
            completions_rx,
        })
    }

    pub fn status(&self) -> DkgStatus {
        self.state.lock().status
    }

    pub fn status_watch(&self) -> watch::Receiver<DkgStatus> {
        self.status_tx.subscribe()
    }

    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    /// Completed ceremonies, in order, for the daemon to persist and stage.
    pub fn completions(&self) -> flume::Receiver<DkgOutput> {
        self.completions_rx.clone()
    }

    /// Make the next epoch's context available after a completed ceremony
    /// has been installed.
    pub fn set_previous(&self, previous: PreviousEpoch) {
        *self.previous.lock() = Some(previous);
    }

    // --- operator verbs -------------------------------------------------

    /// Leader: start a ceremony. Submitting the identical proposal while it
    /// is in flight is a no-op.
    pub async fn propose(&self, proposal: Proposal) -> Result<(), DkgError> {
        let effects = {
            let mut state = self.state.lock();
            if state.status == DkgStatus::Proposed
                || state.status == DkgStatus::Accepted
                || state.status == DkgStatus::Executing
            {
                // idempotent re-submission of the same proposal
                if state.proposal.as_ref() == Some(&proposal) {
                    return Ok(());
                }
                return Err(DkgError::InvalidProposal(
                    "another ceremony is in flight".into(),
                ));
            }
            // a completed ceremony only blocks its own re-submission; the
            // next epoch's proposal starts a fresh one
            if state.status == DkgStatus::Complete && state.proposal.as_ref() == Some(&proposal) {
                return Err(DkgError::AlreadyComplete);
            }
            proposal.validate()?;
            self.validate_against_previous(&proposal)?;

            let me = proposal.role_of(&self.config.address);
            if proposal
                .leader()
                .map(|l| l.address != self.config.address)
                .unwrap_or(true)
            {
                return Err(DkgError::InvalidProposal(
                    "only the proposal's leader may submit it".into(),
                ));
            }

            let packet = self.signed_packet(
                proposal.epoch,
                proposal.leader_index,
                DkgPacketKind::Proposal,
                proto::encode(&ProposalPacket::from(&proposal)),
            );

            self.begin_proposed(&mut state, proposal, me);
            let my_index = state.my_index.unwrap_or(0);
            state.accepts.insert(my_index);
            let mut effects = Effects::with_gossip(packet);
            effects.deadline = Some(Some(Instant::now() + self.config.phase_timeout));
            effects
        };
        self.apply(effects).await;
        Ok(())
    }

    /// Participant: signal intent to join the proposed committee.
    pub async fn join(&self) -> Result<(), DkgError> {
        self.participant_signal(DkgPacketKind::Join).await
    }

    /// Participant: accept the in-flight proposal.
    pub async fn accept(&self) -> Result<(), DkgError> {
        self.participant_signal(DkgPacketKind::Accept).await
    }

    /// Participant: reject the in-flight proposal.
    pub async fn reject(&self) -> Result<(), DkgError> {
        self.participant_signal(DkgPacketKind::Reject).await
    }

    /// Leader: move an accepted ceremony into execution.
    pub async fn execute(&self) -> Result<(), DkgError> {
        let effects = {
            let mut state = self.state.lock();
            if !state.is_leader {
                return Err(DkgError::InvalidProposal("not the leader".into()));
            }
            match state.status {
                DkgStatus::Proposed | DkgStatus::Accepted => {}
                DkgStatus::Fresh => return Err(DkgError::NotStarted),
                _ => return Err(DkgError::InvalidProposal("not executable".into())),
            }
            let proposal = state.proposal.clone().ok_or(DkgError::NotStarted)?;
            let quorum = proposal.threshold as usize;
            if state.accepts.len() < quorum {
                return Err(DkgError::InvalidProposal(format!(
                    "{} accepts, need at least {}",
                    state.accepts.len(),
                    quorum
                )));
            }
            let packet = self.signed_packet(
                state.epoch,
                state.my_index.unwrap_or(proposal.leader_index),
                DkgPacketKind::Execute,
                Vec::new(),
            );
            let mut effects = self.begin_execution(&mut state)?;
            effects.gossip.insert(0, packet);
            effects
        };
        self.apply(effects).await;
        Ok(())
    }

    /// Operator: abandon the ceremony unconditionally.
    pub async fn abort(&self) -> Result<(), DkgError> {
        let effects = {
            let mut state = self.state.lock();
            if state.status.is_terminal() || state.status == DkgStatus::Fresh {
                return Err(DkgError::NotStarted);
            }
            let packet = self.signed_packet(
                state.epoch,
                state.my_index.unwrap_or(0),
                DkgPacketKind::Abort,
                Vec::new(),
            );
            self.set_status(&mut state, DkgStatus::Aborted);
            state.error = Some("aborted by operator".into());
            let mut effects = Effects::with_gossip(packet);
            effects.deadline = Some(None);
            effects
        };
        self.apply(effects).await;
        Ok(())
    }

    // --- packet handling ------------------------------------------------

    /// Entry point for ceremony gossip from the gateway. `rebroadcast`
    /// re-gossips valid packets to the rest of the committee.
    pub async fn handle_packet(
        &self,
        packet: DkgPacket,
        rebroadcast: bool,
    ) -> Result<(), DkgError> {
        if packet.beacon_id != self.config.beacon_id {
            return Err(DkgError::Malformed("wrong beacon id".into()));
        }
        let kind = DkgPacketKind::try_from(packet.kind)
            .map_err(|_| DkgError::Malformed("unknown packet kind".into()))?;

        let mut effects = {
            let mut state = self.state.lock();
            self.handle_packet_locked(&mut state, &packet, kind)?
        };
        if rebroadcast {
            effects.gossip.insert(0, packet);
        }
        self.apply(effects).await;
        Ok(())
    }

    fn handle_packet_locked(
        &self,
        state: &mut Ceremony,
        packet: &DkgPacket,
        kind: DkgPacketKind,
    ) -> Result<Effects, DkgError> {
        // epoch fencing: the proposal itself establishes the epoch
        if kind != DkgPacketKind::Proposal {
            if state.status == DkgStatus::Fresh || state.status.is_terminal() {
                return Err(DkgError::NotStarted);
            }
            if packet.epoch != state.epoch {
                return Err(DkgError::WrongEpoch {
                    got: packet.epoch,
                    expected: state.epoch,
                });
            }
            self.verify_packet_signature(state, packet)?;
        }

        match kind {
            DkgPacketKind::Proposal => self.on_proposal(state, packet),
            DkgPacketKind::Join => {
                state.joined.insert(packet.from_index);
                Ok(Effects::none())
            }
            DkgPacketKind::Accept => self.on_accept(state, packet.from_index),
            DkgPacketKind::Reject => {
                state.rejects.insert(packet.from_index);
                Ok(Effects::none())
            }
            DkgPacketKind::Execute => self.on_execute(state, packet),
            DkgPacketKind::Deal => self.on_deal(state, packet),
            DkgPacketKind::Response => self.on_response(state, packet),
            DkgPacketKind::Justification => self.on_justification(state, packet),
            DkgPacketKind::Abort => {
                self.set_status(state, DkgStatus::Aborted);
                state.error = Some(format!("aborted by index {}", packet.from_index));
                let mut effects = Effects::none();
                effects.deadline = Some(None);
                Ok(effects)
            }
            DkgPacketKind::Unknown => Err(DkgError::Malformed("unknown packet kind".into())),
        }
    }

    fn on_proposal(&self, state: &mut Ceremony, packet: &DkgPacket) -> Result<Effects, DkgError> {
        let proposal = Proposal::try_from(proto::decode::<ProposalPacket>(&packet.payload)?)?;
        if proposal.beacon_id != self.config.beacon_id {
            return Err(DkgError::Malformed("wrong beacon id".into()));
        }
        match state.status {
            DkgStatus::Fresh | DkgStatus::TimedOut | DkgStatus::Aborted | DkgStatus::Failed
            | DkgStatus::Evicted => {}
            // a finished or in-flight ceremony ignores its own duplicate
            // proposal; Complete additionally admits the next epoch's
            _ => {
                if state.proposal.as_ref() == Some(&proposal) {
                    return Ok(Effects::none());
                }
                if state.status != DkgStatus::Complete {
                    return Err(DkgError::InvalidProposal(
                        "another ceremony is in flight".into(),
                    ));
                }
            }
        }
        self.validate_against_previous(&proposal)?;

        // the proposal is signed by its leader
        let leader = proposal
            .leader()
            .ok_or_else(|| DkgError::InvalidProposal("no leader".into()))?;
        self.verify_signature_with(&leader.key.clone(), packet)?;

        let role = proposal.role_of(&self.config.address);
        if role.is_none() {
            debug!(beacon_id = %self.config.beacon_id, "proposal does not involve this node");
            return Err(DkgError::InvalidProposal("node not in proposal".into()));
        }

        info!(
            beacon_id = %self.config.beacon_id,
            epoch = proposal.epoch,
            reshare = proposal.is_reshare(),
            role = ?role,
            "ceremony proposed"
        );
        self.begin_proposed(state, proposal, role);

        let mut effects = Effects::none();
        effects.deadline = Some(Some(Instant::now() + self.config.phase_timeout));
        if self.config.auto_accept && role != Some(Role::Leaver) {
            let index = state.my_index.unwrap_or(0);
            if matches!(role, Some(Role::Joiner)) {
                effects.gossip.push(self.signed_packet(
                    state.epoch,
                    index,
                    DkgPacketKind::Join,
                    Vec::new(),
                ));
            }
            state.accepts.insert(index);
            effects.gossip.push(self.signed_packet(
                state.epoch,
                index,
                DkgPacketKind::Accept,
                Vec::new(),
            ));
        }
        Ok(effects)
    }

    fn on_accept(&self, state: &mut Ceremony, from: u32) -> Result<Effects, DkgError> {
        state.accepts.insert(from);
        let proposal = state.proposal.as_ref().ok_or(DkgError::NotStarted)?;
        let all_accepted = proposal
            .acceptors()
            .iter()
            .all(|n| state.accepts.contains(&n.index));
        if all_accepted && state.status == DkgStatus::Proposed {
            self.set_status(state, DkgStatus::Accepted);
            // the leader drives execution as soon as everyone is in
            if state.is_leader {
                let packet = self.signed_packet(
                    state.epoch,
                    state.my_index.unwrap_or(0),
                    DkgPacketKind::Execute,
                    Vec::new(),
                );
                let mut effects = self.begin_execution(state)?;
                effects.gossip.insert(0, packet);
                return Ok(effects);
            }
        }
        Ok(Effects::none())
    }

    fn on_execute(&self, state: &mut Ceremony, packet: &DkgPacket) -> Result<Effects, DkgError> {
        let proposal = state.proposal.as_ref().ok_or(DkgError::NotStarted)?;
        if packet.from_index != proposal.leader_index {
            return Err(DkgError::Malformed("execute not from leader".into()));
        }
        match state.status {
            DkgStatus::Proposed | DkgStatus::Accepted => self.begin_execution(state),
            DkgStatus::Executing => Ok(Effects::none()),
            _ => Err(DkgError::NotStarted),
        }
    }

    fn on_deal(&self, state: &mut Ceremony, packet: &DkgPacket) -> Result<Effects, DkgError> {
        // a deal can outrun the leader's execute gossip; fast-forward
        let mut effects = Effects::none();
        if matches!(state.status, DkgStatus::Proposed | DkgStatus::Accepted) {
            effects = self.begin_execution(state)?;
        }
        if state.status != DkgStatus::Executing {
            return Err(DkgError::NotStarted);
        }
        let bundle: DealBundle = proto::decode(&packet.payload)?;
        if bundle.dealer_index != packet.from_index {
            return Err(DkgError::Malformed("deal dealer/sender mismatch".into()));
        }
        let proposal = state.proposal.as_ref().ok_or(DkgError::NotStarted)?;
        if !proposal.dealers().iter().any(|d| d.index == bundle.dealer_index) {
            return Err(DkgError::UnknownParticipant(bundle.dealer_index));
        }
        if state.deals.contains_key(&bundle.dealer_index) {
            return Ok(effects);
        }
        state.deals.insert(bundle.dealer_index, bundle.clone());

        // members of the next committee verify and decrypt their share
        if let Some(my_index) = state.my_index {
            let threshold = proposal.threshold as usize;
            let anchor = self.reshare_anchor(proposal, bundle.dealer_index);
            match phases::process_deal(
                &bundle,
                my_index,
                &self.config.identity_key,
                threshold,
                anchor.as_ref(),
            ) {
                Ok((commitment, share)) => {
                    state.processed.insert(bundle.dealer_index, (commitment, share));
                }
                Err(fault) => {
                    warn!(
                        beacon_id = %self.config.beacon_id,
                        dealer = bundle.dealer_index,
                        ?fault,
                        "deal failed verification; complaining"
                    );
                    state.my_faults.insert(bundle.dealer_index, fault);
                }
            }
        }

        Ok(effects.merge(self.maybe_finish_dealing(state)?))
    }

    fn on_response(&self, state: &mut Ceremony, packet: &DkgPacket) -> Result<Effects, DkgError> {
        if state.status != DkgStatus::Executing {
            return Err(DkgError::NotStarted);
        }
        let response: ResponseBundle = proto::decode(&packet.payload)?;
        if response.from_index != packet.from_index {
            return Err(DkgError::Malformed("response sender mismatch".into()));
        }
        state.responded.insert(response.from_index);
        for dealer in &response.complaints {
            state
                .complaints
                .entry(*dealer)
                .or_default()
                .insert(response.from_index);
        }
        self.maybe_finish_responding(state)
    }

    fn on_justification(
        &self,
        state: &mut Ceremony,
        packet: &DkgPacket,
    ) -> Result<Effects, DkgError> {
        if state.status != DkgStatus::Executing {
            return Err(DkgError::NotStarted);
        }
        let justification: JustificationBundle = proto::decode(&packet.payload)?;
        if justification.dealer_index != packet.from_index {
            return Err(DkgError::Malformed("justification sender mismatch".into()));
        }
        let commitment = match state.deals.get(&justification.dealer_index) {
            Some(deal) => PublicPoly::from_bytes(&deal.commitment)
                .map_err(|_| DkgError::BadDeal(justification.dealer_index))?,
            None => return Err(DkgError::BadDeal(justification.dealer_index)),
        };
        match phases::verify_justification(&justification, &commitment) {
            Ok(scalar) => {
                state
                    .justified
                    .entry(justification.dealer_index)
                    .or_default()
                    .insert(justification.recipient_index);
                // a justification answering our own complaint hands us the
                // share in the clear
                if Some(justification.recipient_index) == state.my_index {
                    state.my_faults.remove(&justification.dealer_index);
                    state
                        .processed
                        .insert(justification.dealer_index, (commitment, scalar));
                }
            }
            Err(e) => {
                warn!(
                    beacon_id = %self.config.beacon_id,
                    dealer = justification.dealer_index,
                    error = %e,
                    "justification failed; dealer will be evicted"
                );
            }
        }
        self.maybe_finish_justifying(state)
    }

    // --- phase progression ----------------------------------------------

    fn begin_proposed(&self, state: &mut Ceremony, proposal: Proposal, role: Option<Role>) {
        let my_index = proposal
            .committee()
            .iter()
            .find(|n| n.address == self.config.address)
            .map(|n| n.index);
        let is_leader = proposal
            .leader()
            .map(|l| l.address == self.config.address)
            .unwrap_or(false);
        *state = Ceremony {
            epoch: proposal.epoch,
            status: DkgStatus::Fresh,
            my_index,
            role,
            is_leader,
            proposal: Some(proposal),
            ..Ceremony::default()
        };
        self.set_status(state, DkgStatus::Proposed);
    }

    fn begin_execution(&self, state: &mut Ceremony) -> Result<Effects, DkgError> {
        let proposal = state.proposal.clone().ok_or(DkgError::NotStarted)?;
        self.set_status(state, DkgStatus::Executing);
        state.phase = Some(ExecPhase::Dealing);

        let mut effects = Effects::none();
        effects.deadline = Some(Some(Instant::now() + self.config.phase_timeout));

        // dealers create and gossip their bundle
        let i_deal = match state.role {
            Some(Role::Joiner) => !proposal.is_reshare(),
            Some(Role::Remainer) => true,
            _ => false,
        };
        if i_deal {
            let dealer_index = state.my_index.ok_or(DkgError::NotStarted)?;
            let recipients: Vec<(u32, PublicKey)> = proposal
                .committee()
                .iter()
                .map(|n| (n.index, n.key))
                .collect();
            let reshare_secret = if proposal.is_reshare() {
                let previous = self.previous.lock();
                let share = previous
                    .as_ref()
                    .and_then(|p| p.share.as_ref())
                    .ok_or_else(|| DkgError::Failed("remainer without a share".into()))?;
                Some(*share.secret_ref())
            } else {
                None
            };
            let dealing = phases::create_deals(
                dealer_index,
                reshare_secret.as_ref(),
                proposal.threshold as usize,
                &recipients,
                &mut OsRng,
            )?;
            let payload = proto::encode(&dealing.bundle);
            state.deals.insert(dealer_index, dealing.bundle.clone());
            if let Some(my_index) = state.my_index {
                let anchor = self.reshare_anchor(&proposal, dealer_index);
                if let Ok((commitment, share)) = phases::process_deal(
                    &dealing.bundle,
                    my_index,
                    &self.config.identity_key,
                    proposal.threshold as usize,
                    anchor.as_ref(),
                ) {
                    state.processed.insert(dealer_index, (commitment, share));
                }
            }
            state.my_dealing = Some(dealing);
            effects.gossip.push(self.signed_packet(
                state.epoch,
                dealer_index,
                DkgPacketKind::Deal,
                payload,
            ));
        }
        Ok(effects)
    }

    /// Once every dealer's bundle is in (or the deadline forces it), publish
    /// our response listing complaints.
    fn maybe_finish_dealing(&self, state: &mut Ceremony) -> Result<Effects, DkgError> {
        if state.phase != Some(ExecPhase::Dealing) {
            return Ok(Effects::none());
        }
        let proposal = state.proposal.as_ref().ok_or(DkgError::NotStarted)?;
        let dealers: Vec<u32> = proposal.dealers().iter().map(|d| d.index).collect();
        if !dealers.iter().all(|d| state.deals.contains_key(d)) {
            return Ok(Effects::none());
        }
        self.publish_response(state)
    }

    fn publish_response(&self, state: &mut Ceremony) -> Result<Effects, DkgError> {
        let proposal = state.proposal.as_ref().ok_or(DkgError::NotStarted)?;
        state.phase = Some(ExecPhase::Responding);

        let mut effects = Effects::none();
        effects.deadline = Some(Some(Instant::now() + self.config.phase_timeout));

        // non-committee participants (leavers) observe without responding
        let my_index = match state.my_index {
            Some(index) => index,
            None => return Ok(effects),
        };

        // a dealer that never delivered is complained about as well
        let mut complaints: BTreeSet<u32> = state.my_faults.keys().copied().collect();
        for dealer in proposal.dealers() {
            if !state.deals.contains_key(&dealer.index) {
                complaints.insert(dealer.index);
            }
        }
        let response = ResponseBundle {
            from_index: my_index,
            complaints: complaints.iter().copied().collect(),
        };
        state.responded.insert(my_index);
        for dealer in &complaints {
            state.complaints.entry(*dealer).or_default().insert(my_index);
        }
        effects.gossip.push(self.signed_packet(
            state.epoch,
            my_index,
            DkgPacketKind::Response,
            proto::encode(&response),
        ));
        // everyone else's response may already be in
        Ok(effects.merge(self.maybe_finish_responding(state)?))
    }

    fn maybe_finish_responding(&self, state: &mut Ceremony) -> Result<Effects, DkgError> {
        if state.phase != Some(ExecPhase::Responding) {
            return Ok(Effects::none());
        }
        let proposal = state.proposal.as_ref().ok_or(DkgError::NotStarted)?;
        let committee: Vec<u32> = proposal.committee().iter().map(|n| n.index).collect();
        if !committee.iter().all(|n| state.responded.contains(n)) {
            return Ok(Effects::none());
        }
        self.enter_justification(state)
    }

    fn enter_justification(&self, state: &mut Ceremony) -> Result<Effects, DkgError> {
        if state.complaints.is_empty() {
            return self.finalize(state);
        }
        state.phase = Some(ExecPhase::Justifying);
        let mut effects = Effects::none();
        effects.deadline = Some(Some(Instant::now() + self.config.phase_timeout));

        // if our own deals drew complaints, reveal the contested shares
        if let Some(dealing) = &state.my_dealing {
            let my_index = state.my_index.unwrap_or(0);
            if let Some(complainers) = state.complaints.get(&my_index) {
                for recipient in complainers {
                    if *recipient == my_index {
                        continue;
                    }
                    let share = match dealing.secret.eval(*recipient) {
                        Ok(share) => share,
                        Err(_) => continue,
                    };
                    let justification = JustificationBundle {
                        dealer_index: my_index,
                        recipient_index: *recipient,
                        share: share.to_bytes_le().to_vec(),
                    };
                    state
                        .justified
                        .entry(my_index)
                        .or_default()
                        .insert(*recipient);
                    effects.gossip.push(self.signed_packet(
                        state.epoch,
                        my_index,
                        DkgPacketKind::Justification,
                        proto::encode(&justification),
                    ));
                }
            }
        }
        // every outstanding complaint may already be answered
        Ok(effects.merge(self.maybe_finish_justifying(state)?))
    }

    fn maybe_finish_justifying(&self, state: &mut Ceremony) -> Result<Effects, DkgError> {
        if state.phase != Some(ExecPhase::Justifying) {
            return Ok(Effects::none());
        }
        let all_answered = state.complaints.iter().all(|(dealer, complainers)| {
            let justified = state.justified.get(dealer);
            complainers.iter().all(|c| {
                justified.map(|j| j.contains(c)).unwrap_or(false)
            })
        });
        if all_answered {
            return self.finalize(state);
        }
        Ok(Effects::none())
    }

    /// Evict dealers with unanswered complaints and compute the result.
    fn finalize(&self, state: &mut Ceremony) -> Result<Effects, DkgError> {
        let proposal = state.proposal.clone().ok_or(DkgError::NotStarted)?;

        for (dealer, complainers) in &state.complaints {
            let justified = state.justified.get(dealer);
            let unanswered = complainers
                .iter()
                .any(|c| !justified.map(|j| j.contains(c)).unwrap_or(false));
            if unanswered {
                state.evicted.insert(*dealer);
            }
        }
        if state.evicted.contains(&proposal.leader_index) {
            self.set_status(state, DkgStatus::Evicted);
            state.error = Some("leader evicted".into());
            let mut effects = Effects::none();
            effects.deadline = Some(None);
            return Ok(effects);
        }

        let qual: Vec<u32> = proposal
            .dealers()
            .iter()
            .map(|d| d.index)
            .filter(|d| !state.evicted.contains(d) && state.deals.contains_key(d))
            .collect();
        let needed = if proposal.is_reshare() {
            self.previous
                .lock()
                .as_ref()
                .map(|p| p.group.threshold as usize)
                .unwrap_or(proposal.threshold as usize)
        } else {
            proposal.threshold as usize
        };
        if qual.len() < needed {
            self.set_status(state, DkgStatus::Failed);
            state.error = Some(format!(
                "{} qualifying dealers, {} required",
                qual.len(),
                needed
            ));
            let mut effects = Effects::none();
            effects.deadline = Some(None);
            return Ok(effects);
        }

        let output = match state.my_index {
            Some(my_index) => {
                let entries: Vec<(u32, PublicPoly, Scalar)> = state
                    .processed
                    .iter()
                    .filter(|(dealer, _)| qual.contains(dealer))
                    .map(|(dealer, (commitment, share))| (*dealer, commitment.clone(), *share))
                    .collect();
                let (share, public) = if proposal.is_reshare() {
                    // the deterministic dealer set: lowest old-threshold
                    // qualifying indices, identical on every node
                    let mut dealer_set = qual.clone();
                    dealer_set.sort_unstable();
                    dealer_set.truncate(needed);
                    let previous_key = self
                        .previous
                        .lock()
                        .as_ref()
                        .map(|p| p.group.public_key())
                        .ok_or_else(|| DkgError::Failed("no previous group".into()))?;
                    phases::combine_reshare(my_index, &dealer_set, &entries, &previous_key)?
                } else {
                    phases::combine_initial(my_index, &entries)?
                };
                Some((share, public))
            }
            None => None,
        };

        self.set_status(state, DkgStatus::Complete);
        let mut effects = Effects::none();
        effects.deadline = Some(None);

        if let Some((share, public)) = output {
            let group = Arc::new(self.build_group(&proposal, public));
            info!(
                beacon_id = %self.config.beacon_id,
                epoch = group.epoch,
                nodes = group.size(),
                hash = %hex::encode(&group.hash()[..8]),
                "ceremony complete"
            );
            effects.output = Some(DkgOutput {
                group,
                share: Some(share),
            });
        }
        Ok(effects)
    }

    fn build_group(&self, proposal: &Proposal, public: PublicPoly) -> Group {
        let previous = self.previous.lock();
        let (genesis_time, genesis_seed, previous_hash) = match previous.as_ref() {
            Some(prev) if proposal.is_reshare() => (
                prev.group.genesis_time,
                prev.group.genesis_seed.clone(),
                Some(prev.group.hash()),
            ),
            _ => (proposal.genesis_time, Vec::new(), None),
        };
        let mut group = Group {
            beacon_id: proposal.beacon_id.clone(),
            scheme: proposal.scheme,
            threshold: proposal.threshold,
            period: proposal.period,
            catchup_period: proposal.catchup_period,
            genesis_time,
            genesis_seed,
            epoch: proposal.epoch,
            transition_time: proposal.transition_time,
            previous_group_hash: previous_hash,
            nodes: proposal.committee().into_iter().cloned().collect(),
            public_poly: public,
        };
        if group.genesis_seed.is_empty() {
            group.genesis_seed = group.derive_genesis_seed();
        }
        group
    }

    // --- deadlines ------------------------------------------------------

    /// Drive phase deadlines until canceled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut deadline_rx = self.deadline_tx.subscribe();
        loop {
            let deadline = *deadline_rx.borrow();
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = deadline_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.on_deadline().await;
                }
            }
        }
    }

    async fn on_deadline(&self) {
        let effects = {
            let mut state = self.state.lock();
            // deadline consumed
            self.deadline_tx.send_replace(None);
            match (state.status, state.phase) {
                (DkgStatus::Proposed | DkgStatus::Accepted, _) => {
                    // acceptance window closed; a leader with quorum
                    // executes, everyone else times out
                    if state.is_leader
                        && state.accepts.len()
                            >= state
                                .proposal
                                .as_ref()
                                .map(|p| p.threshold as usize)
                                .unwrap_or(usize::MAX)
                    {
                        let packet = self.signed_packet(
                            state.epoch,
                            state.my_index.unwrap_or(0),
                            DkgPacketKind::Execute,
                            Vec::new(),
                        );
                        match self.begin_execution(&mut state) {
                            Ok(mut effects) => {
                                effects.gossip.insert(0, packet);
                                effects
                            }
                            Err(e) => {
                                self.fail(&mut state, DkgStatus::Failed, e.to_string())
                            }
                        }
                    } else {
                        self.fail(
                            &mut state,
                            DkgStatus::TimedOut,
                            "acceptance deadline expired".into(),
                        )
                    }
                }
                (DkgStatus::Executing, Some(ExecPhase::Dealing)) => {
                    match self.publish_response(&mut state) {
                        Ok(effects) => effects,
                        Err(e) => self.fail(&mut state, DkgStatus::Failed, e.to_string()),
                    }
                }
                (DkgStatus::Executing, Some(ExecPhase::Responding)) => {
                    match self.enter_justification(&mut state) {
                        Ok(effects) => effects,
                        Err(e) => self.fail(&mut state, DkgStatus::Failed, e.to_string()),
                    }
                }
                (DkgStatus::Executing, Some(ExecPhase::Justifying)) => {
                    match self.finalize(&mut state) {
                        Ok(effects) => effects,
                        Err(e) => self.fail(&mut state, DkgStatus::Failed, e.to_string()),
                    }
                }
                _ => Effects::none(),
            }
        };
        self.apply(effects).await;
    }

    fn fail(&self, state: &mut Ceremony, status: DkgStatus, error: String) -> Effects {
        warn!(beacon_id = %self.config.beacon_id, %error, "ceremony ended: {status}");
        self.set_status(state, status);
        state.error = Some(error);
        let mut effects = Effects::none();
        effects.deadline = Some(None);
        effects
    }

    // --- helpers --------------------------------------------------------

    async fn participant_signal(&self, kind: DkgPacketKind) -> Result<(), DkgError> {
        let effects = {
            let mut state = self.state.lock();
            if state.status != DkgStatus::Proposed && state.status != DkgStatus::Accepted {
                return Err(DkgError::NotStarted);
            }
            let index = state.my_index.ok_or(DkgError::NotStarted)?;
            if kind == DkgPacketKind::Accept {
                state.accepts.insert(index);
            }
            if kind == DkgPacketKind::Reject {
                state.rejects.insert(index);
            }
            Effects::with_gossip(self.signed_packet(state.epoch, index, kind, Vec::new()))
        };
        self.apply(effects).await;
        Ok(())
    }

    fn validate_against_previous(&self, proposal: &Proposal) -> Result<(), DkgError> {
        let previous = self.previous.lock();
        match previous.as_ref() {
            Some(prev) => {
                if proposal.epoch != prev.group.epoch + 1 {
                    return Err(DkgError::InvalidProposal(format!(
                        "epoch {} does not follow {}",
                        proposal.epoch, prev.group.epoch
                    )));
                }
                if proposal.is_reshare() {
                    if proposal.scheme != prev.group.scheme {
                        return Err(DkgError::InvalidProposal(
                            "scheme may not change within a chain".into(),
                        ));
                    }
                    if proposal.previous_group_hash.as_deref() != Some(&prev.group.hash()[..]) {
                        return Err(DkgError::InvalidProposal(
                            "proposal does not link the current group".into(),
                        ));
                    }
                    // remainers keep their index and key from the previous
                    // roster so reshare anchors stay well-defined
                    for node in &proposal.remaining {
                        match prev.group.node(node.index) {
                            Some(existing)
                                if existing.address == node.address
                                    && existing.key == node.key => {}
                            _ => {
                                return Err(DkgError::InvalidProposal(format!(
                                    "remainer {} does not match the previous roster",
                                    node.index
                                )));
                            }
                        }
                    }
                }
            }
            None => {
                if proposal.is_reshare() {
                    return Err(DkgError::InvalidProposal(
                        "reshare proposed with no previous group".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    fn reshare_anchor(&self, proposal: &Proposal, dealer: u32) -> Option<PublicKey> {
        if !proposal.is_reshare() {
            return None;
        }
        self.previous
            .lock()
            .as_ref()
            .and_then(|p| p.group.public_poly.eval(dealer).ok())
    }

    fn set_status(&self, state: &mut Ceremony, status: DkgStatus) {
        state.status = status;
        self.status_tx.send_replace(status);
    }

    fn signed_packet(
        &self,
        epoch: u64,
        from_index: u32,
        kind: DkgPacketKind,
        payload: Vec<u8>,
    ) -> DkgPacket {
        sign_packet(
            &self.config.identity_key,
            &self.config.beacon_id,
            epoch,
            from_index,
            kind,
            payload,
        )
    }

    fn verify_packet_signature(
        &self,
        state: &Ceremony,
        packet: &DkgPacket,
    ) -> Result<(), DkgError> {
        let proposal = state.proposal.as_ref().ok_or(DkgError::NotStarted)?;
        let sender = proposal
            .node(packet.from_index)
            .ok_or(DkgError::UnknownParticipant(packet.from_index))?;
        self.verify_signature_with(&sender.key.clone(), packet)
    }

    fn verify_signature_with(
        &self,
        key: &lantern_crypto::PublicKey,
        packet: &DkgPacket,
    ) -> Result<(), DkgError> {
        let digest = packet_digest(
            &packet.beacon_id,
            packet.epoch,
            packet.kind,
            &packet.payload,
        );
        let sig = lantern_crypto::Signature::from_bytes(&packet.signature)
            .map_err(|_| DkgError::BadPacketSignature)?;
        key.verify(&digest, &sig)
            .map_err(|_| DkgError::BadPacketSignature)
    }

    async fn apply(&self, effects: Effects) {
        if let Some(deadline) = effects.deadline {
            self.deadline_tx.send_replace(deadline);
        }
        if let Some(output) = effects.output {
            let _ = self.completions_tx.send(output);
        }
        if !effects.gossip.is_empty() {
            let peers = {
                let state = self.state.lock();
                state
                    .proposal
                    .as_ref()
                    .map(|p| {
                        p.participants()
                            .iter()
                            .filter(|n| n.address != self.config.address)
                            .map(|n| n.address.clone())
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default()
            };
            for packet in effects.gossip {
                self.transport.gossip(&peers, packet).await;
            }
        }
    }

    /// One-line status view for `DKGStatus` queries.
    pub fn status_line(&self) -> String {
        let state = self.state.lock();
        match &state.error {
            Some(error) => format!("{} (epoch {}): {}", state.status, state.epoch, error),
            None => format!("{} (epoch {})", state.status, state.epoch),
        }
    }
}

fn packet_digest(beacon_id: &str, epoch: u64, kind: i32, payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"lantern-dkg-packet:");
    hasher.update(beacon_id.as_bytes());
    hasher.update(epoch.to_be_bytes());
    hasher.update(kind.to_be_bytes());
    hasher.update(payload);
    hasher.finalize().into()
}

/// Build a signed ceremony packet. Senders are authenticated by their
/// long-term identity key against the proposal roster.
pub fn sign_packet(
    key: &PrivateKey,
    beacon_id: &str,
    epoch: u64,
    from_index: u32,
    kind: DkgPacketKind,
    payload: Vec<u8>,
) -> DkgPacket {
    let digest = packet_digest(beacon_id, epoch, kind as i32, &payload);
    let signature = key.sign(&digest).to_bytes().to_vec();
    DkgPacket {
        beacon_id: beacon_id.to_owned(),
        epoch,
        from_index,
        kind: kind as i32,
        payload,
        signature,
    }
}
