// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

use thiserror::Error;

/// DKG error
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DkgError {
    #[error("no ceremony in progress")]
    NotStarted,
    #[error("ceremony already complete")]
    AlreadyComplete,
    #[error("invalid proposal: {0}")]
    InvalidProposal(String),
    #[error("packet for epoch {got}, current ceremony is epoch {expected}")]
    WrongEpoch { got: u64, expected: u64 },
    #[error("sender {0} is not a ceremony participant")]
    UnknownParticipant(u32),
    #[error("packet signature does not verify")]
    BadPacketSignature,
    #[error("phase deadline expired")]
    PhaseTimeout,
    #[error("bad deal from dealer {0}")]
    BadDeal(u32),
    #[error("justification from dealer {0} failed")]
    JustificationFailed(u32),
    #[error("ceremony aborted by operator")]
    Aborted,
    #[error("dealer {0} evicted for provable misbehavior")]
    Evicted(u32),
    #[error("ceremony failed: {0}")]
    Failed(String),
    #[error("crypto: {0}")]
    Crypto(#[from] lantern_crypto::Error),
    #[error("malformed packet: {0}")]
    Malformed(String),
}

impl From<prost::DecodeError> for DkgError {
    fn from(e: prost::DecodeError) -> Self {
        DkgError::Malformed(e.to_string())
    }
}
