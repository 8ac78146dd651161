// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

use thiserror::Error;

/// Validation failures for beacons and partial signatures. These are dropped
/// and counted by the engine, never recovered by guessing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BeaconError {
    #[error("round {got} does not follow round {expected}")]
    BadRound { got: u64, expected: u64 },
    #[error("signature does not verify for round {0}")]
    BadSignature(u64),
    #[error("signer index {0} is not in the group roster")]
    UnknownSigner(u32),
    #[error("scheme mismatch: expected {expected}, got {got}")]
    WrongScheme { expected: String, got: String },
    #[error("duplicate partial for round {round} index {index}")]
    DuplicatePartial { round: u64, index: u32 },
    #[error("round {got} at or before last finalized round {last}")]
    OutOfOrder { got: u64, last: u64 },
    #[error("round {0} is too far in the future")]
    RoundInFuture(u64),
    #[error("malformed packet: {0}")]
    Malformed(String),
}

impl From<prost::DecodeError> for BeaconError {
    fn from(e: prost::DecodeError) -> Self {
        BeaconError::Malformed(e.to_string())
    }
}

impl From<lantern_crypto::Error> for BeaconError {
    fn from(e: lantern_crypto::Error) -> Self {
        BeaconError::Malformed(e.to_string())
    }
}
