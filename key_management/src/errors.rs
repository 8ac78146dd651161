// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

use thiserror::Error;

/// Keystore error
#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed key material: {0}")]
    Malformed(String),
    #[error("share does not match its public polynomial")]
    InconsistentShare,
    #[error("no group file for epoch {0}")]
    NoSuchEpoch(u64),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Malformed(e.to_string())
    }
}

impl From<hex::FromHexError> for Error {
    fn from(e: hex::FromHexError) -> Self {
        Error::Malformed(e.to_string())
    }
}

impl From<lantern_crypto::Error> for Error {
    fn from(e: lantern_crypto::Error) -> Self {
        Error::Malformed(e.to_string())
    }
}
