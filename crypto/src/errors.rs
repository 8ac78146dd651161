// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

use thiserror::Error;

/// Crypto error
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("byte slice has wrong length for the expected group element")]
    WrongLength,
    #[error("bytes do not encode a valid curve point")]
    InvalidPoint,
    #[error("bytes do not encode a valid scalar")]
    InvalidScalar,
    #[error("signature does not verify")]
    InvalidSignature,
    #[error("share index must be non-zero")]
    ZeroIndex,
    #[error("duplicate share index {0}")]
    DuplicateIndex(u32),
    #[error("{0} shares present, {1} required")]
    NotEnoughShares(usize, usize),
    #[error("unknown scheme identifier {0:?}")]
    UnknownScheme(String),
    #[error("payload could not be sealed")]
    EncryptionFailed,
    #[error("ciphertext could not be decrypted")]
    DecryptionFailed,
}
