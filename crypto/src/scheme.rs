// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

use sha2::{Digest, Sha256};

use crate::errors::Error;

/// Hash-to-curve domain separation tag shared by every registered scheme,
/// matching the ciphersuite of G2 signatures with G1 public keys.
pub(crate) const SIG_DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_NUL_";

/// Identifier of a beacon scheme. The scheme fixes the pairing groups, the
/// message construction and whether rounds chain the previous signature.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SchemeId {
    /// `pedersen-bls-chained`: the signed message commits to the previous
    /// round's signature.
    PedersenBlsChained,
    /// `pedersen-bls-unchained`: the signed message is the round number only.
    PedersenBlsUnchained,
}

impl SchemeId {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemeId::PedersenBlsChained => "pedersen-bls-chained",
            SchemeId::PedersenBlsUnchained => "pedersen-bls-unchained",
        }
    }
}

impl std::str::FromStr for SchemeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pedersen-bls-chained" => Ok(SchemeId::PedersenBlsChained),
            "pedersen-bls-unchained" => Ok(SchemeId::PedersenBlsUnchained),
            other => Err(Error::UnknownScheme(other.to_owned())),
        }
    }
}

impl std::fmt::Display for SchemeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered beacon scheme.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Scheme {
    id: SchemeId,
}

impl Scheme {
    pub fn new(id: SchemeId) -> Self {
        Scheme { id }
    }

    pub fn id(&self) -> SchemeId {
        self.id
    }

    /// Whether beacons under this scheme carry the previous signature.
    pub fn chained(&self) -> bool {
        matches!(self.id, SchemeId::PedersenBlsChained)
    }

    /// The 32-byte digest signed for `round`.
    ///
    /// Chained: `H(previous_signature ‖ be64(round))`; unchained:
    /// `H(be64(round))`. Round 0 is the genesis beacon and is never signed.
    pub fn beacon_digest(&self, previous_signature: &[u8], round: u64) -> [u8; 32] {
        let mut hasher = Sha256::new();
        if self.chained() {
            hasher.update(previous_signature);
        }
        hasher.update(round.to_be_bytes());
        hasher.finalize().into()
    }
}

/// Randomness exposed for a beacon is the hash of its signature, so that the
/// unbiasable value served to consumers is fixed once the signature exists.
pub fn randomness_from_signature(signature: &[u8]) -> [u8; 32] {
    Sha256::digest(signature).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_id_round_trips() {
        for id in [SchemeId::PedersenBlsChained, SchemeId::PedersenBlsUnchained] {
            assert_eq!(id.as_str().parse::<SchemeId>().unwrap(), id);
        }
        assert!(matches!(
            "pedersen-bls-sideways".parse::<SchemeId>(),
            Err(Error::UnknownScheme(_))
        ));
    }

    #[test]
    fn chained_digest_commits_to_previous_signature() {
        let chained = Scheme::new(SchemeId::PedersenBlsChained);
        let a = chained.beacon_digest(b"prev-a", 7);
        let b = chained.beacon_digest(b"prev-b", 7);
        assert_ne!(a, b);

        let unchained = Scheme::new(SchemeId::PedersenBlsUnchained);
        let c = unchained.beacon_digest(b"prev-a", 7);
        let d = unchained.beacon_digest(b"prev-b", 7);
        assert_eq!(c, d);
        assert_ne!(c, unchained.beacon_digest(b"", 8));
    }
}
