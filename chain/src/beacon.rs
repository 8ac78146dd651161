// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

use lantern_crypto::{randomness_from_signature, PublicKey, Scheme};
use prost::Message;

use crate::errors::BeaconError;
use crate::proto::BeaconPacket;

/// One round's verifiable random output.
///
/// Round 0 is the genesis beacon: its signature is the chain's genesis seed
/// and it is never signed nor verified.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Beacon {
    round: u64,
    signature: Vec<u8>,
    previous_signature: Vec<u8>,
}

impl Beacon {
    pub fn new(round: u64, signature: Vec<u8>, previous_signature: Vec<u8>) -> Self {
        Beacon {
            round,
            signature,
            previous_signature,
        }
    }

    pub fn genesis(seed: Vec<u8>) -> Self {
        Beacon {
            round: 0,
            signature: seed,
            previous_signature: Vec::new(),
        }
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    pub fn previous_signature(&self) -> &[u8] {
        &self.previous_signature
    }

    /// The unbiasable value consumers read: `SHA-256(signature)`.
    pub fn randomness(&self) -> [u8; 32] {
        randomness_from_signature(&self.signature)
    }

    /// The digest this beacon's signature must cover.
    pub fn digest(&self, scheme: &Scheme) -> [u8; 32] {
        scheme.beacon_digest(&self.previous_signature, self.round)
    }

    /// Verify the group signature; `previous` is the already-verified beacon
    /// at `round - 1`, which under chained schemes determines the digest.
    pub fn verify(
        &self,
        scheme: &Scheme,
        public_key: &PublicKey,
        previous: &Beacon,
    ) -> Result<(), BeaconError> {
        if self.round != previous.round + 1 {
            return Err(BeaconError::BadRound {
                got: self.round,
                expected: previous.round + 1,
            });
        }
        if scheme.chained() && self.previous_signature != previous.signature {
            return Err(BeaconError::BadSignature(self.round));
        }
        let digest = self.digest(scheme);
        lantern_crypto::verify_sig(public_key, &digest, &self.signature)
            .map_err(|_| BeaconError::BadSignature(self.round))
    }

    pub fn encode(&self) -> Vec<u8> {
        BeaconPacket::from(self.clone()).encode_to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BeaconError> {
        Ok(BeaconPacket::decode(bytes)?.into())
    }
}

impl From<Beacon> for BeaconPacket {
    fn from(b: Beacon) -> Self {
        BeaconPacket {
            round: b.round,
            signature: b.signature,
            previous_signature: b.previous_signature,
        }
    }
}

impl From<BeaconPacket> for Beacon {
    fn from(p: BeaconPacket) -> Self {
        Beacon {
            round: p.round,
            signature: p.signature,
            previous_signature: p.previous_signature,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[quickcheck]
    fn beacon_encoding_round_trips(round: u64, sig: Vec<u8>, prev: Vec<u8>) -> bool {
        let beacon = Beacon::new(round, sig, prev);
        Beacon::decode(&beacon.encode()).unwrap() == beacon
    }

    #[test]
    fn genesis_has_round_zero() {
        let genesis = Beacon::genesis(vec![0xaa; 32]);
        assert_eq!(genesis.round(), 0);
        assert_eq!(genesis.signature(), &[0xaa; 32][..]);
        assert!(genesis.previous_signature().is_empty());
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Beacon::decode(&[0xff, 0xff, 0xff]).is_err());
    }
}
