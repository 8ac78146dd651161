// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

//! Threshold BLS signing: each committee member signs the round digest with
//! its share, and any `threshold` distinct valid partials interpolate to the
//! group signature.

use blstrs::{G2Projective, Scalar};
use ff::Field;
use group::{Curve, Group};

use crate::errors::Error;
use crate::keys::{g2_from_bytes, verify_on_g2, PublicKey, SIG_SIZE};
use crate::poly::{lagrange_weights, PublicPoly, ShareIndex};
use crate::scheme::SIG_DST;

/// A node's slice of the distributed secret: the scalar evaluation of the
/// group's secret polynomial at the node's index.
///
/// The scalar is zeroed on drop; a rotated-out share must not survive its
/// epoch in memory.
#[derive(Clone)]
pub struct Share {
    index: ShareIndex,
    secret: Scalar,
}

impl Share {
    pub fn new(index: ShareIndex, secret: Scalar) -> Result<Self, Error> {
        if index == 0 {
            return Err(Error::ZeroIndex);
        }
        Ok(Share { index, secret })
    }

    pub fn index(&self) -> ShareIndex {
        self.index
    }

    /// The verification key this share's partials check against.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(blstrs::G1Projective::generator() * self.secret)
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        crate::keys::scalar_to_bytes(&self.secret)
    }

    pub fn from_bytes(index: ShareIndex, bytes: &[u8]) -> Result<Self, Error> {
        Share::new(index, crate::keys::scalar_from_bytes(bytes)?)
    }

    /// The raw scalar, needed by reshares to deal a re-randomization of an
    /// existing share. Handle with the same care as the share itself.
    pub fn secret_ref(&self) -> &Scalar {
        &self.secret
    }
}

impl Drop for Share {
    fn drop(&mut self) {
        self.secret = Scalar::ZERO;
    }
}

impl std::fmt::Debug for Share {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Share(index {})", self.index)
    }
}

/// Sign the 32-byte round digest with a share, producing this node's partial.
pub fn sign_partial(share: &Share, digest: &[u8]) -> Vec<u8> {
    let h = G2Projective::hash_to_curve(digest, SIG_DST, &[]);
    (h * share.secret).to_affine().to_compressed().to_vec()
}

/// Verify a partial signature against the verification key derived from the
/// group's public polynomial at `index`.
pub fn verify_partial(
    public: &PublicPoly,
    index: ShareIndex,
    digest: &[u8],
    sig: &[u8],
) -> Result<(), Error> {
    let key = public.eval(index)?;
    let point = g2_from_bytes(sig)?;
    verify_on_g2(&key.0, digest, &point)
}

/// Verify a full group signature against the group public key.
pub fn verify_sig(public_key: &PublicKey, digest: &[u8], sig: &[u8]) -> Result<(), Error> {
    let point = g2_from_bytes(sig)?;
    verify_on_g2(&public_key.0, digest, &point)
}

/// Interpolate `threshold` partials into the group signature.
///
/// More partials than needed may be passed; the lexicographically smallest
/// set of indices is used so that every aggregator derives the same
/// signature bytes from the same pool.
pub fn aggregate(threshold: usize, partials: &[(ShareIndex, Vec<u8>)]) -> Result<Vec<u8>, Error> {
    if partials.len() < threshold {
        return Err(Error::NotEnoughShares(partials.len(), threshold));
    }
    let mut sorted: Vec<&(ShareIndex, Vec<u8>)> = partials.iter().collect();
    sorted.sort_by_key(|(index, _)| *index);
    for window in sorted.windows(2) {
        if window[0].0 == window[1].0 {
            return Err(Error::DuplicateIndex(window[0].0));
        }
    }
    sorted.truncate(threshold);

    let indices: Vec<ShareIndex> = sorted.iter().map(|(index, _)| *index).collect();
    let weights = lagrange_weights(&indices)?;

    let mut acc = G2Projective::identity();
    for ((_, sig), weight) in sorted.iter().zip(weights) {
        acc += g2_from_bytes(sig)? * weight;
    }
    Ok(acc.to_affine().to_compressed().to_vec())
}
