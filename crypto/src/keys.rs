// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

use blstrs::{G1Affine, G1Projective, G2Affine, G2Projective, Scalar};
use ff::Field;
use group::{prime::PrimeCurveAffine, Curve, Group};
use rand::RngCore;

use crate::errors::Error;
use crate::scheme::SIG_DST;

/// Compressed G1 public key length in bytes.
pub const PK_SIZE: usize = 48;
/// Compressed G2 signature length in bytes.
pub const SIG_SIZE: usize = 96;

/// A long-term BLS secret key. Used both as a node identity key and as the
/// base key material for DKG deal encryption.
///
/// The scalar is overwritten with zero when the key is dropped.
#[derive(Clone)]
pub struct PrivateKey(Scalar);

/// A BLS public key on G1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublicKey(pub(crate) G1Projective);

/// A BLS signature on G2.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Signature(pub(crate) G2Projective);

impl PrivateKey {
    pub fn generate<R: RngCore>(rng: &mut R) -> Self {
        let mut scalar = Scalar::random(&mut *rng);
        while bool::from(scalar.is_zero()) {
            scalar = Scalar::random(&mut *rng);
        }
        PrivateKey(scalar)
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(G1Projective::generator() * self.0)
    }

    /// Sign an arbitrary message under the beacon signature domain.
    pub fn sign(&self, msg: &[u8]) -> Signature {
        let h = G2Projective::hash_to_curve(msg, SIG_DST, &[]);
        Signature(h * self.0)
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        scalar_to_bytes(&self.0)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let scalar = scalar_from_bytes(bytes)?;
        if bool::from(scalar.is_zero()) {
            return Err(Error::InvalidScalar);
        }
        Ok(PrivateKey(scalar))
    }

    pub(crate) fn scalar(&self) -> &Scalar {
        &self.0
    }
}

impl Drop for PrivateKey {
    fn drop(&mut self) {
        self.0 = Scalar::ZERO;
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}

impl PublicKey {
    pub(crate) fn point(&self) -> G1Projective {
        self.0
    }

    pub fn to_bytes(&self) -> [u8; PK_SIZE] {
        self.0.to_affine().to_compressed()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        Ok(PublicKey(g1_from_bytes(bytes)?))
    }

    pub fn verify(&self, msg: &[u8], sig: &Signature) -> Result<(), Error> {
        verify_on_g2(&self.0, msg, &sig.0)
    }
}

impl Signature {
    pub fn to_bytes(&self) -> [u8; SIG_SIZE] {
        self.0.to_affine().to_compressed()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        Ok(Signature(g2_from_bytes(bytes)?))
    }
}

/// Pairing check `e(pk, H(msg)) == e(g1, sig)`.
pub(crate) fn verify_on_g2(pk: &G1Projective, msg: &[u8], sig: &G2Projective) -> Result<(), Error> {
    if bool::from(pk.is_identity()) {
        return Err(Error::InvalidPoint);
    }
    let h = G2Projective::hash_to_curve(msg, SIG_DST, &[]);
    let lhs = blstrs::pairing(&pk.to_affine(), &h.to_affine());
    let rhs = blstrs::pairing(&G1Affine::generator(), &sig.to_affine());
    if lhs == rhs {
        Ok(())
    } else {
        Err(Error::InvalidSignature)
    }
}

pub(crate) fn g1_from_bytes(bytes: &[u8]) -> Result<G1Projective, Error> {
    let arr: [u8; PK_SIZE] = bytes.try_into().map_err(|_| Error::WrongLength)?;
    let affine: Option<G1Affine> = G1Affine::from_compressed(&arr).into();
    affine.map(Into::into).ok_or(Error::InvalidPoint)
}

pub(crate) fn g2_from_bytes(bytes: &[u8]) -> Result<G2Projective, Error> {
    let arr: [u8; SIG_SIZE] = bytes.try_into().map_err(|_| Error::WrongLength)?;
    let affine: Option<G2Affine> = G2Affine::from_compressed(&arr).into();
    affine.map(Into::into).ok_or(Error::InvalidPoint)
}

pub(crate) fn scalar_to_bytes(scalar: &Scalar) -> [u8; 32] {
    scalar.to_bytes_le()
}

pub(crate) fn scalar_from_bytes(bytes: &[u8]) -> Result<Scalar, Error> {
    let arr: [u8; 32] = bytes.try_into().map_err(|_| Error::WrongLength)?;
    let scalar: Option<Scalar> = Scalar::from_bytes_le(&arr).into();
    scalar.ok_or(Error::InvalidScalar)
}
