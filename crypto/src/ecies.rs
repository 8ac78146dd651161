// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

//! ECIES-style encryption of DKG deals: an ephemeral scalar is combined with
//! the recipient's long-term public key, and the compressed shared point is
//! hashed into an XSalsa20-Poly1305 key.

use blstrs::G1Projective;
use crypto_secretbox::aead::{Aead, KeyInit, OsRng as AeadOsRng};
use crypto_secretbox::{AeadCore, XSalsa20Poly1305};
use group::Curve;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::errors::Error;
use crate::keys::{g1_from_bytes, PrivateKey, PublicKey, PK_SIZE};

const NONCE_SIZE: usize = 24;

/// An encrypted payload addressed to a single recipient key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EciesCiphertext {
    /// Compressed ephemeral G1 point.
    pub ephemeral: Vec<u8>,
    /// XSalsa20-Poly1305 nonce.
    pub nonce: Vec<u8>,
    /// Sealed payload.
    pub sealed: Vec<u8>,
}

fn shared_key(point: &G1Projective) -> [u8; 32] {
    let mut compressed = point.to_affine().to_compressed();
    let key = Sha256::digest(&compressed).into();
    compressed.zeroize();
    key
}

pub fn encrypt<R: RngCore>(
    recipient: &PublicKey,
    plaintext: &[u8],
    rng: &mut R,
) -> Result<EciesCiphertext, Error> {
    let eph = PrivateKey::generate(rng);
    let mut key = shared_key(&(recipient.point() * *eph.scalar()));

    let cipher = XSalsa20Poly1305::new((&key).into());
    let nonce = XSalsa20Poly1305::generate_nonce(&mut AeadOsRng);
    let sealed = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| Error::EncryptionFailed)?;
    key.zeroize();

    Ok(EciesCiphertext {
        ephemeral: eph.public_key().to_bytes().to_vec(),
        nonce: nonce.to_vec(),
        sealed,
    })
}

pub fn decrypt(private: &PrivateKey, ciphertext: &EciesCiphertext) -> Result<Vec<u8>, Error> {
    if ciphertext.ephemeral.len() != PK_SIZE || ciphertext.nonce.len() != NONCE_SIZE {
        return Err(Error::WrongLength);
    }
    let ephemeral = g1_from_bytes(&ciphertext.ephemeral)?;
    let mut key = shared_key(&(ephemeral * *private.scalar()));

    let cipher = XSalsa20Poly1305::new((&key).into());
    let nonce: [u8; NONCE_SIZE] = ciphertext.nonce[..]
        .try_into()
        .map_err(|_| Error::WrongLength)?;
    let plain = cipher
        .decrypt(&nonce.into(), ciphertext.sealed.as_slice())
        .map_err(|_| Error::DecryptionFailed);
    key.zeroize();
    plain
}
