// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

//! Pure cryptographic steps of a Pedersen ceremony: dealing, deal
//! verification, justification checks and the final share/polynomial
//! combination for both initial DKGs and reshares.

use blstrs::Scalar;
use lantern_chain::proto::{DealBundle, DealEntry, JustificationBundle};
use lantern_crypto::{
    lagrange_weights, EciesCiphertext, PrivateKey, PrivatePoly, PublicKey, PublicPoly, Share,
};
use rand::RngCore;

use crate::errors::DkgError;

/// A dealer's freshly created bundle plus the secret polynomial backing it,
/// kept local for justifications and the dealer's own share.
pub struct Dealing {
    pub bundle: DealBundle,
    pub secret: PrivatePoly,
}

/// Create this dealer's bundle: commit to a secret polynomial and encrypt
/// its evaluation at each recipient's index to that recipient's key.
///
/// For a reshare the polynomial's constant term is pinned to the dealer's
/// previous share so the group public key survives the epoch change.
pub fn create_deals<R: RngCore>(
    dealer_index: u32,
    reshare_secret: Option<&Scalar>,
    threshold: usize,
    recipients: &[(u32, PublicKey)],
    rng: &mut R,
) -> Result<Dealing, DkgError> {
    let secret = match reshare_secret {
        Some(prev) => PrivatePoly::with_secret(*prev, threshold, rng),
        None => PrivatePoly::random(threshold, rng),
    };
    let commitment = secret.commit();

    let mut deals = Vec::with_capacity(recipients.len());
    for (index, key) in recipients {
        let eval = secret.eval(*index)?;
        let ct = lantern_crypto::encrypt(key, &eval.to_bytes_le(), rng)?;
        deals.push(DealEntry {
            recipient_index: *index,
            ephemeral: ct.ephemeral,
            nonce: ct.nonce,
            sealed: ct.sealed,
        });
    }

    Ok(Dealing {
        bundle: DealBundle {
            dealer_index,
            commitment: commitment.to_bytes(),
            deals,
        },
        secret,
    })
}

/// Why a deal draws a complaint.
#[derive(Debug, PartialEq, Eq)]
pub enum DealFault {
    MissingShare,
    BadCommitment,
    Undecryptable,
    ShareMismatch,
    WrongAnchor,
}

/// Verify the bundle as seen by recipient `my_index` and extract our share.
///
/// `anchor` is the reshare constraint: the dealer's polynomial must open at
/// zero to the dealer's previous verification key. `None` for initial DKGs.
pub fn process_deal(
    bundle: &DealBundle,
    my_index: u32,
    my_key: &PrivateKey,
    threshold: usize,
    anchor: Option<&PublicKey>,
) -> Result<(PublicPoly, Scalar), DealFault> {
    let commitment =
        PublicPoly::from_bytes(&bundle.commitment).map_err(|_| DealFault::BadCommitment)?;
    if commitment.threshold() != threshold {
        return Err(DealFault::BadCommitment);
    }
    if let Some(anchor) = anchor {
        if &commitment.public_key() != anchor {
            return Err(DealFault::WrongAnchor);
        }
    }

    let entry = bundle
        .deals
        .iter()
        .find(|d| d.recipient_index == my_index)
        .ok_or(DealFault::MissingShare)?;
    let ct = EciesCiphertext {
        ephemeral: entry.ephemeral.clone(),
        nonce: entry.nonce.clone(),
        sealed: entry.sealed.clone(),
    };
    let plain = lantern_crypto::decrypt(my_key, &ct).map_err(|_| DealFault::Undecryptable)?;
    let share =
        Share::from_bytes(my_index, &plain).map_err(|_| DealFault::Undecryptable)?;

    if expected_key(&commitment, my_index) != Some(share.public_key()) {
        return Err(DealFault::ShareMismatch);
    }
    Ok((commitment, *share.secret_ref()))
}

/// Check a revealed share against the dealer's published commitment.
pub fn verify_justification(
    justification: &JustificationBundle,
    commitment: &PublicPoly,
) -> Result<Scalar, DkgError> {
    let share = Share::from_bytes(justification.recipient_index, &justification.share)
        .map_err(|_| DkgError::JustificationFailed(justification.dealer_index))?;
    if expected_key(commitment, justification.recipient_index) != Some(share.public_key()) {
        return Err(DkgError::JustificationFailed(justification.dealer_index));
    }
    Ok(*share.secret_ref())
}

/// Initial-DKG combination: the share is the sum of every qualifying
/// dealer's evaluation at our index, the group polynomial the sum of their
/// commitments.
pub fn combine_initial(
    my_index: u32,
    entries: &[(u32, PublicPoly, Scalar)],
) -> Result<(Share, PublicPoly), DkgError> {
    let (_, first, _) = entries
        .first()
        .ok_or_else(|| DkgError::Failed("no qualifying deals".into()))?;
    let mut public = first.clone();
    let mut secret = Scalar::from(0u64);
    for (i, (_, commitment, share)) in entries.iter().enumerate() {
        if i > 0 {
            public = public.add(commitment);
        }
        secret += share;
    }
    let share = Share::new(my_index, secret)?;
    check_consistency(&share, &public)?;
    Ok((share, public))
}

/// Reshare combination over the deterministic dealer set `dealer_indices`
/// (every node must use the same set): Lagrange-weigh the dealers' shares
/// and commitments at zero. The resulting polynomial must open to the
/// previous group key.
pub fn combine_reshare(
    my_index: u32,
    dealer_indices: &[u32],
    entries: &[(u32, PublicPoly, Scalar)],
    previous_key: &PublicKey,
) -> Result<(Share, PublicPoly), DkgError> {
    let weights = lagrange_weights(dealer_indices)?;
    let mut secret = Scalar::from(0u64);
    let mut public: Option<PublicPoly> = None;
    for (dealer, weight) in dealer_indices.iter().zip(weights) {
        let (_, commitment, share) = entries
            .iter()
            .find(|(d, _, _)| d == dealer)
            .ok_or_else(|| DkgError::Failed(format!("missing deal from dealer {dealer}")))?;
        secret += *share * weight;
        let weighted = commitment.mul_scalar(&weight);
        public = Some(match public {
            Some(acc) => acc.add(&weighted),
            None => weighted,
        });
    }
    let public = public.ok_or_else(|| DkgError::Failed("no dealers".into()))?;
    if &public.public_key() != previous_key {
        return Err(DkgError::Failed(
            "reshared polynomial does not preserve the group key".into(),
        ));
    }
    let share = Share::new(my_index, secret)?;
    check_consistency(&share, &public)?;
    Ok((share, public))
}

fn check_consistency(share: &Share, public: &PublicPoly) -> Result<(), DkgError> {
    match expected_key(public, share.index()) {
        Some(expected) if expected == share.public_key() => Ok(()),
        _ => Err(DkgError::Failed(
            "combined share does not match the combined polynomial".into(),
        )),
    }
}

fn expected_key(public: &PublicPoly, index: u32) -> Option<PublicKey> {
    public.eval(index).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn keys(n: usize) -> Vec<(u32, PrivateKey)> {
        (1..=n as u32)
            .map(|i| (i, PrivateKey::generate(&mut OsRng)))
            .collect()
    }

    fn recipients(keys: &[(u32, PrivateKey)]) -> Vec<(u32, PublicKey)> {
        keys.iter().map(|(i, k)| (*i, k.public_key())).collect()
    }

    #[test]
    fn full_initial_dkg_by_hand() {
        let n = 4;
        let threshold = 3;
        let keys = keys(n);
        let recipients = recipients(&keys);

        let dealings: Vec<Dealing> = keys
            .iter()
            .map(|(i, _)| create_deals(*i, None, threshold, &recipients, &mut OsRng).unwrap())
            .collect();

        // every node processes every deal and combines
        let mut outputs = Vec::new();
        for (my_index, my_key) in &keys {
            let entries: Vec<(u32, PublicPoly, Scalar)> = dealings
                .iter()
                .map(|d| {
                    let (commitment, share) =
                        process_deal(&d.bundle, *my_index, my_key, threshold, None).unwrap();
                    (d.bundle.dealer_index, commitment, share)
                })
                .collect();
            outputs.push(combine_initial(*my_index, &entries).unwrap());
        }

        // everyone derives the same group polynomial
        let group_poly = &outputs[0].1;
        for (_, poly) in &outputs[1..] {
            assert_eq!(poly, group_poly);
        }

        // the shares form a working threshold signing committee
        let digest = [0x42u8; 32];
        let partials: Vec<(u32, Vec<u8>)> = outputs
            .iter()
            .take(threshold)
            .map(|(share, _)| (share.index(), lantern_crypto::sign_partial(share, &digest)))
            .collect();
        let sig = lantern_crypto::aggregate(threshold, &partials).unwrap();
        lantern_crypto::verify_sig(&group_poly.public_key(), &digest, &sig).unwrap();
    }

    #[test]
    fn reshare_preserves_the_group_key() {
        let n = 4;
        let threshold = 3;
        let keys = keys(n);
        let recipients = recipients(&keys);

        // epoch 1 by hand
        let dealings: Vec<Dealing> = keys
            .iter()
            .map(|(i, _)| create_deals(*i, None, threshold, &recipients, &mut OsRng).unwrap())
            .collect();
        let mut epoch1 = Vec::new();
        for (my_index, my_key) in &keys {
            let entries: Vec<(u32, PublicPoly, Scalar)> = dealings
                .iter()
                .map(|d| {
                    let (c, s) =
                        process_deal(&d.bundle, *my_index, my_key, threshold, None).unwrap();
                    (d.bundle.dealer_index, c, s)
                })
                .collect();
            epoch1.push(combine_initial(*my_index, &entries).unwrap());
        }
        let old_key = epoch1[0].1.public_key();

        // epoch 2: node 4 leaves, node 5 joins; remainers 1-3 deal
        let mut keys2: Vec<(u32, PrivateKey)> = keys
            .iter()
            .take(3)
            .map(|(i, k)| (*i, k.clone()))
            .collect();
        keys2.push((5, PrivateKey::generate(&mut OsRng)));
        let recipients2 = recipients(&keys2);
        let new_threshold = 3;

        let redealings: Vec<Dealing> = epoch1
            .iter()
            .take(3)
            .map(|(share, _)| {
                create_deals(
                    share.index(),
                    Some(share.secret_ref()),
                    new_threshold,
                    &recipients2,
                    &mut OsRng,
                )
                .unwrap()
            })
            .collect();

        let dealer_set: Vec<u32> = vec![1, 2, 3];
        let mut epoch2 = Vec::new();
        for (my_index, my_key) in &keys2 {
            let entries: Vec<(u32, PublicPoly, Scalar)> = redealings
                .iter()
                .map(|d| {
                    let anchor = epoch1[d.bundle.dealer_index as usize - 1]
                        .1
                        .eval(d.bundle.dealer_index)
                        .unwrap();
                    let (c, s) = process_deal(
                        &d.bundle,
                        *my_index,
                        my_key,
                        new_threshold,
                        Some(&anchor),
                    )
                    .unwrap();
                    (d.bundle.dealer_index, c, s)
                })
                .collect();
            epoch2.push(combine_reshare(*my_index, &dealer_set, &entries, &old_key).unwrap());
        }

        // same group key, working new committee including the fresh node
        assert_eq!(epoch2[0].1.public_key(), old_key);
        let digest = [0x07u8; 32];
        let partials: Vec<(u32, Vec<u8>)> = epoch2
            .iter()
            .take(new_threshold)
            .map(|(share, _)| (share.index(), lantern_crypto::sign_partial(share, &digest)))
            .collect();
        let sig = lantern_crypto::aggregate(new_threshold, &partials).unwrap();
        lantern_crypto::verify_sig(&old_key, &digest, &sig).unwrap();
    }

    #[test]
    fn tampered_deal_is_detected_and_justifiable() {
        let keys = keys(3);
        let recipients = recipients(&keys);
        let dealing = create_deals(1, None, 2, &recipients, &mut OsRng).unwrap();

        // corrupt the share addressed to node 2
        let mut bad = dealing.bundle.clone();
        bad.deals[1].sealed[0] ^= 0xff;
        let fault = process_deal(&bad, 2, &keys[1].1, 2, None).unwrap_err();
        assert_eq!(fault, DealFault::Undecryptable);

        // the honest dealer justifies with the cleartext share
        let justification = JustificationBundle {
            dealer_index: 1,
            recipient_index: 2,
            share: dealing.secret.eval(2).unwrap().to_bytes_le().to_vec(),
        };
        let commitment = PublicPoly::from_bytes(&dealing.bundle.commitment).unwrap();
        verify_justification(&justification, &commitment).unwrap();

        // a forged justification does not verify
        let forged = JustificationBundle {
            dealer_index: 1,
            recipient_index: 2,
            share: dealing.secret.eval(3).unwrap().to_bytes_le().to_vec(),
        };
        assert!(verify_justification(&forged, &commitment).is_err());
    }

    #[test]
    fn reshare_deal_with_wrong_anchor_is_rejected() {
        let keys = keys(3);
        let recipients = recipients(&keys);
        // dealer claims to reshare, but the anchor check expects a
        // different opening at zero
        let dealing = create_deals(1, None, 2, &recipients, &mut OsRng).unwrap();
        let unrelated = PrivateKey::generate(&mut OsRng).public_key();
        let fault = process_deal(&dealing.bundle, 2, &keys[1].1, 2, Some(&unrelated)).unwrap_err();
        assert_eq!(fault, DealFault::WrongAnchor);
    }
}
