// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

use blstrs::{G1Projective, Scalar};
use ff::Field;
use group::{Curve, Group};
use rand::RngCore;

use crate::errors::Error;
use crate::keys::{g1_from_bytes, PublicKey, PK_SIZE};

/// One-based index of a committee member's share. Index 0 would evaluate the
/// polynomial at its secret and is rejected everywhere.
pub type ShareIndex = u32;

/// A secret polynomial over the scalar field. The constant term is the shared
/// secret; evaluations at `1..=n` are the per-node shares.
///
/// Coefficients are zeroed on drop.
#[derive(Clone)]
pub struct PrivatePoly {
    coeffs: Vec<Scalar>,
}

/// The public commitment to a [`PrivatePoly`]: the same coefficients lifted
/// to G1. Evaluating it at a share index yields that node's verification key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicPoly {
    coeffs: Vec<G1Projective>,
}

impl PrivatePoly {
    /// A random polynomial of degree `threshold - 1`.
    pub fn random<R: RngCore>(threshold: usize, rng: &mut R) -> Self {
        assert!(threshold > 0, "threshold polynomial needs a constant term");
        let coeffs = (0..threshold).map(|_| Scalar::random(&mut *rng)).collect();
        PrivatePoly { coeffs }
    }

    /// A polynomial with a fixed constant term and random higher coefficients,
    /// used by reshares to re-randomize an existing share.
    pub fn with_secret<R: RngCore>(secret: Scalar, threshold: usize, rng: &mut R) -> Self {
        assert!(threshold > 0, "threshold polynomial needs a constant term");
        let mut coeffs = Vec::with_capacity(threshold);
        coeffs.push(secret);
        coeffs.extend((1..threshold).map(|_| Scalar::random(&mut *rng)));
        PrivatePoly { coeffs }
    }

    pub fn secret(&self) -> &Scalar {
        &self.coeffs[0]
    }

    pub fn threshold(&self) -> usize {
        self.coeffs.len()
    }

    /// Horner evaluation at `x = index`.
    pub fn eval(&self, index: ShareIndex) -> Result<Scalar, Error> {
        if index == 0 {
            return Err(Error::ZeroIndex);
        }
        let x = Scalar::from(index as u64);
        let mut acc = Scalar::ZERO;
        for coeff in self.coeffs.iter().rev() {
            acc = acc * x + coeff;
        }
        Ok(acc)
    }

    pub fn commit(&self) -> PublicPoly {
        PublicPoly {
            coeffs: self
                .coeffs
                .iter()
                .map(|c| G1Projective::generator() * c)
                .collect(),
        }
    }
}

impl Drop for PrivatePoly {
    fn drop(&mut self) {
        for coeff in self.coeffs.iter_mut() {
            *coeff = Scalar::ZERO;
        }
    }
}

impl std::fmt::Debug for PrivatePoly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "PrivatePoly(degree {})",
            self.coeffs.len().saturating_sub(1)
        )
    }
}

impl PublicPoly {
    pub fn new(coeffs: Vec<G1Projective>) -> Self {
        PublicPoly { coeffs }
    }

    pub fn zero(threshold: usize) -> Self {
        PublicPoly {
            coeffs: vec![G1Projective::identity(); threshold],
        }
    }

    pub fn threshold(&self) -> usize {
        self.coeffs.len()
    }

    /// The group public key: the commitment to the shared secret.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.coeffs[0])
    }

    /// The verification key of the share at `index`.
    pub fn eval(&self, index: ShareIndex) -> Result<PublicKey, Error> {
        if index == 0 {
            return Err(Error::ZeroIndex);
        }
        let x = Scalar::from(index as u64);
        let mut acc = G1Projective::identity();
        for coeff in self.coeffs.iter().rev() {
            acc = acc * x + coeff;
        }
        Ok(PublicKey(acc))
    }

    /// Coefficient-wise sum; pads the shorter polynomial with zero.
    pub fn add(&self, other: &PublicPoly) -> PublicPoly {
        let longest = self.coeffs.len().max(other.coeffs.len());
        let coeffs = (0..longest)
            .map(|i| {
                let a = self.coeffs.get(i).copied().unwrap_or_else(G1Projective::identity);
                let b = other.coeffs.get(i).copied().unwrap_or_else(G1Projective::identity);
                a + b
            })
            .collect();
        PublicPoly { coeffs }
    }

    /// Coefficient-wise scalar multiple, used when combining reshare deals
    /// under Lagrange weights.
    pub fn mul_scalar(&self, scalar: &Scalar) -> PublicPoly {
        PublicPoly {
            coeffs: self.coeffs.iter().map(|c| c * scalar).collect(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.coeffs.len() * PK_SIZE);
        for coeff in &self.coeffs {
            out.extend_from_slice(&coeff.to_affine().to_compressed());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.is_empty() || bytes.len() % PK_SIZE != 0 {
            return Err(Error::WrongLength);
        }
        let coeffs = bytes
            .chunks_exact(PK_SIZE)
            .map(g1_from_bytes)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PublicPoly { coeffs })
    }
}

/// Lagrange basis weights at zero for the given distinct one-based indices:
/// `w_i = prod_{j != i} x_j / (x_j - x_i)`.
pub fn lagrange_weights(indices: &[ShareIndex]) -> Result<Vec<Scalar>, Error> {
    for (pos, index) in indices.iter().enumerate() {
        if *index == 0 {
            return Err(Error::ZeroIndex);
        }
        if indices[..pos].contains(index) {
            return Err(Error::DuplicateIndex(*index));
        }
    }
    indices
        .iter()
        .map(|i| {
            let xi = Scalar::from(*i as u64);
            let mut num = Scalar::ONE;
            let mut den = Scalar::ONE;
            for j in indices {
                if j == i {
                    continue;
                }
                let xj = Scalar::from(*j as u64);
                num *= xj;
                den *= xj - xi;
            }
            let inv: Option<Scalar> = den.invert().into();
            // distinct indices make the denominator non-zero
            inv.map(|d| num * d).ok_or(Error::DuplicateIndex(*i))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn commitment_matches_evaluation() {
        let poly = PrivatePoly::random(4, &mut OsRng);
        let public = poly.commit();
        for index in 1..=6u32 {
            let share = poly.eval(index).unwrap();
            let expected = G1Projective::generator() * share;
            assert_eq!(public.eval(index).unwrap().0, expected);
        }
    }

    #[test]
    fn rejects_index_zero() {
        let poly = PrivatePoly::random(3, &mut OsRng);
        assert_eq!(poly.eval(0), Err(Error::ZeroIndex));
        assert!(poly.commit().eval(0).is_err());
    }

    #[test]
    fn lagrange_recovers_the_secret() {
        let poly = PrivatePoly::random(3, &mut OsRng);
        let indices = [2u32, 5, 7];
        let weights = lagrange_weights(&indices).unwrap();
        let mut secret = Scalar::ZERO;
        for (index, weight) in indices.iter().zip(weights) {
            secret += poly.eval(*index).unwrap() * weight;
        }
        assert_eq!(&secret, poly.secret());
    }

    #[test]
    fn lagrange_rejects_duplicates() {
        assert_eq!(
            lagrange_weights(&[1, 2, 2]),
            Err(Error::DuplicateIndex(2))
        );
        assert_eq!(lagrange_weights(&[0, 1]), Err(Error::ZeroIndex));
    }

    #[test]
    fn public_poly_round_trips() {
        let poly = PrivatePoly::random(3, &mut OsRng).commit();
        let restored = PublicPoly::from_bytes(&poly.to_bytes()).unwrap();
        assert_eq!(restored, poly);
    }
}
