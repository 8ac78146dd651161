// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

//! Threshold BLS primitives for the Lantern randomness beacon.
//!
//! The pairing arithmetic itself comes from [`blstrs`]; this crate layers the
//! beacon-specific conventions on top: scheme identifiers and message
//! derivation, secret/public polynomials, partial signatures and their
//! Lagrange aggregation, and the ECIES-style encryption used for DKG deals.

mod ecies;
mod errors;
mod keys;
mod poly;
mod scheme;
mod tbls;

pub use self::ecies::{decrypt, encrypt, EciesCiphertext};
pub use self::errors::Error;
pub use self::keys::{PrivateKey, PublicKey, Signature, PK_SIZE, SIG_SIZE};
pub use self::poly::{lagrange_weights, PrivatePoly, PublicPoly, ShareIndex};
pub use self::scheme::{randomness_from_signature, Scheme, SchemeId};
pub use self::tbls::{aggregate, sign_partial, verify_partial, verify_sig, Share};
