// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

//! File-backed storage for a node's long-lived secrets and committee
//! metadata: the identity keypair, the per-epoch distributed key share and
//! the sealed group files.

mod errors;
mod keystore;

pub use self::errors::Error;
pub use self::keystore::{FileStore, IdentityPair};
