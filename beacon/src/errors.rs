// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

use lantern_chain::BeaconError;
use lantern_db::StoreError;
use lantern_net::NetError;
use thiserror::Error;

/// Engine error
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine has not been started")]
    NotStarted,
    #[error("no group loaded for this beacon id")]
    GroupNotLoaded,
    #[error("engine is shut down")]
    Shutdown,
    #[error("this node holds no share and cannot sign")]
    NoShare,
    #[error(transparent)]
    Validation(#[from] BeaconError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Net(#[from] NetError),
    #[error("crypto: {0}")]
    Crypto(#[from] lantern_crypto::Error),
}
