// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

use thiserror::Error;

/// Transport error
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetError {
    #[error("failed to dial {addr}: {reason}")]
    DialFailure { addr: String, reason: String },
    #[error("call timed out")]
    Timeout,
    #[error("stream closed by the remote")]
    StreamClosed,
    #[error("operation canceled")]
    Canceled,
    #[error("remote error: {0}")]
    Remote(String),
    #[error("protocol violation: {0}")]
    Proto(String),
    #[error("gateway is shut down")]
    Shutdown,
}

impl From<prost::DecodeError> for NetError {
    fn from(e: prost::DecodeError) -> Self {
        NetError::Proto(e.to_string())
    }
}
