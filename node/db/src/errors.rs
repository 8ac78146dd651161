// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

use thiserror::Error;

/// Store error
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("round {got} does not extend the chain at round {last}")]
    OutOfOrder { got: u64, last: u64 },
    #[error("no beacon stored for the requested round")]
    NotFound,
    #[error("store is closed")]
    Closed,
    #[error("store corruption: {0}")]
    Corruption(String),
    #[error("store i/o: {0}")]
    Io(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

#[cfg(feature = "rocksdb")]
impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}
