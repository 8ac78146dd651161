// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

//! Chain stores: append-only logs of beacons keyed by fixed-width big-endian
//! round numbers. One store instance serves one beacon-id.

mod cursor;
mod errors;
mod export;
mod memory;

#[cfg(feature = "rocksdb")]
pub mod rocks;

#[cfg(feature = "sqlite")]
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use byteorder::{BigEndian, ByteOrder};
use lantern_chain::Beacon;

pub use cursor::BeaconCursor;
pub use errors::StoreError;
pub use export::{load_from, save_to};
pub use memory::MemoryStore;

/// Default bound of the in-memory ring backend.
pub const DEFAULT_MEMORY_CAPACITY: usize = 2048;

/// Capability surface of a chain store. Implementations are single-writer:
/// `put` calls are serialized internally, and readers observe either the
/// state before or after a given append, never a torn one.
#[async_trait]
pub trait ChainStore: Send + Sync {
    /// Append a beacon. Fails with [`StoreError::OutOfOrder`] unless the
    /// round extends the chain by exactly one (round 0 starts it).
    async fn put(&self, beacon: &Beacon) -> Result<(), StoreError>;

    async fn get(&self, round: u64) -> Result<Option<Beacon>, StoreError>;

    /// The highest-round beacon; `NotFound` on an empty store.
    async fn last(&self) -> Result<Beacon, StoreError>;

    /// The lowest round still present (eviction and trim may move it past
    /// genesis).
    async fn first(&self) -> Result<Beacon, StoreError>;

    async fn len(&self) -> Result<usize, StoreError>;

    /// Remove a single round. Operator-initiated trim only.
    async fn del(&self, round: u64) -> Result<(), StoreError>;

    async fn close(&self) -> Result<(), StoreError>;
}

/// Encode the store key for a round.
pub fn round_key(round: u64) -> [u8; 8] {
    let mut key = [0u8; 8];
    BigEndian::write_u64(&mut key, round);
    key
}

pub fn round_from_key(key: &[u8]) -> Result<u64, StoreError> {
    if key.len() != 8 {
        return Err(StoreError::Corruption("round key must be 8 bytes".into()));
    }
    Ok(BigEndian::read_u64(key))
}

/// Which backend a beacon-id's store lives in. Selected at daemon startup
/// and fixed for the process lifetime.
#[derive(Clone, Debug)]
pub enum StoreConfig {
    Memory { capacity: usize },
    #[cfg(feature = "rocksdb")]
    Rocks { path: std::path::PathBuf },
    #[cfg(feature = "sqlite")]
    Sqlite { url: String },
}

impl StoreConfig {
    pub async fn open(&self, beacon_id: &str) -> Result<Arc<dyn ChainStore>, StoreError> {
        match self {
            StoreConfig::Memory { capacity } => Ok(Arc::new(MemoryStore::new(*capacity))),
            #[cfg(feature = "rocksdb")]
            StoreConfig::Rocks { path } => {
                Ok(Arc::new(rocks::RocksStore::open(path.join(beacon_id))?))
            }
            #[cfg(feature = "sqlite")]
            StoreConfig::Sqlite { url } => {
                Ok(Arc::new(sqlite::SqliteStore::open(url, beacon_id).await?))
            }
        }
    }
}
