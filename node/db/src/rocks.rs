// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::path::Path;

use async_trait::async_trait;
use lantern_chain::Beacon;
use parking_lot::Mutex;
use rocksdb::{Options, DB};
use tracing::debug;

use crate::{round_from_key, round_key, ChainStore, StoreError};

/// Embedded on-disk backend: one rocksdb per beacon-id, key = 8-byte
/// big-endian round, value = encoded beacon.
pub struct RocksStore {
    db: DB,
    meta: Mutex<Meta>,
}

struct Meta {
    first: Option<u64>,
    last: Option<u64>,
    count: usize,
    closed: bool,
}

impl RocksStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path.as_ref())?;

        let mut first = None;
        let mut last = None;
        let mut count = 0usize;
        for entry in db.iterator(rocksdb::IteratorMode::Start) {
            let (key, _) = entry?;
            let round = round_from_key(&key)?;
            if first.is_none() {
                first = Some(round);
            }
            last = Some(round);
            count += 1;
        }
        debug!(
            path = %path.as_ref().display(),
            rounds = count,
            "opened chain store"
        );

        Ok(RocksStore {
            db,
            meta: Mutex::new(Meta {
                first,
                last,
                count,
                closed: false,
            }),
        })
    }

    fn decode(round: u64, value: &[u8]) -> Result<Beacon, StoreError> {
        let beacon =
            Beacon::decode(value).map_err(|e| StoreError::Corruption(e.to_string()))?;
        if beacon.round() != round {
            return Err(StoreError::Corruption(format!(
                "key round {} holds beacon round {}",
                round,
                beacon.round()
            )));
        }
        Ok(beacon)
    }
}

#[async_trait]
impl ChainStore for RocksStore {
    async fn put(&self, beacon: &Beacon) -> Result<(), StoreError> {
        let mut meta = self.meta.lock();
        if meta.closed {
            return Err(StoreError::Closed);
        }
        match meta.last {
            None => {}
            Some(last) if beacon.round() == last + 1 => {}
            Some(last) => {
                return Err(StoreError::OutOfOrder {
                    got: beacon.round(),
                    last,
                });
            }
        }
        self.db.put(round_key(beacon.round()), beacon.encode())?;
        meta.last = Some(beacon.round());
        if meta.first.is_none() {
            meta.first = Some(beacon.round());
        }
        meta.count += 1;
        Ok(())
    }

    async fn get(&self, round: u64) -> Result<Option<Beacon>, StoreError> {
        if self.meta.lock().closed {
            return Err(StoreError::Closed);
        }
        match self.db.get(round_key(round))? {
            Some(value) => Ok(Some(Self::decode(round, &value)?)),
            None => Ok(None),
        }
    }

    async fn last(&self) -> Result<Beacon, StoreError> {
        let last = {
            let meta = self.meta.lock();
            if meta.closed {
                return Err(StoreError::Closed);
            }
            meta.last.ok_or(StoreError::NotFound)?
        };
        self.get(last).await?.ok_or(StoreError::NotFound)
    }

    async fn first(&self) -> Result<Beacon, StoreError> {
        let first = {
            let meta = self.meta.lock();
            if meta.closed {
                return Err(StoreError::Closed);
            }
            meta.first.ok_or(StoreError::NotFound)?
        };
        self.get(first).await?.ok_or(StoreError::NotFound)
    }

    async fn len(&self) -> Result<usize, StoreError> {
        let meta = self.meta.lock();
        if meta.closed {
            return Err(StoreError::Closed);
        }
        Ok(meta.count)
    }

    async fn del(&self, round: u64) -> Result<(), StoreError> {
        let mut meta = self.meta.lock();
        if meta.closed {
            return Err(StoreError::Closed);
        }
        if self.db.get(round_key(round))?.is_none() {
            return Err(StoreError::NotFound);
        }
        self.db.delete(round_key(round))?;
        meta.count -= 1;
        // trimming an endpoint moves it; interior holes are skipped by reads
        if meta.first == Some(round) || meta.last == Some(round) {
            let mut first = None;
            let mut last = None;
            for entry in self.db.iterator(rocksdb::IteratorMode::Start) {
                let (key, _) = entry?;
                let r = round_from_key(&key)?;
                if first.is_none() {
                    first = Some(r);
                }
                last = Some(r);
            }
            meta.first = first;
            meta.last = last;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        let mut meta = self.meta.lock();
        meta.closed = true;
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn beacon(round: u64) -> Beacon {
        Beacon::new(round, vec![round as u8; 96], vec![0xee; 8])
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = RocksStore::open(dir.path()).unwrap();
            for round in 0..5 {
                store.put(&beacon(round)).await.unwrap();
            }
            store.close().await.unwrap();
        }
        let store = RocksStore::open(dir.path()).unwrap();
        assert_eq!(store.len().await.unwrap(), 5);
        assert_eq!(store.last().await.unwrap().round(), 4);
        assert_eq!(store.first().await.unwrap().round(), 0);
        assert_eq!(store.get(3).await.unwrap().unwrap(), beacon(3));
    }

    #[tokio::test]
    async fn enforces_round_density() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        store.put(&beacon(0)).await.unwrap();
        assert!(matches!(
            store.put(&beacon(2)).await.unwrap_err(),
            StoreError::OutOfOrder { got: 2, last: 0 }
        ));
        // duplicate append of the current head is also out of order
        assert!(store.put(&beacon(0)).await.is_err());
    }

    #[tokio::test]
    async fn del_updates_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        for round in 0..4 {
            store.put(&beacon(round)).await.unwrap();
        }
        store.del(0).await.unwrap();
        assert_eq!(store.first().await.unwrap().round(), 1);
        store.del(3).await.unwrap();
        assert_eq!(store.last().await.unwrap().round(), 2);
        assert_eq!(store.len().await.unwrap(), 2);
    }
}
