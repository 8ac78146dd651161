// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::VecDeque;

use async_trait::async_trait;
use lantern_chain::Beacon;
use parking_lot::RwLock;

use crate::{ChainStore, StoreError};

/// A bounded in-memory ring of beacons. Once full, the oldest round is
/// evicted on every append; requests for evicted rounds return `NotFound`.
pub struct MemoryStore {
    inner: RwLock<Inner>,
    capacity: usize,
}

struct Inner {
    ring: VecDeque<Beacon>,
    closed: bool,
}

impl MemoryStore {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "memory store needs a non-zero bound");
        MemoryStore {
            inner: RwLock::new(Inner {
                ring: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            capacity,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore::new(crate::DEFAULT_MEMORY_CAPACITY)
    }
}

#[async_trait]
impl ChainStore for MemoryStore {
    async fn put(&self, beacon: &Beacon) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        match inner.ring.back() {
            None => {
                // an empty chain starts wherever the caller says: genesis
                // when producing, any verified round when following
            }
            Some(last) if beacon.round() == last.round() + 1 => {}
            Some(last) => {
                return Err(StoreError::OutOfOrder {
                    got: beacon.round(),
                    last: last.round(),
                });
            }
        }
        if inner.ring.len() == self.capacity {
            inner.ring.pop_front();
        }
        inner.ring.push_back(beacon.clone());
        Ok(())
    }

    async fn get(&self, round: u64) -> Result<Option<Beacon>, StoreError> {
        let inner = self.inner.read();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        let front = match inner.ring.front() {
            Some(b) => b.round(),
            None => return Ok(None),
        };
        if round < front {
            return Ok(None);
        }
        // contiguous by construction, except for trimmed rounds
        Ok(inner
            .ring
            .get((round - front) as usize)
            .filter(|b| b.round() == round)
            .or_else(|| inner.ring.iter().find(|b| b.round() == round))
            .cloned())
    }

    async fn last(&self) -> Result<Beacon, StoreError> {
        let inner = self.inner.read();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        inner.ring.back().cloned().ok_or(StoreError::NotFound)
    }

    async fn first(&self) -> Result<Beacon, StoreError> {
        let inner = self.inner.read();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        inner.ring.front().cloned().ok_or(StoreError::NotFound)
    }

    async fn len(&self) -> Result<usize, StoreError> {
        let inner = self.inner.read();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        Ok(inner.ring.len())
    }

    async fn del(&self, round: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        let pos = inner.ring.iter().position(|b| b.round() == round);
        match pos {
            Some(pos) => {
                inner.ring.remove(pos);
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.inner.write().closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn beacon(round: u64) -> Beacon {
        Beacon::new(round, vec![round as u8; 4], vec![])
    }

    #[tokio::test]
    async fn appends_in_order_only() {
        let store = MemoryStore::new(16);
        store.put(&beacon(0)).await.unwrap();
        store.put(&beacon(1)).await.unwrap();
        let err = store.put(&beacon(3)).await.unwrap_err();
        assert!(matches!(err, StoreError::OutOfOrder { got: 3, last: 1 }));
        assert_eq!(store.last().await.unwrap().round(), 1);
    }

    #[tokio::test]
    async fn evicts_oldest_at_capacity() {
        let store = MemoryStore::new(3);
        for round in 0..5 {
            store.put(&beacon(round)).await.unwrap();
        }
        assert_eq!(store.len().await.unwrap(), 3);
        assert!(store.get(0).await.unwrap().is_none());
        assert!(store.get(1).await.unwrap().is_none());
        assert_eq!(store.first().await.unwrap().round(), 2);
        assert_eq!(store.last().await.unwrap().round(), 4);
    }

    #[tokio::test]
    async fn trim_then_read_skips_the_hole() {
        let store = MemoryStore::new(16);
        for round in 0..4 {
            store.put(&beacon(round)).await.unwrap();
        }
        store.del(2).await.unwrap();
        assert!(store.get(2).await.unwrap().is_none());
        assert_eq!(store.get(3).await.unwrap().unwrap().round(), 3);
        assert!(store.del(2).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn closed_store_rejects_everything() {
        let store = MemoryStore::new(4);
        store.put(&beacon(0)).await.unwrap();
        store.close().await.unwrap();
        assert!(matches!(
            store.put(&beacon(1)).await.unwrap_err(),
            StoreError::Closed
        ));
        assert!(matches!(store.get(0).await.unwrap_err(), StoreError::Closed));
    }
}
