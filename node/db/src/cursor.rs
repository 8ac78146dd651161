// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::Arc;

use lantern_chain::Beacon;

use crate::{ChainStore, StoreError};

/// Ascending, single-pass iteration over a store.
///
/// The upper round bound is captured at acquisition, so appends that land
/// while the cursor is open are not observed; re-acquire to see them.
pub struct BeaconCursor {
    store: Arc<dyn ChainStore>,
    /// Highest round visible to this cursor; `None` for an empty store.
    bound: Option<u64>,
    lowest: u64,
    position: Option<u64>,
}

impl BeaconCursor {
    pub async fn acquire(store: Arc<dyn ChainStore>) -> Result<Self, StoreError> {
        let (bound, lowest) = match store.last().await {
            Ok(last) => {
                let first = store.first().await?;
                (Some(last.round()), first.round())
            }
            Err(e) if e.is_not_found() => (None, 0),
            Err(e) => return Err(e),
        };
        Ok(BeaconCursor {
            store,
            bound,
            lowest,
            position: None,
        })
    }

    /// The lowest beacon in view; restarts the traversal.
    pub async fn first(&mut self) -> Result<Option<Beacon>, StoreError> {
        self.position = None;
        self.advance_from(self.lowest).await
    }

    /// The next beacon after the current position, skipping trimmed rounds.
    pub async fn next(&mut self) -> Result<Option<Beacon>, StoreError> {
        match self.position {
            None => self.first().await,
            Some(pos) => self.advance_from(pos + 1).await,
        }
    }

    /// Position at `round` exactly; `None` if absent or out of view.
    pub async fn seek(&mut self, round: u64) -> Result<Option<Beacon>, StoreError> {
        match self.bound {
            Some(bound) if round <= bound => {}
            _ => return Ok(None),
        }
        let found = self.store.get(round).await?;
        if found.is_some() {
            self.position = Some(round);
        }
        Ok(found)
    }

    /// The highest beacon in view.
    pub async fn last(&mut self) -> Result<Option<Beacon>, StoreError> {
        match self.bound {
            None => Ok(None),
            Some(bound) => {
                self.position = Some(bound);
                self.store.get(bound).await
            }
        }
    }

    async fn advance_from(&mut self, mut round: u64) -> Result<Option<Beacon>, StoreError> {
        let bound = match self.bound {
            Some(bound) => bound,
            None => return Ok(None),
        };
        while round <= bound {
            if let Some(beacon) = self.store.get(round).await? {
                self.position = Some(round);
                return Ok(Some(beacon));
            }
            round += 1;
        }
        self.position = Some(bound);
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;

    fn beacon(round: u64) -> Beacon {
        Beacon::new(round, vec![round as u8], vec![])
    }

    async fn store_with(rounds: u64) -> Arc<dyn ChainStore> {
        let store = Arc::new(MemoryStore::new(64));
        for round in 0..=rounds {
            store.put(&beacon(round)).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn iterates_ascending_and_terminates() {
        let store = store_with(4).await;
        let mut cursor = BeaconCursor::acquire(store).await.unwrap();
        let mut seen = Vec::new();
        let mut item = cursor.first().await.unwrap();
        while let Some(beacon) = item {
            seen.push(beacon.round());
            item = cursor.next().await.unwrap();
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn snapshot_hides_concurrent_appends() {
        let store = store_with(2).await;
        let mut cursor = BeaconCursor::acquire(store.clone()).await.unwrap();
        store.put(&beacon(3)).await.unwrap();

        assert_eq!(cursor.last().await.unwrap().unwrap().round(), 2);
        assert!(cursor.seek(3).await.unwrap().is_none());

        // a fresh cursor sees the append
        let mut fresh = BeaconCursor::acquire(store).await.unwrap();
        assert_eq!(fresh.last().await.unwrap().unwrap().round(), 3);
    }

    #[tokio::test]
    async fn seek_and_restart() {
        let store = store_with(5).await;
        let mut cursor = BeaconCursor::acquire(store).await.unwrap();
        assert_eq!(cursor.seek(3).await.unwrap().unwrap().round(), 3);
        assert_eq!(cursor.next().await.unwrap().unwrap().round(), 4);
        assert_eq!(cursor.first().await.unwrap().unwrap().round(), 0);
    }

    #[tokio::test]
    async fn skips_trimmed_rounds() {
        let store = store_with(4).await;
        store.del(2).await.unwrap();
        let mut cursor = BeaconCursor::acquire(store).await.unwrap();
        cursor.seek(1).await.unwrap().unwrap();
        assert_eq!(cursor.next().await.unwrap().unwrap().round(), 3);
    }

    #[tokio::test]
    async fn empty_store_yields_nothing() {
        let store: Arc<dyn ChainStore> = Arc::new(MemoryStore::new(8));
        let mut cursor = BeaconCursor::acquire(store).await.unwrap();
        assert!(cursor.first().await.unwrap().is_none());
        assert!(cursor.last().await.unwrap().is_none());
        assert!(cursor.next().await.unwrap().is_none());
    }
}
