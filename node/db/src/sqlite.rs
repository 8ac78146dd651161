// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::str::FromStr;

use async_trait::async_trait;
use lantern_chain::Beacon;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::{ChainStore, StoreError};

/// Relational backend: beacons of every chain share one table with a
/// `(beacon_id, round)` primary key.
pub struct SqliteStore {
    pool: SqlitePool,
    beacon_id: String,
}

impl SqliteStore {
    pub async fn open(url: &str, beacon_id: &str) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::from_str(url)
            .map_err(|e| StoreError::Io(e.to_string()))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS beacons (
                beacon_id     TEXT    NOT NULL,
                round         INTEGER NOT NULL,
                signature     BLOB    NOT NULL,
                previous_sig  BLOB    NOT NULL,
                PRIMARY KEY (beacon_id, round)
            )",
        )
        .execute(&pool)
        .await?;
        Ok(SqliteStore {
            pool,
            beacon_id: beacon_id.to_owned(),
        })
    }

    fn closed_err(&self) -> Option<StoreError> {
        self.pool.is_closed().then_some(StoreError::Closed)
    }
}

#[async_trait]
impl ChainStore for SqliteStore {
    async fn put(&self, beacon: &Beacon) -> Result<(), StoreError> {
        if let Some(e) = self.closed_err() {
            return Err(e);
        }
        let mut tx = self.pool.begin().await?;
        let last: Option<i64> =
            sqlx::query_scalar("SELECT MAX(round) FROM beacons WHERE beacon_id = ?1")
                .bind(&self.beacon_id)
                .fetch_one(&mut *tx)
                .await?;
        if let Some(last) = last {
            if beacon.round() != last as u64 + 1 {
                return Err(StoreError::OutOfOrder {
                    got: beacon.round(),
                    last: last as u64,
                });
            }
        }
        sqlx::query(
            "INSERT INTO beacons (beacon_id, round, signature, previous_sig)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&self.beacon_id)
        .bind(beacon.round() as i64)
        .bind(beacon.signature())
        .bind(beacon.previous_signature())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, round: u64) -> Result<Option<Beacon>, StoreError> {
        if let Some(e) = self.closed_err() {
            return Err(e);
        }
        let row = sqlx::query(
            "SELECT signature, previous_sig FROM beacons
             WHERE beacon_id = ?1 AND round = ?2",
        )
        .bind(&self.beacon_id)
        .bind(round as i64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| {
            Beacon::new(
                round,
                row.get::<Vec<u8>, _>("signature"),
                row.get::<Vec<u8>, _>("previous_sig"),
            )
        }))
    }

    async fn last(&self) -> Result<Beacon, StoreError> {
        self.endpoint(false).await
    }

    async fn first(&self) -> Result<Beacon, StoreError> {
        self.endpoint(true).await
    }

    async fn len(&self) -> Result<usize, StoreError> {
        if let Some(e) = self.closed_err() {
            return Err(e);
        }
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM beacons WHERE beacon_id = ?1")
                .bind(&self.beacon_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as usize)
    }

    async fn del(&self, round: u64) -> Result<(), StoreError> {
        if let Some(e) = self.closed_err() {
            return Err(e);
        }
        let result = sqlx::query("DELETE FROM beacons WHERE beacon_id = ?1 AND round = ?2")
            .bind(&self.beacon_id)
            .bind(round as i64)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.pool.close().await;
        Ok(())
    }
}

impl SqliteStore {
    async fn endpoint(&self, ascending: bool) -> Result<Beacon, StoreError> {
        if let Some(e) = self.closed_err() {
            return Err(e);
        }
        let query = format!(
            "SELECT round, signature, previous_sig FROM beacons
             WHERE beacon_id = ?1
             ORDER BY round {}
             LIMIT 1",
            if ascending { "ASC" } else { "DESC" }
        );
        let row = sqlx::query(&query)
            .bind(&self.beacon_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound)?;
        Ok(Beacon::new(
            row.get::<i64, _>("round") as u64,
            row.get::<Vec<u8>, _>("signature"),
            row.get::<Vec<u8>, _>("previous_sig"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_temp() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("chain.db").display());
        let store = SqliteStore::open(&url, "default").await.unwrap();
        (dir, store)
    }

    fn beacon(round: u64) -> Beacon {
        Beacon::new(round, vec![round as u8; 96], vec![0xaa; 8])
    }

    #[tokio::test]
    async fn put_get_and_order_enforcement() {
        let (_dir, store) = open_temp().await;
        store.put(&beacon(0)).await.unwrap();
        store.put(&beacon(1)).await.unwrap();
        assert!(matches!(
            store.put(&beacon(5)).await.unwrap_err(),
            StoreError::OutOfOrder { got: 5, last: 1 }
        ));
        assert_eq!(store.get(1).await.unwrap().unwrap(), beacon(1));
        assert!(store.get(7).await.unwrap().is_none());
        assert_eq!(store.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn chains_are_isolated_by_beacon_id() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("chain.db").display());
        let a = SqliteStore::open(&url, "chain-a").await.unwrap();
        let b = SqliteStore::open(&url, "chain-b").await.unwrap();
        a.put(&beacon(0)).await.unwrap();
        assert!(b.get(0).await.unwrap().is_none());
        assert_eq!(b.len().await.unwrap(), 0);
    }
}
