// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

//! Snapshot export and import: the whole chain as a sequence of
//! length-prefixed encoded beacons in ascending round order.

use std::io::{Read, Write};
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use lantern_chain::Beacon;

use crate::{BeaconCursor, ChainStore, StoreError};

/// Stream every beacon in view of a fresh cursor into `writer`. Returns the
/// number of beacons written.
pub async fn save_to<W: Write>(
    store: Arc<dyn ChainStore>,
    writer: &mut W,
) -> Result<u64, StoreError> {
    let mut cursor = BeaconCursor::acquire(store).await?;
    let mut written = 0u64;
    let mut item = cursor.first().await?;
    while let Some(beacon) = item {
        let encoded = beacon.encode();
        writer.write_u32::<BigEndian>(encoded.len() as u32)?;
        writer.write_all(&encoded)?;
        written += 1;
        item = cursor.next().await?;
    }
    writer.flush()?;
    Ok(written)
}

/// Append every beacon from `reader` into an empty (or matching-prefix)
/// store. Ordering violations surface as `OutOfOrder`.
pub async fn load_from<R: Read>(
    store: Arc<dyn ChainStore>,
    reader: &mut R,
) -> Result<u64, StoreError> {
    let mut loaded = 0u64;
    loop {
        let len = match reader.read_u32::<BigEndian>() {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        };
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf)?;
        let beacon =
            Beacon::decode(&buf).map_err(|e| StoreError::Corruption(e.to_string()))?;
        store.put(&beacon).await?;
        loaded += 1;
    }
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;

    #[tokio::test]
    async fn save_then_load_preserves_the_chain() {
        let source: Arc<dyn ChainStore> = Arc::new(MemoryStore::new(64));
        for round in 0..10u64 {
            let prev = vec![round as u8; 8];
            source
                .put(&Beacon::new(round, vec![round as u8; 96], prev))
                .await
                .unwrap();
        }

        let mut buf = Vec::new();
        assert_eq!(save_to(source.clone(), &mut buf).await.unwrap(), 10);

        let target: Arc<dyn ChainStore> = Arc::new(MemoryStore::new(64));
        assert_eq!(
            load_from(target.clone(), &mut buf.as_slice()).await.unwrap(),
            10
        );

        for round in 0..10u64 {
            assert_eq!(
                target.get(round).await.unwrap(),
                source.get(round).await.unwrap()
            );
        }
    }

    #[tokio::test]
    async fn truncated_snapshot_is_corruption() {
        let source: Arc<dyn ChainStore> = Arc::new(MemoryStore::new(8));
        source
            .put(&Beacon::new(0, vec![1, 2, 3], vec![]))
            .await
            .unwrap();
        let mut buf = Vec::new();
        save_to(source, &mut buf).await.unwrap();
        buf.truncate(buf.len() - 1);

        let target: Arc<dyn ChainStore> = Arc::new(MemoryStore::new(8));
        assert!(load_from(target, &mut buf.as_slice()).await.is_err());
    }
}
