// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::state::ChainHandle;

/// Ceiling of the resubscribe backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Follow a chain's finalization stream on behalf of the read path: log
/// gaps (a resynced or lagged chain invalidates any cached view of
/// `latest`) and resubscribe with bounded backoff when the stream lags or
/// closes.
pub fn spawn_watcher(
    handle: Arc<ChainHandle>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff = Duration::from_millis(250);
        let mut last_seen = handle.latest_round();
        loop {
            let mut stream = handle.engine().subscribe_finalized();
            loop {
                let beacon = tokio::select! {
                    _ = cancel.cancelled() => return,
                    item = stream.recv() => item,
                };
                match beacon {
                    Ok(beacon) => {
                        backoff = Duration::from_millis(250);
                        if last_seen != 0 && beacon.round() != last_seen + 1 {
                            debug!(
                                chain = %handle.hash_hex(),
                                from = last_seen,
                                to = beacon.round(),
                                "watch stream skipped rounds; latest re-read from store"
                            );
                        }
                        last_seen = beacon.round();
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(
                            chain = %handle.hash_hex(),
                            missed,
                            "watch stream lagged; resubscribing"
                        );
                        last_seen = handle.latest_round();
                        break;
                    }
                    Err(RecvError::Closed) => return,
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    })
}
