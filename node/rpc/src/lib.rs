// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

//! The public read path: HTTP/JSON queries over the chain store with
//! pending-round coalescing against the engine's finalization notifier.

mod handlers;
mod state;
mod watcher;

pub use self::handlers::router;
pub use self::state::{AppState, BeaconJson, ChainHandle};
pub use self::watcher::spawn_watcher;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Serve the public API until canceled.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
}
