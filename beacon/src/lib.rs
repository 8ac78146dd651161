// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

//! The beacon engine: a per-chain state machine that, every period, signs
//! the round message with the local share, collects the committee's partial
//! signatures, aggregates them into the group signature, appends the beacon
//! to the chain store and wakes anything waiting on the round.

mod cache;
mod engine;
mod errors;
mod monitor;
mod sync;

pub use self::cache::{CacheOutcome, PartialCache, FUTURE_ROUND_WINDOW};
pub use self::engine::{Engine, EpochState};
pub use self::errors::EngineError;
pub use self::monitor::ThresholdMonitor;
pub use self::sync::sync_chain_from;
