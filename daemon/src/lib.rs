// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

//! Daemon internals, exposed as a library so integration tests can run
//! whole nodes in-process.

pub mod config;
pub mod daemon;
pub mod process;

pub use config::Config;
pub use daemon::Daemon;
pub use process::BeaconProcess;
