// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

//! Domain primitives shared across the Lantern node: beacons, partial
//! beacons, the committee group, chain metadata and the round clock.

mod beacon;
mod clock;
mod errors;
mod group;
mod info;
pub mod proto;

pub use self::beacon::Beacon;
pub use self::clock::RoundClock;
pub use self::errors::BeaconError;
pub use self::group::{minimum_threshold, Group, GroupToml, Node};
pub use self::info::ChainInfo;
