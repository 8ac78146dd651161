// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

//! The DKG coordinator: an event-driven state machine per beacon-id that
//! runs initial Pedersen key generations and reshare epochs over the
//! gateway's gossip surface.

mod coordinator;
mod errors;
mod phases;
mod proposal;
mod status;

pub use self::coordinator::{
    sign_packet, Coordinator, CoordinatorConfig, DkgOutput, DkgTransport, PreviousEpoch,
};
pub use self::errors::DkgError;
pub use self::proposal::{Proposal, Role};
pub use self::status::DkgStatus;
