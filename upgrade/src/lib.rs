// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Durable tracking of cluster upgrade progress.
//!
//! The upgrade workflow is a fixed sequence of named steps. Progress through
//! them is persisted after every transition so that a crash never loses a
//! committed step, and so independent processes (one per request handler)
//! can observe each other's progress by reloading the persisted state.

mod status;
mod steps;

pub use status::{StepState, UpgradeStatus, UpgradeStatusError};
pub use steps::{StepStatus, UpgradeStep};
