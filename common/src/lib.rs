// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared types for the Crowbar admin plane: the platform version and the
//! durable ledger used to persist state across processes.

pub mod ledger;
pub mod version;
