// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Backup and restore of cluster configuration state.
//!
//! A backup is a gzip-compressed tarball holding a snapshot of every
//! configuration-management record (clients, nodes, roles, data bags) plus
//! the platform's own on-disk files and a version marker. Restoring extracts
//! the archive into a private working directory, validates it, runs the
//! version migration chain if the archive predates the running platform,
//! and loads the records back into the live store.

pub mod archive;
pub mod backup;
pub mod config;
pub mod export;
pub mod migration;
pub mod restore;
pub mod store;

pub use backup::{Backup, BackupError, BackupStore, ValidationError};
pub use config::{Config, ConfigError};
pub use export::{Export, ExportError, ExportSummary};
pub use migration::{MigrationChain, MigrationError};
pub use restore::{Restore, RestoreError, RestoreMode, RestoreSummary};
pub use store::{
    DataBagStore, ProposalStore, RecordKind, RecordStore, StoreError,
};
