// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The fixed, globally ordered upgrade step sequence.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One stage of the cluster upgrade workflow.
///
/// The order of [`UpgradeStep::SEQUENCE`] is the order steps run in;
/// `Finished` is a terminal marker rather than a runnable step and is
/// deliberately absent from the sequence.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeStep {
    UpgradePrechecks,
    UpgradePrepare,
    AdminBackup,
    AdminRepoChecks,
    AdminUpgrade,
    Database,
    NodesRepoChecks,
    NodesServices,
    NodesDbDump,
    NodesUpgrade,
    Finished,
}

impl UpgradeStep {
    pub const SEQUENCE: [UpgradeStep; 10] = [
        UpgradeStep::UpgradePrechecks,
        UpgradeStep::UpgradePrepare,
        UpgradeStep::AdminBackup,
        UpgradeStep::AdminRepoChecks,
        UpgradeStep::AdminUpgrade,
        UpgradeStep::Database,
        UpgradeStep::NodesRepoChecks,
        UpgradeStep::NodesServices,
        UpgradeStep::NodesDbDump,
        UpgradeStep::NodesUpgrade,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            UpgradeStep::UpgradePrechecks => "upgrade_prechecks",
            UpgradeStep::UpgradePrepare => "upgrade_prepare",
            UpgradeStep::AdminBackup => "admin_backup",
            UpgradeStep::AdminRepoChecks => "admin_repo_checks",
            UpgradeStep::AdminUpgrade => "admin_upgrade",
            UpgradeStep::Database => "database",
            UpgradeStep::NodesRepoChecks => "nodes_repo_checks",
            UpgradeStep::NodesServices => "nodes_services",
            UpgradeStep::NodesDbDump => "nodes_db_dump",
            UpgradeStep::NodesUpgrade => "nodes_upgrade",
            UpgradeStep::Finished => "finished",
        }
    }
}

impl fmt::Display for UpgradeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Status of a single step's local sub-machine.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Passed,
    Failed,
}
