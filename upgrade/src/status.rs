// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The durable upgrade progress tracker.
//!
//! State lives in a JSON ledger on disk; the in-memory copy held by any one
//! [`UpgradeStatus`] instance is a cache that goes stale as soon as another
//! process commits. [`UpgradeStatus::load`] re-syncs from disk, and every
//! mutation is committed through the ledger's generation check, so two
//! processes that race to start the same step cannot both win.

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use crowbar_common::ledger::{CommitError, Ledger, Ledgerable};
use serde::{Deserialize, Serialize};
use slog::{Logger, info, o, warn};
use std::collections::BTreeMap;

use crate::steps::{StepStatus, UpgradeStep};

/// Per-step progress record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StepState {
    pub status: StepStatus,
    /// Failure messages accumulated across attempts. Retrying a failed step
    /// preserves this list as an audit trail.
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct UpgradeState {
    generation: u64,
    /// Kept in sync with the derived value on every commit so the on-disk
    /// document is self-describing; reads always use the derivation.
    current_step: UpgradeStep,
    steps: BTreeMap<UpgradeStep, StepState>,
}

impl Default for UpgradeState {
    fn default() -> Self {
        let steps = UpgradeStep::SEQUENCE
            .iter()
            .map(|step| (*step, StepState::default()))
            .collect();
        Self {
            generation: 0,
            current_step: UpgradeStep::UpgradePrechecks,
            steps,
        }
    }
}

impl Ledgerable for UpgradeState {
    fn is_newer_than(&self, other: &Self) -> bool {
        self.generation > other.generation
    }

    fn generation_bump(&mut self) {
        self.generation += 1;
    }
}

impl UpgradeState {
    fn current_step(&self) -> UpgradeStep {
        UpgradeStep::SEQUENCE
            .iter()
            .copied()
            .find(|step| {
                self.steps
                    .get(step)
                    .map(|state| state.status != StepStatus::Passed)
                    .unwrap_or(true)
            })
            .unwrap_or(UpgradeStep::Finished)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UpgradeStatusError {
    #[error("failed to persist initial upgrade state")]
    Initialize(#[source] CommitError),
}

/// Durable, multi-process-visible upgrade progress.
pub struct UpgradeStatus {
    log: Logger,
    ledger: Ledger<UpgradeState>,
}

impl UpgradeStatus {
    /// Opens the tracker backed by the state file at `path`.
    ///
    /// If no state has been persisted yet, all steps start out pending and
    /// the defaults are committed immediately, so the state file exists from
    /// this point on.
    pub fn new(
        log: &Logger,
        path: Utf8PathBuf,
    ) -> Result<Self, UpgradeStatusError> {
        let log = log.new(o!("component" => "UpgradeStatus"));
        let existed = path.exists();
        let mut ledger =
            Ledger::new_with(&log, path, UpgradeState::default());
        if !existed {
            ledger.commit().map_err(UpgradeStatusError::Initialize)?;
        }
        Ok(Self { log, ledger })
    }

    /// The first step in sequence order that has not passed, or `Finished`
    /// once every step has.
    pub fn current_step(&self) -> UpgradeStep {
        self.ledger.data().current_step()
    }

    /// State of the current step; `None` once the upgrade is finished.
    pub fn current_step_state(&self) -> Option<&StepState> {
        self.step_state(self.current_step())
    }

    pub fn step_state(&self, step: UpgradeStep) -> Option<&StepState> {
        self.ledger.data().steps.get(&step)
    }

    pub fn pending(&self) -> bool {
        self.step_pending(self.current_step())
    }

    pub fn step_pending(&self, step: UpgradeStep) -> bool {
        self.step_has_status(step, StepStatus::Pending)
    }

    pub fn running(&self) -> bool {
        self.step_running(self.current_step())
    }

    pub fn step_running(&self, step: UpgradeStep) -> bool {
        self.step_has_status(step, StepStatus::Running)
    }

    pub fn finished(&self) -> bool {
        self.current_step() == UpgradeStep::Finished
    }

    /// Starts the current step.
    ///
    /// Returns true iff the step was startable (pending, or failed and being
    /// retried) and the transition was durably committed. Returns false with
    /// no state change if the step is already running, the upgrade is
    /// finished, or another process committed first.
    pub fn start_step(&mut self) -> bool {
        let step = self.current_step();
        if step == UpgradeStep::Finished {
            return false;
        }
        let Some(state) = self.ledger.data_mut().steps.get_mut(&step) else {
            return false;
        };
        match state.status {
            StepStatus::Pending | StepStatus::Failed => {
                state.status = StepStatus::Running;
                state.started_at = Some(Utc::now());
                state.finished_at = None;
                self.commit_or_resync(step)
            }
            StepStatus::Running | StepStatus::Passed => false,
        }
    }

    /// Ends the current step.
    ///
    /// Requires the step to be running. On success the step passes and the
    /// current step advances; returns true. On failure the step is marked
    /// failed with `failure` appended to its error list, the current step
    /// does not advance, and the call returns false (the failure is still
    /// persisted).
    pub fn end_step(&mut self, success: bool, failure: Option<&str>) -> bool {
        let step = self.current_step();
        if step == UpgradeStep::Finished {
            return false;
        }
        let Some(state) = self.ledger.data_mut().steps.get_mut(&step) else {
            return false;
        };
        if state.status != StepStatus::Running {
            return false;
        }
        state.finished_at = Some(Utc::now());
        if success {
            state.status = StepStatus::Passed;
            self.commit_or_resync(step)
        } else {
            state.status = StepStatus::Failed;
            if let Some(failure) = failure {
                state.errors.push(failure.to_string());
            }
            self.commit_or_resync(step);
            false
        }
    }

    /// Re-reads persisted state, overwriting this instance's in-memory copy.
    /// This is how one process observes another's committed progress.
    pub fn load(&mut self) {
        let log = self.log.clone();
        let path = self.ledger.path().clone();
        let current = self.ledger.data().clone();
        self.ledger = Ledger::new_with(&log, path, current);
    }

    pub fn path(&self) -> &Utf8PathBuf {
        self.ledger.path()
    }

    fn step_has_status(&self, step: UpgradeStep, status: StepStatus) -> bool {
        self.step_state(step)
            .map(|state| state.status == status)
            .unwrap_or(false)
    }

    fn commit_or_resync(&mut self, step: UpgradeStep) -> bool {
        let current = self.ledger.data().current_step();
        self.ledger.data_mut().current_step = current;
        match self.ledger.commit() {
            Ok(()) => {
                info!(
                    self.log,
                    "committed step transition";
                    "step" => %step,
                );
                true
            }
            Err(err) => {
                warn!(
                    self.log,
                    "step transition lost";
                    "step" => %step,
                    "error" => %err,
                );
                // Drop the local mutation and pick up whatever won.
                self.load();
                false
            }
        }
    }
}
