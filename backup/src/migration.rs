// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The version migration chain.
//!
//! When a backup was taken on an older platform than the one restoring it,
//! the extracted working tree must be transformed before any record is
//! loaded. A chain is resolved purely from the `(from, to)` version pair
//! against a static registry, so the set of transformations applied is
//! explicit and testable.
//!
//! Every step is idempotent: applying it to a tree that is already in the
//! target format is a no-op. Steps work file by file; a failure on one file
//! aborts the chain but leaves files already migrated in their (valid)
//! target form.

use camino::{Utf8Path, Utf8PathBuf};
use crowbar_common::version::PlatformVersion;
use slog::{Logger, debug, info};

type StepFn = fn(&Logger, &Utf8Path) -> Result<(), MigrationError>;

/// One named transformation of the extracted working tree.
pub struct MigrationStep {
    pub name: &'static str,
    run: StepFn,
}

/// Registry of migrations: each entry upgrades trees from `from` to `to`.
struct RegisteredMigration {
    from: PlatformVersion,
    to: PlatformVersion,
    steps: &'static [MigrationStep],
}

static REGISTRY: &[RegisteredMigration] = &[RegisteredMigration {
    from: PlatformVersion::new(5, 0),
    to: PlatformVersion::new(6, 0),
    steps: &[
        MigrationStep {
            name: "drop-barclamp-databags",
            run: drop_barclamp_databags,
        },
        MigrationStep {
            name: "rename-nova-dashboard",
            run: rename_nova_dashboard,
        },
        MigrationStep { name: "strip-bc-prefix", run: strip_bc_prefix },
    ],
}];

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("cannot migrate {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("rename collision migrating {from} to {to}")]
    RenameCollision { from: Utf8PathBuf, to: Utf8PathBuf },
}

/// The ordered transformations needed to bring a `from`-version tree into
/// `to`-version form.
pub struct MigrationChain {
    from: PlatformVersion,
    to: PlatformVersion,
    steps: Vec<&'static MigrationStep>,
}

impl MigrationChain {
    /// Resolve the chain for a version pair. Registered migrations apply
    /// when their whole span lies within `(from, to]`.
    pub fn resolve(from: PlatformVersion, to: PlatformVersion) -> Self {
        let steps = REGISTRY
            .iter()
            .filter(|m| m.from >= from && m.to <= to)
            .flat_map(|m| m.steps.iter())
            .collect();
        Self { from, to, steps }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|step| step.name).collect()
    }

    /// Apply every step, in order, to the extracted tree at `workdir`.
    pub fn apply(
        &self,
        log: &Logger,
        workdir: &Utf8Path,
    ) -> Result<(), MigrationError> {
        info!(
            log,
            "running migration chain";
            "from" => %self.from,
            "to" => %self.to,
            "steps" => self.steps.len(),
        );
        for step in &self.steps {
            debug!(log, "running migration step"; "step" => step.name);
            (step.run)(log, workdir)?;
        }
        Ok(())
    }
}

fn proposal_dir(workdir: &Utf8Path) -> Utf8PathBuf {
    workdir.join("knife").join("data_bags").join("crowbar")
}

/// The `barclamps` data bag is generated from installed barclamps and must
/// not be carried across an upgrade.
fn drop_barclamp_databags(
    _log: &Logger,
    workdir: &Utf8Path,
) -> Result<(), MigrationError> {
    let dir = workdir.join("knife").join("data_bags").join("barclamps");
    match std::fs::remove_dir_all(&dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(MigrationError::Io { path: dir, err }),
    }
}

/// The `nova_dashboard` barclamp became `horizon`: rename proposal files and
/// rewrite references inside their content.
fn rename_nova_dashboard(
    log: &Logger,
    workdir: &Utf8Path,
) -> Result<(), MigrationError> {
    rewrite_proposals(log, &proposal_dir(workdir), "nova_dashboard", "horizon")
}

/// Early versions prefixed proposal filenames (and the references inside
/// them) with `bc-`; the prefix convention was dropped.
fn strip_bc_prefix(
    log: &Logger,
    workdir: &Utf8Path,
) -> Result<(), MigrationError> {
    rewrite_proposals(log, &proposal_dir(workdir), "bc-", "")
}

/// Rename every proposal file containing `old` in its name and substitute
/// `old` with `new` in its content. Files already in the new form are left
/// alone, which is what makes the step idempotent.
fn rewrite_proposals(
    log: &Logger,
    dir: &Utf8Path,
    old: &str,
    new: &str,
) -> Result<(), MigrationError> {
    let entries = match dir.read_dir_utf8() {
        Ok(entries) => entries,
        // No proposals in this archive; nothing to migrate.
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(());
        }
        Err(err) => {
            return Err(MigrationError::Io { path: dir.to_owned(), err })
        }
    };

    for entry in entries {
        let entry = entry.map_err(|err| MigrationError::Io {
            path: dir.to_owned(),
            err,
        })?;
        let filename = entry.file_name().to_string();
        if !filename.ends_with(".json") || !filename.contains(old) {
            continue;
        }

        let source = entry.path().to_owned();
        let target = dir.join(filename.replace(old, new));
        if target.exists() {
            return Err(MigrationError::RenameCollision {
                from: source,
                to: target,
            });
        }

        let io_err = |path: &Utf8PathBuf, err| MigrationError::Io {
            path: path.clone(),
            err,
        };
        let contents = std::fs::read_to_string(&source)
            .map_err(|err| io_err(&source, err))?;
        std::fs::write(&target, contents.replace(old, new))
            .map_err(|err| io_err(&target, err))?;
        std::fs::remove_file(&source)
            .map_err(|err| io_err(&source, err))?;
        debug!(
            log,
            "migrated proposal file";
            "from" => %source,
            "to" => %target,
        );
    }
    Ok(())
}
