// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Restoring a backup archive into the live store.
//!
//! A restore session owns a private working directory derived from the
//! archive's base name. The pipeline is prepare (extract), validate
//! (fail fast on corrupt or foreign archives), optionally migrate (when the
//! archive predates the running platform), restore (load records), and
//! cleanup. Cleanup is the caller's obligation on every exit path, success
//! or failure; [`Restore::cleanup`] is infallible and idempotent.

use camino::{Utf8Path, Utf8PathBuf};
use crowbar_common::version::{PlatformVersion, VersionError};
use regex::Regex;
use slog::{Logger, info, o, warn};
use std::sync::LazyLock;
use walkdir::WalkDir;

use crate::archive::{self, ArchiveError};
use crate::config::Config;
use crate::migration::{MigrationChain, MigrationError};
use crate::store::{ProposalStore, RecordKind, RecordStore};

// `<barclamp>-<instance>.json`, both halves word characters.
static PROPOSAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\A(\w+)-(\w+)\.json\z").unwrap());

/// Which subset of recovered proposals to re-materialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestoreMode {
    /// Everything.
    #[default]
    Complete,
    /// Only proposals for core barclamps.
    Crowbar,
    /// Only proposals for non-core barclamps.
    Openstack,
}

impl RestoreMode {
    fn admits(&self, config: &Config, barclamp: &str) -> bool {
        match self {
            RestoreMode::Complete => true,
            RestoreMode::Crowbar => config.is_core_barclamp(barclamp),
            RestoreMode::Openstack => !config.is_core_barclamp(barclamp),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RestoreError {
    #[error("restore working directory {path} already exists")]
    WorkdirExists { path: Utf8PathBuf },

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("I/O error on {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("archive has no version marker")]
    MissingVersionMarker,

    #[error("archive version marker is unreadable")]
    BadVersionMarker(#[source] VersionError),

    #[error("unexpected non-JSON file in archive: {path}")]
    NonJsonFile { path: Utf8PathBuf },

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error("restore session has been cleaned up")]
    CleanedUp,
}

/// What a restore loaded, including the files it had to skip.
#[derive(Debug, Default)]
pub struct RestoreSummary {
    pub proposals: usize,
    pub records: usize,
    pub skipped: Vec<String>,
}

/// One restore session over an extracted archive.
pub struct Restore<'a, S> {
    log: Logger,
    config: &'a Config,
    store: &'a S,
    mode: RestoreMode,
    workdir: Option<Utf8PathBuf>,
}

impl<'a, S: RecordStore + ProposalStore> Restore<'a, S> {
    /// Extract `archive` into a fresh working directory.
    ///
    /// The directory name is derived from the archive's base name, so two
    /// concurrent restores of the same archive collide here rather than
    /// silently sharing state. A failed extraction removes the directory
    /// before returning.
    pub fn prepare(
        log: &Logger,
        config: &'a Config,
        store: &'a S,
        archive_path: &Utf8Path,
        mode: RestoreMode,
    ) -> Result<Self, RestoreError> {
        let log = log.new(o!("component" => "Restore"));
        let base = archive_path
            .file_name()
            .unwrap_or("backup")
            .trim_end_matches(".tar.gz");
        let workdir = config.restore_root.join(base);

        std::fs::create_dir_all(&config.restore_root).map_err(|err| {
            RestoreError::Io { path: config.restore_root.clone(), err }
        })?;
        match std::fs::create_dir(&workdir) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(RestoreError::WorkdirExists { path: workdir });
            }
            Err(err) => {
                return Err(RestoreError::Io { path: workdir, err });
            }
        }

        if let Err(err) = archive::extract(archive_path, &workdir) {
            let _ = std::fs::remove_dir_all(&workdir);
            return Err(err.into());
        }

        info!(
            log,
            "prepared restore session";
            "archive" => %archive_path,
            "workdir" => %workdir,
        );
        Ok(Self { log, config, store, mode, workdir: Some(workdir) })
    }

    pub fn workdir(&self) -> Option<&Utf8Path> {
        self.workdir.as_deref()
    }

    pub fn mode(&self) -> RestoreMode {
        self.mode
    }

    /// The version embedded in the archive's `crowbar/version` marker.
    pub fn archive_version(&self) -> Result<PlatformVersion, RestoreError> {
        let workdir = self.require_workdir()?;
        let marker = workdir.join("crowbar").join("version");
        let contents = match std::fs::read_to_string(&marker) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(RestoreError::MissingVersionMarker);
            }
            Err(err) => return Err(RestoreError::Io { path: marker, err }),
        };
        PlatformVersion::from_marker(&contents)
            .map_err(RestoreError::BadVersionMarker)
    }

    /// Fail-fast structural validation, required before migration or load.
    ///
    /// The archive must carry a readable version marker and every file under
    /// its `knife/` tree must be a `.json` record.
    pub fn validate(&self) -> Result<(), RestoreError> {
        let workdir = self.require_workdir()?;
        self.archive_version()?;

        let knife = workdir.join("knife");
        for entry in WalkDir::new(&knife).min_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) if err.io_error().map(|e| e.kind())
                    == Some(std::io::ErrorKind::NotFound) =>
                {
                    // No knife tree at all; an empty backup is structurally
                    // valid.
                    break;
                }
                Err(err) => {
                    return Err(RestoreError::Io {
                        path: knife.clone(),
                        err: err.into(),
                    });
                }
            };
            if entry.file_type().is_dir() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                return Err(RestoreError::NonJsonFile {
                    path: Utf8PathBuf::from(path.display().to_string()),
                });
            }
        }
        Ok(())
    }

    /// True iff the running platform is newer than the archive, i.e. the
    /// migration chain must run before records are loaded.
    pub fn needs_upgrade(
        &self,
        running: PlatformVersion,
    ) -> Result<bool, RestoreError> {
        Ok(running > self.archive_version()?)
    }

    /// Run the migration chain for the archive-to-running version gap,
    /// transforming the extracted tree in place.
    pub fn upgrade(
        &self,
        running: PlatformVersion,
    ) -> Result<(), RestoreError> {
        let workdir = self.require_workdir()?.to_owned();
        let from = self.archive_version()?;
        let chain = MigrationChain::resolve(from, running);
        chain.apply(&self.log, &workdir)?;
        Ok(())
    }

    /// Load the (possibly migrated) records into the live store.
    ///
    /// Proposals come from `knife/data_bags/crowbar/`, filtered by mode;
    /// template files are never imported. Record files that fail to parse
    /// or save are logged and skipped.
    pub fn restore(&self) -> Result<RestoreSummary, RestoreError> {
        let workdir = self.require_workdir()?.to_owned();
        let mut summary = RestoreSummary::default();
        self.restore_proposals(&workdir, &mut summary)?;
        for kind in [RecordKind::Node, RecordKind::Role, RecordKind::Client] {
            self.restore_records(&workdir, kind, &mut summary)?;
        }
        info!(
            self.log,
            "restore complete";
            "proposals" => summary.proposals,
            "records" => summary.records,
            "skipped" => summary.skipped.len(),
        );
        Ok(summary)
    }

    /// Remove the working directory. Always safe to call, including after a
    /// failed restore or a second time.
    pub fn cleanup(&mut self) {
        if let Some(workdir) = self.workdir.take() {
            if let Err(err) = std::fs::remove_dir_all(&workdir) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(
                        self.log,
                        "failed to remove restore working directory";
                        "workdir" => %workdir,
                        "error" => %err,
                    );
                }
            }
        }
    }

    fn restore_proposals(
        &self,
        workdir: &Utf8Path,
        summary: &mut RestoreSummary,
    ) -> Result<(), RestoreError> {
        let dir = workdir.join("knife").join("data_bags").join("crowbar");
        let entries = match dir.read_dir_utf8() {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(());
            }
            Err(err) => return Err(RestoreError::Io { path: dir, err }),
        };

        for entry in entries {
            let entry = entry.map_err(|err| RestoreError::Io {
                path: dir.clone(),
                err,
            })?;
            let filename = entry.file_name();
            let Some(captures) = PROPOSAL_RE.captures(filename) else {
                continue;
            };
            if filename.starts_with("template-") {
                continue;
            }
            let barclamp = captures.get(1).unwrap().as_str();
            let instance = captures.get(2).unwrap().as_str();
            if !self.mode.admits(self.config, barclamp) {
                continue;
            }

            let properties = match read_json(entry.path()) {
                Ok(properties) => properties,
                Err(err) => {
                    warn!(
                        self.log,
                        "failed to parse proposal, skipping";
                        "file" => filename,
                        "error" => %err,
                    );
                    summary.skipped.push(filename.to_string());
                    continue;
                }
            };
            match self.store.create_proposal(barclamp, instance, properties)
            {
                Ok(()) => summary.proposals += 1,
                Err(err) => {
                    warn!(
                        self.log,
                        "failed to create proposal, skipping";
                        "file" => filename,
                        "error" => %err,
                    );
                    summary.skipped.push(filename.to_string());
                }
            }
        }
        Ok(())
    }

    fn restore_records(
        &self,
        workdir: &Utf8Path,
        kind: RecordKind,
        summary: &mut RestoreSummary,
    ) -> Result<(), RestoreError> {
        let dir = workdir.join("knife").join(kind.dir_name());
        let entries = match dir.read_dir_utf8() {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(());
            }
            Err(err) => return Err(RestoreError::Io { path: dir, err }),
        };

        for entry in entries {
            let entry = entry.map_err(|err| RestoreError::Io {
                path: dir.clone(),
                err,
            })?;
            let Some(name) = entry.file_name().strip_suffix(".json") else {
                continue;
            };

            let record = match read_json(entry.path()) {
                Ok(record) => record,
                Err(err) => {
                    warn!(
                        self.log,
                        "failed to parse record, skipping";
                        "kind" => %kind,
                        "name" => name,
                        "error" => %err,
                    );
                    summary.skipped.push(format!("{kind}/{name}"));
                    continue;
                }
            };
            match self.store.save(kind, name, &record) {
                Ok(()) => summary.records += 1,
                Err(err) => {
                    warn!(
                        self.log,
                        "failed to save record, skipping";
                        "kind" => %kind,
                        "name" => name,
                        "error" => %err,
                    );
                    summary.skipped.push(format!("{kind}/{name}"));
                }
            }
        }
        Ok(())
    }

    fn require_workdir(&self) -> Result<&Utf8Path, RestoreError> {
        self.workdir.as_deref().ok_or(RestoreError::CleanedUp)
    }
}

fn read_json(path: &Utf8Path) -> Result<serde_json::Value, std::io::Error> {
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::mem::MemStore;
    use camino_tempfile::Utf8TempDir;
    use serde_json::json;

    fn log() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn write(path: &Utf8Path, contents: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    /// Builds a well-formed archive tree and compresses it, returning the
    /// archive path.
    fn build_archive(
        root: &Utf8Path,
        name: &str,
        version: &str,
        extra: &[(&str, &str)],
    ) -> Utf8PathBuf {
        let tree = root.join(format!("{name}-tree"));
        write(&tree.join("crowbar/version"), &format!("{version}\n"));
        for (rel, contents) in extra {
            write(&tree.join(rel), contents);
        }
        let archive_path = root.join(format!("{name}.tar.gz"));
        archive::compress(&tree, &archive_path).unwrap();
        std::fs::remove_dir_all(&tree).unwrap();
        archive_path
    }

    fn test_config(root: &Utf8Path) -> Config {
        Config {
            restore_root: root.join("restore"),
            ..Config::default()
        }
    }

    #[test]
    fn prepare_rejects_colliding_sessions() {
        let dir = Utf8TempDir::new().unwrap();
        let config = test_config(dir.path());
        let store = MemStore::new();
        let archive_path =
            build_archive(dir.path(), "b-20230101-120000", "6.0", &[]);

        let mut first = Restore::prepare(
            &log(),
            &config,
            &store,
            &archive_path,
            RestoreMode::Complete,
        )
        .unwrap();
        assert!(matches!(
            Restore::prepare(
                &log(),
                &config,
                &store,
                &archive_path,
                RestoreMode::Complete,
            ),
            Err(RestoreError::WorkdirExists { .. })
        ));
        first.cleanup();
    }

    #[test]
    fn validate_passes_well_formed_archives() {
        let dir = Utf8TempDir::new().unwrap();
        let config = test_config(dir.path());
        let store = MemStore::new();
        let archive_path = build_archive(
            dir.path(),
            "b-20230101-120000",
            "6.0",
            &[("knife/nodes/node1.json", "{}")],
        );

        let mut restore = Restore::prepare(
            &log(),
            &config,
            &store,
            &archive_path,
            RestoreMode::Complete,
        )
        .unwrap();
        restore.validate().unwrap();
        assert_eq!(
            restore.archive_version().unwrap(),
            PlatformVersion::new(6, 0)
        );
        restore.cleanup();
    }

    #[test]
    fn validate_rejects_missing_version_marker() {
        let dir = Utf8TempDir::new().unwrap();
        let config = test_config(dir.path());
        let store = MemStore::new();

        let tree = dir.path().join("tree");
        write(&tree.join("knife/nodes/node1.json"), "{}");
        let archive_path = dir.path().join("noversion.tar.gz");
        archive::compress(&tree, &archive_path).unwrap();

        let mut restore = Restore::prepare(
            &log(),
            &config,
            &store,
            &archive_path,
            RestoreMode::Complete,
        )
        .unwrap();
        assert!(matches!(
            restore.validate(),
            Err(RestoreError::MissingVersionMarker)
        ));
        restore.cleanup();
    }

    #[test]
    fn validate_rejects_non_json_files() {
        let dir = Utf8TempDir::new().unwrap();
        let config = test_config(dir.path());
        let store = MemStore::new();
        let archive_path = build_archive(
            dir.path(),
            "b-20230101-120000",
            "6.0",
            &[
                ("knife/nodes/node1.json", "{}"),
                ("knife/nodes/notes.txt", "oops"),
            ],
        );

        let mut restore = Restore::prepare(
            &log(),
            &config,
            &store,
            &archive_path,
            RestoreMode::Complete,
        )
        .unwrap();
        assert!(matches!(
            restore.validate(),
            Err(RestoreError::NonJsonFile { .. })
        ));
        restore.cleanup();
    }

    #[test]
    fn needs_upgrade_compares_versions() {
        let dir = Utf8TempDir::new().unwrap();
        let config = test_config(dir.path());
        let store = MemStore::new();
        let archive_path =
            build_archive(dir.path(), "b-20230101-120000", "5.0", &[]);

        let mut restore = Restore::prepare(
            &log(),
            &config,
            &store,
            &archive_path,
            RestoreMode::Complete,
        )
        .unwrap();
        assert!(restore.needs_upgrade(PlatformVersion::new(6, 0)).unwrap());
        assert!(!restore.needs_upgrade(PlatformVersion::new(5, 0)).unwrap());
        restore.cleanup();
    }

    #[test]
    fn restore_filters_proposals_by_mode() {
        let dir = Utf8TempDir::new().unwrap();
        let config = test_config(dir.path());
        let proposals = &[
            ("knife/data_bags/crowbar/dns-default.json", r#"{"a": 1}"#),
            ("knife/data_bags/crowbar/nova-default.json", r#"{"b": 2}"#),
            ("knife/data_bags/crowbar/template-dns.json", "{}"),
        ];

        for (mode, expect_dns, expect_nova) in [
            (RestoreMode::Complete, true, true),
            (RestoreMode::Crowbar, true, false),
            (RestoreMode::Openstack, false, true),
        ] {
            let store = MemStore::new();
            let name = format!("b-{mode:?}");
            let archive_path =
                build_archive(dir.path(), &name, "6.0", proposals);
            let mut restore = Restore::prepare(
                &log(),
                &config,
                &store,
                &archive_path,
                mode,
            )
            .unwrap();
            restore.restore().unwrap();
            restore.cleanup();

            assert_eq!(
                store.proposal("dns", "default").is_some(),
                expect_dns,
                "mode {mode:?}"
            );
            assert_eq!(
                store.proposal("nova", "default").is_some(),
                expect_nova,
                "mode {mode:?}"
            );
            // Templates are never imported.
            assert!(store.proposal("template", "dns").is_none());
        }
    }

    #[test]
    fn restore_saves_records_and_skips_unparseable_ones() {
        let dir = Utf8TempDir::new().unwrap();
        let config = test_config(dir.path());
        let store = MemStore::new();
        let archive_path = build_archive(
            dir.path(),
            "b-20230101-120000",
            "6.0",
            &[
                (
                    "knife/nodes/node1.json",
                    r#"{"fqdn": "node1.example.com"}"#,
                ),
                ("knife/roles/dns-server.json", "{}"),
                ("knife/clients/broken.json", "not json at all"),
            ],
        );

        let mut restore = Restore::prepare(
            &log(),
            &config,
            &store,
            &archive_path,
            RestoreMode::Complete,
        )
        .unwrap();
        let summary = restore.restore().unwrap();
        restore.cleanup();

        assert_eq!(summary.records, 2);
        assert_eq!(summary.skipped, vec!["client/broken".to_string()]);
        assert_eq!(
            store
                .record(RecordKind::Node, "node1")
                .unwrap()["fqdn"],
            json!("node1.example.com")
        );
        assert!(store.record(RecordKind::Role, "dns-server").is_some());
        assert!(store.record(RecordKind::Client, "broken").is_none());
    }

    #[test]
    fn cleanup_removes_workdir_and_invalidates_session() {
        let dir = Utf8TempDir::new().unwrap();
        let config = test_config(dir.path());
        let store = MemStore::new();
        let archive_path =
            build_archive(dir.path(), "b-20230101-120000", "6.0", &[]);

        let mut restore = Restore::prepare(
            &log(),
            &config,
            &store,
            &archive_path,
            RestoreMode::Complete,
        )
        .unwrap();
        let workdir = restore.workdir().unwrap().to_owned();
        assert!(workdir.is_dir());

        restore.cleanup();
        assert!(!workdir.exists());
        assert!(restore.workdir().is_none());
        assert!(matches!(
            restore.restore(),
            Err(RestoreError::CleanedUp)
        ));
        // A second cleanup is harmless.
        restore.cleanup();
    }
}
