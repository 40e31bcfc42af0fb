// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Backup archive management: naming, listing, creation, and deletion.

use camino::Utf8PathBuf;
use camino_tempfile::Utf8TempDir;
use chrono::Utc;
use regex::Regex;
use slog::{Logger, info, o, warn};
use std::sync::LazyLock;

use crate::archive::{self, ArchiveError};
use crate::config::Config;
use crate::export::{Export, ExportError};
use crate::store::{DataBagStore, RecordStore};

pub const ARCHIVE_SUFFIX: &str = ".tar.gz";
pub const CREATED_AT_FORMAT: &str = "%Y%m%d-%H%M%S";

// `<name>-<YYYYMMDD-HHMMSS>` where name is word characters or dashes.
static FILENAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\A([\w-]+)-([0-9]{8}-[0-9]{6})\z").unwrap()
});

/// One named, timestamped backup artifact.
///
/// The identity is `(name, created_at)`; the filename is derived as
/// `<name>-<created_at>.tar.gz`. Construction validates the filename, so a
/// `Backup` in hand always names a well-formed archive path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backup {
    name: String,
    created_at: String,
    path: Utf8PathBuf,
}

impl Backup {
    pub(crate) fn new(
        config: &Config,
        name: &str,
        created_at: &str,
    ) -> Result<Self, ValidationError> {
        if name.is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if created_at.is_empty() {
            return Err(ValidationError::EmptyCreatedAt);
        }
        let stem = format!("{name}-{created_at}");
        if !filename_has_format(&stem) || !filename_has_characters(&stem) {
            return Err(ValidationError::Filename {
                filename: format!("{stem}{ARCHIVE_SUFFIX}"),
            });
        }
        let path = config.backup_dir.join(format!("{stem}{ARCHIVE_SUFFIX}"));
        Ok(Self {
            name: name.to_string(),
            created_at: created_at.to_string(),
            path,
        })
    }

    /// Parse `(name, created_at)` back out of an archive filename.
    pub(crate) fn parse_filename(filename: &str) -> Option<(&str, &str)> {
        let stem = filename.strip_suffix(ARCHIVE_SUFFIX)?;
        if !filename_has_characters(stem) {
            return None;
        }
        let captures = FILENAME_RE.captures(stem)?;
        Some((
            captures.get(1).unwrap().as_str(),
            captures.get(2).unwrap().as_str(),
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created_at(&self) -> &str {
        &self.created_at
    }

    pub fn filename(&self) -> String {
        format!("{}-{}{ARCHIVE_SUFFIX}", self.name, self.created_at)
    }

    pub fn path(&self) -> &Utf8PathBuf {
        &self.path
    }

    /// Byte length of the archive, or `None` if it does not exist.
    pub fn size(&self) -> Option<u64> {
        self.path.metadata().ok().filter(|m| m.is_file()).map(|m| m.len())
    }

    /// Remove the archive file. A missing file is not an error.
    pub fn delete(&self) -> Result<(), BackupError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(BackupError::Io { path: self.path.clone(), err })
            }
        }
    }
}

fn filename_has_format(stem: &str) -> bool {
    FILENAME_RE.is_match(stem)
}

fn filename_has_characters(stem: &str) -> bool {
    stem.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("backup name must not be empty")]
    EmptyName,

    #[error("backup timestamp must not be empty")]
    EmptyCreatedAt,

    #[error("invalid backup filename {filename:?}")]
    Filename { filename: String },

    #[error("backup {name}-{created_at} already exists")]
    Duplicate { name: String, created_at: String },
}

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("I/O error on {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Export(#[from] ExportError),
}

/// Handle on the backup storage directory.
pub struct BackupStore {
    log: Logger,
    config: Config,
}

impl BackupStore {
    pub fn new(log: &Logger, config: Config) -> Self {
        let log = log.new(o!("component" => "BackupStore"));
        Self { log, config }
    }

    /// All well-formed backups in the storage directory, ordered by
    /// `created_at` ascending. Files that do not parse as backup archives
    /// are skipped.
    pub fn list(&self) -> Result<Vec<Backup>, BackupError> {
        let dir = &self.config.backup_dir;
        let entries = match dir.read_dir_utf8() {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Vec::new());
            }
            Err(err) => {
                return Err(BackupError::Io { path: dir.clone(), err })
            }
        };

        let mut backups = Vec::new();
        for entry in entries {
            let entry = entry
                .map_err(|err| BackupError::Io { path: dir.clone(), err })?;
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let Some((name, created_at)) =
                Backup::parse_filename(entry.file_name())
            else {
                continue;
            };
            match Backup::new(&self.config, name, created_at) {
                Ok(backup) => backups.push(backup),
                Err(_) => continue,
            }
        }
        backups.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(backups)
    }

    /// Exact match on `(name, created_at)`.
    pub fn find(
        &self,
        name: &str,
        created_at: &str,
    ) -> Result<Option<Backup>, BackupError> {
        Ok(self
            .list()?
            .into_iter()
            .find(|b| b.name == name && b.created_at == created_at))
    }

    /// Create a new backup by exporting the live store into a scratch
    /// directory and compressing it into the storage directory.
    ///
    /// Validation failures (empty name, malformed filename, duplicate
    /// identity) are reported before anything is written. The scratch
    /// directory is removed whether or not the export succeeds.
    pub fn create<S>(
        &self,
        export: &Export<'_, S>,
        name: &str,
        created_at: Option<&str>,
    ) -> Result<Backup, BackupError>
    where
        S: RecordStore + DataBagStore,
    {
        let now;
        let created_at = match created_at {
            Some(created_at) => created_at,
            None => {
                now = Utc::now().format(CREATED_AT_FORMAT).to_string();
                &now
            }
        };

        let backup = Backup::new(&self.config, name, created_at)?;
        if self.find(name, created_at)?.is_some() {
            return Err(ValidationError::Duplicate {
                name: name.to_string(),
                created_at: created_at.to_string(),
            }
            .into());
        }

        std::fs::create_dir_all(&self.config.backup_dir).map_err(|err| {
            BackupError::Io { path: self.config.backup_dir.clone(), err }
        })?;

        // The tempdir is removed on drop, on every exit path.
        let workdir = Utf8TempDir::new().map_err(|err| BackupError::Io {
            path: Utf8PathBuf::from("<tempdir>"),
            err,
        })?;

        let summary = export.export(workdir.path())?;
        if !summary.skipped.is_empty() {
            warn!(
                self.log,
                "backup created with skipped entities";
                "backup" => backup.filename(),
                "skipped" => summary.skipped.len(),
            );
        }

        archive::compress(workdir.path(), backup.path())?;
        info!(
            self.log,
            "created backup";
            "backup" => backup.filename(),
            "size" => ?backup.size(),
        );
        Ok(backup)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
