// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Utilities for durably persisting state to the filesystem.
//!
//! A [`Ledger`] wraps a serializable value and a path. Committing writes the
//! value to a temporary file in the same directory and renames it into
//! place, so a reader never observes a partially written ledger. Each commit
//! bumps a generation number carried inside the value; commit refuses to
//! clobber an on-disk copy with a newer generation, which is how two
//! processes sharing one ledger detect that they raced.

use camino::Utf8PathBuf;
use serde::Serialize;
use serde::de::DeserializeOwned;
use slog::{Logger, debug, warn};
use std::io::Write;
use tempfile::NamedTempFile;

/// Types that can be stored in a [`Ledger`].
pub trait Ledgerable: DeserializeOwned + Serialize + Clone {
    /// Returns true if this copy supersedes `other`.
    fn is_newer_than(&self, other: &Self) -> bool;

    /// Increments the internal generation number.
    fn generation_bump(&mut self);
}

#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    #[error("a newer generation of {path} is already committed")]
    Conflict { path: Utf8PathBuf },

    #[error("failed to serialize ledger")]
    Serialize(#[source] serde_json::Error),

    #[error("failed to write ledger to {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
}

/// A durable value stored at a single well-known path.
pub struct Ledger<T> {
    log: Logger,
    path: Utf8PathBuf,
    ledger: T,
}

impl<T: Ledgerable> Ledger<T> {
    /// Reads the committed ledger at `path`, if one exists.
    ///
    /// An unreadable or unparseable file is treated the same as a missing
    /// one, after logging what was wrong with it.
    pub fn new(log: &Logger, path: Utf8PathBuf) -> Option<Self> {
        let ledger = read_committed(log, &path)?;
        Some(Self { log: log.clone(), path, ledger })
    }

    /// Like [`Ledger::new`], but falls back to `default` if nothing is
    /// committed yet.
    pub fn new_with(log: &Logger, path: Utf8PathBuf, default: T) -> Self {
        let ledger = read_committed(log, &path).unwrap_or(default);
        Self { log: log.clone(), path, ledger }
    }

    pub fn data(&self) -> &T {
        &self.ledger
    }

    pub fn data_mut(&mut self) -> &mut T {
        &mut self.ledger
    }

    pub fn into_inner(self) -> T {
        self.ledger
    }

    pub fn path(&self) -> &Utf8PathBuf {
        &self.path
    }

    /// Durably commits the in-memory value.
    ///
    /// Fails with [`CommitError::Conflict`] if another process committed a
    /// newer generation since this ledger was read; the in-memory value is
    /// left untouched so the caller can reload and retry.
    pub fn commit(&mut self) -> Result<(), CommitError> {
        if let Some(on_disk) = read_committed::<T>(&self.log, &self.path) {
            if on_disk.is_newer_than(&self.ledger) {
                warn!(
                    self.log,
                    "ledger commit conflict";
                    "path" => %self.path,
                );
                return Err(CommitError::Conflict { path: self.path.clone() });
            }
        }

        let mut candidate = self.ledger.clone();
        candidate.generation_bump();
        let serialized = serde_json::to_vec_pretty(&candidate)
            .map_err(CommitError::Serialize)?;

        let dir = self.path.parent().unwrap_or(camino::Utf8Path::new("."));
        let io_err = |err| CommitError::Io { path: self.path.clone(), err };
        let mut tmp = NamedTempFile::new_in(dir).map_err(io_err)?;
        tmp.write_all(&serialized).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&self.path).map_err(|err| CommitError::Io {
            path: self.path.clone(),
            err: err.error,
        })?;

        self.ledger = candidate;
        debug!(self.log, "ledger committed"; "path" => %self.path);
        Ok(())
    }
}

fn read_committed<T: Ledgerable>(log: &Logger, path: &Utf8PathBuf) -> Option<T> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
        Err(err) => {
            warn!(
                log,
                "failed to read ledger";
                "path" => %path,
                "error" => %err,
            );
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(ledger) => Some(ledger),
        Err(err) => {
            warn!(
                log,
                "failed to parse ledger";
                "path" => %path,
                "error" => %err,
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Counter {
        generation: u64,
        value: u32,
    }

    impl Ledgerable for Counter {
        fn is_newer_than(&self, other: &Self) -> bool {
            self.generation > other.generation
        }
        fn generation_bump(&mut self) {
            self.generation += 1;
        }
    }

    fn log() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    #[test]
    fn missing_ledger_reads_as_none() {
        let dir = Utf8TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        assert!(Ledger::<Counter>::new(&log(), path).is_none());
    }

    #[test]
    fn commit_then_reload() {
        let dir = Utf8TempDir::new().unwrap();
        let path = dir.path().join("state.json");

        let mut ledger = Ledger::new_with(
            &log(),
            path.clone(),
            Counter { generation: 0, value: 7 },
        );
        ledger.commit().unwrap();

        let reloaded = Ledger::<Counter>::new(&log(), path).unwrap();
        assert_eq!(reloaded.data().value, 7);
        assert_eq!(reloaded.data().generation, 1);
    }

    #[test]
    fn concurrent_commit_conflicts() {
        let dir = Utf8TempDir::new().unwrap();
        let path = dir.path().join("state.json");

        let initial = Counter { generation: 0, value: 0 };
        let mut a =
            Ledger::new_with(&log(), path.clone(), initial.clone());
        a.commit().unwrap();

        // Both instances read generation 1, then race to commit.
        let mut b = Ledger::<Counter>::new(&log(), path.clone()).unwrap();
        let mut c = Ledger::<Counter>::new(&log(), path).unwrap();

        b.data_mut().value = 1;
        b.commit().unwrap();

        c.data_mut().value = 2;
        match c.commit() {
            Err(CommitError::Conflict { .. }) => {}
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn corrupt_ledger_falls_back_to_default() {
        let dir = Utf8TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"not json").unwrap();

        let ledger = Ledger::new_with(
            &log(),
            path,
            Counter { generation: 0, value: 3 },
        );
        assert_eq!(ledger.data().value, 3);
    }
}
