// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reading and writing backup archives (gzip-compressed tarballs).
//!
//! Pure data movement: the tarball holds the *contents* of a working
//! directory, with entry names relative to it. Compression writes to a
//! temporary file next to the destination and renames into place, so a
//! concurrent reader never observes a partially written archive.

use camino::{Utf8Path, Utf8PathBuf};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::BufWriter;
use tempfile::NamedTempFile;
use walkdir::WalkDir;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("cannot read {path}")]
    Read {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("cannot write archive {path}")]
    Write {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("cannot extract archive {path}")]
    Extract {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("archive contains a non-UTF-8 path: {path:?}")]
    NonUtf8Path { path: std::path::PathBuf },
}

/// Compress the contents of `src_dir` into a tar.gz at `dest`.
pub fn compress(src_dir: &Utf8Path, dest: &Utf8Path) -> Result<(), ArchiveError> {
    let dest_dir = dest.parent().unwrap_or(Utf8Path::new("."));
    let write_err =
        |err| ArchiveError::Write { path: dest.to_owned(), err };

    let (file, temp_path) =
        NamedTempFile::new_in(dest_dir).map_err(write_err)?.into_parts();
    let mut builder = tar::Builder::new(GzEncoder::new(
        BufWriter::new(file),
        Compression::default(),
    ));

    for entry in WalkDir::new(src_dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|err| ArchiveError::Read {
            path: src_dir.to_owned(),
            err: err.into(),
        })?;
        let path = Utf8Path::from_path(entry.path()).ok_or_else(|| {
            ArchiveError::NonUtf8Path { path: entry.path().to_owned() }
        })?;
        // Relative to the working directory root.
        let name = path
            .strip_prefix(src_dir)
            .expect("walkdir yields paths under its root");
        let read_err = |err| ArchiveError::Read { path: path.to_owned(), err };
        if entry.file_type().is_dir() {
            builder.append_dir(name, path).map_err(read_err)?;
        } else if entry.file_type().is_file() {
            builder.append_path_with_name(path, name).map_err(read_err)?;
        }
        // Symlinks and special files are not part of the archive format.
    }

    let encoder = builder.into_inner().map_err(write_err)?;
    let buf_writer = encoder.finish().map_err(write_err)?;
    let file = buf_writer
        .into_inner()
        .map_err(|err| write_err(err.into_error()))?;
    file.sync_all().map_err(write_err)?;
    drop(file);

    temp_path.persist(dest).map_err(|err| ArchiveError::Write {
        path: dest.to_owned(),
        err: err.error,
    })?;
    Ok(())
}

/// Extract the tar.gz at `archive` into `dest_dir`.
pub fn extract(
    archive: &Utf8Path,
    dest_dir: &Utf8Path,
) -> Result<(), ArchiveError> {
    let file = std::fs::File::open(archive).map_err(|err| {
        ArchiveError::Read { path: archive.to_owned(), err }
    })?;
    let mut reader = tar::Archive::new(GzDecoder::new(file));
    reader.unpack(dest_dir).map_err(|err| ArchiveError::Extract {
        path: archive.to_owned(),
        err,
    })
}
