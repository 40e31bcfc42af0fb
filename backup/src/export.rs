// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Serializing the live cluster state into a backup working directory.
//!
//! The layout produced here is the archive format: `knife/` holds one
//! pretty-printed JSON file per record, `crowbar/` holds copied platform
//! files plus the version marker that restore later reads to decide whether
//! the migration chain must run.
//!
//! A record that fails to load is logged and skipped; a backup with a few
//! missing records beats no backup at all. Structural failures (unwritable
//! working directory) abort the export.

use camino::{Utf8Path, Utf8PathBuf};
use crowbar_common::version::PlatformVersion;
use serde_json::Value;
use slog::{Logger, debug, o, warn};

use crate::config::Config;
use crate::store::{DataBagStore, RecordKind, RecordStore, StoreError};

/// Archive-relative destination and system source for each platform file.
///
/// `etc/resolv.conf.forwarders` is synthesized from the DNS configuration
/// rather than copied; see [`Export::platform_files`].
pub const FILE_MAP: &[(&str, &str)] = &[
    ("etc/crowbar.install.key", "etc/crowbar.install.key"),
    ("etc/crowbar.json", "etc/crowbar/crowbar.json"),
    ("etc/hosts", "etc/hosts"),
    ("etc/network.json", "etc/crowbar/network.json"),
    ("etc/resolv.conf.forwarders", "etc/resolv.conf"),
    ("crowbar/client.pem", "opt/dell/crowbar_framework/config/client.pem"),
    ("root/.gnupg", "root/.gnupg"),
    ("root/.ssh", "root/.ssh"),
    ("tftp/validation.pem", "srv/tftpboot/validation.pem"),
];

const FORWARDERS_DEST: &str = "etc/resolv.conf.forwarders";

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("failed to write {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What an export produced, including the entities it had to skip.
#[derive(Debug, Default)]
pub struct ExportSummary {
    pub records: usize,
    pub skipped: Vec<String>,
}

/// Walks the live store and writes the working tree a backup is built from.
pub struct Export<'a, S> {
    log: Logger,
    store: &'a S,
    config: &'a Config,
    version: PlatformVersion,
}

impl<'a, S: RecordStore + DataBagStore> Export<'a, S> {
    pub fn new(
        log: &Logger,
        store: &'a S,
        config: &'a Config,
        version: PlatformVersion,
    ) -> Self {
        let log = log.new(o!("component" => "Export"));
        Self { log, store, config, version }
    }

    /// Export everything into `workdir`.
    pub fn export(
        &self,
        workdir: &Utf8Path,
    ) -> Result<ExportSummary, ExportError> {
        let mut summary = ExportSummary::default();
        for kind in RecordKind::ALL {
            self.records(workdir, kind, &mut summary)?;
        }
        self.databags(workdir, &mut summary)?;
        self.platform_files(workdir)?;
        Ok(summary)
    }

    fn records(
        &self,
        workdir: &Utf8Path,
        kind: RecordKind,
        summary: &mut ExportSummary,
    ) -> Result<(), ExportError> {
        debug!(self.log, "backing up records"; "kind" => %kind);
        let dir = workdir.join("knife").join(kind.dir_name());
        create_dir_all(&dir)?;

        for name in self.store.list(kind)? {
            let mut record = match self.store.load(kind, &name) {
                Ok(record) => record,
                Err(err) => {
                    warn!(
                        self.log,
                        "failed to load record, skipping";
                        "kind" => %kind,
                        "name" => &name,
                        "error" => %err,
                    );
                    summary.skipped.push(format!("{kind}/{name}"));
                    continue;
                }
            };
            if let Value::Object(map) = &mut record {
                map.insert(
                    "json_class".to_string(),
                    Value::String(kind.type_tag().to_string()),
                );
            }
            write_pretty_json(&dir.join(format!("{name}.json")), &record)?;
            summary.records += 1;
        }
        Ok(())
    }

    fn databags(
        &self,
        workdir: &Utf8Path,
        summary: &mut ExportSummary,
    ) -> Result<(), ExportError> {
        debug!(self.log, "backing up databags");
        let data_dir = workdir.join("knife").join("databags");
        create_dir_all(&data_dir)?;

        for bag in self.store.bag_names()? {
            let bag_dir = data_dir.join(&bag);
            create_dir_all(&bag_dir)?;
            for item in self.store.bag_items(&bag)? {
                let record = match self.store.load_item(&bag, &item) {
                    Ok(record) => record,
                    Err(err) => {
                        warn!(
                            self.log,
                            "failed to load databag item, skipping";
                            "bag" => &bag,
                            "item" => &item,
                            "error" => %err,
                        );
                        summary.skipped.push(format!("databags/{bag}/{item}"));
                        continue;
                    }
                };
                write_pretty_json(
                    &bag_dir.join(format!("{item}.json")),
                    &record,
                )?;
                summary.records += 1;
            }
        }
        Ok(())
    }

    /// Copy the platform file map, synthesize the resolver-forwarders file,
    /// and write the version marker.
    fn platform_files(&self, workdir: &Utf8Path) -> Result<(), ExportError> {
        debug!(self.log, "backing up platform files");
        let data_dir = workdir.join("crowbar");
        for folder in ["tftp", "etc", "crowbar", "root"] {
            create_dir_all(&data_dir.join(folder))?;
        }

        for (dest, source) in FILE_MAP {
            let dest_path = data_dir.join(dest);
            if *dest == FORWARDERS_DEST {
                let mut contents = String::new();
                for forwarder in self.forwarders() {
                    contents.push_str(&format!("nameserver {forwarder}\n"));
                }
                std::fs::write(&dest_path, contents).map_err(|err| {
                    ExportError::Io { path: dest_path.clone(), err }
                })?;
                continue;
            }

            let source_path = self.config.system_root.join(source);
            if !source_path.exists() {
                // Optional on dev systems; the restore side tolerates an
                // incomplete crowbar/ tree.
                warn!(
                    self.log,
                    "platform file missing, skipping";
                    "source" => %source_path,
                );
                continue;
            }
            copy_recursively(&source_path, &dest_path)?;
        }

        let version_path = data_dir.join("version");
        std::fs::write(&version_path, format!("{}\n", self.version))
            .map_err(|err| ExportError::Io { path: version_path, err })?;
        Ok(())
    }

    /// Forwarder addresses from the `forwarders { ... };` block of the DNS
    /// server configuration. A missing or blockless file yields none.
    fn forwarders(&self) -> Vec<String> {
        let contents = match std::fs::read_to_string(&self.config.named_conf)
        {
            Ok(contents) => contents,
            Err(err) => {
                warn!(
                    self.log,
                    "cannot read DNS configuration, no forwarders exported";
                    "path" => %self.config.named_conf,
                    "error" => %err,
                );
                return Vec::new();
            }
        };

        let mut forwarders = Vec::new();
        let mut in_block = false;
        for line in contents.lines() {
            if line.contains("forwarders {") {
                in_block = true;
                continue;
            }
            if in_block && line.contains("};") {
                in_block = false;
                continue;
            }
            if in_block {
                let addr = line.trim().trim_end_matches(';').trim();
                if !addr.is_empty() {
                    forwarders.push(addr.to_string());
                }
            }
        }
        forwarders
    }
}

fn create_dir_all(dir: &Utf8Path) -> Result<(), ExportError> {
    std::fs::create_dir_all(dir)
        .map_err(|err| ExportError::Io { path: dir.to_owned(), err })
}

fn write_pretty_json(
    path: &Utf8Path,
    value: &Value,
) -> Result<(), ExportError> {
    let io_err = |err| ExportError::Io { path: path.to_owned(), err };
    let mut contents =
        serde_json::to_vec_pretty(value).map_err(|err| io_err(err.into()))?;
    contents.push(b'\n');
    std::fs::write(path, contents).map_err(io_err)
}

fn copy_recursively(
    source: &Utf8Path,
    dest: &Utf8Path,
) -> Result<(), ExportError> {
    let io_err = |err| ExportError::Io { path: dest.to_owned(), err };
    if source.is_dir() {
        std::fs::create_dir_all(dest).map_err(io_err)?;
        for entry in source.read_dir_utf8().map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            copy_recursively(
                entry.path(),
                &dest.join(entry.file_name()),
            )?;
        }
    } else {
        std::fs::copy(source, dest).map_err(io_err)?;
    }
    Ok(())
}
