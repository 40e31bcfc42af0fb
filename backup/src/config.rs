// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration for the backup and restore pipeline.

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Deployment-specific paths and policy for backup and restore.
///
/// Every field has a production default, so an empty TOML file (or
/// `Config::default()`) yields the standard layout.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding backup archives.
    pub backup_dir: Utf8PathBuf,
    /// Directory under which restore working directories are created.
    pub restore_root: Utf8PathBuf,
    /// Root the platform file map is resolved against when exporting.
    pub system_root: Utf8PathBuf,
    /// DNS server configuration parsed for resolver forwarders.
    pub named_conf: Utf8PathBuf,
    /// Barclamps considered part of the platform core. A restore in
    /// `crowbar` mode imports only these; `openstack` mode imports
    /// everything else.
    pub core_barclamps: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backup_dir: "/var/lib/crowbar/backup".into(),
            restore_root: "/var/lib/crowbar/restore".into(),
            system_root: "/".into(),
            named_conf: "/etc/bind/named.conf".into(),
            core_barclamps: [
                "crowbar",
                "deployer",
                "dns",
                "ipmi",
                "logging",
                "network",
                "ntp",
                "provisioner",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl Config {
    /// Load a `Config` from the given TOML file.
    pub fn from_file<P: AsRef<Utf8Path>>(path: P) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|error| {
            ConfigError::Io { error, path: path.to_owned() }
        })?;
        toml::from_str(&data).map_err(|error| ConfigError::Parse {
            error,
            path: path.to_owned(),
        })
    }

    pub fn is_core_barclamp(&self, name: &str) -> bool {
        self.core_barclamps.iter().any(|bc| bc == name)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {path}")]
    Io {
        #[source]
        error: std::io::Error,
        path: Utf8PathBuf,
    },
    #[error("failed to parse config file: {path}")]
    Parse {
        #[source]
        error: toml::de::Error,
        path: Utf8PathBuf,
    },
}
