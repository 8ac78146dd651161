// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

fn default_phase_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_true() -> bool {
    true
}

/// Daemon configuration, loaded from a TOML file.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Base directory holding `key/`, `groups/` and `db/`.
    pub data_dir: PathBuf,
    /// Address other committee members dial this node at.
    pub address: String,
    /// Intra-committee + DKG listener.
    pub peer_listen: String,
    /// Public HTTP listener.
    pub public_listen: String,
    /// Control listener; must stay on a loopback address.
    pub control_listen: String,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub tls: Option<TlsSection>,
    pub beacons: Vec<BeaconSection>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreSection {
    Memory {
        #[serde(default = "default_memory_capacity")]
        capacity: usize,
    },
    #[cfg(feature = "rocksdb")]
    Rocksdb,
    #[cfg(feature = "sqlite")]
    Sqlite { url: String },
}

impl Default for StoreSection {
    #[cfg(feature = "rocksdb")]
    fn default() -> Self {
        StoreSection::Rocksdb
    }

    #[cfg(not(feature = "rocksdb"))]
    fn default() -> Self {
        StoreSection::Memory {
            capacity: default_memory_capacity(),
        }
    }
}

fn default_memory_capacity() -> usize {
    lantern_db::DEFAULT_MEMORY_CAPACITY
}

#[derive(Clone, Debug, Deserialize)]
pub struct TlsSection {
    pub certificate: PathBuf,
    pub private_key: PathBuf,
    #[serde(default)]
    pub trusted_roots: Vec<PathBuf>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BeaconSection {
    pub id: String,
    /// Sign Join/Accept automatically when a valid proposal arrives.
    #[serde(default = "default_true")]
    pub auto_accept_dkg: bool,
    #[serde(with = "humantime_serde", default = "default_phase_timeout")]
    pub dkg_phase_timeout: Duration,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.beacons.is_empty() {
            anyhow::bail!("at least one [[beacons]] section is required");
        }
        let control: std::net::SocketAddr = self.control_listen.parse()?;
        if !control.ip().is_loopback() {
            anyhow::bail!("control_listen must be a loopback address");
        }
        for (pos, beacon) in self.beacons.iter().enumerate() {
            if self.beacons[..pos].iter().any(|b| b.id == beacon.id) {
                anyhow::bail!("duplicate beacon id {}", beacon.id);
            }
        }
        Ok(())
    }

    pub fn store_config(&self) -> lantern_db::StoreConfig {
        match &self.store {
            StoreSection::Memory { capacity } => lantern_db::StoreConfig::Memory {
                capacity: *capacity,
            },
            #[cfg(feature = "rocksdb")]
            StoreSection::Rocksdb => lantern_db::StoreConfig::Rocks {
                path: self.data_dir.join("db"),
            },
            #[cfg(feature = "sqlite")]
            StoreSection::Sqlite { url } => lantern_db::StoreConfig::Sqlite { url: url.clone() },
        }
    }
}
