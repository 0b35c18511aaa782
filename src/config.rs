// Copyright 2024 The dedupv1d Authors.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Daemon configuration: a TOML file describing preconfigured volumes,
//! targets, users, and groups, plus daemon-wide settings. This struct is
//! everything that comes from the config file; `--create`/`--dirty`/
//! verbosity stay CLI-only flags in `main.rs`.

use std::path::Path;

use remain::sorted;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::scsi::constants::DEFAULT_COMMAND_THREAD_COUNT;
use crate::scsi::constants::DEFAULT_SECTOR_SIZE;

#[sorted]
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid key=value parameter {0:?}: {1}")]
    Params(String, &'static str),
    #[error("failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PreconfiguredVolume {
    pub id: u32,
    pub device_name: Option<String>,
    pub logical_size: u64,
    #[serde(default)]
    pub sector_size: Option<u32>,
    #[serde(default)]
    pub command_thread_count: Option<u32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PreconfiguredTarget {
    pub tid: u32,
    pub name: String,
    /// Raw `name=value,name=value` negotiation params, parsed with
    /// [`parse_params`].
    #[serde(default)]
    pub params: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PreconfiguredUser {
    pub name: String,
    pub secret_hash: String,
    #[serde(default)]
    pub targets: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PreconfiguredGroup {
    pub name: String,
}

fn default_command_thread_count() -> u32 {
    DEFAULT_COMMAND_THREAD_COUNT
}

fn default_sector_size() -> u32 {
    DEFAULT_SECTOR_SIZE
}

fn default_scheduler_threads() -> usize {
    4
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Directory the persistent indices and info stores live under.
    pub persistence_dir: String,
    #[serde(default = "default_command_thread_count")]
    pub default_command_thread_count: u32,
    #[serde(default = "default_sector_size")]
    pub default_sector_size: u32,
    #[serde(default = "default_scheduler_threads")]
    pub scheduler_threads: usize,
    #[serde(default)]
    pub volumes: Vec<PreconfiguredVolume>,
    #[serde(default)]
    pub targets: Vec<PreconfiguredTarget>,
    #[serde(default)]
    pub users: Vec<PreconfiguredUser>,
    #[serde(default)]
    pub groups: Vec<PreconfiguredGroup>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(toml::from_str(&text)?)
    }
}

/// Parses a flat `name=value,name=value` grammar (the `Target.params`
/// shape), without pulling in a derive-based key=value crate for a format
/// this simple.
pub fn parse_params(raw: &str) -> Result<Vec<(String, String)>, ConfigError> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    raw.split(',')
        .map(|pair| {
            let pair = pair.trim();
            let (name, value) = pair
                .split_once('=')
                .ok_or(ConfigError::Params(pair.to_string(), "expected name=value"))?;
            if name.is_empty() {
                return Err(ConfigError::Params(pair.to_string(), "empty parameter name"));
            }
            Ok((name.to_string(), value.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_params_splits_pairs() {
        let params = parse_params("MaxConnections=1,InitialR2T=Yes").unwrap();
        assert_eq!(
            params,
            vec![
                ("MaxConnections".to_string(), "1".to_string()),
                ("InitialR2T".to_string(), "Yes".to_string()),
            ]
        );
    }

    #[test]
    fn parse_params_empty_string_is_empty_list() {
        assert!(parse_params("").unwrap().is_empty());
        assert!(parse_params("   ").unwrap().is_empty());
    }

    #[test]
    fn parse_params_rejects_missing_equals() {
        let err = parse_params("MaxConnections").unwrap_err();
        assert!(matches!(err, ConfigError::Params(_, _)));
    }

    #[test]
    fn load_parses_minimal_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dedupv1d.toml");
        std::fs::write(
            &path,
            r#"
persistence_dir = "/var/lib/dedupv1d"

[[volumes]]
id = 1
device_name = "dedupv1-1"
logical_size = 1073741824
"#,
        )
        .unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.persistence_dir, "/var/lib/dedupv1d");
        assert_eq!(config.default_command_thread_count, DEFAULT_COMMAND_THREAD_COUNT);
        assert_eq!(config.volumes.len(), 1);
        assert_eq!(config.volumes[0].id, 1);
    }

    #[test]
    fn load_missing_file_errors() {
        let err = Config::load(Path::new("/nonexistent/dedupv1d.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
