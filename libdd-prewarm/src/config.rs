// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use libdd_dsm::config::parse_env;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const AUTOPREWARM_ENV: &str = "DD_AUTOPREWARM";
pub const AUTOPREWARM_INTERVAL_ENV: &str = "DD_AUTOPREWARM_INTERVAL";
pub const AUTOPREWARM_FILE_ENV: &str = "DD_AUTOPREWARM_FILE";

pub const AUTOPREWARM_FILE: &str = "autoprewarm.blocks";
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(300);
/// Longest interval accepted, in seconds.
pub const MAX_INTERVAL_SECS: u64 = i32::MAX as u64 / 1000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrewarmConfig {
    /// Whether the leader may run at all.
    pub enabled: bool,
    /// Time between dumps. Zero dumps only at shutdown.
    pub interval: Duration,
    pub dump_file: PathBuf,
}

impl PrewarmConfig {
    /// Defaults, with the dump file inside `data_dir`.
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        PrewarmConfig {
            enabled: true,
            interval: DEFAULT_INTERVAL,
            dump_file: data_dir.as_ref().join(AUTOPREWARM_FILE),
        }
    }

    /// Reads the environment on top of [`PrewarmConfig::new`]. A relative
    /// dump file is taken relative to `data_dir`.
    pub fn from_env(data_dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let data_dir = data_dir.as_ref();
        let mut config = PrewarmConfig::new(data_dir);
        if let Some(enabled) = parse_env::bool(AUTOPREWARM_ENV) {
            config.enabled = enabled;
        }
        if let Some(raw) = parse_env::str_not_empty(AUTOPREWARM_INTERVAL_ENV) {
            let secs = raw.trim().parse::<u64>().map_err(|err| {
                anyhow::anyhow!("invalid {AUTOPREWARM_INTERVAL_ENV} {raw:?}: {err}")
            })?;
            config.interval = Duration::from_secs(secs);
        }
        if let Some(file) = parse_env::str_not_empty(AUTOPREWARM_FILE_ENV) {
            config.dump_file = data_dir.join(file);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.interval.as_secs() <= MAX_INTERVAL_SECS,
            "autoprewarm interval must be at most {MAX_INTERVAL_SECS} seconds, got {}",
            self.interval.as_secs()
        );
        anyhow::ensure!(
            self.dump_file.file_name().is_some(),
            "autoprewarm dump file must name a file: {}",
            self.dump_file.display()
        );
        Ok(())
    }

    /// Where a dump is written before it replaces the dump file.
    pub fn transient_dump_file(&self) -> PathBuf {
        let mut path = self.dump_file.clone().into_os_string();
        path.push(".tmp");
        PathBuf::from(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = PrewarmConfig::new("/var/lib/data");
        assert!(config.enabled);
        assert_eq!(config.interval, Duration::from_secs(300));
        assert_eq!(config.dump_file, Path::new("/var/lib/data/autoprewarm.blocks"));
        assert_eq!(
            config.transient_dump_file(),
            Path::new("/var/lib/data/autoprewarm.blocks.tmp")
        );
        config.validate().unwrap();
    }

    // The only test touching these variables.
    #[test]
    fn from_env() {
        std::env::set_var(AUTOPREWARM_ENV, "off");
        std::env::set_var(AUTOPREWARM_INTERVAL_ENV, "0");
        std::env::set_var(AUTOPREWARM_FILE_ENV, "blocks.txt");
        let config = PrewarmConfig::from_env("/data").unwrap();
        assert!(!config.enabled);
        assert_eq!(config.interval, Duration::ZERO);
        assert_eq!(config.dump_file, Path::new("/data/blocks.txt"));

        std::env::set_var(AUTOPREWARM_INTERVAL_ENV, "soon");
        assert!(PrewarmConfig::from_env("/data").is_err());
        std::env::set_var(AUTOPREWARM_INTERVAL_ENV, "3000000");
        assert!(PrewarmConfig::from_env("/data").is_err());

        std::env::remove_var(AUTOPREWARM_ENV);
        std::env::remove_var(AUTOPREWARM_INTERVAL_ENV);
        std::env::remove_var(AUTOPREWARM_FILE_ENV);
        assert_eq!(PrewarmConfig::from_env("/data").unwrap(), PrewarmConfig::new("/data"));
    }
}
