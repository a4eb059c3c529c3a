// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub mod parse_env {
    use std::{env, str::FromStr, time::Duration};

    pub fn duration(name: &str) -> Option<Duration> {
        Some(Duration::from_secs_f32(
            env::var(name).ok()?.parse::<f32>().ok()?,
        ))
    }

    pub fn int<T: FromStr>(name: &str) -> Option<T> {
        env::var(name).ok()?.parse::<T>().ok()
    }

    pub fn bool(name: &str) -> Option<bool> {
        match env::var(name).ok()?.as_str() {
            "1" | "t" | "T" | "TRUE" | "true" | "True" | "on" | "ON" => Some(true),
            _ => Some(false),
        }
    }

    pub fn str_not_empty(name: &str) -> Option<String> {
        env::var(name).ok().filter(|s| !s.is_empty())
    }
}

pub const DSM_TYPE_ENV: &str = "DD_DYNAMIC_SHARED_MEMORY_TYPE";
pub const DATA_DIRECTORY_ENV: &str = "DD_DATA_DIRECTORY";

/// Backing implementation used for new and attached segments.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DsmImpl {
    #[default]
    Posix,
    Mmap,
    Anonymous,
}

impl DsmImpl {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "posix" => Some(DsmImpl::Posix),
            "mmap" => Some(DsmImpl::Mmap),
            "anonymous" | "anon" => Some(DsmImpl::Anonymous),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DsmConfig {
    pub implementation: DsmImpl,
    /// Directory identifying the installation. Its device and inode are
    /// stamped into every segment header; the `mmap` implementation also
    /// keeps its files below it.
    pub data_dir: PathBuf,
}

impl Default for DsmConfig {
    fn default() -> Self {
        DsmConfig {
            implementation: DsmImpl::default(),
            data_dir: PathBuf::from("."),
        }
    }
}

impl DsmConfig {
    pub fn new(implementation: DsmImpl, data_dir: impl Into<PathBuf>) -> Self {
        DsmConfig {
            implementation,
            data_dir: data_dir.into(),
        }
    }

    pub fn from_env() -> Self {
        let implementation = parse_env::str_not_empty(DSM_TYPE_ENV)
            .and_then(|name| {
                let parsed = DsmImpl::from_name(&name);
                if parsed.is_none() {
                    tracing::warn!(value = %name, "ignoring unknown {DSM_TYPE_ENV}");
                }
                parsed
            })
            .unwrap_or_default();
        let data_dir = parse_env::str_not_empty(DATA_DIRECTORY_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        DsmConfig {
            implementation,
            data_dir,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn impl_names() {
        assert_eq!(DsmImpl::from_name("POSIX"), Some(DsmImpl::Posix));
        assert_eq!(DsmImpl::from_name("mmap"), Some(DsmImpl::Mmap));
        assert_eq!(DsmImpl::from_name("anon"), Some(DsmImpl::Anonymous));
        assert_eq!(DsmImpl::from_name("sysv"), None);
    }

    #[test]
    fn default_config() {
        let config = DsmConfig::default();
        assert_eq!(config.implementation, DsmImpl::Posix);
        assert_eq!(config.data_dir, PathBuf::from("."));
    }
}
