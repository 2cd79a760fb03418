// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of swupdate-agent.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Backend configuration (`fw_env.config`) and namespace resolution
//!
//! Two formats are understood:
//!
//! * the classic line format, `<device> <offset> <env size> [<sector size> [<sectors>]]`,
//!   where a second line describes the redundant copy;
//! * the YAML format, where every top-level key names a namespace with its own
//!   `size` and list of `devices`.

use crate::error::{BootEnvError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/fw_env.config";
pub const DEFAULT_DT_NAMESPACE_PATH: &str = "/proc/device-tree/chosen/u-boot,env-config";

/// Name given to the single namespace of a line-format config
pub const DEFAULT_NAMESPACE: &str = "uboot";

// CRC plus redundancy flag
const MIN_ENV_SIZE: u64 = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvDevice {
    pub path: PathBuf,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvNamespace {
    pub name: String,
    /// Size of one environment copy in bytes, header included
    pub size: usize,
    pub primary: EnvDevice,
    pub redundant: Option<EnvDevice>,
}

impl EnvNamespace {
    pub fn is_redundant(&self) -> bool {
        self.redundant.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    namespaces: Vec<EnvNamespace>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Number {
    Int(u64),
    Text(String),
}

impl Number {
    fn value(&self) -> Option<u64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Text(s) => parse_number(s),
        }
    }
}

#[derive(Debug, Deserialize)]
struct YamlNamespace {
    size: Number,
    #[serde(default)]
    devices: Vec<YamlDevice>,
}

#[derive(Debug, Deserialize)]
struct YamlDevice {
    path: PathBuf,
    #[serde(default)]
    offset: Option<Number>,
}

impl BackendConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BootEnvError::EnvUnavailable(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::parse(&content).map_err(|e| match e {
            BootEnvError::EnvUnavailable(reason) => {
                BootEnvError::EnvUnavailable(format!("{}: {reason}", path.display()))
            }
            other => other,
        })
    }

    pub fn parse(content: &str) -> Result<Self> {
        let first = content
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty() && !l.starts_with('#'));

        let namespaces = match first {
            Some(line) if line.split_whitespace().next().is_some_and(|t| t.ends_with(':')) => {
                parse_yaml(content)?
            }
            Some(_) => vec![parse_lines(content)?],
            None => Vec::new(),
        };

        if namespaces.is_empty() {
            return Err(BootEnvError::EnvUnavailable(
                "no environment configured".to_string(),
            ));
        }

        Ok(Self { namespaces })
    }

    pub fn namespaces(&self) -> &[EnvNamespace] {
        &self.namespaces
    }

    /// Pick the namespace requested by the platform, or the first one when
    /// the platform does not name any.
    pub fn select(&self, name: Option<&str>) -> Result<&EnvNamespace> {
        match name {
            Some(name) => self
                .namespaces
                .iter()
                .find(|ns| ns.name == name)
                .ok_or_else(|| BootEnvError::EnvUnavailable(format!("namespace {name} not found"))),
            None => self
                .namespaces
                .first()
                .ok_or_else(|| BootEnvError::EnvUnavailable("namespace not found".to_string())),
        }
    }
}

/// Read the namespace declared in the device tree, if any.
pub fn namespace_from_dt(path: &Path) -> Option<String> {
    let raw = std::fs::read(path).ok()?;
    let name = String::from_utf8_lossy(&raw)
        .trim_end_matches('\0')
        .trim()
        .to_string();
    (!name.is_empty()).then_some(name)
}

fn parse_number(s: &str) -> Option<u64> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

fn parse_size(size: u64) -> Result<usize> {
    if size < MIN_ENV_SIZE {
        return Err(BootEnvError::EnvUnavailable(format!(
            "environment size {size} is too small"
        )));
    }
    usize::try_from(size)
        .map_err(|_| BootEnvError::EnvUnavailable(format!("environment size {size} is too large")))
}

fn parse_lines(content: &str) -> Result<EnvNamespace> {
    let mut devices = Vec::new();
    let mut size = None;

    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        let invalid = || BootEnvError::EnvUnavailable(format!("invalid line {}: {line}", lineno + 1));
        if fields.len() < 3 {
            return Err(invalid());
        }

        let offset = parse_number(fields[1]).ok_or_else(invalid)?;
        let env_size = parse_size(parse_number(fields[2]).ok_or_else(invalid)?)?;
        match size {
            None => size = Some(env_size),
            Some(s) if s != env_size => {
                return Err(BootEnvError::EnvUnavailable(
                    "redundant copy size differs from primary".to_string(),
                ));
            }
            Some(_) => {}
        }

        devices.push(EnvDevice {
            path: PathBuf::from(fields[0]),
            offset,
        });
    }

    build_namespace(DEFAULT_NAMESPACE.to_string(), size.unwrap_or_default(), devices)
}

fn parse_yaml(content: &str) -> Result<Vec<EnvNamespace>> {
    let root: serde_yaml::Mapping = serde_yaml::from_str(content)
        .map_err(|e| BootEnvError::EnvUnavailable(format!("parse error: {e}")))?;

    let mut namespaces = Vec::with_capacity(root.len());
    for (key, value) in root {
        let name = key
            .as_str()
            .ok_or_else(|| BootEnvError::EnvUnavailable("namespace name must be a string".to_string()))?
            .to_string();
        let ns: YamlNamespace = serde_yaml::from_value(value)
            .map_err(|e| BootEnvError::EnvUnavailable(format!("namespace {name}: {e}")))?;

        let size = ns
            .size
            .value()
            .ok_or_else(|| BootEnvError::EnvUnavailable(format!("namespace {name}: bad size")))?;
        let devices = ns
            .devices
            .into_iter()
            .map(|d| {
                let offset = match d.offset {
                    Some(n) => n.value().ok_or_else(|| {
                        BootEnvError::EnvUnavailable(format!("namespace {name}: bad offset"))
                    })?,
                    None => 0,
                };
                Ok(EnvDevice {
                    path: d.path,
                    offset,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        namespaces.push(build_namespace(name, parse_size(size)?, devices)?);
    }

    Ok(namespaces)
}

fn build_namespace(name: String, size: usize, devices: Vec<EnvDevice>) -> Result<EnvNamespace> {
    let mut devices = devices.into_iter();
    let primary = devices
        .next()
        .ok_or_else(|| BootEnvError::EnvUnavailable(format!("namespace {name} has no device")))?;
    let redundant = devices.next();
    if devices.next().is_some() {
        return Err(BootEnvError::EnvUnavailable(format!(
            "namespace {name} lists more than two devices"
        )));
    }

    Ok(EnvNamespace {
        name,
        size,
        primary,
        redundant,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_single_line() {
        let config = BackendConfig::parse("# MTD device\n/dev/mtd1 0x0 0x20000 0x20000\n").unwrap();
        let ns = config.select(None).unwrap();
        assert_eq!(ns.name, DEFAULT_NAMESPACE);
        assert_eq!(ns.primary.path, PathBuf::from("/dev/mtd1"));
        assert_eq!(ns.primary.offset, 0);
        assert_eq!(ns.size, 0x20000);
        assert!(!ns.is_redundant());
    }

    #[test]
    fn test_parse_redundant_lines() {
        let config =
            BackendConfig::parse("/dev/mmcblk0 0x400000 0x4000\n/dev/mmcblk0 0x404000 16384\n")
                .unwrap();
        let ns = config.select(None).unwrap();
        assert_eq!(ns.primary.offset, 0x400000);
        let redundant = ns.redundant.as_ref().unwrap();
        assert_eq!(redundant.offset, 0x404000);
        assert_eq!(ns.size, 0x4000);
    }

    #[test]
    fn test_parse_rejects_bad_lines() {
        assert!(BackendConfig::parse("/dev/mtd1 0x0\n").is_err());
        assert!(BackendConfig::parse("/dev/mtd1 zz 0x4000\n").is_err());
        assert!(BackendConfig::parse("/dev/mtd1 0x0 0x4000\n/dev/mtd2 0x0 0x2000\n").is_err());
        assert!(BackendConfig::parse("# nothing here\n\n").is_err());
        assert!(BackendConfig::parse("/dev/mtd1 0x0 4\n").is_err());
    }

    #[test]
    fn test_parse_yaml_namespaces() {
        let yaml = r#"
uboot:
  size: 0x4000
  devices:
    - path: /dev/mmcblk0
      offset: 0x400000
    - path: /dev/mmcblk0
      offset: 0x404000
appfs:
  size: 8192
  devices:
    - path: /dev/mmcblk0boot1
"#;
        let config = BackendConfig::parse(yaml).unwrap();
        assert_eq!(config.namespaces().len(), 2);

        let first = config.select(None).unwrap();
        assert_eq!(first.name, "uboot");
        assert!(first.is_redundant());

        let appfs = config.select(Some("appfs")).unwrap();
        assert_eq!(appfs.size, 8192);
        assert_eq!(appfs.primary.offset, 0);
    }

    #[test]
    fn test_select_unknown_namespace() {
        let config = BackendConfig::parse("/dev/mtd1 0x0 0x4000\n").unwrap();
        let err = config.select(Some("missing")).unwrap_err();
        assert!(matches!(err, BootEnvError::EnvUnavailable(_)));
    }

    #[test]
    fn test_namespace_from_dt() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"appfs\0").unwrap();
        assert_eq!(namespace_from_dt(file.path()).as_deref(), Some("appfs"));

        let empty = NamedTempFile::new().unwrap();
        assert_eq!(namespace_from_dt(empty.path()), None);
        assert_eq!(namespace_from_dt(Path::new("/nonexistent/dt/property")), None);
    }

    #[test]
    fn test_load_missing_file() {
        let err = BackendConfig::load(Path::new("/nonexistent/fw_env.config")).unwrap_err();
        assert!(matches!(err, BootEnvError::EnvUnavailable(_)));
    }
}
