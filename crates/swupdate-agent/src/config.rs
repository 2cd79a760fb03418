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

//! Device configuration
//!
//! The configuration file is a TOML document with the same sections as the
//! swupdate configuration:
//!
//! ```toml
//! [[identify]]
//! name = "board"
//! value = "sama5d27-som1-ek"
//!
//! [suricatta]
//! url = "https://hawkbit.example.com"
//! tenant = "DEFAULT"
//! id = "device-0042"
//! sslkey = "/etc/ssl/private/device.key"
//! sslcert = "/etc/ssl/certs/device.crt"
//!
//! [agent]
//! reboot_countdown_secs = 10
//! ```
//!
//! Only the `[agent]` table is deserialized; everything else is read through
//! [`ConfigLookup`].

use crate::credentials::ClientCredentials;
use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use swupdate_bootenv::fw_config;
use tracing::debug;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/swupdate-agent.toml";

/// Tenant used when the configuration names a device but no tenant
pub const DEFAULT_TENANT: &str = "DEFAULT";

/// Lookup of configuration values by path
pub trait ConfigLookup {
    /// `section.key`
    fn lookup(&self, section: &str, key: &str) -> Option<String>;

    /// `key` of the entry named `name` in the list `section`
    fn lookup_named(&self, section: &str, name: &str, key: &str) -> Option<String>;
}

#[derive(Debug, Clone, Default)]
pub struct DeviceConfig {
    root: toml::Table,
}

fn value_to_string(value: &toml::Value) -> Option<String> {
    match value {
        toml::Value::String(s) => Some(s.clone()),
        toml::Value::Integer(i) => Some(i.to_string()),
        toml::Value::Float(f) => Some(f.to_string()),
        toml::Value::Boolean(b) => Some(b.to_string()),
        _ => None,
    }
}

impl DeviceConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let root: toml::Table = toml::from_str(content)
            .map_err(|e| AgentError::Config(format!("Failed to parse config: {e}")))?;
        Ok(Self { root })
    }

    /// Configuration file together with its `[agent]` settings
    pub fn load_with_settings(path: &Path) -> Result<(Self, AgentSettings)> {
        let config = Self::load(path)?;
        let settings = config.settings()?;
        Ok((config, settings))
    }

    /// Agent-local settings from the `[agent]` table
    pub fn settings(&self) -> Result<AgentSettings> {
        match self.root.get("agent") {
            Some(value) => value
                .clone()
                .try_into()
                .map_err(|e| AgentError::Config(format!("Invalid [agent] section: {e}"))),
            None => Ok(AgentSettings::default()),
        }
    }
}

impl ConfigLookup for DeviceConfig {
    fn lookup(&self, section: &str, key: &str) -> Option<String> {
        self.root
            .get(section)?
            .as_table()?
            .get(key)
            .and_then(value_to_string)
    }

    fn lookup_named(&self, section: &str, name: &str, key: &str) -> Option<String> {
        self.root
            .get(section)?
            .as_array()?
            .iter()
            .filter_map(toml::Value::as_table)
            .find(|entry| entry.get("name").and_then(toml::Value::as_str) == Some(name))?
            .get(key)
            .and_then(value_to_string)
    }
}

fn default_fw_env_config() -> PathBuf {
    PathBuf::from(fw_config::DEFAULT_CONFIG_PATH)
}

fn default_dt_namespace_path() -> PathBuf {
    PathBuf::from(fw_config::DEFAULT_DT_NAMESPACE_PATH)
}

fn default_10() -> u64 {
    10
}

fn default_60() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Bootloader environment backend configuration
    #[serde(default = "default_fw_env_config")]
    pub fw_env_config: PathBuf,

    /// Device-tree property naming the environment namespace
    #[serde(default = "default_dt_namespace_path")]
    pub dt_namespace_path: PathBuf,

    /// Countdown before rebooting into a new deployment (seconds)
    #[serde(default = "default_10")]
    pub reboot_countdown_secs: u64,

    /// Overall HTTP request timeout (seconds)
    #[serde(default = "default_60")]
    pub http_timeout_secs: u64,

    /// Application data file whose digest is reported with the identity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_data_file: Option<PathBuf>,

    /// PKCS#11 module for `pkcs11:` references without a `module-path`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pkcs11_module: Option<PathBuf>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            fw_env_config: default_fw_env_config(),
            dt_namespace_path: default_dt_namespace_path(),
            reboot_countdown_secs: 10,
            http_timeout_secs: 60,
            app_data_file: None,
            pkcs11_module: None,
        }
    }
}

impl AgentSettings {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

/// `https://` endpoint, scheme compared case-insensitively
pub fn is_secure_uri(uri: &str) -> bool {
    uri.get(..8)
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("https://"))
}

/// Update server connection, built once from the `[suricatta]` section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub base_uri: String,
    /// Client certificate pair. Only set for secure endpoints with both
    /// `sslkey` and `sslcert` configured.
    pub credentials: Option<ClientCredentials>,
    pub tenant: String,
    pub controller_id: Option<String>,
    /// Extra trusted root certificate (PEM)
    pub ca_file: Option<PathBuf>,
    pub target_token: Option<String>,
    pub gateway_token: Option<String>,
}

impl ServerConfig {
    pub fn from_lookup(config: &dyn ConfigLookup) -> Result<Self> {
        let get = |key: &str| {
            config
                .lookup("suricatta", key)
                .filter(|v| !v.trim().is_empty())
        };

        let base_uri = get("url")
            .ok_or_else(|| AgentError::Config("suricatta.url is not set".to_string()))?;

        let credentials = match (get("sslkey"), get("sslcert")) {
            (Some(key), Some(cert)) if is_secure_uri(&base_uri) => {
                ClientCredentials::from_refs(&key, &cert)
            }
            (None, None) => None,
            _ => {
                debug!("Client certificate not used for {base_uri}");
                None
            }
        };

        Ok(Self {
            base_uri,
            credentials,
            tenant: get("tenant").unwrap_or_else(|| DEFAULT_TENANT.to_string()),
            controller_id: get("id"),
            ca_file: get("cafile").map(PathBuf::from),
            target_token: get("targettoken"),
            gateway_token: get("gatewaytoken"),
        })
    }

    /// Fully qualified controller URI. Without a device id the configured URL
    /// is taken as a complete endpoint.
    pub fn controller_uri(&self) -> String {
        match &self.controller_id {
            Some(id) => format!(
                "{}/{}/controller/v1/{id}",
                self.base_uri.trim_end_matches('/'),
                self.tenant
            ),
            None => self.base_uri.clone(),
        }
    }

    pub fn is_secure(&self) -> bool {
        is_secure_uri(&self.base_uri)
    }

    pub fn client_credentials(&self) -> Option<&ClientCredentials> {
        self.credentials.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[[identify]]
name = "board"
value = "sama5d27-som1-ek"

[[identify]]
name = "HW Version"
value = "1.0"

[suricatta]
url = "https://hawkbit.example.com/"
tenant = "acme"
id = "device-0042"
sslkey = "/etc/ssl/private/device.key"
sslcert = "pkcs11:object=device-cert"
polldelay = 120

[agent]
reboot_countdown_secs = 30
"#;

    #[test]
    fn test_lookup() {
        let config = DeviceConfig::parse(SAMPLE).unwrap();
        assert_eq!(
            config.lookup("suricatta", "tenant").as_deref(),
            Some("acme")
        );
        assert_eq!(
            config.lookup("suricatta", "polldelay").as_deref(),
            Some("120")
        );
        assert_eq!(config.lookup("suricatta", "missing"), None);
        assert_eq!(config.lookup("missing", "url"), None);
    }

    #[test]
    fn test_lookup_named() {
        let config = DeviceConfig::parse(SAMPLE).unwrap();
        assert_eq!(
            config
                .lookup_named("identify", "HW Version", "value")
                .as_deref(),
            Some("1.0")
        );
        assert_eq!(config.lookup_named("identify", "serial", "value"), None);
        assert_eq!(config.lookup_named("suricatta", "board", "value"), None);
    }

    #[test]
    fn test_settings() {
        let config = DeviceConfig::parse(SAMPLE).unwrap();
        let settings = config.settings().unwrap();
        assert_eq!(settings.reboot_countdown_secs, 30);
        assert_eq!(settings.http_timeout_secs, 60);
        assert_eq!(
            settings.fw_env_config,
            PathBuf::from(fw_config::DEFAULT_CONFIG_PATH)
        );

        let defaults = DeviceConfig::parse("").unwrap().settings().unwrap();
        assert_eq!(defaults.reboot_countdown_secs, 10);
        assert!(defaults.app_data_file.is_none());
        assert!(defaults.pkcs11_module.is_none());

        let with_module =
            DeviceConfig::parse("[agent]\npkcs11_module = \"/usr/lib/libsofthsm2.so\"\n")
                .unwrap()
                .settings()
                .unwrap();
        assert_eq!(
            with_module.pkcs11_module,
            Some(PathBuf::from("/usr/lib/libsofthsm2.so"))
        );
    }

    #[test]
    fn test_load_with_settings() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("agent.toml");

        assert!(matches!(
            DeviceConfig::load_with_settings(&path),
            Err(AgentError::Io(_))
        ));

        std::fs::write(&path, "[agent]\nreboot_countdown_secs = \"soon\"\n").unwrap();
        assert!(matches!(
            DeviceConfig::load_with_settings(&path),
            Err(AgentError::Config(_))
        ));

        std::fs::write(&path, SAMPLE).unwrap();
        let (config, settings) = DeviceConfig::load_with_settings(&path).unwrap();
        assert_eq!(settings.reboot_countdown_secs, 30);
        assert!(config.lookup("suricatta", "url").is_some());
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(
            DeviceConfig::parse("[suricatta\nurl = 1"),
            Err(AgentError::Config(_))
        ));
    }

    #[test]
    fn test_server_config_with_device_id() {
        let config = DeviceConfig::parse(SAMPLE).unwrap();
        let server = ServerConfig::from_lookup(&config).unwrap();
        assert_eq!(
            server.controller_uri(),
            "https://hawkbit.example.com/acme/controller/v1/device-0042"
        );
        assert!(server.is_secure());
        let creds = server.client_credentials().unwrap();
        assert!(!creds.key.is_engine_backed());
        assert!(creds.cert.is_engine_backed());
    }

    #[test]
    fn test_server_config_verbatim_url() {
        let config = DeviceConfig::parse(
            "[suricatta]\nurl = \"http://10.0.0.1:8080/DEFAULT/controller/v1/dev\"\nsslkey = \"k\"\nsslcert = \"c\"\n",
        )
        .unwrap();
        let server = ServerConfig::from_lookup(&config).unwrap();
        assert_eq!(
            server.controller_uri(),
            "http://10.0.0.1:8080/DEFAULT/controller/v1/dev"
        );
        assert!(!server.is_secure());
        assert_eq!(server.credentials, None);
    }

    #[test]
    fn test_server_config_needs_both_refs() {
        let config = DeviceConfig::parse(
            "[suricatta]\nurl = \"HTTPS://h\"\nsslkey = \"/k.pem\"\nsslcert = \" \"\n",
        )
        .unwrap();
        let server = ServerConfig::from_lookup(&config).unwrap();
        assert!(server.is_secure());
        assert!(server.client_credentials().is_none());
    }

    #[test]
    fn test_server_config_default_tenant() {
        let config =
            DeviceConfig::parse("[suricatta]\nurl = \"https://h\"\nid = \"x\"\n").unwrap();
        let server = ServerConfig::from_lookup(&config).unwrap();
        assert_eq!(server.controller_uri(), "https://h/DEFAULT/controller/v1/x");
        assert!(server.client_credentials().is_none());
    }

    #[test]
    fn test_server_config_requires_url() {
        let config = DeviceConfig::parse("[suricatta]\ntenant = \"acme\"\n").unwrap();
        assert!(matches!(
            ServerConfig::from_lookup(&config),
            Err(AgentError::Config(_))
        ));
    }
}
