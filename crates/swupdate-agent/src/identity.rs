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

//! Device identity reported at startup

use crate::config::ConfigLookup;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;
use tracing::warn;

const IDENTIFY_SECTION: &str = "identify";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceIdentity {
    pub board: Option<String>,
    pub serial: Option<String>,
    pub hw_version: Option<String>,
    pub sw_version: Option<String>,
    pub app_version: String,
    /// SHA256 of the application data file, lowercase hex
    pub app_data_digest: Option<String>,
}

impl DeviceIdentity {
    /// Collect identity values from the `identify` entries of the config
    pub fn from_lookup(config: &dyn ConfigLookup, app_data_file: Option<&Path>) -> Self {
        let named = |name: &str| config.lookup_named(IDENTIFY_SECTION, name, "value");

        let app_data_digest = app_data_file.and_then(|path| match file_sha256(path) {
            Ok(digest) => Some(digest),
            Err(e) => {
                warn!("Cannot hash application data {}: {e}", path.display());
                None
            }
        });

        Self {
            board: named("board"),
            serial: named("serial"),
            hw_version: named("HW Version"),
            sw_version: named("SW Version"),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            app_data_digest,
        }
    }
}

pub fn file_sha256(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const CONFIG: &str = r#"
[[identify]]
name = "board"
value = "imx8-gw"

[[identify]]
name = "HW Version"
value = "1.2"

[[identify]]
name = "serial"
value = 4711
"#;

    #[test]
    fn test_identity_from_config() {
        let config = DeviceConfig::parse(CONFIG).unwrap();
        let identity = DeviceIdentity::from_lookup(&config, None);

        assert_eq!(identity.board.as_deref(), Some("imx8-gw"));
        assert_eq!(identity.hw_version.as_deref(), Some("1.2"));
        assert_eq!(identity.serial.as_deref(), Some("4711"));
        assert_eq!(identity.sw_version, None);
        assert_eq!(identity.app_version, env!("CARGO_PKG_VERSION"));
        assert_eq!(identity.app_data_digest, None);
    }

    #[test]
    fn test_app_data_digest() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"abc").unwrap();

        let config = DeviceConfig::parse("").unwrap();
        let identity = DeviceIdentity::from_lookup(&config, Some(file.path()));
        assert_eq!(
            identity.app_data_digest.as_deref(),
            Some("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
    }

    #[test]
    fn test_missing_app_data_is_not_fatal() {
        let config = DeviceConfig::parse("").unwrap();
        let identity =
            DeviceIdentity::from_lookup(&config, Some(Path::new("/nonexistent/app.bin")));
        assert_eq!(identity.app_data_digest, None);
    }
}
