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

//! Boot state and the variables this crate reads and writes

use crate::error::{BootEnvError, Result};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Outcome of the most recent update attempt, as recorded by the bootloader
/// in the `ustate` variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum BootState {
    /// Normal boot, nothing pending
    #[default]
    Ok = 0,
    /// New software installed, first boot pending
    Installed = 1,
    /// New software booted, under test
    Testing = 2,
    /// Update failed, bootloader rolled back
    Failed = 3,
    NotAvailable = 4,
    Error = 5,
    Wait = 6,
    InProgress = 7,
}

impl BootState {
    pub const ALL: [BootState; 8] = [
        Self::Ok,
        Self::Installed,
        Self::Testing,
        Self::Failed,
        Self::NotAvailable,
        BootState::Error,
        Self::Wait,
        Self::InProgress,
    ];

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Value as stored in the environment (decimal)
    pub fn env_value(self) -> String {
        self.as_u8().to_string()
    }

    /// An update that reached this state and survived until userspace is
    /// considered good and must be confirmed back to the bootloader.
    pub fn needs_confirmation(self) -> bool {
        matches!(self, Self::Installed | Self::Testing)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Installed => "INSTALLED",
            Self::Testing => "TESTING",
            Self::Failed => "FAILED",
            Self::NotAvailable => "NOT_AVAILABLE",
            BootState::Error => "ERROR",
            Self::Wait => "WAIT",
            Self::InProgress => "IN_PROGRESS",
        }
    }
}

impl TryFrom<u8> for BootState {
    type Error = BootEnvError;

    fn try_from(value: u8) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|s| s.as_u8() == value)
            .ok_or_else(|| BootEnvError::InvalidState(format!("{value} is out of range 0-7")))
    }
}

impl FromStr for BootState {
    type Err = BootEnvError;

    fn from_str(s: &str) -> Result<Self> {
        let value = s
            .trim()
            .parse::<u8>()
            .map_err(|_| BootEnvError::InvalidState(format!("'{s}' is not a number")))?;
        Self::try_from(value)
    }
}

impl fmt::Display for BootState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Environment variables managed by the update agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvVariable {
    UpgradeAvailable,
    Bootcount,
    Ustate,
}

impl EnvVariable {
    pub fn name(self) -> &'static str {
        match self {
            Self::UpgradeAvailable => "upgrade_available",
            Self::Bootcount => "bootcount",
            Self::Ustate => "ustate",
        }
    }
}

impl fmt::Display for EnvVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_value_maps_to_one_state() {
        for value in 0u8..=7 {
            let state = BootState::try_from(value).unwrap();
            assert_eq!(state.as_u8(), value);
            assert_eq!(
                BootState::ALL.iter().filter(|s| s.as_u8() == value).count(),
                1
            );
        }
    }

    #[test]
    fn test_out_of_range_is_rejected() {
        assert!(matches!(
            BootState::try_from(8),
            Err(BootEnvError::InvalidState(_))
        ));
        assert!("255".parse::<BootState>().is_err());
        assert!("-1".parse::<BootState>().is_err());
        assert!("abc".parse::<BootState>().is_err());
    }

    #[test]
    fn test_parse_from_env_value() {
        assert_eq!("2".parse::<BootState>().unwrap(), BootState::Testing);
        assert_eq!(" 1\n".parse::<BootState>().unwrap(), BootState::Installed);
        assert_eq!(BootState::Ok.env_value(), "0");
    }

    #[test]
    fn test_only_installed_and_testing_need_confirmation() {
        let confirming: Vec<_> = BootState::ALL
            .into_iter()
            .filter(|s| s.needs_confirmation())
            .collect();
        assert_eq!(confirming, vec![BootState::Installed, BootState::Testing]);
    }

    #[test]
    fn test_variable_names() {
        assert_eq!(EnvVariable::UpgradeAvailable.name(), "upgrade_available");
        assert_eq!(EnvVariable::Bootcount.to_string(), "bootcount");
        assert_eq!(EnvVariable::Ustate.name(), "ustate");
    }
}
