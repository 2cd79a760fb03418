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

//! In-memory state of the running agent

use chrono::{DateTime, Utc};
use std::time::Duration;
use swupdate_bootenv::BootState;

/// Poll interval used until the server recommends one
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 300;

/// Longest delay between polls, whatever the server asks for
pub const MAX_POLL_INTERVAL_SECS: u64 = 7 * 24 * 3600;

/// Outcome of one poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollResult {
    pub poll_interval_secs: u64,
    pub deployment_action_id: Option<u64>,
    pub has_new_deployment: bool,
}

/// Session state for the lifetime of the process. The authoritative state
/// lives in the bootloader environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateSession {
    pub last_known_boot_state: BootState,
    /// Server currently advertises a deployment
    pub update_available: bool,
    /// A deployment was handed to the bootloader during this boot
    pub update_installed: bool,
    pub poll_interval_secs: u64,
    pub last_action_id: Option<u64>,
    pub last_poll_at: Option<DateTime<Utc>>,
}

impl Default for UpdateSession {
    fn default() -> Self {
        Self {
            last_known_boot_state: BootState::NotAvailable,
            update_available: false,
            update_installed: false,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            last_action_id: None,
            last_poll_at: None,
        }
    }
}

impl UpdateSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_poll(&mut self, result: &PollResult) {
        self.poll_interval_secs = result.poll_interval_secs;
        self.update_available = result.deployment_action_id.is_some();
        if result.deployment_action_id.is_some() {
            self.last_action_id = result.deployment_action_id;
        }
        self.last_poll_at = Some(Utc::now());
    }

    pub fn mark_installed(&mut self) {
        self.update_installed = true;
    }

    /// Delay until the next poll, between one second and a week
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.clamp(1, MAX_POLL_INTERVAL_SECS))
    }
}
