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

//! Events the agent reports and commands it accepts

use crate::error::Result;
use crate::identity::DeviceIdentity;
use serde::Serialize;
use swupdate_bootenv::BootState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
    Identity(DeviceIdentity),
    StateResolved {
        state: BootState,
    },
    PollCompleted {
        interval_secs: u64,
        action_id: Option<u64>,
    },
    RebootArmed {
        countdown_secs: u64,
    },
    RebootCountdown {
        remaining_secs: u64,
    },
    RebootCancelled,
    Rebooting,
}

impl AgentEvent {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentCommand {
    /// Abort a pending reboot. `upgrade_available` stays set, so the new
    /// software is still tried on the next boot.
    CancelReboot,
}
