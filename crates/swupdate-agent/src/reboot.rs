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

//! Reboot countdown and the system reboot itself

use crate::error::{AgentError, Result};
use nix::sys::reboot::{RebootMode, reboot};
use tracing::{info, warn};

/// Seconds left before an armed reboot. Ticks once per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebootCountdown {
    remaining_secs: u64,
}

impl RebootCountdown {
    pub fn new(secs: u64) -> Self {
        Self {
            remaining_secs: secs,
        }
    }

    pub fn remaining_secs(&self) -> u64 {
        self.remaining_secs
    }

    /// Advance by one second. Returns `true` once the countdown has expired.
    pub fn tick(&mut self) -> bool {
        self.remaining_secs = self.remaining_secs.saturating_sub(1);
        self.remaining_secs == 0
    }

    pub fn is_expired(&self) -> bool {
        self.remaining_secs == 0
    }
}

/// Restarts the device
pub trait Rebooter: Send {
    fn reboot(&mut self) -> Result<()>;
}

/// Flushes filesystems and restarts through the kernel
#[derive(Debug, Default)]
pub struct SystemRebooter;

impl Rebooter for SystemRebooter {
    fn reboot(&mut self) -> Result<()> {
        info!("Syncing filesystems before reboot");
        nix::unistd::sync();

        warn!("Rebooting now");
        match reboot(RebootMode::RB_AUTOBOOT) {
            Ok(never) => match never {},
            Err(e) => Err(AgentError::Reboot(e.to_string())),
        }
    }
}
