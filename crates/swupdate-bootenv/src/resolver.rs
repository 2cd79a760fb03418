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

//! Boot-time reconciliation of the last update outcome

use crate::backend::EnvBackend;
use crate::error::BootEnvError;
use crate::state::{BootState, EnvVariable};
use crate::store::{BootEnvStore, SetOutcome};
use tracing::{error, info, warn};

/// Read `ustate` and confirm a freshly installed or tested update.
///
/// Never fails: an unreadable environment yields [`BootState::Error`], which
/// callers treat as "unknown, do not act".
pub fn resolve<B: EnvBackend>(store: &BootEnvStore<B>) -> BootState {
    let state = match store.read_variable(EnvVariable::Ustate) {
        Ok(raw) => match raw.parse::<BootState>() {
            Ok(state) => state,
            Err(e) => {
                error!("Corrupt ustate value '{raw}': {e}");
                return BootState::Error;
            }
        },
        Err(BootEnvError::VariableNotFound(_)) => {
            warn!("ustate is not set in the bootloader environment");
            return BootState::NotAvailable;
        }
        Err(e) => {
            error!("Cannot read bootloader environment: {e}");
            return BootState::Error;
        }
    };

    info!("Last update state: {state}");

    if state.needs_confirmation() {
        info!("Software updated successfully");
        match store.write_variable(EnvVariable::Ustate, &BootState::Ok.env_value()) {
            Ok(SetOutcome::Changed) => info!("Update confirmed to bootloader"),
            Ok(SetOutcome::Unchanged) => {}
            Err(e) => error!("Failed to confirm update to bootloader: {e}"),
        }
    }

    state
}
