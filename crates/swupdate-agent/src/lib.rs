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

//! Update agent for bootloader-coordinated A/B updates
//!
//! Confirms a freshly installed update on the first good boot, polls a
//! hawkBit-style controller for deployments and, when one appears, sets
//! `upgrade_available` for the bootloader and counts down to a reboot.

pub mod agent;
pub mod config;
pub mod credentials;
pub mod error;
pub mod events;
pub mod http;
pub mod identity;
pub mod pkcs11;
pub mod poller;
pub mod reboot;
pub mod session;

pub use agent::{CycleOutcome, UpdateAgent, fail_startup};
pub use config::{AgentSettings, ConfigLookup, DeviceConfig, ServerConfig};
pub use error::{AgentError, ProtocolError, Result};
pub use events::{AgentCommand, AgentEvent};
pub use http::HttpClient;
pub use pkcs11::Pkcs11Engine;
pub use poller::DeploymentPoller;
pub use reboot::{RebootCountdown, Rebooter, SystemRebooter};
pub use session::{PollResult, UpdateSession};
