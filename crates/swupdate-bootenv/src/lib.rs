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

//! Bootloader environment access for the update agent
//!
//! Reads and writes the U-Boot environment variables that coordinate update
//! confirmation and rollback across reboots (`ustate`, `upgrade_available`,
//! `bootcount`), with write-only-on-change semantics.

pub mod backend;
pub mod error;
pub mod fw_config;
pub mod image;
pub mod resolver;
pub mod state;
pub mod store;

pub use backend::{EnvBackend, FileBackend};
#[cfg(any(test, feature = "test-util"))]
pub use backend::MemoryBackend;
pub use error::{BootEnvError, Result};
pub use resolver::resolve;
pub use state::{BootState, EnvVariable};
pub use store::{BootEnvStore, EnvHandle, SetOutcome};
