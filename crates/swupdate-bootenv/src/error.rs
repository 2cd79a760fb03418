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

//! Error types for bootloader environment access

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BootEnvError {
    #[error("environment unavailable: {0}")]
    EnvUnavailable(String),

    #[error("variable not found: {0}")]
    VariableNotFound(String),

    #[error("cannot set {name}: {reason}")]
    Write { name: String, reason: String },

    #[error("cannot store environment: {0}")]
    Commit(String),

    #[error("invalid boot state: {0}")]
    InvalidState(String),

    #[error("environment I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BootEnvError>;
