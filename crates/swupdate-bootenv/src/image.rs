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

//! U-Boot environment image codec
//!
//! Layout of one copy: `crc32 (LE) | [flags] | data`, where `data` holds
//! `name=value\0` pairs closed by an empty entry and padded with zeros.
//! The CRC covers the whole data area.

use crate::error::{BootEnvError, Result};
use std::collections::BTreeMap;

pub type EnvVars = BTreeMap<String, String>;

const CRC_LEN: usize = 4;

pub fn header_len(redundant: bool) -> usize {
    if redundant { CRC_LEN + 1 } else { CRC_LEN }
}

/// A decoded environment copy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvImage {
    /// Redundancy counter, only present for redundant layouts
    pub flags: Option<u8>,
    pub vars: EnvVars,
}

/// Decode one copy. Returns `None` when the CRC does not match.
pub fn decode(raw: &[u8], redundant: bool) -> Option<EnvImage> {
    let header = header_len(redundant);
    if raw.len() <= header {
        return None;
    }

    let stored = u32::from_le_bytes(raw[..CRC_LEN].try_into().ok()?);
    let data = &raw[header..];
    if crc32fast::hash(data) != stored {
        return None;
    }

    let mut vars = EnvVars::new();
    for entry in data.split(|b| *b == 0) {
        if entry.is_empty() {
            break;
        }
        let entry = String::from_utf8_lossy(entry);
        if let Some((name, value)) = entry.split_once('=') {
            vars.insert(name.to_string(), value.to_string());
        } else {
            tracing::warn!("Skipping malformed environment entry: {entry}");
        }
    }

    Some(EnvImage {
        flags: redundant.then(|| raw[CRC_LEN]),
        vars,
    })
}

/// Encode variables into a copy of exactly `size` bytes.
pub fn encode(vars: &EnvVars, size: usize, flags: Option<u8>) -> Result<Vec<u8>> {
    let header = header_len(flags.is_some());
    let data_len = size.saturating_sub(header);

    let mut data = Vec::with_capacity(data_len);
    for (name, value) in vars {
        data.extend_from_slice(name.as_bytes());
        data.push(b'=');
        data.extend_from_slice(value.as_bytes());
        data.push(0);
    }
    data.push(0);

    if data.len() > data_len {
        return Err(BootEnvError::Write {
            name: "environment".to_string(),
            reason: format!(
                "needs {} bytes, only {data_len} available",
                data.len()
            ),
        });
    }
    data.resize(data_len, 0);

    let mut out = Vec::with_capacity(size);
    out.extend_from_slice(&crc32fast::hash(&data).to_le_bytes());
    if let Some(flags) = flags {
        out.push(flags);
    }
    out.extend_from_slice(&data);
    Ok(out)
}

/// True when counter `a` was written after counter `b` (wrap-around aware).
pub fn is_newer(a: u8, b: u8) -> bool {
    a.wrapping_sub(b).cast_signed() > 0
}
