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

//! Scoped access to the bootloader environment
//!
//! Every access goes through an [`EnvHandle`]: open, read or stage changes,
//! commit if something changed, close. The handle owns the backend's
//! exclusive guard, so access is released on every path, including errors.

use crate::backend::EnvBackend;
use crate::error::{BootEnvError, Result};
use crate::image::EnvVars;
use crate::state::EnvVariable;
use tracing::{debug, info, warn};

/// Result of staging a variable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    Changed,
    Unchanged,
}

#[derive(Debug, Clone, Default)]
pub struct BootEnvStore<B> {
    backend: B,
}

impl<B: EnvBackend> BootEnvStore<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Acquire the environment and read its current content.
    pub fn open(&self) -> Result<EnvHandle<'_, B>> {
        let mut guard = self.backend.acquire()?;
        let vars = self.backend.load(&mut guard)?;
        Ok(EnvHandle {
            backend: &self.backend,
            guard,
            vars,
            pending: false,
        })
    }

    /// open → get → close
    pub fn read_variable(&self, var: EnvVariable) -> Result<String> {
        let handle = self.open()?;
        let value = handle.get_variable(var).map(str::to_string);
        handle.close();
        value
    }

    /// open → set → commit if changed → close
    pub fn write_variable(&self, var: EnvVariable, value: &str) -> Result<SetOutcome> {
        let mut handle = self.open()?;
        let outcome = handle.set_variable(var, value)?;
        handle.commit_if_changed()?;
        handle.close();
        Ok(outcome)
    }
}

pub struct EnvHandle<'a, B: EnvBackend> {
    backend: &'a B,
    guard: B::Guard,
    vars: EnvVars,
    pending: bool,
}

impl<B: EnvBackend> std::fmt::Debug for EnvHandle<'_, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvHandle")
            .field("vars", &self.vars)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

impl<B: EnvBackend> EnvHandle<'_, B> {
    pub fn get_variable(&self, var: EnvVariable) -> Result<&str> {
        self.vars
            .get(var.name())
            .map(String::as_str)
            .ok_or_else(|| BootEnvError::VariableNotFound(var.name().to_string()))
    }

    /// Stage `value` for `var`. Identical values are not staged so that no
    /// flash write happens for them.
    pub fn set_variable(&mut self, var: EnvVariable, value: &str) -> Result<SetOutcome> {
        if value.contains('\0') {
            return Err(BootEnvError::Write {
                name: var.name().to_string(),
                reason: "value contains a NUL byte".to_string(),
            });
        }

        if self.vars.get(var.name()).is_some_and(|v| v == value) {
            debug!("Not setting {var}, value is the same");
            return Ok(SetOutcome::Unchanged);
        }

        info!("Setting {var} to {value}");
        self.vars.insert(var.name().to_string(), value.to_string());
        self.pending = true;
        Ok(SetOutcome::Changed)
    }

    pub fn has_pending_changes(&self) -> bool {
        self.pending
    }

    /// Persist staged changes. Returns whether a physical write happened.
    pub fn commit_if_changed(&mut self) -> Result<bool> {
        if !self.pending {
            return Ok(false);
        }

        info!("Writing bootloader environment");
        self.backend.store(&mut self.guard, &self.vars)?;
        self.pending = false;
        Ok(true)
    }

    /// Release the environment.
    pub fn close(self) {}
}

impl<B: EnvBackend> Drop for EnvHandle<'_, B> {
    fn drop(&mut self) {
        if self.pending {
            warn!("Closing bootloader environment with uncommitted changes");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    #[test]
    fn test_get_missing_variable() {
        let store = BootEnvStore::new(MemoryBackend::new());
        let err = store.read_variable(EnvVariable::Ustate).unwrap_err();
        assert!(matches!(err, BootEnvError::VariableNotFound(name) if name == "ustate"));
    }

    #[test]
    fn test_same_value_twice_writes_once() {
        let backend = MemoryBackend::with_vars([("upgrade_available", "0")]);
        let store = BootEnvStore::new(backend.clone());

        assert_eq!(
            store.write_variable(EnvVariable::UpgradeAvailable, "1").unwrap(),
            SetOutcome::Changed
        );
        assert_eq!(
            store.write_variable(EnvVariable::UpgradeAvailable, "1").unwrap(),
            SetOutcome::Unchanged
        );

        assert_eq!(backend.writes(), 1);
        assert_eq!(backend.value("upgrade_available").as_deref(), Some("1"));
    }

    #[test]
    fn test_commit_without_changes_is_noop() {
        let backend = MemoryBackend::with_vars([("ustate", "0")]);
        let store = BootEnvStore::new(backend.clone());

        let mut handle = store.open().unwrap();
        assert_eq!(
            handle.set_variable(EnvVariable::Ustate, "0").unwrap(),
            SetOutcome::Unchanged
        );
        assert!(!handle.has_pending_changes());
        assert!(!handle.commit_if_changed().unwrap());
        handle.close();

        assert_eq!(backend.writes(), 0);
    }

    #[test]
    fn test_unchanged_set_keeps_earlier_staged_change() {
        let backend = MemoryBackend::with_vars([("ustate", "1"), ("bootcount", "0")]);
        let store = BootEnvStore::new(backend.clone());

        let mut handle = store.open().unwrap();
        handle.set_variable(EnvVariable::Ustate, "0").unwrap();
        handle.set_variable(EnvVariable::Bootcount, "0").unwrap();
        assert!(handle.commit_if_changed().unwrap());
        assert!(!handle.commit_if_changed().unwrap());
        handle.close();

        assert_eq!(backend.writes(), 1);
        assert_eq!(backend.value("ustate").as_deref(), Some("0"));
    }

    #[test]
    fn test_new_variable_is_staged() {
        let backend = MemoryBackend::new();
        let store = BootEnvStore::new(backend.clone());
        store.write_variable(EnvVariable::Bootcount, "3").unwrap();
        assert_eq!(backend.value("bootcount").as_deref(), Some("3"));
    }

    #[test]
    fn test_rejects_nul_in_value() {
        let store = BootEnvStore::new(MemoryBackend::new());
        let mut handle = store.open().unwrap();
        let err = handle.set_variable(EnvVariable::Ustate, "1\02").unwrap_err();
        assert!(matches!(err, BootEnvError::Write { .. }));
    }

    #[test]
    fn test_handle_releases_on_error_paths() {
        let backend = MemoryBackend::with_vars([("upgrade_available", "0")]);
        backend.set_fail_store(true);
        let store = BootEnvStore::new(backend.clone());

        let err = store
            .write_variable(EnvVariable::UpgradeAvailable, "1")
            .unwrap_err();
        assert!(matches!(err, BootEnvError::Commit(_)));
        assert!(!backend.is_locked());
        assert_eq!(backend.value("upgrade_available").as_deref(), Some("0"));
    }

    #[test]
    fn test_open_fails_when_unavailable() {
        let backend = MemoryBackend::new();
        backend.set_unavailable(true);
        let store = BootEnvStore::new(backend);
        assert!(matches!(
            store.open(),
            Err(BootEnvError::EnvUnavailable(_))
        ));
    }
}
