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

//! Storage backends for the bootloader environment

use crate::error::{BootEnvError, Result};
use crate::fw_config::{self, BackendConfig, EnvDevice, EnvNamespace};
use crate::image::{self, EnvVars};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;

/// Access to one persistent environment.
///
/// `acquire` grants exclusive access for the lifetime of the returned guard;
/// `load` and `store` are only called while that guard is held.
pub trait EnvBackend {
    type Guard;

    fn acquire(&self) -> Result<Self::Guard>;

    fn load(&self, guard: &mut Self::Guard) -> Result<EnvVars>;

    fn store(&self, guard: &mut Self::Guard, vars: &EnvVars) -> Result<()>;
}

/// Environment stored on a block device, MTD character device or plain file,
/// as described by `fw_env.config`.
#[derive(Debug, Clone)]
pub struct FileBackend {
    config_path: PathBuf,
    dt_namespace_path: PathBuf,
}

impl Default for FileBackend {
    fn default() -> Self {
        Self::new(
            fw_config::DEFAULT_CONFIG_PATH,
            fw_config::DEFAULT_DT_NAMESPACE_PATH,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Primary,
    Redundant,
}

pub struct FileGuard {
    namespace: EnvNamespace,
    primary: Flock<File>,
    redundant: Option<File>,
    // Copy read last and its counter; the next store goes to the other one
    active: Slot,
    flags: u8,
}

impl std::fmt::Debug for FileGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileGuard")
            .field("namespace", &self.namespace.name)
            .field("active", &self.active)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

impl FileBackend {
    pub fn new(config_path: impl Into<PathBuf>, dt_namespace_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            dt_namespace_path: dt_namespace_path.into(),
        }
    }

    fn resolve_namespace(&self) -> Result<EnvNamespace> {
        let config = BackendConfig::load(&self.config_path)?;
        let declared = fw_config::namespace_from_dt(&self.dt_namespace_path);
        if let Some(ref name) = declared {
            tracing::debug!("Device tree declares environment namespace {name}");
        }
        config.select(declared.as_deref()).cloned()
    }
}

fn open_device(device: &EnvDevice) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(&device.path)
        .map_err(|e| {
            BootEnvError::EnvUnavailable(format!("cannot open {}: {e}", device.path.display()))
        })
}

fn read_copy(file: &File, device: &EnvDevice, size: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; size];
    file.read_exact_at(&mut buf, device.offset).map_err(|e| {
        BootEnvError::EnvUnavailable(format!("cannot read {}: {e}", device.path.display()))
    })?;
    Ok(buf)
}

impl EnvBackend for FileBackend {
    type Guard = FileGuard;

    fn acquire(&self) -> Result<FileGuard> {
        let namespace = self.resolve_namespace()?;

        let file = open_device(&namespace.primary)?;
        let primary = Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
            if errno == Errno::EWOULDBLOCK {
                BootEnvError::EnvUnavailable(format!(
                    "{} is busy",
                    namespace.primary.path.display()
                ))
            } else {
                BootEnvError::EnvUnavailable(format!(
                    "cannot lock {}: {errno}",
                    namespace.primary.path.display()
                ))
            }
        })?;
        let redundant = namespace.redundant.as_ref().map(open_device).transpose()?;

        Ok(FileGuard {
            namespace,
            primary,
            redundant,
            active: Slot::Primary,
            flags: 0,
        })
    }

    fn load(&self, guard: &mut FileGuard) -> Result<EnvVars> {
        let ns = &guard.namespace;
        let redundant = ns.is_redundant();
        let first = image::decode(&read_copy(&*guard.primary, &ns.primary, ns.size)?, redundant);

        let second = match (&guard.redundant, &ns.redundant) {
            (Some(file), Some(device)) => image::decode(&read_copy(file, device, ns.size)?, true),
            _ => None,
        };

        let (active, img) = match (first, second) {
            (Some(a), Some(b)) => {
                if image::is_newer(b.flags.unwrap_or(0), a.flags.unwrap_or(0)) {
                    (Slot::Redundant, b)
                } else {
                    (Slot::Primary, a)
                }
            }
            (Some(a), None) => (Slot::Primary, a),
            (None, Some(b)) => (Slot::Redundant, b),
            (None, None) => {
                return Err(BootEnvError::EnvUnavailable(format!(
                    "no valid environment in namespace {}",
                    ns.name
                )));
            }
        };

        guard.active = active;
        guard.flags = img.flags.unwrap_or(0);
        Ok(img.vars)
    }

    fn store(&self, guard: &mut FileGuard, vars: &EnvVars) -> Result<()> {
        let ns = &guard.namespace;
        let primary: &File = &guard.primary;

        let (file, device, flags) = match (&guard.redundant, &ns.redundant) {
            (Some(file), Some(device)) => {
                let next = guard.flags.wrapping_add(1);
                match guard.active {
                    Slot::Primary => (file, device, Some(next)),
                    Slot::Redundant => (primary, &ns.primary, Some(next)),
                }
            }
            _ => (primary, &ns.primary, None),
        };

        let raw = image::encode(vars, ns.size, flags)?;
        file.write_all_at(&raw, device.offset)
            .and_then(|()| file.sync_data())
            .map_err(|e| {
                BootEnvError::Commit(format!("cannot write {}: {e}", device.path.display()))
            })?;

        if let Some(flags) = flags {
            guard.flags = flags;
            guard.active = match guard.active {
                Slot::Primary => Slot::Redundant,
                Slot::Redundant => Slot::Primary,
            };
        }
        Ok(())
    }
}

#[cfg(any(test, feature = "test-util"))]
pub use memory::{MemoryBackend, MemoryGuard};

#[cfg(any(test, feature = "test-util"))]
mod memory {
    use super::{EnvBackend, EnvVars};
    use crate::error::{BootEnvError, Result};
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Debug, Default)]
    struct MemoryEnv {
        vars: EnvVars,
        writes: usize,
        locked: bool,
        unavailable: bool,
        fail_store: bool,
    }

    /// In-memory environment that counts physical writes.
    ///
    /// Clones share the same environment.
    #[derive(Debug, Clone, Default)]
    pub struct MemoryBackend {
        inner: Arc<Mutex<MemoryEnv>>,
    }

    #[derive(Debug)]
    pub struct MemoryGuard {
        inner: Arc<Mutex<MemoryEnv>>,
    }

    impl Drop for MemoryGuard {
        fn drop(&mut self) {
            self.inner.lock().locked = false;
        }
    }

    impl MemoryBackend {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_vars<'a>(vars: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
            let backend = Self::new();
            backend.inner.lock().vars = vars
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            backend
        }

        /// Number of physical stores performed so far
        pub fn writes(&self) -> usize {
            self.inner.lock().writes
        }

        pub fn value(&self, name: &str) -> Option<String> {
            self.inner.lock().vars.get(name).cloned()
        }

        pub fn is_locked(&self) -> bool {
            self.inner.lock().locked
        }

        /// Make `acquire` fail as if the device were missing
        pub fn set_unavailable(&self, unavailable: bool) {
            self.inner.lock().unavailable = unavailable;
        }

        /// Make `store` fail
        pub fn set_fail_store(&self, fail: bool) {
            self.inner.lock().fail_store = fail;
        }
    }

    impl EnvBackend for MemoryBackend {
        type Guard = MemoryGuard;

        fn acquire(&self) -> Result<MemoryGuard> {
            let mut env = self.inner.lock();
            if env.unavailable {
                return Err(BootEnvError::EnvUnavailable("device missing".to_string()));
            }
            if env.locked {
                return Err(BootEnvError::EnvUnavailable("device busy".to_string()));
            }
            env.locked = true;
            Ok(MemoryGuard {
                inner: Arc::clone(&self.inner),
            })
        }

        fn load(&self, guard: &mut MemoryGuard) -> Result<EnvVars> {
            Ok(guard.inner.lock().vars.clone())
        }

        fn store(&self, guard: &mut MemoryGuard, vars: &EnvVars) -> Result<()> {
            let mut env = guard.inner.lock();
            if env.fail_store {
                return Err(BootEnvError::Commit("injected store failure".to_string()));
            }
            env.vars = vars.clone();
            env.writes += 1;
            Ok(())
        }
    }
}
