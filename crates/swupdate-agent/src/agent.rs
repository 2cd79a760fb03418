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

//! Update control loop
//!
//! One timeline drives everything: the startup resolve, the poll timer and,
//! once a deployment has been handed to the bootloader, the one-second reboot
//! countdown. Only one of resolve, poll and arm runs at a time, and the
//! bootloader environment is never held open across an await point.

use crate::error::{AgentError, Result};
use crate::events::{AgentCommand, AgentEvent};
use crate::poller::DeploymentPoller;
use crate::reboot::{RebootCountdown, Rebooter};
use crate::session::{MAX_POLL_INTERVAL_SECS, UpdateSession};
use std::future::Future;
use std::time::Duration;
use swupdate_bootenv::{BootEnvStore, BootState, EnvBackend, EnvVariable, resolve};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};

const COUNTDOWN_TICK: Duration = Duration::from_secs(1);

/// `now + delay`, saturating instead of panicking on overflow
fn deadline_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay)
        .or_else(|| now.checked_add(Duration::from_secs(MAX_POLL_INTERVAL_SECS)))
        .unwrap_or(now)
}

/// Startup cannot go on to polling. The last boot is still resolved so that
/// a good update is confirmed instead of rolled back, then `error` is handed
/// back to the caller.
pub fn fail_startup<B: EnvBackend>(store: &BootEnvStore<B>, error: AgentError) -> AgentError {
    error!("Cannot start polling: {error}");
    let state = resolve(store);
    info!("Last boot state: {state}");
    error
}

/// What a poll cycle ended with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing new on the server
    Idle,
    /// Poll failed or the boot state is unknown; retried on the next tick
    Skipped,
    RebootArmed,
    /// `upgrade_available` could not be written; no reboot this cycle
    ArmFailed,
}

pub struct UpdateAgent<B: EnvBackend, R: Rebooter> {
    store: BootEnvStore<B>,
    poller: DeploymentPoller,
    session: UpdateSession,
    rebooter: R,
    reboot_countdown_secs: u64,
    countdown: Option<RebootCountdown>,
    events: UnboundedSender<AgentEvent>,
}

impl<B: EnvBackend, R: Rebooter> std::fmt::Debug for UpdateAgent<B, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateAgent")
            .field("controller_uri", &self.poller.controller_uri())
            .field("session", &self.session)
            .field("countdown", &self.countdown)
            .finish_non_exhaustive()
    }
}

impl<B: EnvBackend, R: Rebooter> UpdateAgent<B, R> {
    pub fn new(
        store: BootEnvStore<B>,
        poller: DeploymentPoller,
        rebooter: R,
        reboot_countdown_secs: u64,
        events: UnboundedSender<AgentEvent>,
    ) -> Self {
        Self {
            store,
            poller,
            session: UpdateSession::new(),
            rebooter,
            reboot_countdown_secs,
            countdown: None,
            events,
        }
    }

    pub fn session(&self) -> &UpdateSession {
        &self.session
    }

    pub fn countdown(&self) -> Option<RebootCountdown> {
        self.countdown
    }

    fn emit(&self, event: AgentEvent) {
        // A missing listener is not an error
        let _ = self.events.send(event);
    }

    /// Reconcile the bootloader state, then poll once
    pub async fn startup(&mut self) -> CycleOutcome {
        let state = resolve(&self.store);
        info!("Last boot state: {state}");
        self.session.last_known_boot_state = state;
        self.emit(AgentEvent::StateResolved { state });

        self.poll_cycle().await
    }

    pub async fn poll_cycle(&mut self) -> CycleOutcome {
        let result = match self.poller.poll(&mut self.session).await {
            Ok(result) => result,
            Err(e) => {
                warn!("Poll failed, retrying in {}s: {e}", self.session.poll_interval_secs);
                return CycleOutcome::Skipped;
            }
        };

        self.emit(AgentEvent::PollCompleted {
            interval_secs: result.poll_interval_secs,
            action_id: result.deployment_action_id,
        });

        if !result.has_new_deployment {
            return CycleOutcome::Idle;
        }

        if self.session.last_known_boot_state == BootState::Error {
            warn!("Boot state unknown, not acting on deployment");
            return CycleOutcome::Skipped;
        }

        if self.arm_reboot() {
            CycleOutcome::RebootArmed
        } else {
            CycleOutcome::ArmFailed
        }
    }

    /// Tell the bootloader to try the new software on the next boot and
    /// start the reboot countdown. Returns `false` if the flag could not be
    /// written, in which case no reboot is scheduled.
    pub fn arm_reboot(&mut self) -> bool {
        match self.store.write_variable(EnvVariable::UpgradeAvailable, "1") {
            Ok(outcome) => {
                debug!("upgrade_available=1 ({outcome:?})");
                self.session.mark_installed();
                self.countdown = Some(RebootCountdown::new(self.reboot_countdown_secs));
                info!("Reboot armed, rebooting in {}s", self.reboot_countdown_secs);
                self.emit(AgentEvent::RebootArmed {
                    countdown_secs: self.reboot_countdown_secs,
                });
                true
            }
            Err(e) => {
                error!("Cannot set upgrade_available, reboot suppressed: {e}");
                false
            }
        }
    }

    /// Stop a running countdown. `upgrade_available` stays set.
    pub fn cancel_reboot(&mut self) -> bool {
        if self.countdown.take().is_none() {
            return false;
        }
        info!("Reboot cancelled, update will be applied on the next reboot");
        self.emit(AgentEvent::RebootCancelled);
        true
    }

    /// Advance the countdown by one second. Returns `true` once the reboot
    /// has been issued.
    pub fn tick_countdown(&mut self) -> Result<bool> {
        let Some(countdown) = self.countdown.as_mut() else {
            return Ok(false);
        };

        if !countdown.tick() {
            let remaining_secs = countdown.remaining_secs();
            debug!("Rebooting in {remaining_secs}s");
            self.emit(AgentEvent::RebootCountdown { remaining_secs });
            return Ok(false);
        }

        self.countdown = None;
        self.emit(AgentEvent::Rebooting);
        self.rebooter.reboot()?;
        Ok(true)
    }

    fn handle_command(&mut self, command: AgentCommand) {
        match command {
            AgentCommand::CancelReboot => {
                if !self.cancel_reboot() {
                    debug!("No reboot pending");
                }
            }
        }
    }

    /// Run until `shutdown` resolves or the device is rebooted
    pub async fn run<F>(
        &mut self,
        mut commands: UnboundedReceiver<AgentCommand>,
        shutdown: F,
    ) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        self.startup().await;
        let mut next_poll = deadline_after(self.session.poll_interval());
        let mut next_tick = Instant::now() + COUNTDOWN_TICK;

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("Shutting down");
                    break;
                }
                () = sleep_until(next_poll) => {
                    if self.poll_cycle().await == CycleOutcome::RebootArmed {
                        next_tick = Instant::now() + COUNTDOWN_TICK;
                    }
                    next_poll = deadline_after(self.session.poll_interval());
                    debug!("Next poll in {}s", self.session.poll_interval_secs);
                }
                () = sleep_until(next_tick), if self.countdown.is_some() => {
                    next_tick += COUNTDOWN_TICK;
                    match self.tick_countdown() {
                        Ok(true) => break,
                        Ok(false) => {}
                        Err(e) => error!("Reboot failed: {e}"),
                    }
                }
                Some(command) = commands.recv() => self.handle_command(command),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swupdate_bootenv::MemoryBackend;

    #[test]
    fn test_failed_startup_still_confirms_boot() {
        let backend = MemoryBackend::with_vars([("ustate", "1")]);
        let store = BootEnvStore::new(backend.clone());

        let err = fail_startup(&store, AgentError::Config("no config".to_string()));
        assert!(matches!(err, AgentError::Config(_)));
        assert_eq!(backend.value("ustate").as_deref(), Some("0"));
        assert_eq!(backend.writes(), 1);
    }

    #[test]
    fn test_failed_startup_with_normal_boot_writes_nothing() {
        let backend = MemoryBackend::with_vars([("ustate", "0")]);
        let store = BootEnvStore::new(backend.clone());

        fail_startup(&store, AgentError::Credentials("no token".to_string()));
        assert_eq!(backend.writes(), 0);
    }

    #[test]
    fn test_deadline_saturates_on_overflow() {
        let before = Instant::now();
        let deadline = deadline_after(Duration::MAX);
        assert!(deadline >= before + Duration::from_secs(MAX_POLL_INTERVAL_SECS));
    }
}
