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

//! swupdate-agent - entry point
//!
//! Resolves the outcome of the last update, then polls the update server and
//! reboots into new software when a deployment is handed to the bootloader.

use clap::Parser;
use std::path::PathBuf;
use swupdate_agent::config::DEFAULT_CONFIG_PATH;
use swupdate_agent::identity::DeviceIdentity;
use swupdate_agent::{
    AgentCommand, AgentEvent, AgentSettings, DeploymentPoller, DeviceConfig, HttpClient,
    Pkcs11Engine, ServerConfig, SystemRebooter, UpdateAgent, fail_startup,
};
use swupdate_bootenv::{BootEnvStore, FileBackend};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(version, about = "Bootloader-coordinated update agent")]
struct Args {
    /// Agent configuration file
    #[arg(short = 'f', long = "config", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

fn build_poller(
    config: &DeviceConfig,
    settings: &AgentSettings,
) -> swupdate_agent::Result<DeploymentPoller> {
    let server = ServerConfig::from_lookup(config)?;
    let engine = Pkcs11Engine::new(settings.pkcs11_module.clone());
    let client = HttpClient::for_server(&server, &engine, settings.http_timeout())?;
    Ok(DeploymentPoller::new(client, &server))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("swupdate_agent=debug".parse()?)
                .add_directive("swupdate_bootenv=debug".parse()?),
        )
        .init();

    let args = Args::parse();
    info!("Starting swupdate-agent {}", env!("CARGO_PKG_VERSION"));

    let loaded = DeviceConfig::load_with_settings(&args.config);
    let settings = match loaded {
        Ok((_, ref settings)) => settings.clone(),
        Err(_) => AgentSettings::default(),
    };

    let store = BootEnvStore::new(FileBackend::new(
        settings.fw_env_config.clone(),
        settings.dt_namespace_path.clone(),
    ));

    let config = match loaded {
        Ok((config, _)) => config,
        Err(e) => {
            // The last boot still gets confirmed with the default environment
            let e = fail_startup(&store, e);
            return Err(anyhow::Error::new(e).context(format!(
                "cannot load {}",
                args.config.display()
            )));
        }
    };
    info!(
        "Loaded config: fw_env_config={}, reboot_countdown={}s",
        settings.fw_env_config.display(),
        settings.reboot_countdown_secs
    );

    let identity = DeviceIdentity::from_lookup(&config, settings.app_data_file.as_deref());
    info!("Device identity: {identity:?}");

    let poller = build_poller(&config, &settings).map_err(|e| fail_startup(&store, e))?;

    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<AgentEvent>();
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event.to_json() {
                Ok(json) => info!("Agent event: {json}"),
                Err(e) => warn!("Cannot serialize agent event: {e}"),
            }
        }
    });
    let _ = events_tx.send(AgentEvent::Identity(identity));

    let mut sigusr1 = signal(SignalKind::user_defined1())?;
    tokio::spawn(async move {
        while sigusr1.recv().await.is_some() {
            info!("SIGUSR1 received");
            if commands_tx.send(AgentCommand::CancelReboot).is_err() {
                break;
            }
        }
    });

    let mut sigterm = signal(SignalKind::terminate())?;
    let shutdown = async move {
        tokio::select! {
            _ = sigterm.recv() => info!("SIGTERM received"),
            _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
        }
    };

    let mut agent = UpdateAgent::new(
        store,
        poller,
        SystemRebooter,
        settings.reboot_countdown_secs,
        events_tx,
    );
    agent.run(commands_rx, shutdown).await?;

    Ok(())
}
