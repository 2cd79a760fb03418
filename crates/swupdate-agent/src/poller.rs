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

//! Controller base polling
//!
//! The controller base resource tells the device how often to poll
//! (`config.polling.sleep`) and, when a deployment is pending, links to it
//! (`_links.deploymentBase.href`).

use crate::config::ServerConfig;
use crate::error::{AgentError, ProtocolError, Result};
use crate::http::HttpClient;
use crate::session::{DEFAULT_POLL_INTERVAL_SECS, PollResult, UpdateSession};
use serde::Deserialize;
use tracing::{debug, info, warn};

const DEPLOYMENT_MARKER: &str = "deploymentBase/";

#[derive(Debug, Deserialize)]
struct ControllerBase {
    config: Option<ControllerConfig>,
    #[serde(rename = "_links", default)]
    links: Option<Links>,
}

#[derive(Debug, Deserialize)]
struct ControllerConfig {
    #[serde(default)]
    polling: Option<Polling>,
}

#[derive(Debug, Deserialize)]
struct Polling {
    #[serde(default)]
    sleep: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Links {
    #[serde(rename = "deploymentBase", default)]
    deployment_base: Option<Link>,
}

#[derive(Debug, Deserialize)]
struct Link {
    href: String,
}

#[derive(Debug, Clone)]
pub struct DeploymentPoller {
    client: HttpClient,
    controller_uri: String,
}

impl DeploymentPoller {
    pub fn new(client: HttpClient, server: &ServerConfig) -> Self {
        let controller_uri = server.controller_uri();
        info!("Polling controller at {controller_uri}");
        Self {
            client,
            controller_uri,
        }
    }

    pub fn controller_uri(&self) -> &str {
        &self.controller_uri
    }

    /// Fetch the controller base and record the result in `session`. On
    /// error the session is left untouched.
    pub async fn poll(&self, session: &mut UpdateSession) -> Result<PollResult> {
        let body = self.client.get(&self.controller_uri).await;
        if body.trim().is_empty() {
            return Err(AgentError::Transport(
                "no data from update server".to_string(),
            ));
        }

        let result = interpret_response(&body, session)?;
        session.record_poll(&result);
        debug!(
            "Poll result: interval={}s action_id={:?} new={}",
            result.poll_interval_secs, result.deployment_action_id, result.has_new_deployment
        );
        Ok(result)
    }
}

/// Interpret a controller base document.
///
/// A missing or unreadable `sleep` resets the interval to the default, even
/// when an interval was learned earlier in the session.
pub fn interpret_response(
    body: &str,
    session: &UpdateSession,
) -> std::result::Result<PollResult, ProtocolError> {
    let base: ControllerBase = serde_json::from_str(body)
        .map_err(|e| ProtocolError::MalformedResponse(e.to_string()))?;

    let config = base.config.ok_or(ProtocolError::NoConfig)?;

    let sleep = config.polling.and_then(|p| p.sleep);
    let poll_interval_secs = match sleep.as_deref().map(parse_sleep) {
        Some(Some(secs)) => secs,
        Some(None) => {
            warn!(
                "Invalid polling interval {:?}, using {DEFAULT_POLL_INTERVAL_SECS}s",
                sleep.unwrap_or_default()
            );
            DEFAULT_POLL_INTERVAL_SECS
        }
        None => {
            debug!("No polling interval in response, using {DEFAULT_POLL_INTERVAL_SECS}s");
            DEFAULT_POLL_INTERVAL_SECS
        }
    };

    let deployment_action_id = base
        .links
        .and_then(|l| l.deployment_base)
        .map(|link| parse_action_id(&link.href))
        .transpose()?;

    let has_new_deployment = deployment_action_id.is_some() && !session.update_installed;
    if let Some(id) = deployment_action_id {
        if has_new_deployment {
            info!("New deployment available: action {id}");
        } else {
            debug!("Deployment {id} already handed to the bootloader");
        }
    }

    Ok(PollResult {
        poll_interval_secs,
        deployment_action_id,
        has_new_deployment,
    })
}

/// `HH:MM:SS` to seconds
pub fn parse_sleep(value: &str) -> Option<u64> {
    let mut parts = value.trim().split(':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds: u64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || minutes >= 60 || seconds >= 60 {
        return None;
    }
    hours
        .checked_mul(3600)?
        .checked_add(minutes * 60 + seconds)
}

/// Action id between `deploymentBase/` and the query string
pub fn parse_action_id(href: &str) -> std::result::Result<u64, ProtocolError> {
    let start = href
        .find(DEPLOYMENT_MARKER)
        .map(|i| i + DEPLOYMENT_MARKER.len())
        .ok_or_else(|| ProtocolError::MalformedLink(href.to_string()))?;
    let rest = &href[start..];
    let segment = rest.split_once('?').map_or(rest, |(segment, _)| segment);

    segment
        .parse::<u64>()
        .map_err(|_| ProtocolError::MalformedLink(href.to_string()))
}
