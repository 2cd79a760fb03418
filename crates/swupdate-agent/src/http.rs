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

//! Blocking-per-call HTTP client for the update server
//!
//! Failures are logged and reported as an empty body (GET) or `false`
//! (POST/PUT). There is no retry here: the next poll cycle is the retry.

use crate::config::ServerConfig;
use crate::credentials::{SecurityEngine, read_certificates};
use crate::error::{AgentError, Result};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, redirect};
use rustls::client::ResolvesClientCert;
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, RootCertStore, SignatureScheme};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

const USER_AGENT: &str = concat!("swupdate-agent/", env!("CARGO_PKG_VERSION"));
const MAX_REDIRECTS: usize = 10;

/// Always presents the one configured client certificate
#[derive(Debug)]
struct ClientCertResolver(Arc<CertifiedKey>);

impl ResolvesClientCert for ClientCertResolver {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }

    fn has_certs(&self) -> bool {
        true
    }
}

/// TLS settings for `server`: public web roots plus the optional `cafile`,
/// and the client certificate when one is configured.
pub fn tls_config(server: &ServerConfig, engine: &dyn SecurityEngine) -> Result<ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let mut roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    if let Some(ref ca_file) = server.ca_file {
        let certs = read_certificates(ca_file)?;
        if certs.is_empty() {
            return Err(AgentError::Credentials(format!(
                "no CA certificate in {}",
                ca_file.display()
            )));
        }
        for cert in certs {
            roots.add(cert).map_err(|e| {
                AgentError::Credentials(format!("Invalid CA certificate: {e}"))
            })?;
        }
    }

    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| AgentError::Config(format!("TLS setup failed: {e}")))?
        .with_root_certificates(roots);

    let Some(credentials) = server.client_credentials() else {
        return Ok(builder.with_no_client_auth());
    };

    if credentials.uses_engine() {
        info!(
            "Loading client credentials through {} engine (key: {}, cert: {})",
            engine.name(),
            credentials.key,
            credentials.cert
        );
    } else {
        info!(
            "Using client certificate {} with key {}",
            credentials.cert, credentials.key
        );
    }
    let certified = credentials.certified_key(engine, &provider)?;
    Ok(builder.with_client_cert_resolver(Arc::new(ClientCertResolver(Arc::new(certified)))))
}

#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    authorization: Option<String>,
}

impl HttpClient {
    /// Client without client certificates or tokens
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Self::builder(timeout)
            .build()
            .map_err(|e| AgentError::Config(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            authorization: None,
        })
    }

    /// Client authenticated for `server`. Credentials are only attached to
    /// secure endpoints; certificate verification stays enabled.
    pub fn for_server(
        server: &ServerConfig,
        engine: &dyn SecurityEngine,
        timeout: Duration,
    ) -> Result<Self> {
        let tls = tls_config(server, engine)?;
        let client = Self::builder(timeout)
            .use_preconfigured_tls(tls)
            .build()
            .map_err(|e| AgentError::Config(format!("Failed to build HTTP client: {e}")))?;

        let authorization = server
            .target_token
            .as_ref()
            .map(|t| format!("TargetToken {t}"))
            .or_else(|| {
                server
                    .gateway_token
                    .as_ref()
                    .map(|t| format!("GatewayToken {t}"))
            });

        Ok(Self {
            client,
            authorization,
        })
    }

    fn builder(timeout: Duration) -> reqwest::ClientBuilder {
        Client::builder()
            .use_rustls_tls()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .redirect(redirect::Policy::limited(MAX_REDIRECTS))
    }

    fn request(&self, method: Method, uri: &str) -> reqwest::RequestBuilder {
        let request = self
            .client
            .request(method, uri)
            .header(ACCEPT, "application/json");
        match self.authorization {
            Some(ref value) => request.header(AUTHORIZATION, value),
            None => request,
        }
    }

    /// GET `uri`; an empty string means no data.
    pub async fn get(&self, uri: &str) -> String {
        match self.try_get(uri).await {
            Ok(body) => body,
            Err(e) => {
                error!("GET {uri} failed: {e}");
                String::new()
            }
        }
    }

    async fn try_get(&self, uri: &str) -> Result<String> {
        let response = self
            .request(Method::GET, uri)
            .send()
            .await
            .map_err(|e| AgentError::Transport(format!("Request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::Transport(format!("server returned {status}")));
        }

        response
            .text()
            .await
            .map_err(|e| AgentError::Transport(format!("Failed to read response: {e}")))
    }

    /// POST a JSON document
    pub async fn post(&self, uri: &str, body: &str) -> bool {
        self.send_json(Method::POST, uri, body).await
    }

    /// PUT a JSON document
    pub async fn put(&self, uri: &str, body: &str) -> bool {
        self.send_json(Method::PUT, uri, body).await
    }

    async fn send_json(&self, method: Method, uri: &str, body: &str) -> bool {
        let result = self
            .request(method.clone(), uri)
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_string())
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                error!("{method} {uri} failed: server returned {}", response.status());
                false
            }
            Err(e) => {
                error!("{method} {uri} failed: {e}");
                false
            }
        }
    }
}
