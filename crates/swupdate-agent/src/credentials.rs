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

//! Client certificate references
//!
//! A key or certificate reference is either a filesystem path or a hardware
//! token URI (`pkcs11:...`). The kind is decided once, when the credentials
//! are built, and each half is classified on its own: an engine-backed key
//! may go with a certificate file and vice versa.

use crate::error::{AgentError, Result};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::{CertifiedKey, SigningKey};
use std::fmt;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const ENGINE_URI_PREFIX: &str = "pkcs11:";

pub fn is_engine_uri(reference: &str) -> bool {
    reference
        .get(..ENGINE_URI_PREFIX.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(ENGINE_URI_PREFIX))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    File(PathBuf),
    Engine(String),
}

impl CredentialSource {
    pub fn from_ref(reference: &str) -> Self {
        if is_engine_uri(reference) {
            Self::Engine(reference.to_string())
        } else {
            Self::File(PathBuf::from(reference))
        }
    }

    pub fn is_engine_backed(&self) -> bool {
        matches!(self, Self::Engine(_))
    }
}

impl fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Engine(uri) => write!(f, "{uri} (engine)"),
        }
    }
}

/// Hardware security engine holding client keys and certificates.
///
/// Private keys never leave the engine: it hands out a signing key that
/// performs the TLS handshake signature on the token.
pub trait SecurityEngine: fmt::Debug + Send + Sync {
    fn name(&self) -> &str;

    fn load_signing_key(&self, uri: &str) -> Result<Arc<dyn SigningKey>>;

    /// DER certificate chain, leaf first
    fn load_certificate_chain(&self, uri: &str) -> Result<Vec<CertificateDer<'static>>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCredentials {
    pub key: CredentialSource,
    pub cert: CredentialSource,
}

impl ClientCredentials {
    /// Both references must be set for mutual TLS.
    pub fn from_refs(key: &str, cert: &str) -> Option<Self> {
        let (key, cert) = (key.trim(), cert.trim());
        if key.is_empty() || cert.is_empty() {
            return None;
        }
        Some(Self {
            key: CredentialSource::from_ref(key),
            cert: CredentialSource::from_ref(cert),
        })
    }

    pub fn uses_engine(&self) -> bool {
        self.key.is_engine_backed() || self.cert.is_engine_backed()
    }

    /// Certificate chain and signing key for the TLS client. File-backed
    /// keys are loaded through `provider`, engine-backed ones stay in the
    /// engine.
    pub fn certified_key(
        &self,
        engine: &dyn SecurityEngine,
        provider: &CryptoProvider,
    ) -> Result<CertifiedKey> {
        let chain = match &self.cert {
            CredentialSource::File(path) => read_certificates(path)?,
            CredentialSource::Engine(uri) => engine.load_certificate_chain(uri)?,
        };
        if chain.is_empty() {
            return Err(AgentError::Credentials(format!(
                "no certificate found in {}",
                self.cert
            )));
        }

        let key = match &self.key {
            CredentialSource::File(path) => provider
                .key_provider
                .load_private_key(read_private_key(path)?)
                .map_err(|e| {
                    AgentError::Credentials(format!("unusable key {}: {e}", path.display()))
                })?,
            CredentialSource::Engine(uri) => engine.load_signing_key(uri)?,
        };

        Ok(CertifiedKey::new(chain, key))
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| AgentError::Credentials(format!("cannot read {}: {e}", path.display())))
}

/// All certificates in a PEM file
pub fn read_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = read_pem(path)?;
    let mut reader = BufReader::new(&pem[..]);
    rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| AgentError::Credentials(format!("invalid PEM in {}: {e}", path.display())))
}

fn read_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = read_pem(path)?;
    let mut reader = BufReader::new(&pem[..]);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| AgentError::Credentials(format!("invalid PEM in {}: {e}", path.display())))?
        .ok_or_else(|| AgentError::Credentials(format!("no private key in {}", path.display())))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rustls::SignatureScheme;

    pub(crate) const DEVICE_KEY: &str =
        concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/device.key");
    pub(crate) const DEVICE_CERT: &str =
        concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/device.crt");

    /// Engine backed by the PEM fixtures, recording what was asked of it
    #[derive(Debug, Default)]
    pub(crate) struct FixtureEngine {
        pub(crate) requests: Mutex<Vec<String>>,
    }

    impl SecurityEngine for FixtureEngine {
        fn name(&self) -> &str {
            "fixture"
        }

        fn load_signing_key(&self, uri: &str) -> Result<Arc<dyn SigningKey>> {
            self.requests.lock().push(format!("key {uri}"));
            let der = read_private_key(Path::new(DEVICE_KEY))?;
            Ok(rustls::crypto::ring::default_provider()
                .key_provider
                .load_private_key(der)
                .unwrap())
        }

        fn load_certificate_chain(&self, uri: &str) -> Result<Vec<CertificateDer<'static>>> {
            self.requests.lock().push(format!("cert {uri}"));
            read_certificates(Path::new(DEVICE_CERT))
        }
    }

    fn provider() -> CryptoProvider {
        rustls::crypto::ring::default_provider()
    }

    #[test]
    fn test_engine_uri_prefix_is_case_insensitive() {
        assert!(is_engine_uri("pkcs11:token=dev;object=key"));
        assert!(is_engine_uri("PKCS11:object=key"));
        assert!(is_engine_uri("Pkcs11:"));
        assert!(!is_engine_uri("/etc/ssl/pkcs11:key"));
        assert!(!is_engine_uri("pkcs1"));
        assert!(!is_engine_uri(""));
    }

    #[test]
    fn test_both_refs_required() {
        assert!(ClientCredentials::from_refs("", "/c.pem").is_none());
        assert!(ClientCredentials::from_refs("/k.pem", " ").is_none());
        let creds = ClientCredentials::from_refs("/k.pem", "/c.pem").unwrap();
        assert!(!creds.uses_engine());
    }

    #[test]
    fn test_key_and_cert_classified_independently() {
        let creds = ClientCredentials::from_refs("pkcs11:object=key", "/c.pem").unwrap();
        assert!(creds.key.is_engine_backed());
        assert_eq!(creds.cert, CredentialSource::File(PathBuf::from("/c.pem")));
        assert!(creds.uses_engine());
    }

    #[test]
    fn test_file_credentials() {
        let creds = ClientCredentials::from_refs(DEVICE_KEY, DEVICE_CERT).unwrap();
        let engine = FixtureEngine::default();

        let key = creds.certified_key(&engine, &provider()).unwrap();
        assert_eq!(key.cert.len(), 1);
        assert!(
            key.key
                .choose_scheme(&[SignatureScheme::ECDSA_NISTP256_SHA256])
                .is_some()
        );
        assert!(engine.requests.lock().is_empty());
    }

    #[test]
    fn test_engine_key_with_certificate_file() {
        let creds =
            ClientCredentials::from_refs("pkcs11:object=device-key", DEVICE_CERT).unwrap();
        let engine = FixtureEngine::default();

        let key = creds.certified_key(&engine, &provider()).unwrap();
        let signer = key
            .key
            .choose_scheme(&[SignatureScheme::ECDSA_NISTP256_SHA256])
            .unwrap();
        assert!(!signer.sign(b"handshake transcript").unwrap().is_empty());
        assert_eq!(
            *engine.requests.lock(),
            vec!["key pkcs11:object=device-key".to_string()]
        );
    }

    #[test]
    fn test_engine_certificate_with_key_file() {
        let creds =
            ClientCredentials::from_refs(DEVICE_KEY, "pkcs11:object=device-cert").unwrap();
        let engine = FixtureEngine::default();

        creds.certified_key(&engine, &provider()).unwrap();
        assert_eq!(
            *engine.requests.lock(),
            vec!["cert pkcs11:object=device-cert".to_string()]
        );
    }

    #[test]
    fn test_missing_key_file() {
        let creds =
            ClientCredentials::from_refs("/nonexistent/k.pem", "/nonexistent/c.pem").unwrap();
        assert!(matches!(
            creds.certified_key(&FixtureEngine::default(), &provider()),
            Err(AgentError::Credentials(_))
        ));
    }

    #[test]
    fn test_certificate_file_without_certificates() {
        let creds = ClientCredentials::from_refs(DEVICE_KEY, DEVICE_KEY).unwrap();
        let err = creds
            .certified_key(&FixtureEngine::default(), &provider())
            .unwrap_err();
        assert!(matches!(err, AgentError::Credentials(ref m) if m.contains("no certificate")));
    }
}
