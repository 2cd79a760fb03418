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

//! PKCS#11 security engine
//!
//! Keys and certificates are addressed with RFC 7512 URIs such as
//! `pkcs11:token=device;object=client?pin-source=/etc/token.pin`. The private
//! key stays on the token; the TLS handshake signature is computed there.

use crate::credentials::SecurityEngine;
use crate::error::{AgentError, Result};
use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::mechanism::rsa::{PkcsMgfType, PkcsPssParams};
use cryptoki::mechanism::{Mechanism, MechanismType};
use cryptoki::object::{Attribute, AttributeType, KeyType, ObjectClass, ObjectHandle};
use cryptoki::session::{Session, UserType};
use cryptoki::slot::Slot;
use cryptoki::types::AuthPin;
use parking_lot::Mutex;
use rustls::pki_types::CertificateDer;
use rustls::sign::{Signer, SigningKey};
use rustls::{SignatureAlgorithm, SignatureScheme};
use sha2::{Digest, Sha256, Sha384};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const URI_SCHEME: &str = "pkcs11:";

// DER encoded named curve OIDs as found in CKA_EC_PARAMS
const EC_PARAMS_P256: &[u8] = &[0x06, 0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07];
const EC_PARAMS_P384: &[u8] = &[0x06, 0x05, 0x2b, 0x81, 0x04, 0x00, 0x22];

/// The parts of a `pkcs11:` URI used to find an object
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pkcs11Uri {
    pub token: Option<String>,
    pub serial: Option<String>,
    pub object: Option<String>,
    pub id: Option<Vec<u8>>,
    pub pin_value: Option<String>,
    pub pin_source: Option<PathBuf>,
    pub module_path: Option<PathBuf>,
}

fn invalid_uri(uri: &str, reason: &str) -> AgentError {
    AgentError::Credentials(format!("invalid PKCS#11 URI {uri}: {reason}"))
}

fn percent_decode(value: &str) -> Option<Vec<u8>> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = value.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Some(out)
}

impl Pkcs11Uri {
    pub fn parse(uri: &str) -> Result<Self> {
        let rest = uri
            .get(..URI_SCHEME.len())
            .filter(|scheme| scheme.eq_ignore_ascii_case(URI_SCHEME))
            .map(|_| &uri[URI_SCHEME.len()..])
            .ok_or_else(|| invalid_uri(uri, "not a pkcs11 URI"))?;
        let (path, query) = rest.split_once('?').unwrap_or((rest, ""));

        let mut parsed = Self::default();
        let attributes = path
            .split(';')
            .chain(query.split('&'))
            .filter(|attr| !attr.is_empty());

        for attr in attributes {
            let (name, raw) = attr
                .split_once('=')
                .ok_or_else(|| invalid_uri(uri, "attribute without value"))?;
            let value = percent_decode(raw).ok_or_else(|| invalid_uri(uri, "bad escape"))?;
            let text = || {
                String::from_utf8(value.clone()).map_err(|_| invalid_uri(uri, "not UTF-8"))
            };

            match name {
                "token" => parsed.token = Some(text()?),
                "serial" => parsed.serial = Some(text()?),
                "object" => parsed.object = Some(text()?),
                "id" => parsed.id = Some(value.clone()),
                "pin-value" => parsed.pin_value = Some(text()?),
                "pin-source" => {
                    let source = text()?;
                    let path = source.strip_prefix("file:").unwrap_or(&source);
                    parsed.pin_source = Some(PathBuf::from(path));
                }
                "module-path" => parsed.module_path = Some(PathBuf::from(text()?)),
                _ => debug!("Ignoring PKCS#11 URI attribute {name}"),
            }
        }

        if parsed.object.is_none() && parsed.id.is_none() {
            return Err(invalid_uri(uri, "needs object or id"));
        }
        Ok(parsed)
    }

    fn pin(&self) -> Result<Option<String>> {
        if let Some(ref pin) = self.pin_value {
            return Ok(Some(pin.clone()));
        }
        let Some(ref path) = self.pin_source else {
            return Ok(None);
        };
        let pin = std::fs::read_to_string(path).map_err(|e| {
            AgentError::Credentials(format!("cannot read PIN from {}: {e}", path.display()))
        })?;
        Ok(Some(pin.trim_end_matches(['\r', '\n']).to_string()))
    }

    fn template(&self, class: ObjectClass) -> Vec<Attribute> {
        let mut template = vec![Attribute::Class(class)];
        if let Some(ref label) = self.object {
            template.push(Attribute::Label(label.as_bytes().to_vec()));
        }
        if let Some(ref id) = self.id {
            template.push(Attribute::Id(id.clone()));
        }
        template
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyKind {
    Rsa,
    EcP256,
    EcP384,
}

impl KeyKind {
    fn from_ec_params(params: &[u8]) -> Option<Self> {
        match params {
            EC_PARAMS_P256 => Some(Self::EcP256),
            EC_PARAMS_P384 => Some(Self::EcP384),
            _ => None,
        }
    }

    fn algorithm(self) -> SignatureAlgorithm {
        match self {
            Self::Rsa => SignatureAlgorithm::RSA,
            Self::EcP256 | Self::EcP384 => SignatureAlgorithm::ECDSA,
        }
    }

    /// Supported schemes, most preferred first. TLS 1.3 only accepts PSS
    /// for RSA keys.
    fn schemes(self) -> &'static [SignatureScheme] {
        match self {
            Self::Rsa => &[
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
            ],
            Self::EcP256 => &[SignatureScheme::ECDSA_NISTP256_SHA256],
            Self::EcP384 => &[SignatureScheme::ECDSA_NISTP384_SHA384],
        }
    }

    fn choose(self, offered: &[SignatureScheme]) -> Option<SignatureScheme> {
        self.schemes()
            .iter()
            .copied()
            .find(|scheme| offered.contains(scheme))
    }
}

fn der_length(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        out.push(len as u8);
    } else if len <= 0xff {
        out.extend_from_slice(&[0x81, len as u8]);
    } else {
        out.extend_from_slice(&[0x82, (len >> 8) as u8, len as u8]);
    }
}

fn der_integer(out: &mut Vec<u8>, bytes: &[u8]) {
    let start = bytes
        .iter()
        .position(|&b| b != 0)
        .unwrap_or(bytes.len().saturating_sub(1));
    let bytes = &bytes[start..];
    let pad = bytes.first().is_some_and(|&b| b & 0x80 != 0);

    out.push(0x02);
    der_length(out, bytes.len() + usize::from(pad));
    if pad {
        out.push(0);
    }
    out.extend_from_slice(bytes);
}

/// PKCS#11 returns ECDSA signatures as `r || s`; TLS wants a DER
/// `Ecdsa-Sig-Value`.
fn ecdsa_raw_to_der(raw: &[u8]) -> Option<Vec<u8>> {
    if raw.is_empty() || raw.len() % 2 != 0 {
        return None;
    }
    let (r, s) = raw.split_at(raw.len() / 2);
    let mut body = Vec::with_capacity(raw.len() + 8);
    der_integer(&mut body, r);
    der_integer(&mut body, s);

    let mut out = vec![0x30];
    der_length(&mut out, body.len());
    out.extend(body);
    Some(out)
}

fn token_error(action: &str, e: cryptoki::error::Error) -> AgentError {
    AgentError::Credentials(format!("PKCS#11 {action} failed: {e}"))
}

fn pss(hash_alg: MechanismType, mgf: PkcsMgfType, salt_len: u64) -> PkcsPssParams {
    PkcsPssParams {
        hash_alg,
        mgf,
        s_len: salt_len.into(),
    }
}

fn token_sign(
    session: &Session,
    key: ObjectHandle,
    scheme: SignatureScheme,
    message: &[u8],
) -> Result<Vec<u8>> {
    let sign = |mechanism: &Mechanism<'_>, data: &[u8]| {
        session
            .sign(mechanism, key, data)
            .map_err(|e| token_error("sign", e))
    };
    let ecdsa = |raw: Vec<u8>| {
        ecdsa_raw_to_der(&raw)
            .ok_or_else(|| AgentError::Credentials("malformed ECDSA signature".to_string()))
    };

    match scheme {
        SignatureScheme::RSA_PKCS1_SHA256 => sign(&Mechanism::Sha256RsaPkcs, message),
        SignatureScheme::RSA_PKCS1_SHA384 => sign(&Mechanism::Sha384RsaPkcs, message),
        SignatureScheme::RSA_PSS_SHA256 => sign(
            &Mechanism::Sha256RsaPkcsPss(pss(MechanismType::SHA256, PkcsMgfType::MGF1_SHA256, 32)),
            message,
        ),
        SignatureScheme::RSA_PSS_SHA384 => sign(
            &Mechanism::Sha384RsaPkcsPss(pss(MechanismType::SHA384, PkcsMgfType::MGF1_SHA384, 48)),
            message,
        ),
        SignatureScheme::ECDSA_NISTP256_SHA256 => {
            ecdsa(sign(&Mechanism::Ecdsa, Sha256::digest(message).as_slice())?)
        }
        SignatureScheme::ECDSA_NISTP384_SHA384 => {
            ecdsa(sign(&Mechanism::Ecdsa, Sha384::digest(message).as_slice())?)
        }
        other => Err(AgentError::Credentials(format!(
            "unsupported signature scheme {other:?}"
        ))),
    }
}

type SharedSession = Arc<Mutex<Session>>;

/// Private key object on a token
pub struct Pkcs11SigningKey {
    session: SharedSession,
    key: ObjectHandle,
    kind: KeyKind,
}

impl fmt::Debug for Pkcs11SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pkcs11SigningKey")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl SigningKey for Pkcs11SigningKey {
    fn choose_scheme(&self, offered: &[SignatureScheme]) -> Option<Box<dyn Signer>> {
        let scheme = self.kind.choose(offered)?;
        Some(Box::new(Pkcs11Signer {
            session: Arc::clone(&self.session),
            key: self.key,
            scheme,
        }))
    }

    fn algorithm(&self) -> SignatureAlgorithm {
        self.kind.algorithm()
    }
}

struct Pkcs11Signer {
    session: SharedSession,
    key: ObjectHandle,
    scheme: SignatureScheme,
}

impl fmt::Debug for Pkcs11Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pkcs11Signer")
            .field("scheme", &self.scheme)
            .finish_non_exhaustive()
    }
}

impl Signer for Pkcs11Signer {
    fn sign(&self, message: &[u8]) -> std::result::Result<Vec<u8>, rustls::Error> {
        let session = self.session.lock();
        token_sign(&session, self.key, self.scheme, message)
            .map_err(|e| rustls::Error::General(e.to_string()))
    }

    fn scheme(&self) -> SignatureScheme {
        self.scheme
    }
}

/// Engine talking to a PKCS#11 module. Modules are loaded on first use and
/// one logged-in session is kept per token.
pub struct Pkcs11Engine {
    default_module: Option<PathBuf>,
    modules: Mutex<HashMap<PathBuf, Pkcs11>>,
    sessions: Mutex<HashMap<(PathBuf, u64), SharedSession>>,
}

impl fmt::Debug for Pkcs11Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pkcs11Engine")
            .field("default_module", &self.default_module)
            .finish_non_exhaustive()
    }
}

impl Pkcs11Engine {
    /// `default_module` is used for URIs without a `module-path`
    pub fn new(default_module: Option<PathBuf>) -> Self {
        Self {
            default_module,
            modules: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn module(&self, path: &Path) -> Result<Pkcs11> {
        let mut modules = self.modules.lock();
        if let Some(module) = modules.get(path) {
            return Ok(module.clone());
        }

        info!("Loading PKCS#11 module {}", path.display());
        let module = Pkcs11::new(path).map_err(|e| token_error("module load", e))?;
        module
            .initialize(CInitializeArgs::OsThreads)
            .map_err(|e| token_error("initialize", e))?;
        modules.insert(path.to_path_buf(), module.clone());
        Ok(module)
    }

    fn find_slot(module: &Pkcs11, uri: &Pkcs11Uri) -> Result<Slot> {
        let slots = module
            .get_slots_with_token()
            .map_err(|e| token_error("slot list", e))?;
        for slot in slots {
            let info = module
                .get_token_info(slot)
                .map_err(|e| token_error("token info", e))?;
            let label_matches = uri
                .token
                .as_deref()
                .is_none_or(|token| info.label().trim_end() == token);
            let serial_matches = uri
                .serial
                .as_deref()
                .is_none_or(|serial| info.serial_number().trim_end() == serial);
            if label_matches && serial_matches {
                return Ok(slot);
            }
        }
        Err(AgentError::Credentials(format!(
            "no PKCS#11 token matching {:?}",
            uri.token
        )))
    }

    fn session(&self, uri: &Pkcs11Uri) -> Result<SharedSession> {
        let path = uri
            .module_path
            .clone()
            .or_else(|| self.default_module.clone())
            .ok_or_else(|| AgentError::Credentials("no PKCS#11 module configured".to_string()))?;
        let module = self.module(&path)?;
        let slot = Self::find_slot(&module, uri)?;

        let mut sessions = self.sessions.lock();
        let cache_key = (path, slot.id());
        if let Some(session) = sessions.get(&cache_key) {
            return Ok(Arc::clone(session));
        }

        let session = module
            .open_ro_session(slot)
            .map_err(|e| token_error("open session", e))?;
        if let Some(pin) = uri.pin()? {
            session
                .login(UserType::User, Some(&AuthPin::new(pin)))
                .map_err(|e| token_error("login", e))?;
        }

        let session = Arc::new(Mutex::new(session));
        sessions.insert(cache_key, Arc::clone(&session));
        Ok(session)
    }

    fn find_object(session: &Session, uri: &Pkcs11Uri, class: ObjectClass) -> Result<ObjectHandle> {
        session
            .find_objects(&uri.template(class))
            .map_err(|e| token_error("object search", e))?
            .into_iter()
            .next()
            .ok_or_else(|| {
                AgentError::Credentials(format!(
                    "no {class} object {:?} on token",
                    uri.object
                ))
            })
    }

    fn key_kind(session: &Session, key: ObjectHandle) -> Result<KeyKind> {
        let attributes = session
            .get_attributes(key, &[AttributeType::KeyType])
            .map_err(|e| token_error("key type", e))?;

        match attributes.first() {
            Some(Attribute::KeyType(kind)) if *kind == KeyType::RSA => Ok(KeyKind::Rsa),
            Some(Attribute::KeyType(kind)) if *kind == KeyType::EC => {
                let params = session
                    .get_attributes(key, &[AttributeType::EcParams])
                    .map_err(|e| token_error("curve", e))?;
                match params.first() {
                    Some(Attribute::EcParams(params)) => KeyKind::from_ec_params(params)
                        .ok_or_else(|| AgentError::Credentials("unsupported curve".to_string())),
                    _ => Err(AgentError::Credentials("key has no curve".to_string())),
                }
            }
            _ => Err(AgentError::Credentials("unsupported key type".to_string())),
        }
    }
}

impl SecurityEngine for Pkcs11Engine {
    fn name(&self) -> &str {
        "pkcs11"
    }

    fn load_signing_key(&self, uri: &str) -> Result<Arc<dyn SigningKey>> {
        let parsed = Pkcs11Uri::parse(uri)?;
        let session = self.session(&parsed)?;
        let (key, kind) = {
            let guard = session.lock();
            let key = Self::find_object(&guard, &parsed, ObjectClass::PRIVATE_KEY)?;
            (key, Self::key_kind(&guard, key)?)
        };

        info!("Using {kind:?} key {uri} from token");
        Ok(Arc::new(Pkcs11SigningKey { session, key, kind }))
    }

    fn load_certificate_chain(&self, uri: &str) -> Result<Vec<CertificateDer<'static>>> {
        let parsed = Pkcs11Uri::parse(uri)?;
        let session = self.session(&parsed)?;
        let guard = session.lock();
        let cert = Self::find_object(&guard, &parsed, ObjectClass::CERTIFICATE)?;

        let attributes = guard
            .get_attributes(cert, &[AttributeType::Value])
            .map_err(|e| token_error("certificate read", e))?;
        match attributes.into_iter().next() {
            Some(Attribute::Value(der)) => Ok(vec![CertificateDer::from(der)]),
            _ => Err(AgentError::Credentials(format!(
                "certificate {uri} has no value"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uri() {
        let uri = Pkcs11Uri::parse(
            "pkcs11:token=device%20token;object=client;id=%01%a0\
             ?pin-value=1234&module-path=/usr/lib/softhsm/libsofthsm2.so",
        )
        .unwrap();
        assert_eq!(uri.token.as_deref(), Some("device token"));
        assert_eq!(uri.object.as_deref(), Some("client"));
        assert_eq!(uri.id, Some(vec![0x01, 0xa0]));
        assert_eq!(uri.pin_value.as_deref(), Some("1234"));
        assert_eq!(
            uri.module_path,
            Some(PathBuf::from("/usr/lib/softhsm/libsofthsm2.so"))
        );
    }

    #[test]
    fn test_parse_uri_pin_source() {
        let uri = Pkcs11Uri::parse("PKCS11:object=key?pin-source=file:/etc/token.pin").unwrap();
        assert_eq!(uri.pin_source, Some(PathBuf::from("/etc/token.pin")));
        assert_eq!(uri.module_path, None);
    }

    #[test]
    fn test_parse_uri_rejects_malformed() {
        for uri in [
            "/etc/ssl/key.pem",
            "pkcs11:token=dev",
            "pkcs11:object",
            "pkcs11:object=%zz",
            "pkcs11:object=%4",
        ] {
            assert!(
                matches!(Pkcs11Uri::parse(uri), Err(AgentError::Credentials(_))),
                "{uri}"
            );
        }
    }

    #[test]
    fn test_pin_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("token.pin");
        std::fs::write(&path, "4711\n").unwrap();

        let uri = Pkcs11Uri::parse(&format!("pkcs11:object=k?pin-source={}", path.display()))
            .unwrap();
        assert_eq!(uri.pin().unwrap().as_deref(), Some("4711"));
        assert_eq!(
            Pkcs11Uri::parse("pkcs11:object=k").unwrap().pin().unwrap(),
            None
        );
    }

    #[test]
    fn test_template() {
        let uri = Pkcs11Uri::parse("pkcs11:object=client;id=%02").unwrap();
        assert_eq!(
            uri.template(ObjectClass::PRIVATE_KEY),
            vec![
                Attribute::Class(ObjectClass::PRIVATE_KEY),
                Attribute::Label(b"client".to_vec()),
                Attribute::Id(vec![2]),
            ]
        );
    }

    #[test]
    fn test_scheme_selection() {
        let offered = [
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
        ];
        assert_eq!(
            KeyKind::Rsa.choose(&offered),
            Some(SignatureScheme::RSA_PSS_SHA384)
        );
        assert_eq!(
            KeyKind::Rsa.choose(&[SignatureScheme::RSA_PKCS1_SHA256]),
            Some(SignatureScheme::RSA_PKCS1_SHA256)
        );
        assert_eq!(
            KeyKind::EcP256.choose(&offered),
            Some(SignatureScheme::ECDSA_NISTP256_SHA256)
        );
        assert_eq!(KeyKind::EcP384.choose(&offered), None);
        assert_eq!(KeyKind::EcP384.algorithm(), SignatureAlgorithm::ECDSA);
    }

    #[test]
    fn test_curve_from_ec_params() {
        assert_eq!(KeyKind::from_ec_params(EC_PARAMS_P256), Some(KeyKind::EcP256));
        assert_eq!(KeyKind::from_ec_params(EC_PARAMS_P384), Some(KeyKind::EcP384));
        assert_eq!(KeyKind::from_ec_params(&[0x06, 0x03, 0x2b, 0x65, 0x70]), None);
    }

    #[test]
    fn test_ecdsa_signature_encoding() {
        // r = 1, s = 0x80 needs a sign byte
        assert_eq!(
            ecdsa_raw_to_der(&[0x00, 0x01, 0x00, 0x80]).unwrap(),
            vec![0x30, 0x07, 0x02, 0x01, 0x01, 0x02, 0x02, 0x00, 0x80]
        );
        // zero stays one byte long
        assert_eq!(
            ecdsa_raw_to_der(&[0x00, 0x00, 0x7f, 0x7f]).unwrap(),
            vec![0x30, 0x07, 0x02, 0x01, 0x00, 0x02, 0x02, 0x7f, 0x7f]
        );
        assert_eq!(ecdsa_raw_to_der(&[0x01, 0x02, 0x03]), None);
        assert_eq!(ecdsa_raw_to_der(&[]), None);

        let p384 = ecdsa_raw_to_der(&[0xff; 96]).unwrap();
        assert_eq!(&p384[..3], &[0x30, 0x81, 0x66]);
    }

    #[test]
    fn test_engine_without_module() {
        let engine = Pkcs11Engine::new(None);
        let err = engine.load_signing_key("pkcs11:object=client").unwrap_err();
        assert!(matches!(err, AgentError::Credentials(ref m) if m.contains("no PKCS#11 module")));
    }

    #[test]
    fn test_engine_with_missing_module() {
        let engine = Pkcs11Engine::new(Some(PathBuf::from("/nonexistent/libpkcs11.so")));
        assert!(matches!(
            engine.load_certificate_chain("pkcs11:object=client"),
            Err(AgentError::Credentials(_))
        ));
    }
}
