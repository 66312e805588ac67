//! Content key resolution for common-encryption streams.
//!
//! Keys either come from the caller as `KID:KEY` pairs or from a license
//! exchange driven by a [`ContentDecryptionModule`]. The CDM is an external
//! capability. This module only moves bytes between it and the license
//! server.

use std::{collections::HashMap, fmt, sync::Arc};

use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;

use crate::{
    decrypt::is_valid_kid_key_pair,
    error::{TsumugiError, TsumugiResult},
    model::EncryptionContext,
    util::http::HttpClient,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Signing,
    Content,
    OperatorSession,
    Other,
}

/// A key as reported by a CDM session.
#[derive(Clone, PartialEq, Eq)]
pub struct CdmKey {
    pub kid: Vec<u8>,
    pub key: Vec<u8>,
    pub key_type: KeyType,
}

impl fmt::Debug for CdmKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CdmKey")
            .field("kid", &hex::encode(&self.kid))
            .field("key_type", &self.key_type)
            .finish_non_exhaustive()
    }
}

pub trait CdmSession: Send {
    /// Build a license challenge for `pssh` (decoded PSSH box).
    fn challenge(&mut self, pssh: &[u8]) -> TsumugiResult<Vec<u8>>;

    /// Feed the license server's response into the session.
    fn parse_license(&mut self, license: &[u8]) -> TsumugiResult<()>;

    fn keys(&self) -> Vec<CdmKey>;
}

/// A content decryption module. Dropping a session closes it.
pub trait ContentDecryptionModule: Send + Sync {
    fn open(&self) -> TsumugiResult<Box<dyn CdmSession>>;
}

/// A hex `KID:KEY` pair used to decrypt one track.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ContentKey {
    pub kid: String,
    pub key: String,
}

impl ContentKey {
    /// Parse `KID:KEY`, both 32 hex characters.
    pub fn parse(pair: &str) -> TsumugiResult<Self> {
        let (kid, key) = pair
            .trim()
            .split_once(':')
            .ok_or_else(|| TsumugiError::InvalidKeyPair(pair.to_string()))?;
        if !is_valid_kid_key_pair(kid, key) {
            return Err(TsumugiError::InvalidKeyPair(pair.to_string()));
        }

        Ok(Self {
            kid: kid.to_ascii_lowercase(),
            key: key.to_ascii_lowercase(),
        })
    }

    /// Parse `;` or whitespace separated pairs.
    pub fn parse_list(pairs: &str) -> TsumugiResult<Vec<Self>> {
        pairs
            .split(|c: char| c == ';' || c.is_whitespace())
            .filter(|pair| !pair.is_empty())
            .map(Self::parse)
            .collect()
    }

    pub fn to_pair(&self) -> String {
        format!("{}:{}", self.kid, self.key)
    }
}

impl fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentKey")
            .field("kid", &self.kid)
            .finish_non_exhaustive()
    }
}

/// Where and how to ask for a license.
#[derive(Debug, Clone, Default)]
pub struct LicenseRequest {
    pub license_url: Option<String>,
    pub headers: HashMap<String, String>,
    /// JSON body template. The base64 challenge is inserted under
    /// `challenge`. Without a payload the raw challenge is posted.
    pub payload: Option<Value>,
}

/// Decode and sanity check a base64 PSSH.
pub fn validate_pssh(pssh: &str) -> TsumugiResult<Vec<u8>> {
    let pssh = pssh.trim();
    if pssh.is_empty() {
        return Err(TsumugiError::DecryptionError(
            "manifest carries no PSSH".to_string(),
        ));
    }

    let data = STANDARD
        .decode(pssh)
        .map_err(|e| TsumugiError::DecryptionError(format!("invalid PSSH: {e}")))?;
    if data.is_empty() {
        return Err(TsumugiError::DecryptionError("empty PSSH".to_string()));
    }
    Ok(data)
}

/// A license response is either the raw license or a JSON object with a
/// base64 `license` field.
pub fn parse_license_response(body: &[u8]) -> TsumugiResult<Vec<u8>> {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(envelope)) => match envelope.get("license") {
            Some(Value::String(license)) => Ok(STANDARD.decode(license.trim())?),
            _ => Err(TsumugiError::DecryptionError(
                "license response has no license field".to_string(),
            )),
        },
        _ => Ok(body.to_vec()),
    }
}

pub struct KeyProvider {
    client: HttpClient,
    cdm: Option<Arc<dyn ContentDecryptionModule>>,
    manual_keys: Vec<ContentKey>,
}

impl KeyProvider {
    pub fn new(client: HttpClient) -> Self {
        Self {
            client,
            cdm: None,
            manual_keys: Vec::new(),
        }
    }

    pub fn with_cdm(mut self, cdm: Arc<dyn ContentDecryptionModule>) -> Self {
        self.cdm = Some(cdm);
        self
    }

    pub fn with_keys(mut self, keys: Vec<ContentKey>) -> Self {
        self.manual_keys = keys;
        self
    }

    /// Resolve the content keys for `context`. Manual keys win over the CDM.
    pub async fn resolve(
        &self,
        context: &EncryptionContext,
        request: &LicenseRequest,
    ) -> TsumugiResult<Vec<ContentKey>> {
        let EncryptionContext::Cenc { pssh, license_url } = context else {
            return Err(TsumugiError::DecryptionError(
                "keys can only be resolved for common encryption".to_string(),
            ));
        };

        if !self.manual_keys.is_empty() {
            tracing::info!("Using {} manually supplied key(s).", self.manual_keys.len());
            return Ok(self.manual_keys.clone());
        }

        let pssh = validate_pssh(pssh)?;
        let license_url = request
            .license_url
            .as_deref()
            .or(license_url.as_deref())
            .ok_or_else(|| TsumugiError::DecryptionError("no license URL".to_string()))?;
        let cdm = self.cdm.as_ref().ok_or_else(|| {
            TsumugiError::DecryptionError(
                "no CDM available, content keys must be supplied".to_string(),
            )
        })?;

        let mut session = cdm.open()?;
        let challenge = session.challenge(&pssh)?;
        let license = self.request_license(license_url, request, challenge).await?;
        session.parse_license(&license)?;

        let keys: Vec<ContentKey> = session
            .keys()
            .into_iter()
            .filter(|key| key.key_type == KeyType::Content)
            .map(|key| ContentKey {
                kid: hex::encode(key.kid),
                key: hex::encode(key.key),
            })
            .collect();
        if keys.is_empty() {
            return Err(TsumugiError::DecryptionError(
                "no content keys found".to_string(),
            ));
        }

        for key in &keys {
            tracing::info!("Got content key for KID {}", key.kid);
        }
        Ok(keys)
    }

    async fn request_license(
        &self,
        license_url: &str,
        request: &LicenseRequest,
        challenge: Vec<u8>,
    ) -> TsumugiResult<Vec<u8>> {
        let mut builder = self.client.post(license_url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        builder = match &request.payload {
            Some(Value::Object(payload)) => {
                let mut payload = payload.clone();
                payload.insert(
                    "challenge".to_string(),
                    Value::String(STANDARD.encode(&challenge)),
                );
                builder.json(&payload)
            }
            Some(_) => {
                return Err(TsumugiError::DecryptionError(
                    "license payload must be a JSON object".to_string(),
                ))
            }
            None => builder
                .header(CONTENT_TYPE, "application/octet-stream")
                .body(challenge),
        };

        let response = builder.send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(TsumugiError::DecryptionError(format!(
                "license server returned {status}: {}",
                String::from_utf8_lossy(&body)
            )));
        }

        parse_license_response(&body)
    }
}
