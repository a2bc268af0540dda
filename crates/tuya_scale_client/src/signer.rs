//! Request signing for the Tuya OpenAPI.
//!
//! The string to sign is
//! `METHOD \n sha256(body) \n signed-headers \n path?sorted-query`, and the
//! HMAC-SHA256 input is `access_id + [access_token] + t + nonce + string`.
//! The hex digest is upper-cased.

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Hex SHA-256 of zero bytes; the content hash of every body-less request.
pub const EMPTY_BODY_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

pub const SIGN_METHOD: &str = "HMAC-SHA256";

const METHODS: &[&str] = &["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD"];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SigningError {
    #[error("access id is empty")]
    MissingAccessId,
    #[error("access key rejected by hmac")]
    InvalidKey,
    #[error("unsupported http method {0:?}")]
    InvalidMethod(String),
    #[error("path must start with '/' and contain no whitespace: {0:?}")]
    InvalidPath(String),
    #[error("timestamp must be positive epoch millis, got {0}")]
    InvalidTimestamp(i64),
    #[error("invalid query parameter {0:?}")]
    InvalidQuery(String),
    #[error("invalid signed header {0:?}")]
    InvalidHeader(String),
}

/// The parts of an HTTP request that feed the signature.
#[derive(Clone, Debug, Default)]
pub struct CanonicalRequest<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub query: &'a [(&'a str, String)],
    /// Extra headers covered by the signature (sent in `Signature-Headers`).
    pub headers: &'a [(&'a str, &'a str)],
    pub body: Option<&'a str>,
}

impl CanonicalRequest<'_> {
    /// `path?k=v&...` with keys sorted. The same string is signed and sent.
    pub fn url_path(&self) -> String {
        if self.query.is_empty() {
            return self.path.to_string();
        }
        let mut pairs: Vec<&(&str, String)> = self.query.iter().collect();
        pairs.sort_by(|a, b| a.0.cmp(b.0).then_with(|| a.1.cmp(&b.1)));
        let query = pairs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        format!("{}?{}", self.path, query)
    }

    pub fn content_sha256(&self) -> String {
        match self.body {
            Some(body) if !body.is_empty() => hex::encode(Sha256::digest(body.as_bytes())),
            _ => EMPTY_BODY_SHA256.to_string(),
        }
    }

    /// Value for the `Signature-Headers` header, if any headers are signed.
    pub fn signature_headers(&self) -> Option<String> {
        if self.headers.is_empty() {
            return None;
        }
        let mut names: Vec<&str> = self.headers.iter().map(|(k, _)| *k).collect();
        names.sort_unstable();
        Some(names.join(":"))
    }

    pub fn string_to_sign(&self) -> Result<String, SigningError> {
        let method = self.method.to_ascii_uppercase();
        if !METHODS.contains(&method.as_str()) {
            return Err(SigningError::InvalidMethod(self.method.to_string()));
        }
        if !self.path.starts_with('/') || self.path.chars().any(char::is_whitespace) {
            return Err(SigningError::InvalidPath(self.path.to_string()));
        }
        let bad = |s: &str| s.contains(['&', '=', '\n', '\r', ' ']);
        for (key, value) in self.query {
            if key.is_empty() || bad(key) || bad(value) {
                return Err(SigningError::InvalidQuery(key.to_string()));
            }
        }

        let mut headers: Vec<&(&str, &str)> = self.headers.iter().collect();
        headers.sort_by(|a, b| a.0.cmp(b.0));
        let mut signed_headers = String::new();
        for (name, value) in headers {
            if name.is_empty() || name.contains([':', '\n', '\r']) || value.contains(['\n', '\r']) {
                return Err(SigningError::InvalidHeader(name.to_string()));
            }
            signed_headers.push_str(&format!("{name}:{value}\n"));
        }

        Ok(format!(
            "{method}\n{}\n{signed_headers}\n{}",
            self.content_sha256(),
            self.url_path()
        ))
    }
}

/// Holds the project credentials and produces request signatures.
#[derive(Clone, Debug)]
pub struct Signer {
    access_id: String,
    access_key: SecretString,
}

impl Signer {
    pub fn new(access_id: impl Into<String>, access_key: SecretString) -> Self {
        Self {
            access_id: access_id.into(),
            access_key,
        }
    }

    pub fn access_id(&self) -> &str {
        &self.access_id
    }

    /// Pure function of its inputs and the access key.
    pub fn sign(
        &self,
        request: &CanonicalRequest<'_>,
        timestamp_ms: i64,
        nonce: &str,
        access_token: Option<&str>,
    ) -> Result<String, SigningError> {
        if self.access_id.is_empty() {
            return Err(SigningError::MissingAccessId);
        }
        if timestamp_ms <= 0 {
            return Err(SigningError::InvalidTimestamp(timestamp_ms));
        }
        let string_to_sign = request.string_to_sign()?;

        let mut mac = HmacSha256::new_from_slice(self.access_key.expose_secret().as_bytes())
            .map_err(|_| SigningError::InvalidKey)?;
        mac.update(self.access_id.as_bytes());
        if let Some(token) = access_token {
            mac.update(token.as_bytes());
        }
        mac.update(timestamp_ms.to_string().as_bytes());
        mac.update(nonce.as_bytes());
        mac.update(string_to_sign.as_bytes());
        Ok(hex::encode_upper(mac.finalize().into_bytes()))
    }
}
