//! Service secrets and at-rest encryption of tenant refresh tokens.
//!
//! Every secret in the config file (bot token, extraction API key, Drive
//! client secret, token key) is a [`SecretSource`]: an inline `value`, a
//! `file` to read (a mounted Docker secret, say) or an `envVar` to look up.
//! The first non-empty one wins, in that order.

use std::path::Path;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("secret is not configured (set value, file or envVar)")]
    NoSourceProvided,

    #[error("cannot read secret file {path}: {source}")]
    FileReadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("environment variable {name} is not set")]
    EnvVarNotSet { name: String },

    #[error("environment variable {name} is not valid UTF-8")]
    EnvVarNotUnicode { name: String },

    #[error("token key: {0}")]
    InvalidKey(String),

    #[error("cannot seal refresh token: {0}")]
    EncryptionError(String),

    #[error("cannot open sealed refresh token: {0}")]
    DecryptionError(String),
}

pub type Result<T> = std::result::Result<T, SecretError>;

/// Where to find one secret. Deserializes from
/// `{"value": …}`, `{"file": …}` or `{"envVar": …}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_var: Option<String>,
}

enum Origin<'a> {
    Inline(&'a str),
    File(&'a str),
    Env(&'a str),
}

fn non_empty(field: &Option<String>) -> Option<&str> {
    field.as_deref().filter(|s| !s.is_empty())
}

impl SecretSource {
    pub fn from_env_var(name: &str) -> Self {
        Self {
            env_var: Some(name.to_string()),
            ..Default::default()
        }
    }

    fn origin(&self) -> Option<Origin<'_>> {
        non_empty(&self.value)
            .map(Origin::Inline)
            .or_else(|| non_empty(&self.file).map(Origin::File))
            .or_else(|| non_empty(&self.env_var).map(Origin::Env))
    }

    pub fn is_configured(&self) -> bool {
        self.origin().is_some()
    }

    /// Reads the secret. File contents and env values are trimmed; inline
    /// values are taken as written.
    pub fn resolve(&self) -> Result<SecretString> {
        let raw = match self.origin().ok_or(SecretError::NoSourceProvided)? {
            Origin::Inline(value) => return Ok(SecretString::from(value.to_string())),
            Origin::File(path) => {
                let path = expand_home(path);
                std::fs::read_to_string(Path::new(&path))
                    .map_err(|source| SecretError::FileReadError { path, source })?
            }
            Origin::Env(name) => std::env::var(name).map_err(|e| match e {
                std::env::VarError::NotPresent => SecretError::EnvVarNotSet {
                    name: name.to_string(),
                },
                std::env::VarError::NotUnicode(_) => SecretError::EnvVarNotUnicode {
                    name: name.to_string(),
                },
            })?,
        };
        Ok(SecretString::from(raw.trim().to_string()))
    }

    /// `Ok(None)` when nothing is configured; a configured source that
    /// cannot be read is still an error.
    pub fn resolve_optional(&self) -> Result<Option<SecretString>> {
        if self.is_configured() {
            self.resolve().map(Some)
        } else {
            Ok(None)
        }
    }
}

/// Replaces a leading `~` with the home directory. `~user` is left alone.
pub(crate) fn expand_home(path: &str) -> String {
    let rest = match path.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
        _ => return path.to_string(),
    };
    match dirs::home_dir() {
        Some(home) => format!("{}{}", home.display(), rest),
        None => path.to_string(),
    }
}

/// Env var read by [`TokenEncryptor::from_env`].
pub const TOKEN_KEY_ENV_VAR: &str = "CONTABOT_TOKEN_KEY";

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// AES-256-GCM sealing of the refresh tokens kept in `storage_credentials`.
///
/// The key is configured as 64 hex characters. A sealed token is base64 of
/// a fresh 12-byte nonce followed by the ciphertext and tag.
pub struct TokenEncryptor {
    cipher: Aes256Gcm,
}

impl TokenEncryptor {
    pub fn from_env() -> Result<Self> {
        let key = std::env::var(TOKEN_KEY_ENV_VAR)
            .map_err(|_| SecretError::InvalidKey(format!("{} is not set", TOKEN_KEY_ENV_VAR)))?;
        Self::from_hex_key(&key)
    }

    pub fn from_secret(key: &SecretString) -> Result<Self> {
        Self::from_hex_key(key.expose_secret())
    }

    pub fn from_hex_key(key_hex: &str) -> Result<Self> {
        let key = parse_hex_key(key_hex.trim())?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| SecretError::InvalidKey(e.to_string()))?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut sealed = vec![0u8; NONCE_LEN];
        getrandom::fill(&mut sealed)
            .map_err(|e| SecretError::EncryptionError(format!("no randomness: {}", e)))?;

        let body = self
            .cipher
            .encrypt(Nonce::from_slice(&sealed), plaintext.as_bytes())
            .map_err(|e| SecretError::EncryptionError(e.to_string()))?;
        sealed.extend_from_slice(&body);
        Ok(STANDARD.encode(sealed))
    }

    pub fn decrypt(&self, sealed: &str) -> Result<String> {
        let bytes = STANDARD
            .decode(sealed.trim())
            .map_err(|e| SecretError::DecryptionError(format!("not base64: {}", e)))?;
        if bytes.len() <= NONCE_LEN {
            return Err(SecretError::DecryptionError("truncated".to_string()));
        }

        let (nonce, body) = bytes.split_at(NONCE_LEN);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|_| SecretError::DecryptionError("wrong key or tampered data".to_string()))?;
        String::from_utf8(plain).map_err(|e| SecretError::DecryptionError(e.to_string()))
    }
}

fn parse_hex_key(text: &str) -> Result<[u8; KEY_LEN]> {
    if text.len() != KEY_LEN * 2 {
        return Err(SecretError::InvalidKey(format!(
            "expected {} hex characters, got {}",
            KEY_LEN * 2,
            text.len()
        )));
    }

    if let Some(bad) = text.chars().find(|c| !c.is_ascii_hexdigit()) {
        return Err(SecretError::InvalidKey(format!("'{}' is not a hex digit", bad)));
    }

    let mut key = [0u8; KEY_LEN];
    for (slot, i) in key.iter_mut().zip((0..text.len()).step_by(2)) {
        *slot = u8::from_str_radix(&text[i..i + 2], 16)
            .map_err(|e| SecretError::InvalidKey(e.to_string()))?;
    }
    Ok(key)
}
