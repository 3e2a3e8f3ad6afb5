//! Opaque, versioned resume state.
//!
//! Wire format: `base64(JSON{"v": <int>, ...payload fields})`. A cursor whose
//! version is newer than [`CURSOR_VERSION`] is rejected outright, whatever its
//! payload looks like.

use std::collections::BTreeMap;
use std::fmt::Debug;

use base64::{engine::general_purpose, Engine as _};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::error::ConnectorError;

/// Highest envelope version this build understands.
pub const CURSOR_VERSION: u32 = 1;

/// Provider-specific part of a cursor.
///
/// Payloads are keyed by sub-resource id. Single-token payloads ignore the key.
pub trait CursorPayload:
    Serialize + DeserializeOwned + Default + Clone + PartialEq + Debug + Send + Sync + 'static
{
    /// True when no resume token is present.
    fn is_empty(&self) -> bool;

    /// Resume token for a sub-resource, `""` when absent.
    fn token(&self, sub_resource: &str) -> &str;

    fn set_token(&mut self, sub_resource: &str, token: String);
}

/// One resume token for the whole source (Dropbox, Google Drive).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingleToken {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token: String,
}

impl CursorPayload for SingleToken {
    fn is_empty(&self) -> bool {
        self.token.is_empty()
    }

    fn token(&self, _sub_resource: &str) -> &str {
        &self.token
    }

    fn set_token(&mut self, _sub_resource: &str, token: String) {
        self.token = token;
    }
}

/// One resume token per sub-resource (calendars, mail folders).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenMap {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tokens: BTreeMap<String, String>,
}

impl TokenMap {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            tokens: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl CursorPayload for TokenMap {
    fn is_empty(&self) -> bool {
        self.tokens.values().all(|t| t.is_empty())
    }

    fn token(&self, sub_resource: &str) -> &str {
        self.tokens
            .get(sub_resource)
            .map(String::as_str)
            .unwrap_or("")
    }

    fn set_token(&mut self, sub_resource: &str, token: String) {
        self.tokens.insert(sub_resource.to_string(), token);
    }
}

/// Versioned resume state for one connector.
#[derive(Debug, Clone, PartialEq)]
pub struct Cursor<P: CursorPayload> {
    pub version: u32,
    pub payload: P,
}

#[derive(Serialize)]
struct EnvelopeOut<'a, P> {
    v: u32,
    #[serde(flatten)]
    payload: &'a P,
}

#[derive(Deserialize)]
struct EnvelopeIn<P> {
    v: u32,
    #[serde(flatten)]
    payload: P,
}

#[derive(Deserialize)]
struct VersionHeader {
    v: Option<u32>,
}

impl<P: CursorPayload> Cursor<P> {
    /// Resume point before the first sync.
    pub fn new_empty() -> Self {
        Self {
            version: CURSOR_VERSION,
            payload: P::default(),
        }
    }

    pub fn with_payload(payload: P) -> Self {
        Self {
            version: CURSOR_VERSION,
            payload,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn token(&self, sub_resource: &str) -> &str {
        self.payload.token(sub_resource)
    }

    pub fn set_token(&mut self, sub_resource: &str, token: impl Into<String>) {
        self.payload.set_token(sub_resource, token.into());
    }

    /// Serialize to the wire format. Returns `""` if serialization fails,
    /// which callers treat as "no cursor" (the next run does a full sync).
    pub fn encode(&self) -> String {
        let envelope = EnvelopeOut {
            v: self.version,
            payload: &self.payload,
        };
        match serde_json::to_vec(&envelope) {
            Ok(json) => general_purpose::STANDARD.encode(json),
            Err(e) => {
                warn!(error = %e, "Failed to encode cursor, next run will fully resync");
                String::new()
            }
        }
    }

    /// Parse the wire format. `""` yields a fresh cursor.
    pub fn decode(encoded: &str) -> Result<Self, ConnectorError> {
        let encoded = encoded.trim();
        if encoded.is_empty() {
            return Ok(Self::new_empty());
        }

        let raw = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| ConnectorError::InvalidCursor(format!("bad base64: {}", e)))?;

        // Version is checked before the payload is looked at.
        let header: VersionHeader = serde_json::from_slice(&raw)
            .map_err(|e| ConnectorError::InvalidCursor(format!("bad envelope: {}", e)))?;
        let version = header
            .v
            .ok_or_else(|| ConnectorError::InvalidCursor("missing version".to_string()))?;
        if version == 0 || version > CURSOR_VERSION {
            return Err(ConnectorError::InvalidCursor(format!(
                "unsupported cursor version {} (max {})",
                version, CURSOR_VERSION
            )));
        }

        let envelope: EnvelopeIn<P> = serde_json::from_slice(&raw)
            .map_err(|e| ConnectorError::InvalidCursor(format!("bad payload: {}", e)))?;

        Ok(Self {
            version: envelope.v,
            payload: envelope.payload,
        })
    }
}

impl<P: CursorPayload> Default for Cursor<P> {
    fn default() -> Self {
        Self::new_empty()
    }
}
