//! The replay payload persisted against an idempotency key, and its wire
//! encoding for byte-valued backends.
//!
//! A [`StoredRecord`] is write-once within its TTL window: created after a
//! successful handler execution, read by replays, destroyed by expiry or
//! explicit purge. The wire format is `version || payload`, where the version
//! byte records whether the JSON payload is gzip-compressed. Readers dispatch
//! on the version, so a value is never "maybe compressed".

use crate::{Error, Result};
use bytes::Bytes;
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

/// Wire version byte: plain JSON payload.
pub const WIRE_PLAIN: u8 = 1;
/// Wire version byte: gzip-compressed JSON payload.
pub const WIRE_GZIP: u8 = 2;

/// Hop-by-hop headers, never captured into a record (RFC 7230 §6.1).
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Headers the server owns on the way back out; stripped again on restore.
const HOST_CONTROLLED: &[&str] = &["content-length", "transfer-encoding", "connection"];

/// The response captured for replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    /// HTTP status of the original response.
    pub status: u16,
    /// Serialized response body.
    #[serde(with = "base64_bytes")]
    pub body: Bytes,
    /// Captured response headers, in original order, hop-by-hop excluded.
    pub headers: Vec<(String, String)>,
    /// Wall-clock second of first write.
    pub created_at: u64,
    /// `created_at + ttl`.
    pub expires_at: u64,
}

impl StoredRecord {
    /// Builds a record stamped now, expiring `ttl_secs` seconds later.
    pub fn new(status: u16, body: Bytes, headers: Vec<(String, String)>, ttl_secs: u64) -> Self {
        let created_at = unix_now();
        Self {
            status,
            body,
            headers,
            created_at,
            expires_at: created_at + ttl_secs,
        }
    }

    /// Returns true iff `now ≥ expires_at`.
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    /// Encodes the record as `version || json`, gzipping when asked.
    pub fn encode(&self, compress: bool) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        if compress {
            let mut out = vec![WIRE_GZIP];
            let mut encoder = GzEncoder::new(&mut out, Compression::default());
            encoder
                .write_all(&json)
                .and_then(|_| encoder.finish().map(|_| ()))
                .map_err(|e| Error::backend(format!("gzip encoding failed: {e}")))?;
            Ok(out)
        } else {
            let mut out = Vec::with_capacity(json.len() + 1);
            out.push(WIRE_PLAIN);
            out.extend_from_slice(&json);
            Ok(out)
        }
    }

    /// Decodes a wire value, dispatching on its version byte.
    ///
    /// Truncated input, an unknown version, a broken gzip stream, or invalid
    /// JSON all surface as `Backend` errors; corruption is never silently
    /// mapped to an empty record.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (&version, payload) = bytes
            .split_first()
            .ok_or_else(|| Error::backend("stored record is empty"))?;
        let json = match version {
            WIRE_PLAIN => payload.to_vec(),
            WIRE_GZIP => {
                let mut decoder = GzDecoder::new(payload);
                let mut json = Vec::new();
                decoder
                    .read_to_end(&mut json)
                    .map_err(|e| Error::backend(format!("stored record failed to inflate: {e}")))?;
                json
            }
            other => {
                return Err(Error::backend(format!(
                    "stored record has unknown wire version {other}"
                )));
            }
        };
        serde_json::from_slice(&json)
            .map_err(|e| Error::backend(format!("stored record is not valid JSON: {e}")))
    }
}

/// Captures response headers for storage, dropping hop-by-hop headers and
/// `Content-Length` (recomputed on restore from the replayed body).
pub fn capture_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| {
            let name = name.as_str();
            !HOP_BY_HOP.contains(&name) && name != "content-length"
        })
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

/// Returns true iff a captured header must not be applied on restore.
pub fn is_host_controlled(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    HOST_CONTROLLED.contains(&lower.as_str()) || HOP_BY_HOP.contains(&lower.as_str())
}

/// Current wall-clock time in whole unix seconds.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

mod base64_bytes {
    //! Bodies are opaque bytes; base64 keeps them compact inside the JSON
    //! payload instead of an integer-per-byte array.

    use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
