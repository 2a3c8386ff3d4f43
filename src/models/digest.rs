//! MD5 content digests as exchanged with storage backends.

use base64::{Engine as _, engine::general_purpose};
use std::fmt;

/// Digest of the empty payload.
#[cfg(test)]
pub const EMPTY_MD5: &str = "d41d8cd98f00b204e9800998ecf8427e";

/// A 32-character lowercase hex MD5 digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Accepts exactly 32 hex digits (either case); anything else is `None`.
    pub fn from_hex(value: &str) -> Option<Self> {
        if value.len() == 32 && value.bytes().all(|b| b.is_ascii_hexdigit()) {
            Some(Self(value.to_ascii_lowercase()))
        } else {
            None
        }
    }

    /// Interpret an ETag as an MD5 digest.
    ///
    /// Quotes and whitespace are stripped. Multipart ETags (`<hex>-<parts>`)
    /// and other non-MD5 values are rejected.
    pub fn from_etag(etag: &str) -> Option<Self> {
        let cleaned: String = etag.chars().filter(|c| *c != '"' && *c != ' ').collect();
        Self::from_hex(&cleaned)
    }

    /// Decode the base64 form used by backend metadata fields (e.g. `md5Hash`).
    pub fn from_base64(value: &str) -> Option<Self> {
        let raw = general_purpose::STANDARD.decode(value).ok()?;
        if raw.len() != 16 {
            return None;
        }
        Some(Self(raw.iter().map(|b| format!("{:02x}", b)).collect()))
    }

    #[cfg(test)]
    pub fn of(bytes: &[u8]) -> Self {
        md5::compute(bytes).into()
    }

    pub fn as_hex(&self) -> &str {
        &self.0
    }

    #[cfg(test)]
    pub fn to_base64(&self) -> String {
        let raw: Vec<u8> = (0..self.0.len())
            .step_by(2)
            .filter_map(|i| u8::from_str_radix(&self.0[i..i + 2], 16).ok())
            .collect();
        general_purpose::STANDARD.encode(raw)
    }
}

impl From<md5::Digest> for ContentDigest {
    fn from(digest: md5::Digest) -> Self {
        Self(format!("{:x}", digest))
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_hex())
    }
}
