//! Addressing for stored objects: bucket/key pairs and inclusive byte ranges.

use std::{fmt, ops::Range};

/// A bucket and key identifying one stored object, or a key prefix when used
/// with the directory-style operations.
///
/// Keys are opaque path-like strings supplied by callers that have already
/// validated them. They are never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectLocation {
    bucket: String,
    key: String,
}

impl ObjectLocation {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        let location = Self {
            bucket: bucket.into(),
            key: key.into(),
        };
        debug_assert!(!location.key.is_empty(), "object keys are never empty");
        location
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Same bucket, different key.
    pub fn with_key(&self, key: impl Into<String>) -> Self {
        Self::new(self.bucket.clone(), key)
    }

    /// Same key, different bucket.
    pub fn in_bucket(&self, bucket: impl Into<String>) -> Self {
        Self::new(bucket, self.key.clone())
    }

    /// Key flattened for a single-directory filesystem layout (`/` → `_`).
    pub fn escaped_key(&self) -> String {
        self.key.replace('/', "_")
    }
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// Inclusive byte range `[start, end]`, matching HTTP `Range: bytes=start-end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Returns `None` when `end < start`.
    pub fn new(start: u64, end: u64) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    /// Number of bytes covered, both ends included. Saturates at `u64::MAX`.
    pub fn len(&self) -> u64 {
        (self.end - self.start).saturating_add(1)
    }

    /// Half-open form used by object stores (`start..end + 1`).
    pub fn to_exclusive(&self) -> Range<u64> {
        self.start..self.end.saturating_add(1)
    }

    /// Parse a single-range HTTP header value such as `bytes=0-8`.
    ///
    /// Open-ended and suffix ranges are not supported and yield `None`.
    pub fn from_header(value: &str) -> Option<Self> {
        let spec = value.trim().strip_prefix("bytes=")?;
        let (start, end) = spec.split_once('-')?;
        let start = start.trim().parse().ok()?;
        let end = end.trim().parse().ok()?;
        Self::new(start, end)
    }
}
