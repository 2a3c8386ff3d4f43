//! Post-upload digest verification.

use crate::models::{ContentDigest, ObjectLocation};
use crate::persistor::{Persistor, PersistorError, PersistorResult};

/// Fail when `actual` differs from a caller-supplied digest.
///
/// Runs before the stored copy is inspected, so the caller learns that its
/// own stream was not what it claimed.
pub fn check_expected(
    location: &ObjectLocation,
    expected: Option<&ContentDigest>,
    actual: &ContentDigest,
) -> PersistorResult<()> {
    match expected {
        Some(expected) if expected != actual => Err(PersistorError::write(
            format!("source md5 mismatch: expected {expected}, streamed {actual}"),
            location,
        )),
        _ => Ok(()),
    }
}

/// Compare the digest computed while streaming with the stored object's.
///
/// On mismatch the stored object is removed (best effort; a failed delete is
/// logged, never returned) and a [`PersistorError::Write`] carrying both
/// digests is returned.
pub async fn verify_md5<P: Persistor + ?Sized>(
    persistor: &P,
    location: &ObjectLocation,
    source: &ContentDigest,
    dest: &ContentDigest,
) -> PersistorResult<()> {
    if source == dest {
        return Ok(());
    }
    if let Err(err) = persistor.delete(location).await {
        tracing::warn!(
            bucket = location.bucket(),
            key = location.key(),
            error = %err,
            "failed to delete object after md5 mismatch"
        );
    }
    Err(PersistorError::write(
        format!("md5 hash mismatch: source {source}, destination {dest}"),
        location,
    ))
}
