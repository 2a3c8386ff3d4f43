//! Read-through persistor for moving data between two backends online.
//!
//! Writes go to the primary. Reads that miss in the primary are served from
//! the fallback when the bucket has a fallback mapping, optionally copying
//! the object into the primary in the background so the next read hits.

use crate::models::{ByteRange, ContentDigest, ObjectLocation};
use crate::persistor::{ObjectStream, Persistor, PersistorError, PersistorResult, SharedPersistor};
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{debug, warn};

pub struct MigrationPersistor {
    primary: SharedPersistor,
    fallback: SharedPersistor,
    buckets: HashMap<String, String>,
    copy_on_miss: bool,
}

impl MigrationPersistor {
    pub fn new(
        primary: SharedPersistor,
        fallback: SharedPersistor,
        buckets: HashMap<String, String>,
        copy_on_miss: bool,
    ) -> Self {
        Self {
            primary,
            fallback,
            buckets,
            copy_on_miss,
        }
    }

    fn fallback_location(&self, location: &ObjectLocation) -> Option<ObjectLocation> {
        self.buckets
            .get(location.bucket())
            .map(|bucket| location.in_bucket(bucket.clone()))
    }

    /// Where to look after a primary miss; unmapped buckets keep the miss.
    fn on_primary_miss(
        &self,
        location: &ObjectLocation,
        miss: PersistorError,
    ) -> PersistorResult<ObjectLocation> {
        match self.fallback_location(location) {
            Some(fallback) => {
                debug!(
                    bucket = location.bucket(),
                    key = location.key(),
                    fallback_bucket = fallback.bucket(),
                    "object missing from primary, trying fallback"
                );
                Ok(fallback)
            }
            None => Err(miss),
        }
    }

    /// Migrate `source` (in the fallback) to `dest` (in the primary) in the
    /// background when copy-on-miss is enabled. Failures are only logged.
    fn copy_in_background(&self, source: &ObjectLocation, dest: &ObjectLocation) {
        if !self.copy_on_miss {
            return;
        }
        let primary = self.primary.clone();
        let fallback = self.fallback.clone();
        let source = source.clone();
        let dest = dest.clone();
        tokio::spawn(async move {
            match copy_from_fallback(primary.as_ref(), fallback.as_ref(), &source, &dest).await {
                Ok(()) => debug!(bucket = dest.bucket(), key = dest.key(), "copied object to primary"),
                Err(err) => warn!(
                    bucket = dest.bucket(),
                    key = dest.key(),
                    error = %err,
                    "failed to copy object from fallback"
                ),
            }
        });
    }
}

/// Stream an object from the fallback into the primary.
///
/// The fallback's digest (when it has one) is passed as the expected digest.
/// A failed send removes whatever reached the primary.
pub async fn copy_from_fallback(
    primary: &dyn Persistor,
    fallback: &dyn Persistor,
    source: &ObjectLocation,
    dest: &ObjectLocation,
) -> PersistorResult<()> {
    let expected = match fallback.get_digest(source).await {
        Ok(digest) => Some(digest),
        Err(err) => {
            warn!(
                bucket = source.bucket(),
                key = source.key(),
                error = %err,
                "could not get md5 from fallback, copying without it"
            );
            None
        }
    };
    let stream = fallback.get_stream(source, None).await?;
    if let Err(err) = primary.send(dest, stream, expected).await {
        if let Err(delete_err) = primary.delete(dest).await {
            warn!(
                bucket = dest.bucket(),
                key = dest.key(),
                error = %delete_err,
                "failed to clean up partial copy in primary"
            );
        }
        return Err(PersistorError::write("unable to copy object to primary", dest).with_source(err));
    }
    Ok(())
}

#[async_trait]
impl Persistor for MigrationPersistor {
    fn backend(&self) -> &'static str {
        "migration"
    }

    async fn send(
        &self,
        location: &ObjectLocation,
        stream: ObjectStream,
        expected: Option<ContentDigest>,
    ) -> PersistorResult<()> {
        self.primary.send(location, stream, expected).await
    }

    async fn get_stream(
        &self,
        location: &ObjectLocation,
        range: Option<ByteRange>,
    ) -> PersistorResult<ObjectStream> {
        match self.primary.get_stream(location, range).await {
            Err(err) if err.is_not_found() => {
                let fallback = self.on_primary_miss(location, err)?;
                let stream = self.fallback.get_stream(&fallback, range).await?;
                self.copy_in_background(&fallback, location);
                Ok(stream)
            }
            other => other,
        }
    }

    async fn get_redirect_url(&self, location: &ObjectLocation) -> PersistorResult<Option<String>> {
        self.primary.get_redirect_url(location).await
    }

    async fn get_size(&self, location: &ObjectLocation) -> PersistorResult<u64> {
        match self.primary.get_size(location).await {
            Err(err) if err.is_not_found() => {
                let fallback = self.on_primary_miss(location, err)?;
                let size = self.fallback.get_size(&fallback).await?;
                self.copy_in_background(&fallback, location);
                Ok(size)
            }
            other => other,
        }
    }

    async fn get_digest(&self, location: &ObjectLocation) -> PersistorResult<ContentDigest> {
        match self.primary.get_digest(location).await {
            Err(err) if err.is_not_found() => {
                let fallback = self.on_primary_miss(location, err)?;
                let digest = self.fallback.get_digest(&fallback).await?;
                self.copy_in_background(&fallback, location);
                Ok(digest)
            }
            other => other,
        }
    }

    async fn delete(&self, location: &ObjectLocation) -> PersistorResult<()> {
        let Some(fallback) = self.fallback_location(location) else {
            return self.primary.delete(location).await;
        };
        let (primary, fallback) = futures::join!(
            self.primary.delete(location),
            self.fallback.delete(&fallback)
        );
        primary.and(fallback)
    }

    async fn delete_prefix(&self, prefix: &ObjectLocation) -> PersistorResult<()> {
        let Some(fallback) = self.fallback_location(prefix) else {
            return self.primary.delete_prefix(prefix).await;
        };
        let (primary, fallback) = futures::join!(
            self.primary.delete_prefix(prefix),
            self.fallback.delete_prefix(&fallback)
        );
        primary.and(fallback)
    }

    async fn copy(&self, source: &ObjectLocation, dest: &ObjectLocation) -> PersistorResult<()> {
        match self.primary.copy(source, dest).await {
            Err(err) if err.is_not_found() => {
                let fallback = self.on_primary_miss(source, err)?;
                copy_from_fallback(self.primary.as_ref(), self.fallback.as_ref(), &fallback, dest)
                    .await?;
                self.copy_in_background(&fallback, source);
                Ok(())
            }
            other => other,
        }
    }

    async fn exists(&self, location: &ObjectLocation) -> PersistorResult<bool> {
        if self.primary.exists(location).await? {
            return Ok(true);
        }
        let Some(fallback) = self.fallback_location(location) else {
            return Ok(false);
        };
        let found = self.fallback.exists(&fallback).await?;
        if found {
            self.copy_in_background(&fallback, location);
        }
        Ok(found)
    }

    async fn prefix_size(&self, prefix: &ObjectLocation) -> PersistorResult<u64> {
        match self.primary.prefix_size(prefix).await {
            Err(err) if err.is_not_found() => {
                let fallback = self.on_primary_miss(prefix, err)?;
                self.fallback.prefix_size(&fallback).await
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistor::memory::MemoryPersistor;
    use bytes::Bytes;
    use futures::StreamExt;
    use std::{sync::Arc, time::Duration};

    const BUCKET: &str = "user-files";
    const FALLBACK_BUCKET: &str = "old-user-files";

    struct Fixture {
        primary: Arc<MemoryPersistor>,
        fallback: Arc<MemoryPersistor>,
        migration: MigrationPersistor,
    }

    fn fixture_with(primary: MemoryPersistor, fallback: MemoryPersistor, copy_on_miss: bool) -> Fixture {
        let primary = Arc::new(primary);
        let fallback = Arc::new(fallback);
        let buckets = HashMap::from([(BUCKET.to_string(), FALLBACK_BUCKET.to_string())]);
        let migration = MigrationPersistor::new(primary.clone(), fallback.clone(), buckets, copy_on_miss);
        Fixture {
            primary,
            fallback,
            migration,
        }
    }

    fn fixture(copy_on_miss: bool) -> Fixture {
        fixture_with(MemoryPersistor::new(), MemoryPersistor::new(), copy_on_miss)
    }

    fn primary_location() -> ObjectLocation {
        ObjectLocation::new(BUCKET, "proj1/file1")
    }

    fn fallback_location() -> ObjectLocation {
        ObjectLocation::new(FALLBACK_BUCKET, "proj1/file1")
    }

    async fn collect(stream: ObjectStream) -> Vec<u8> {
        let chunks: Vec<std::io::Result<Bytes>> = stream.collect().await;
        chunks
            .into_iter()
            .flat_map(|chunk| chunk.unwrap().to_vec())
            .collect()
    }

    /// Wait for a background copy to land.
    async fn settled(persistor: &MemoryPersistor, location: &ObjectLocation) -> bool {
        for _ in 0..200 {
            if persistor.contents(location).is_some() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    #[tokio::test]
    async fn reads_from_primary_first() {
        let f = fixture(true);
        f.primary.insert(&primary_location(), b"primary");
        f.fallback.insert(&fallback_location(), b"fallback");

        let stream = f.migration.get_stream(&primary_location(), None).await.unwrap();
        assert_eq!(collect(stream).await, b"primary");
        assert_eq!(f.fallback.reads(), 0);
    }

    #[tokio::test]
    async fn falls_back_without_copying() {
        let f = fixture(false);
        f.fallback.insert(&fallback_location(), b"fallback");

        let stream = f.migration.get_stream(&primary_location(), None).await.unwrap();
        assert_eq!(collect(stream).await, b"fallback");
        assert_eq!(f.migration.get_size(&primary_location()).await.unwrap(), 8);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(f.primary.contents(&primary_location()).is_none());
    }

    #[tokio::test]
    async fn copy_on_miss_migrates_in_background() {
        let f = fixture(true);
        f.fallback.insert(&fallback_location(), b"fallback");

        let range = ByteRange::new(0, 3);
        let stream = f.migration.get_stream(&primary_location(), range).await.unwrap();
        assert_eq!(collect(stream).await, b"fall");

        assert!(settled(&f.primary, &primary_location()).await);
        assert_eq!(
            f.primary.contents(&primary_location()).unwrap(),
            Bytes::from_static(b"fallback")
        );
        // the fallback copy is left alone
        assert!(f.fallback.contents(&fallback_location()).is_some());
    }

    #[tokio::test]
    async fn missing_everywhere_is_not_found() {
        let f = fixture(true);
        let err = f.migration.get_stream(&primary_location(), None).await.err().unwrap();
        assert!(err.is_not_found());
        assert!(!f.migration.exists(&primary_location()).await.unwrap());
    }

    #[tokio::test]
    async fn unexpected_primary_errors_skip_fallback() {
        let f = fixture_with(MemoryPersistor::new().fail_reads(), MemoryPersistor::new(), true);
        f.fallback.insert(&fallback_location(), b"fallback");

        let err = f.migration.get_stream(&primary_location(), None).await.err().unwrap();
        assert!(matches!(err, PersistorError::Read { .. }));
        assert_eq!(f.fallback.reads(), 0);
    }

    #[tokio::test]
    async fn unmapped_buckets_do_not_fall_back() {
        let f = fixture(true);
        let location = ObjectLocation::new("template-files", "proj1/file1");
        f.fallback.insert(&location, b"fallback");

        assert!(f.migration.get_stream(&location, None).await.err().unwrap().is_not_found());
        assert!(!f.migration.exists(&location).await.unwrap());
        assert_eq!(f.fallback.reads(), 0);
    }

    #[tokio::test]
    async fn exists_checks_fallback_after_primary_false() {
        let f = fixture(false);
        f.fallback.insert(&fallback_location(), b"fallback");
        assert!(f.migration.exists(&primary_location()).await.unwrap());
    }

    #[tokio::test]
    async fn sends_only_to_primary() {
        let f = fixture(true);
        let body = futures::stream::iter(vec![Ok(Bytes::from_static(b"new"))]).boxed();
        f.migration.send(&primary_location(), body, None).await.unwrap();
        assert!(f.primary.contents(&primary_location()).is_some());
        assert!(f.fallback.contents(&fallback_location()).is_none());
    }

    #[tokio::test]
    async fn deletes_fan_out_to_both() {
        let f = fixture(false);
        f.primary.insert(&primary_location(), b"primary");
        f.fallback.insert(&fallback_location(), b"fallback");

        f.migration.delete(&primary_location()).await.unwrap();
        assert!(f.primary.contents(&primary_location()).is_none());
        assert!(f.fallback.contents(&fallback_location()).is_none());
    }

    #[tokio::test]
    async fn failed_fallback_delete_fails_the_operation() {
        let f = fixture_with(MemoryPersistor::new(), MemoryPersistor::new().fail_deletes(), false);
        f.primary.insert(&primary_location(), b"primary");

        let err = f.migration.delete(&primary_location()).await.unwrap_err();
        assert!(matches!(err, PersistorError::Write { .. }));
        // the primary delete still ran
        assert!(f.primary.contents(&primary_location()).is_none());

        let prefix = ObjectLocation::new(BUCKET, "proj1/");
        assert!(f.migration.delete_prefix(&prefix).await.is_err());
    }

    #[tokio::test]
    async fn copies_from_fallback_when_source_missing() {
        let f = fixture(false);
        f.fallback.insert(&fallback_location(), b"fallback");
        let dest = ObjectLocation::new(BUCKET, "proj2/file1");

        f.migration.copy(&primary_location(), &dest).await.unwrap();
        assert_eq!(
            f.primary.contents(&dest).unwrap(),
            Bytes::from_static(b"fallback")
        );
    }

    #[tokio::test]
    async fn copy_of_missing_source_is_not_found() {
        let f = fixture(false);
        let dest = ObjectLocation::new(BUCKET, "proj2/file1");
        let err = f.migration.copy(&primary_location(), &dest).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn corrupt_migration_is_cleaned_up() {
        let f = fixture_with(MemoryPersistor::new().truncate_writes(3), MemoryPersistor::new(), false);
        f.fallback.insert(&fallback_location(), b"fallback");
        let dest = ObjectLocation::new(BUCKET, "proj2/file1");

        let err = f.migration.copy(&primary_location(), &dest).await.unwrap_err();
        assert!(matches!(err, PersistorError::Write { .. }));
        assert!(f.primary.contents(&dest).is_none());
    }

    #[tokio::test]
    async fn prefix_size_falls_back_without_copying() {
        let f = fixture(true);
        f.fallback.insert(&fallback_location(), &[0u8; 60]);
        let prefix = ObjectLocation::new(BUCKET, "proj1/");

        assert_eq!(f.migration.prefix_size(&prefix).await.unwrap(), 60);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(f.primary.contents(&primary_location()).is_none());
    }
}
