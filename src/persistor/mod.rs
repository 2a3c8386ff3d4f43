//! Storage backends behind one streaming interface.
//!
//! A single [`Persistor`] is selected at startup by [`build_persistor`]
//! (local filesystem, S3 or GCS), optionally wrapped in a
//! [`MigrationPersistor`](migration::MigrationPersistor) that reads through to
//! a second backend. Callers hold it as a [`SharedPersistor`] for the life of
//! the process.

pub mod cloud;
pub mod errors;
pub mod gcs;
pub mod integrity;
pub mod local;
#[cfg(test)]
pub mod memory;
pub mod meter;
pub mod migration;
pub mod s3;

use crate::models::{ByteRange, ContentDigest, ObjectLocation};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream::BoxStream};
use std::{collections::HashMap, io, path::Path, str::FromStr, sync::Arc};
use tokio_util::io::ReaderStream;

pub use errors::{ErrorClass, PersistorError, PersistorResult};
pub use meter::{Direction, TransferMetrics};

/// Byte stream flowing into or out of a backend.
pub type ObjectStream = BoxStream<'static, io::Result<Bytes>>;

pub type SharedPersistor = Arc<dyn Persistor>;

/// Default number of per-bucket clients kept by a cloud adapter.
pub const DEFAULT_CLIENT_CACHE_CAPACITY: usize = 64;

/// Storage operations every backend provides.
///
/// All errors are [`PersistorError`]s; backend-native "object missing"
/// signals always surface as [`PersistorError::NotFound`].
#[async_trait]
pub trait Persistor: Send + Sync {
    /// Short backend tag used in logs and metrics (`fs`, `s3`, `gcs`).
    fn backend(&self) -> &'static str;

    /// Stream `stream` to `location`, hashing it on the way.
    ///
    /// The stored object is verified against the computed digest, and against
    /// `expected` when given. A mismatch deletes the object and fails with
    /// [`PersistorError::Write`].
    async fn send(
        &self,
        location: &ObjectLocation,
        stream: ObjectStream,
        expected: Option<ContentDigest>,
    ) -> PersistorResult<()>;

    /// Send a local file.
    async fn send_file(&self, location: &ObjectLocation, path: &Path) -> PersistorResult<()> {
        let file = tokio::fs::File::open(path).await.map_err(|err| {
            PersistorError::write("error opening local file for upload", location).with_source(err)
        })?;
        self.send(location, ReaderStream::new(file).boxed(), None)
            .await
    }

    /// Read an object, or the inclusive `range` of it.
    async fn get_stream(
        &self,
        location: &ObjectLocation,
        range: Option<ByteRange>,
    ) -> PersistorResult<ObjectStream>;

    /// Pre-signed or public download URL, where the backend has one.
    async fn get_redirect_url(&self, location: &ObjectLocation) -> PersistorResult<Option<String>>;

    async fn get_size(&self, location: &ObjectLocation) -> PersistorResult<u64>;

    /// MD5 of the stored object as reported by the backend.
    async fn get_digest(&self, location: &ObjectLocation) -> PersistorResult<ContentDigest>;

    /// Remove an object. Missing objects are not an error.
    async fn delete(&self, location: &ObjectLocation) -> PersistorResult<()>;

    /// Remove every object whose key lies under `prefix`.
    async fn delete_prefix(&self, prefix: &ObjectLocation) -> PersistorResult<()>;

    /// Copy `source` to `dest`, server-side where the backend allows it.
    async fn copy(&self, source: &ObjectLocation, dest: &ObjectLocation) -> PersistorResult<()>;

    async fn exists(&self, location: &ObjectLocation) -> PersistorResult<bool>;

    /// Total size of the objects under `prefix`.
    async fn prefix_size(&self, prefix: &ObjectLocation) -> PersistorResult<u64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Fs,
    S3,
    Gcs,
}

impl FromStr for BackendKind {
    type Err = PersistorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fs" => Ok(Self::Fs),
            "s3" | "aws-sdk" => Ok(Self::S3),
            "gcs" => Ok(Self::Gcs),
            other => Err(PersistorError::settings(format!(
                "unknown persistor backend `{other}`"
            ))),
        }
    }
}

/// Read-through settings for online migration between two backends.
#[derive(Debug, Clone)]
pub struct FallbackSettings {
    pub backend: BackendKind,
    /// Primary bucket → fallback bucket. Unmapped buckets never fall back.
    pub buckets: HashMap<String, String>,
    pub copy_on_miss: bool,
}

#[derive(Debug, Clone)]
pub struct PersistorSettings {
    pub backend: BackendKind,
    pub local: local::LocalSettings,
    pub s3: s3::S3Settings,
    pub gcs: gcs::GcsSettings,
    pub fallback: Option<FallbackSettings>,
    pub client_cache_capacity: usize,
}

/// Build the process-wide persistor from settings.
pub fn build_persistor(
    settings: &PersistorSettings,
    metrics: TransferMetrics,
) -> PersistorResult<SharedPersistor> {
    let primary = build_backend(settings.backend, settings, metrics.clone())?;
    let Some(fallback) = &settings.fallback else {
        return Ok(primary);
    };
    if fallback.backend == settings.backend {
        return Err(PersistorError::settings(
            "fallback backend must differ from the primary backend",
        ));
    }
    let secondary = build_backend(fallback.backend, settings, metrics)?;
    tracing::info!(
        primary = primary.backend(),
        fallback = secondary.backend(),
        copy_on_miss = fallback.copy_on_miss,
        "using migration persistor"
    );
    Ok(Arc::new(migration::MigrationPersistor::new(
        primary,
        secondary,
        fallback.buckets.clone(),
        fallback.copy_on_miss,
    )))
}

fn build_backend(
    kind: BackendKind,
    settings: &PersistorSettings,
    metrics: TransferMetrics,
) -> PersistorResult<SharedPersistor> {
    let persistor: SharedPersistor = match kind {
        BackendKind::Fs => Arc::new(local::LocalPersistor::new(&settings.local, metrics)),
        BackendKind::S3 => Arc::new(s3::s3_persistor(
            &settings.s3,
            settings.client_cache_capacity,
            metrics,
        )?),
        BackendKind::Gcs => Arc::new(gcs::gcs_persistor(
            &settings.gcs,
            settings.client_cache_capacity,
            metrics,
        )?),
    };
    Ok(persistor)
}
