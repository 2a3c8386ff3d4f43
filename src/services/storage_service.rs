//! src/services/storage_service.rs
//!
//! StorageService: project file operations on top of the configured
//! persistor. Plain reads and writes go straight to the backend; converted
//! renditions (formats and styles) are produced locally on first request and
//! cached beside the original under `{key}-converted-cache/`.

use crate::{
    models::{ByteRange, ContentDigest, ObjectLocation},
    persistor::{ObjectStream, PersistorError, SharedPersistor, TransferMetrics},
    services::{
        file_converter::{ConversionError, FileConverter, Style, output_path},
        image_optimiser::ImageOptimiser,
        key_builder,
        local_file_writer::{LocalFileWriter, StagedFile},
        safe_exec::ExecError,
    },
};
use futures::StreamExt;
use std::sync::Arc;
use thiserror::Error;
use tokio::fs::{self, File};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};
use uuid::Uuid;

/// Smallest document the health check renders.
const HEALTH_CHECK_PDF: &[u8] = include_bytes!("../../assets/tiny.pdf");

/// Error taxonomy exposed to callers of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Read,
    Write,
    Settings,
    ConversionDisabled,
    CommandFailed,
    Timeout,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Persistor(#[from] PersistorError),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error(transparent)]
    Conversion(#[from] ConversionError),
    #[error("bucket `{0}` is not a configured store")]
    UnknownBucket(String),
    #[error("health check object is not configured")]
    HealthCheckNotConfigured,
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Persistor(err) => match err {
                PersistorError::NotFound { .. } => ErrorKind::NotFound,
                PersistorError::Read { .. } => ErrorKind::Read,
                PersistorError::Write { .. } => ErrorKind::Write,
                PersistorError::Settings { .. } => ErrorKind::Settings,
            },
            Self::Exec(err) | Self::Conversion(ConversionError::Exec(err)) => exec_kind(err),
            Self::Conversion(_) => ErrorKind::Settings,
            Self::UnknownBucket(_) => ErrorKind::NotFound,
            Self::HealthCheckNotConfigured => ErrorKind::Settings,
        }
    }
}

fn exec_kind(err: &ExecError) -> ErrorKind {
    match err {
        ExecError::Disabled => ErrorKind::ConversionDisabled,
        err if err.is_timeout() => ErrorKind::Timeout,
        _ => ErrorKind::CommandFailed,
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Buckets the service serves and behaviour toggles.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub user_files_bucket: String,
    pub template_files_bucket: String,
    pub allow_redirects: bool,
    /// `(project_id, file_id)` of the object read by the health check.
    pub health_check_file: Option<(String, String)>,
}

impl ServiceSettings {
    pub fn is_store(&self, bucket: &str) -> bool {
        bucket == self.user_files_bucket || bucket == self.template_files_bucket
    }
}

#[derive(Debug, Clone, Default)]
pub struct GetFileOptions {
    pub format: Option<String>,
    pub style: Option<Style>,
    pub range: Option<ByteRange>,
}

impl GetFileOptions {
    fn is_empty(&self) -> bool {
        self.format.is_none() && self.style.is_none() && self.range.is_none()
    }
}

/// StorageService is cheap to clone; every clone shares the same backend.
#[derive(Clone)]
pub struct StorageService {
    persistor: SharedPersistor,
    settings: Arc<ServiceSettings>,
    writer: LocalFileWriter,
    converter: FileConverter,
    optimiser: ImageOptimiser,
    metrics: TransferMetrics,
}

impl StorageService {
    pub fn new(
        persistor: SharedPersistor,
        settings: ServiceSettings,
        writer: LocalFileWriter,
        converter: FileConverter,
        optimiser: ImageOptimiser,
        metrics: TransferMetrics,
    ) -> Self {
        Self {
            persistor,
            settings: Arc::new(settings),
            writer,
            converter,
            optimiser,
            metrics,
        }
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    pub fn metrics(&self) -> &TransferMetrics {
        &self.metrics
    }

    /// Store a new version of `key`, invalidating its cached conversions first.
    pub async fn insert_file(
        &self,
        bucket: &str,
        key: &str,
        stream: ObjectStream,
        expected: Option<ContentDigest>,
    ) -> StorageResult<()> {
        let location = ObjectLocation::new(bucket, key);
        self.persistor
            .delete_prefix(&location.with_key(key_builder::converted_folder_key(key)))
            .await?;
        self.persistor.send(&location, stream, expected).await?;
        info!(bucket, key, "inserted file");
        Ok(())
    }

    /// Read `key`, or a converted rendition of it when a format or style is requested.
    pub async fn get_file(
        &self,
        bucket: &str,
        key: &str,
        options: &GetFileOptions,
    ) -> StorageResult<ObjectStream> {
        let location = ObjectLocation::new(bucket, key);
        let Some(cached_key) =
            key_builder::cached_key(key, options.format.as_deref(), options.style)
        else {
            return Ok(self.persistor.get_stream(&location, options.range).await?);
        };

        let cached = location.with_key(cached_key);
        match self.persistor.get_stream(&cached, None).await {
            Ok(stream) => return Ok(stream),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }
        if !self.converter.enabled() {
            return Err(ExecError::Disabled.into());
        }

        debug!(bucket, key, cached = cached.key(), "converted file not cached");
        let converted = self.convert_and_cache(&location, &cached, options).await?;
        self.stream_and_unlink(converted).await
    }

    async fn convert_and_cache(
        &self,
        location: &ObjectLocation,
        cached: &ObjectLocation,
        options: &GetFileOptions,
    ) -> StorageResult<StagedFile> {
        let original = self
            .writer
            .write_stream(self.persistor.get_stream(location, None).await?)
            .await?;
        let converted = self.convert_local(&original, options).await?;
        drop(original);
        self.persistor.send_file(cached, converted.path()).await?;
        Ok(converted)
    }

    async fn convert_local(&self, original: &StagedFile, options: &GetFileOptions) -> StorageResult<StagedFile> {
        let source = original.path();
        // claimed before rendering so a cancelled render is cleaned up too
        let converted = StagedFile::new(output_path(source, options.format.as_deref().unwrap_or("png")));
        match (options.format.as_deref(), options.style) {
            (Some(format), _) => self.converter.convert(source, format).await?,
            (None, Some(style)) => self.converter.styled(source, style).await?,
            (None, None) => return Err(ConversionError::UnsupportedFormat(String::new()).into()),
        };
        if options.style.is_some() {
            self.optimiser.compress_png(converted.path()).await?;
        }
        Ok(converted)
    }

    /// Stream a local result. The file is unlinked straight away; the open
    /// handle keeps its contents readable.
    async fn stream_and_unlink(&self, staged: StagedFile) -> StorageResult<ObjectStream> {
        let file = File::open(staged.path()).await.map_err(|err| {
            PersistorError::read("error opening converted file", staged.path().display()).with_source(err)
        })?;
        drop(staged);
        Ok(ReaderStream::new(file).boxed())
    }

    pub async fn get_file_size(&self, bucket: &str, key: &str) -> StorageResult<u64> {
        Ok(self
            .persistor
            .get_size(&ObjectLocation::new(bucket, key))
            .await?)
    }

    /// Total bytes stored for a project.
    pub async fn get_directory_size(&self, bucket: &str, project_id: &str) -> StorageResult<u64> {
        Ok(self
            .persistor
            .prefix_size(&ObjectLocation::new(bucket, format!("{project_id}/")))
            .await?)
    }

    pub async fn copy_file(&self, bucket: &str, source_key: &str, dest_key: &str) -> StorageResult<()> {
        let source = ObjectLocation::new(bucket, source_key);
        self.persistor
            .copy(&source, &source.with_key(dest_key))
            .await?;
        Ok(())
    }

    /// Delete `key` together with its cached conversions.
    pub async fn delete_file(&self, bucket: &str, key: &str) -> StorageResult<()> {
        let location = ObjectLocation::new(bucket, key);
        let cache = location.with_key(key_builder::converted_folder_key(key));
        let (object, converted) = futures::join!(
            self.persistor.delete(&location),
            self.persistor.delete_prefix(&cache)
        );
        object?;
        converted?;
        Ok(())
    }

    pub async fn delete_project(&self, bucket: &str, project_id: &str) -> StorageResult<()> {
        self.persistor
            .delete_prefix(&ObjectLocation::new(bucket, format!("{project_id}/")))
            .await?;
        info!(bucket, project_id, "deleted project files");
        Ok(())
    }

    /// Direct download URL, when redirects are enabled and the request is a
    /// plain read from a configured store.
    pub async fn get_redirect_url(
        &self,
        bucket: &str,
        key: &str,
        options: &GetFileOptions,
    ) -> StorageResult<Option<String>> {
        if !self.settings.allow_redirects || !options.is_empty() || !self.settings.is_store(bucket) {
            return Ok(None);
        }
        Ok(self
            .persistor
            .get_redirect_url(&ObjectLocation::new(bucket, key))
            .await?)
    }

    /// Read the health-check object end to end.
    pub async fn check_can_get_files(&self) -> StorageResult<()> {
        let (project_id, file_id) = self
            .settings
            .health_check_file
            .as_ref()
            .ok_or(StorageError::HealthCheckNotConfigured)?;
        let location = ObjectLocation::new(
            &self.settings.user_files_bucket,
            format!("{project_id}/{file_id}"),
        );
        let mut stream = self.persistor.get_stream(&location, None).await?;
        while let Some(chunk) = stream.next().await {
            chunk.map_err(|err| {
                PersistorError::read("error reading health check object", &location).with_source(err)
            })?;
        }
        Ok(())
    }

    /// Render a thumbnail of a bundled document. Skipped when conversions are off.
    pub async fn check_file_convert(&self) -> StorageResult<()> {
        if !self.converter.enabled() {
            return Ok(());
        }
        let fixture = self.writer.stage(format!("health-check-{}", Uuid::new_v4()));
        let _thumbnail = StagedFile::new(output_path(fixture.path(), "png"));
        fs::write(fixture.path(), HEALTH_CHECK_PDF).await.map_err(|err| {
            PersistorError::write("error writing health check fixture", fixture.path().display())
                .with_source(err)
        })?;
        self.converter.thumbnail(fixture.path()).await?;
        Ok(())
    }
}
