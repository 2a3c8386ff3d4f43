//! Local filesystem persistor.
//!
//! A bucket is a directory path. Keys are flattened into one directory
//! (`/` escaped to `_`) unless `use_subdirectories` is set, in which case the
//! key's segments become nested directories. Uploads stream into a temporary
//! file beside the target, are fsynced, then atomically renamed into place.

use crate::models::{ByteRange, ContentDigest, ObjectLocation};
use crate::persistor::{
    Direction, ErrorClass, ObjectStream, Persistor, PersistorError, PersistorResult,
    TransferMetrics,
    integrity::{check_expected, verify_md5},
    meter::{StreamMeter, calculate_stream_md5, metered},
};
use async_trait::async_trait;
use futures::StreamExt;
use std::{
    io::{self, ErrorKind, SeekFrom},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

const BACKEND: &str = "fs";

#[derive(Debug, Clone, Default)]
pub struct LocalSettings {
    pub use_subdirectories: bool,
}

pub struct LocalPersistor {
    use_subdirectories: bool,
    metrics: TransferMetrics,
}

impl LocalPersistor {
    pub fn new(settings: &LocalSettings, metrics: TransferMetrics) -> Self {
        Self {
            use_subdirectories: settings.use_subdirectories,
            metrics,
        }
    }

    /// Path of the object's file. Keys that would resolve outside the bucket
    /// directory do not name an object and are reported as `NotFound`.
    fn object_path(&self, location: &ObjectLocation) -> PersistorResult<PathBuf> {
        let bucket = Path::new(location.bucket());
        let path = if self.use_subdirectories {
            nested_path(bucket, location.key())
        } else {
            nested_path(bucket, &location.escaped_key())
        };
        path.ok_or_else(|| PersistorError::not_found("key escapes the bucket directory", location))
    }

    fn prefix_dir(&self, prefix: &ObjectLocation) -> PersistorResult<PathBuf> {
        let bucket = Path::new(prefix.bucket());
        match prefix.key().trim_end_matches('/') {
            "" => Ok(bucket.to_path_buf()),
            key => nested_path(bucket, key)
                .ok_or_else(|| PersistorError::not_found("prefix escapes the bucket directory", prefix)),
        }
    }

    /// Write the stream to a temp file beside `path`, returning the temp path
    /// and the digest of everything written.
    async fn write_temp(
        &self,
        location: &ObjectLocation,
        path: &Path,
        mut stream: ObjectStream,
    ) -> PersistorResult<(PathBuf, ContentDigest)> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).await.map_err(|err| {
            PersistorError::write("failed to create directory", location).with_source(err)
        })?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await.map_err(|err| {
            PersistorError::write("failed to create temporary file", location).with_source(err)
        })?;

        let mut meter = StreamMeter::new(self.metrics.clone(), BACKEND, Direction::Egress).hashing();
        let written: io::Result<()> = async {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                meter.observe(&chunk);
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);

        match written {
            Ok(()) => {
                debug!(bucket = location.bucket(), key = location.key(), bytes = meter.bytes(), "wrote temporary file");
                Ok((tmp_path, meter.finish()))
            }
            Err(err) => {
                remove_quietly(&tmp_path).await;
                Err(PersistorError::write("failed to write file", location).with_source(err))
            }
        }
    }

    async fn file_md5(&self, location: &ObjectLocation) -> PersistorResult<ContentDigest> {
        let file = File::open(self.object_path(location)?)
            .await
            .map_err(|err| PersistorError::wrap(err, "failed to open file", location, ErrorClass::Read))?;
        calculate_stream_md5(ReaderStream::new(file).boxed())
            .await
            .map_err(|err| PersistorError::wrap(err, "failed to hash file", location, ErrorClass::Read))
    }

    /// Regular files directly inside `dir` whose names pass `keep`.
    async fn flat_entries(
        &self,
        prefix: &ObjectLocation,
        keep: impl Fn(&str) -> bool,
    ) -> PersistorResult<Vec<(PathBuf, u64)>> {
        let dir = Path::new(prefix.bucket());
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(PersistorError::read("failed to list directory", prefix).with_source(err));
            }
        };
        let mut found = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| PersistorError::read("failed to list directory", prefix).with_source(err))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !keep(name) {
                continue;
            }
            let metadata = entry
                .metadata()
                .await
                .map_err(|err| PersistorError::wrap(err, "failed to stat file", prefix, ErrorClass::Read))?;
            if metadata.is_file() {
                found.push((entry.path(), metadata.len()));
            }
        }
        Ok(found)
    }
}

/// Flattened name predicate for a prefix: whole segments only.
/// `bucket` joined with every `/`-separated segment of `key`, or `None` when a
/// segment is empty, `.` or `..`.
fn nested_path(bucket: &Path, key: &str) -> Option<PathBuf> {
    let mut path = bucket.to_path_buf();
    for segment in key.split('/') {
        if matches!(segment, "" | "." | "..") {
            return None;
        }
        path.push(segment);
    }
    Some(path)
}

fn flat_prefix_matcher(prefix: &ObjectLocation) -> impl Fn(&str) -> bool {
    let dir = prefix.escaped_key().trim_end_matches('_').to_string();
    let with_separator = format!("{dir}_");
    move |name: &str| name == dir || name.starts_with(&with_separator)
}

async fn remove_quietly(path: &Path) {
    if let Err(err) = fs::remove_file(path).await {
        if err.kind() != ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %err, "failed to remove temporary file");
        }
    }
}

/// Sum of regular file sizes beneath `root`.
async fn tree_size(root: &Path) -> io::Result<u64> {
    let mut total = 0;
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if metadata.is_dir() {
                pending.push(entry.path());
            } else if metadata.is_file() {
                total += metadata.len();
            }
        }
    }
    Ok(total)
}

#[async_trait]
impl Persistor for LocalPersistor {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn send(
        &self,
        location: &ObjectLocation,
        stream: ObjectStream,
        expected: Option<ContentDigest>,
    ) -> PersistorResult<()> {
        let path = self.object_path(location).map_err(|err| {
            PersistorError::write("invalid object key", location).with_source(err)
        })?;
        let (tmp_path, source) = self.write_temp(location, &path, stream).await?;

        if let Err(err) = check_expected(location, expected.as_ref(), &source) {
            remove_quietly(&tmp_path).await;
            return Err(err);
        }
        if let Err(err) = fs::rename(&tmp_path, &path).await {
            remove_quietly(&tmp_path).await;
            return Err(PersistorError::write("failed to move file into place", location).with_source(err));
        }
        debug!(bucket = location.bucket(), key = location.key(), md5 = %source, "stored file");

        let dest = self.file_md5(location).await.map_err(|err| {
            PersistorError::write("failed to hash stored file", location).with_source(err)
        })?;
        verify_md5(self, location, &source, &dest).await
    }

    async fn get_stream(
        &self,
        location: &ObjectLocation,
        range: Option<ByteRange>,
    ) -> PersistorResult<ObjectStream> {
        let mut file = File::open(self.object_path(location)?)
            .await
            .map_err(|err| PersistorError::wrap(err, "failed to open file", location, ErrorClass::Read))?;
        let meter = StreamMeter::new(self.metrics.clone(), BACKEND, Direction::Ingress);
        let stream = match range {
            Some(range) => {
                file.seek(SeekFrom::Start(range.start))
                    .await
                    .map_err(|err| PersistorError::read("failed to seek in file", location).with_source(err))?;
                ReaderStream::new(file.take(range.len())).boxed()
            }
            None => ReaderStream::new(file).boxed(),
        };
        Ok(metered(stream, meter))
    }

    async fn get_redirect_url(&self, _location: &ObjectLocation) -> PersistorResult<Option<String>> {
        Ok(None)
    }

    async fn get_size(&self, location: &ObjectLocation) -> PersistorResult<u64> {
        let metadata = fs::metadata(self.object_path(location)?)
            .await
            .map_err(|err| PersistorError::wrap(err, "failed to stat file", location, ErrorClass::Read))?;
        Ok(metadata.len())
    }

    async fn get_digest(&self, location: &ObjectLocation) -> PersistorResult<ContentDigest> {
        self.file_md5(location).await
    }

    async fn delete(&self, location: &ObjectLocation) -> PersistorResult<()> {
        let path = match self.object_path(location) {
            Ok(path) => path,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        };
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(PersistorError::write("failed to delete file", location).with_source(err)),
        }
    }

    async fn delete_prefix(&self, prefix: &ObjectLocation) -> PersistorResult<()> {
        if self.use_subdirectories {
            let dir = match self.prefix_dir(prefix) {
                Ok(dir) => dir,
                Err(err) if err.is_not_found() => return Ok(()),
                Err(err) => return Err(err),
            };
            return match fs::remove_dir_all(&dir).await {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
                Err(err) => {
                    Err(PersistorError::write("failed to delete directory", prefix).with_source(err))
                }
            };
        }
        for (path, _) in self.flat_entries(prefix, flat_prefix_matcher(prefix)).await? {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(PersistorError::write("failed to delete file", prefix).with_source(err));
                }
            }
        }
        Ok(())
    }

    async fn copy(&self, source: &ObjectLocation, dest: &ObjectLocation) -> PersistorResult<()> {
        let dest_path = self.object_path(dest).map_err(|err| {
            PersistorError::write("invalid object key", dest).with_source(err)
        })?;
        if let Some(parent) = dest_path.parent() {
            fs::create_dir_all(parent).await.map_err(|err| {
                PersistorError::write("failed to create directory", dest).with_source(err)
            })?;
        }
        fs::copy(self.object_path(source)?, &dest_path)
            .await
            .map_err(|err| PersistorError::wrap(err, "failed to copy file", source, ErrorClass::Write))?;
        Ok(())
    }

    async fn exists(&self, location: &ObjectLocation) -> PersistorResult<bool> {
        let path = match self.object_path(location) {
            Ok(path) => path,
            Err(err) if err.is_not_found() => return Ok(false),
            Err(err) => return Err(err),
        };
        match fs::metadata(path).await {
            Ok(metadata) => Ok(metadata.is_file()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(PersistorError::read("failed to stat file", location).with_source(err)),
        }
    }

    async fn prefix_size(&self, prefix: &ObjectLocation) -> PersistorResult<u64> {
        if self.use_subdirectories {
            let dir = match self.prefix_dir(prefix) {
                Ok(dir) => dir,
                Err(err) if err.is_not_found() => return Ok(0),
                Err(err) => return Err(err),
            };
            return match tree_size(&dir).await {
                Ok(total) => Ok(total),
                Err(err) if err.kind() == ErrorKind::NotFound => Ok(0),
                Err(err) => Err(PersistorError::read("failed to size directory", prefix).with_source(err)),
            };
        }
        let entries = self.flat_entries(prefix, flat_prefix_matcher(prefix)).await?;
        Ok(entries.into_iter().map(|(_, len)| len).sum())
    }
}
