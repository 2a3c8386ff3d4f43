//! Staging files in the upload folder.
//!
//! Conversions and health checks work on local copies. Every staged file has
//! a unique name and lives exactly as long as its [`StagedFile`] handle.

use crate::persistor::{ObjectStream, PersistorError, PersistorResult};
use futures::StreamExt;
use std::{
    fs as std_fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tokio::{fs::File, io::AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

/// A file in the upload folder that is removed when dropped, including when
/// the request working on it is cancelled.
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
}

impl StagedFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        match std_fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed staged file"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(path = %self.path.display(), error = %err, "failed to delete local file"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LocalFileWriter {
    upload_folder: PathBuf,
}

impl LocalFileWriter {
    pub fn new(upload_folder: impl Into<PathBuf>) -> Self {
        Self {
            upload_folder: upload_folder.into(),
        }
    }

    /// Claim `name` in the upload folder. Nothing is created yet.
    pub fn stage(&self, name: impl AsRef<Path>) -> StagedFile {
        StagedFile::new(self.upload_folder.join(name))
    }

    /// Write `stream` to a fresh file.
    pub async fn write_stream(&self, mut stream: ObjectStream) -> PersistorResult<StagedFile> {
        let staged = self.stage(Uuid::new_v4().to_string());
        let location = staged.path().display().to_string();
        let fail = |err: std::io::Error| {
            PersistorError::write("problem writing local file", &location).with_source(err)
        };

        let mut file = File::create(staged.path()).await.map_err(fail)?;
        let result = async {
            while let Some(chunk) = stream.next().await {
                file.write_all(&chunk?).await?;
            }
            file.flush().await
        }
        .await;

        result.map_err(fail)?;
        debug!(path = %staged.path().display(), "staged local file");
        Ok(staged)
    }
}
