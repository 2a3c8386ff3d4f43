//! In-memory persistor used as a test double, with failure injection.

use crate::models::{ByteRange, ContentDigest, ObjectLocation};
use crate::persistor::{
    ObjectStream, Persistor, PersistorError, PersistorResult,
    integrity::{check_expected, verify_md5},
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, stream};
use std::{
    collections::HashMap,
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

#[derive(Default)]
pub struct MemoryPersistor {
    objects: Mutex<HashMap<ObjectLocation, Bytes>>,
    truncate_to: Option<usize>,
    fail_deletes: bool,
    fail_reads: bool,
    reads: AtomicUsize,
}

impl MemoryPersistor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store at most `len` bytes of every upload, simulating corruption.
    pub fn truncate_writes(mut self, len: usize) -> Self {
        self.truncate_to = Some(len);
        self
    }

    pub fn fail_deletes(mut self) -> Self {
        self.fail_deletes = true;
        self
    }

    /// Every read fails with a non-NotFound error.
    pub fn fail_reads(mut self) -> Self {
        self.fail_reads = true;
        self
    }

    pub fn insert(&self, location: &ObjectLocation, data: &[u8]) {
        self.lock()
            .insert(location.clone(), Bytes::copy_from_slice(data));
    }

    pub fn contents(&self, location: &ObjectLocation) -> Option<Bytes> {
        self.lock().get(location).cloned()
    }

    /// Number of `get_stream` calls served.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ObjectLocation, Bytes>> {
        self.objects
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lookup(&self, location: &ObjectLocation) -> PersistorResult<Bytes> {
        if self.fail_reads {
            return Err(PersistorError::read("injected read failure", location));
        }
        self.lock()
            .get(location)
            .cloned()
            .ok_or_else(|| PersistorError::not_found("object not found", location))
    }

    fn under_prefix(&self, prefix: &ObjectLocation) -> Vec<(ObjectLocation, usize)> {
        let dir = prefix.key().trim_end_matches('/');
        self.lock()
            .iter()
            .filter(|(location, _)| {
                location.bucket() == prefix.bucket()
                    && (location.key() == dir || location.key().starts_with(&format!("{dir}/")))
            })
            .map(|(location, data)| (location.clone(), data.len()))
            .collect()
    }
}

#[async_trait]
impl Persistor for MemoryPersistor {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn send(
        &self,
        location: &ObjectLocation,
        mut stream: ObjectStream,
        expected: Option<ContentDigest>,
    ) -> PersistorResult<()> {
        let mut buffer = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| {
                PersistorError::write("upload stream failed", location).with_source(err)
            })?;
            buffer.extend_from_slice(&chunk);
        }
        let source = ContentDigest::of(&buffer);
        check_expected(location, expected.as_ref(), &source)?;

        let mut stored = buffer.freeze();
        if let Some(len) = self.truncate_to {
            stored.truncate(len);
        }
        let dest = ContentDigest::of(&stored);
        self.lock().insert(location.clone(), stored);
        verify_md5(self, location, &source, &dest).await
    }

    async fn get_stream(
        &self,
        location: &ObjectLocation,
        range: Option<ByteRange>,
    ) -> PersistorResult<ObjectStream> {
        let data = self.lookup(location)?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        let data = match range {
            Some(range) => {
                let len = data.len() as u64;
                let start = range.start.min(len) as usize;
                let end = range.end.saturating_add(1).min(len) as usize;
                data.slice(start..end)
            }
            None => data,
        };
        Ok(stream::iter(vec![Ok(data)]).boxed())
    }

    async fn get_redirect_url(&self, _location: &ObjectLocation) -> PersistorResult<Option<String>> {
        Ok(None)
    }

    async fn get_size(&self, location: &ObjectLocation) -> PersistorResult<u64> {
        Ok(self.lookup(location)?.len() as u64)
    }

    async fn get_digest(&self, location: &ObjectLocation) -> PersistorResult<ContentDigest> {
        Ok(ContentDigest::of(&self.lookup(location)?))
    }

    async fn delete(&self, location: &ObjectLocation) -> PersistorResult<()> {
        if self.fail_deletes {
            return Err(PersistorError::write("injected delete failure", location));
        }
        self.lock().remove(location);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &ObjectLocation) -> PersistorResult<()> {
        if self.fail_deletes {
            return Err(PersistorError::write("injected delete failure", prefix));
        }
        let doomed = self.under_prefix(prefix);
        let mut objects = self.lock();
        for (location, _) in doomed {
            objects.remove(&location);
        }
        Ok(())
    }

    async fn copy(&self, source: &ObjectLocation, dest: &ObjectLocation) -> PersistorResult<()> {
        let data = self.lookup(source)?;
        self.lock().insert(dest.clone(), data);
        Ok(())
    }

    async fn exists(&self, location: &ObjectLocation) -> PersistorResult<bool> {
        if self.fail_reads {
            return Err(PersistorError::read("injected read failure", location));
        }
        Ok(self.lock().contains_key(location))
    }

    /// An empty bucket reports `NotFound`, like a missing bucket would.
    async fn prefix_size(&self, prefix: &ObjectLocation) -> PersistorResult<u64> {
        if self.fail_reads {
            return Err(PersistorError::read("injected read failure", prefix));
        }
        let bucket_known = self
            .lock()
            .keys()
            .any(|location| location.bucket() == prefix.bucket());
        if !bucket_known {
            return Err(PersistorError::not_found("bucket not found", prefix));
        }
        Ok(self
            .under_prefix(prefix)
            .into_iter()
            .map(|(_, len)| len as u64)
            .sum())
    }
}
