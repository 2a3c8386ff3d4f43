//! Object-store backed persistor shared by the S3 and GCS adapters.
//!
//! Each bucket gets its own [`ObjectStore`] client, built on first use by a
//! backend-specific [`ClientFactory`] and kept in a bounded [`ClientCache`].
//! Uploads go through `object_store`'s buffered writer, which switches to a
//! multipart upload once a part's worth of data is buffered.

use crate::models::{ByteRange, ContentDigest, ObjectLocation};
use crate::persistor::{
    Direction, ErrorClass, ObjectStream, Persistor, PersistorError, PersistorResult,
    TransferMetrics,
    integrity::{check_expected, verify_md5},
    meter::{StreamMeter, calculate_stream_md5, metered},
};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use futures::{StreamExt, TryStreamExt, stream};
use object_store::{
    GetOptions, GetRange, ObjectMeta, ObjectStore, buffered::BufWriter, path::Path as StorePath,
    signer::Signer,
};
use std::{
    collections::{HashMap, VecDeque},
    io,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use url::Url;

/// Objects deleted concurrently by `delete_prefix`.
const DELETE_CONCURRENCY: usize = 8;

/// A client bound to one bucket.
#[derive(Clone)]
pub struct BucketClient {
    pub store: Arc<dyn ObjectStore>,
    /// Present when the backend can pre-sign download URLs.
    pub signer: Option<Arc<dyn Signer>>,
}

/// Builds the client for a bucket.
pub trait ClientFactory: Send + Sync {
    fn build(&self, bucket: &str) -> PersistorResult<BucketClient>;
}

/// Bounded per-bucket client cache, evicting the oldest insertion first.
///
/// The lock is only held to look up or insert; client construction happens
/// outside it.
pub struct ClientCache {
    factory: Box<dyn ClientFactory>,
    capacity: usize,
    inner: Mutex<CacheInner>,
}

#[derive(Default)]
struct CacheInner {
    clients: HashMap<String, BucketClient>,
    order: VecDeque<String>,
}

impl ClientCache {
    pub fn new(factory: Box<dyn ClientFactory>, capacity: usize) -> Self {
        Self {
            factory,
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn get(&self, bucket: &str) -> PersistorResult<BucketClient> {
        if let Some(client) = self.lock().clients.get(bucket) {
            return Ok(client.clone());
        }
        let client = self.factory.build(bucket)?;
        let mut inner = self.lock();
        if let Some(existing) = inner.clients.get(bucket) {
            return Ok(existing.clone());
        }
        while inner.order.len() >= self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.clients.remove(&oldest);
        }
        inner.order.push_back(bucket.to_string());
        inner.clients.insert(bucket.to_string(), client.clone());
        Ok(client)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().clients.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug, Clone)]
pub struct CloudOptions {
    /// Backend tag for logs and metrics.
    pub backend: &'static str,
    /// Upload buffer size; larger objects are sent as multipart uploads.
    pub part_size: usize,
    /// When set, deleted objects are first copied to `{bucket}{suffix}`.
    pub deleted_bucket_suffix: Option<String>,
    pub signed_url_expiry: Duration,
    /// When set, redirect URLs are plain `{endpoint}/download/storage/v1/...`
    /// links instead of pre-signed ones.
    pub unsigned_url_endpoint: Option<String>,
}

pub struct CloudPersistor {
    clients: ClientCache,
    options: CloudOptions,
    metrics: TransferMetrics,
}

fn store_path(key: &str) -> StorePath {
    StorePath::from(key)
}

fn is_missing(err: &object_store::Error) -> bool {
    matches!(err, object_store::Error::NotFound { .. })
}

impl CloudPersistor {
    pub fn new(clients: ClientCache, options: CloudOptions, metrics: TransferMetrics) -> Self {
        Self {
            clients,
            options,
            metrics,
        }
    }

    fn client(&self, bucket: &str) -> PersistorResult<BucketClient> {
        self.clients.get(bucket)
    }

    /// Stream into the bucket, returning the digest of the bytes sent.
    async fn upload(
        &self,
        client: &BucketClient,
        location: &ObjectLocation,
        mut stream: ObjectStream,
    ) -> PersistorResult<ContentDigest> {
        let mut writer = BufWriter::with_capacity(
            client.store.clone(),
            store_path(location.key()),
            self.options.part_size,
        );
        let mut meter =
            StreamMeter::new(self.metrics.clone(), self.options.backend, Direction::Egress).hashing();
        let written: io::Result<()> = async {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                meter.observe(&chunk);
                writer.write_all(&chunk).await?;
            }
            writer.shutdown().await
        }
        .await;

        if let Err(err) = written {
            if let Err(abort_err) = writer.abort().await {
                warn!(
                    bucket = location.bucket(),
                    key = location.key(),
                    error = %abort_err,
                    "failed to abort upload"
                );
            }
            return Err(PersistorError::write("upload failed", location).with_source(err));
        }
        Ok(meter.finish())
    }

    /// Digest of the stored object: the ETag when it is an MD5, otherwise
    /// the hash of a fresh download.
    async fn stored_digest(
        &self,
        client: &BucketClient,
        location: &ObjectLocation,
    ) -> PersistorResult<ContentDigest> {
        let meta = self.head(client, location).await?;
        if let Some(digest) = meta.e_tag.as_deref().and_then(ContentDigest::from_etag) {
            return Ok(digest);
        }
        debug!(
            bucket = location.bucket(),
            key = location.key(),
            "etag is not an md5, hashing stored object"
        );
        let stream = self.get_stream(location, None).await?;
        calculate_stream_md5(stream)
            .await
            .map_err(|err| PersistorError::wrap(err, "failed to hash object", location, ErrorClass::Read))
    }

    async fn head(&self, client: &BucketClient, location: &ObjectLocation) -> PersistorResult<ObjectMeta> {
        client
            .store
            .head(&store_path(location.key()))
            .await
            .map_err(|err| PersistorError::wrap(err, "failed to stat object", location, ErrorClass::Read))
    }

    async fn list(
        &self,
        prefix: &ObjectLocation,
        class: ErrorClass,
    ) -> PersistorResult<(BucketClient, Vec<ObjectMeta>)> {
        let client = self.client(prefix.bucket())?;
        let prefix_path = store_path(prefix.key());
        let objects: Vec<ObjectMeta> = client
            .store
            .list(Some(&prefix_path))
            .try_collect()
            .await
            .map_err(|err| {
                let base = match class {
                    ErrorClass::Read => PersistorError::read("failed to list objects", prefix),
                    ErrorClass::Write => PersistorError::write("failed to list objects", prefix),
                };
                base.with_source(err)
            })?;
        Ok((client, objects))
    }

    /// Copy to the deleted-files bucket before a delete.
    async fn archive(&self, location: &ObjectLocation, suffix: &str) -> PersistorResult<()> {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let archived = ObjectLocation::new(
            format!("{}{}", location.bucket(), suffix),
            format!("{}-{}", location.key(), timestamp),
        );
        let stream = self.get_stream(location, None).await?;
        self.send(&archived, stream, None).await
    }

    fn unsigned_url(&self, endpoint: &str, location: &ObjectLocation) -> PersistorResult<String> {
        let mut url = Url::parse(endpoint).map_err(|err| {
            PersistorError::settings(format!("invalid api endpoint `{endpoint}`")).with_source(err)
        })?;
        url.path_segments_mut()
            .map_err(|()| PersistorError::settings(format!("invalid api endpoint `{endpoint}`")))?
            .pop_if_empty()
            .extend(["download", "storage", "v1", "b", location.bucket(), "o", location.key()]);
        url.set_query(Some("alt=media"));
        Ok(url.to_string())
    }
}

#[async_trait]
impl Persistor for CloudPersistor {
    fn backend(&self) -> &'static str {
        self.options.backend
    }

    async fn send(
        &self,
        location: &ObjectLocation,
        stream: ObjectStream,
        expected: Option<ContentDigest>,
    ) -> PersistorResult<()> {
        let client = self.client(location.bucket())?;
        let source = self.upload(&client, location, stream).await?;

        if let Err(err) = check_expected(location, expected.as_ref(), &source) {
            if let Err(delete_err) = self.delete(location).await {
                warn!(
                    bucket = location.bucket(),
                    key = location.key(),
                    error = %delete_err,
                    "failed to delete object after source md5 mismatch"
                );
            }
            return Err(err);
        }

        let dest = self.stored_digest(&client, location).await.map_err(|err| {
            PersistorError::write("failed to verify upload", location).with_source(err)
        })?;
        verify_md5(self, location, &source, &dest).await
    }

    async fn get_stream(
        &self,
        location: &ObjectLocation,
        range: Option<ByteRange>,
    ) -> PersistorResult<ObjectStream> {
        let client = self.client(location.bucket())?;
        let options = GetOptions {
            range: range.map(|range| GetRange::Bounded(range.to_exclusive())),
            ..Default::default()
        };
        let result = client
            .store
            .get_opts(&store_path(location.key()), options)
            .await
            .map_err(|err| PersistorError::wrap(err, "failed to read object", location, ErrorClass::Read))?;
        let stream = result.into_stream().map_err(io::Error::other).boxed();
        let meter = StreamMeter::new(self.metrics.clone(), self.options.backend, Direction::Ingress);
        Ok(metered(stream, meter))
    }

    async fn get_redirect_url(&self, location: &ObjectLocation) -> PersistorResult<Option<String>> {
        if let Some(endpoint) = &self.options.unsigned_url_endpoint {
            return self.unsigned_url(endpoint, location).map(Some);
        }
        let client = self.client(location.bucket())?;
        let Some(signer) = client.signer else {
            return Ok(None);
        };
        let url = signer
            .signed_url(
                http::Method::GET,
                &store_path(location.key()),
                self.options.signed_url_expiry,
            )
            .await
            .map_err(|err| PersistorError::wrap(err, "failed to sign url", location, ErrorClass::Read))?;
        Ok(Some(url.to_string()))
    }

    async fn get_size(&self, location: &ObjectLocation) -> PersistorResult<u64> {
        let client = self.client(location.bucket())?;
        Ok(self.head(&client, location).await?.size)
    }

    async fn get_digest(&self, location: &ObjectLocation) -> PersistorResult<ContentDigest> {
        let client = self.client(location.bucket())?;
        let meta = self.head(&client, location).await?;
        meta.e_tag
            .as_deref()
            .and_then(ContentDigest::from_etag)
            .ok_or_else(|| PersistorError::read("object etag is not an md5 hash", location))
    }

    async fn delete(&self, location: &ObjectLocation) -> PersistorResult<()> {
        if let Some(suffix) = &self.options.deleted_bucket_suffix {
            match self.archive(location, suffix).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => return Ok(()),
                Err(err) => {
                    return Err(PersistorError::write("failed to archive deleted object", location)
                        .with_source(err));
                }
            }
        }
        let client = self.client(location.bucket())?;
        match client.store.delete(&store_path(location.key())).await {
            Ok(()) => Ok(()),
            Err(err) if is_missing(&err) => Ok(()),
            Err(err) => Err(PersistorError::write("failed to delete object", location).with_source(err)),
        }
    }

    async fn delete_prefix(&self, prefix: &ObjectLocation) -> PersistorResult<()> {
        let (client, objects) = self.list(prefix, ErrorClass::Write).await?;
        debug!(
            bucket = prefix.bucket(),
            prefix = prefix.key(),
            count = objects.len(),
            "deleting objects under prefix"
        );
        stream::iter(objects)
            .map(|meta| {
                let store = client.store.clone();
                async move {
                    match store.delete(&meta.location).await {
                        Err(err) if is_missing(&err) => Ok(()),
                        other => other,
                    }
                }
            })
            .buffer_unordered(DELETE_CONCURRENCY)
            .try_collect::<Vec<()>>()
            .await
            .map_err(|err| PersistorError::write("failed to delete objects", prefix).with_source(err))?;
        Ok(())
    }

    async fn copy(&self, source: &ObjectLocation, dest: &ObjectLocation) -> PersistorResult<()> {
        if source.bucket() != dest.bucket() {
            let stream = self.get_stream(source, None).await?;
            return self.send(dest, stream, None).await;
        }
        let client = self.client(source.bucket())?;
        client
            .store
            .copy(&store_path(source.key()), &store_path(dest.key()))
            .await
            .map_err(|err| PersistorError::wrap(err, "failed to copy object", source, ErrorClass::Write))
    }

    async fn exists(&self, location: &ObjectLocation) -> PersistorResult<bool> {
        let client = self.client(location.bucket())?;
        match self.head(&client, location).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn prefix_size(&self, prefix: &ObjectLocation) -> PersistorResult<u64> {
        let (_, objects) = self.list(prefix, ErrorClass::Read).await?;
        Ok(objects.iter().map(|meta| meta.size).sum())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::digest::EMPTY_MD5;
    use bytes::Bytes;
    use object_store::{
        GetResult, ListResult, MultipartUpload, PutMultipartOptions, PutOptions, PutPayload,
        PutResult, UploadPart, memory::InMemory,
    };
    use std::{
        fmt,
        sync::atomic::{AtomicUsize, Ordering},
    };

    /// One shared in-memory store per bucket name.
    #[derive(Default)]
    pub(crate) struct MemoryFactory {
        stores: Mutex<HashMap<String, Arc<InMemory>>>,
        pub(crate) builds: AtomicUsize,
    }

    impl MemoryFactory {
        pub(crate) fn store(&self, bucket: &str) -> Arc<InMemory> {
            self.stores
                .lock()
                .unwrap()
                .entry(bucket.to_string())
                .or_insert_with(|| Arc::new(InMemory::new()))
                .clone()
        }
    }

    impl ClientFactory for Arc<MemoryFactory> {
        fn build(&self, bucket: &str) -> PersistorResult<BucketClient> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            Ok(BucketClient {
                store: self.store(bucket),
                signer: None,
            })
        }
    }

    /// Drops the last byte of every payload and multipart part it stores.
    #[derive(Debug, Default)]
    struct TruncatingStore {
        inner: InMemory,
    }

    fn truncated(payload: PutPayload) -> PutPayload {
        let bytes = Bytes::from(payload);
        let keep = bytes.len().saturating_sub(1);
        bytes.slice(..keep).into()
    }

    impl fmt::Display for TruncatingStore {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "TruncatingStore({})", self.inner)
        }
    }

    #[derive(Debug)]
    struct TruncatingUpload(Box<dyn MultipartUpload>);

    #[async_trait]
    impl MultipartUpload for TruncatingUpload {
        fn put_part(&mut self, data: PutPayload) -> UploadPart {
            self.0.put_part(truncated(data))
        }

        async fn complete(&mut self) -> object_store::Result<PutResult> {
            self.0.complete().await
        }

        async fn abort(&mut self) -> object_store::Result<()> {
            self.0.abort().await
        }
    }

    #[async_trait]
    impl ObjectStore for TruncatingStore {
        async fn put_opts(
            &self,
            location: &StorePath,
            payload: PutPayload,
            opts: PutOptions,
        ) -> object_store::Result<PutResult> {
            self.inner.put_opts(location, truncated(payload), opts).await
        }

        async fn put_multipart_opts(
            &self,
            location: &StorePath,
            opts: PutMultipartOptions,
        ) -> object_store::Result<Box<dyn MultipartUpload>> {
            let upload = self.inner.put_multipart_opts(location, opts).await?;
            Ok(Box::new(TruncatingUpload(upload)))
        }

        async fn get_opts(&self, location: &StorePath, options: GetOptions) -> object_store::Result<GetResult> {
            self.inner.get_opts(location, options).await
        }

        async fn delete(&self, location: &StorePath) -> object_store::Result<()> {
            self.inner.delete(location).await
        }

        fn list(&self, prefix: Option<&StorePath>) -> futures::stream::BoxStream<'static, object_store::Result<ObjectMeta>> {
            self.inner.list(prefix)
        }

        async fn list_with_delimiter(&self, prefix: Option<&StorePath>) -> object_store::Result<ListResult> {
            self.inner.list_with_delimiter(prefix).await
        }

        async fn copy(&self, from: &StorePath, to: &StorePath) -> object_store::Result<()> {
            self.inner.copy(from, to).await
        }

        async fn copy_if_not_exists(&self, from: &StorePath, to: &StorePath) -> object_store::Result<()> {
            self.inner.copy_if_not_exists(from, to).await
        }
    }

    struct TruncatingFactory(Arc<TruncatingStore>);

    impl ClientFactory for TruncatingFactory {
        fn build(&self, _bucket: &str) -> PersistorResult<BucketClient> {
            Ok(BucketClient {
                store: self.0.clone(),
                signer: None,
            })
        }
    }

    fn corrupting_persistor(part_size: usize) -> (CloudPersistor, Arc<TruncatingStore>) {
        let store = Arc::new(TruncatingStore::default());
        let cache = ClientCache::new(Box::new(TruncatingFactory(store.clone())), 64);
        let mut options = options();
        options.part_size = part_size;
        (CloudPersistor::new(cache, options, TransferMetrics::new()), store)
    }

    pub(crate) fn options() -> CloudOptions {
        CloudOptions {
            backend: "s3",
            part_size: 5 * 1024 * 1024,
            deleted_bucket_suffix: None,
            signed_url_expiry: Duration::from_secs(900),
            unsigned_url_endpoint: None,
        }
    }

    fn persistor_with(options: CloudOptions) -> (CloudPersistor, Arc<MemoryFactory>, TransferMetrics) {
        let factory = Arc::new(MemoryFactory::default());
        let metrics = TransferMetrics::new();
        let cache = ClientCache::new(Box::new(factory.clone()), 64);
        (CloudPersistor::new(cache, options, metrics.clone()), factory, metrics)
    }

    fn persistor() -> (CloudPersistor, Arc<MemoryFactory>, TransferMetrics) {
        persistor_with(options())
    }

    fn body(data: &'static [u8]) -> ObjectStream {
        stream::iter(vec![Ok(Bytes::from_static(data))]).boxed()
    }

    async fn collect(stream: ObjectStream) -> Vec<u8> {
        let chunks: Vec<io::Result<Bytes>> = stream.collect().await;
        chunks
            .into_iter()
            .flat_map(|chunk| chunk.unwrap().to_vec())
            .collect()
    }

    #[tokio::test]
    async fn send_and_read_back() {
        let (persistor, _, metrics) = persistor();
        let location = ObjectLocation::new("bucket", "proj1/file1");
        persistor.send(&location, body(b"hello world"), None).await.unwrap();

        assert!(persistor.exists(&location).await.unwrap());
        assert_eq!(persistor.get_size(&location).await.unwrap(), 11);
        let stream = persistor.get_stream(&location, None).await.unwrap();
        assert_eq!(collect(stream).await, b"hello world");
        assert_eq!(metrics.total("s3", Direction::Egress), 11);
    }

    #[tokio::test]
    async fn range_end_is_inclusive() {
        let (persistor, _, _) = persistor();
        let location = ObjectLocation::new("bucket", "proj1/file1");
        persistor.send(&location, body(b"0123456789"), None).await.unwrap();
        let stream = persistor
            .get_stream(&location, ByteRange::new(3, 6))
            .await
            .unwrap();
        assert_eq!(collect(stream).await, b"3456");
    }

    #[tokio::test]
    async fn zero_byte_upload() {
        let (persistor, _, _) = persistor();
        let location = ObjectLocation::new("bucket", "proj1/empty");
        persistor
            .send(&location, stream::empty().boxed(), Some(ContentDigest::from_hex(EMPTY_MD5).unwrap()))
            .await
            .unwrap();
        assert_eq!(persistor.get_size(&location).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn expected_digest_mismatch_removes_object() {
        let (persistor, _, _) = persistor();
        let location = ObjectLocation::new("bucket", "proj1/file1");
        let err = persistor
            .send(&location, body(b"data"), Some(ContentDigest::of(b"other")))
            .await
            .unwrap_err();
        assert!(matches!(err, PersistorError::Write { .. }));
        assert!(!persistor.exists(&location).await.unwrap());
    }

    #[tokio::test]
    async fn aborted_stream_is_a_write_error() {
        let (persistor, _, _) = persistor();
        let location = ObjectLocation::new("bucket", "proj1/file1");
        let chunks: Vec<io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "client went away")),
        ];
        let err = persistor
            .send(&location, stream::iter(chunks).boxed(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PersistorError::Write { .. }));
        assert!(!persistor.exists(&location).await.unwrap());
    }

    #[tokio::test]
    async fn non_md5_etag_is_rejected_by_get_digest() {
        let (persistor, _, _) = persistor();
        let location = ObjectLocation::new("bucket", "proj1/file1");
        persistor.send(&location, body(b"abc"), None).await.unwrap();
        // in-memory etags are counters, not md5 hashes
        assert!(matches!(
            persistor.get_digest(&location).await,
            Err(PersistorError::Read { .. })
        ));
    }

    #[tokio::test]
    async fn missing_objects_are_not_found() {
        let (persistor, _, _) = persistor();
        let location = ObjectLocation::new("bucket", "nope");
        assert!(persistor.get_stream(&location, None).await.err().unwrap().is_not_found());
        assert!(persistor.get_size(&location).await.unwrap_err().is_not_found());
        assert!(!persistor.exists(&location).await.unwrap());
        let dest = ObjectLocation::new("bucket", "dest");
        assert!(persistor.copy(&location, &dest).await.unwrap_err().is_not_found());
        persistor.delete(&location).await.unwrap();
    }

    #[tokio::test]
    async fn prefix_operations_match_whole_segments() {
        let (persistor, _, _) = persistor();
        let files: [(&str, &'static [u8]); 3] = [
            ("proj1/a", &[1u8; 10]),
            ("proj1/sub/b", &[2u8; 50]),
            ("proj1x/other", &[3u8; 100]),
        ];
        for (key, data) in files {
            persistor
                .send(&ObjectLocation::new("bucket", key), body(data), None)
                .await
                .unwrap();
        }
        let prefix = ObjectLocation::new("bucket", "proj1/");
        assert_eq!(persistor.prefix_size(&prefix).await.unwrap(), 60);

        persistor.delete_prefix(&prefix).await.unwrap();
        assert_eq!(persistor.prefix_size(&prefix).await.unwrap(), 0);
        let sibling = ObjectLocation::new("bucket", "proj1x/other");
        assert!(persistor.exists(&sibling).await.unwrap());
        persistor.delete_prefix(&prefix).await.unwrap();
    }

    #[tokio::test]
    async fn copies_within_and_across_buckets() {
        let (persistor, _, _) = persistor();
        let source = ObjectLocation::new("bucket", "proj1/file1");
        persistor.send(&source, body(b"payload"), None).await.unwrap();

        let same_bucket = source.with_key("proj2/file1");
        persistor.copy(&source, &same_bucket).await.unwrap();
        let other_bucket = source.in_bucket("templates");
        persistor.copy(&source, &other_bucket).await.unwrap();

        for dest in [same_bucket, other_bucket] {
            let stream = persistor.get_stream(&dest, None).await.unwrap();
            assert_eq!(collect(stream).await, b"payload");
        }
    }

    #[tokio::test]
    async fn deletes_archive_to_suffixed_bucket() {
        let mut options = options();
        options.deleted_bucket_suffix = Some("-deleted".into());
        let (persistor, factory, _) = persistor_with(options);
        let location = ObjectLocation::new("bucket", "proj1/file1");
        persistor.send(&location, body(b"keep me"), None).await.unwrap();
        persistor.delete(&location).await.unwrap();

        assert!(!persistor.exists(&location).await.unwrap());
        let archived: Vec<ObjectMeta> = factory
            .store("bucket-deleted")
            .list(None)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(archived.len(), 1);
        assert!(archived[0].location.as_ref().starts_with("proj1/file1-"));
        // a second delete of the now-missing object is still fine
        persistor.delete(&location).await.unwrap();
    }

    #[tokio::test]
    async fn unsigned_redirect_urls() {
        let mut options = options();
        options.backend = "gcs";
        options.unsigned_url_endpoint = Some("http://custom.endpoint".into());
        let (persistor, _, _) = persistor_with(options);
        let url = persistor
            .get_redirect_url(&ObjectLocation::new("womBucket", "monKey"))
            .await
            .unwrap();
        assert_eq!(
            url.as_deref(),
            Some("http://custom.endpoint/download/storage/v1/b/womBucket/o/monKey?alt=media")
        );
    }

    #[tokio::test]
    async fn no_redirect_without_signer() {
        let (persistor, _, _) = persistor();
        let url = persistor
            .get_redirect_url(&ObjectLocation::new("bucket", "key"))
            .await
            .unwrap();
        assert!(url.is_none());
    }

    #[test]
    fn client_cache_is_bounded() {
        let factory = Arc::new(MemoryFactory::default());
        let cache = ClientCache::new(Box::new(factory.clone()), 2);
        cache.get("a").unwrap();
        cache.get("b").unwrap();
        cache.get("a").unwrap();
        assert_eq!(factory.builds.load(Ordering::SeqCst), 2);

        cache.get("c").unwrap();
        assert_eq!(cache.len(), 2);
        // "a" was inserted first, so it was evicted
        cache.get("a").unwrap();
        assert_eq!(factory.builds.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn corrupted_upload_is_rejected_and_removed() {
        let (persistor, store) = corrupting_persistor(5 * 1024 * 1024);
        let location = ObjectLocation::new("bucket", "proj1/file1");
        let err = persistor
            .send(&location, body(b"hello world"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PersistorError::Write { .. }));
        assert!(err.to_string().contains("md5 hash mismatch"));
        assert!(!persistor.exists(&location).await.unwrap());
        let left: Vec<ObjectMeta> = store.list(None).try_collect().await.unwrap();
        assert!(left.is_empty());
    }

    #[tokio::test]
    async fn corrupted_multipart_upload_is_rejected_and_removed() {
        let (persistor, _) = corrupting_persistor(16);
        let location = ObjectLocation::new("bucket", "proj1/large");
        let err = persistor
            .send(&location, body(&[7u8; 100]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PersistorError::Write { .. }));
        assert!(!persistor.exists(&location).await.unwrap());
    }
}
