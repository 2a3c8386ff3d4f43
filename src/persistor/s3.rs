//! S3 (and S3-compatible) client construction.

use crate::persistor::{
    DEFAULT_CLIENT_CACHE_CAPACITY, PersistorError, PersistorResult, TransferMetrics,
    cloud::{BucketClient, ClientCache, ClientFactory, CloudOptions, CloudPersistor},
};
use object_store::aws::AmazonS3Builder;
use serde::Deserialize;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tracing::debug;

pub const DEFAULT_PART_SIZE: usize = 100 * 1024 * 1024;
pub const DEFAULT_SIGNED_URL_EXPIRY: Duration = Duration::from_secs(60);

/// Credentials used for one specific bucket instead of the default pair.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct BucketCredentials {
    pub auth_key: String,
    pub auth_secret: String,
}

#[derive(Debug, Clone)]
pub struct S3Settings {
    pub key: Option<String>,
    pub secret: Option<String>,
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub bucket_credentials: HashMap<String, BucketCredentials>,
    pub part_size: usize,
    pub signed_url_expiry: Duration,
}

impl Default for S3Settings {
    fn default() -> Self {
        Self {
            key: None,
            secret: None,
            endpoint: None,
            region: None,
            bucket_credentials: HashMap::new(),
            part_size: DEFAULT_PART_SIZE,
            signed_url_expiry: DEFAULT_SIGNED_URL_EXPIRY,
        }
    }
}

pub struct S3ClientFactory {
    settings: S3Settings,
}

impl S3ClientFactory {
    pub fn new(settings: S3Settings) -> Self {
        Self { settings }
    }

    /// Builder for `bucket`: bucket-specific credentials win over the
    /// default pair, which wins over the ambient AWS environment.
    fn builder(&self, bucket: &str) -> AmazonS3Builder {
        let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
        if let Some(credentials) = self.settings.bucket_credentials.get(bucket) {
            builder = builder
                .with_access_key_id(&credentials.auth_key)
                .with_secret_access_key(&credentials.auth_secret);
        } else if let (Some(key), Some(secret)) = (&self.settings.key, &self.settings.secret) {
            builder = builder
                .with_access_key_id(key)
                .with_secret_access_key(secret);
        }
        if let Some(endpoint) = &self.settings.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }
        if let Some(region) = &self.settings.region {
            builder = builder.with_region(region);
        }
        builder
    }
}

impl ClientFactory for S3ClientFactory {
    fn build(&self, bucket: &str) -> PersistorResult<BucketClient> {
        let s3 = self.builder(bucket).build().map_err(|err| {
            PersistorError::settings(format!("invalid s3 configuration for bucket `{bucket}`"))
                .with_source(err)
        })?;
        debug!(bucket, "created s3 client");
        let s3 = Arc::new(s3);
        Ok(BucketClient {
            store: s3.clone(),
            signer: Some(s3),
        })
    }
}

pub fn s3_persistor(
    settings: &S3Settings,
    cache_capacity: usize,
    metrics: TransferMetrics,
) -> PersistorResult<CloudPersistor> {
    if settings.key.is_some() != settings.secret.is_some() {
        return Err(PersistorError::settings(
            "s3 access key and secret must be configured together",
        ));
    }
    let capacity = if cache_capacity == 0 {
        DEFAULT_CLIENT_CACHE_CAPACITY
    } else {
        cache_capacity
    };
    let options = CloudOptions {
        backend: "s3",
        part_size: settings.part_size,
        deleted_bucket_suffix: None,
        signed_url_expiry: settings.signed_url_expiry,
        unsigned_url_endpoint: None,
    };
    let cache = ClientCache::new(Box::new(S3ClientFactory::new(settings.clone())), capacity);
    Ok(CloudPersistor::new(cache, options, metrics))
}
