//! Google Cloud Storage client construction.

use crate::persistor::{
    DEFAULT_CLIENT_CACHE_CAPACITY, PersistorError, PersistorResult, TransferMetrics,
    cloud::{BucketClient, ClientCache, ClientFactory, CloudOptions, CloudPersistor},
    s3::{DEFAULT_PART_SIZE, DEFAULT_SIGNED_URL_EXPIRY},
};
use object_store::gcp::GoogleCloudStorageBuilder;
use std::{sync::Arc, time::Duration};
use tracing::debug;

pub const DEFAULT_API_ENDPOINT: &str = "https://storage.googleapis.com";

#[derive(Debug, Clone)]
pub struct GcsSettings {
    pub service_account_path: Option<String>,
    /// Deleted objects are archived to `{bucket}{suffix}` first.
    pub deleted_bucket_suffix: Option<String>,
    /// Hand out plain download links instead of signed ones.
    pub unsigned_urls: bool,
    pub endpoint: Option<String>,
    pub signed_url_expiry: Duration,
}

impl Default for GcsSettings {
    fn default() -> Self {
        Self {
            service_account_path: None,
            deleted_bucket_suffix: None,
            unsigned_urls: false,
            endpoint: None,
            signed_url_expiry: DEFAULT_SIGNED_URL_EXPIRY,
        }
    }
}

pub struct GcsClientFactory {
    service_account_path: Option<String>,
}

impl ClientFactory for GcsClientFactory {
    fn build(&self, bucket: &str) -> PersistorResult<BucketClient> {
        let mut builder = GoogleCloudStorageBuilder::from_env().with_bucket_name(bucket);
        if let Some(path) = &self.service_account_path {
            builder = builder.with_service_account_path(path);
        }
        let gcs = builder.build().map_err(|err| {
            PersistorError::settings(format!("invalid gcs configuration for bucket `{bucket}`"))
                .with_source(err)
        })?;
        debug!(bucket, "created gcs client");
        let gcs = Arc::new(gcs);
        Ok(BucketClient {
            store: gcs.clone(),
            signer: Some(gcs),
        })
    }
}

pub fn gcs_persistor(
    settings: &GcsSettings,
    cache_capacity: usize,
    metrics: TransferMetrics,
) -> PersistorResult<CloudPersistor> {
    let unsigned_url_endpoint = settings.unsigned_urls.then(|| {
        settings
            .endpoint
            .clone()
            .unwrap_or_else(|| DEFAULT_API_ENDPOINT.to_string())
    });
    let deleted_bucket_suffix = settings
        .deleted_bucket_suffix
        .clone()
        .filter(|suffix| !suffix.is_empty());
    let options = CloudOptions {
        backend: "gcs",
        part_size: DEFAULT_PART_SIZE,
        deleted_bucket_suffix,
        signed_url_expiry: settings.signed_url_expiry,
        unsigned_url_endpoint,
    };
    let capacity = if cache_capacity == 0 {
        DEFAULT_CLIENT_CACHE_CAPACITY
    } else {
        cache_capacity
    };
    let factory = GcsClientFactory {
        service_account_path: settings.service_account_path.clone(),
    };
    Ok(CloudPersistor::new(
        ClientCache::new(Box::new(factory), capacity),
        options,
        metrics,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ObjectLocation;
    use crate::persistor::Persistor;

    #[tokio::test]
    async fn unsigned_urls_use_default_endpoint() {
        let settings = GcsSettings {
            unsigned_urls: true,
            ..Default::default()
        };
        let persistor = gcs_persistor(&settings, 0, TransferMetrics::new()).unwrap();
        let url = persistor
            .get_redirect_url(&ObjectLocation::new("user-files", "proj1/file1"))
            .await
            .unwrap();
        assert_eq!(
            url.as_deref(),
            Some(
                "https://storage.googleapis.com/download/storage/v1/b/user-files/o/proj1%2Ffile1?alt=media"
            )
        );
    }
}
