use super::{ObjectStore, ObjectStoreError};
use async_trait::async_trait;
use bytes::Bytes;
use object_store::aws::{AmazonS3, AmazonS3Builder};
use serde::Deserialize;

#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint for S3 compatible stores. Credentials are always read from the usual AWS_* env vars.
    pub endpoint: Option<String>,
}

#[derive(Debug)]
pub struct Engine(AmazonS3);

impl Engine {
    pub fn new(config: &Config) -> Result<Self, ObjectStoreError> {
        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(&config.bucket)
            .with_region(&config.region);

        if let Some(endpoint) = &config.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }

        let store = builder
            .build()
            .map_err(|e| ObjectStoreError::FailedPrecondition(e.to_string()))?;

        Ok(Engine(store))
    }
}

#[async_trait]
impl ObjectStore for Engine {
    async fn get(&self, key: &str) -> Result<Bytes, ObjectStoreError> {
        super::get_object(&self.0, key).await
    }

    async fn put(&self, key: &str, content: Bytes, force: bool) -> Result<(), ObjectStoreError> {
        super::put_object(&self.0, key, content, force).await
    }
}
