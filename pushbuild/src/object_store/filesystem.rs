use super::{ObjectStore, ObjectStoreError};
use async_trait::async_trait;
use bytes::Bytes;
use object_store::local::LocalFileSystem;
use serde::Deserialize;

#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// The path of the directory that should contain the object files.
    pub path: String,
}

#[derive(Debug)]
pub struct Engine(LocalFileSystem);

impl Engine {
    pub async fn new(config: &Config) -> Result<Self, ObjectStoreError> {
        tokio::fs::create_dir_all(&config.path).await.map_err(|e| {
            ObjectStoreError::FailedPrecondition(format!(
                "could not create object store directory '{}'; {e}",
                config.path
            ))
        })?;

        let store = LocalFileSystem::new_with_prefix(&config.path)
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
