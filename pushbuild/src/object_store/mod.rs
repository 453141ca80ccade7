pub mod filesystem;
pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::fmt::Debug;
use std::sync::Arc;
use strum::{Display, EnumString};

/// Represents different object store failure possibilities.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ObjectStoreError {
    #[error("requested entity not found")]
    NotFound,

    #[error("entity already exists")]
    Exists,

    #[error("unexpected storage error occurred; {0}")]
    Internal(String),

    /// Failed to start due to misconfigured settings, usually from a misconfigured settings file.
    #[error("could not init object store; {0}")]
    FailedPrecondition(String),
}

impl From<::object_store::Error> for ObjectStoreError {
    fn from(err: ::object_store::Error) -> Self {
        match err {
            ::object_store::Error::NotFound { .. } => ObjectStoreError::NotFound,
            ::object_store::Error::AlreadyExists { .. } => ObjectStoreError::Exists,
            e => ObjectStoreError::Internal(e.to_string()),
        }
    }
}

/// The object store is where pushed source tarballs and finished slugs live.
///
/// Build jobs reach the same objects over http through the URLs produced by `gitreceive::storage`.
#[async_trait]
pub trait ObjectStore: Debug + Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Bytes, ObjectStoreError>;
    /// Write an object. Without `force` an existing object at `key` results in `ObjectStoreError::Exists`.
    async fn put(&self, key: &str, content: Bytes, force: bool) -> Result<(), ObjectStoreError>;
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")] // This handles case insensitivity during deserialization
pub enum Engine {
    #[default]
    Filesystem,
    S3,
}

pub async fn new(
    config: &crate::conf::ObjectStore,
) -> Result<Arc<dyn ObjectStore>, ObjectStoreError> {
    match config.engine {
        Engine::Filesystem => {
            let Some(engine_config) = &config.filesystem else {
                return Err(ObjectStoreError::FailedPrecondition(
                    "filesystem engine settings not found in config".into(),
                ));
            };

            let engine = filesystem::Engine::new(engine_config).await?;
            Ok(Arc::new(engine))
        }
        Engine::S3 => {
            let Some(engine_config) = &config.s3 else {
                return Err(ObjectStoreError::FailedPrecondition(
                    "s3 engine settings not found in config".into(),
                ));
            };

            let engine = s3::Engine::new(engine_config)?;
            Ok(Arc::new(engine))
        }
    }
}

/// Shared implementation for every engine backed by the `object_store` crate.
pub(crate) async fn put_object(
    store: &dyn ::object_store::ObjectStore,
    key: &str,
    content: Bytes,
    force: bool,
) -> Result<(), ObjectStoreError> {
    let path = ::object_store::path::Path::from(key);

    // We've found an object, but the caller did not pass force, return an error.
    if !force && store.head(&path).await.is_ok() {
        return Err(ObjectStoreError::Exists);
    }

    store
        .put(&path, ::object_store::PutPayload::from_bytes(content))
        .await
        .map_err(ObjectStoreError::from)?;

    Ok(())
}

pub(crate) async fn get_object(
    store: &dyn ::object_store::ObjectStore,
    key: &str,
) -> Result<Bytes, ObjectStoreError> {
    let path = ::object_store::path::Path::from(key);

    let result = store.get(&path).await.map_err(ObjectStoreError::from)?;
    let object = result.bytes().await.map_err(ObjectStoreError::from)?;

    Ok(object)
}
