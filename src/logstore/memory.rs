use super::{LogStore, LogStoreError};
use async_trait::async_trait;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};

/// Log store held entirely in memory. Dev mode and tests only; logs do not
/// survive a restart.
#[derive(Debug, Default)]
pub struct Store {
    inner: InMemory,
}

impl Store {
    pub fn new() -> Self {
        Store::default()
    }
}

fn map_error(err: object_store::Error) -> LogStoreError {
    match err {
        object_store::Error::NotFound { .. } => LogStoreError::NotFound,
        other => LogStoreError::Unknown(other.to_string()),
    }
}

#[async_trait]
impl LogStore for Store {
    async fn put(&self, key: &str, content: Vec<u8>) -> Result<(), LogStoreError> {
        self.inner
            .put(&Path::from(key), PutPayload::from(content))
            .await
            .map_err(map_error)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, LogStoreError> {
        let result = self.inner.get(&Path::from(key)).await.map_err(map_error)?;
        let bytes = result.bytes().await.map_err(map_error)?;
        Ok(bytes.to_vec())
    }

    async fn delete(&self, key: &str) -> Result<(), LogStoreError> {
        self.inner.delete(&Path::from(key)).await.map_err(map_error)
    }
}
