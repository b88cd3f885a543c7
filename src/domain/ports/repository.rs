use async_trait::async_trait;

use super::errors::RepositoryError;

/// Read/write access to the source repository being changed.
///
/// Only the execution and validation stages, and the final artifact write,
/// go through this port.
#[async_trait]
pub trait RepositoryAccessor: Send + Sync {
    async fn read(&self, path: &str) -> Result<String, RepositoryError>;

    async fn write(&self, path: &str, content: &str) -> Result<(), RepositoryError>;

    /// Read a file, mapping `NotFound` to `None`.
    async fn read_optional(&self, path: &str) -> Result<Option<String>, RepositoryError> {
        match self.read(path).await {
            Ok(content) => Ok(Some(content)),
            Err(RepositoryError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
