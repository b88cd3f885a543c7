//! Repository accessors: a filesystem tree and an in-memory map.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::ports::{RepositoryAccessor, RepositoryError};

/// Files under a root directory. Paths are relative to the root and may not
/// leave it.
#[derive(Debug, Clone)]
pub struct FsRepository {
    root: PathBuf,
}

impl FsRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, RepositoryError> {
        let relative = Path::new(path);
        let escapes = relative.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if escapes || path.trim().is_empty() {
            return Err(RepositoryError::OutsideRoot(path.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

fn io_error(path: &str, err: &std::io::Error) -> RepositoryError {
    if err.kind() == std::io::ErrorKind::NotFound {
        RepositoryError::NotFound(path.to_string())
    } else {
        RepositoryError::Io {
            path: path.to_string(),
            message: err.to_string(),
        }
    }
}

#[async_trait]
impl RepositoryAccessor for FsRepository {
    async fn read(&self, path: &str) -> Result<String, RepositoryError> {
        let full = self.resolve(path)?;
        tokio::fs::read_to_string(&full)
            .await
            .map_err(|e| io_error(path, &e))
    }

    async fn write(&self, path: &str, content: &str) -> Result<(), RepositoryError> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(path, &e))?;
        }
        tokio::fs::write(&full, content)
            .await
            .map_err(|e| io_error(path, &e))?;
        tracing::debug!(path, bytes = content.len(), "wrote file");
        Ok(())
    }
}

/// In-memory repository for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    files: RwLock<HashMap<String, String>>,
    writes: RwLock<Vec<String>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_files<I, P, C>(files: I) -> Self
    where
        I: IntoIterator<Item = (P, C)>,
        P: Into<String>,
        C: Into<String>,
    {
        Self {
            files: RwLock::new(
                files
                    .into_iter()
                    .map(|(p, c)| (p.into(), c.into()))
                    .collect(),
            ),
            writes: RwLock::new(Vec::new()),
        }
    }

    pub async fn get(&self, path: &str) -> Option<String> {
        self.files.read().await.get(path).cloned()
    }

    /// Paths written through the accessor, in write order.
    pub async fn written(&self) -> Vec<String> {
        self.writes.read().await.clone()
    }
}

#[async_trait]
impl RepositoryAccessor for MemoryRepository {
    async fn read(&self, path: &str) -> Result<String, RepositoryError> {
        self.files
            .read()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(path.to_string()))
    }

    async fn write(&self, path: &str, content: &str) -> Result<(), RepositoryError> {
        self.files
            .write()
            .await
            .insert(path.to_string(), content.to_string());
        self.writes.write().await.push(path.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_fs_round_trip_creates_directories() {
        let dir = TempDir::new().unwrap();
        let repo = FsRepository::new(dir.path());

        repo.write("src/nested/mod.rs", "pub fn a() {}\n").await.unwrap();
        assert_eq!(repo.read("src/nested/mod.rs").await.unwrap(), "pub fn a() {}\n");
        assert!(dir.path().join("src/nested/mod.rs").exists());
    }

    #[tokio::test]
    async fn test_fs_missing_file() {
        let dir = TempDir::new().unwrap();
        let repo = FsRepository::new(dir.path());
        assert!(matches!(repo.read("nope.rs").await, Err(RepositoryError::NotFound(_))));
        assert_eq!(repo.read_optional("nope.rs").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_fs_rejects_escaping_paths() {
        let dir = TempDir::new().unwrap();
        let repo = FsRepository::new(dir.path());
        assert!(matches!(repo.read("../etc/passwd").await, Err(RepositoryError::OutsideRoot(_))));
        assert!(matches!(repo.write("/tmp/x", "").await, Err(RepositoryError::OutsideRoot(_))));
    }

    #[tokio::test]
    async fn test_memory_records_writes() {
        let repo = MemoryRepository::with_files([("a.rs", "old")]);
        repo.write("a.rs", "new").await.unwrap();
        assert_eq!(repo.get("a.rs").await.as_deref(), Some("new"));
        assert_eq!(repo.written().await, vec!["a.rs"]);
    }
}
